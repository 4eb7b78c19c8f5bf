//! Task contract and its declarations
//!
//! A task type is a marker type implementing [`Task`]. It never holds data
//! itself; constants, variables and runtime fields live in its [`TaskCtx`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use operant_core::{ComponentKind, Event, OperantResult, StateId};

use crate::TaskCtx;

/// An experiment paradigm, pluggable per chamber
pub trait Task: Sized + Send + 'static {
    /// Protocol constants. Overridable once at load time.
    type Constants: Serialize + DeserializeOwned + Default + Send;

    /// Per-run variables, reset to defaults on every start
    type Variables: Default + Send;

    /// Hardware the task needs, with the capability each slot must provide
    fn components() -> ComponentSpec;

    /// State handlers, built once per task construction
    fn states() -> StateTable<Self>;

    /// Entry state, chosen when the task starts
    fn init_state(ctx: &mut TaskCtx<Self>) -> StateId;

    /// Consulted after every dispatched event
    fn is_complete(_ctx: &TaskCtx<Self>) -> bool {
        false
    }

    fn on_start(_ctx: &mut TaskCtx<Self>) {}

    fn on_stop(_ctx: &mut TaskCtx<Self>) {}
}

/// Declared components: name -> one required capability per slot
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentSpec {
    entries: BTreeMap<String, Vec<ComponentKind>>,
}

impl ComponentSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-slot component
    pub fn single(self, name: impl Into<String>, kind: ComponentKind) -> Self {
        self.with(name, vec![kind])
    }

    /// `count` slots sharing one capability (e.g. a row of nose pokes)
    pub fn slots(self, name: impl Into<String>, count: u16, kind: ComponentKind) -> Self {
        self.with(name, vec![kind; count as usize])
    }

    pub fn with(mut self, name: impl Into<String>, kinds: Vec<ComponentKind>) -> Self {
        self.entries.insert(name.into(), kinds);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[ComponentKind]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ComponentKind])> {
        self.entries
            .iter()
            .map(|(name, kinds)| (name.as_str(), kinds.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handler invoked for every stateful event while the task is in its state
pub type StateHandler<T> = fn(&mut TaskCtx<T>, &Event) -> OperantResult<()>;

/// Explicit state id -> (name, handler) map
pub struct StateTable<T: Task> {
    states: BTreeMap<StateId, (&'static str, StateHandler<T>)>,
}

impl<T: Task> StateTable<T> {
    pub fn new() -> Self {
        StateTable {
            states: BTreeMap::new(),
        }
    }

    pub fn state(mut self, id: StateId, name: &'static str, handler: StateHandler<T>) -> Self {
        self.states.insert(id, (name, handler));
        self
    }

    pub fn handler(&self, id: StateId) -> Option<StateHandler<T>> {
        self.states.get(&id).map(|(_, handler)| *handler)
    }

    pub fn name(&self, id: StateId) -> Option<&'static str> {
        self.states.get(&id).map(|(name, _)| *name)
    }

    pub fn names(&self) -> BTreeMap<StateId, &'static str> {
        self.states
            .iter()
            .map(|(id, (name, _))| (*id, *name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl<T: Task> Default for StateTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
