//! Task context - everything a running task owns
//!
//! Handlers receive `&mut TaskCtx<T>`: the typed constants and variables,
//! the component cache, the timer bookkeeping, and an outbox. Nothing a
//! handler does leaves the context directly; follow-up events and component
//! writes are queued in the outbox and drained by the task process.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::debug;

use operant_core::{
    ChamberId, Component, ComponentId, Event, EventKind, Metadata, OperantError, OperantResult,
    SourceId, StateId, Value,
};
use operant_time::TimeoutKey;

use crate::{Task, TimerLink};

/// Events and writes produced while handling one event
#[derive(Debug, Default)]
pub struct Outbox {
    /// Follow-up events, in emission order
    pub events: Vec<Event>,
    /// Commands for sources, with their destination
    pub writes: Vec<(SourceId, Event)>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.writes.is_empty()
    }
}

/// Metadata key numbering each arming of a timer. A fire carrying an older
/// number than the timer's current arm is stale.
pub const TIMER_ARM_KEY: &str = "timer_arm";

#[derive(Clone, Copy, Debug)]
pub(crate) struct Armed {
    pub(crate) end_with_state: bool,
    pub(crate) arm: i64,
}

/// Runtime state of one chamber's task
pub struct TaskCtx<T: Task> {
    pub constants: T::Constants,
    pub vars: T::Variables,

    chamber: ChamberId,
    state_names: BTreeMap<StateId, &'static str>,
    pub(crate) state: Option<StateId>,
    pub(crate) entry_time: Instant,
    pub(crate) start_time: Instant,
    /// Time in state frozen at pause
    pub(crate) time_paused: Duration,
    pub(crate) paused_at: Option<Instant>,
    pub(crate) started: bool,
    pub(crate) paused: bool,
    pub(crate) complete: bool,

    // Component arena
    pub(crate) components: Vec<Component>,
    by_id: HashMap<ComponentId, usize>,
    by_name: HashMap<String, Vec<usize>>,

    /// Armed timers by name
    pub(crate) timeouts: BTreeMap<String, Armed>,
    state_timeouts: HashMap<StateId, BTreeMap<String, bool>>,
    /// Last arm number handed out
    arms: i64,
    timers: TimerLink,

    pub(crate) outbox: Outbox,
}

impl<T: Task> TaskCtx<T> {
    pub(crate) fn new(
        chamber: ChamberId,
        constants: T::Constants,
        state_names: BTreeMap<StateId, &'static str>,
        components: Vec<Component>,
        timers: TimerLink,
    ) -> Self {
        let mut by_id = HashMap::new();
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, component) in components.iter().enumerate() {
            by_id.insert(component.id.clone(), i);
            by_name.entry(component.name.clone()).or_default().push(i);
        }

        let now = Instant::now();
        TaskCtx {
            constants,
            vars: T::Variables::default(),
            chamber,
            state_names,
            state: None,
            entry_time: now,
            start_time: now,
            time_paused: Duration::ZERO,
            paused_at: None,
            started: false,
            paused: false,
            complete: false,
            components,
            by_id,
            by_name,
            timeouts: BTreeMap::new(),
            state_timeouts: HashMap::new(),
            arms: 0,
            timers,
            outbox: Outbox::default(),
        }
    }

    #[inline]
    pub fn chamber(&self) -> ChamberId {
        self.chamber
    }

    #[inline]
    pub fn state(&self) -> Option<StateId> {
        self.state
    }

    pub fn state_name(&self) -> Option<&'static str> {
        self.state.and_then(|s| self.state_names.get(&s).copied())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Leave the current state and enter `new_state`.
    ///
    /// Emits `StateExit(old)`, cancels the old state's `end_with_state`
    /// timers, then either `TaskComplete` (if the task just completed) or
    /// `StateEnter(new_state)`.
    pub fn change_state(&mut self, new_state: StateId, metadata: Metadata) -> OperantResult<()> {
        if !self.state_names.contains_key(&new_state) {
            return Err(OperantError::UnknownState(new_state));
        }

        if let Some(old) = self.state {
            self.exit_state(old)?;
        }

        if self.is_complete_once() {
            self.emit(EventKind::TaskComplete);
            return Ok(());
        }

        debug!(
            chamber = %self.chamber,
            from = ?self.state_name(),
            to = self.state_names.get(&new_state).copied().unwrap_or("?"),
            "state change"
        );

        self.state = Some(new_state);
        self.entry_time = Instant::now();
        self.outbox.events.push(
            Event::new(self.chamber, EventKind::StateEnter { state: new_state })
                .with_metadata(metadata),
        );
        Ok(())
    }

    pub(crate) fn exit_state(&mut self, old: StateId) -> OperantResult<()> {
        self.emit(EventKind::StateExit { state: old });
        if let Some(bound) = self.state_timeouts.remove(&old) {
            for (name, end_with_state) in bound {
                if end_with_state {
                    self.timeouts.remove(&name);
                    self.timers.handle.cancel(self.key(&name))?;
                }
            }
        }
        Ok(())
    }

    /// True exactly once: the first time the task reports completion
    pub fn is_complete_once(&mut self) -> bool {
        if self.complete {
            return false;
        }
        self.complete = T::is_complete(self);
        self.complete
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn key(&self, name: &str) -> TimeoutKey {
        TimeoutKey::new(self.chamber, name)
    }

    /// Arm a timer, or restart it in place if already armed
    pub fn set_timeout(
        &mut self,
        name: &str,
        duration: Duration,
        end_with_state: bool,
        mut metadata: Metadata,
    ) -> OperantResult<()> {
        self.arms += 1;
        let arm = self.arms;
        metadata.insert(TIMER_ARM_KEY.into(), Value::Int(arm));
        let timeout = self
            .timers
            .timeout(self.chamber, name, duration)
            .with_metadata(metadata);

        if self.timeouts.contains_key(name) {
            self.timers.handle.reset(timeout)?;
            for bound in self.state_timeouts.values_mut() {
                bound.remove(name);
            }
        } else {
            self.timers.handle.add(timeout)?;
        }

        self.timeouts.insert(
            name.to_string(),
            Armed {
                end_with_state,
                arm,
            },
        );
        if let Some(state) = self.state {
            self.state_timeouts
                .entry(state)
                .or_default()
                .insert(name.to_string(), end_with_state);
        }
        if self.paused {
            self.timers.handle.pause(self.key(name))?;
        }
        Ok(())
    }

    pub fn cancel_timeout(&mut self, name: &str) -> OperantResult<()> {
        if self.forget_timeout(name) {
            self.timers.handle.cancel(self.key(name))?;
        }
        Ok(())
    }

    pub fn pause_timeout(&mut self, name: &str) -> OperantResult<()> {
        if self.timeouts.contains_key(name) {
            self.timers.handle.pause(self.key(name))?;
        }
        Ok(())
    }

    pub fn resume_timeout(&mut self, name: &str) -> OperantResult<()> {
        if self.timeouts.contains_key(name) {
            self.timers.handle.resume(self.key(name))?;
        }
        Ok(())
    }

    pub fn extend_timeout(&mut self, name: &str, delta: Duration) -> OperantResult<()> {
        if self.timeouts.contains_key(name) {
            self.timers.handle.extend(self.key(name), delta)?;
        }
        Ok(())
    }

    /// Remaining time of an armed timer, asked of the timeout manager
    pub fn remaining_timeout(&self, name: &str) -> Option<Duration> {
        if !self.timeouts.contains_key(name) {
            return None;
        }
        self.timers.handle.remaining(self.key(name))
    }

    pub fn has_timeout(&self, name: &str) -> bool {
        self.timeouts.contains_key(name)
    }

    /// Accept a fire of `name` if it belongs to the current arm, forgetting
    /// the timer. Fires of canceled or since re-armed timers are refused.
    pub(crate) fn timeout_fired(&mut self, name: &str, metadata: &Metadata) -> bool {
        let Some(&armed) = self.timeouts.get(name) else {
            return false;
        };
        match metadata.get(TIMER_ARM_KEY).and_then(Value::as_i64) {
            Some(arm) if arm != armed.arm => {
                debug!(timeout = name, fired = arm, current = armed.arm, "fire of an earlier arm");
                false
            }
            _ => self.forget_timeout(name),
        }
    }

    /// Drop bookkeeping for a timer; returns whether it was armed
    pub(crate) fn forget_timeout(&mut self, name: &str) -> bool {
        for bound in self.state_timeouts.values_mut() {
            bound.remove(name);
        }
        self.timeouts.remove(name).is_some()
    }

    pub(crate) fn cancel_all_timeouts(&mut self) -> OperantResult<()> {
        let names: Vec<String> = self.timeouts.keys().cloned().collect();
        self.timeouts.clear();
        self.state_timeouts.clear();
        for name in names {
            self.timers.handle.cancel(self.key(&name))?;
        }
        Ok(())
    }

    pub(crate) fn pause_all_timeouts(&mut self) -> OperantResult<()> {
        for name in self.timeouts.keys() {
            self.timers.handle.pause(self.key(name))?;
        }
        Ok(())
    }

    pub(crate) fn resume_all_timeouts(&mut self) -> OperantResult<()> {
        for name in self.timeouts.keys() {
            self.timers.handle.resume(self.key(name))?;
        }
        Ok(())
    }

    /// Time since entering the current state, excluding pauses
    pub fn time_in_state(&self) -> Duration {
        if self.paused {
            return self.time_paused;
        }
        self.entry_time.elapsed()
    }

    /// Time since start, excluding pauses
    pub fn time_elapsed(&self) -> Duration {
        match self.paused_at {
            Some(paused_at) => paused_at.saturating_duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Write `value` to slot 0 of a component
    pub fn write(&mut self, name: &str, value: impl Into<Value>) -> OperantResult<()> {
        self.write_slot(name, 0, value)
    }

    /// Queue a write for the component's source. Fails if the source is gone.
    pub fn write_slot(&mut self, name: &str, slot: u16, value: impl Into<Value>) -> OperantResult<()> {
        let index = self.index_of(name, slot)?;
        let component = &mut self.components[index];
        if !component.available {
            return Err(OperantError::SourceUnavailable(component.source.clone()));
        }

        let value = value.into();
        component.state = value.clone();
        let event = Event::new(
            self.chamber,
            EventKind::ComponentWrite {
                component: component.id.clone(),
                value,
            },
        );
        self.outbox.writes.push((component.source.clone(), event));
        Ok(())
    }

    fn index_of(&self, name: &str, slot: u16) -> OperantResult<usize> {
        self.by_name
            .get(name)
            .and_then(|slots| slots.get(slot as usize))
            .copied()
            .ok_or_else(|| OperantError::ComponentNotFound(format!("{}[{}]", name, slot)))
    }

    /// Last known value of slot 0 of a component; `Null` if unknown
    pub fn value(&self, name: &str) -> &Value {
        self.value_slot(name, 0)
    }

    pub fn value_slot(&self, name: &str, slot: u16) -> &Value {
        const NULL: &Value = &Value::Null;
        match self.index_of(name, slot) {
            Ok(i) => &self.components[i].state,
            Err(_) => NULL,
        }
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.component_slot(name, 0)
    }

    pub fn component_slot(&self, name: &str, slot: u16) -> Option<&Component> {
        self.index_of(name, slot).ok().map(|i| &self.components[i])
    }

    pub fn component_by_id(&self, id: &ComponentId) -> Option<&Component> {
        self.by_id.get(id).map(|&i| &self.components[i])
    }

    pub(crate) fn component_by_id_mut(&mut self, id: &ComponentId) -> Option<&mut Component> {
        self.by_id.get(id).map(|&i| &mut self.components[i])
    }

    /// Slot index of a component owned by this task
    pub fn slot_of(&self, id: &ComponentId) -> Option<u16> {
        self.component_by_id(id).map(|c| c.slot)
    }

    /// Name of a component owned by this task
    pub fn name_of(&self, id: &ComponentId) -> Option<&str> {
        self.component_by_id(id).map(|c| c.name.as_str())
    }

    /// Queue a follow-up event for this chamber
    pub fn emit(&mut self, kind: EventKind) {
        self.outbox.events.push(Event::new(self.chamber, kind));
    }
}
