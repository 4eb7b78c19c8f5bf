//! Task setup: binding validation and constant overrides

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use operant_core::{
    ChamberId, Component, ComponentBinding, ComponentId, Event, EventKind, Metadata, OperantError,
    OperantResult,
};
use operant_time::{Timeout, TimeoutHandle, TimeoutKey};
use operant_wire::{LinkSender, Outlet};

use crate::ComponentSpec;

/// Everything needed to construct one chamber's task
#[derive(Debug)]
pub struct TaskSetup {
    pub chamber: ChamberId,
    pub task_type: String,
    pub bindings: Vec<ComponentBinding>,
    /// Constant overrides from a protocol file
    pub constants: Metadata,
    pub timers: TimerLink,
}

/// Connects a task's timers to the timeout manager and routes their fires
/// back into the task process as `Timeout` events.
#[derive(Clone, Debug)]
pub struct TimerLink {
    pub handle: TimeoutHandle,
    sink: LinkSender,
}

impl TimerLink {
    pub fn new(handle: TimeoutHandle, sink: LinkSender) -> Self {
        TimerLink { handle, sink }
    }

    /// Build a timer whose fire sends `Timeout(name)` for `chamber`
    pub fn timeout(&self, chamber: ChamberId, name: &str, duration: Duration) -> Timeout {
        let sink = self.sink.clone();
        Timeout::new(
            TimeoutKey::new(chamber, name),
            duration,
            move |key, metadata| {
                let event = Event::new(
                    key.chamber,
                    EventKind::Timeout {
                        name: key.name.clone(),
                    },
                )
                .with_metadata(metadata.clone());
                if let Err(e) = sink.send_events(&[event]) {
                    debug!(timeout = %key, "fire not delivered: {}", e);
                }
            },
        )
    }
}

/// Match bindings against the declared components.
///
/// Every declared slot must be bound exactly once, and nothing undeclared may
/// be bound. Returns the components in declaration order, slots ascending.
pub fn bind_components(
    chamber: ChamberId,
    spec: &ComponentSpec,
    bindings: &[ComponentBinding],
) -> OperantResult<Vec<Component>> {
    let mut by_name: BTreeMap<&str, Vec<&ComponentBinding>> = BTreeMap::new();
    for binding in bindings {
        if spec.get(&binding.name).is_none() {
            return Err(OperantError::ComponentRegister(format!(
                "chamber {}: component '{}' is not used by this task",
                chamber, binding.name
            )));
        }
        by_name.entry(binding.name.as_str()).or_default().push(binding);
    }

    let mut components = Vec::new();
    for (name, kinds) in spec.iter() {
        let mut bound = by_name.remove(name).unwrap_or_default();
        bound.sort_by_key(|b| b.slot);

        let slots_match = bound.len() == kinds.len()
            && bound.iter().enumerate().all(|(i, b)| b.slot as usize == i);
        if !slots_match {
            return Err(OperantError::ComponentRegister(format!(
                "chamber {}: component '{}' needs {} slot(s), bound {:?}",
                chamber,
                name,
                kinds.len(),
                bound.iter().map(|b| b.slot).collect::<Vec<_>>()
            )));
        }

        for (binding, required) in bound.into_iter().zip(kinds) {
            if !binding.kind.satisfies(*required) {
                return Err(OperantError::InvalidComponentType {
                    component: name.to_string(),
                    expected: *required,
                    actual: binding.kind,
                });
            }
            let id = ComponentId::for_slot(chamber, name, binding.slot);
            components.push(Component::from_binding(id, binding));
        }
    }

    Ok(components)
}

/// Apply protocol overrides on top of a constants type's defaults.
/// Unknown or mistyped keys fail with `MalformedProtocol`.
pub fn apply_overrides<C>(overrides: &Metadata) -> OperantResult<C>
where
    C: Serialize + DeserializeOwned + Default,
{
    if overrides.is_empty() {
        return Ok(C::default());
    }

    let malformed = |e: serde_json::Error| OperantError::MalformedProtocol(e.to_string());

    let mut base = serde_json::to_value(C::default()).map_err(malformed)?;
    let fields = base.as_object_mut().ok_or_else(|| {
        OperantError::MalformedProtocol("task declares no overridable constants".into())
    })?;

    for (key, value) in overrides {
        if !fields.contains_key(key) {
            return Err(OperantError::MalformedProtocol(format!(
                "unknown constant '{}'",
                key
            )));
        }
        fields.insert(key.clone(), serde_json::to_value(value).map_err(malformed)?);
    }

    serde_json::from_value(base).map_err(malformed)
}

/// Project constants into metadata for reporting
pub fn constants_metadata<C: Serialize>(constants: &C) -> Metadata {
    serde_json::to_value(constants)
        .and_then(serde_json::from_value)
        .unwrap_or_default()
}
