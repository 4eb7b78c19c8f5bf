//! Machine - drives one task through its lifecycle
//!
//! The task process holds every chamber's task as `Box<dyn ChamberTask>`;
//! `Machine<T>` is the one implementation, generic over the task type.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use operant_core::{
    ChamberId, Component, ComponentId, Event, EventKind, Metadata, OperantError, OperantResult,
    SourceId, StateId, Value,
};

use crate::{
    apply_overrides, bind_components, constants_metadata, Outbox, StateTable, Task, TaskCtx,
    TaskSetup,
};

/// Object-safe view of a chamber's task, used by the task process
pub trait ChamberTask: Send {
    fn chamber(&self) -> ChamberId;
    fn task_type(&self) -> &str;
    fn is_started(&self) -> bool;
    fn is_paused(&self) -> bool;
    fn is_complete(&self) -> bool;
    fn state(&self) -> Option<StateId>;
    fn state_name(&self) -> Option<&'static str>;
    fn name_of_state(&self, state: StateId) -> Option<&'static str>;
    fn components(&self) -> &[Component];
    fn constants(&self) -> Metadata;
    fn time_in_state(&self) -> Duration;
    fn time_elapsed(&self) -> Duration;

    /// Reset runtime fields and enter the initial state
    fn start(&mut self) -> OperantResult<()>;
    /// Cancel timers and leave the current state
    fn stop(&mut self) -> OperantResult<()>;
    fn pause(&mut self) -> OperantResult<()>;
    fn resume(&mut self) -> OperantResult<()>;
    /// Wind down after `TaskComplete`
    fn finish(&mut self) -> OperantResult<()>;

    /// Dispatch a stateful event to the current state's handler
    fn handle(&mut self, event: &Event) -> OperantResult<()>;

    /// Cache a reported value; returns `ComponentChanged` if it differs
    fn update_component(&mut self, id: &ComponentId, value: Value) -> Option<Event>;

    /// Record that a timer fired; false if it was canceled or re-armed meanwhile
    fn timeout_fired(&mut self, name: &str, metadata: &Metadata) -> bool;

    /// Mark every component served by `source` unavailable; returns how many
    fn mark_source_unavailable(&mut self, source: &SourceId) -> usize;

    /// Cancel timers and produce `ComponentClose` commands for every component
    fn close(&mut self) -> OperantResult<Vec<(SourceId, Event)>>;

    fn take_outbox(&mut self) -> Outbox;
}

/// A task type bound to a chamber
pub struct Machine<T: Task> {
    ctx: TaskCtx<T>,
    table: StateTable<T>,
    task_type: String,
}

impl<T: Task> Machine<T> {
    /// Validate bindings, apply constant overrides, and build the context
    pub fn new(setup: TaskSetup) -> OperantResult<Self> {
        let components = bind_components(setup.chamber, &T::components(), &setup.bindings)?;
        let constants = apply_overrides::<T::Constants>(&setup.constants)?;
        let table = T::states();

        let ctx = TaskCtx::new(
            setup.chamber,
            constants,
            table.names(),
            components,
            setup.timers,
        );

        Ok(Machine {
            ctx,
            table,
            task_type: setup.task_type,
        })
    }

    pub fn ctx(&self) -> &TaskCtx<T> {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut TaskCtx<T> {
        &mut self.ctx
    }

    /// Latch completion after a dispatch that did not itself complete
    fn check_complete(&mut self) -> OperantResult<()> {
        if !self.ctx.started || self.ctx.complete {
            return Ok(());
        }
        if self.ctx.is_complete_once() {
            if let Some(state) = self.ctx.state {
                self.ctx.exit_state(state)?;
            }
            self.ctx.emit(EventKind::TaskComplete);
        }
        Ok(())
    }
}

impl<T: Task> ChamberTask for Machine<T> {
    fn chamber(&self) -> ChamberId {
        self.ctx.chamber()
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn is_started(&self) -> bool {
        self.ctx.started
    }

    fn is_paused(&self) -> bool {
        self.ctx.paused
    }

    fn is_complete(&self) -> bool {
        self.ctx.complete
    }

    fn state(&self) -> Option<StateId> {
        self.ctx.state
    }

    fn state_name(&self) -> Option<&'static str> {
        self.ctx.state_name()
    }

    fn name_of_state(&self, state: StateId) -> Option<&'static str> {
        self.table.name(state)
    }

    fn components(&self) -> &[Component] {
        &self.ctx.components
    }

    fn constants(&self) -> Metadata {
        constants_metadata(&self.ctx.constants)
    }

    fn time_in_state(&self) -> Duration {
        self.ctx.time_in_state()
    }

    fn time_elapsed(&self) -> Duration {
        self.ctx.time_elapsed()
    }

    fn start(&mut self) -> OperantResult<()> {
        if self.ctx.started {
            debug!(chamber = %self.ctx.chamber(), "start ignored, already running");
            return Ok(());
        }

        self.ctx.cancel_all_timeouts()?;
        let now = Instant::now();
        let ctx = &mut self.ctx;
        ctx.vars = T::Variables::default();
        ctx.state = None;
        ctx.start_time = now;
        ctx.entry_time = now;
        ctx.time_paused = Duration::ZERO;
        ctx.paused_at = None;
        ctx.paused = false;
        ctx.complete = false;
        ctx.started = true;

        info!(chamber = %ctx.chamber(), task = %self.task_type, "task started");

        T::on_start(ctx);
        let init = T::init_state(ctx);
        ctx.change_state(init, Metadata::new())
    }

    fn stop(&mut self) -> OperantResult<()> {
        if !self.ctx.started {
            return Ok(());
        }

        self.ctx.cancel_all_timeouts()?;
        if let Some(state) = self.ctx.state.take() {
            self.ctx.emit(EventKind::StateExit { state });
        }
        self.ctx.started = false;
        self.ctx.paused = false;
        self.ctx.paused_at = None;
        T::on_stop(&mut self.ctx);

        info!(chamber = %self.ctx.chamber(), task = %self.task_type, "task stopped");
        Ok(())
    }

    fn pause(&mut self) -> OperantResult<()> {
        if !self.ctx.started || self.ctx.paused {
            return Ok(());
        }

        self.ctx.pause_all_timeouts()?;
        self.ctx.time_paused = self.ctx.entry_time.elapsed();
        self.ctx.paused_at = Some(Instant::now());
        self.ctx.paused = true;
        debug!(chamber = %self.ctx.chamber(), "task paused");
        Ok(())
    }

    fn resume(&mut self) -> OperantResult<()> {
        if !self.ctx.started || !self.ctx.paused {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(paused_at) = self.ctx.paused_at.take() {
            self.ctx.start_time += now.saturating_duration_since(paused_at);
        }
        self.ctx.entry_time = now.checked_sub(self.ctx.time_paused).unwrap_or(now);
        self.ctx.paused = false;
        self.ctx.resume_all_timeouts()?;
        debug!(chamber = %self.ctx.chamber(), "task resumed");
        Ok(())
    }

    fn finish(&mut self) -> OperantResult<()> {
        if !self.ctx.started {
            return Ok(());
        }

        self.ctx.cancel_all_timeouts()?;
        self.ctx.state = None;
        self.ctx.started = false;
        self.ctx.paused = false;
        T::on_stop(&mut self.ctx);

        info!(
            chamber = %self.ctx.chamber(),
            task = %self.task_type,
            elapsed = ?self.ctx.time_elapsed(),
            "task complete"
        );
        Ok(())
    }

    fn handle(&mut self, event: &Event) -> OperantResult<()> {
        if !self.ctx.started || self.ctx.paused || self.ctx.complete {
            return Ok(());
        }

        if let Some(state) = self.ctx.state {
            let handler = self
                .table
                .handler(state)
                .ok_or(OperantError::UnknownState(state))?;
            handler(&mut self.ctx, event)?;
        }

        self.check_complete()
    }

    fn update_component(&mut self, id: &ComponentId, value: Value) -> Option<Event> {
        let chamber = self.ctx.chamber();
        let component = self.ctx.component_by_id_mut(id)?;
        if !component.update(value) {
            return None;
        }
        Some(Event::new(
            chamber,
            EventKind::ComponentChanged {
                component: id.clone(),
                slot: component.slot,
            },
        ))
    }

    fn timeout_fired(&mut self, name: &str, metadata: &Metadata) -> bool {
        self.ctx.timeout_fired(name, metadata)
    }

    fn mark_source_unavailable(&mut self, source: &SourceId) -> usize {
        let mut count = 0;
        for component in self.ctx.components.iter_mut() {
            if &component.source == source && component.available {
                component.available = false;
                count += 1;
            }
        }
        count
    }

    fn close(&mut self) -> OperantResult<Vec<(SourceId, Event)>> {
        self.ctx.cancel_all_timeouts()?;
        let chamber = self.ctx.chamber();
        Ok(self
            .ctx
            .components
            .iter()
            .filter(|c| c.available)
            .map(|c| {
                (
                    c.source.clone(),
                    Event::new(
                        chamber,
                        EventKind::ComponentClose {
                            component: c.id.clone(),
                        },
                    ),
                )
            })
            .collect())
    }

    fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.ctx.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ComponentSpec, TimerLink};
    use operant_core::{ComponentBinding, ComponentKind};
    use operant_time::{TimeoutConfig, TimeoutManager};
    use operant_wire::{decode, link, LinkReceiver};
    use serde::{Deserialize, Serialize};

    const A: StateId = StateId::new(1);
    const B: StateId = StateId::new(2);

    struct Press;

    #[derive(Serialize, Deserialize)]
    struct PressConstants {
        trials: u32,
        finish_on_heartbeat: bool,
        hold_ms: u64,
    }

    impl Default for PressConstants {
        fn default() -> Self {
            PressConstants {
                trials: 10,
                finish_on_heartbeat: false,
                hold_ms: 2000,
            }
        }
    }

    #[derive(Default)]
    struct PressVars {
        presses: u32,
        done: bool,
    }

    impl Task for Press {
        type Constants = PressConstants;
        type Variables = PressVars;

        fn components() -> ComponentSpec {
            ComponentSpec::new()
                .single("lever", ComponentKind::DIGITAL_INPUT)
                .single("light", ComponentKind::DIGITAL_OUTPUT)
        }

        fn states() -> StateTable<Self> {
            StateTable::new()
                .state(A, "A", state_a)
                .state(B, "B", state_b)
        }

        fn init_state(_ctx: &mut TaskCtx<Self>) -> StateId {
            A
        }

        fn is_complete(ctx: &TaskCtx<Self>) -> bool {
            ctx.vars.done || ctx.vars.presses >= ctx.constants.trials
        }
    }

    fn state_a(ctx: &mut TaskCtx<Press>, event: &Event) -> OperantResult<()> {
        match &event.kind {
            EventKind::StateEnter { .. } => {
                let hold = Duration::from_millis(ctx.constants.hold_ms);
                ctx.set_timeout("t1", hold, true, Metadata::new())
            }
            EventKind::ComponentChanged { .. } if ctx.value("lever").is_truthy() => {
                ctx.vars.presses += 1;
                ctx.write("light", true)?;
                ctx.change_state(B, Metadata::new())
            }
            _ => Ok(()),
        }
    }

    fn state_b(ctx: &mut TaskCtx<Press>, event: &Event) -> OperantResult<()> {
        match &event.kind {
            EventKind::Heartbeat if ctx.constants.finish_on_heartbeat => {
                ctx.vars.done = true;
                Ok(())
            }
            EventKind::ComponentChanged { .. } if !ctx.value("lever").is_truthy() => {
                ctx.change_state(A, Metadata::new())
            }
            _ => Ok(()),
        }
    }

    struct Rig {
        machine: Machine<Press>,
        manager: TimeoutManager,
        _timeouts: LinkReceiver,
    }

    fn rig(constants: Metadata) -> Rig {
        let manager = TimeoutManager::spawn(TimeoutConfig::default()).unwrap();
        let (sink, timeouts) = link();
        let setup = TaskSetup {
            chamber: ChamberId::new(1),
            task_type: "Press".into(),
            bindings: vec![
                ComponentBinding::new("lever", 0, ComponentKind::DIGITAL_INPUT, "ni", "p0.0"),
                ComponentBinding::new("light", 0, ComponentKind::DIGITAL_OUTPUT, "ni", "p1.0"),
            ],
            constants,
            timers: TimerLink::new(manager.handle(), sink),
        };
        Rig {
            machine: Machine::new(setup).unwrap(),
            manager,
            _timeouts: timeouts,
        }
    }

    /// Drain follow-up events the way the task process does
    fn drain(machine: &mut Machine<Press>) -> Vec<EventKind> {
        let mut seen = Vec::new();
        loop {
            let outbox = machine.take_outbox();
            if outbox.events.is_empty() {
                return seen;
            }
            for event in outbox.events {
                seen.push(event.kind.clone());
                if event.is_stateful() {
                    machine.handle(&event).unwrap();
                }
            }
        }
    }

    fn press(machine: &mut Machine<Press>, down: bool) -> Vec<EventKind> {
        let id = ComponentId::new("lever-1-0");
        let changed = machine.update_component(&id, Value::Bool(down)).unwrap();
        machine.handle(&changed).unwrap();
        drain(machine)
    }

    #[test]
    fn test_start_then_stop() {
        let mut rig = rig(Metadata::new());
        rig.machine.start().unwrap();
        assert_eq!(drain(&mut rig.machine), vec![EventKind::StateEnter { state: A }]);
        assert!(rig.machine.ctx().has_timeout("t1"));

        rig.machine.stop().unwrap();
        assert_eq!(drain(&mut rig.machine), vec![EventKind::StateExit { state: A }]);
        assert!(!rig.machine.is_started());
        assert!(!rig.machine.ctx().has_timeout("t1"));
    }

    #[test]
    fn test_change_state_cancels_bound_timeouts() {
        let mut rig = rig(Metadata::new());
        rig.machine.start().unwrap();
        drain(&mut rig.machine);

        let events = press(&mut rig.machine, true);
        assert_eq!(
            events,
            vec![
                EventKind::StateExit { state: A },
                EventKind::StateEnter { state: B },
            ]
        );
        assert!(!rig.machine.ctx().has_timeout("t1"));
        assert_eq!(
            rig.manager
                .handle()
                .remaining(operant_time::TimeoutKey::new(ChamberId::new(1), "t1")),
            None
        );
    }

    #[test]
    fn test_write_goes_to_source() {
        let mut rig = rig(Metadata::new());
        rig.machine.start().unwrap();
        drain(&mut rig.machine);

        let id = ComponentId::new("lever-1-0");
        let changed = rig.machine.update_component(&id, Value::Bool(true)).unwrap();
        rig.machine.handle(&changed).unwrap();

        let outbox = rig.machine.take_outbox();
        assert_eq!(outbox.writes.len(), 1);
        let (source, write) = &outbox.writes[0];
        assert_eq!(source, &SourceId::new("ni"));
        assert_eq!(
            write.kind,
            EventKind::ComponentWrite {
                component: ComponentId::new("light-1-0"),
                value: Value::Bool(true),
            }
        );
    }

    #[test]
    fn test_changed_only_on_difference() {
        let mut rig = rig(Metadata::new());
        let id = ComponentId::new("lever-1-0");

        assert!(rig.machine.update_component(&id, Value::Bool(true)).is_some());
        assert!(rig.machine.update_component(&id, Value::Bool(true)).is_none());
        assert!(rig.machine.update_component(&id, Value::Bool(false)).is_some());
        assert!(rig
            .machine
            .update_component(&ComponentId::new("lever-9-0"), Value::Bool(true))
            .is_none());
    }

    #[test]
    fn test_completion_replaces_state_enter() {
        let mut constants = Metadata::new();
        constants.insert("trials".into(), Value::Int(1));
        let mut rig = rig(constants);
        rig.machine.start().unwrap();
        drain(&mut rig.machine);

        let events = press(&mut rig.machine, true);
        assert_eq!(
            events,
            vec![EventKind::StateExit { state: A }, EventKind::TaskComplete]
        );
        assert!(rig.machine.is_complete());

        // Latched: nothing further fires
        rig.machine.handle(&Event::new(ChamberId::new(1), EventKind::Heartbeat)).unwrap();
        assert!(drain(&mut rig.machine).is_empty());
    }

    #[test]
    fn test_completion_without_state_change() {
        let mut constants = Metadata::new();
        constants.insert("finish_on_heartbeat".into(), Value::Bool(true));
        let mut rig = rig(constants);
        rig.machine.start().unwrap();
        drain(&mut rig.machine);
        press(&mut rig.machine, true);

        rig.machine.handle(&Event::new(ChamberId::new(1), EventKind::Heartbeat)).unwrap();
        assert_eq!(
            drain(&mut rig.machine),
            vec![EventKind::StateExit { state: B }, EventKind::TaskComplete]
        );
    }

    #[test]
    fn test_write_to_unavailable_source() {
        let mut rig = rig(Metadata::new());
        rig.machine.start().unwrap();
        drain(&mut rig.machine);

        assert_eq!(rig.machine.mark_source_unavailable(&SourceId::new("ni")), 2);
        assert_eq!(
            rig.machine.ctx_mut().write("light", true),
            Err(OperantError::SourceUnavailable(SourceId::new("ni")))
        );
    }

    #[test]
    fn test_pause_keeps_time_in_state_continuous() {
        let mut rig = rig(Metadata::new());
        rig.machine.start().unwrap();
        drain(&mut rig.machine);

        std::thread::sleep(Duration::from_millis(40));
        rig.machine.pause().unwrap();
        let frozen = rig.machine.time_in_state();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(rig.machine.time_in_state(), frozen);

        rig.machine.resume().unwrap();
        let resumed = rig.machine.time_in_state();
        assert!(resumed >= frozen);
        assert!(resumed < frozen + Duration::from_millis(40));
        assert!(rig.machine.time_elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_paused_task_ignores_events() {
        let mut rig = rig(Metadata::new());
        rig.machine.start().unwrap();
        drain(&mut rig.machine);
        rig.machine.pause().unwrap();

        let events = press(&mut rig.machine, true);
        assert!(events.is_empty());
        assert_eq!(rig.machine.state(), Some(A));
    }

    #[test]
    fn test_timeout_fire_routes_event() {
        let mut constants = Metadata::new();
        constants.insert("hold_ms".into(), Value::Int(20));
        let rig = {
            let mut rig = rig(constants);
            rig.machine.start().unwrap();
            drain(&mut rig.machine);
            rig
        };

        let batch = rig
            ._timeouts
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        let events = decode(&batch).unwrap();
        assert_eq!(events[0].chamber, Some(ChamberId::new(1)));
        assert_eq!(events[0].kind, EventKind::Timeout { name: "t1".into() });
    }

    #[test]
    fn test_rearm_while_fire_in_flight() {
        let mut constants = Metadata::new();
        constants.insert("hold_ms".into(), Value::Int(20));
        let mut rig = rig(constants);
        rig.machine.start().unwrap();
        drain(&mut rig.machine);

        // The first arm fires, but its event is not dispatched yet
        let recv = |rig: &Rig| {
            let batch = rig._timeouts.recv_timeout(Duration::from_secs(2)).unwrap();
            decode(&batch).unwrap().remove(0)
        };
        let first = recv(&rig);

        rig.machine
            .ctx_mut()
            .set_timeout("t1", Duration::from_millis(60), true, Metadata::new())
            .unwrap();
        assert!(!rig.machine.timeout_fired("t1", &first.metadata));
        assert!(rig.machine.ctx().has_timeout("t1"));

        let second = recv(&rig);
        assert_eq!(second.kind, EventKind::Timeout { name: "t1".into() });
        assert!(rig.machine.timeout_fired("t1", &second.metadata));
        assert!(!rig.machine.ctx().has_timeout("t1"));
        assert!(!rig.machine.timeout_fired("t1", &second.metadata));
    }

    #[test]
    fn test_fire_after_cancel_refused() {
        let mut constants = Metadata::new();
        constants.insert("hold_ms".into(), Value::Int(20));
        let mut rig = rig(constants);
        rig.machine.start().unwrap();
        drain(&mut rig.machine);

        let batch = rig._timeouts.recv_timeout(Duration::from_secs(2)).unwrap();
        let fired = decode(&batch).unwrap().remove(0);
        rig.machine.ctx_mut().cancel_timeout("t1").unwrap();
        assert!(!rig.machine.timeout_fired("t1", &fired.metadata));
    }

    #[test]
    fn test_close_emits_component_close() {
        let mut rig = rig(Metadata::new());
        let closes = rig.machine.close().unwrap();
        assert_eq!(closes.len(), 2);
        assert!(closes
            .iter()
            .all(|(_, e)| matches!(e.kind, EventKind::ComponentClose { .. })));
    }

    #[test]
    fn test_bad_constants_rejected() {
        let manager = TimeoutManager::spawn(TimeoutConfig::default()).unwrap();
        let (sink, _rx) = link();
        let mut constants = Metadata::new();
        constants.insert("nope".into(), Value::Int(1));
        let setup = TaskSetup {
            chamber: ChamberId::new(2),
            task_type: "Press".into(),
            bindings: vec![
                ComponentBinding::new("lever", 0, ComponentKind::DIGITAL_INPUT, "ni", "p0.0"),
                ComponentBinding::new("light", 0, ComponentKind::DIGITAL_OUTPUT, "ni", "p1.0"),
            ],
            constants,
            timers: TimerLink::new(manager.handle(), sink),
        };
        assert!(matches!(
            Machine::<Press>::new(setup),
            Err(OperantError::MalformedProtocol(_))
        ));
    }
}
