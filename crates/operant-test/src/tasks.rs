//! Test tasks
//!
//! Small tasks with known state graphs, used to observe the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use operant_core::{ComponentKind, Event, EventKind, Metadata, OperantResult, StateId};
use operant_task::{ComponentSpec, StateTable, Task, TaskCtx};

pub const A: StateId = StateId::new(1);
pub const B: StateId = StateId::new(2);

/// Two-state lever task.
///
/// `A` arms `t1` (ended with the state); a lever press lights the light and
/// moves to `B`, and so does `t1` firing. Releasing the lever in `B` goes
/// back to `A`.
pub struct Press;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PressConstants {
    pub hold_ms: u64,
    /// Presses until complete; 0 runs forever
    pub trials: u32,
}

impl Default for PressConstants {
    fn default() -> Self {
        PressConstants {
            hold_ms: 2000,
            trials: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct PressVars {
    pub presses: u32,
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
            .state(A, "A", press_a)
            .state(B, "B", press_b)
    }

    fn init_state(_ctx: &mut TaskCtx<Self>) -> StateId {
        A
    }

    fn is_complete(ctx: &TaskCtx<Self>) -> bool {
        ctx.constants.trials > 0 && ctx.vars.presses >= ctx.constants.trials
    }
}

fn lever_changed(ctx: &TaskCtx<Press>, event: &Event) -> bool {
    match &event.kind {
        EventKind::ComponentChanged { component, .. } => ctx.name_of(component) == Some("lever"),
        _ => false,
    }
}

fn press_a(ctx: &mut TaskCtx<Press>, event: &Event) -> OperantResult<()> {
    match &event.kind {
        EventKind::StateEnter { .. } => {
            let hold = Duration::from_millis(ctx.constants.hold_ms);
            ctx.set_timeout("t1", hold, true, Metadata::new())
        }
        EventKind::Timeout { name } if name == "t1" => ctx.change_state(B, Metadata::new()),
        _ if lever_changed(ctx, event) && ctx.value("lever").is_truthy() => {
            ctx.vars.presses += 1;
            ctx.write("light", true)?;
            ctx.change_state(B, Metadata::new())
        }
        _ => Ok(()),
    }
}

fn press_b(ctx: &mut TaskCtx<Press>, event: &Event) -> OperantResult<()> {
    if lever_changed(ctx, event) && !ctx.value("lever").is_truthy() {
        ctx.write("light", false)?;
        return ctx.change_state(A, Metadata::new());
    }
    Ok(())
}

pub const TICK: StateId = StateId::new(10);
pub const TOCK: StateId = StateId::new(11);

/// Alternates between `TICK` and `TOCK` on heartbeats alone
pub struct Ticker;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TickerConstants {
    pub period_ms: u64,
}

impl Default for TickerConstants {
    fn default() -> Self {
        TickerConstants { period_ms: 20 }
    }
}

impl Task for Ticker {
    type Constants = TickerConstants;
    type Variables = ();

    fn components() -> ComponentSpec {
        ComponentSpec::new().single("light", ComponentKind::DIGITAL_OUTPUT)
    }

    fn states() -> StateTable<Self> {
        StateTable::new()
            .state(TICK, "tick", tick)
            .state(TOCK, "tock", tick)
    }

    fn init_state(_ctx: &mut TaskCtx<Self>) -> StateId {
        TICK
    }
}

fn tick(ctx: &mut TaskCtx<Ticker>, event: &Event) -> OperantResult<()> {
    if event.kind != EventKind::Heartbeat {
        return Ok(());
    }
    if ctx.time_in_state() < Duration::from_millis(ctx.constants.period_ms) {
        return Ok(());
    }
    let next = if ctx.state() == Some(TICK) { TOCK } else { TICK };
    ctx.change_state(next, Metadata::new())
}

pub const ARMED: StateId = StateId::new(20);

/// Panics on the first lever change
pub struct Faulty;

impl Task for Faulty {
    type Constants = ();
    type Variables = ();

    fn components() -> ComponentSpec {
        ComponentSpec::new().single("lever", ComponentKind::DIGITAL_INPUT)
    }

    fn states() -> StateTable<Self> {
        StateTable::new().state(ARMED, "armed", armed)
    }

    fn init_state(_ctx: &mut TaskCtx<Self>) -> StateId {
        ARMED
    }
}

fn armed(_ctx: &mut TaskCtx<Faulty>, event: &Event) -> OperantResult<()> {
    if let EventKind::ComponentChanged { .. } = event.kind {
        panic!("lever handler exploded");
    }
    Ok(())
}
