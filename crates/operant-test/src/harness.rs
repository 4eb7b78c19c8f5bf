//! Rig - a real task process over virtual hardware
//!
//! The rig spawns a task process with the test tasks registered, hosts one
//! `VirtualSource` per named source, and records everything the process
//! sends upstream so tests can assert on event order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use operant_core::{
    ChamberId, ComponentBinding, ComponentId, ComponentKind, Event, EventKind, EventType,
    Metadata, OperantResult, SourceId, StateId, Value,
};
use operant_runtime::{
    add_task, Logger, MemoryLogger, Registry, RuntimeConfig, RuntimeHandle, RuntimeStats,
    TaskProcess, VirtualDevices,
};
use operant_source::{VirtualHardware, VirtualSource};

use crate::{Faulty, Press, Ticker};

/// Memory loggers created through the registry, by chamber
#[derive(Clone, Default)]
pub struct LogBook {
    loggers: Arc<Mutex<BTreeMap<ChamberId, MemoryLogger>>>,
}

impl LogBook {
    pub fn logger(&self, chamber: ChamberId) -> MemoryLogger {
        self.loggers.lock().entry(chamber).or_default().clone()
    }
}

/// Registry with every test task and a `memory` logger writing to `book`
pub fn registry(book: &LogBook) -> Registry {
    let mut registry = Registry::with_builtins();
    registry
        .register_task::<Press>("press")
        .register_task::<Ticker>("ticker")
        .register_task::<Faulty>("faulty");

    let book = book.clone();
    registry.register_logger("memory", move |chamber, _| {
        Ok(Box::new(book.logger(chamber)) as Box<dyn Logger>)
    });
    registry
}

/// Bindings for `Press` on one source
pub fn press_bindings(source: &str) -> Vec<ComponentBinding> {
    vec![
        ComponentBinding::new("lever", 0, ComponentKind::DIGITAL_INPUT, source, "in0"),
        ComponentBinding::new("light", 0, ComponentKind::DIGITAL_OUTPUT, source, "out0"),
    ]
}

pub fn ticker_bindings(source: &str) -> Vec<ComponentBinding> {
    vec![ComponentBinding::new(
        "light",
        0,
        ComponentKind::DIGITAL_OUTPUT,
        source,
        "out1",
    )]
}

pub fn faulty_bindings(source: &str) -> Vec<ComponentBinding> {
    vec![ComponentBinding::new(
        "lever",
        0,
        ComponentKind::DIGITAL_INPUT,
        source,
        "in1",
    )]
}

pub struct Rig {
    handle: RuntimeHandle,
    hardware: BTreeMap<SourceId, VirtualHardware>,
    pending: VecDeque<Event>,
    pub logs: LogBook,
    /// Devices of sources added at run time with `AddSource`
    pub devices: VirtualDevices,
}

impl Rig {
    /// Launch with a 10 ms heartbeat window and one virtual source per name
    pub fn launch(sources: &[&str]) -> OperantResult<Self> {
        let config = RuntimeConfig {
            poll_timeout: Duration::from_millis(10),
            ..RuntimeConfig::default()
        };
        Self::launch_with(config, sources, |_| Ok(()))
    }

    /// Launch, letting `setup` attach loggers or sources before the reactor starts
    pub fn launch_with<F>(config: RuntimeConfig, sources: &[&str], setup: F) -> OperantResult<Self>
    where
        F: FnOnce(&mut TaskProcess) -> OperantResult<()>,
    {
        let logs = LogBook::default();
        let registry = registry(&logs);
        let devices = registry.virtual_devices();
        let mut process = TaskProcess::new(config, registry)?;

        let mut hardware = BTreeMap::new();
        for name in sources {
            let id = SourceId::new(*name);
            let (source, device) = VirtualSource::new();
            process.spawn_source(id.clone(), Box::new(source))?;
            hardware.insert(id, device);
        }
        setup(&mut process)?;

        Ok(Rig {
            handle: process.spawn()?,
            hardware,
            pending: VecDeque::new(),
            logs,
            devices,
        })
    }

    /// Device side of a source. Panics for unknown names.
    pub fn hardware(&self, source: &str) -> &VirtualHardware {
        &self.hardware[&SourceId::new(source)]
    }

    pub fn send(&self, events: &[Event]) -> OperantResult<()> {
        self.handle.send(events)
    }

    pub fn add_task(
        &self,
        chamber: ChamberId,
        task_type: &str,
        bindings: Vec<ComponentBinding>,
        constants: Metadata,
    ) -> OperantResult<()> {
        self.send(&[add_task(chamber, task_type, bindings, constants, &[])])
    }

    pub fn control(&self, chamber: ChamberId, kind: EventKind) -> OperantResult<()> {
        self.send(&[Event::new(chamber, kind)])
    }

    /// Change an input as the hardware would
    pub fn set_input(
        &self,
        source: &str,
        chamber: ChamberId,
        name: &str,
        value: impl Into<Value>,
    ) -> OperantResult<()> {
        let id = ComponentId::for_slot(chamber, name, 0);
        self.hardware(source).set_input(&id, value.into())
    }

    /// Block until every component of a chamber's task is registered with `source`
    pub fn wait_registered(&self, source: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.hardware(source).registered().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// Events until `done` matches one (included), or `timeout` passes
    pub fn collect_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&Event) -> bool,
    ) -> Vec<Event> {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            while let Some(event) = self.pending.pop_front() {
                let stop = done(&event);
                seen.push(event);
                if stop {
                    return seen;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return seen;
            }
            let wait = (deadline - now).min(Duration::from_millis(20));
            if let Some(events) = self.handle.recv_events(wait) {
                self.pending.extend(events);
            }
        }
    }

    /// Every event for `window`
    pub fn collect_for(&mut self, window: Duration) -> Vec<Event> {
        self.collect_until(window, |_| false)
    }

    /// Events until `chamber` enters `state`
    pub fn until_enter(&mut self, chamber: ChamberId, state: StateId) -> Vec<Event> {
        self.collect_until(Duration::from_secs(3), |e| {
            e.chamber == Some(chamber) && e.kind == EventKind::StateEnter { state }
        })
    }

    pub fn shutdown(self) -> Option<RuntimeStats> {
        self.handle.shutdown()
    }
}

/// Event types, in order
pub fn types(events: &[Event]) -> Vec<EventType> {
    events.iter().map(Event::event_type).collect()
}

/// Events of one chamber
pub fn of_chamber(events: &[Event], chamber: ChamberId) -> Vec<Event> {
    events
        .iter()
        .filter(|e| e.chamber == Some(chamber))
        .cloned()
        .collect()
}

/// Timeouts named `name` among `events`
pub fn timeouts_named(events: &[Event], name: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::Timeout { name: n } if n == name))
        .count()
}
