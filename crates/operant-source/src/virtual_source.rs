//! Virtual source - in-memory hardware
//!
//! Useful wherever real hardware is absent: demos, dry runs of a protocol,
//! and tests. The paired `VirtualHardware` handle plays the part of the
//! physical device: it injects input changes, exposes pull readings,
//! records writes, and injects faults.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use operant_core::{ComponentId, ComponentKind, Metadata, OperantError, OperantResult, Value};

use crate::{Source, SourceFault, SourceLink, SourceResult};

#[derive(Default)]
struct Device {
    link: Option<SourceLink>,
    registered: BTreeMap<ComponentId, (ComponentKind, String)>,
    polled: HashMap<ComponentId, Value>,
    writes: Vec<(ComponentId, Value)>,
    failing: HashMap<ComponentId, String>,
    rejected: HashMap<ComponentId, String>,
    fatal: Option<String>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    device: Mutex<Device>,
    changed: Condvar,
}

/// The device side of a `VirtualSource`
#[derive(Clone, Default)]
pub struct VirtualHardware {
    shared: Arc<Shared>,
}

impl VirtualHardware {
    /// Push a new input value, as event-driven hardware would
    pub fn set_input(&self, component: &ComponentId, value: Value) -> OperantResult<()> {
        let link = self.shared.device.lock().link.clone();
        match link {
            Some(link) => link.update_component(component, value, Metadata::new()),
            None => Err(OperantError::LinkClosed),
        }
    }

    /// Set the value returned by pull reads of a component
    pub fn set_polled(&self, component: &ComponentId, value: Value) {
        self.shared
            .device
            .lock()
            .polled
            .insert(component.clone(), value);
    }

    /// Every write received, in order
    pub fn writes(&self) -> Vec<(ComponentId, Value)> {
        self.shared.device.lock().writes.clone()
    }

    /// Block until at least `count` writes arrived, or `timeout` passes
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut device = self.shared.device.lock();
        while device.writes.len() < count {
            if self.shared.changed.wait_until(&mut device, deadline).timed_out() {
                return device.writes.len() >= count;
            }
        }
        true
    }

    pub fn registered(&self) -> Vec<ComponentId> {
        self.shared.device.lock().registered.keys().cloned().collect()
    }

    /// Reads and writes of `component` fail from now on
    pub fn fail_component(&self, component: &ComponentId, detail: impl Into<String>) {
        self.shared
            .device
            .lock()
            .failing
            .insert(component.clone(), detail.into());
    }

    /// Registering `component` fails from now on
    pub fn reject_registration(&self, component: &ComponentId, detail: impl Into<String>) {
        self.shared
            .device
            .lock()
            .rejected
            .insert(component.clone(), detail.into());
    }

    /// Clear injected faults and registration rejections of `component`
    pub fn heal_component(&self, component: &ComponentId) {
        let mut device = self.shared.device.lock();
        device.failing.remove(component);
        device.rejected.remove(component);
    }

    /// The next read or write fails fatally
    pub fn fail_fatal(&self, detail: impl Into<String>) {
        self.shared.device.lock().fatal = Some(detail.into());
    }

    /// Report a fatal fault straight away, as a device worker thread would
    pub fn crash(&self, detail: impl Into<String>) -> OperantResult<()> {
        let link = self.shared.device.lock().link.clone();
        match link {
            Some(link) => link.report_fault(SourceFault::fatal(detail)),
            None => Err(OperantError::LinkClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.device.lock().closed
    }

    /// Block until the source was closed, or `timeout` passes
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut device = self.shared.device.lock();
        while !device.closed {
            if self.shared.changed.wait_until(&mut device, deadline).timed_out() {
                return device.closed;
            }
        }
        true
    }
}

/// In-memory source backed by a `VirtualHardware` handle
pub struct VirtualSource {
    hardware: VirtualHardware,
    echo_writes: bool,
}

impl VirtualSource {
    pub fn new() -> (Self, VirtualHardware) {
        let hardware = VirtualHardware::default();
        (Self::attach(hardware.clone()), hardware)
    }

    /// Source side for an existing hardware handle
    pub fn attach(hardware: VirtualHardware) -> Self {
        VirtualSource {
            hardware,
            echo_writes: false,
        }
    }

    /// Configure from source metadata (`echo_writes`)
    pub fn with_metadata(mut self, metadata: &Metadata) -> Self {
        if let Some(echo) = metadata.get("echo_writes").and_then(Value::as_bool) {
            self.echo_writes = echo;
        }
        self
    }

    /// Report every write back as an input update (loopback wiring)
    pub fn echo_writes(mut self, echo: bool) -> Self {
        self.echo_writes = echo;
        self
    }

    fn check(device: &mut Device, component: &ComponentId) -> SourceResult<()> {
        if let Some(detail) = device.fatal.take() {
            return Err(SourceFault::fatal(detail));
        }
        if let Some(detail) = device.failing.get(component) {
            return Err(SourceFault::component(component, detail.clone()));
        }
        Ok(())
    }
}

impl Source for VirtualSource {
    fn metadata_defaults(&self) -> Metadata {
        let mut defaults = Metadata::new();
        defaults.insert("echo_writes".into(), Value::Bool(false));
        defaults
    }

    fn initialize(&mut self, link: SourceLink) -> SourceResult<()> {
        self.hardware.shared.device.lock().link = Some(link);
        Ok(())
    }

    fn register_component(
        &mut self,
        component: &ComponentId,
        kind: ComponentKind,
        address: &str,
        _metadata: &Metadata,
    ) -> SourceResult<()> {
        let mut device = self.hardware.shared.device.lock();
        if let Some(detail) = device.rejected.get(component) {
            return Err(SourceFault::component(component, detail.clone()));
        }
        device
            .registered
            .insert(component.clone(), (kind, address.to_string()));
        Ok(())
    }

    fn read_component(&mut self, component: &ComponentId) -> SourceResult<Option<Value>> {
        let mut device = self.hardware.shared.device.lock();
        Self::check(&mut device, component)?;
        Ok(device.polled.get(component).cloned())
    }

    fn write_component(&mut self, component: &ComponentId, value: &Value) -> SourceResult<()> {
        let link = {
            let mut device = self.hardware.shared.device.lock();
            Self::check(&mut device, component)?;
            device.writes.push((component.clone(), value.clone()));
            self.hardware.shared.changed.notify_all();
            device.link.clone()
        };

        if self.echo_writes {
            if let Some(link) = link {
                link.update_component(component, value.clone(), Metadata::new())
                    .map_err(|e| SourceFault::component(component, e.to_string()))?;
            }
        }
        Ok(())
    }

    fn close_component(&mut self, component: &ComponentId) -> SourceResult<()> {
        self.hardware
            .shared
            .device
            .lock()
            .registered
            .remove(component);
        Ok(())
    }

    fn close_source(&mut self) {
        let mut device = self.hardware.shared.device.lock();
        device.closed = true;
        device.registered.clear();
        // Drop the outbound link so the task process sees the channel close
        device.link = None;
        self.hardware.shared.changed.notify_all();
    }
}
