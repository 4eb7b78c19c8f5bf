//! Source process - hosts one `Source` on a dedicated thread
//!
//! The host is two pieces: a message handler that turns commands from the
//! task process into `Source` calls, and a lifecycle that initializes the
//! source, alternates between waiting for commands and polling pull-based
//! components, and closes the source on exit or fatal fault.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use operant_core::{
    ChamberId, ComponentId, Event, EventKind, OperantError, OperantResult, SourceId, Value,
};
use operant_wire::{decode, LinkReceiver, LinkSender, Outlet};

use crate::{Route, Routes, Source, SourceFault, SourceLink};

/// Source host configuration
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Interval between reads of pull-based components
    pub poll_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Handle on a running source thread
#[derive(Debug)]
pub struct SourceProcess {
    id: SourceId,
    available: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SourceProcess {
    /// Spawn a thread hosting `source`.
    ///
    /// Commands arrive on `inbound`; updates and faults leave on `outbound`.
    pub fn spawn(
        id: SourceId,
        source: Box<dyn Source>,
        config: SourceConfig,
        inbound: LinkReceiver,
        outbound: LinkSender,
    ) -> OperantResult<Self> {
        let available = Arc::new(AtomicBool::new(true));
        let routes: Routes = Arc::default();
        let host = Host {
            link: SourceLink::new(id.clone(), routes.clone(), outbound),
            routes,
            source,
            last_read: HashMap::new(),
        };

        let flag = available.clone();
        let thread = thread::Builder::new()
            .name(format!("operant-source-{}", id))
            .spawn(move || {
                lifecycle(host, config, inbound);
                flag.store(false, Ordering::SeqCst);
            })?;

        Ok(SourceProcess {
            id,
            available,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    /// False once the thread has exited
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Wait for the thread to exit. Send `CloseSource` first.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(source = %self.id, "source thread panicked");
            }
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

struct Host {
    source: Box<dyn Source>,
    link: SourceLink,
    routes: Routes,
    /// Last pulled value per component, to report changes only
    last_read: HashMap<ComponentId, Value>,
}

impl Host {
    /// Message handler: one command from the task process
    fn handle_message(&mut self, event: Event) -> Flow {
        let result = match event.kind {
            EventKind::ComponentRegister {
                component,
                kind,
                address,
            } => {
                self.routes.write().insert(
                    component.clone(),
                    Route {
                        chamber: event.chamber,
                        address: address.clone(),
                    },
                );
                match self
                    .source
                    .register_component(&component, kind, &address, &event.metadata)
                {
                    Ok(()) => {
                        debug!(source = %self.link.source_id(), component = %component, address = %address, "component registered");
                        Ok(())
                    }
                    Err(SourceFault::Component { detail, .. }) => {
                        return self.register_failed(event.chamber, &component, &detail);
                    }
                    Err(fatal) => Err(fatal),
                }
            }
            EventKind::ComponentWrite { component, value } => {
                if self.link.is_served(&component) {
                    self.source.write_component(&component, &value)
                } else {
                    Err(SourceFault::component(&component, "write to unregistered component"))
                }
            }
            EventKind::ComponentClose { component } => {
                self.routes.write().remove(&component);
                self.last_read.remove(&component);
                self.source.close_component(&component)
            }
            EventKind::CloseSource => return Flow::Exit,
            other => {
                debug!(source = %self.link.source_id(), event = other.event_type().name(), "ignored by source");
                Ok(())
            }
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(fault) => self.fault(fault),
        }
    }

    /// Read pull-based components and report changed values as one batch
    fn poll(&mut self) -> Flow {
        let served: BTreeMap<ComponentId, Route> = self
            .routes
            .read()
            .iter()
            .map(|(id, route)| (id.clone(), route.clone()))
            .collect();

        let mut updates = Vec::new();
        for (id, route) in served {
            match self.source.read_component(&id) {
                Ok(Some(value)) => {
                    if self.last_read.get(&id) != Some(&value) {
                        self.last_read.insert(id.clone(), value.clone());
                        updates.push(Event {
                            chamber: route.chamber,
                            kind: EventKind::ComponentUpdate {
                                component: id,
                                value,
                            },
                            metadata: Default::default(),
                        });
                    }
                }
                Ok(None) => {}
                Err(fault) => {
                    if let Flow::Exit = self.fault(fault) {
                        return Flow::Exit;
                    }
                }
            }
        }

        match self.link.outlet().send_events(&updates) {
            Ok(()) => Flow::Continue,
            Err(OperantError::LinkClosed) => {
                warn!(source = %self.link.source_id(), "task process gone");
                Flow::Exit
            }
            Err(e) => {
                warn!(source = %self.link.source_id(), error = %e, dropped = updates.len(), "readings not sent");
                Flow::Continue
            }
        }
    }

    /// A rejected registration leaves the component unserved and blocks its chamber
    fn register_failed(
        &mut self,
        chamber: Option<ChamberId>,
        component: &ComponentId,
        detail: &str,
    ) -> Flow {
        self.routes.write().remove(component);
        warn!(source = %self.link.source_id(), component = %component, detail, "component registration rejected");
        if let Err(e) = self.link.report_register_failure(chamber, component, detail) {
            warn!(source = %self.link.source_id(), error = %e, "fault not delivered");
            return Flow::Exit;
        }
        Flow::Continue
    }

    fn fault(&mut self, fault: SourceFault) -> Flow {
        let source = self.link.source_id().clone();
        if fault.is_fatal() {
            error!(source = %source, fault = %fault, "source fatal");
        } else {
            warn!(source = %source, fault = %fault, "source component fault");
        }

        let fatal = fault.is_fatal();
        if let Err(e) = self.link.report_fault(fault) {
            warn!(source = %source, error = %e, "fault not delivered");
            return Flow::Exit;
        }
        if fatal {
            Flow::Exit
        } else {
            Flow::Continue
        }
    }

    fn close(&mut self) {
        self.source.close_source();
        self.routes.write().clear();
        info!(source = %self.link.source_id(), "source closed");
    }
}

/// Lifecycle: initialize, serve until exit or fatal fault, close
fn lifecycle(mut host: Host, config: SourceConfig, inbound: LinkReceiver) {
    if let Err(fault) = host.source.initialize(host.link.clone()) {
        // An initialization failure is always fatal for the source
        let fault = match fault {
            SourceFault::Component { component, detail } => {
                SourceFault::fatal(format!("initialize: {}: {}", component, detail))
            }
            fatal => fatal,
        };
        host.fault(fault);
        host.close();
        return;
    }
    info!(source = %host.link.source_id(), "source initialized");

    loop {
        if host.link.has_failed() {
            break;
        }

        match inbound.recv_timeout(config.poll_interval) {
            Ok(batch) => match decode(&batch) {
                Ok(events) => {
                    let mut exit = false;
                    for event in events {
                        if let Flow::Exit = host.handle_message(event) {
                            exit = true;
                            break;
                        }
                    }
                    if exit {
                        break;
                    }
                }
                Err(e) => {
                    warn!(source = %host.link.source_id(), error = %e, "undecodable command batch");
                }
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Flow::Exit = host.poll() {
            break;
        }
    }

    host.close();
}
