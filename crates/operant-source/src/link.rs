//! Source link - the way back into the task process
//!
//! A source never calls into the task process. Updates and faults are
//! encoded onto the source's outbound link, from whichever thread observed
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use operant_core::{
    ChamberId, ComponentId, Event, EventKind, Metadata, OperantError, OperantResult, SourceId, Value,
};
use operant_wire::{LinkSender, Outlet};

use crate::SourceFault;

/// Routing entry for a served component. Never ownership.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub chamber: Option<ChamberId>,
    pub address: String,
}

/// Components a source currently serves: id -> route
pub type Routes = Arc<RwLock<HashMap<ComponentId, Route>>>;

/// Cloneable handle for reporting from a source or its workers
#[derive(Clone, Debug)]
pub struct SourceLink {
    source: SourceId,
    routes: Routes,
    outlet: LinkSender,
    failed: Arc<AtomicBool>,
}

impl SourceLink {
    pub(crate) fn new(source: SourceId, routes: Routes, outlet: LinkSender) -> Self {
        SourceLink {
            source,
            routes,
            outlet,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source
    }

    /// Chamber owning a served component
    pub fn chamber_of(&self, component: &ComponentId) -> Option<ChamberId> {
        self.routes.read().get(component).and_then(|r| r.chamber)
    }

    pub fn address_of(&self, component: &ComponentId) -> Option<String> {
        self.routes.read().get(component).map(|r| r.address.clone())
    }

    pub fn is_served(&self, component: &ComponentId) -> bool {
        self.routes.read().contains_key(component)
    }

    /// Report a new value for a served component
    pub fn update_component(
        &self,
        component: &ComponentId,
        value: Value,
        metadata: Metadata,
    ) -> OperantResult<()> {
        let route = self
            .routes
            .read()
            .get(component)
            .cloned()
            .ok_or_else(|| OperantError::ComponentNotFound(component.to_string()))?;

        let event = Event {
            chamber: route.chamber,
            kind: EventKind::ComponentUpdate {
                component: component.clone(),
                value,
            },
            metadata,
        };
        self.outlet.send_events(&[event])
    }

    /// Report a fault. A fatal fault also stops the hosting thread.
    pub fn report_fault(&self, fault: SourceFault) -> OperantResult<()> {
        let event = self.fault_event(&fault);
        if fault.is_fatal() {
            self.failed.store(true, Ordering::SeqCst);
        }
        self.outlet.send_events(&[event])
    }

    /// Report a component the source refused to register
    pub(crate) fn report_register_failure(
        &self,
        chamber: Option<ChamberId>,
        component: &ComponentId,
        detail: &str,
    ) -> OperantResult<()> {
        let err = OperantError::ComponentRegister(format!(
            "{} on source {}: {}",
            component, self.source, detail
        ));
        self.outlet
            .send_events(&[Event::source_error(chamber, &self.source, &err)])
    }

    pub(crate) fn fault_event(&self, fault: &SourceFault) -> Event {
        match fault {
            SourceFault::Component { component, detail } => {
                let err = OperantError::SourceNonFatal {
                    source_id: self.source.clone(),
                    component: component.clone(),
                    detail: detail.clone(),
                };
                Event::error(self.chamber_of(component), &err)
            }
            SourceFault::Fatal(detail) => {
                let err = OperantError::SourceFatal {
                    source_id: self.source.clone(),
                    detail: detail.clone(),
                };
                Event::error(None, &err)
            }
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn outlet(&self) -> &LinkSender {
        &self.outlet
    }
}
