//! Source contract

use thiserror::Error;

use operant_core::{ComponentId, ComponentKind, Metadata, Value};

use crate::SourceLink;

/// Hardware failure reported by a source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceFault {
    /// One component failed; only its chamber is halted
    #[error("component {component}: {detail}")]
    Component {
        component: ComponentId,
        detail: String,
    },

    /// The interface itself is gone; the source shuts down
    #[error("{0}")]
    Fatal(String),
}

impl SourceFault {
    pub fn component(component: &ComponentId, detail: impl Into<String>) -> Self {
        SourceFault::Component {
            component: component.clone(),
            detail: detail.into(),
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        SourceFault::Fatal(detail.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceFault::Fatal(_))
    }
}

pub type SourceResult<T> = Result<T, SourceFault>;

/// One hardware interface, hosted on a dedicated thread.
///
/// Methods are only called from the hosting thread. A source that needs a
/// blocking device loop runs it on its own worker thread and reports back
/// through the `SourceLink` handed to `initialize`.
pub trait Source: Send + 'static {
    /// Configuration keys this source understands, with their defaults
    fn metadata_defaults(&self) -> Metadata {
        Metadata::new()
    }

    fn initialize(&mut self, link: SourceLink) -> SourceResult<()>;

    fn register_component(
        &mut self,
        component: &ComponentId,
        kind: ComponentKind,
        address: &str,
        metadata: &Metadata,
    ) -> SourceResult<()>;

    /// Pull a reading. `Ok(None)` for push-based components.
    fn read_component(&mut self, _component: &ComponentId) -> SourceResult<Option<Value>> {
        Ok(None)
    }

    fn write_component(&mut self, component: &ComponentId, value: &Value) -> SourceResult<()>;

    fn close_component(&mut self, component: &ComponentId) -> SourceResult<()>;

    fn close_source(&mut self);
}
