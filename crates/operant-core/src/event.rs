//! Event definitions
//!
//! Events are the only thing that crosses a process boundary. Every event
//! belongs to a chamber except the process-global ones (sources, exit).
//! The set is closed: consumers match exhaustively, and new variants must
//! take a fresh type byte.

use crate::{
    ChamberId, ComponentBinding, ComponentId, ComponentKind, ErrorKind, Metadata, OperantError,
    SourceId, StateId, Value,
};

/// Event type classification (wire tag)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    // Control events
    Start = 0x01,
    Stop = 0x02,
    Pause = 0x03,
    Resume = 0x04,
    Init = 0x05,
    Clear = 0x06,
    Exit = 0x07,

    // Process events
    AddTask = 0x10,
    AddSource = 0x11,
    RemoveSource = 0x12,

    // Component events
    ComponentUpdate = 0x20,
    ComponentChanged = 0x21,
    ComponentRegister = 0x22,
    ComponentWrite = 0x23,
    ComponentClose = 0x24,
    CloseSource = 0x25,

    // State events
    StateEnter = 0x30,
    StateExit = 0x31,
    TaskComplete = 0x32,

    // Timing events
    Timeout = 0x40,
    Heartbeat = 0x41,

    // Error events
    Error = 0x50,
}

impl EventType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(EventType::Start),
            0x02 => Some(EventType::Stop),
            0x03 => Some(EventType::Pause),
            0x04 => Some(EventType::Resume),
            0x05 => Some(EventType::Init),
            0x06 => Some(EventType::Clear),
            0x07 => Some(EventType::Exit),
            0x10 => Some(EventType::AddTask),
            0x11 => Some(EventType::AddSource),
            0x12 => Some(EventType::RemoveSource),
            0x20 => Some(EventType::ComponentUpdate),
            0x21 => Some(EventType::ComponentChanged),
            0x22 => Some(EventType::ComponentRegister),
            0x23 => Some(EventType::ComponentWrite),
            0x24 => Some(EventType::ComponentClose),
            0x25 => Some(EventType::CloseSource),
            0x30 => Some(EventType::StateEnter),
            0x31 => Some(EventType::StateExit),
            0x32 => Some(EventType::TaskComplete),
            0x40 => Some(EventType::Timeout),
            0x41 => Some(EventType::Heartbeat),
            0x50 => Some(EventType::Error),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Human-readable name, used by loggers
    pub fn name(self) -> &'static str {
        match self {
            EventType::Start => "Start",
            EventType::Stop => "Stop",
            EventType::Pause => "Pause",
            EventType::Resume => "Resume",
            EventType::Init => "Init",
            EventType::Clear => "Clear",
            EventType::Exit => "Exit",
            EventType::AddTask => "AddTask",
            EventType::AddSource => "AddSource",
            EventType::RemoveSource => "RemoveSource",
            EventType::ComponentUpdate => "ComponentUpdate",
            EventType::ComponentChanged => "ComponentChanged",
            EventType::ComponentRegister => "ComponentRegister",
            EventType::ComponentWrite => "ComponentWrite",
            EventType::ComponentClose => "ComponentClose",
            EventType::CloseSource => "CloseSource",
            EventType::StateEnter => "StateEnter",
            EventType::StateExit => "StateExit",
            EventType::TaskComplete => "TaskComplete",
            EventType::Timeout => "Timeout",
            EventType::Heartbeat => "Heartbeat",
            EventType::Error => "Error",
        }
    }
}

/// Event payload
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    Start,
    Stop,
    Pause,
    Resume,
    Init,
    Clear {
        delete_loggers: bool,
    },
    Exit,
    AddTask {
        task_type: String,
        bindings: Vec<ComponentBinding>,
        constants: Metadata,
    },
    AddSource {
        source: SourceId,
        source_type: String,
    },
    RemoveSource {
        source: SourceId,
    },
    /// Source -> task process: a component reported a value
    ComponentUpdate {
        component: ComponentId,
        value: Value,
    },
    /// Raised locally when an update changed the cached value
    ComponentChanged {
        component: ComponentId,
        slot: u16,
    },
    /// Task process -> source commands
    ComponentRegister {
        component: ComponentId,
        kind: ComponentKind,
        address: String,
    },
    ComponentWrite {
        component: ComponentId,
        value: Value,
    },
    ComponentClose {
        component: ComponentId,
    },
    CloseSource,
    StateEnter {
        state: StateId,
    },
    StateExit {
        state: StateId,
    },
    TaskComplete,
    Timeout {
        name: String,
    },
    Heartbeat,
    Error {
        kind: ErrorKind,
        detail: String,
        source: Option<SourceId>,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::Start => EventType::Start,
            EventKind::Stop => EventType::Stop,
            EventKind::Pause => EventType::Pause,
            EventKind::Resume => EventType::Resume,
            EventKind::Init => EventType::Init,
            EventKind::Clear { .. } => EventType::Clear,
            EventKind::Exit => EventType::Exit,
            EventKind::AddTask { .. } => EventType::AddTask,
            EventKind::AddSource { .. } => EventType::AddSource,
            EventKind::RemoveSource { .. } => EventType::RemoveSource,
            EventKind::ComponentUpdate { .. } => EventType::ComponentUpdate,
            EventKind::ComponentChanged { .. } => EventType::ComponentChanged,
            EventKind::ComponentRegister { .. } => EventType::ComponentRegister,
            EventKind::ComponentWrite { .. } => EventType::ComponentWrite,
            EventKind::ComponentClose { .. } => EventType::ComponentClose,
            EventKind::CloseSource => EventType::CloseSource,
            EventKind::StateEnter { .. } => EventType::StateEnter,
            EventKind::StateExit { .. } => EventType::StateExit,
            EventKind::TaskComplete => EventType::TaskComplete,
            EventKind::Timeout { .. } => EventType::Timeout,
            EventKind::Heartbeat => EventType::Heartbeat,
            EventKind::Error { .. } => EventType::Error,
        }
    }

    /// Stateful events are delivered to the running task's state handler;
    /// everything else is handled by the task process itself.
    pub fn is_stateful(&self) -> bool {
        matches!(
            self,
            EventKind::ComponentChanged { .. }
                | EventKind::StateEnter { .. }
                | EventKind::StateExit { .. }
                | EventKind::Timeout { .. }
                | EventKind::Heartbeat
        )
    }
}

/// Event - one message between processes
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Owning chamber; `None` for process-global events
    pub chamber: Option<ChamberId>,
    pub kind: EventKind,
    pub metadata: Metadata,
}

impl Event {
    /// Create a chamber-scoped event
    pub fn new(chamber: ChamberId, kind: EventKind) -> Self {
        Event {
            chamber: Some(chamber),
            kind,
            metadata: Metadata::new(),
        }
    }

    /// Create a process-global event
    pub fn global(kind: EventKind) -> Self {
        Event {
            chamber: None,
            kind,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the `Error` event reporting `err`, attributed to `chamber`
    pub fn error(chamber: Option<ChamberId>, err: &OperantError) -> Self {
        Event {
            chamber,
            kind: EventKind::Error {
                kind: err.kind(),
                detail: err.to_string(),
                source: err.source_id().cloned(),
            },
            metadata: Metadata::new(),
        }
    }

    /// `Error` event for `err`, attributed to the source that raised it
    pub fn source_error(chamber: Option<ChamberId>, source: &SourceId, err: &OperantError) -> Self {
        Event {
            chamber,
            kind: EventKind::Error {
                kind: err.kind(),
                detail: err.to_string(),
                source: Some(source.clone()),
            },
            metadata: Metadata::new(),
        }
    }

    #[inline]
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    #[inline]
    pub fn is_stateful(&self) -> bool {
        self.kind.is_stateful()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for event_type in [
            EventType::Start,
            EventType::Clear,
            EventType::AddTask,
            EventType::ComponentChanged,
            EventType::CloseSource,
            EventType::TaskComplete,
            EventType::Heartbeat,
            EventType::Error,
        ] {
            let byte = event_type.to_byte();
            let recovered = EventType::from_byte(byte).unwrap();
            assert_eq!(event_type, recovered);
        }
        assert!(EventType::from_byte(0xFF).is_none());
    }

    #[test]
    fn test_stateful_split() {
        assert!(EventKind::Heartbeat.is_stateful());
        assert!(EventKind::Timeout { name: "iti".into() }.is_stateful());
        assert!(!EventKind::Start.is_stateful());
        assert!(!EventKind::TaskComplete.is_stateful());
        assert!(!EventKind::ComponentUpdate {
            component: ComponentId::new("x"),
            value: Value::Null,
        }
        .is_stateful());
    }

    #[test]
    fn test_error_event_carries_classification() {
        let err = OperantError::SourceUnavailable(SourceId::new("whisker"));
        let event = Event::error(Some(ChamberId::new(3)), &err);

        match event.kind {
            EventKind::Error { kind, source, .. } => {
                assert_eq!(kind, ErrorKind::SourceUnavailable);
                assert_eq!(source, Some(SourceId::new("whisker")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(event.chamber, Some(ChamberId::new(3)));
    }
}
