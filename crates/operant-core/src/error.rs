//! Error types for the task-execution engine

use std::fmt;

use thiserror::Error;

use crate::{ChamberId, ComponentId, ComponentKind, SourceId, StateId};

/// Core engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperantError {
    // Startup errors (chamber-scoped)
    #[error("Component registration failed: {0}")]
    ComponentRegister(String),

    #[error("Invalid component type for '{component}': expected {expected}, got {actual}")]
    InvalidComponentType {
        component: String,
        expected: ComponentKind,
        actual: ComponentKind,
    },

    #[error("Malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("Malformed address file: {0}")]
    MalformedAddressFile(String),

    // Source errors
    #[error("Source unavailable: {0}")]
    SourceUnavailable(SourceId),

    #[error("Source {source_id} failed: {detail}")]
    SourceFatal { source_id: SourceId, detail: String },

    #[error("Source {source_id} component {component} failed: {detail}")]
    SourceNonFatal {
        source_id: SourceId,
        component: ComponentId,
        detail: String,
    },

    #[error("Source not found: {0}")]
    SourceNotFound(SourceId),

    // Wire errors
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Link closed")]
    LinkClosed,

    // Lookup errors
    #[error("No task in chamber {0}")]
    ChamberNotFound(ChamberId),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("No handler for state {0:?}")]
    UnknownState(StateId),

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Unknown source type: {0}")]
    UnknownSourceType(String),

    #[error("Unknown logger type: {0}")]
    UnknownLoggerType(String),

    // Process errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Unhandled error: {0}")]
    Unhandled(String),
}

impl OperantError {
    /// Classify this error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperantError::ComponentRegister(_) => ErrorKind::ComponentRegister,
            OperantError::InvalidComponentType { .. } => ErrorKind::InvalidComponentType,
            OperantError::MalformedProtocol(_) => ErrorKind::MalformedProtocol,
            OperantError::MalformedAddressFile(_) => ErrorKind::MalformedAddressFile,
            OperantError::SourceUnavailable(_) | OperantError::SourceNotFound(_) => {
                ErrorKind::SourceUnavailable
            }
            OperantError::SourceFatal { .. } => ErrorKind::SourceFatal,
            OperantError::SourceNonFatal { .. } => ErrorKind::SourceNonFatal,
            OperantError::Decode(_) => ErrorKind::Decode,
            OperantError::Encode(_)
            | OperantError::LinkClosed
            | OperantError::ChamberNotFound(_)
            | OperantError::ComponentNotFound(_)
            | OperantError::UnknownState(_)
            | OperantError::UnknownTaskType(_)
            | OperantError::UnknownSourceType(_)
            | OperantError::UnknownLoggerType(_)
            | OperantError::Config(_)
            | OperantError::Io(_)
            | OperantError::Unhandled(_) => ErrorKind::Unhandled,
        }
    }

    /// Source this error is attributed to, if any
    pub fn source_id(&self) -> Option<&SourceId> {
        match self {
            OperantError::SourceUnavailable(id)
            | OperantError::SourceNotFound(id)
            | OperantError::SourceFatal { source_id: id, .. }
            | OperantError::SourceNonFatal { source_id: id, .. } => Some(id),
            _ => None,
        }
    }
}

impl From<std::io::Error> for OperantError {
    fn from(err: std::io::Error) -> Self {
        OperantError::Io(err.to_string())
    }
}

/// Result type for engine operations
pub type OperantResult<T> = Result<T, OperantError>;

/// Wire decode failures. Decoding never panics; every malformed input maps here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown event type: {0:#04x}")]
    UnknownEventType(u8),

    #[error("Unknown value tag: {0:#04x}")]
    UnknownValueTag(u8),

    #[error("Unknown error kind: {0:#04x}")]
    UnknownErrorKind(u8),

    #[error("Invalid component kind bits: {0:#010b}")]
    InvalidComponentKind(u8),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Field too large: {len} > {max}")]
    FieldTooLarge { len: usize, max: usize },

    #[error("Nesting too deep")]
    NestingTooDeep,

    #[error("Trailing bytes after batch: {0}")]
    TrailingBytes(usize),

    #[error("Frame too large: {0}")]
    FrameTooLarge(usize),
}

/// Wire encode failures: input the decoder would refuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Field too large: {len} > {max}")]
    FieldTooLarge { len: usize, max: usize },

    #[error("Too many events in one batch: {count} > {max}")]
    TooManyEvents { count: usize, max: usize },

    #[error("Count exceeds the wire limit: {0}")]
    CountOverflow(usize),

    #[error("Nesting too deep")]
    NestingTooDeep,
}

/// Error classification carried by `Error` events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    ComponentRegister = 0x01,
    InvalidComponentType = 0x02,
    MalformedProtocol = 0x03,
    MalformedAddressFile = 0x04,
    SourceUnavailable = 0x05,
    SourceFatal = 0x06,
    SourceNonFatal = 0x07,
    Decode = 0x08,
    Unhandled = 0x09,
}

/// What an error takes down with it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorScope {
    /// One chamber's task is halted or cannot start
    Chamber,
    /// One component inside a source; its chamber is halted
    Component,
    /// A whole source is removed
    Source,
    /// Reported against the process, nothing is halted
    Process,
}

impl ErrorKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(ErrorKind::ComponentRegister),
            0x02 => Some(ErrorKind::InvalidComponentType),
            0x03 => Some(ErrorKind::MalformedProtocol),
            0x04 => Some(ErrorKind::MalformedAddressFile),
            0x05 => Some(ErrorKind::SourceUnavailable),
            0x06 => Some(ErrorKind::SourceFatal),
            0x07 => Some(ErrorKind::SourceNonFatal),
            0x08 => Some(ErrorKind::Decode),
            0x09 => Some(ErrorKind::Unhandled),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::SourceFatal)
    }

    pub fn scope(self) -> ErrorScope {
        match self {
            ErrorKind::ComponentRegister
            | ErrorKind::InvalidComponentType
            | ErrorKind::MalformedProtocol
            | ErrorKind::MalformedAddressFile
            | ErrorKind::SourceUnavailable => ErrorScope::Chamber,
            ErrorKind::SourceNonFatal => ErrorScope::Component,
            ErrorKind::SourceFatal => ErrorScope::Source,
            ErrorKind::Decode | ErrorKind::Unhandled => ErrorScope::Process,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ComponentRegister => "Component Register",
            ErrorKind::InvalidComponentType => "Invalid Component Type",
            ErrorKind::MalformedProtocol => "Malformed Protocol",
            ErrorKind::MalformedAddressFile => "Malformed Address File",
            ErrorKind::SourceUnavailable => "Source Unavailable",
            ErrorKind::SourceFatal => "Source Fatal",
            ErrorKind::SourceNonFatal => "Source Non-Fatal",
            ErrorKind::Decode => "Decode",
            ErrorKind::Unhandled => "Unhandled",
        };
        f.write_str(name)
    }
}
