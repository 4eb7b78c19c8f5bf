//! Loggers - durable record of what each chamber did
//!
//! A logger sees a formatted projection of the chamber's events, one batch
//! per reactor tick, independent of where the records end up.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use operant_core::{ChamberId, Event, EventKind, Metadata, OperantError, OperantResult, Value};
use operant_task::ChamberTask;

/// One logged event
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoggerEvent {
    pub chamber: ChamberId,
    pub event_type: &'static str,
    /// State entered or left, otherwise the state the task was in
    pub state: Option<String>,
    pub component: Option<String>,
    pub value: Option<Value>,
    /// Task time since start, pauses excluded
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub metadata: Metadata,
}

impl LoggerEvent {
    /// Project a chamber event; `None` for process-global events
    pub fn project(event: &Event, task: Option<&dyn ChamberTask>) -> Option<Self> {
        let chamber = event.chamber?;
        let current = task.and_then(|t| t.state_name()).map(str::to_string);
        let mut metadata = event.metadata.clone();

        let (state, component, value) = match &event.kind {
            EventKind::StateEnter { state } | EventKind::StateExit { state } => {
                let name = task
                    .and_then(|t| t.name_of_state(*state))
                    .map(str::to_string)
                    .unwrap_or_else(|| state.to_string());
                (Some(name), None, None)
            }
            EventKind::ComponentChanged { component, .. } => {
                let value = task.and_then(|t| {
                    t.components()
                        .iter()
                        .find(|c| &c.id == component)
                        .map(|c| c.state.clone())
                });
                (current, Some(component.to_string()), value)
            }
            EventKind::ComponentWrite { component, value } => {
                (current, Some(component.to_string()), Some(value.clone()))
            }
            EventKind::Timeout { name } => {
                metadata.insert("timeout".into(), Value::Text(name.clone()));
                (current, None, None)
            }
            EventKind::Error {
                kind,
                detail,
                source,
            } => {
                metadata.insert("error_kind".into(), Value::Text(kind.to_string()));
                metadata.insert("detail".into(), Value::Text(detail.clone()));
                if let Some(source) = source {
                    metadata.insert("source".into(), Value::Text(source.to_string()));
                }
                (current, None, None)
            }
            _ => (current, None, None),
        };

        Some(LoggerEvent {
            chamber,
            event_type: event.event_type().name(),
            state,
            component,
            value,
            elapsed: task.map(|t| t.time_elapsed()).unwrap_or_default(),
            metadata,
        })
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Storage for one chamber's log
pub trait Logger: Send {
    /// The chamber's task started
    fn start(&mut self) -> OperantResult<()> {
        Ok(())
    }

    /// The chamber's task stopped or completed
    fn stop(&mut self) -> OperantResult<()> {
        Ok(())
    }

    fn log_events(&mut self, events: &[LoggerEvent]) -> OperantResult<()>;

    /// Release the storage; nothing is logged afterwards
    fn close(&mut self) -> OperantResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    events: Vec<LoggerEvent>,
    starts: usize,
    stops: usize,
    closed: bool,
}

/// Logger keeping records in memory. Clones share the same records.
#[derive(Clone, Debug, Default)]
pub struct MemoryLogger {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoggerEvent> {
        self.log.lock().events.clone()
    }

    /// Logged event type names, in order
    pub fn event_types(&self) -> Vec<&'static str> {
        self.log.lock().events.iter().map(|e| e.event_type).collect()
    }

    pub fn starts(&self) -> usize {
        self.log.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.log.lock().stops
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }
}

impl Logger for MemoryLogger {
    fn start(&mut self) -> OperantResult<()> {
        self.log.lock().starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> OperantResult<()> {
        self.log.lock().stops += 1;
        Ok(())
    }

    fn log_events(&mut self, events: &[LoggerEvent]) -> OperantResult<()> {
        let mut log = self.log.lock();
        if log.closed {
            return Err(OperantError::Io("memory logger is closed".into()));
        }
        log.events.extend_from_slice(events);
        Ok(())
    }

    fn close(&mut self) -> OperantResult<()> {
        self.log.lock().closed = true;
        Ok(())
    }
}

/// Logger writing one JSON object per line
pub struct JsonLinesLogger<W: Write + Send> {
    writer: W,
}

impl JsonLinesLogger<BufWriter<File>> {
    /// Append to the file at `path`, creating it if needed
    pub fn create(path: impl AsRef<Path>) -> OperantResult<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(JsonLinesLogger::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesLogger<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesLogger { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Logger for JsonLinesLogger<W> {
    fn stop(&mut self) -> OperantResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn log_events(&mut self, events: &[LoggerEvent]) -> OperantResult<()> {
        for event in events {
            serde_json::to_writer(&mut self.writer, event)
                .map_err(|e| OperantError::Io(e.to_string()))?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn close(&mut self) -> OperantResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
