//! Registry of task, source, and logger constructors
//!
//! Everything the task process can build is registered by name at startup.
//! Nothing is discovered at run time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use operant_core::{ChamberId, Metadata, OperantError, OperantResult, SourceId, Value};
use operant_source::{Source, VirtualHardware, VirtualSource};
use operant_task::{ChamberTask, Machine, Task, TaskSetup};

use crate::{JsonLinesLogger, Logger};

pub type TaskFactory = Box<dyn Fn(TaskSetup) -> OperantResult<Box<dyn ChamberTask>> + Send>;
pub type SourceFactory = Box<dyn Fn(&SourceId, &Metadata) -> OperantResult<Box<dyn Source>> + Send>;
pub type LoggerFactory = Box<dyn Fn(ChamberId, &Metadata) -> OperantResult<Box<dyn Logger>> + Send>;

/// Device sides of the `virtual` sources a registry built, by source id.
/// Cloning shares the table, so it stays reachable once the registry has
/// moved into the task process.
#[derive(Clone, Default)]
pub struct VirtualDevices {
    devices: Arc<Mutex<BTreeMap<SourceId, VirtualHardware>>>,
}

impl VirtualDevices {
    pub fn get(&self, id: &SourceId) -> Option<VirtualHardware> {
        self.devices.lock().get(id).cloned()
    }

    fn insert(&self, id: &SourceId, hardware: VirtualHardware) {
        self.devices.lock().insert(id.clone(), hardware);
    }
}

#[derive(Default)]
pub struct Registry {
    tasks: BTreeMap<String, TaskFactory>,
    sources: BTreeMap<String, SourceFactory>,
    loggers: BTreeMap<String, LoggerFactory>,
    devices: VirtualDevices,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `virtual` source and `jsonl` logger.
    ///
    /// The device side of each `virtual` source is kept in `virtual_devices`.
    pub fn with_builtins() -> Self {
        let mut registry = Registry::new();
        let devices = registry.devices.clone();
        registry.register_source("virtual", move |id, metadata| {
            let (source, hardware) = VirtualSource::new();
            devices.insert(id, hardware);
            Ok(Box::new(source.with_metadata(metadata)) as Box<dyn Source>)
        });
        registry.register_logger("jsonl", |chamber, metadata| {
            let path = metadata
                .get("log_path")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("chamber-{}.jsonl", chamber));
            Ok(Box::new(JsonLinesLogger::create(path)?) as Box<dyn Logger>)
        });
        registry
    }

    /// Device sides of built `virtual` sources
    pub fn virtual_devices(&self) -> VirtualDevices {
        self.devices.clone()
    }

    /// Register task type `T` under `name`
    pub fn register_task<T: Task>(&mut self, name: impl Into<String>) -> &mut Self {
        self.tasks.insert(
            name.into(),
            Box::new(|setup| Ok(Box::new(Machine::<T>::new(setup)?) as Box<dyn ChamberTask>)),
        );
        self
    }

    pub fn register_source<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&SourceId, &Metadata) -> OperantResult<Box<dyn Source>> + Send + 'static,
    {
        self.sources.insert(name.into(), Box::new(factory));
        self
    }

    pub fn register_logger<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(ChamberId, &Metadata) -> OperantResult<Box<dyn Logger>> + Send + 'static,
    {
        self.loggers.insert(name.into(), Box::new(factory));
        self
    }

    pub fn build_task(&self, setup: TaskSetup) -> OperantResult<Box<dyn ChamberTask>> {
        let factory = self
            .tasks
            .get(&setup.task_type)
            .ok_or_else(|| OperantError::UnknownTaskType(setup.task_type.clone()))?;
        factory(setup)
    }

    pub fn build_source(
        &self,
        source_type: &str,
        id: &SourceId,
        metadata: &Metadata,
    ) -> OperantResult<Box<dyn Source>> {
        let factory = self
            .sources
            .get(source_type)
            .ok_or_else(|| OperantError::UnknownSourceType(source_type.to_string()))?;
        factory(id, metadata)
    }

    pub fn build_logger(
        &self,
        logger_type: &str,
        chamber: ChamberId,
        metadata: &Metadata,
    ) -> OperantResult<Box<dyn Logger>> {
        let factory = self
            .loggers
            .get(logger_type)
            .ok_or_else(|| OperantError::UnknownLoggerType(logger_type.to_string()))?;
        factory(chamber, metadata)
    }

    pub fn task_types(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    pub fn source_types(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    pub fn logger_types(&self) -> Vec<&str> {
        self.loggers.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.task_types())
            .field("sources", &self.source_types())
            .field("loggers", &self.logger_types())
            .finish()
    }
}
