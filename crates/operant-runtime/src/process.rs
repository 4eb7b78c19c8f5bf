//! Task process - the central reactor
//!
//! One thread owns every chamber's task. It blocks in exactly one place, a
//! multiplexed wait over the control channel, the timer channel, and one
//! channel per live source. Everything else runs to completion, and the
//! consequences of an event are fully dispatched before the next external
//! event is looked at.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{RecvError, Select, TrySendError};
use tracing::{debug, error, info, warn};

use operant_core::{
    ChamberId, ComponentBinding, ComponentId, EncodeError, ErrorKind, Event, EventKind, Metadata,
    OperantError, OperantResult, SourceId, Value,
};
use operant_source::{Source, SourceProcess};
use operant_task::{ChamberTask, TaskSetup, TimerLink};
use operant_time::{TimeoutHandle, TimeoutManager};
use operant_wire::{
    bounded_link, decode, encode_batches, link, LinkReceiver, LinkSender, Outlet,
};

use crate::{Logger, LoggerEvent, Registry, RuntimeConfig};

#[derive(Clone, Debug, Default)]
pub struct RuntimeStats {
    pub ticks: u64,
    pub heartbeats: u64,
    pub batches_in: u64,
    pub events_dispatched: u64,
    pub batches_flushed: u64,
    /// Ticks on which a full command link held batches back
    pub batches_held: u64,
    pub errors_reported: u64,
    pub decode_failures: u64,
    pub panics_contained: u64,
    pub last_tick_duration: Duration,
}

/// Channel a batch arrived on
#[derive(Clone, Debug, PartialEq)]
enum Origin {
    Control,
    Timers,
    Source(SourceId),
}

struct SourceEntry {
    commands: LinkSender,
    /// `None` once the source is no longer polled
    events: Option<LinkReceiver>,
    /// Hosting thread, for in-process sources
    process: Option<SourceProcess>,
    /// Encoded command batches the command link had no room for yet
    backlog: VecDeque<Bytes>,
}

/// Outcome of pushing a source's backlog onto its command link
enum Drain {
    Sent(u64),
    Held { sent: u64, held: usize },
    Closed,
}

impl SourceEntry {
    fn new(commands: LinkSender, events: LinkReceiver, process: Option<SourceProcess>) -> Self {
        SourceEntry {
            commands,
            events: Some(events),
            process,
            backlog: VecDeque::new(),
        }
    }

    fn is_available(&self) -> bool {
        self.events.is_some()
    }

    fn queue(&mut self, events: &[Event]) -> Result<(), EncodeError> {
        self.backlog.extend(encode_batches(events)?);
        Ok(())
    }

    /// Send queued batches in order until the link is full. Never blocks.
    fn drain(&mut self) -> Drain {
        let mut sent = 0;
        while let Some(batch) = self.backlog.pop_front() {
            match self.commands.try_send(batch) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(batch)) => {
                    self.backlog.push_front(batch);
                    return Drain::Held {
                        sent,
                        held: self.backlog.len(),
                    };
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.backlog.clear();
                    return Drain::Closed;
                }
            }
        }
        Drain::Sent(sent)
    }
}

/// The task process
pub struct TaskProcess {
    config: RuntimeConfig,
    registry: Registry,
    control: LinkReceiver,
    upstream: LinkSender,
    /// Far ends of the control and upstream links, handed out by `spawn`
    handle_ends: Option<(LinkSender, LinkReceiver)>,
    timer_events: LinkReceiver,
    timer_sink: LinkSender,
    timeouts: Option<TimeoutManager>,
    tasks: BTreeMap<ChamberId, Box<dyn ChamberTask>>,
    sources: BTreeMap<SourceId, SourceEntry>,
    /// Source threads no longer polled, joined at shutdown
    retired: Vec<SourceProcess>,
    loggers: BTreeMap<ChamberId, Vec<Box<dyn Logger>>>,
    /// Chambers with a component a source refused; they cannot start
    blocked: BTreeSet<ChamberId>,
    /// Follow-up events of the event being dispatched
    queue: VecDeque<Event>,
    outgoing: BTreeMap<SourceId, Vec<Event>>,
    upstream_batch: Vec<Event>,
    log_batches: BTreeMap<ChamberId, Vec<LoggerEvent>>,
    stats: RuntimeStats,
    running: bool,
}

impl TaskProcess {
    /// Create a task process to be run on its own thread with `spawn`
    pub fn new(config: RuntimeConfig, registry: Registry) -> OperantResult<Self> {
        let (control_tx, control) = link();
        let (upstream, upstream_rx) = link();
        let mut process = Self::with_links(config, registry, control, upstream)?;
        process.handle_ends = Some((control_tx, upstream_rx));
        Ok(process)
    }

    /// Create a task process driven over existing links, e.g. a bridged pipe
    pub fn with_links(
        config: RuntimeConfig,
        registry: Registry,
        control: LinkReceiver,
        upstream: LinkSender,
    ) -> OperantResult<Self> {
        config.validate()?;
        let timeouts = TimeoutManager::spawn(config.timeout_config())?;
        let (timer_sink, timer_events) = link();

        Ok(TaskProcess {
            config,
            registry,
            control,
            upstream,
            handle_ends: None,
            timer_events,
            timer_sink,
            timeouts: Some(timeouts),
            tasks: BTreeMap::new(),
            sources: BTreeMap::new(),
            retired: Vec::new(),
            loggers: BTreeMap::new(),
            blocked: BTreeSet::new(),
            queue: VecDeque::new(),
            outgoing: BTreeMap::new(),
            upstream_batch: Vec::new(),
            log_batches: BTreeMap::new(),
            stats: RuntimeStats::default(),
            running: true,
        })
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Attach a logger to a chamber. It outlives the chamber's task until
    /// a `Clear` that deletes loggers, or shutdown.
    pub fn attach_logger(&mut self, chamber: ChamberId, logger: Box<dyn Logger>) {
        self.loggers.entry(chamber).or_default().push(logger);
    }

    /// Host `source` on its own thread
    pub fn spawn_source(&mut self, id: SourceId, source: Box<dyn Source>) -> OperantResult<()> {
        self.ensure_new_source(&id)?;
        let (commands, inbound) = match self.config.source.channel_capacity {
            Some(capacity) => bounded_link(capacity),
            None => link(),
        };
        let (outbound, events) = link();
        let process = SourceProcess::spawn(
            id.clone(),
            source,
            self.config.source_config(),
            inbound,
            outbound,
        )?;

        info!(source = %id, "source started");
        self.sources
            .insert(id, SourceEntry::new(commands, events, Some(process)));
        Ok(())
    }

    /// Build a source of a registered type and host it
    pub fn add_source(
        &mut self,
        id: SourceId,
        source_type: &str,
        metadata: &Metadata,
    ) -> OperantResult<()> {
        self.ensure_new_source(&id)?;
        let source = self.registry.build_source(source_type, &id, metadata)?;
        self.spawn_source(id, source)
    }

    /// Attach a source living elsewhere, e.g. another process behind a pipe
    pub fn attach_source(
        &mut self,
        id: SourceId,
        commands: LinkSender,
        events: LinkReceiver,
    ) -> OperantResult<()> {
        self.ensure_new_source(&id)?;
        info!(source = %id, "external source attached");
        self.sources.insert(id, SourceEntry::new(commands, events, None));
        Ok(())
    }

    /// Run on a dedicated thread
    pub fn spawn(mut self) -> OperantResult<RuntimeHandle> {
        let (control, upstream) = self.handle_ends.take().ok_or_else(|| {
            OperantError::Config("task process was built on external links; call run()".into())
        })?;
        let thread = thread::Builder::new()
            .name("operant-task-process".into())
            .spawn(move || self.run())?;

        Ok(RuntimeHandle {
            control,
            upstream,
            thread: Some(thread),
        })
    }

    /// Run the reactor until `Exit`
    pub fn run(mut self) -> RuntimeStats {
        info!(
            chambers = self.tasks.len(),
            sources = self.sources.len(),
            poll_timeout = ?self.config.poll_timeout,
            "task process started"
        );

        while self.running {
            self.tick();
        }
        self.shutdown();

        info!(
            ticks = self.stats.ticks,
            events = self.stats.events_dispatched,
            errors = self.stats.errors_reported,
            "task process stopped"
        );
        self.stats.clone()
    }

    fn tick(&mut self) {
        let start = Instant::now();
        self.stats.ticks += 1;

        // Stage 1: Wait for the first ready channel
        match self.wait() {
            // Stage 2-4: Decode, dispatch, drain
            Some((origin, Ok(batch))) => self.ingest(origin, &batch),
            Some((origin, Err(RecvError))) => self.disconnected(origin),
            // Stage 7: Quiet window, keep time-based transitions moving
            None => self.heartbeat(),
        }

        // Stage 5-6: Flush sources, upstream, loggers
        self.flush();

        self.stats.last_tick_duration = start.elapsed();
    }

    fn wait(&self) -> Option<(Origin, Result<Bytes, RecvError>)> {
        let polled: Vec<(&SourceId, &LinkReceiver)> = self
            .sources
            .iter()
            .filter_map(|(id, entry)| entry.events.as_ref().map(|rx| (id, rx)))
            .collect();

        let mut select = Select::new();
        let control = select.recv(&self.control);
        let timers = select.recv(&self.timer_events);
        for (_, rx) in &polled {
            select.recv(*rx);
        }

        let op = select.select_timeout(self.config.poll_timeout).ok()?;
        let index = op.index();
        if index == control {
            Some((Origin::Control, op.recv(&self.control)))
        } else if index == timers {
            Some((Origin::Timers, op.recv(&self.timer_events)))
        } else {
            let (id, rx) = polled[index - 2];
            Some((Origin::Source(id.clone()), op.recv(rx)))
        }
    }

    fn ingest(&mut self, origin: Origin, batch: &[u8]) {
        self.stats.batches_in += 1;

        let events = match decode(batch) {
            Ok(events) => events,
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!(origin = ?origin, "dropping undecodable batch: {}", e);
                let source = match origin {
                    Origin::Source(id) => Some(id),
                    _ => None,
                };
                self.process(Event::global(EventKind::Error {
                    kind: ErrorKind::Decode,
                    detail: e.to_string(),
                    source,
                }));
                return;
            }
        };

        for event in events {
            if !self.running {
                debug!("exit in batch, dropping the rest");
                break;
            }
            self.process(event);
        }
    }

    fn disconnected(&mut self, origin: Origin) {
        match origin {
            Origin::Control => {
                warn!("control channel closed, exiting");
                self.process(Event::global(EventKind::Exit));
            }
            Origin::Timers => {
                // The sink is held here; a timer channel cannot close while running
                error!("timer channel closed");
            }
            Origin::Source(id) => {
                let err = OperantError::SourceFatal {
                    source_id: id,
                    detail: "channel closed".into(),
                };
                self.process(Event::error(None, &err));
            }
        }
    }

    /// Dispatch one external event and every event it causes
    fn process(&mut self, event: Event) {
        self.queue.push_back(event);
        while let Some(event) = self.queue.pop_front() {
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: Event) {
        self.stats.events_dispatched += 1;
        let chamber = event.chamber;

        match panic::catch_unwind(AssertUnwindSafe(|| self.route(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.report(chamber, err),
            Err(payload) => {
                self.stats.panics_contained += 1;
                let detail = panic_message(payload.as_ref());
                error!(
                    chamber = ?chamber,
                    event = event.event_type().name(),
                    "handler panicked: {}",
                    detail
                );
                if let Some(chamber) = chamber {
                    self.halt(chamber);
                }
                self.report(chamber, OperantError::Unhandled(format!("panic: {}", detail)));
            }
        }

        self.collect_outboxes();
    }

    fn report(&mut self, chamber: Option<ChamberId>, err: OperantError) {
        warn!(chamber = ?chamber, kind = ?err.kind(), "{}", err);
        self.queue.push_back(Event::error(chamber, &err));
    }

    fn route(&mut self, event: &Event) -> OperantResult<()> {
        match &event.kind {
            EventKind::AddTask {
                task_type,
                bindings,
                constants,
            } => {
                let chamber = require_chamber(event)?;
                self.add_task(chamber, task_type, bindings, constants, &event.metadata)
            }
            EventKind::Start => {
                let chamber = require_chamber(event)?;
                if self.blocked.contains(&chamber) {
                    return Err(OperantError::ComponentRegister(format!(
                        "chamber {} has components that failed to register",
                        chamber
                    )));
                }
                self.task_mut(chamber)?.start()?;
                self.each_logger(chamber, "start", |l| l.start());
                self.publish(event);
                Ok(())
            }
            EventKind::Stop => {
                let chamber = require_chamber(event)?;
                self.stop_task(chamber)?;
                self.publish(event);
                Ok(())
            }
            EventKind::Pause => {
                let chamber = require_chamber(event)?;
                self.task_mut(chamber)?.pause()?;
                self.publish(event);
                Ok(())
            }
            EventKind::Resume => {
                let chamber = require_chamber(event)?;
                self.task_mut(chamber)?.resume()?;
                self.publish(event);
                Ok(())
            }
            EventKind::Init => {
                let chamber = require_chamber(event)?;
                let init = self.init_event(chamber)?;
                self.publish(&init);
                Ok(())
            }
            EventKind::Clear { delete_loggers } => {
                let chamber = require_chamber(event)?;
                self.clear(chamber, *delete_loggers)?;
                self.publish(event);
                Ok(())
            }
            EventKind::Exit => {
                self.exit();
                self.publish(event);
                Ok(())
            }
            EventKind::AddSource {
                source,
                source_type,
            } => {
                self.add_source(source.clone(), source_type, &event.metadata)?;
                self.publish(event);
                Ok(())
            }
            EventKind::RemoveSource { source } => {
                self.remove_source(source)?;
                self.publish(event);
                Ok(())
            }
            EventKind::ComponentUpdate { component, value } => {
                self.update_component(event.chamber, component, value);
                Ok(())
            }
            EventKind::ComponentWrite { component, value } => {
                let chamber = require_chamber(event)?;
                self.forward_write(chamber, component, value)
            }
            EventKind::ComponentRegister { .. }
            | EventKind::ComponentClose { .. }
            | EventKind::CloseSource => {
                debug!(event = event.event_type().name(), "source command ignored");
                Ok(())
            }
            EventKind::TaskComplete => {
                let chamber = require_chamber(event)?;
                self.task_mut(chamber)?.finish()?;
                self.each_logger(chamber, "stop", |l| l.stop());
                self.publish(event);
                Ok(())
            }
            EventKind::Timeout { name } => {
                let chamber = require_chamber(event)?;
                let Some(task) = self.tasks.get_mut(&chamber) else {
                    debug!(chamber = %chamber, timeout = %name, "timeout for a removed task");
                    return Ok(());
                };
                if !task.timeout_fired(name, &event.metadata) {
                    debug!(chamber = %chamber, timeout = %name, "stale timeout dropped");
                    return Ok(());
                }
                self.publish(event);
                self.deliver(chamber, event)
            }
            EventKind::StateEnter { state } => {
                let chamber = require_chamber(event)?;
                self.publish(event);
                // Skip an entry already superseded by a later transition
                let current = self.tasks.get(&chamber).and_then(|t| t.state());
                if current == Some(*state) {
                    self.deliver(chamber, event)
                } else {
                    Ok(())
                }
            }
            EventKind::StateExit { .. } | EventKind::ComponentChanged { .. } => {
                let chamber = require_chamber(event)?;
                self.publish(event);
                self.deliver(chamber, event)
            }
            EventKind::Heartbeat => {
                let chamber = require_chamber(event)?;
                self.deliver(chamber, event)
            }
            EventKind::Error { kind, source, .. } => {
                self.stats.errors_reported += 1;
                self.publish(event);
                match kind {
                    // Reported by a source that refused one of the chamber's components
                    ErrorKind::ComponentRegister if source.is_some() => {
                        if let Some(chamber) = event.chamber {
                            self.block(chamber);
                        }
                    }
                    ErrorKind::SourceFatal => {
                        if let Some(source) = source {
                            self.source_lost(source);
                        }
                    }
                    ErrorKind::SourceNonFatal | ErrorKind::SourceUnavailable => {
                        if let Some(chamber) = event.chamber {
                            self.halt(chamber);
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
        }
    }

    /// Hand a stateful event to the chamber's task
    fn deliver(&mut self, chamber: ChamberId, event: &Event) -> OperantResult<()> {
        match self.tasks.get_mut(&chamber) {
            Some(task) => task.handle(event),
            None => Ok(()),
        }
    }

    fn add_task(
        &mut self,
        chamber: ChamberId,
        task_type: &str,
        bindings: &[ComponentBinding],
        constants: &Metadata,
        metadata: &Metadata,
    ) -> OperantResult<()> {
        for binding in bindings {
            let problem = match self.sources.get(&binding.source) {
                Some(entry) if entry.is_available() => continue,
                Some(_) => "is unavailable",
                None => "does not exist",
            };
            return Err(OperantError::ComponentRegister(format!(
                "{} slot {}: source {} {}",
                binding.name, binding.slot, binding.source, problem
            )));
        }

        let mut loggers = Vec::new();
        if let Some(Value::List(names)) = metadata.get("loggers") {
            for name in names.iter().filter_map(Value::as_str) {
                loggers.push(self.registry.build_logger(name, chamber, metadata)?);
            }
        }

        let setup = TaskSetup {
            chamber,
            task_type: task_type.to_string(),
            bindings: bindings.to_vec(),
            constants: constants.clone(),
            timers: TimerLink::new(self.timer_handle()?, self.timer_sink.clone()),
        };
        let task = self.registry.build_task(setup)?;

        if self.tasks.contains_key(&chamber) {
            info!(chamber = %chamber, "replacing task");
            self.clear(chamber, false)?;
        }

        for component in task.components() {
            let register = Event::new(
                chamber,
                EventKind::ComponentRegister {
                    component: component.id.clone(),
                    kind: component.kind,
                    address: component.address.clone(),
                },
            )
            .with_metadata(component.metadata.clone());
            self.outgoing
                .entry(component.source.clone())
                .or_default()
                .push(register);
        }

        info!(
            chamber = %chamber,
            task = task_type,
            components = task.components().len(),
            "task added"
        );
        self.tasks.insert(chamber, task);
        self.blocked.remove(&chamber);
        for logger in loggers {
            self.attach_logger(chamber, logger);
        }

        let init = self.init_event(chamber)?;
        self.publish(&init);
        Ok(())
    }

    /// `Init` announcing a chamber's task type and constants
    fn init_event(&self, chamber: ChamberId) -> OperantResult<Event> {
        let task = self
            .tasks
            .get(&chamber)
            .ok_or(OperantError::ChamberNotFound(chamber))?;
        Ok(Event::new(chamber, EventKind::Init)
            .with_metadata(task.constants())
            .with_meta("task_type", task.task_type()))
    }

    fn stop_task(&mut self, chamber: ChamberId) -> OperantResult<()> {
        let task = self.task_mut(chamber)?;
        let was_started = task.is_started();
        task.stop()?;
        if was_started {
            self.each_logger(chamber, "stop", |l| l.stop());
        }
        Ok(())
    }

    /// Stop a chamber after a failure. A panic while stopping removes the task.
    fn halt(&mut self, chamber: ChamberId) {
        let Some(task) = self.tasks.get_mut(&chamber) else {
            return;
        };
        if !task.is_started() {
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| task.stop())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(chamber = %chamber, "halt: {}", e),
            Err(payload) => {
                self.stats.panics_contained += 1;
                error!(
                    chamber = %chamber,
                    "task panicked while halting, removing it: {}",
                    panic_message(payload.as_ref())
                );
                self.tasks.remove(&chamber);
            }
        }
        self.each_logger(chamber, "stop", |l| l.stop());
        warn!(chamber = %chamber, "chamber halted");
    }

    /// Keep a chamber from starting until its task is added again or cleared
    fn block(&mut self, chamber: ChamberId) {
        if !self.tasks.contains_key(&chamber) {
            return;
        }
        if self.blocked.insert(chamber) {
            warn!(chamber = %chamber, "component registration failed, chamber blocked");
        }
        self.halt(chamber);
    }

    fn clear(&mut self, chamber: ChamberId, delete_loggers: bool) -> OperantResult<()> {
        if self.tasks.contains_key(&chamber) {
            self.stop_task(chamber)?;
            // StateExit from the stop goes out while the task still exists
            self.collect_outboxes();

            let closes = self.task_mut(chamber)?.close()?;
            for (source, close) in closes {
                self.outgoing.entry(source).or_default().push(close);
            }
            self.tasks.remove(&chamber);
            self.blocked.remove(&chamber);
            info!(chamber = %chamber, "task cleared");
        }

        if delete_loggers {
            if let Some(mut loggers) = self.loggers.remove(&chamber) {
                for logger in loggers.iter_mut() {
                    if let Err(e) = logger.close() {
                        warn!(chamber = %chamber, "logger close failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    fn exit(&mut self) {
        info!(chambers = self.tasks.len(), "exit requested");
        let chambers: Vec<ChamberId> = self.tasks.keys().copied().collect();
        for chamber in chambers {
            if let Err(e) = self.stop_task(chamber) {
                warn!(chamber = %chamber, "stop on exit: {}", e);
            }
        }
        self.running = false;
    }

    fn update_component(&mut self, chamber: Option<ChamberId>, id: &ComponentId, value: &Value) {
        let owner = match chamber {
            Some(chamber) => self.tasks.get_mut(&chamber),
            None => self
                .tasks
                .values_mut()
                .find(|t| t.components().iter().any(|c| &c.id == id)),
        };
        match owner {
            Some(task) => {
                if let Some(changed) = task.update_component(id, value.clone()) {
                    self.queue.push_back(changed);
                }
            }
            None => debug!(component = %id, "update for a component no task owns"),
        }
    }

    /// A write requested from outside, e.g. a manual override
    fn forward_write(
        &mut self,
        chamber: ChamberId,
        id: &ComponentId,
        value: &Value,
    ) -> OperantResult<()> {
        let task = self
            .tasks
            .get(&chamber)
            .ok_or(OperantError::ChamberNotFound(chamber))?;
        let component = task
            .components()
            .iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| OperantError::ComponentNotFound(id.to_string()))?;
        if !component.available {
            return Err(OperantError::SourceUnavailable(component.source.clone()));
        }

        let write = Event::new(
            chamber,
            EventKind::ComponentWrite {
                component: id.clone(),
                value: value.clone(),
            },
        );
        self.outgoing
            .entry(component.source.clone())
            .or_default()
            .push(write);
        Ok(())
    }

    fn collect_outboxes(&mut self) {
        for task in self.tasks.values_mut() {
            let outbox = task.take_outbox();
            if outbox.is_empty() {
                continue;
            }
            self.queue.extend(outbox.events);
            for (source, write) in outbox.writes {
                self.outgoing.entry(source).or_default().push(write);
            }
        }
    }

    fn ensure_new_source(&mut self, id: &SourceId) -> OperantResult<()> {
        let available = match self.sources.get(id) {
            Some(entry) => entry.is_available(),
            None => return Ok(()),
        };
        if available {
            return Err(OperantError::Config(format!("source {} already exists", id)));
        }
        // Replacing a lost source
        if let Some(entry) = self.sources.remove(id) {
            self.retire(entry);
        }
        Ok(())
    }

    fn remove_source(&mut self, id: &SourceId) -> OperantResult<()> {
        let mut entry = self
            .sources
            .remove(id)
            .ok_or_else(|| OperantError::SourceNotFound(id.clone()))?;
        if entry.is_available() {
            // Dropping the command link closes the source even if this is held back
            if let Err(e) = entry.queue(&[Event::global(EventKind::CloseSource)]) {
                debug!(source = %id, "close on remove: {}", e);
            }
            if let Drain::Held { held, .. } = entry.drain() {
                debug!(source = %id, held, "command link full on remove");
            }
        }
        entry.events = None;
        let components = self.mark_unavailable(id);
        self.retire(entry);
        info!(source = %id, components, "source removed");
        Ok(())
    }

    /// Stop polling a failed source and mark what it served unavailable
    fn source_lost(&mut self, id: &SourceId) {
        let was_polled = self
            .sources
            .get_mut(id)
            .map(|entry| entry.events.take().is_some())
            .unwrap_or(false);
        if !was_polled {
            return;
        }
        let components = self.mark_unavailable(id);
        error!(source = %id, components, "source lost, no longer polled");
    }

    fn mark_unavailable(&mut self, id: &SourceId) -> usize {
        self.outgoing.remove(id);
        if let Some(entry) = self.sources.get_mut(id) {
            entry.backlog.clear();
        }
        self.tasks
            .values_mut()
            .map(|task| task.mark_source_unavailable(id))
            .sum()
    }

    fn retire(&mut self, entry: SourceEntry) {
        if let Some(process) = entry.process {
            self.retired.push(process);
        }
    }

    fn heartbeat(&mut self) {
        self.stats.heartbeats += 1;
        let live: Vec<ChamberId> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.is_started() && !task.is_paused())
            .map(|(chamber, _)| *chamber)
            .collect();
        for chamber in live {
            self.process(Event::new(chamber, EventKind::Heartbeat));
        }
    }

    /// Buffer an event for upstream and for the chamber's loggers
    fn publish(&mut self, event: &Event) {
        self.upstream_batch.push(event.clone());

        let Some(chamber) = event.chamber else {
            return;
        };
        if !self.loggers.contains_key(&chamber) {
            return;
        }
        let task = self.tasks.get(&chamber).map(|t| &**t);
        if let Some(logged) = LoggerEvent::project(event, task) {
            self.log_batches.entry(chamber).or_default().push(logged);
        }
    }

    fn flush(&mut self) {
        for (id, events) in std::mem::take(&mut self.outgoing) {
            if events.is_empty() {
                continue;
            }
            let Some(entry) = self.sources.get_mut(&id) else {
                warn!(source = %id, dropped = events.len(), "commands for an unknown source");
                continue;
            };
            if !entry.is_available() {
                debug!(source = %id, dropped = events.len(), "commands for a lost source");
                continue;
            }
            if let Err(e) = entry.queue(&events) {
                warn!(source = %id, dropped = events.len(), "unencodable source commands: {}", e);
                self.stats.errors_reported += 1;
                self.upstream_batch
                    .push(Event::error(None, &OperantError::Encode(e)));
            }
        }

        // A full command link holds the rest for the next tick
        let mut closed = Vec::new();
        for (id, entry) in self.sources.iter_mut() {
            if !entry.is_available() || entry.backlog.is_empty() {
                continue;
            }
            match entry.drain() {
                Drain::Sent(sent) => self.stats.batches_flushed += sent,
                Drain::Held { sent, held } => {
                    self.stats.batches_flushed += sent;
                    self.stats.batches_held += 1;
                    debug!(source = %id, held, "source command link full, holding batches");
                }
                Drain::Closed => closed.push(id.clone()),
            }
        }
        for id in closed {
            warn!(source = %id, "source command link closed");
            self.source_lost(&id);
            self.stats.errors_reported += 1;
            let err = OperantError::SourceFatal {
                source_id: id,
                detail: "command channel closed".into(),
            };
            self.upstream_batch.push(Event::error(None, &err));
        }

        if !self.upstream_batch.is_empty() {
            let batch = std::mem::take(&mut self.upstream_batch);
            match self.upstream.send_events(&batch) {
                Ok(()) => self.stats.batches_flushed += 1,
                Err(e) => debug!(dropped = batch.len(), "upstream: {}", e),
            }
        }

        for (chamber, batch) in std::mem::take(&mut self.log_batches) {
            if let Some(loggers) = self.loggers.get_mut(&chamber) {
                for logger in loggers.iter_mut() {
                    if let Err(e) = logger.log_events(&batch) {
                        warn!(chamber = %chamber, "logger failed: {}", e);
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        // The reactor is done; waiting on a slow source here is fine
        for (id, entry) in self.sources.iter_mut() {
            if !entry.is_available() {
                continue;
            }
            if let Err(e) = entry.queue(&[Event::global(EventKind::CloseSource)]) {
                debug!(source = %id, "close on exit: {}", e);
            }
            for batch in entry.backlog.drain(..) {
                if let Err(e) = Outlet::send(&entry.commands, batch) {
                    debug!(source = %id, "close on exit: {}", e);
                    break;
                }
            }
        }

        if let Some(timeouts) = self.timeouts.take() {
            timeouts.shutdown();
        }

        for (_, entry) in std::mem::take(&mut self.sources) {
            self.retire(entry);
        }
        for process in self.retired.drain(..) {
            process.join();
        }

        for (chamber, loggers) in self.loggers.iter_mut() {
            for logger in loggers.iter_mut() {
                if let Err(e) = logger.close() {
                    warn!(chamber = %chamber, "logger close failed: {}", e);
                }
            }
        }
        self.loggers.clear();
    }

    fn timer_handle(&self) -> OperantResult<TimeoutHandle> {
        self.timeouts
            .as_ref()
            .map(TimeoutManager::handle)
            .ok_or(OperantError::LinkClosed)
    }

    fn task_mut(&mut self, chamber: ChamberId) -> OperantResult<&mut Box<dyn ChamberTask>> {
        self.tasks
            .get_mut(&chamber)
            .ok_or(OperantError::ChamberNotFound(chamber))
    }

    fn each_logger<F>(&mut self, chamber: ChamberId, what: &str, mut f: F)
    where
        F: FnMut(&mut Box<dyn Logger>) -> OperantResult<()>,
    {
        if let Some(loggers) = self.loggers.get_mut(&chamber) {
            for logger in loggers.iter_mut() {
                if let Err(e) = f(logger) {
                    warn!(chamber = %chamber, "logger {} failed: {}", what, e);
                }
            }
        }
    }
}

fn require_chamber(event: &Event) -> OperantResult<ChamberId> {
    event.chamber.ok_or_else(|| {
        OperantError::Unhandled(format!("{} without a chamber", event.event_type().name()))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Owner's side of a spawned task process
pub struct RuntimeHandle {
    control: LinkSender,
    upstream: LinkReceiver,
    thread: Option<JoinHandle<RuntimeStats>>,
}

impl RuntimeHandle {
    /// Send control events as one batch
    pub fn send(&self, events: &[Event]) -> OperantResult<()> {
        self.control.send_events(events)
    }

    /// Next upstream batch. `None` on timeout or once the task process is gone.
    pub fn recv_events(&self, timeout: Duration) -> Option<Vec<Event>> {
        let batch = self.upstream.recv_timeout(timeout).ok()?;
        match decode(&batch) {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("undecodable upstream batch: {}", e);
                Some(Vec::new())
            }
        }
    }

    pub fn upstream(&self) -> &LinkReceiver {
        &self.upstream
    }

    /// Send `Exit` and wait for the task process to finish
    pub fn shutdown(mut self) -> Option<RuntimeStats> {
        self.stop()
    }

    fn stop(&mut self) -> Option<RuntimeStats> {
        let thread = self.thread.take()?;
        if let Err(e) = self.send(&[Event::global(EventKind::Exit)]) {
            debug!("exit: {}", e);
        }
        match thread.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                error!("task process thread panicked");
                None
            }
        }
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
