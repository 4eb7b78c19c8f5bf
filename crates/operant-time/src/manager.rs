//! Timeout Manager - one thread serving every chamber's timers
//!
//! The timer list is owned by the manager thread alone. Callers only send
//! commands; the thread blocks on its command queue for at most the time to
//! the nearest deadline, applies every queued command, then fires expired
//! timers in insertion order.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use operant_core::{OperantError, OperantResult};

use crate::{Timeout, TimeoutKey};

/// Timeout manager configuration
#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    /// Lateness past a deadline that is tolerated silently
    pub max_jitter: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            max_jitter: Duration::from_millis(2),
        }
    }
}

enum Command {
    Add(Timeout),
    Cancel(TimeoutKey),
    Pause(TimeoutKey),
    Resume(TimeoutKey),
    Reset(Timeout),
    Extend(TimeoutKey, Duration),
    Remaining(TimeoutKey, Sender<Option<Duration>>),
    Quit,
}

/// Cloneable command API into the manager thread
#[derive(Clone, Debug)]
pub struct TimeoutHandle {
    commands: Sender<Command>,
}

impl TimeoutHandle {
    fn command(&self, command: Command) -> OperantResult<()> {
        self.commands
            .send(command)
            .map_err(|_| OperantError::LinkClosed)
    }

    /// Register and start a timer. Ignored if the key is already armed.
    pub fn add(&self, timeout: Timeout) -> OperantResult<()> {
        self.command(Command::Add(timeout))
    }

    /// Remove a timer without firing it
    pub fn cancel(&self, key: TimeoutKey) -> OperantResult<()> {
        self.command(Command::Cancel(key))
    }

    pub fn pause(&self, key: TimeoutKey) -> OperantResult<()> {
        self.command(Command::Pause(key))
    }

    pub fn resume(&self, key: TimeoutKey) -> OperantResult<()> {
        self.command(Command::Resume(key))
    }

    /// Replace the timer under the same key and restart it
    pub fn reset(&self, timeout: Timeout) -> OperantResult<()> {
        self.command(Command::Reset(timeout))
    }

    /// Add `delta` to the timer's duration and remaining time
    pub fn extend(&self, key: TimeoutKey, delta: Duration) -> OperantResult<()> {
        self.command(Command::Extend(key, delta))
    }

    /// Ask the manager for a timer's remaining time. Blocks for the reply.
    pub fn remaining(&self, key: TimeoutKey) -> Option<Duration> {
        let (tx, rx) = channel::bounded(1);
        self.command(Command::Remaining(key, tx)).ok()?;
        rx.recv().ok().flatten()
    }

    /// Stop the manager thread; pending timers are dropped without firing
    pub fn quit(&self) -> OperantResult<()> {
        self.command(Command::Quit)
    }
}

/// Owns the manager thread
#[derive(Debug)]
pub struct TimeoutManager {
    handle: TimeoutHandle,
    thread: Option<JoinHandle<()>>,
}

impl TimeoutManager {
    /// Spawn the manager thread
    pub fn spawn(config: TimeoutConfig) -> OperantResult<Self> {
        let (tx, rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("operant-timeouts".into())
            .spawn(move || run(config, rx))?;

        Ok(TimeoutManager {
            handle: TimeoutHandle { commands: tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> TimeoutHandle {
        self.handle.clone()
    }

    /// Quit and join the thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            // The thread may already be gone if it panicked in a callback
            let _ = self.handle.quit();
            if thread.join().is_err() {
                warn!("timeout manager thread panicked");
            }
        }
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(config: TimeoutConfig, commands: Receiver<Command>) {
    // Insertion-ordered; firing order among expired timers follows this order
    let mut armed: Vec<Timeout> = Vec::new();

    loop {
        let wait = armed
            .iter()
            .filter_map(Timeout::deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        let first = match wait {
            Some(wait) => match commands.recv_timeout(wait) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        for command in first.into_iter().chain(commands.try_iter()) {
            if !apply(&mut armed, command) {
                debug!(pending = armed.len(), "timeout manager quit");
                return;
            }
        }

        fire_expired(&mut armed, &config);
    }

    debug!(pending = armed.len(), "timeout manager disconnected");
}

/// Apply one command; returns false on quit
fn apply(armed: &mut Vec<Timeout>, command: Command) -> bool {
    let now = Instant::now();

    match command {
        Command::Add(mut timeout) => {
            if position(armed, &timeout.key).is_some() {
                debug!(timeout = %timeout.key, "timeout already armed, add ignored");
            } else {
                trace!(timeout = %timeout.key, duration = ?timeout.duration, "timeout added");
                timeout.start(now);
                armed.push(timeout);
            }
        }
        Command::Reset(mut timeout) => {
            timeout.start(now);
            match position(armed, &timeout.key) {
                Some(i) => armed[i] = timeout,
                None => armed.push(timeout),
            }
        }
        Command::Cancel(key) => {
            if let Some(i) = position(armed, &key) {
                armed.remove(i);
            }
        }
        Command::Pause(key) => {
            if let Some(i) = position(armed, &key) {
                armed[i].pause(now);
            }
        }
        Command::Resume(key) => {
            if let Some(i) = position(armed, &key) {
                armed[i].resume(now);
            }
        }
        Command::Extend(key, delta) => {
            if let Some(i) = position(armed, &key) {
                armed[i].extend(delta);
            }
        }
        Command::Remaining(key, reply) => {
            let remaining = position(armed, &key).map(|i| armed[i].remaining(now));
            let _ = reply.send(remaining);
        }
        Command::Quit => return false,
    }
    true
}

fn position(armed: &[Timeout], key: &TimeoutKey) -> Option<usize> {
    armed.iter().position(|t| &t.key == key)
}

fn fire_expired(armed: &mut Vec<Timeout>, config: &TimeoutConfig) {
    let now = Instant::now();
    let mut i = 0;
    while i < armed.len() {
        if !armed[i].is_expired(now) {
            i += 1;
            continue;
        }

        let mut timeout = armed.remove(i);
        if let Some(deadline) = timeout.deadline() {
            let late = now.saturating_duration_since(deadline);
            if late > config.max_jitter {
                warn!(timeout = %timeout.key, late = ?late, "timeout fired late");
            }
        }
        timeout.fire();
    }
}
