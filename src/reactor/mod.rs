//! Single-threaded reactor and cooperative task scheduler.
//!
//! Every socket and timer event of the process is dispatched from one
//! [`Reactor`]. Callbacks run to completion; the only point where the thread
//! blocks is the multiplexer wait at the end of each tick.
//!
//! # Tick
//!
//! ```text
//!   pending tasks ──promote──> active list ──sort (due, seq)──> run due tasks
//!                                                                    │
//!   dispatch ready handles <── multiplexer wait (bounded by next due)┘
//! ```
//!
//! 1. Newly scheduled tasks move from the pending buffer to the active list.
//! 2. Active tasks are sorted by due time, ties broken by insertion order.
//! 3. Every task due at the start of the tick runs. Periodic tasks are re-armed
//!    at `now + interval`; one-shot tasks are dropped.
//! 4. The reactor blocks until the next task is due (capped by the configured
//!    maximum), unless no handle is registered.
//! 5. Ready handles get `on_readable` / `on_writable`.
//!
//! Errors returned by callbacks are logged and isolated; a failing handler is
//! force-closed. [`ProbeError::Terminated`] is the exception: it stops the
//! loop and is returned to the caller.
//!
//! # Termination
//!
//! [`Reactor::run_forever`] returns as soon as no handle is registered, even
//! when periodic tasks are still scheduled. Work that must outlive I/O has to
//! keep a handle registered.
//!
//! # Example
//!
//! ```rust,ignore
//! use netprobe::reactor::Reactor;
//! use netprobe::config::ReactorConfig;
//! use std::time::Duration;
//!
//! let mut reactor = Reactor::new(&ReactorConfig::default());
//! let handle = reactor.schedule_after(Duration::from_secs(1), |_| {
//!     tracing::info!("one second later");
//!     Ok(())
//! });
//! reactor.reschedule(&handle, Duration::from_secs(2));
//! ```

mod clock;
mod notify;
mod poll;
mod task;

pub use clock::{units, Clock, ManualClock, MonotonicClock};
pub use notify::{NotificationBus, Subscriber, RENEGOTIATE};
pub use poll::{Multiplexer, PollMultiplexer, Readiness, SimulatedMultiplexer, Step};
pub use task::{TaskFn, TaskHandle};

use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::config::ReactorConfig;
use crate::error::{ProbeError, Result};
use task::TaskQueue;

/// Operating system handle number.
pub type Fileno = i32;

/// Object the reactor can watch for readiness.
///
/// Methods take `&self`; implementors keep their mutable state behind
/// `Cell`/`RefCell` so that a handler may close itself from inside a callback.
pub trait Pollable {
    /// Handle number to wait on.
    fn fileno(&self) -> Fileno;

    /// The handle is ready for reading.
    fn on_readable(&self, _reactor: &mut Reactor) -> Result<()> {
        Ok(())
    }

    /// The handle is ready for writing.
    fn on_writable(&self, _reactor: &mut Reactor) -> Result<()> {
        Ok(())
    }

    /// Whether a pending read has timed out at `now`.
    fn on_read_timeout(&self, _now: Duration) -> bool {
        false
    }

    /// Whether a pending write has timed out at `now`.
    fn on_write_timeout(&self, _now: Duration) -> bool {
        false
    }

    /// The handle was removed from the reactor.
    fn on_close(&self, _reactor: &mut Reactor) {}
}

/// The per-process event loop and context object.
pub struct Reactor {
    clock: Rc<dyn Clock>,
    mux: Box<dyn Multiplexer>,
    tasks: TaskQueue,
    readset: HashMap<Fileno, Rc<dyn Pollable>>,
    writeset: HashMap<Fileno, Rc<dyn Pollable>>,
    bus: NotificationBus,
    max_wait: Duration,
}

impl Reactor {
    /// Create a reactor on the monotonic clock and `poll(2)`.
    pub fn new(config: &ReactorConfig) -> Self {
        Self::with_parts(
            config,
            Rc::new(MonotonicClock::new()),
            Box::new(PollMultiplexer::new()),
        )
    }

    /// Create a reactor with an explicit clock and multiplexer.
    pub fn with_parts(
        config: &ReactorConfig,
        clock: Rc<dyn Clock>,
        mux: Box<dyn Multiplexer>,
    ) -> Self {
        let mut reactor = Self {
            clock,
            mux,
            tasks: TaskQueue::default(),
            readset: HashMap::new(),
            writeset: HashMap::new(),
            bus: NotificationBus::default(),
            max_wait: config.max_wait(),
        };

        let interval = config.watchdog_interval();
        if !interval.is_zero() {
            reactor.schedule_periodic(interval, |reactor| {
                reactor.check_timeouts();
                Ok(())
            });
        }
        reactor
    }

    /// Current reactor time.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Run `callback` once, `delay` from now.
    pub fn schedule_after<F>(&mut self, delay: Duration, callback: F) -> TaskHandle
    where
        F: FnMut(&mut Reactor) -> Result<()> + 'static,
    {
        let now = self.now();
        self.tasks.insert(now, delay, false, Box::new(callback))
    }

    /// Run `callback` every `interval`, first after one interval.
    pub fn schedule_periodic<F>(&mut self, interval: Duration, callback: F) -> TaskHandle
    where
        F: FnMut(&mut Reactor) -> Result<()> + 'static,
    {
        let now = self.now();
        self.tasks.insert(now, interval, true, Box::new(callback))
    }

    /// Move a pending task to `delay` from now, replacing its due time.
    ///
    /// Returns false if the task already fired or was cancelled.
    pub fn reschedule(&mut self, handle: &TaskHandle, delay: Duration) -> bool {
        let now = self.now();
        self.tasks.reschedule(*handle, now, delay)
    }

    /// Cancel a task; it will not fire again.
    pub fn cancel(&mut self, handle: &TaskHandle) -> bool {
        let cancelled = self.tasks.cancel(*handle);
        if cancelled {
            tracing::trace!("cancelled task {:?}", handle);
        }
        cancelled
    }

    /// Due time of a live task.
    pub fn due_time(&self, handle: &TaskHandle) -> Option<Duration> {
        self.tasks.due_time(*handle)
    }

    /// Number of live tasks, the watchdog included.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    // ------------------------------------------------------------------
    // Interest tables
    // ------------------------------------------------------------------

    /// Watch `handler` for readability.
    pub fn register_readable(&mut self, handler: Rc<dyn Pollable>) {
        self.readset.insert(handler.fileno(), handler);
    }

    /// Watch `handler` for writability.
    pub fn register_writable(&mut self, handler: Rc<dyn Pollable>) {
        self.writeset.insert(handler.fileno(), handler);
    }

    /// Stop watching `fileno` for readability.
    pub fn unregister_readable(&mut self, fileno: Fileno) {
        self.readset.remove(&fileno);
    }

    /// Stop watching `fileno` for writability.
    pub fn unregister_writable(&mut self, fileno: Fileno) {
        self.writeset.remove(&fileno);
    }

    /// Remove `fileno` from both tables and notify its handler.
    pub fn close(&mut self, fileno: Fileno) {
        let read = self.readset.remove(&fileno);
        let write = self.writeset.remove(&fileno);
        if let Some(handler) = read.or(write) {
            tracing::debug!("closing handle {}", fileno);
            handler.on_close(self);
        }
    }

    /// Whether any handle is registered.
    pub fn has_handles(&self) -> bool {
        !self.readset.is_empty() || !self.writeset.is_empty()
    }

    /// Whether `fileno` is watched for reading.
    pub fn is_readable(&self, fileno: Fileno) -> bool {
        self.readset.contains_key(&fileno)
    }

    /// Whether `fileno` is watched for writing.
    pub fn is_writable(&self, fileno: Fileno) -> bool {
        self.writeset.contains_key(&fileno)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Wait for the next publish of `topic`.
    pub fn subscribe<F>(&mut self, topic: &str, callback: F)
    where
        F: FnOnce(&mut Reactor) -> Result<()> + 'static,
    {
        self.bus.subscribe(topic, Box::new(callback));
    }

    /// Deliver `topic` to every current subscriber.
    pub fn publish(&mut self, topic: &str) -> Result<()> {
        let subscribers = self.bus.take(topic);
        tracing::debug!("publish {} to {} subscribers", topic, subscribers.len());
        for subscriber in subscribers {
            if let Err(err) = subscriber(self) {
                if err.is_terminating() {
                    return Err(err);
                }
                tracing::error!("subscriber of {} failed: {}", topic, err);
            }
        }
        Ok(())
    }

    /// Subscribers waiting on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.bus.count(topic)
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    /// Run until no handle is registered.
    pub fn run_forever(&mut self) -> Result<()> {
        while self.has_handles() {
            self.run_once()?;
        }
        Ok(())
    }

    /// Run one tick: due tasks, then one wait and its dispatch.
    pub fn run_once(&mut self) -> Result<()> {
        self.run_due_tasks()?;
        self.dispatch_events()
    }

    fn run_due_tasks(&mut self) -> Result<()> {
        let now = self.now();
        self.tasks.promote();

        for handle in self.tasks.due(now) {
            let Some(mut callback) = self.tasks.begin(handle, now) else {
                continue;
            };
            let result = callback(self);
            let after = self.now();
            self.tasks.finish(handle, callback, after);

            if let Err(err) = result {
                if err.is_terminating() {
                    return Err(err);
                }
                tracing::error!("task {:?} failed: {}", handle, err);
            }
        }
        Ok(())
    }

    fn wait_bound(&self) -> Duration {
        let now = self.now();
        match self.tasks.next_due() {
            Some(due) => due.saturating_sub(now).min(self.max_wait),
            None => self.max_wait,
        }
    }

    fn dispatch_events(&mut self) -> Result<()> {
        if !self.has_handles() {
            return Ok(());
        }

        let timeout = self.wait_bound();
        let readable: Vec<Fileno> = self.readset.keys().copied().collect();
        let writable: Vec<Fileno> = self.writeset.keys().copied().collect();

        let ready = match self.mux.wait(&readable, &writable, timeout) {
            Ok(ready) => ready,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                tracing::debug!("wait interrupted, retrying next tick");
                return Ok(());
            },
            Err(err) => {
                tracing::error!("multiplexer failed: {}", err);
                return Err(err.into());
            },
        };

        for fileno in ready.readable {
            self.dispatch_readable(fileno)?;
        }
        for fileno in ready.writable {
            self.dispatch_writable(fileno)?;
        }
        Ok(())
    }

    // A handle may have been closed by an earlier callback of this same tick.
    fn dispatch_readable(&mut self, fileno: Fileno) -> Result<()> {
        let Some(handler) = self.readset.get(&fileno).cloned() else {
            return Ok(());
        };
        let result = handler.on_readable(self);
        self.isolate(fileno, result)
    }

    fn dispatch_writable(&mut self, fileno: Fileno) -> Result<()> {
        let Some(handler) = self.writeset.get(&fileno).cloned() else {
            return Ok(());
        };
        let result = handler.on_writable(self);
        self.isolate(fileno, result)
    }

    fn isolate(&mut self, fileno: Fileno, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_terminating() => Err(err),
            Err(err) => {
                tracing::error!("handler {} failed: {}", fileno, err);
                self.close(fileno);
                Ok(())
            },
        }
    }

    fn check_timeouts(&mut self) {
        if !self.has_handles() {
            return;
        }
        let now = self.now();

        let mut expired: Vec<Fileno> = self
            .readset
            .values()
            .filter(|h| h.on_read_timeout(now))
            .map(|h| h.fileno())
            .collect();
        expired.extend(
            self.writeset
                .values()
                .filter(|h| h.on_write_timeout(now))
                .map(|h| h.fileno()),
        );

        for fileno in expired {
            tracing::warn!("handle {} timed out", fileno);
            self.close(fileno);
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("now", &self.now())
            .field("tasks", &self.tasks.len())
            .field("readable", &self.readset.len())
            .field("writable", &self.writeset.len())
            .finish_non_exhaustive()
    }
}

/// Build an error that stops the reactor.
pub fn terminate(reason: &str) -> ProbeError {
    ProbeError::Terminated(reason.to_string())
}
