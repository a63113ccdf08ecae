//! Embedded thread service: one OS thread driving a stage callback.
//!
//! The callback is called once with [`ExecutionStage::Startup`], then with
//! [`ExecutionStage::Main`] for as long as it answers
//! [`ExecutionOutcome::NoError`] and no stop was requested, then once with a
//! termination stage. The service object is handed back when the thread is
//! stopped.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Stage a callback is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    Startup,
    Main,
    /// Normal exit after a stop request or a `Completed` outcome.
    Termination,
    /// Exit after a `FatalError` outcome.
    BadTermination,
    /// Exit of a thread whose controller stopped waiting for it.
    AsyncTermination,
}

/// Answer of a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Keep going.
    NoError,
    /// Finished; leave the loop normally.
    Completed,
    /// Failed; leave the loop through `BadTermination`.
    FatalError,
    /// The thread did not stop in time.
    Timeout,
}

/// Work run by an [`EmbeddedThread`].
pub trait EmbeddedService: Send + 'static {
    fn execute(&mut self, stage: ExecutionStage) -> ExecutionOutcome;
}

#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    abandoned: AtomicBool,
}

/// A running service thread.
#[derive(Debug)]
pub struct EmbeddedThread<S> {
    name: String,
    flags: Arc<Flags>,
    handle: Option<JoinHandle<Option<(S, ExecutionOutcome)>>>,
}

impl<S: EmbeddedService> EmbeddedThread<S> {
    /// Spawn a thread named `name` running `service`.
    pub fn start(name: impl Into<String>, service: S) -> Result<Self> {
        Self::try_start(name, service).map_err(|(err, _)| err)
    }

    /// Like [`start`](Self::start), but hands `service` back when no thread
    /// could be spawned.
    pub fn try_start(
        name: impl Into<String>,
        service: S,
    ) -> std::result::Result<Self, (Error, S)> {
        let name = name.into();
        let flags = Arc::new(Flags::default());
        let thread_flags = Arc::clone(&flags);
        let (handoff, received) = mpsc::sync_channel::<S>(1);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut service = received.recv().ok()?;
            let mut outcome = service.execute(ExecutionStage::Startup);
            while outcome == ExecutionOutcome::NoError
                && !thread_flags.stop.load(Ordering::Acquire)
            {
                outcome = service.execute(ExecutionStage::Main);
            }
            let stage = if thread_flags.abandoned.load(Ordering::Acquire) {
                ExecutionStage::AsyncTermination
            } else if outcome == ExecutionOutcome::FatalError {
                ExecutionStage::BadTermination
            } else {
                ExecutionStage::Termination
            };
            service.execute(stage);
            Some((service, outcome))
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let err = Error::fatal(format!("cannot spawn thread {name}: {e}"));
                return Err((err, service));
            }
        };
        if let Err(mpsc::SendError(service)) = handoff.send(service) {
            let err = Error::fatal(format!("thread {name} exited before its service arrived"));
            return Err((err, service));
        }
        debug!(thread = %name, "embedded thread started");
        Ok(Self {
            name,
            flags,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while the thread has not left its loop.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the thread to leave its loop after the current callback.
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::Release);
    }

    /// Stop the thread and take the service back.
    ///
    /// A thread still running after `timeout` is detached and reported as
    /// [`Error::Timeout`]; it runs `AsyncTermination` whenever it exits.
    pub fn stop(mut self, timeout: Duration) -> Result<(S, ExecutionOutcome)> {
        self.request_stop();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| Error::fatal(format!("thread {} already stopped", self.name)))?;
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                self.flags.abandoned.store(true, Ordering::Release);
                warn!(thread = %self.name, ?timeout, "thread did not stop in time, detached");
                return Err(Error::Timeout(format!(
                    "thread {} did not stop within {timeout:?}",
                    self.name
                )));
            }
            thread::sleep(Duration::from_millis(1));
        }
        match handle.join() {
            Ok(Some(result)) => {
                debug!(thread = %self.name, outcome = ?result.1, "embedded thread stopped");
                Ok(result)
            }
            Ok(None) => Err(Error::fatal(format!(
                "thread {} never received its service",
                self.name
            ))),
            Err(_) => {
                error!(thread = %self.name, "embedded thread panicked");
                Err(Error::fatal(format!("thread {} panicked", self.name)))
            }
        }
    }
}

impl<S> Drop for EmbeddedThread<S> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.flags.stop.store(true, Ordering::Release);
        }
    }
}
