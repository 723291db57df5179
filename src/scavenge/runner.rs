//! Process-wide scavenge run guard.
//!
//! At most one scavenge runs per process. [`ScavengeRunner`] hands out a
//! [`ScavengeRun`] guard while idle and rejects further starts until the
//! guard finishes; `stop` flips the run's abort flag so the pipeline
//! winds down at its next suspension point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use evl_api_types::ScavengeStatus;
use evl_tools::task::WorkerTaskContext;

lazy_static! {
    static ref SCAVENGE_RUNNER: ScavengeRunner = ScavengeRunner::new();
}

/// The per-process runner instance.
pub fn scavenge_runner() -> &'static ScavengeRunner {
    &SCAVENGE_RUNNER
}

/// Caller supplied knobs of a single run.
#[derive(Clone, Copy, Debug)]
pub struct ScavengeParams {
    /// Worker threads for the index merge fan-out.
    pub threads: usize,
    /// First logical chunk the chunk executor considers on a fresh
    /// round.
    pub start_from_chunk: Option<i64>,
}

impl Default for ScavengeParams {
    fn default() -> Self {
        ScavengeParams {
            threads: 1,
            start_from_chunk: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running(String),
    Cancelling(String),
}

pub enum StartResult<'a> {
    Started(ScavengeRun<'a>),
    /// Another scavenge is running; repeat requests are rejected.
    InProgress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopResult {
    Stopping,
    /// The given id does not match the running scavenge (or nothing is
    /// running).
    InvalidScavengeId,
}

struct RunnerInner {
    lifecycle: Lifecycle,
    abort: Option<Arc<AtomicBool>>,
    last_status: Option<ScavengeStatus>,
}

pub struct ScavengeRunner {
    inner: Mutex<RunnerInner>,
}

impl ScavengeRunner {
    pub fn new() -> Self {
        ScavengeRunner {
            inner: Mutex::new(RunnerInner {
                lifecycle: Lifecycle::Idle,
                abort: None,
                last_status: None,
            }),
        }
    }

    /// Begin a run. Fails with [`StartResult::InProgress`] while another
    /// run holds the guard.
    pub fn start(&self) -> StartResult<'_> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::Idle {
            return StartResult::InProgress;
        }

        let id = proxmox_uuid::Uuid::generate().to_string();
        let abort = Arc::new(AtomicBool::new(false));
        inner.lifecycle = Lifecycle::Running(id.clone());
        inner.abort = Some(Arc::clone(&abort));

        StartResult::Started(ScavengeRun {
            runner: self,
            id,
            abort,
            completed: false,
        })
    }

    /// Request cancellation of the run with the given id.
    pub fn stop(&self, scavenge_id: &str) -> StopResult {
        let mut inner = self.inner.lock().unwrap();
        match &inner.lifecycle {
            Lifecycle::Running(id) if id == scavenge_id => {
                inner.lifecycle = Lifecycle::Cancelling(id.clone());
                if let Some(abort) = &inner.abort {
                    abort.store(true, Ordering::SeqCst);
                }
                StopResult::Stopping
            }
            Lifecycle::Cancelling(id) if id == scavenge_id => StopResult::Stopping,
            _ => StopResult::InvalidScavengeId,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().lifecycle != Lifecycle::Idle
    }

    /// Status of the most recently finished run.
    pub fn last_status(&self) -> Option<ScavengeStatus> {
        self.inner.lock().unwrap().last_status.clone()
    }

    fn finish(&self, status: Option<ScavengeStatus>) {
        let mut inner = self.inner.lock().unwrap();
        inner.lifecycle = Lifecycle::Idle;
        inner.abort = None;
        if let Some(status) = status {
            inner.last_status = Some(status);
        }
    }
}

impl Default for ScavengeRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard of the one running scavenge. Doubles as the worker context the
/// pipeline polls for cancellation.
pub struct ScavengeRun<'a> {
    runner: &'a ScavengeRunner,
    id: String,
    abort: Arc<AtomicBool>,
    completed: bool,
}

impl ScavengeRun<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record the final status and release the runner.
    pub fn complete(mut self, mut status: ScavengeStatus) {
        status.scavenge_id = Some(self.id.clone());
        self.runner.finish(Some(status));
        self.completed = true;
    }
}

impl Drop for ScavengeRun<'_> {
    fn drop(&mut self) {
        if !self.completed {
            // run failed or panicked without a status
            self.runner.finish(None);
        }
    }
}

impl WorkerTaskContext for ScavengeRun<'_> {
    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn check_abort(&self) -> Result<(), anyhow::Error> {
        if self.abort_requested() {
            return Err(super::error::ScavengeError::Cancelled.into());
        }
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        log::log!(level, "scavenge {}: {}", self.id, message);
    }
}
