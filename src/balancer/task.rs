//! Periodic background maintenance.
//!
//! A [`PeriodicTask`] ticks on a tokio interval and runs one [`Job`] against
//! the balancer core while holding the core mutex. Tasks hold a `Weak`
//! reference, so a freed or dropped balancer stops its tasks at their next
//! tick. Cancellation is signalled over a `watch` channel and re-checked after
//! the lock is taken: a tick that was already waiting for the lock when its
//! task got cancelled does nothing.

use super::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Weak;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Maintenance performed by a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Refresh active session counters and grow the table when overloaded.
    ScanSessionTable,
    /// Recompute WLC weights and republish the configuration if they changed.
    UpdateEffectiveWeights,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScanSessionTable => f.write_str("session table scan"),
            Self::UpdateEffectiveWeights => f.write_str("effective weights update"),
        }
    }
}

/// Target of periodic jobs; implemented by the balancer core.
pub trait Maintenance: Send + 'static {
    fn run_job(&mut self, job: Job, now: SystemTime) -> Result<()>;
}

/// Starts periodic jobs on behalf of one balancer.
pub trait Spawner: Send + Sync {
    /// Starts `job` every `period`. The first run happens one period from now.
    fn spawn(&self, job: Job, period: Duration) -> Result<PeriodicTask>;
}

/// Handle of a running periodic task. Dropping it cancels the task.
#[derive(Debug)]
pub struct PeriodicTask {
    job: Job,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn job(&self) -> Job {
        self.job
    }

    /// Asks the task to stop. Does not wait for it.
    pub fn cancel(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Spawns jobs that run against a shared `Mutex<T>`.
pub struct TaskScope<T> {
    name: String,
    target: Weak<Mutex<T>>,
}

impl<T> TaskScope<T> {
    pub fn new(name: impl Into<String>, target: Weak<Mutex<T>>) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }

    /// A scope whose tasks never find their target and exit on first tick.
    pub fn detached(name: impl Into<String>) -> Self {
        Self::new(name, Weak::new())
    }
}

impl<T: Maintenance> Spawner for TaskScope<T> {
    fn spawn(&self, job: Job, period: Duration) -> Result<PeriodicTask> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime {
            task: job.to_string(),
        })?;

        let (stop, mut stopped) = watch::channel(false);
        let target = self.target.clone();
        let name = self.name.clone();

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if !run_tick(&name, &target, &stopped, job) {
                            break;
                        }
                    }
                }
            }
            debug!(balancer = %name, job = %job, "Background task stopped");
        });

        info!(balancer = %self.name, job = %job, period = ?period, "Started background task");
        Ok(PeriodicTask { job, stop, handle })
    }
}

/// Runs one tick. Returns `false` when the task should exit.
fn run_tick<T: Maintenance>(
    name: &str,
    target: &Weak<Mutex<T>>,
    stopped: &watch::Receiver<bool>,
    job: Job,
) -> bool {
    let Some(target) = target.upgrade() else {
        return false;
    };
    let mut core = target.lock();
    if *stopped.borrow() {
        return false;
    }
    if let Err(err) = core.run_job(job, SystemTime::now()) {
        error!(balancer = %name, job = %job, error = %err, "Background task failed");
    }
    true
}
