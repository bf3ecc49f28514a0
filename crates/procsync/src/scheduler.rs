//! Fixed-period job scheduling
//!
//! Every job gets its own ticker task that pushes the job's index onto a
//! shared channel (first tick fires immediately, then every `Period`).
//! A central dispatcher consumes the channel and spawns runs; jobs run
//! concurrently with each other while runs of one job serialize on its
//! mutex. Ticks are never coalesced: a tick arriving mid-run queues the
//! next run on the lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dialect::ConnectionFactory;
use crate::engine;
use crate::error::Result;
use crate::job::Job;

/// How long in-flight runs get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Dispatches periodic runs for a set of jobs until cancelled.
pub struct Scheduler {
    jobs: Vec<Arc<Job>>,
    factory: Arc<dyn ConnectionFactory>,
    cancel: CancellationToken,
    quiet: bool,
}

impl Scheduler {
    /// Create a scheduler over the given jobs.
    pub fn new(
        jobs: Vec<Arc<Job>>,
        factory: Arc<dyn ConnectionFactory>,
        cancel: CancellationToken,
        quiet: bool,
    ) -> Self {
        Self {
            jobs,
            factory,
            cancel,
            quiet,
        }
    }

    /// Run until the cancellation token fires, then wait out the grace
    /// window for in-flight runs.
    pub async fn run(self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<usize>(self.jobs.len().max(1));

        for (idx, job) in self.jobs.iter().enumerate() {
            info!(origin = %job.origin, period = ?job.period, "scheduling job");
            let tx = tx.clone();
            let cancel = self.cancel.clone();
            let period = job.period;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = tx.send(idx) => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(period) => {}
                    }
                }
            });
        }
        drop(tx);

        info!(jobs = self.jobs.len(), "scheduler started");

        let mut runs = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(_) = runs.join_next(), if !runs.is_empty() => {}
                tick = rx.recv() => match tick {
                    Some(idx) => {
                        let job = Arc::clone(&self.jobs[idx]);
                        let factory = Arc::clone(&self.factory);
                        let cancel = self.cancel.clone();
                        let quiet = self.quiet;
                        runs.spawn(async move {
                            // errors are reported by the engine; the
                            // next tick is the retry
                            let _ = engine::run(&job, factory.as_ref(), &cancel, quiet).await;
                        });
                    }
                    None => break,
                },
            }
        }

        let drain = async {
            while runs.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace period elapsed with runs still in flight");
        }

        Ok(())
    }
}
