// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::JobQueue;
use crate::error::{QueueError, RepositoryError};
use crate::job::{Ingestor, Outcome};

/// A fixed number of workers pulling jobs from the queue
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    ingestor: Arc<Ingestor>,
    workers: usize,
    poll_interval: Duration,
    /// Prefix that keeps worker ids unique across processes
    pool_id: String,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        ingestor: Arc<Ingestor>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        let pool_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            queue,
            ingestor,
            workers: workers.max(1),
            poll_interval,
            pool_id,
        }
    }

    /// Run workers until `shutdown` is cancelled.
    ///
    /// Workers stop claiming once shutdown is requested and finish the job
    /// they hold.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(workers = self.workers, pool = %self.pool_id, "starting worker pool");

        let handles: Vec<_> = (0..self.workers)
            .map(|n| {
                let worker = Worker {
                    name: format!("{}-w{}", self.pool_id, n),
                    queue: self.queue.clone(),
                    ingestor: self.ingestor.clone(),
                    poll_interval: self.poll_interval,
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!("worker task failed: {}", e);
            }
        }

        info!(pool = %self.pool_id, "worker pool stopped");
    }

    /// Run workers until no job is left in a non-terminal state
    pub async fn run_until_idle(&self) -> Result<(), QueueError> {
        let shutdown = CancellationToken::new();
        let pool = self.run(shutdown.clone());
        tokio::pin!(pool);

        loop {
            tokio::select! {
                _ = &mut pool => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            match self.queue.has_unfinished().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    shutdown.cancel();
                    pool.await;
                    return Err(e);
                }
            }
        }

        debug!("queue drained");
        shutdown.cancel();
        pool.await;
        Ok(())
    }
}

struct Worker {
    name: String,
    queue: Arc<JobQueue>,
    ingestor: Arc<Ingestor>,
    poll_interval: Duration,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        debug!(worker = %self.name, "worker started");

        while !shutdown.is_cancelled() {
            match self
                .queue
                .claim(&self.name, self.ingestor.lease_duration())
                .await
            {
                Ok(Some((claim, token))) => {
                    let job_id = claim.job.id;
                    match self.ingestor.process(claim, &self.name, &token).await {
                        Ok(Outcome::Attached(episode)) => {
                            debug!(worker = %self.name, job = %job_id, episode = %episode.id, "job attached")
                        }
                        Ok(Outcome::Rescheduled { retry_at }) => {
                            debug!(worker = %self.name, job = %job_id, %retry_at, "job rescheduled")
                        }
                        Ok(Outcome::Failed(failure)) => {
                            debug!(worker = %self.name, job = %job_id, "job failed: {}", failure)
                        }
                        Err(e @ RepositoryError::LeaseLost { .. }) => {
                            warn!(worker = %self.name, job = %job_id, "{}", e)
                        }
                        Err(e) => {
                            error!(worker = %self.name, job = %job_id, "job aborted: {}", e)
                        }
                    }
                    self.queue.release(job_id).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queue.wait_for_work(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker = %self.name, "failed to claim job: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        debug!(worker = %self.name, "worker stopped");
    }
}
