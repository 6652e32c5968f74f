//! Retention sweeper.
//!
//! On a fixed interval, reclaims terminal jobs whose `delete_at` has
//! elapsed: blobs first (best-effort, idempotent), then the row. Also reaps
//! PENDING rows old enough to be orphans of the insert-then-enqueue window.
//! Blob deletes are idempotent and the row delete is last, so a failed cycle
//! simply retries on the next tick; running two sweepers wastes work but
//! stays correct.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::jobs;
use crate::models::job::Job;
use crate::services::storage::ObjectStorage;

pub struct Sweeper {
    db: PgPool,
    storage: Arc<ObjectStorage>,
    interval: Duration,
    batch_size: i64,
    pending_max_age_hours: i64,
}

impl Sweeper {
    pub fn new(
        db: PgPool,
        storage: Arc<ObjectStorage>,
        interval: Duration,
        batch_size: i64,
        pending_max_age_hours: i64,
    ) -> Self {
        Self {
            db,
            storage,
            interval,
            batch_size,
            pending_max_age_hours,
        }
    }

    /// Run sweep cycles until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "sweeper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "sweep cycle failed");
                    }
                }
            }
        }
    }

    /// One full cycle: expired terminal rows, then stale PENDING orphans.
    pub async fn sweep(&self) -> Result<(), sqlx::Error> {
        let start = std::time::Instant::now();

        let expired = jobs::jobs_to_cleanup(&self.db, self.batch_size).await?;
        let mut cleaned = 0usize;
        let mut errors = 0usize;
        for job in &expired {
            if self.remove_job(job).await {
                cleaned += 1;
            } else {
                errors += 1;
            }
        }

        let orphans =
            jobs::stale_pending_jobs(&self.db, self.pending_max_age_hours, self.batch_size).await?;
        for job in &orphans {
            tracing::warn!(job_id = %job.id, created_at = %job.created_at, "reaping orphaned pending job");
            if self.remove_job(job).await {
                cleaned += 1;
            } else {
                errors += 1;
            }
        }

        if cleaned > 0 || errors > 0 {
            tracing::info!(
                cleaned,
                errors,
                duration_ms = start.elapsed().as_millis() as u64,
                "sweep cycle completed"
            );
        }

        Ok(())
    }

    /// Delete a job's blobs (best-effort) and then its row. Returns whether
    /// the row is gone.
    async fn remove_job(&self, job: &Job) -> bool {
        if !job.original_key.is_empty() {
            if let Err(e) = self.storage.delete(&job.original_key).await {
                tracing::warn!(job_id = %job.id, key = %job.original_key, error = %e, "failed to delete original blob");
            }
        }

        if !job.processed_key.is_empty() {
            if let Err(e) = self.storage.delete(&job.processed_key).await {
                tracing::warn!(job_id = %job.id, key = %job.processed_key, error = %e, "failed to delete processed blob");
            }
        }

        match jobs::delete_job(&self.db, job.id).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to delete job row");
                false
            }
        }
    }
}
