use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, EnrollmentUpdate};
use crate::error::EngineError;
use crate::models::enrollment::Enrollment;
use crate::services::rate_governor::RateGovernor;
use crate::services::step_executor::{backoff_delay, StepExecutor};

/// Central dispatch loop: claims due enrollments, fans them out to the
/// step executor through a bounded worker pool, and keeps sends from a
/// single sender strictly serial.
pub struct Scheduler {
    pool: Arc<PgPool>,
    governor: Arc<RateGovernor>,
    executor: Arc<StepExecutor>,
    config: Config,
    concurrency: Arc<Semaphore>,
    sender_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        pool: Arc<PgPool>,
        governor: Arc<RateGovernor>,
        executor: Arc<StepExecutor>,
        config: Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.global_concurrency));
        Self {
            pool,
            governor,
            executor,
            config,
            concurrency,
            sender_locks: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub async fn run(&self) {
        if let Err(e) = self.recover_on_startup().await {
            tracing::error!("startup recovery failed: {}", e);
        }

        loop {
            if *self.shutdown.borrow() {
                tracing::info!("shutdown requested, scheduler stopped claiming");
                break;
            }

            let processed = match self.tick().await {
                Ok(count) => count,
                Err(e) => {
                    tracing::error!("scheduler iteration failed: {}", e);
                    0
                }
            };

            // Loop straight back around after a productive iteration;
            // idle iterations sleep unless shutdown lands first.
            if processed == 0 {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// Stale `in_flight` rows belong to a worker that died mid-dispatch.
    /// They go back to `pending` with an attempt charged, and the Rate
    /// Governor rebuilds its reservations from whatever remains.
    async fn recover_on_startup(&self) -> Result<(), EngineError> {
        let reverted =
            db::revert_stale_in_flight(self.pool.as_ref(), self.config.stale_threshold_secs).await?;
        if reverted > 0 {
            tracing::warn!("recovered {} stale in-flight enrollments", reverted);
        }
        self.governor.reconstruct_pending().await?;
        Ok(())
    }

    /// One iteration: claim a batch and run it to completion. Returns
    /// the number of enrollments processed.
    async fn tick(&self) -> Result<usize, EngineError> {
        let claimed = db::claim_due_enrollments(
            self.pool.as_ref(),
            Utc::now(),
            self.config.claim_batch_size,
        )
        .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        let senders = self.sender_emails_for(&claimed).await?;
        let count = claimed.len();

        // Group the batch by sender, preserving claim order within each
        // group. One worker per sender runs its rows sequentially, so
        // same-due-at rows hit the Rate Governor in enrollment-id order
        // and quota contention resolves deterministically.
        let mut by_sender: Vec<(String, Vec<Enrollment>)> = Vec::new();
        for enrollment in claimed {
            let sender_email = senders
                .get(&enrollment.sequence_id)
                .cloned()
                .unwrap_or_default();
            match by_sender.iter_mut().find(|(email, _)| *email == sender_email) {
                Some((_, rows)) => rows.push(enrollment),
                None => by_sender.push((sender_email, vec![enrollment])),
            }
        }

        let mut tasks = JoinSet::new();
        for (sender_email, rows) in by_sender {
            let sender_lock = self.sender_lock(&sender_email).await;
            let permit = self
                .concurrency
                .clone()
                .acquire_owned()
                .await
                .expect("scheduler semaphore closed");
            let executor = self.executor.clone();
            let pool = self.pool.clone();
            let max_attempts = self.config.max_attempts;

            tasks.spawn(async move {
                let _permit = permit;
                // The lock serializes against other batches still
                // touching this sender and keeps warmup counts monotone.
                let _sender_guard = sender_lock.lock().await;
                for enrollment in rows {
                    match executor.execute(&enrollment).await {
                        Ok(()) => {}
                        Err(EngineError::ConcurrencyConflict) => {
                            tracing::debug!(
                                enrollment = %enrollment.id,
                                "claim superseded, abandoning"
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                enrollment = %enrollment.id,
                                "unclassified executor error: {}",
                                e
                            );
                            handle_unclassified(&pool, &enrollment, &e, max_attempts).await;
                        }
                    }
                }
            });
        }

        self.wait_for_batch(&mut tasks).await;
        Ok(count)
    }

    /// Wait for the batch to finish. In steady state the wait is
    /// unbounded (a send may legitimately take its full deadline); once
    /// shutdown is requested the remaining work gets `drain_timeout`,
    /// after which abandoned rows stay `in_flight` for startup recovery.
    async fn wait_for_batch(&self, tasks: &mut JoinSet<()>) {
        let mut shutdown = self.shutdown.clone();
        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    next = tasks.join_next() => {
                        if next.is_none() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }

        let drain = Duration::from_secs(self.config.drain_timeout_secs);
        let drained = tokio::time::timeout(drain, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "drain timeout after {}s; remaining in-flight rows will be recovered at startup",
                self.config.drain_timeout_secs
            );
        }
    }

    async fn sender_emails_for(
        &self,
        claimed: &[Enrollment],
    ) -> Result<HashMap<Uuid, String>, EngineError> {
        let sequence_ids: Vec<Uuid> = claimed.iter().map(|e| e.sequence_id).collect();
        let rows: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT id, sender_email FROM sequences WHERE id = ANY($1)")
                .bind(&sequence_ids)
                .fetch_all(self.pool.as_ref())
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn sender_lock(&self, sender_email: &str) -> Arc<Mutex<()>> {
        let mut locks = self.sender_locks.lock().await;
        locks
            .entry(sender_email.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// An error the executor did not classify: retry once, then give up.
async fn handle_unclassified(
    pool: &PgPool,
    enrollment: &Enrollment,
    error: &EngineError,
    max_attempts: i32,
) {
    let attempts = enrollment.attempts + 1;
    let exhausted = attempts >= 2.min(max_attempts);
    let update = if exhausted {
        EnrollmentUpdate {
            step_index: enrollment.step_index,
            due_at: enrollment.due_at,
            status: "failed",
            attempts,
            last_error: Some(("internal_error".to_string(), error.to_string())),
        }
    } else {
        EnrollmentUpdate {
            step_index: enrollment.step_index,
            due_at: Utc::now() + backoff_delay(attempts),
            status: "pending",
            attempts,
            last_error: Some(("internal_error".to_string(), error.to_string())),
        }
    };

    if let Err(e) =
        db::persist_result(pool, enrollment.id, enrollment.version, &update, None).await
    {
        tracing::error!(
            enrollment = %enrollment.id,
            "failed to persist unclassified-error state: {}",
            e
        );
    }
}
