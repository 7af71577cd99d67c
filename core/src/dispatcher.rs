//! Task Dispatcher: offloads Coordinator provisioning work from the HTTP
//! request handler onto a background worker pool, backed by a
//! database-persisted queue so a restarted orchestrator does not lose
//! pending provisioning.
//!
//! Workers do not hold an in-memory handoff channel; they poll the
//! `provisioning_queue` table directly. A row is claimed with a
//! `FOR UPDATE SKIP LOCKED` style CAS so two workers (in this process or a
//! sibling one) never pick up the same task, and deleted once a worker has
//! attempted delivery. Delivery is at-least-once: the Coordinator's
//! provisioning steps tolerate replays.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::coordinator::LifecycleCoordinator;
use crate::repository::now_millis;

/// A handle for enqueuing provisioning tasks. Cheap to clone; every clone
/// shares the same durable queue.
#[derive(Clone)]
pub struct TaskDispatcher {
    pool: PgPool,
}

struct ClaimedTask {
    row_id: i64,
    job_id: Uuid,
}

impl TaskDispatcher {
    /// Spawn `worker_count` polling workers, each claiming and processing
    /// one row at a time from the durable queue until `shutdown` fires.
    pub fn spawn(
        pool: PgPool,
        coordinator: Arc<LifecycleCoordinator>,
        worker_count: usize,
        poll_interval: Duration,
        claim_timeout_secs: i64,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let dispatcher = Self { pool: pool.clone() };

        for worker_id in 0..worker_count.max(1) {
            let pool = pool.clone();
            let coordinator = coordinator.clone();
            let mut shutdown = shutdown.clone();
            let worker_claim = format!("worker-{worker_id}");
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!(worker_id, "dispatcher: worker shutting down");
                                return;
                            }
                        }
                    }

                    match claim_next(&pool, &worker_claim, claim_timeout_secs).await {
                        Ok(Some(task)) => {
                            info!(worker_id, job_id = %task.job_id, "dispatcher: provisioning");
                            if let Err(e) = coordinator.provision(task.job_id).await {
                                warn!(worker_id, job_id = %task.job_id, error = %e, "dispatcher: provisioning failed");
                            }
                            if let Err(e) = remove_row(&pool, task.row_id).await {
                                error!(worker_id, job_id = %task.job_id, error = %e, "dispatcher: failed to clear durable queue entry");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(worker_id, error = %e, "dispatcher: failed to poll provisioning queue");
                        }
                    }
                }
            });
        }

        let _ = shutdown.borrow_and_update();
        dispatcher
    }

    /// Persist a provisioning task to the durable queue. A worker picks it
    /// up on its next poll; no in-memory handoff is attempted, so a crash
    /// between this call and the next poll loses nothing.
    pub async fn enqueue(&self, job_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO provisioning_queue (job_id, enqueued_at) VALUES ($1, $2)")
            .bind(job_id)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Claim the oldest unclaimed (or stale-claimed) row via a
/// `FOR UPDATE SKIP LOCKED` subselect, so concurrent pollers never observe
/// or claim the same row.
async fn claim_next(
    pool: &PgPool,
    claimant: &str,
    claim_timeout_secs: i64,
) -> Result<Option<ClaimedTask>, sqlx::Error> {
    let now = now_millis();
    let stale_before = now - claim_timeout_secs * 1000;

    let row: Option<(i64, Uuid)> = sqlx::query_as(
        r"
        UPDATE provisioning_queue
        SET claimed_by = $1, claimed_at = $2
        WHERE id = (
            SELECT id FROM provisioning_queue
            WHERE claimed_at IS NULL OR claimed_at < $3
            ORDER BY enqueued_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING id, job_id
        ",
    )
    .bind(claimant)
    .bind(now)
    .bind(stale_before)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(row_id, job_id)| ClaimedTask { row_id, job_id }))
}

async fn remove_row(pool: &PgPool, row_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM provisioning_queue WHERE id = $1")
        .bind(row_id)
        .execute(pool)
        .await?;
    Ok(())
}
