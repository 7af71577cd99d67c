//! Status Reconciler: the periodic task that diffs cluster observations
//! against the repository and drives the status graph in one direction,
//! cluster → database.

use std::sync::Arc;
use std::time::Duration;

use job_runner_common::{BatchJob, BatchStatus};
use tracing::{error, info, warn};

use crate::coordinator::LifecycleCoordinator;
use crate::k8s::{ClusterAdapter, JobObservation};
use crate::repository::{now_millis, JobRepository, StatusUpdate};
use crate::storage::ObjectStore;

/// What one record's transition, if any, should do to cluster and
/// repository state. A pure decision derived from the §4.5 table, kept
/// separate from I/O so it can be unit-tested exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    NoChange,
    IncrementUnseen,
    ResetUnseen,
    Transition {
        new_status: BatchStatus,
        start_time: Option<i64>,
        stop_time: Option<i64>,
        launch_cleanup: bool,
        set_output_url: bool,
    },
}

/// Apply the §4.5 transition table for one record given its current status
/// and the freshest cluster observations. `now` is passed in rather than
/// read from a clock so the function stays pure and testable.
fn decide_transition(
    current: BatchStatus,
    primary: Option<&JobObservation>,
    cleanup: Option<&JobObservation>,
    ticks_unseen: i32,
    grace_ticks: i32,
    now: i64,
) -> Outcome {
    match current {
        BatchStatus::Created => match primary {
            None => {
                if ticks_unseen + 1 >= grace_ticks {
                    Outcome::Transition {
                        new_status: BatchStatus::Failed,
                        start_time: None,
                        stop_time: Some(now),
                        launch_cleanup: false,
                        set_output_url: false,
                    }
                } else {
                    Outcome::IncrementUnseen
                }
            }
            Some(obs) if obs.is_failed() => Outcome::Transition {
                new_status: BatchStatus::Failed,
                start_time: None,
                stop_time: Some(now),
                launch_cleanup: false,
                set_output_url: false,
            },
            Some(obs) if obs.is_succeeded() => Outcome::Transition {
                new_status: BatchStatus::Cleaning,
                start_time: obs.start_time.or(Some(now)),
                stop_time: obs.completion_time.or(Some(now)),
                launch_cleanup: true,
                set_output_url: false,
            },
            Some(obs) => Outcome::Transition {
                new_status: BatchStatus::Running,
                start_time: obs.start_time.or(Some(now)),
                stop_time: None,
                launch_cleanup: false,
                set_output_url: false,
            },
        },
        BatchStatus::Running => match primary {
            Some(obs) if obs.is_failed() => Outcome::Transition {
                new_status: BatchStatus::Failed,
                start_time: None,
                stop_time: Some(obs.completion_time.unwrap_or(now)),
                launch_cleanup: false,
                set_output_url: false,
            },
            Some(obs) if obs.is_succeeded() => Outcome::Transition {
                new_status: BatchStatus::Cleaning,
                start_time: None,
                stop_time: Some(obs.completion_time.unwrap_or(now)),
                launch_cleanup: true,
                set_output_url: false,
            },
            _ => Outcome::NoChange,
        },
        BatchStatus::Cleaning => match cleanup {
            None => {
                if ticks_unseen + 1 >= grace_ticks {
                    Outcome::Transition {
                        new_status: BatchStatus::Failed,
                        start_time: None,
                        stop_time: Some(now),
                        launch_cleanup: false,
                        set_output_url: false,
                    }
                } else {
                    Outcome::IncrementUnseen
                }
            }
            Some(obs) if obs.is_failed() => Outcome::Transition {
                new_status: BatchStatus::Failed,
                start_time: None,
                stop_time: Some(now),
                launch_cleanup: false,
                set_output_url: false,
            },
            Some(obs) if obs.is_succeeded() => Outcome::Transition {
                new_status: BatchStatus::Succeeded,
                start_time: None,
                stop_time: None,
                launch_cleanup: false,
                set_output_url: true,
            },
            Some(_active) => Outcome::ResetUnseen,
        },
        // Terminal statuses never reach the reconciler: `list_non_terminal`
        // excludes them.
        BatchStatus::Failed | BatchStatus::Killed | BatchStatus::Succeeded => Outcome::NoChange,
    }
}

pub struct StatusReconciler {
    repository: Arc<dyn JobRepository>,
    cluster: Arc<dyn ClusterAdapter>,
    storage: Arc<dyn ObjectStore>,
    coordinator: Arc<LifecycleCoordinator>,
    grace_ticks: i32,
}

impl StatusReconciler {
    #[must_use]
    pub fn new(
        repository: Arc<dyn JobRepository>,
        cluster: Arc<dyn ClusterAdapter>,
        storage: Arc<dyn ObjectStore>,
        coordinator: Arc<LifecycleCoordinator>,
        grace_ticks: i32,
    ) -> Self {
        Self {
            repository,
            cluster,
            storage,
            coordinator,
            grace_ticks,
        }
    }

    /// Run the reconciler on a fixed interval until `shutdown` fires. Ticks
    /// do not overlap: a non-blocking `try_lock` on a shared guard skips a
    /// tick outright if the previous one is still running, rather than
    /// queuing behind it. `MissedTickBehavior::Delay` means a slow tick
    /// causes the next scheduled one to be skipped rather than fired in a
    /// catch-up burst.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let guard = Arc::new(tokio::sync::Mutex::new(()));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler: shutting down");
                        return;
                    }
                    continue;
                }
            }

            let Ok(permit) = guard.clone().try_lock_owned() else {
                warn!("reconciler: previous tick still running, skipping this one");
                continue;
            };
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = this.tick().await {
                    error!(error = %e, "reconciler tick failed");
                }
            });
        }
    }

    /// One reconciliation pass: load a snapshot, diff against the cluster,
    /// apply transitions via CAS (so a concurrent cancel can't be
    /// overwritten), and tear down every record that just went terminal.
    pub async fn tick(&self) -> Result<(), crate::repository::RepoError> {
        let records = self.repository.list_non_terminal().await?;
        if records.is_empty() {
            return Ok(());
        }
        let observations = match self.cluster.list_jobs().await {
            Ok(obs) => obs,
            Err(e) => {
                warn!(error = %e.message, "reconciler: list_jobs failed, skipping this tick");
                return Ok(());
            }
        };

        for record in records {
            if let Err(e) = self.reconcile_one(&record, &observations).await {
                warn!(job_name = %record.name, error = %e, "reconciler: failed to reconcile record");
            }
        }
        Ok(())
    }

    async fn reconcile_one(
        &self,
        record: &BatchJob,
        observations: &std::collections::HashMap<String, JobObservation>,
    ) -> Result<(), crate::repository::RepoError> {
        let primary = observations.get(&record.name);
        let cleanup = record
            .cleanup_launched
            .then(|| observations.get(&record.cleanup_job_name()))
            .flatten();

        let outcome = decide_transition(
            record.status,
            primary,
            cleanup,
            record.created_ticks_unseen,
            self.grace_ticks,
            now_millis(),
        );

        match outcome {
            Outcome::NoChange => Ok(()),
            Outcome::IncrementUnseen => {
                self.repository
                    .cas_status(
                        record.id,
                        &[record.status],
                        StatusUpdate {
                            status: record.status,
                            created_ticks_unseen: Some(record.created_ticks_unseen + 1),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Outcome::ResetUnseen => {
                if record.created_ticks_unseen != 0 {
                    self.repository
                        .cas_status(
                            record.id,
                            &[record.status],
                            StatusUpdate {
                                status: record.status,
                                created_ticks_unseen: Some(0),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                Ok(())
            }
            Outcome::Transition {
                new_status,
                start_time,
                stop_time,
                launch_cleanup,
                set_output_url,
            } => {
                if launch_cleanup {
                    if let Err(e) = self.cluster.create_cleanup_job(record).await {
                        warn!(job_name = %record.name, error = %e.message, "failed to launch cleanup job, retrying next tick");
                        return Ok(());
                    }
                }

                let output_file_url =
                    set_output_url.then(|| self.storage.url_for(&record.output_object_key()));

                let applied = self
                    .repository
                    .cas_status(
                        record.id,
                        &[record.status],
                        StatusUpdate {
                            status: new_status,
                            start_time,
                            stop_time,
                            output_file_url,
                            cleanup_launched: launch_cleanup.then_some(true),
                            created_ticks_unseen: Some(0),
                            ..Default::default()
                        },
                    )
                    .await?;

                if !applied {
                    info!(job_name = %record.name, "reconciler: CAS lost a race, record changed since snapshot");
                    return Ok(());
                }

                if new_status.is_terminal() {
                    if let Some(updated) = self.repository.get(record.id).await? {
                        self.coordinator.teardown(&updated).await;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(active: i32, succeeded: i32, failed: i32) -> JobObservation {
        JobObservation {
            active,
            succeeded,
            failed,
            start_time: Some(1_000),
            completion_time: Some(2_000),
        }
    }

    #[test]
    fn created_with_no_observation_increments_unseen_until_grace() {
        assert_eq!(
            decide_transition(BatchStatus::Created, None, None, 0, 2, 5_000),
            Outcome::IncrementUnseen
        );
        assert_eq!(
            decide_transition(BatchStatus::Created, None, None, 1, 2, 5_000),
            Outcome::Transition {
                new_status: BatchStatus::Failed,
                start_time: None,
                stop_time: Some(5_000),
                launch_cleanup: false,
                set_output_url: false,
            }
        );
    }

    #[test]
    fn created_becomes_running_when_active() {
        let o = obs(1, 0, 0);
        let outcome = decide_transition(BatchStatus::Created, Some(&o), None, 0, 2, 5_000);
        assert_eq!(
            outcome,
            Outcome::Transition {
                new_status: BatchStatus::Running,
                start_time: Some(1_000),
                stop_time: None,
                launch_cleanup: false,
                set_output_url: false,
            }
        );
    }

    #[test]
    fn running_succeeded_launches_cleanup_and_becomes_cleaning() {
        let o = obs(0, 1, 0);
        let outcome = decide_transition(BatchStatus::Running, Some(&o), None, 0, 2, 5_000);
        assert_eq!(
            outcome,
            Outcome::Transition {
                new_status: BatchStatus::Cleaning,
                start_time: None,
                stop_time: Some(2_000),
                launch_cleanup: true,
                set_output_url: false,
            }
        );
    }

    #[test]
    fn running_failed_becomes_failed() {
        let o = obs(0, 0, 1);
        let outcome = decide_transition(BatchStatus::Running, Some(&o), None, 0, 2, 5_000);
        assert_eq!(
            outcome,
            Outcome::Transition {
                new_status: BatchStatus::Failed,
                start_time: None,
                stop_time: Some(2_000),
                launch_cleanup: false,
                set_output_url: false,
            }
        );
    }

    #[test]
    fn running_active_is_no_change() {
        let o = obs(1, 0, 0);
        assert_eq!(
            decide_transition(BatchStatus::Running, Some(&o), None, 0, 2, 5_000),
            Outcome::NoChange
        );
    }

    #[test]
    fn cleaning_succeeded_sets_output_url_and_succeeds() {
        let cleanup = obs(0, 1, 0);
        let outcome = decide_transition(BatchStatus::Cleaning, None, Some(&cleanup), 0, 2, 5_000);
        assert_eq!(
            outcome,
            Outcome::Transition {
                new_status: BatchStatus::Succeeded,
                start_time: None,
                stop_time: None,
                launch_cleanup: false,
                set_output_url: true,
            }
        );
    }

    #[test]
    fn cleaning_missing_after_grace_fails() {
        assert_eq!(
            decide_transition(BatchStatus::Cleaning, None, None, 0, 2, 9_000),
            Outcome::IncrementUnseen
        );
        assert_eq!(
            decide_transition(BatchStatus::Cleaning, None, None, 1, 2, 9_000),
            Outcome::Transition {
                new_status: BatchStatus::Failed,
                start_time: None,
                stop_time: Some(9_000),
                launch_cleanup: false,
                set_output_url: false,
            }
        );
    }

    #[test]
    fn terminal_statuses_never_transition() {
        for status in [BatchStatus::Failed, BatchStatus::Killed, BatchStatus::Succeeded] {
            assert_eq!(
                decide_transition(status, None, None, 0, 2, 1_000),
                Outcome::NoChange
            );
        }
    }
}
