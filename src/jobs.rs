use crate::{
    models::{ApiError, ImportRequest, ImportResponse},
    pipeline::ImportPipeline,
    store::TrackingStore,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    request: ImportRequest,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: ImportResponse },
    Failed { error: String, stage: Option<String> },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    /// One worker drains the queue; imports submitted here run strictly
    /// one at a time, which keeps source-API pressure predictable.
    pub fn spawn(pipeline: ImportPipeline) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(job.id, JobState::Running);
                }

                let result = pipeline.run(job.request).await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(response) => {
                        guard.insert(job.id, JobState::Completed { result: response });
                    }
                    Err(err) => {
                        guard.insert(
                            job.id,
                            JobState::Failed {
                                error: err.detail().to_string(),
                                stage: Some(err.stage().to_string()),
                            },
                        );
                    }
                }
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_import(&self, request: ImportRequest) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobState::Queued);
        }
        let job = Job { id, request };
        self.tx.send(job).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

/// Periodic sweep re-importing rows whose `last_sync_at` has aged past
/// `STALE_AFTER_HOURS`. Each pass takes at most `RESYNC_BATCH` rows,
/// oldest first, and runs them with `force_sync` on.
pub fn spawn_stale_resync(pipeline: ImportPipeline, tracking: TrackingStore) -> JoinHandle<()> {
    let interval = resync_interval_from_env();
    let stale_after_hours = stale_after_hours_from_env();
    let batch = resync_batch_from_env();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the sweep starts
        // one full interval after boot.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stale = match tracking.stale_records(stale_after_hours, batch).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(target = "caravel.jobs", error = %err, "stale sweep query failed");
                    continue;
                }
            };
            if stale.is_empty() {
                continue;
            }
            info!(
                target = "caravel.jobs",
                count = stale.len(),
                "re-syncing stale records"
            );
            for record in stale {
                let request = ImportRequest {
                    source_id: record.source_id,
                    force_sync: true,
                };
                if let Err(err) = pipeline.run(request).await {
                    warn!(
                        target = "caravel.jobs",
                        source_id = record.source_id,
                        stage = err.stage(),
                        error = %err,
                        "stale re-sync failed"
                    );
                    // Defer the failed row to the back of the stale queue.
                    if let Err(err) = tracking.touch_sync(record.source_id).await {
                        warn!(
                            target = "caravel.jobs",
                            source_id = record.source_id,
                            error = %err,
                            "stale record could not be deferred"
                        );
                    }
                }
            }
        }
    })
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

fn resync_interval_from_env() -> Duration {
    let secs = std::env::var("RESYNC_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3600);
    Duration::from_secs(secs)
}

pub(crate) fn stale_after_hours_from_env() -> i64 {
    std::env::var("STALE_AFTER_HOURS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(24)
}

fn resync_batch_from_env() -> i64 {
    std::env::var("RESYNC_BATCH")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(50)
}
