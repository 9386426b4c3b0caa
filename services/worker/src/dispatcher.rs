//! Fans a request out into one task per camera.

use crate::analyzer::AnalyzerRegistry;
use crate::camera::CameraConnector;
use crate::config::{DispatcherConfig, SamplingConfig};
use crate::request::AnalysisRequest;
use crate::sink::SinkProvider;
use crate::task::{CameraTask, TaskOutcome, TaskReport, TaskSettings};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Per-job task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobSummary {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// True when the job had cameras and none of them succeeded or was
    /// cancelled.
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}

/// Runs camera tasks with bounded parallelism.
pub struct Dispatcher {
    registry: Arc<AnalyzerRegistry>,
    connector: Arc<dyn CameraConnector>,
    sinks: Arc<dyn SinkProvider>,
    semaphore: Arc<Semaphore>,
    sampling: SamplingConfig,
}

impl Dispatcher {
    /// `max_concurrent_tasks == 0` means no limit.
    pub fn new(
        registry: Arc<AnalyzerRegistry>,
        connector: Arc<dyn CameraConnector>,
        sinks: Arc<dyn SinkProvider>,
        config: &DispatcherConfig,
        sampling: SamplingConfig,
    ) -> Self {
        let permits = match config.max_concurrent_tasks {
            0 => Semaphore::MAX_PERMITS,
            n => n,
        };

        Self {
            registry,
            connector,
            sinks,
            semaphore: Arc::new(Semaphore::new(permits)),
            sampling,
        }
    }

    /// Run one task per camera of `request` and wait for all of them.
    ///
    /// A task that fails or panics only affects its own count. Tasks still
    /// waiting for a slot when `cancel` fires end as cancelled without
    /// touching their camera.
    #[instrument(skip_all, fields(submission_id = %request.submission_id, cameras = request.cameras.len()))]
    pub async fn run(&self, request: &AnalysisRequest, cancel: CancellationToken) -> JobSummary {
        let settings = Arc::new(TaskSettings::from_request(request, &self.sampling));
        let mut tasks = JoinSet::new();

        info!(
            analyzer = %settings.analysis_class,
            interval_secs = request.interval,
            duration_secs = request.duration,
            "Dispatching camera tasks"
        );

        for descriptor in &request.cameras {
            let task = CameraTask::new(
                descriptor.clone(),
                settings.clone(),
                self.registry.clone(),
                self.connector.clone(),
                self.sinks.clone(),
            );
            let semaphore = self.semaphore.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };

                match permit {
                    Some(_permit) => task.run(cancel).await,
                    None => TaskReport {
                        camera_id: task.camera_id().to_string(),
                        outcome: TaskOutcome::Cancelled,
                        stats: Default::default(),
                    },
                }
            });
        }

        let mut summary = JobSummary {
            total: request.cameras.len(),
            ..Default::default()
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => summary.record(&report.outcome),
                Err(e) => {
                    metrics::counter!("camfleet.tasks.failed").increment(1);
                    error!(error = %e, "Camera task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Job finished"
        );

        summary
    }
}
