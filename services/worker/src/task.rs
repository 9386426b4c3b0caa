//! One camera's unit of work.
//!
//! A task resolves the analyzer, builds its runtime, initializes it, opens
//! the camera and runs the sampler. Whatever happens, it ends in a
//! [`TaskReport`]; errors never leave the task.

use crate::analyzer::{AnalyzerError, AnalyzerRegistry, AnalyzerRuntime};
use crate::camera::{CameraConnector, CameraError, CameraSession, StreamFormat};
use crate::config::SamplingConfig;
use crate::frame_buffer::BufferError;
use crate::metadata::CameraMetadata;
use crate::request::{AnalysisRequest, CameraDescriptor};
use crate::sampler::{FrameSampler, SamplerError, SamplerStats};
use crate::sink::SinkProvider;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Errors that end a camera task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error("Invalid frame buffer: {0}")]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Sampler(SamplerError::Cancelled))
    }
}

/// Job-wide parameters shared by every task of a request.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub analysis_class: String,
    pub stream_format: StreamFormat,
    pub interval: Duration,
    pub duration: Duration,
    pub snapshots_to_keep: usize,
    pub max_consecutive_corrupted_frames: Option<u32>,
}

impl TaskSettings {
    pub fn from_request(request: &AnalysisRequest, sampling: &SamplingConfig) -> Self {
        Self {
            analysis_class: request.analysis_class.clone(),
            stream_format: request.stream_format(),
            interval: request.interval(),
            duration: request.duration(),
            snapshots_to_keep: request.snapshots_to_keep,
            max_consecutive_corrupted_frames: sampling.max_consecutive_corrupted_frames,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
}

/// Result of one camera task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub camera_id: String,
    pub outcome: TaskOutcome,
    pub stats: SamplerStats,
}

/// Samples and analyzes a single camera.
pub struct CameraTask {
    descriptor: CameraDescriptor,
    settings: Arc<TaskSettings>,
    registry: Arc<AnalyzerRegistry>,
    connector: Arc<dyn CameraConnector>,
    sinks: Arc<dyn SinkProvider>,
}

impl CameraTask {
    pub fn new(
        descriptor: CameraDescriptor,
        settings: Arc<TaskSettings>,
        registry: Arc<AnalyzerRegistry>,
        connector: Arc<dyn CameraConnector>,
        sinks: Arc<dyn SinkProvider>,
    ) -> Self {
        Self {
            descriptor,
            settings,
            registry,
            connector,
            sinks,
        }
    }

    pub fn camera_id(&self) -> &str {
        self.descriptor.camera_id()
    }

    /// Run the task to the end and report how it went.
    #[instrument(skip(self, cancel), fields(camera_id = %self.descriptor.camera_id()))]
    pub async fn run(self, cancel: CancellationToken) -> TaskReport {
        info!(
            analyzer = %self.settings.analysis_class,
            format = %self.settings.stream_format,
            "Camera task started"
        );

        let mut stats = SamplerStats::default();
        let outcome = match self.execute(&cancel, &mut stats).await {
            Ok(()) => {
                metrics::counter!("camfleet.tasks.completed").increment(1);
                info!(frames = stats.frames_captured, "Camera task completed");
                TaskOutcome::Completed
            }
            Err(e) if e.is_cancelled() => {
                metrics::counter!("camfleet.tasks.cancelled").increment(1);
                warn!(frames = stats.frames_captured, "Camera task cancelled");
                TaskOutcome::Cancelled
            }
            Err(e) => {
                metrics::counter!("camfleet.tasks.failed").increment(1);
                error!(
                    error = %e,
                    frames = stats.frames_captured,
                    "Camera task failed"
                );
                TaskOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        TaskReport {
            camera_id: self.descriptor.camera_id().to_string(),
            outcome,
            stats,
        }
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        stats: &mut SamplerStats,
    ) -> Result<(), TaskError> {
        let camera = Arc::new(CameraMetadata::from(&self.descriptor));

        let analyzer = self
            .registry
            .create(&self.settings.analysis_class, &camera)?;
        let sink = self.sinks.sink_for(&camera.camera_id);
        let mut runtime = AnalyzerRuntime::new(
            analyzer,
            self.settings.snapshots_to_keep,
            sink,
            camera.clone(),
        )?;

        runtime.initialize().await?;

        if cancel.is_cancelled() {
            return Err(SamplerError::Cancelled.into());
        }

        let client = self.connector.connect(&self.descriptor)?;
        let mut session = CameraSession::new(camera.camera_id.clone(), client);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SamplerError::Cancelled.into()),
            opened = session.open(self.settings.stream_format) => opened?,
        }

        let mut sampler = FrameSampler::new(self.settings.interval, self.settings.duration)
            .with_corrupted_frame_limit(self.settings.max_consecutive_corrupted_frames);

        let result = sampler.run(&mut session, &mut runtime, cancel).await;
        *stats = sampler.stats();
        result.map_err(TaskError::from)
    }
}
