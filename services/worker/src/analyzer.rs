//! Analyzer lifecycle contract and the runtime that drives it.
//!
//! An analyzer sees the camera through an [`AnalysisContext`]: the recent
//! frames held in the task's [`FrameBuffer`], the camera's metadata, and a
//! `save` call bound to the camera's result sink.
//!
//! ```text
//! initialize ──> on_new_frame (once per captured frame) ──> finalize
//! ```
//!
//! `finalize` only runs when the sampling window elapsed normally.

use crate::frame_buffer::{BufferError, Frame, FrameBuffer};
use crate::metadata::{CameraMetadata, FrameMetadata};
use crate::sink::{ResultSink, ResultValue, SinkError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors returned by analyzer code.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),

    #[error("{0}")]
    Failed(String),
}

/// Errors raised by the analyzer runtime, tagged with the lifecycle step.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Unknown analyzer '{0}'")]
    UnknownAnalyzer(String),

    #[error("Analyzer initialization failed: {0}")]
    Initialize(#[source] AnalysisError),

    #[error("Analyzer failed on frame {sequence_num}: {source}")]
    Frame {
        sequence_num: u64,
        #[source]
        source: AnalysisError,
    },

    #[error("Analyzer finalization failed: {0}")]
    Finalize(#[source] AnalysisError),
}

/// What an analyzer can see and do during a lifecycle call.
pub struct AnalysisContext<'a> {
    buffer: &'a FrameBuffer,
    sink: &'a dyn ResultSink,
    camera: &'a CameraMetadata,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(
        buffer: &'a FrameBuffer,
        sink: &'a dyn ResultSink,
        camera: &'a CameraMetadata,
    ) -> Self {
        Self {
            buffer,
            sink,
            camera,
        }
    }

    /// The `index`-th most recent frame (0 = newest).
    pub fn frame(&self, index: usize) -> Result<&'a Frame, AnalysisError> {
        Ok(self.buffer.frame(index)?)
    }

    /// Metadata of the `index`-th most recent frame.
    pub fn frame_metadata(&self, index: usize) -> Result<&'a FrameMetadata, AnalysisError> {
        Ok(self.buffer.metadata(index)?)
    }

    pub fn frames_available(&self) -> usize {
        self.buffer.len()
    }

    pub fn camera(&self) -> &'a CameraMetadata {
        self.camera
    }

    /// Persist a result for this camera.
    pub async fn save(
        &self,
        name: impl AsRef<str>,
        value: impl Into<ResultValue>,
    ) -> Result<(), AnalysisError> {
        self.sink.save(name.as_ref(), value.into()).await?;
        Ok(())
    }
}

/// A user analysis routine.
///
/// `on_new_frame` is required; `initialize` and `finalize` do nothing unless
/// overridden.
#[async_trait]
pub trait Analyzer: Send {
    /// Called once before the camera stream is opened.
    async fn initialize(&mut self, _ctx: &AnalysisContext<'_>) -> Result<(), AnalysisError> {
        Ok(())
    }

    /// Called once per captured frame. The new frame is at index 0.
    async fn on_new_frame(&mut self, ctx: &AnalysisContext<'_>) -> Result<(), AnalysisError>;

    /// Called once after the sampling window elapsed.
    async fn finalize(&mut self, _ctx: &AnalysisContext<'_>) -> Result<(), AnalysisError> {
        Ok(())
    }
}

/// Owns one analyzer together with its frame buffer and result sink.
pub struct AnalyzerRuntime {
    analyzer: Box<dyn Analyzer>,
    buffer: FrameBuffer,
    sink: Box<dyn ResultSink>,
    camera: Arc<CameraMetadata>,
}

impl AnalyzerRuntime {
    pub fn new(
        analyzer: Box<dyn Analyzer>,
        snapshots_to_keep: usize,
        sink: Box<dyn ResultSink>,
        camera: Arc<CameraMetadata>,
    ) -> Result<Self, BufferError> {
        Ok(Self {
            analyzer,
            buffer: FrameBuffer::new(snapshots_to_keep)?,
            sink,
            camera,
        })
    }

    pub fn camera(&self) -> &Arc<CameraMetadata> {
        &self.camera
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn frame(&self, index: usize) -> Result<&Frame, BufferError> {
        self.buffer.frame(index)
    }

    pub fn frame_metadata(&self, index: usize) -> Result<&FrameMetadata, BufferError> {
        self.buffer.metadata(index)
    }

    pub async fn initialize(&mut self) -> Result<(), AnalyzerError> {
        let ctx = AnalysisContext::new(&self.buffer, self.sink.as_ref(), &self.camera);
        self.analyzer
            .initialize(&ctx)
            .await
            .map_err(AnalyzerError::Initialize)
    }

    /// Add a captured frame to the buffer and hand it to the analyzer.
    pub async fn push_frame(
        &mut self,
        frame: Frame,
        metadata: FrameMetadata,
    ) -> Result<(), AnalyzerError> {
        let sequence_num = metadata.sequence_num();
        self.buffer.push(frame, metadata);

        let ctx = AnalysisContext::new(&self.buffer, self.sink.as_ref(), &self.camera);
        self.analyzer
            .on_new_frame(&ctx)
            .await
            .map_err(|source| AnalyzerError::Frame {
                sequence_num,
                source,
            })
    }

    pub async fn finalize(&mut self) -> Result<(), AnalyzerError> {
        let ctx = AnalysisContext::new(&self.buffer, self.sink.as_ref(), &self.camera);
        self.analyzer
            .finalize(&ctx)
            .await
            .map_err(AnalyzerError::Finalize)
    }
}

type AnalyzerFactory = Box<dyn Fn(&CameraMetadata) -> Box<dyn Analyzer> + Send + Sync>;

/// Analyzers available to jobs, by name.
#[derive(Default)]
pub struct AnalyzerRegistry {
    factories: HashMap<String, AnalyzerFactory>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the analyzers that ship with the worker.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::analyzers::register_builtins(&mut registry);
        registry
    }

    /// Register a factory under `name`, replacing any earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&CameraMetadata) -> Box<dyn Analyzer> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(analyzer = %name, "Registered analyzer");
        self.factories.insert(name, Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build a fresh analyzer instance for one camera.
    pub fn create(
        &self,
        name: &str,
        camera: &CameraMetadata,
    ) -> Result<Box<dyn Analyzer>, AnalyzerError> {
        self.factories
            .get(name)
            .map(|factory| factory(camera))
            .ok_or_else(|| AnalyzerError::UnknownAnalyzer(name.to_string()))
    }
}
