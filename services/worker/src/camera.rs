//! Camera capability contract and the per-task stream session.

use crate::frame_buffer::Frame;
use crate::request::CameraDescriptor;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while talking to a camera.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Camera unreachable: {0}")]
    Unreachable(String),

    #[error("Corrupted frame: {0}")]
    CorruptedFrame(String),

    #[error("Stream is not open")]
    StreamClosed,
}

impl CameraError {
    /// Transient errors are retried on the next tick; everything else is fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CorruptedFrame(_))
    }
}

/// How frames are read from a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// One HTTP request per snapshot
    Image,
    /// A long-lived multipart JPEG stream
    Mjpeg,
}

impl StreamFormat {
    pub fn from_is_video(is_video: bool) -> Self {
        if is_video {
            Self::Mjpeg
        } else {
            Self::Image
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Mjpeg => write!(f, "mjpeg"),
        }
    }
}

/// The three operations the sampler needs from a camera.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Camera: Send {
    /// Establish the stream. Fails with `Unreachable` if the camera cannot be reached.
    async fn open(&mut self, format: StreamFormat) -> Result<(), CameraError>;

    /// Fetch the next frame.
    async fn fetch_frame(&mut self) -> Result<Frame, CameraError>;

    /// Release the stream.
    async fn close(&mut self);
}

/// Builds a camera client for a descriptor.
pub trait CameraConnector: Send + Sync {
    fn connect(&self, descriptor: &CameraDescriptor) -> Result<Box<dyn Camera>, CameraError>;
}

/// State of a camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open(StreamFormat),
}

/// Owns the open/closed state of one camera's stream.
pub struct CameraSession {
    camera_id: String,
    camera: Box<dyn Camera>,
    state: SessionState,
}

impl CameraSession {
    pub fn new(camera_id: impl Into<String>, camera: Box<dyn Camera>) -> Self {
        Self {
            camera_id: camera_id.into(),
            camera,
            state: SessionState::Closed,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open(_))
    }

    /// Open the stream in the given format.
    pub async fn open(&mut self, format: StreamFormat) -> Result<(), CameraError> {
        self.camera.open(format).await?;
        self.state = SessionState::Open(format);
        info!(camera_id = %self.camera_id, format = %format, "Camera stream opened");
        Ok(())
    }

    /// Fetch a frame from the open stream.
    pub async fn fetch_frame(&mut self) -> Result<Frame, CameraError> {
        if !self.is_open() {
            return Err(CameraError::StreamClosed);
        }
        self.camera.fetch_frame().await
    }

    /// Close the stream. Does nothing if it is not open.
    pub async fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        self.camera.close().await;
        self.state = SessionState::Closed;
        debug!(camera_id = %self.camera_id, "Camera stream closed");
    }
}
