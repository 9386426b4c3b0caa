//! Camfleet Worker
//!
//! Runs an analysis program across a fleet of network cameras. Each camera
//! gets an independent task that samples frames at a fixed rate for a bounded
//! duration, keeps a sliding window of the most recent frames, and feeds them
//! to an analyzer whose results go to a per-camera result store.
//!
//! ## Architecture
//!
//! ```text
//!                     AnalysisRequest
//!                           │
//!                           ▼
//!                    ┌──────────────┐
//!                    │ Dispatcher   │  one task per camera, bounded pool
//!                    └──────────────┘
//!                      │    │    │
//!                      ▼    ▼    ▼
//!                    ┌──────────────┐
//!                    │ CameraTask   │  failures stop here
//!                    └──────────────┘
//!                      │          │
//!                      ▼          ▼
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐   ┌──────────────┐
//! │ HttpCamera   │◀─│ FrameSampler │─▶│ Analyzer     │──▶│ ResultSink   │
//! │ snapshot or  │  │ fixed-rate   │  │ Runtime      │   │ local or S3  │
//! │ MJPEG        │  │ capture loop │  │ FrameBuffer  │   └──────────────┘
//! └──────────────┘  └──────────────┘  └──────────────┘
//! ```

pub mod analyzer;
pub mod analyzers;
pub mod camera;
pub mod config;
pub mod dispatcher;
pub mod frame_buffer;
pub mod http_camera;
pub mod metadata;
pub mod mjpeg;
pub mod request;
pub mod sampler;
pub mod sink;
pub mod task;

pub use analyzer::{
    AnalysisContext, AnalysisError, Analyzer, AnalyzerError, AnalyzerRegistry, AnalyzerRuntime,
};
pub use analyzers::{MotionAnalyzer, SnapshotAnalyzer};
pub use camera::{Camera, CameraConnector, CameraError, CameraSession, StreamFormat};
pub use config::WorkerConfig;
pub use dispatcher::{Dispatcher, JobSummary};
pub use frame_buffer::{BufferError, Frame, FrameBuffer, FrameRecord};
pub use http_camera::{HttpCamera, HttpCameraConnector};
pub use metadata::{CameraMetadata, FrameMetadata};
pub use request::{AnalysisRequest, CameraDescriptor, RequestError};
pub use sampler::{FrameSampler, SamplerError, SamplerState, SamplerStats};
pub use sink::{LocalResultStore, ResultSink, ResultValue, S3ResultStore, SinkError, SinkProvider};
pub use task::{CameraTask, TaskOutcome, TaskReport, TaskSettings};
