//! HTTP camera client for snapshot and MJPEG cameras.
//!
//! Snapshot mode issues one GET per frame against the camera's snapshot URL.
//! MJPEG mode keeps a single multipart response open and splits it into
//! JPEG images. Opening either kind of stream is retried with exponential
//! backoff before the camera is declared unreachable.

use crate::camera::{Camera, CameraConnector, CameraError, StreamFormat};
use crate::config::CameraConfig;
use crate::frame_buffer::Frame;
use crate::mjpeg::{MjpegParser, ParsedFrame};
use crate::request::CameraDescriptor;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How an open camera is being read.
enum StreamMode {
    Snapshot,
    Mjpeg {
        body: BoxStream<'static, reqwest::Result<Bytes>>,
        parser: MjpegParser,
    },
}

/// Camera client speaking plain HTTP.
pub struct HttpCamera {
    camera_id: String,
    snapshot_url: String,
    mjpeg_url: Option<String>,
    config: CameraConfig,
    client: reqwest::Client,
    mode: Option<StreamMode>,
}

impl HttpCamera {
    /// Create a client for one camera. Each camera gets its own connection pool.
    pub fn new(descriptor: &CameraDescriptor, config: CameraConfig) -> Result<Self, CameraError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.download_timeout())
            .build()
            .map_err(|e| CameraError::Unreachable(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            camera_id: descriptor.camera_id().to_string(),
            snapshot_url: descriptor.snapshot_url(),
            mjpeg_url: descriptor.mjpeg_url(),
            config,
            client,
            mode: None,
        })
    }

    /// Open the stream, retrying with exponential backoff.
    async fn open_with_retry(&mut self, format: StreamFormat) -> Result<StreamMode, CameraError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.reopen_base_delay(),
            max_interval: self.config.reopen_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        let max_attempts = self.config.open_attempts.max(1);

        loop {
            match self.try_open(format).await {
                Ok(mode) => return Ok(mode),
                Err(e) => {
                    attempts += 1;

                    if attempts >= max_attempts {
                        error!(
                            camera_id = %self.camera_id,
                            attempts = attempts,
                            error = %e,
                            "Giving up opening camera stream"
                        );
                        return Err(e);
                    }

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.reopen_max_delay());
                    warn!(
                        camera_id = %self.camera_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Opening camera stream failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_open(&mut self, format: StreamFormat) -> Result<StreamMode, CameraError> {
        match (format, self.mjpeg_url.clone()) {
            (StreamFormat::Mjpeg, Some(url)) => {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(unreachable)?;
                let response = check_status(response)?;

                Ok(StreamMode::Mjpeg {
                    body: response.bytes_stream().boxed(),
                    parser: MjpegParser::new(self.config.max_mjpeg_frame_bytes),
                })
            }
            (StreamFormat::Mjpeg, None) => {
                warn!(
                    camera_id = %self.camera_id,
                    "Camera has no MJPEG stream, falling back to snapshots"
                );
                self.download_snapshot().await?;
                Ok(StreamMode::Snapshot)
            }
            (StreamFormat::Image, _) => {
                self.download_snapshot().await?;
                Ok(StreamMode::Snapshot)
            }
        }
    }

    async fn download_snapshot(&mut self) -> Result<Bytes, CameraError> {
        let response = self
            .client
            .get(&self.snapshot_url)
            .timeout(self.config.download_timeout())
            .send()
            .await
            .map_err(unreachable)?;

        check_status(response)?.bytes().await.map_err(unreachable)
    }

    /// Check that a payload is an image of usable size.
    fn validate(&self, data: Bytes) -> Result<Frame, CameraError> {
        validate_frame(
            data,
            self.config.min_frame_width,
            self.config.min_frame_height,
        )
    }
}

/// Turn an encoded payload into a `Frame`, rejecting anything that is not an
/// image of at least `min_width` x `min_height`.
pub fn validate_frame(data: Bytes, min_width: u32, min_height: u32) -> Result<Frame, CameraError> {
    if data.is_empty() {
        return Err(CameraError::CorruptedFrame("empty payload".to_string()));
    }

    let (width, height) = image::ImageReader::new(Cursor::new(&data[..]))
        .with_guessed_format()
        .map_err(|e| CameraError::CorruptedFrame(e.to_string()))?
        .into_dimensions()
        .map_err(|e| CameraError::CorruptedFrame(e.to_string()))?;

    if width < min_width || height < min_height {
        return Err(CameraError::CorruptedFrame(format!(
            "resolution {}x{} below minimum {}x{}",
            width, height, min_width, min_height
        )));
    }

    Ok(Frame::new(data, width, height))
}

/// Read from an MJPEG body until the parser yields the next image.
async fn next_mjpeg_image(
    body: &mut BoxStream<'static, reqwest::Result<Bytes>>,
    parser: &mut MjpegParser,
    timeout: Duration,
) -> Result<Bytes, CameraError> {
    loop {
        match parser.next_frame() {
            Some(ParsedFrame::Complete(image)) => return Ok(image),
            Some(ParsedFrame::Oversized(dropped)) => {
                return Err(CameraError::CorruptedFrame(format!(
                    "MJPEG image exceeded {} bytes without an end marker",
                    dropped
                )))
            }
            None => {}
        }

        match tokio::time::timeout(timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => parser.push(&chunk),
            Ok(Some(Err(e))) => return Err(unreachable(e)),
            Ok(None) => return Err(CameraError::Unreachable("MJPEG stream ended".to_string())),
            Err(_) => {
                return Err(CameraError::Unreachable(format!(
                    "no MJPEG data within {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}

fn unreachable(e: reqwest::Error) -> CameraError {
    CameraError::Unreachable(e.to_string())
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CameraError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(CameraError::Unreachable(format!("HTTP status {}", status)))
    }
}

#[async_trait]
impl Camera for HttpCamera {
    async fn open(&mut self, format: StreamFormat) -> Result<(), CameraError> {
        let mode = self.open_with_retry(format).await?;
        self.mode = Some(mode);
        Ok(())
    }

    async fn fetch_frame(&mut self) -> Result<Frame, CameraError> {
        let timeout = self.config.download_timeout();

        let data = if let Some(StreamMode::Mjpeg { body, parser }) = &mut self.mode {
            next_mjpeg_image(body, parser, timeout).await?
        } else if self.mode.is_some() {
            self.download_snapshot().await?
        } else {
            return Err(CameraError::StreamClosed);
        };

        self.validate(data)
    }

    async fn close(&mut self) {
        if self.mode.take().is_some() {
            debug!(camera_id = %self.camera_id, "HTTP camera stream released");
        }
    }
}

/// Connects descriptors to `HttpCamera` clients.
#[derive(Debug, Clone)]
pub struct HttpCameraConnector {
    config: CameraConfig,
}

impl HttpCameraConnector {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl CameraConnector for HttpCameraConnector {
    fn connect(&self, descriptor: &CameraDescriptor) -> Result<Box<dyn Camera>, CameraError> {
        Ok(Box::new(HttpCamera::new(descriptor, self.config.clone())?))
    }
}
