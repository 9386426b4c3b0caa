//! Per-camera result sinks.
//!
//! Every task receives its own sink from a `SinkProvider`. Results land at
//! `{username}/{submission_id}/{camera_id}/{name}`, either on the local
//! filesystem or under `users/` in an S3 bucket. Saving a name twice
//! overwrites the earlier result.

use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while persisting a result.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Invalid result name: {0:?}")]
    InvalidName(String),

    #[error("Failed to write result: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to upload result: {0}")]
    Upload(String),
}

/// A value produced by an analyzer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    /// Encoded image bytes, stored as-is
    Image(Bytes),
    /// UTF-8 text
    Text(String),
}

impl ResultValue {
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Image(data) => data,
            Self::Text(text) => Bytes::from(text),
        }
    }
}

impl From<String> for ResultValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for ResultValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Bytes> for ResultValue {
    fn from(data: Bytes) -> Self {
        Self::Image(data)
    }
}

/// Durable store for the results of one camera.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist `value` under `name`. Returns once the result is stored.
    async fn save(&self, name: &str, value: ResultValue) -> Result<(), SinkError>;
}

/// Hands out a dedicated sink per camera.
pub trait SinkProvider: Send + Sync {
    fn sink_for(&self, camera_id: &str) -> Box<dyn ResultSink>;
}

/// Normalize an analyzer-supplied result name into a single path component.
pub fn normalize_name(name: &str) -> Result<String, SinkError> {
    let normalized = name.replace('/', ".");
    if normalized.is_empty() || normalized == "." || normalized == ".." {
        return Err(SinkError::InvalidName(name.to_string()));
    }
    Ok(normalized)
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Get content type from a result name's extension
fn get_content_type(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Results stored below a local directory.
#[derive(Debug, Clone)]
pub struct LocalResultStore {
    job_dir: PathBuf,
}

impl LocalResultStore {
    pub fn new(root: impl Into<PathBuf>, username: &str, submission_id: &str) -> Self {
        let job_dir = root
            .into()
            .join(sanitize_path_component(username))
            .join(sanitize_path_component(submission_id));

        Self { job_dir }
    }

    /// Directory holding the results of one camera.
    pub fn camera_dir(&self, camera_id: &str) -> PathBuf {
        self.job_dir.join(sanitize_path_component(camera_id))
    }
}

impl SinkProvider for LocalResultStore {
    fn sink_for(&self, camera_id: &str) -> Box<dyn ResultSink> {
        Box::new(LocalSink {
            dir: self.camera_dir(camera_id),
        })
    }
}

struct LocalSink {
    dir: PathBuf,
}

#[async_trait]
impl ResultSink for LocalSink {
    async fn save(&self, name: &str, value: ResultValue) -> Result<(), SinkError> {
        let path = self.dir.join(normalize_name(name)?);
        let data = value.into_bytes();

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, &data).await?;

        metrics::counter!("camfleet.results.saved").increment(1);
        debug!(path = %path.display(), size_bytes = data.len(), "Result written");
        Ok(())
    }
}

/// Results uploaded to an S3 bucket.
#[derive(Clone)]
pub struct S3ResultStore {
    client: S3Client,
    bucket: String,
    job_prefix: String,
}

impl S3ResultStore {
    /// Create a new S3 result store for one job
    pub async fn new(config: &S3Config, username: &str, submission_id: &str) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 result store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            job_prefix: job_prefix(username, submission_id),
        }
    }
}

fn job_prefix(username: &str, submission_id: &str) -> String {
    format!(
        "users/{}/{}",
        sanitize_path_component(username),
        sanitize_path_component(submission_id)
    )
}

impl SinkProvider for S3ResultStore {
    fn sink_for(&self, camera_id: &str) -> Box<dyn ResultSink> {
        Box::new(S3Sink {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            prefix: format!(
                "{}/{}",
                self.job_prefix,
                sanitize_path_component(camera_id)
            ),
        })
    }
}

struct S3Sink {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3Sink {
    fn object_key(&self, name: &str) -> Result<String, SinkError> {
        Ok(format!("{}/{}", self.prefix, normalize_name(name)?))
    }
}

#[async_trait]
impl ResultSink for S3Sink {
    async fn save(&self, name: &str, value: ResultValue) -> Result<(), SinkError> {
        let key = self.object_key(name)?;
        let content_type = get_content_type(&key);
        let data = value.into_bytes();
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| SinkError::Upload(format!("{}: {}", key, e)))?;

        metrics::counter!("camfleet.results.saved").increment(1);
        debug!(s3_key = %key, size_bytes = size, "Result uploaded");
        Ok(())
    }
}
