//! Analysis request documents.
//!
//! A request names the analyzer to run, the sampling parameters shared by
//! every camera, and the list of cameras. It is parsed once per job and is
//! read-only afterwards.

use crate::camera::StreamFormat;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading a request document.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Failed to read request file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse request document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// An analysis request for a list of cameras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Submission this request belongs to
    #[serde(deserialize_with = "identifier")]
    pub submission_id: String,

    /// Seconds between two successive samples
    pub interval: f64,

    /// Total analysis duration in seconds
    pub duration: f64,

    /// Number of most recent frames available to the analyzer
    pub snapshots_to_keep: usize,

    /// Read the cameras as MJPEG video instead of snapshots
    #[serde(default)]
    pub is_video: bool,

    /// Name of the registered analyzer to run
    #[serde(alias = "program")]
    pub analysis_class: String,

    /// Submission time as sent by the control plane
    #[serde(default, deserialize_with = "optional_identifier")]
    pub timestamp: Option<String>,

    /// Cameras to analyze
    #[serde(default)]
    pub cameras: Vec<CameraDescriptor>,
}

/// Connection details of a single camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CameraDescriptor {
    Ip(IpCamera),
    NonIp(NonIpCamera),
}

/// A camera reachable through its own HTTP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpCamera {
    #[serde(rename = "key", deserialize_with = "identifier")]
    pub camera_id: String,
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub snapshot_path: String,
    #[serde(alias = "mjpeg_path")]
    pub mjpg_path: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// A camera only reachable through a snapshot URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonIpCamera {
    #[serde(rename = "key", deserialize_with = "identifier")]
    pub camera_id: String,
    pub snapshot_url: String,
    pub latitude: f64,
    pub longitude: f64,
}

fn default_port() -> u16 {
    80
}

/// Identifiers arrive as JSON strings or numbers depending on the producer.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawIdentifier {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl From<RawIdentifier> for String {
    fn from(raw: RawIdentifier) -> Self {
        match raw {
            RawIdentifier::Text(s) => s,
            RawIdentifier::Integer(i) => i.to_string(),
            RawIdentifier::Float(f) => f.to_string(),
        }
    }
}

fn identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawIdentifier::deserialize(deserializer).map(String::from)
}

fn optional_identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawIdentifier>::deserialize(deserializer)?.map(String::from))
}

impl CameraDescriptor {
    pub fn camera_id(&self) -> &str {
        match self {
            Self::Ip(camera) => &camera.camera_id,
            Self::NonIp(camera) => &camera.camera_id,
        }
    }

    pub fn latitude(&self) -> f64 {
        match self {
            Self::Ip(camera) => camera.latitude,
            Self::NonIp(camera) => camera.latitude,
        }
    }

    pub fn longitude(&self) -> f64 {
        match self {
            Self::Ip(camera) => camera.longitude,
            Self::NonIp(camera) => camera.longitude,
        }
    }

    /// URL serving a single JPEG snapshot.
    pub fn snapshot_url(&self) -> String {
        match self {
            Self::Ip(camera) => camera.url_for(&camera.snapshot_path),
            Self::NonIp(camera) => camera.snapshot_url.clone(),
        }
    }

    /// URL serving the MJPEG stream, if the camera has one.
    pub fn mjpeg_url(&self) -> Option<String> {
        match self {
            Self::Ip(camera) => Some(camera.url_for(&camera.mjpg_path)),
            Self::NonIp(_) => None,
        }
    }
}

impl IpCamera {
    fn url_for(&self, path: &str) -> String {
        let separator = if path.starts_with('/') { "" } else { "/" };
        format!("http://{}:{}{}{}", self.ip, self.port, separator, path)
    }
}

impl AnalysisRequest {
    /// Load and validate a request from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RequestError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate a request from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        let request: Self = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    /// Check the sampling parameters and camera list.
    pub fn validate(&self) -> Result<(), RequestError> {
        if !self.interval.is_finite() || self.interval <= 0.0 {
            return Err(invalid("interval", "must be a finite number greater than 0"));
        }
        if Duration::try_from_secs_f64(self.interval).is_err() {
            return Err(invalid("interval", "is too large"));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(invalid("duration", "must be a finite number of at least 0"));
        }
        if Duration::try_from_secs_f64(self.duration).is_err() {
            return Err(invalid("duration", "is too large"));
        }
        if self.snapshots_to_keep == 0 {
            return Err(invalid("snapshots_to_keep", "must be at least 1"));
        }
        if self.analysis_class.trim().is_empty() {
            return Err(invalid("analysis_class", "must name an analyzer"));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            let id = camera.camera_id();
            if id.is_empty() {
                return Err(invalid("cameras.key", "must not be empty"));
            }
            if !seen.insert(id) {
                return Err(invalid("cameras.key", &format!("duplicate camera '{}'", id)));
            }
            if !(-90.0..=90.0).contains(&camera.latitude()) {
                return Err(invalid(
                    "cameras.latitude",
                    &format!("camera '{}' latitude out of range", id),
                ));
            }
            if !(-180.0..=180.0).contains(&camera.longitude()) {
                return Err(invalid(
                    "cameras.longitude",
                    &format!("camera '{}' longitude out of range", id),
                ));
            }
        }

        Ok(())
    }

    /// Sampling interval. Values `validate` would reject saturate instead of
    /// panicking.
    pub fn interval(&self) -> Duration {
        seconds(self.interval)
    }

    pub fn duration(&self) -> Duration {
        seconds(self.duration)
    }

    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat::from_is_video(self.is_video)
    }

    /// Copy of this request holding cameras `index, index + count, ...`.
    ///
    /// Used to spread one fleet over several worker processes. `count` must be
    /// non-zero.
    pub fn shard(&self, index: usize, count: usize) -> Self {
        let cameras = self
            .cameras
            .iter()
            .skip(index)
            .step_by(count.max(1))
            .cloned()
            .collect();

        Self {
            cameras,
            ..self.clone()
        }
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn invalid(field: &str, message: &str) -> RequestError {
    RequestError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = r#"{
        "submission_id": 42,
        "interval": 0.5,
        "duration": 60,
        "snapshots_to_keep": 3,
        "is_video": false,
        "program": "motion",
        "timestamp": "2024-01-15 10:30:00",
        "cameras": [
            {
                "type": "ip",
                "key": 1,
                "ip": "128.210.129.12",
                "port": 8080,
                "snapshot_path": "/axis-cgi/jpg/image.cgi",
                "mjpg_path": "/axis-cgi/mjpg/video.cgi",
                "latitude": 40.42,
                "longitude": -86.91
            },
            {
                "type": "non_ip",
                "key": "cam-b",
                "snapshot_url": "http://example.com/snap.jpg",
                "latitude": 48.85,
                "longitude": 2.35
            }
        ]
    }"#;

    #[test]
    fn test_parse_request() {
        let request = AnalysisRequest::from_json(REQUEST).unwrap();
        assert_eq!(request.submission_id, "42");
        assert_eq!(request.analysis_class, "motion");
        assert_eq!(request.interval(), Duration::from_millis(500));
        assert_eq!(request.stream_format(), StreamFormat::Image);
        assert_eq!(request.cameras.len(), 2);
        assert_eq!(request.cameras[0].camera_id(), "1");
        assert_eq!(request.cameras[1].camera_id(), "cam-b");
    }

    #[test]
    fn test_camera_urls() {
        let request = AnalysisRequest::from_json(REQUEST).unwrap();
        assert_eq!(
            request.cameras[0].snapshot_url(),
            "http://128.210.129.12:8080/axis-cgi/jpg/image.cgi"
        );
        assert_eq!(
            request.cameras[0].mjpeg_url().as_deref(),
            Some("http://128.210.129.12:8080/axis-cgi/mjpg/video.cgi")
        );
        assert_eq!(request.cameras[1].snapshot_url(), "http://example.com/snap.jpg");
        assert_eq!(request.cameras[1].mjpeg_url(), None);
    }

    #[test]
    fn test_default_port() {
        let json = r#"{"type": "ip", "key": "a", "ip": "10.0.0.2", "snapshot_path": "snap.jpg",
                       "mjpeg_path": "/video", "latitude": 0, "longitude": 0}"#;
        let camera: CameraDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(camera.snapshot_url(), "http://10.0.0.2:80/snap.jpg");
    }

    #[test]
    fn test_rejects_zero_snapshots_to_keep() {
        let json = REQUEST.replace("\"snapshots_to_keep\": 3", "\"snapshots_to_keep\": 0");
        assert!(matches!(
            AnalysisRequest::from_json(&json),
            Err(RequestError::InvalidValue { field, .. }) if field == "snapshots_to_keep"
        ));
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        let json = REQUEST.replace("\"interval\": 0.5", "\"interval\": 0");
        assert!(matches!(
            AnalysisRequest::from_json(&json),
            Err(RequestError::InvalidValue { field, .. }) if field == "interval"
        ));
    }

    #[test]
    fn test_rejects_intervals_beyond_duration_range() {
        let json = REQUEST.replace("\"interval\": 0.5", "\"interval\": 1e20");
        assert!(matches!(
            AnalysisRequest::from_json(&json),
            Err(RequestError::InvalidValue { field, .. }) if field == "interval"
        ));

        let json = REQUEST.replace("\"duration\": 60", "\"duration\": 1e20");
        assert!(matches!(
            AnalysisRequest::from_json(&json),
            Err(RequestError::InvalidValue { field, .. }) if field == "duration"
        ));
    }

    #[test]
    fn test_unvalidated_durations_saturate() {
        let mut request = AnalysisRequest::from_json(REQUEST).unwrap();
        request.interval = 1e20;
        request.duration = -1.0;
        assert_eq!(request.interval(), Duration::MAX);
        assert_eq!(request.duration(), Duration::ZERO);
    }

    #[test]
    fn test_rejects_duplicate_cameras() {
        let json = REQUEST.replace("\"key\": \"cam-b\"", "\"key\": \"1\"");
        assert!(matches!(
            AnalysisRequest::from_json(&json),
            Err(RequestError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_camera_type() {
        let json = REQUEST.replace("\"type\": \"non_ip\"", "\"type\": \"usb\"");
        assert!(matches!(
            AnalysisRequest::from_json(&json),
            Err(RequestError::Parse(_))
        ));
    }

    #[test]
    fn test_shard_round_robin() {
        let mut request = AnalysisRequest::from_json(REQUEST).unwrap();
        let template = request.cameras[1].clone();
        for i in 0..3 {
            let mut camera = template.clone();
            if let CameraDescriptor::NonIp(inner) = &mut camera {
                inner.camera_id = format!("extra-{}", i);
            }
            request.cameras.push(camera);
        }

        let first = request.shard(0, 2);
        let ids: Vec<_> = first.cameras.iter().map(|c| c.camera_id()).collect();
        assert_eq!(ids, vec!["1", "extra-0", "extra-2"]);
        assert_eq!(first.submission_id, request.submission_id);

        let second = request.shard(1, 2);
        let ids: Vec<_> = second.cameras.iter().map(|c| c.camera_id()).collect();
        assert_eq!(ids, vec!["cam-b", "extra-1"]);
    }
}
