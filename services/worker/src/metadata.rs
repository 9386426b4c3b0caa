//! Camera and frame metadata handed to analyzers.

use crate::request::CameraDescriptor;
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;

/// Identity and location of the camera a task is sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraMetadata {
    pub camera_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&CameraDescriptor> for CameraMetadata {
    fn from(descriptor: &CameraDescriptor) -> Self {
        Self {
            camera_id: descriptor.camera_id().to_string(),
            latitude: descriptor.latitude(),
            longitude: descriptor.longitude(),
        }
    }
}

/// Metadata of a single captured frame.
///
/// `sequence_num` is 0 for the first frame delivered to `on_new_frame` and
/// grows by one per successful capture, so it also counts how many times the
/// analyzer has been invoked before this frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    camera: Arc<CameraMetadata>,
    sequence_num: u64,
    timestamp: DateTime<Utc>,
}

impl FrameMetadata {
    pub fn new(camera: Arc<CameraMetadata>, sequence_num: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            camera,
            sequence_num,
            timestamp,
        }
    }

    pub fn camera(&self) -> &CameraMetadata {
        &self.camera
    }

    pub fn sequence_num(&self) -> u64 {
        self.sequence_num
    }

    /// Wall-clock capture time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Capture time in seconds since the epoch.
    pub fn unix_timestamp(&self) -> f64 {
        self.timestamp.timestamp_micros() as f64 / 1_000_000.0
    }

    /// Capture time in the worker's local timezone.
    pub fn datetime(&self) -> DateTime<Local> {
        self.timestamp.with_timezone(&Local)
    }

    /// `{camera_id}_{date}_{time}` prefix for result names.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}",
            self.camera.camera_id,
            self.timestamp.format("%Y-%m-%d_%H-%M-%S-%6f")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn camera() -> Arc<CameraMetadata> {
        Arc::new(CameraMetadata {
            camera_id: "cam-7".to_string(),
            latitude: 40.42,
            longitude: -86.91,
        })
    }

    #[test]
    fn test_unix_timestamp() {
        let ts = Utc.timestamp_micros(1_705_314_645_250_000).unwrap();
        let metadata = FrameMetadata::new(camera(), 3, ts);
        assert_eq!(metadata.unix_timestamp(), 1_705_314_645.25);
        assert_eq!(metadata.sequence_num(), 3);
    }

    #[test]
    fn test_datetime_is_same_instant() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let metadata = FrameMetadata::new(camera(), 0, ts);
        assert_eq!(metadata.datetime().with_timezone(&Utc), ts);
    }

    #[test]
    fn test_file_stem() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let metadata = FrameMetadata::new(camera(), 0, ts);
        assert_eq!(metadata.file_stem(), "cam-7_2024-01-15_10-30-45-000000");
    }
}
