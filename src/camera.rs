use serde::{Deserialize, Deserializer};
use std::time::{Duration, SystemTime};

/// A camera as advertised by the roster.
///
/// Immutable once fetched; each scheduler owns its own copy for one cycle.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Camera {
    pub id: String,
    #[serde(rename = "rtsp_url")]
    pub stream_url: String,
    /// Roster reports whole seconds.
    #[serde(rename = "update_interval", deserialize_with = "interval_from_secs")]
    pub interval: Duration,
}

fn interval_from_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl Camera {
    pub fn new(id: impl Into<String>, stream_url: impl Into<String>, interval: Duration) -> Self {
        Self {
            id: id.into(),
            stream_url: stream_url.into(),
            interval,
        }
    }

    /// Cameras without an address or interval cannot be scheduled.
    pub fn is_schedulable(&self) -> bool {
        !self.interval.is_zero() && !self.stream_url.trim().is_empty()
    }
}

/// Encoded still image ready for upload.
#[derive(Clone, Debug)]
pub struct SnapshotImage {
    pub camera_id: String,
    pub captured_at: SystemTime,
    pub bytes: Vec<u8>,
}

impl SnapshotImage {
    pub fn new(camera_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            camera_id: camera_id.into(),
            captured_at: SystemTime::now(),
            bytes,
        }
    }
}
