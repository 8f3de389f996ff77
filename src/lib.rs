//! Snapshot Agent
//!
//! Edge agent that periodically pulls one still image from each camera in a
//! fleet over RTSP, decodes it, and uploads it as PNG to a control plane.
//!
//! # Architecture
//!
//! The capture core holds three guarantees by construction:
//!
//! 1. **One attempt per camera**: a scheduler never starts a capture before the
//!    previous one for the same camera has released its session and decoder.
//! 2. **Balanced contexts**: every decode context opened is closed on every
//!    exit path (success, error, timeout, cancellation).
//! 3. **Bounded waits**: every blocking step observes a [`CancelScope`], so
//!    cancellation unwinds an attempt within one I/O poll interval.
//!
//! # Module Structure
//!
//! - `rtsp`: Stream session (RTSP control, RTP depacketisation, SDP)
//! - `decode`: Codec decoder state machine and backends
//! - `convert`: Planar 4:2:0 to RGBA frame converter
//! - `encode`: Still-image encoders
//! - `capture`: Capture attempts and the per-camera scheduler
//! - `fleet`: Cycle orchestration across all cameras
//! - `control_plane`: Token, roster, upload and heartbeat collaborators

pub mod camera;
pub mod cancel;
pub mod capture;
pub mod config;
pub mod control_plane;
pub mod convert;
pub mod decode;
pub mod encode;
pub mod error;
pub mod fleet;
pub mod rtsp;

pub use camera::{Camera, SnapshotImage};
pub use cancel::CancelScope;
pub use capture::{CaptureRunner, CaptureScheduler, PipelineRunner, SchedulerReport};
pub use config::AgentConfig;
pub use control_plane::{
    AccessToken, Authenticator, HeartbeatSink, HttpControlPlane, RosterSource, SnapshotSink,
};
pub use convert::{ConvertedFrame, FrameConverter};
pub use decode::{
    BackendRegistry, CodecKind, ContextGauge, DecodeBackend, DecodeOutcome, DecodedFrame,
    DecoderState, VideoDecoder,
};
pub use encode::{EncodeOutcome, EncoderKind, PngEncoder, SnapshotEncoder, PNG_SIGNATURE};
pub use error::{CaptureError, CaptureResult};
pub use fleet::{CycleEnd, CycleReport, Fleet, FleetCollaborators};
pub use rtsp::{
    AccessUnit, MediaDescription, RtspOptions, RtspSession, SessionConnector, StreamSession,
    TcpConnector,
};

use std::sync::Arc;

/// Build the decoder registry for this binary's compiled backends.
///
/// The synthetic backend is always available; `ffmpeg` is registered when
/// the `decode-ffmpeg` feature is enabled and libav initialises.
pub fn default_registry(synthetic_width: u32, synthetic_height: u32) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(decode::backends::SyntheticBackend::new(
        synthetic_width,
        synthetic_height,
    ));
    #[cfg(feature = "decode-ffmpeg")]
    match decode::backends::FfmpegBackend::new() {
        Ok(backend) => registry.register(backend),
        Err(err) => log::warn!("ffmpeg decoder unavailable: {:#}", err),
    }
    registry
}

/// Build the RTSP client named in config (`tcp` or `gstreamer`).
pub fn session_connector(name: &str, options: RtspOptions) -> anyhow::Result<Arc<dyn SessionConnector>> {
    match name {
        "tcp" => Ok(Arc::new(TcpConnector::new(options))),
        #[cfg(feature = "rtsp-gstreamer")]
        "gstreamer" => Ok(Arc::new(rtsp::GstreamerConnector::new(options)?)),
        other => Err(anyhow::anyhow!(
            "rtsp client '{}' is not available in this build",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_connector_is_always_available() {
        let connector = session_connector("tcp", RtspOptions::default()).unwrap();
        assert_eq!(connector.name(), "tcp");
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn gstreamer_connector_needs_its_feature() {
        let err = session_connector("gstreamer", RtspOptions::default()).err().unwrap();
        assert!(err.to_string().contains("not available"), "{err}");
    }
}
