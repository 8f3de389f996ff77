//! Error kinds produced by the capture core.
//!
//! Every capture attempt ends in exactly one of these or a `SnapshotImage`.
//! The scheduler uses [`CaptureError::is_fault`] to decide whether a failure
//! is worth reporting; cancellation and missing media are expected outcomes.

use std::time::Duration;

use thiserror::Error;

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{context}: {source}")]
    Network {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rtsp protocol error: {0}")]
    Protocol(String),
    #[error("media H264/H265 not found")]
    MediaNotFound,
    #[error("codec not found: {0}")]
    CodecNotFound(String),
    #[error("decoder init failed: {0}")]
    DecodeInit(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("frame conversion failed: {0}")]
    Conversion(String),
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("timeout getting snapshot after {budget:?}")]
    Timeout { budget: Duration },
    #[error("stream delivered {access_units} access units but no picture decoded")]
    EmptyStream { access_units: u64 },
    #[error("capture cancelled")]
    Cancelled,
}

impl CaptureError {
    pub fn network(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Network {
            context: context.into(),
            source,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// False for outcomes that are part of normal operation.
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::MediaNotFound)
    }

    /// Network-class failures: transport errors and RTSP-level rejections.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Protocol(_))
    }

    /// Short stable label for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Protocol(_) => "protocol",
            Self::MediaNotFound => "media_not_found",
            Self::CodecNotFound(_) => "codec_not_found",
            Self::DecodeInit(_) => "decode_init",
            Self::Decode(_) => "decode",
            Self::Conversion(_) => "conversion",
            Self::Encode(_) => "encode",
            Self::Timeout { .. } => "timeout",
            Self::EmptyStream { .. } => "empty_stream",
            Self::Cancelled => "cancelled",
        }
    }
}
