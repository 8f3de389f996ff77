use std::sync::Arc;
use std::time::Instant;

use crate::camera::{Camera, SnapshotImage};
use crate::cancel::CancelScope;
use crate::decode::{ContextGauge, DecodeBackend, DecodeOutcome, VideoDecoder};
use crate::encode::EncoderKind;
use crate::error::{CaptureError, CaptureResult};
use crate::rtsp::{RtspOptions, SessionConnector, StreamSession, TcpConnector};

/// Runs one bounded capture for a camera.
///
/// Implementations must return once `scope` is cancelled or expired, having
/// released everything they opened.
pub trait CaptureRunner: Send + Sync {
    fn capture(&self, camera: &Camera, scope: &CancelScope) -> CaptureResult<SnapshotImage>;
}

/// Session -> decoder -> converter -> encoder.
pub struct PipelineRunner {
    backend: Arc<dyn DecodeBackend>,
    encoder: EncoderKind,
    connector: Arc<dyn SessionConnector>,
    gauge: ContextGauge,
}

impl PipelineRunner {
    pub fn new(backend: Arc<dyn DecodeBackend>, encoder: EncoderKind, rtsp: RtspOptions) -> Self {
        Self {
            backend,
            encoder,
            connector: Arc::new(TcpConnector::new(rtsp)),
            gauge: ContextGauge::new(),
        }
    }

    /// Replace the built-in TCP client.
    pub fn with_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Share an existing gauge, e.g. one the caller reports on at shutdown.
    pub fn with_gauge(mut self, gauge: ContextGauge) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn gauge(&self) -> &ContextGauge {
        &self.gauge
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn client_name(&self) -> &'static str {
        self.connector.name()
    }
}

impl CaptureRunner for PipelineRunner {
    fn capture(&self, camera: &Camera, scope: &CancelScope) -> CaptureResult<SnapshotImage> {
        let started = Instant::now();
        let mut session = self.connector.connect(&camera.stream_url, scope)?;
        let description = session.describe(scope)?;
        let (index, codec) = description.select_video_track()?;
        let track = &description.tracks[index];
        log::debug!(
            "camera {}: selected {} track {} (pt {})",
            camera.id,
            codec.name(),
            index,
            track.payload_type
        );

        let mut decoder = VideoDecoder::new(
            Arc::clone(&self.backend),
            self.encoder.build(),
            self.gauge.clone(),
        );
        let result = decoder.initialize(codec).and_then(|()| {
            session.setup(track, scope)?;
            session.play(scope)?;
            pump(session.as_mut(), &mut decoder, scope)
        });
        // Decoder first, then session, on every path.
        decoder.close();
        session.close();

        let bytes = result?;
        log::debug!(
            "camera {}: {} byte image after {:?}",
            camera.id,
            bytes.len(),
            started.elapsed()
        );
        Ok(SnapshotImage::new(camera.id.clone(), bytes))
    }
}

fn pump(
    session: &mut dyn StreamSession,
    decoder: &mut VideoDecoder,
    scope: &CancelScope,
) -> CaptureResult<Vec<u8>> {
    loop {
        let unit = match session.next_access_unit(scope) {
            Ok(unit) => unit,
            Err(err) => return Err(classify_stall(err, decoder)),
        };
        match decoder.decode(&unit)? {
            DecodeOutcome::Image(bytes) => return Ok(bytes),
            DecodeOutcome::NeedMoreInput | DecodeOutcome::Rejected(_) => {}
        }
        if let Err(err) = scope.check() {
            return Err(classify_stall(err, decoder));
        }
    }
}

/// A deadline that passes after data arrived but before any picture decoded
/// is reported as an empty stream.
fn classify_stall(err: CaptureError, decoder: &VideoDecoder) -> CaptureError {
    let stats = decoder.stats();
    match err {
        CaptureError::Timeout { .. } if stats.access_units > 0 && stats.pictures == 0 => {
            CaptureError::EmptyStream {
                access_units: stats.access_units,
            }
        }
        other => other,
    }
}
