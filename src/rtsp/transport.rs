use crate::cancel::CancelScope;
use crate::error::CaptureResult;

use super::{AccessUnit, MediaDescription, RtspOptions, RtspSession, Track};

/// Media session with one camera, owned by one capture attempt.
///
/// Every blocking call observes `scope`. `close` must be idempotent and is
/// also expected to run on drop.
pub trait StreamSession {
    fn describe(&mut self, scope: &CancelScope) -> CaptureResult<MediaDescription>;

    /// Select `track` for delivery. Only one track is ever set up.
    fn setup(&mut self, track: &Track, scope: &CancelScope) -> CaptureResult<()>;

    fn play(&mut self, scope: &CancelScope) -> CaptureResult<()>;

    fn next_access_unit(&mut self, scope: &CancelScope) -> CaptureResult<AccessUnit>;

    fn close(&mut self);
}

/// Session factory shared by every scheduler.
pub trait SessionConnector: Send + Sync {
    /// Client identifier.
    fn name(&self) -> &'static str;

    fn connect(&self, address: &str, scope: &CancelScope) -> CaptureResult<Box<dyn StreamSession>>;
}

/// RTSP over a single TCP connection with interleaved RTP.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    options: RtspOptions,
}

impl TcpConnector {
    pub fn new(options: RtspOptions) -> Self {
        Self { options }
    }
}

impl SessionConnector for TcpConnector {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn connect(&self, address: &str, scope: &CancelScope) -> CaptureResult<Box<dyn StreamSession>> {
        Ok(Box::new(RtspSession::connect(address, &self.options, scope)?))
    }
}

impl StreamSession for RtspSession {
    fn describe(&mut self, scope: &CancelScope) -> CaptureResult<MediaDescription> {
        RtspSession::describe(self, scope)
    }

    fn setup(&mut self, track: &Track, scope: &CancelScope) -> CaptureResult<()> {
        RtspSession::setup(self, track, scope)
    }

    fn play(&mut self, scope: &CancelScope) -> CaptureResult<()> {
        RtspSession::play(self, scope)
    }

    fn next_access_unit(&mut self, scope: &CancelScope) -> CaptureResult<AccessUnit> {
        RtspSession::next_access_unit(self, scope)
    }

    fn close(&mut self) {
        RtspSession::close(self)
    }
}
