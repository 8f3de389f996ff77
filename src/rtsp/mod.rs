//! Stream session: RTSP/1.0 control with RTP interleaved over the same TCP
//! connection.
//!
//! A session is owned by one capture attempt. Every blocking read is bounded
//! by the poll interval so the attempt's [`CancelScope`] is observed between
//! reads; cancelling the scope therefore unwinds the session within one poll
//! interval.

pub mod depacketize;
#[cfg(feature = "rtsp-gstreamer")]
pub mod gstreamer;
pub mod message;
pub mod rtp;
pub mod sdp;
mod transport;

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use url::Url;

pub use depacketize::Depacketizer;
pub use message::{Message, MessageReader, Response};
pub use sdp::{MediaDescription, Track};
pub use transport::{SessionConnector, StreamSession, TcpConnector};

#[cfg(feature = "rtsp-gstreamer")]
pub use self::gstreamer::GstreamerConnector;

use crate::cancel::CancelScope;
use crate::decode::CodecKind;
use crate::error::{CaptureError, CaptureResult};

const DEFAULT_RTSP_PORT: u16 = 554;
const READ_CHUNK: usize = 64 * 1024;
const TRANSPORT: &str = "RTP/AVP/TCP;unicast;interleaved=0-1";

/// One coded picture's worth of NAL units, joined by start codes but without
/// the leading one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessUnit {
    pub codec: CodecKind,
    pub rtp_timestamp: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct RtspOptions {
    pub connect_timeout: Duration,
    /// Longest wait for the reply to a control request.
    pub response_timeout: Duration,
    /// Granularity at which blocked reads re-check cancellation.
    pub poll_interval: Duration,
    pub user_agent: String,
}

impl Default for RtspOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            user_agent: format!("snapshot-agent/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub rtp_packets: u64,
    pub access_units: u64,
    pub bytes_read: u64,
}

pub struct RtspSession {
    stream: Option<TcpStream>,
    url: Url,
    base: Url,
    aggregate_control: Option<String>,
    credentials: Option<(String, String)>,
    authorization: Option<String>,
    options: RtspOptions,
    cseq: u32,
    session_id: Option<String>,
    reader: MessageReader,
    depacketizer: Option<Depacketizer>,
    rtp_channel: u8,
    payload_type: Option<u8>,
    playing: bool,
    stats: SessionStats,
}

impl RtspSession {
    /// Open the TCP connection and query the server with OPTIONS.
    pub fn connect(address: &str, options: &RtspOptions, scope: &CancelScope) -> CaptureResult<Self> {
        let mut url = Url::parse(address)
            .map_err(|e| CaptureError::protocol(format!("invalid stream address: {}", e)))?;
        if url.scheme() != "rtsp" {
            return Err(CaptureError::protocol(format!(
                "unsupported stream scheme '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CaptureError::protocol("stream address has no host"))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);
        let credentials = match url.username() {
            "" => None,
            user => Some((user.to_string(), url.password().unwrap_or_default().to_string())),
        };
        // Credentials travel in the Authorization header, never in request lines.
        let _ = url.set_username("");
        let _ = url.set_password(None);

        scope.check()?;
        let addrs = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| CaptureError::network(format!("resolve {}", host), e))?;
        let mut last_error = None;
        let mut stream = None;
        for addr in addrs {
            scope.check()?;
            match TcpStream::connect_timeout(&addr, scope.clamp(options.connect_timeout)) {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(err) => last_error = Some(err),
            }
        }
        let stream = match (stream, last_error) {
            (Some(stream), _) => stream,
            (None, Some(err)) => {
                return Err(CaptureError::network(format!("connect {}:{}", host, port), err))
            }
            (None, None) => {
                return Err(CaptureError::network(
                    format!("resolve {}", host),
                    std::io::Error::new(ErrorKind::NotFound, "no addresses"),
                ))
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| CaptureError::network("configure rtsp socket", e))?;

        let mut session = Self {
            stream: Some(stream),
            base: url.clone(),
            url,
            aggregate_control: None,
            credentials,
            authorization: None,
            options: options.clone(),
            cseq: 0,
            session_id: None,
            reader: MessageReader::new(),
            depacketizer: None,
            rtp_channel: 0,
            payload_type: None,
            playing: false,
            stats: SessionStats::default(),
        };
        let target = session.url.to_string();
        let response = session.request("OPTIONS", &target, Vec::new(), scope)?;
        if let Some(public) = response.header("Public") {
            log::debug!("{} supports {}", session.url, public);
        }
        Ok(session)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn describe(&mut self, scope: &CancelScope) -> CaptureResult<MediaDescription> {
        let target = self.url.to_string();
        let response = self.request(
            "DESCRIBE",
            &target,
            vec![("Accept", "application/sdp".to_string())],
            scope,
        )?;
        if let Some(base) = response
            .header("Content-Base")
            .or_else(|| response.header("Content-Location"))
        {
            self.base = Url::parse(base)
                .map_err(|e| CaptureError::protocol(format!("bad Content-Base '{}': {}", base, e)))?;
        }
        let description = MediaDescription::parse(&String::from_utf8_lossy(&response.body))?;
        self.aggregate_control = description.session_control.clone();
        Ok(description)
    }

    /// Set up delivery of one track over interleaved channels.
    pub fn setup(&mut self, track: &Track, scope: &CancelScope) -> CaptureResult<()> {
        let codec = track.codec().ok_or(CaptureError::MediaNotFound)?;
        let target = track.control_url(&self.base)?;
        let response = self.request("SETUP", &target, vec![("Transport", TRANSPORT.to_string())], scope)?;
        let session = response
            .header("Session")
            .ok_or_else(|| CaptureError::protocol("SETUP response without Session header"))?;
        self.session_id = Some(
            session
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string(),
        );
        if let Some(channel) = response.header("Transport").and_then(interleaved_channel) {
            self.rtp_channel = channel;
        }
        self.payload_type = Some(track.payload_type);
        self.depacketizer = Some(Depacketizer::new(codec).with_parameter_sets(track.parameter_sets()));
        Ok(())
    }

    pub fn play(&mut self, scope: &CancelScope) -> CaptureResult<()> {
        if self.session_id.is_none() {
            return Err(CaptureError::protocol("PLAY before SETUP"));
        }
        let target = sdp::resolve_control(&self.base, self.aggregate_control.as_deref())?;
        self.request("PLAY", &target, vec![("Range", "npt=0.000-".to_string())], scope)?;
        self.playing = true;
        Ok(())
    }

    /// Block until the selected track yields a complete access unit.
    pub fn next_access_unit(&mut self, scope: &CancelScope) -> CaptureResult<AccessUnit> {
        if !self.playing {
            return Err(CaptureError::protocol("session is not playing"));
        }
        loop {
            if let Some(unit) = self.depacketizer.as_mut().and_then(Depacketizer::next_ready) {
                self.stats.access_units += 1;
                return Ok(unit);
            }
            match self.read_message(scope, None)? {
                Message::Interleaved { channel, payload } => self.handle_interleaved(channel, &payload),
                Message::Response(response) => {
                    log::trace!("unsolicited rtsp response {}", response.status)
                }
                Message::Request { method } => log::trace!("ignoring server {} request", method),
            }
        }
    }

    /// Tear down and release the connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if let (Some(session), true) = (self.session_id.as_deref(), self.playing) {
            self.cseq += 1;
            let mut headers = vec![
                ("CSeq", self.cseq.to_string()),
                ("User-Agent", self.options.user_agent.clone()),
                ("Session", session.to_string()),
            ];
            if let Some(auth) = self.authorization.clone() {
                headers.push(("Authorization", auth));
            }
            let target = self.url.to_string();
            let _ = stream.set_write_timeout(Some(self.options.poll_interval));
            // No reply is awaited; the socket goes away right after.
            let _ = stream.write_all(&message::encode_request("TEARDOWN", &target, &headers));
        }
        let _ = stream.shutdown(Shutdown::Both);
        self.playing = false;
        self.depacketizer = None;
        log::debug!(
            "rtsp session {} closed (packets={} units={} bytes={})",
            self.url,
            self.stats.rtp_packets,
            self.stats.access_units,
            self.stats.bytes_read
        );
    }

    fn handle_interleaved(&mut self, channel: u8, payload: &[u8]) {
        if channel != self.rtp_channel {
            return;
        }
        let (header, body) = match rtp::parse_packet(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::trace!("skipping rtp packet: {}", err);
                return;
            }
        };
        if self.payload_type.is_some_and(|pt| pt != header.payload_type) {
            return;
        }
        self.stats.rtp_packets += 1;
        if let Some(depacketizer) = self.depacketizer.as_mut() {
            depacketizer.push(&header, body);
        }
    }

    fn request(
        &mut self,
        method: &str,
        target: &str,
        extra: Vec<(&str, String)>,
        scope: &CancelScope,
    ) -> CaptureResult<Response> {
        let response = self.send_request(method, target, &extra, scope)?;
        if response.status == 401 && self.authorization.is_none() {
            if let Some((user, password)) = self.credentials.clone() {
                let token = STANDARD.encode(format!("{}:{}", user, password));
                self.authorization = Some(format!("Basic {}", token));
                let retry = self.send_request(method, target, &extra, scope)?;
                return check_status(method, retry);
            }
        }
        check_status(method, response)
    }

    fn send_request(
        &mut self,
        method: &str,
        target: &str,
        extra: &[(&str, String)],
        scope: &CancelScope,
    ) -> CaptureResult<Response> {
        scope.check()?;
        self.cseq += 1;
        let cseq = self.cseq;
        let mut headers = vec![
            ("CSeq", cseq.to_string()),
            ("User-Agent", self.options.user_agent.clone()),
        ];
        if let Some(auth) = &self.authorization {
            headers.push(("Authorization", auth.clone()));
        }
        if let Some(session) = &self.session_id {
            headers.push(("Session", session.clone()));
        }
        headers.extend(extra.iter().cloned());
        let bytes = message::encode_request(method, target, &headers);

        let write_timeout = scope.clamp(self.options.response_timeout);
        let stream = self.stream_mut()?;
        stream
            .set_write_timeout(Some(write_timeout))
            .map_err(|e| CaptureError::network("configure rtsp socket", e))?;
        stream
            .write_all(&bytes)
            .map_err(|e| CaptureError::network(format!("send {}", method), e))?;
        log::trace!("> {} {} (CSeq {})", method, target, cseq);

        let limit = Instant::now() + self.options.response_timeout;
        loop {
            match self.read_message(scope, Some(limit))? {
                Message::Response(response) if response.cseq() == Some(cseq) => {
                    log::trace!("< {} {} (CSeq {})", response.status, response.reason, cseq);
                    return Ok(response);
                }
                Message::Response(response) => {
                    log::trace!("discarding response for CSeq {:?}", response.cseq())
                }
                Message::Interleaved { channel, payload } => self.handle_interleaved(channel, &payload),
                Message::Request { method } => log::trace!("ignoring server {} request", method),
            }
        }
    }

    fn read_message(&mut self, scope: &CancelScope, limit: Option<Instant>) -> CaptureResult<Message> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(message) = self.reader.next_message()? {
                return Ok(message);
            }
            scope.check()?;
            if limit.is_some_and(|limit| Instant::now() >= limit) {
                return Err(CaptureError::network(
                    "await rtsp response",
                    std::io::Error::new(ErrorKind::TimedOut, "no response from camera"),
                ));
            }
            let wait = scope.clamp(self.options.poll_interval);
            let stream = self.stream_mut()?;
            stream
                .set_read_timeout(Some(wait))
                .map_err(|e| CaptureError::network("configure rtsp socket", e))?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(CaptureError::network(
                        "read rtsp stream",
                        std::io::Error::new(ErrorKind::UnexpectedEof, "camera closed the connection"),
                    ))
                }
                Ok(n) => {
                    self.stats.bytes_read += n as u64;
                    self.reader.extend(&chunk[..n]);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(CaptureError::network("read rtsp stream", err)),
            }
        }
    }

    fn stream_mut(&mut self) -> CaptureResult<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(|| {
            CaptureError::network(
                "rtsp session",
                std::io::Error::new(ErrorKind::NotConnected, "session closed"),
            )
        })
    }
}

impl Drop for RtspSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_status(method: &str, response: Response) -> CaptureResult<Response> {
    if response.is_success() {
        return Ok(response);
    }
    Err(CaptureError::protocol(format!(
        "{} returned {} {}",
        method, response.status, response.reason
    )))
}

/// RTP channel from a `Transport` reply such as `...;interleaved=2-3`.
fn interleaved_channel(transport: &str) -> Option<u8> {
    transport
        .split(';')
        .find_map(|part| part.trim().strip_prefix("interleaved="))
        .and_then(|range| range.split('-').next())
        .and_then(|channel| channel.trim().parse().ok())
}
