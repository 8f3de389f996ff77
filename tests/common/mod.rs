//! Loop-back RTSP camera for integration tests.
//!
//! Speaks just enough RTSP/1.0 for the agent's session (OPTIONS, DESCRIBE,
//! SETUP, PLAY, TEARDOWN) and streams interleaved RTP on channel 0.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    /// H.264 with in-band SPS/PPS and an FU-A fragmented IDR slice.
    H264,
    /// H.265 whose parameter sets are only advertised in the SDP.
    H265OutOfBand,
    /// Only an MJPEG video track.
    MjpegOnly,
    /// Accepts PLAY but never sends media.
    Stall,
    /// Streams slices that cannot be decoded (no parameter sets ever).
    Undecodable,
    /// Same as `H264` but DESCRIBE requires Basic `viewer:secret`.
    H264WithAuth,
}

const BASIC_VIEWER: &str = "Basic dmlld2VyOnNlY3JldA==";
const FRAME_GAP: Duration = Duration::from_millis(20);

#[derive(Default)]
pub struct CameraStats {
    pub connections: AtomicUsize,
    pub plays: AtomicUsize,
    pub teardowns: AtomicUsize,
    pub closed: AtomicUsize,
}

pub struct FakeCamera {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    pub stats: Arc<CameraStats>,
    handle: Option<JoinHandle<()>>,
}

impl FakeCamera {
    pub fn start(behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake camera");
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CameraStats::default());

        let accept_stop = Arc::clone(&stop);
        let accept_stats = Arc::clone(&stats);
        let handle = thread::spawn(move || {
            let mut clients = Vec::new();
            while !accept_stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        accept_stats.connections.fetch_add(1, Ordering::SeqCst);
                        let stop = Arc::clone(&accept_stop);
                        let stats = Arc::clone(&accept_stats);
                        clients.push(thread::spawn(move || {
                            serve(stream, addr, behaviour, stop, Arc::clone(&stats));
                            stats.closed.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                    Err(_) => thread::sleep(Duration::from_millis(5)),
                }
            }
            for client in clients {
                let _ = client.join();
            }
        });
        Self {
            addr,
            stop,
            stats,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("rtsp://{}/stream", self.addr)
    }

    pub fn url_with_credentials(&self, user: &str, password: &str) -> String {
        format!("rtsp://{}:{}@{}/stream", user, password, self.addr)
    }

    /// Wait until every accepted connection has been closed by the client.
    pub fn wait_all_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let stats = &self.stats;
            if stats.closed.load(Ordering::SeqCst) == stats.connections.load(Ordering::SeqCst) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Request {
    method: String,
    cseq: String,
    authorization: Option<String>,
}

fn read_request(reader: &mut BufReader<TcpStream>) -> Option<Request> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    let method = line.split_whitespace().next()?.to_string();
    let mut cseq = String::from("0");
    let mut authorization = None;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).ok()? == 0 {
            return None;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "cseq" => cseq = value.trim().to_string(),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    Some(Request {
        method,
        cseq,
        authorization,
    })
}

fn respond(stream: &mut TcpStream, status: &str, cseq: &str, headers: &[String], body: &str) -> bool {
    let mut out = format!("RTSP/1.0 {}\r\nCSeq: {}\r\n", status, cseq);
    for header in headers {
        out.push_str(header);
        out.push_str("\r\n");
    }
    if !body.is_empty() {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    out.push_str(body);
    stream.write_all(out.as_bytes()).is_ok()
}

fn sdp(behaviour: Behaviour) -> String {
    let video = match behaviour {
        Behaviour::MjpegOnly => "m=video 0 RTP/AVP 26\r\na=rtpmap:26 JPEG/90000\r\na=control:trackID=1\r\n".to_string(),
        Behaviour::H265OutOfBand => "m=video 0 RTP/AVP 97\r\n\
a=rtpmap:97 H265/90000\r\n\
a=fmtp:97 sprop-vps=QAEM;sprop-sps=QgEB;sprop-pps=RAHB\r\n\
a=control:trackID=1\r\n"
            .to_string(),
        _ => "m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1\r\n\
a=control:trackID=1\r\n"
            .to_string(),
    };
    format!(
        "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=fake\r\nt=0 0\r\na=control:*\r\n\
m=audio 0 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\na=control:trackID=0\r\n{}",
        video
    )
}

fn serve(stream: TcpStream, addr: SocketAddr, behaviour: Behaviour, stop: Arc<AtomicBool>, stats: Arc<CameraStats>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let streaming = Arc::new(AtomicBool::new(false));
    let mut streamer: Option<JoinHandle<()>> = None;

    while let Some(request) = read_request(&mut reader) {
        let cseq = request.cseq.clone();
        let ok = match request.method.as_str() {
            "OPTIONS" => respond(
                &mut writer,
                "200 OK",
                &cseq,
                &["Public: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN".to_string()],
                "",
            ),
            "DESCRIBE" => {
                if behaviour == Behaviour::H264WithAuth
                    && request.authorization.as_deref() != Some(BASIC_VIEWER)
                {
                    respond(
                        &mut writer,
                        "401 Unauthorized",
                        &cseq,
                        &["WWW-Authenticate: Basic realm=\"fake\"".to_string()],
                        "",
                    )
                } else {
                    respond(
                        &mut writer,
                        "200 OK",
                        &cseq,
                        &[
                            format!("Content-Base: rtsp://{}/stream/", addr),
                            "Content-Type: application/sdp".to_string(),
                        ],
                        &sdp(behaviour),
                    )
                }
            }
            "SETUP" => respond(
                &mut writer,
                "200 OK",
                &cseq,
                &[
                    "Session: 4F1A2B3C;timeout=60".to_string(),
                    "Transport: RTP/AVP/TCP;unicast;interleaved=0-1".to_string(),
                ],
                "",
            ),
            "PLAY" => {
                stats.plays.fetch_add(1, Ordering::SeqCst);
                let ok = respond(
                    &mut writer,
                    "200 OK",
                    &cseq,
                    &["Session: 4F1A2B3C".to_string()],
                    "",
                );
                if ok && behaviour != Behaviour::Stall {
                    if let Ok(media) = writer.try_clone() {
                        streaming.store(true, Ordering::SeqCst);
                        let streaming = Arc::clone(&streaming);
                        let stop = Arc::clone(&stop);
                        streamer = Some(thread::spawn(move || {
                            stream_media(media, behaviour, &streaming, &stop)
                        }));
                    }
                }
                ok
            }
            "TEARDOWN" => {
                stats.teardowns.fetch_add(1, Ordering::SeqCst);
                streaming.store(false, Ordering::SeqCst);
                respond(&mut writer, "200 OK", &cseq, &[], "");
                false
            }
            _ => respond(&mut writer, "501 Not Implemented", &cseq, &[], ""),
        };
        if !ok {
            break;
        }
    }
    streaming.store(false, Ordering::SeqCst);
    if let Some(streamer) = streamer {
        let _ = streamer.join();
    }
}

fn interleaved(sequence: u16, timestamp: u32, marker: bool, payload: &[u8], pt: u8) -> Vec<u8> {
    let mut rtp = vec![
        0x80,
        (if marker { 0x80 } else { 0 }) | pt,
    ];
    rtp.extend_from_slice(&sequence.to_be_bytes());
    rtp.extend_from_slice(&timestamp.to_be_bytes());
    rtp.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    rtp.extend_from_slice(payload);
    let mut frame = vec![b'$', 0];
    frame.extend_from_slice(&(rtp.len() as u16).to_be_bytes());
    frame.extend_from_slice(&rtp);
    frame
}

/// RTP payloads (marker, payload) for one access unit.
fn access_unit(behaviour: Behaviour, index: u32) -> Vec<(bool, Vec<u8>)> {
    match behaviour {
        Behaviour::H265OutOfBand => vec![(true, vec![0x26, 0x01, 0x80, 0x11])],
        Behaviour::Undecodable => vec![(true, vec![0x41, 0x9A, 0x02])],
        _ if index == 0 => vec![
            (false, vec![0x67, 0x42, 0x00, 0x1E]),
            (false, vec![0x68, 0xCE, 0x38, 0x80]),
            // FU-A: start and end fragments of an IDR slice.
            (false, vec![0x7C, 0x85, 0xA0, 0x01]),
            (true, vec![0x7C, 0x45, 0x02]),
        ],
        _ => vec![(true, vec![0x41, 0x9A, 0x02])],
    }
}

fn stream_media(mut media: TcpStream, behaviour: Behaviour, streaming: &AtomicBool, stop: &AtomicBool) {
    let pt = if behaviour == Behaviour::H265OutOfBand { 97 } else { 96 };
    let mut sequence: u16 = 1;
    let mut index = 0u32;
    while streaming.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
        let timestamp = index.wrapping_mul(3600);
        for (marker, payload) in access_unit(behaviour, index) {
            if media
                .write_all(&interleaved(sequence, timestamp, marker, &payload, pt))
                .is_err()
            {
                return;
            }
            sequence = sequence.wrapping_add(1);
        }
        // RTCP-ish noise on channel 1 that the client must ignore.
        let _ = media.write_all(&[b'$', 1, 0, 4, 0x81, 0xC8, 0, 0]);
        index += 1;
        thread::sleep(FRAME_GAP);
    }
}
