//! RTSP/1.0 message framing over a single TCP connection.
//!
//! Responses and interleaved binary frames (`$` + channel + length) share
//! the connection once PLAY has started, so the reader demultiplexes both
//! out of one growing buffer.

use crate::error::{CaptureError, CaptureResult};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn encode_request(method: &str, url: &str, headers: &[(&str, String)]) -> Vec<u8> {
    let mut out = format!("{} {} RTSP/1.0\r\n", method, url);
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")?.trim().parse().ok()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Response(Response),
    /// Server-to-client request (e.g. keep-alive `GET_PARAMETER`); not acted on.
    Request { method: String },
    Interleaved { channel: u8, payload: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct MessageReader {
    buffer: Vec<u8>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> CaptureResult<Option<Message>> {
        self.resync();
        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };
        if first == b'$' {
            return Ok(self.next_interleaved());
        }
        self.next_text()
    }

    /// Drop garbage up to the next plausible message start.
    fn resync(&mut self) {
        let skip = self
            .buffer
            .iter()
            .position(|&b| b == b'$' || b.is_ascii_uppercase())
            .unwrap_or(self.buffer.len());
        if skip > 0 {
            log::trace!("rtsp reader skipped {} stray bytes", skip);
            self.buffer.drain(..skip);
        }
    }

    fn next_interleaved(&mut self) -> Option<Message> {
        if self.buffer.len() < 4 {
            return None;
        }
        let channel = self.buffer[1];
        let len = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if self.buffer.len() < 4 + len {
            return None;
        }
        let payload = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(..4 + len);
        Some(Message::Interleaved { channel, payload })
    }

    fn next_text(&mut self) -> CaptureResult<Option<Message>> {
        let Some(head_end) = find(&self.buffer, b"\r\n\r\n") else {
            if self.buffer.len() > MAX_HEAD_BYTES {
                return Err(CaptureError::protocol("rtsp message head too large"));
            }
            return Ok(None);
        };
        let head = String::from_utf8_lossy(&self.buffer[..head_end]).into_owned();
        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();
        let content_length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, value)| {
                value
                    .parse::<usize>()
                    .map_err(|_| CaptureError::protocol(format!("bad Content-Length '{}'", value)))
            })
            .transpose()?
            .unwrap_or(0);
        if content_length > MAX_BODY_BYTES {
            return Err(CaptureError::protocol(format!(
                "rtsp body of {} bytes exceeds limit",
                content_length
            )));
        }
        let body_start = head_end + 4;
        if self.buffer.len() < body_start + content_length {
            return Ok(None);
        }
        let body = self.buffer[body_start..body_start + content_length].to_vec();
        self.buffer.drain(..body_start + content_length);

        if let Some(status_line) = start_line.strip_prefix("RTSP/1.0 ") {
            let (code, reason) = status_line.split_once(' ').unwrap_or((status_line, ""));
            let status = code.parse::<u16>().map_err(|_| {
                CaptureError::protocol(format!("bad rtsp status line '{}'", start_line))
            })?;
            return Ok(Some(Message::Response(Response {
                status,
                reason: reason.to_string(),
                headers,
                body,
            })));
        }
        if start_line.starts_with("RTSP/") {
            return Err(CaptureError::protocol(format!(
                "unsupported rtsp version in '{}'",
                start_line
            )));
        }
        let method = start_line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(Some(Message::Request { method }))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_crlf_framed() {
        let bytes = encode_request(
            "OPTIONS",
            "rtsp://cam/stream",
            &[("CSeq", "1".to_string()), ("User-Agent", "test".to_string())],
        );
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "OPTIONS rtsp://cam/stream RTSP/1.0\r\nCSeq: 1\r\nUser-Agent: test\r\n\r\n"
        );
    }

    #[test]
    fn response_with_body_split_across_reads() -> CaptureResult<()> {
        let mut reader = MessageReader::new();
        reader.extend(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 5\r\n\r\nv=");
        assert!(reader.next_message()?.is_none());
        reader.extend(b"0\r\n");
        let Some(Message::Response(response)) = reader.next_message()? else {
            panic!("expected response");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.cseq(), Some(2));
        assert_eq!(response.header("content-length"), Some("5"));
        assert_eq!(response.body, b"v=0\r\n");
        assert_eq!(reader.buffered(), 0);
        Ok(())
    }

    #[test]
    fn interleaved_frames_and_responses_are_demultiplexed() -> CaptureResult<()> {
        let mut reader = MessageReader::new();
        reader.extend(&[b'$', 0, 0, 3, 9, 8, 7]);
        reader.extend(b"RTSP/1.0 454 Session Not Found\r\nCSeq: 5\r\n\r\n");
        reader.extend(&[b'$', 1, 0, 1]);
        assert_eq!(
            reader.next_message()?,
            Some(Message::Interleaved {
                channel: 0,
                payload: vec![9, 8, 7]
            })
        );
        let Some(Message::Response(response)) = reader.next_message()? else {
            panic!("expected response");
        };
        assert_eq!((response.status, response.reason.as_str()), (454, "Session Not Found"));
        assert!(!response.is_success());
        assert!(reader.next_message()?.is_none());
        Ok(())
    }

    #[test]
    fn server_requests_are_surfaced_by_method() -> CaptureResult<()> {
        let mut reader = MessageReader::new();
        reader.extend(b"\r\nGET_PARAMETER rtsp://cam RTSP/1.0\r\nCSeq: 9\r\n\r\n");
        assert_eq!(
            reader.next_message()?,
            Some(Message::Request {
                method: "GET_PARAMETER".to_string()
            })
        );
        Ok(())
    }
}
