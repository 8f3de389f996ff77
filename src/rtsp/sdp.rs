//! Minimal SDP (RFC 4566) reader: just enough to pick a video track.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use url::Url;

use crate::decode::CodecKind;
use crate::error::{CaptureError, CaptureResult};

/// Tracks advertised by a camera in its DESCRIBE response.
#[derive(Clone, Debug, Default)]
pub struct MediaDescription {
    pub session_control: Option<String>,
    pub tracks: Vec<Track>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    /// `m=` media type, e.g. `video`.
    pub media: String,
    pub payload_type: u8,
    /// `a=rtpmap` encoding name, upper-cased.
    pub encoding: Option<String>,
    pub clock_rate: Option<u32>,
    pub control: Option<String>,
    pub fmtp: HashMap<String, String>,
}

impl Track {
    /// Codec kind when this is a video track in a decodable encoding.
    pub fn codec(&self) -> Option<CodecKind> {
        if self.media != "video" {
            return None;
        }
        CodecKind::from_name(self.encoding.as_deref()?).ok()
    }

    /// Decoded out-of-band parameter sets from `a=fmtp`, in decoding order.
    pub fn parameter_sets(&self) -> Vec<Vec<u8>> {
        let encoded: Vec<&str> = match self.codec() {
            Some(CodecKind::H264) => self
                .fmtp
                .get("sprop-parameter-sets")
                .map(|sets| sets.split(',').collect())
                .unwrap_or_default(),
            Some(CodecKind::H265) => ["sprop-vps", "sprop-sps", "sprop-pps"]
                .iter()
                .filter_map(|key| self.fmtp.get(*key))
                .flat_map(|sets| sets.split(','))
                .collect(),
            None => Vec::new(),
        };
        encoded
            .into_iter()
            .map(str::trim)
            .filter(|set| !set.is_empty())
            .filter_map(|set| match STANDARD.decode(set) {
                Ok(bytes) if !bytes.is_empty() => Some(bytes),
                Ok(_) => None,
                Err(err) => {
                    log::debug!("ignoring malformed sprop value '{}': {}", set, err);
                    None
                }
            })
            .collect()
    }

    /// Absolute URL for SETUP, resolved against the session base.
    pub fn control_url(&self, base: &Url) -> CaptureResult<String> {
        resolve_control(base, self.control.as_deref())
    }
}

impl MediaDescription {
    pub fn parse(body: &str) -> CaptureResult<Self> {
        let mut description = MediaDescription::default();
        for line in body.lines() {
            let line = line.trim_end_matches('\r');
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            match kind {
                "m" => description.tracks.push(parse_media_line(value)?),
                "a" => {
                    let (name, value) = value.split_once(':').unwrap_or((value, ""));
                    match description.tracks.last_mut() {
                        Some(track) => apply_attribute(track, name, value),
                        None if name == "control" => {
                            description.session_control = Some(value.trim().to_string())
                        }
                        None => {}
                    }
                }
                _ => {}
            }
        }
        Ok(description)
    }

    /// Index and codec of the first track of the most preferred codec.
    pub fn select_video_track(&self) -> CaptureResult<(usize, CodecKind)> {
        CodecKind::PREFERENCE
            .iter()
            .find_map(|wanted| {
                self.tracks
                    .iter()
                    .position(|track| track.codec() == Some(*wanted))
                    .map(|index| (index, *wanted))
            })
            .ok_or(CaptureError::MediaNotFound)
    }
}

fn parse_media_line(value: &str) -> CaptureResult<Track> {
    let mut fields = value.split_whitespace();
    let media = fields
        .next()
        .ok_or_else(|| CaptureError::protocol("sdp media line missing type"))?;
    // port and transport
    let _ = fields.next();
    let _ = fields.next();
    let payload_type = fields
        .next()
        .and_then(|pt| pt.parse::<u8>().ok())
        .ok_or_else(|| {
            CaptureError::protocol(format!("sdp media line without payload type: {}", value))
        })?;
    Ok(Track {
        media: media.to_string(),
        payload_type,
        encoding: None,
        clock_rate: None,
        control: None,
        fmtp: HashMap::new(),
    })
}

fn apply_attribute(track: &mut Track, name: &str, value: &str) {
    match name {
        "rtpmap" => {
            let Some((pt, encoding)) = value.split_once(' ') else {
                return;
            };
            if pt.trim().parse::<u8>().ok() != Some(track.payload_type) {
                return;
            }
            let mut parts = encoding.trim().split('/');
            track.encoding = parts.next().map(|name| name.to_ascii_uppercase());
            track.clock_rate = parts.next().and_then(|rate| rate.parse().ok());
        }
        "fmtp" => {
            let Some((_, params)) = value.split_once(' ') else {
                return;
            };
            for param in params.split(';') {
                if let Some((key, value)) = param.split_once('=') {
                    track
                        .fmtp
                        .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
                }
            }
        }
        "control" => track.control = Some(value.trim().to_string()),
        _ => {}
    }
}

pub(crate) fn resolve_control(base: &Url, control: Option<&str>) -> CaptureResult<String> {
    match control {
        None | Some("*") | Some("") => Ok(base.to_string()),
        Some(control) if control.starts_with("rtsp://") || control.starts_with("rtsps://") => {
            Ok(control.to_string())
        }
        Some(control) => {
            let mut base = base.clone();
            if !base.path().ends_with('/') {
                let path = format!("{}/", base.path());
                base.set_path(&path);
            }
            base.join(control)
                .map(|url| url.to_string())
                .map_err(|e| CaptureError::protocol(format!("bad track control '{}': {}", control, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAMERA_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=camera\r\n\
a=control:*\r\n\
m=audio 0 RTP/AVP 0\r\n\
a=control:trackID=0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAHg==,aM4=\r\n\
a=control:trackID=1\r\n";

    #[test]
    fn picks_h264_video_track() -> CaptureResult<()> {
        let description = MediaDescription::parse(CAMERA_SDP)?;
        assert_eq!(description.session_control.as_deref(), Some("*"));
        assert_eq!(description.tracks.len(), 2);
        let (index, codec) = description.select_video_track()?;
        assert_eq!((index, codec), (1, CodecKind::H264));
        assert_eq!(description.tracks[index].clock_rate, Some(90_000));
        Ok(())
    }

    #[test]
    fn decodes_sprop_parameter_sets() -> CaptureResult<()> {
        let description = MediaDescription::parse(CAMERA_SDP)?;
        let sets = description.tracks[1].parameter_sets();
        assert_eq!(sets, vec![vec![0x67, 0x42, 0x00, 0x1E], vec![0x68, 0xCE]]);
        Ok(())
    }

    #[test]
    fn h264_is_preferred_over_h265() -> CaptureResult<()> {
        let body = "m=video 0 RTP/AVP 97\r\na=rtpmap:97 H265/90000\r\n\
m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
        let (index, codec) = MediaDescription::parse(body)?.select_video_track()?;
        assert_eq!((index, codec), (1, CodecKind::H264));
        Ok(())
    }

    #[test]
    fn mjpeg_only_is_media_not_found() -> CaptureResult<()> {
        let body = "m=video 0 RTP/AVP 26\r\na=rtpmap:26 JPEG/90000\r\n";
        assert!(matches!(
            MediaDescription::parse(body)?.select_video_track(),
            Err(CaptureError::MediaNotFound)
        ));
        Ok(())
    }

    #[test]
    fn relative_control_resolves_under_base() -> anyhow::Result<()> {
        let base = Url::parse("rtsp://10.0.0.5:554/stream1")?;
        let track = MediaDescription::parse(CAMERA_SDP)?.tracks[1].clone();
        assert_eq!(
            track.control_url(&base)?,
            "rtsp://10.0.0.5:554/stream1/trackID=1"
        );
        assert_eq!(resolve_control(&base, Some("*"))?, base.to_string());
        Ok(())
    }
}
