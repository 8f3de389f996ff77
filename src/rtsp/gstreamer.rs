//! RTSP through GStreamer: `rtspsrc ! rtph26xdepay ! capsfilter ! appsink`.
//!
//! `rtspsrc` performs DESCRIBE/SETUP while the pipeline goes to PAUSED and
//! offers every stream through `select-stream`; only H.264/H.265 video is
//! accepted and recorded as a [`Track`]. The depayloader chain is linked
//! when the selected stream's pad appears after PLAY and delivers
//! byte-stream access units to the appsink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use ::gstreamer as gst;
use gst::prelude::*;
use gstreamer_app::AppSink;

use super::transport::{SessionConnector, StreamSession};
use super::{AccessUnit, MediaDescription, RtspOptions, Track};
use crate::cancel::CancelScope;
use crate::decode::CodecKind;
use crate::error::{CaptureError, CaptureResult};

/// Access units buffered in the appsink before upstream blocks.
const APPSINK_BUFFERS: u32 = 4;

#[derive(Clone, Debug)]
pub struct GstreamerConnector {
    options: RtspOptions,
}

impl GstreamerConnector {
    pub fn new(options: RtspOptions) -> anyhow::Result<Self> {
        gst::init().context("initialize gstreamer")?;
        Ok(Self { options })
    }
}

impl SessionConnector for GstreamerConnector {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn connect(&self, address: &str, scope: &CancelScope) -> CaptureResult<Box<dyn StreamSession>> {
        scope.check()?;
        let url = url::Url::parse(address)
            .map_err(|e| CaptureError::protocol(format!("invalid stream address: {}", e)))?;
        if url.scheme() != "rtsp" {
            return Err(CaptureError::protocol(format!(
                "unsupported stream scheme '{}'",
                url.scheme()
            )));
        }
        Ok(Box::new(GstreamerSession::new(address, &self.options)?))
    }
}

#[derive(Default)]
struct Shared {
    /// Decodable video streams offered by `select-stream`, keyed by stream index.
    tracks: Vec<(u32, Track)>,
    selected: Option<(u8, CodecKind)>,
    link_error: Option<String>,
}

fn lock(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct GstreamerSession {
    pipeline: Option<gst::Pipeline>,
    appsink: AppSink,
    shared: Arc<Mutex<Shared>>,
    options: RtspOptions,
    codec: Option<CodecKind>,
    playing: bool,
}

fn gst_error(context: &str, err: impl std::fmt::Display) -> CaptureError {
    CaptureError::protocol(format!("{}: {}", context, err))
}

fn track_from_caps(index: u32, caps: &gst::CapsRef) -> Option<Track> {
    let structure = caps.structure(0)?;
    let media = structure.get::<&str>("media").ok()?.to_ascii_lowercase();
    let payload_type = u8::try_from(structure.get::<i32>("payload").ok()?).ok()?;
    let mut fmtp = HashMap::new();
    for (name, value) in structure.iter() {
        if let Ok(text) = value.get::<String>() {
            fmtp.insert(name.as_str().to_ascii_lowercase(), text);
        }
    }
    Some(Track {
        media,
        payload_type,
        encoding: structure
            .get::<&str>("encoding-name")
            .ok()
            .map(str::to_ascii_uppercase),
        clock_rate: structure
            .get::<i32>("clock-rate")
            .ok()
            .and_then(|rate| u32::try_from(rate).ok()),
        control: Some(format!("stream={}", index)),
        fmtp,
    })
}

impl GstreamerSession {
    fn new(address: &str, options: &RtspOptions) -> CaptureResult<Self> {
        let pipeline = gst::Pipeline::new();
        let source = gst::ElementFactory::make("rtspsrc")
            .property("location", address)
            .property("latency", 0u32)
            .property("user-agent", options.user_agent.as_str())
            .property_from_str("protocols", "tcp")
            .build()
            .map_err(|e| gst_error("create rtspsrc", e))?;
        let appsink = AppSink::builder()
            .sync(false)
            .max_buffers(APPSINK_BUFFERS)
            .drop(false)
            .build();
        pipeline
            .add_many([&source, appsink.upcast_ref::<gst::Element>()])
            .map_err(|e| gst_error("assemble rtsp pipeline", e))?;

        let shared = Arc::new(Mutex::new(Shared::default()));

        let offered = Arc::clone(&shared);
        source.connect("select-stream", false, move |values| {
            let index = values.get(1)?.get::<u32>().ok()?;
            let caps = values.get(2)?.get::<gst::Caps>().ok()?;
            let accept = match track_from_caps(index, &caps) {
                Some(track) if track.codec().is_some() => {
                    lock(&offered).tracks.push((index, track));
                    true
                }
                _ => false,
            };
            Some(accept.to_value())
        });

        let linking = Arc::clone(&shared);
        let weak_pipeline = pipeline.downgrade();
        let sink = appsink.clone();
        source.connect_pad_added(move |_, pad| {
            let Some(pipeline) = weak_pipeline.upgrade() else {
                return;
            };
            if let Err(err) = link_pad(&pipeline, pad, &sink, &linking) {
                log::warn!("rtsp pad {} not linked: {:#}", pad.name(), err);
                lock(&linking).link_error = Some(format!("{:#}", err));
            }
        });

        Ok(Self {
            pipeline: Some(pipeline),
            appsink,
            shared,
            options: options.clone(),
            codec: None,
            playing: false,
        })
    }

    fn pipeline(&self) -> CaptureResult<&gst::Pipeline> {
        self.pipeline.as_ref().ok_or_else(|| {
            CaptureError::network(
                "rtsp session",
                std::io::Error::new(std::io::ErrorKind::NotConnected, "session closed"),
            )
        })
    }

    /// Drain bus messages; an error or EOS ends the session.
    fn poll_bus(&self) -> CaptureResult<()> {
        let Some(bus) = self.pipeline()?.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gst::ClockTime::ZERO) {
            match message.view() {
                gst::MessageView::Error(err) => {
                    return Err(CaptureError::network(
                        "rtsp stream",
                        std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!(
                                "gstreamer error from {:?}: {}",
                                err.src().map(|s| s.path_string()),
                                err.error()
                            ),
                        ),
                    ))
                }
                gst::MessageView::Eos(..) => {
                    return Err(CaptureError::network(
                        "rtsp stream",
                        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "end of stream"),
                    ))
                }
                _ => {}
            }
        }
        if let Some(err) = lock(&self.shared).link_error.clone() {
            return Err(CaptureError::protocol(err));
        }
        Ok(())
    }

    /// Move to `target`, re-checking the scope and bus every poll interval.
    fn change_state(&self, target: gst::State, scope: &CancelScope) -> CaptureResult<()> {
        let pipeline = self.pipeline()?;
        let started = std::time::Instant::now();
        match pipeline.set_state(target) {
            Ok(gst::StateChangeSuccess::Success | gst::StateChangeSuccess::NoPreroll) => {
                return Ok(())
            }
            Ok(gst::StateChangeSuccess::Async) => {}
            Err(err) => {
                self.poll_bus()?;
                return Err(gst_error(&format!("set rtsp pipeline to {:?}", target), err));
            }
        }
        loop {
            scope.check()?;
            self.poll_bus()?;
            let wait = clock_time(scope.clamp(self.options.poll_interval));
            match pipeline.state(wait) {
                (Ok(gst::StateChangeSuccess::Success | gst::StateChangeSuccess::NoPreroll), current, _)
                    if current == target =>
                {
                    return Ok(())
                }
                (Err(err), _, _) => {
                    self.poll_bus()?;
                    return Err(gst_error(&format!("set rtsp pipeline to {:?}", target), err));
                }
                _ => {}
            }
            if started.elapsed() >= self.options.response_timeout {
                return Err(CaptureError::network(
                    "await rtsp response",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "no response from camera"),
                ));
            }
        }
    }
}

fn clock_time(wait: Duration) -> gst::ClockTime {
    gst::ClockTime::from_mseconds(wait.as_millis().max(1) as u64)
}

fn link_pad(
    pipeline: &gst::Pipeline,
    pad: &gst::Pad,
    sink: &AppSink,
    shared: &Mutex<Shared>,
) -> anyhow::Result<()> {
    let caps = pad
        .current_caps()
        .context("rtsp pad has no caps")?;
    let payload_type = caps
        .structure(0)
        .and_then(|s| s.get::<i32>("payload").ok())
        .and_then(|pt| u8::try_from(pt).ok());
    let selected = lock(shared).selected;

    let chain: Vec<gst::Element> = match selected {
        Some((pt, codec)) if payload_type == Some(pt) => {
            let (depay, media_type) = match codec {
                CodecKind::H264 => ("rtph264depay", "video/x-h264"),
                CodecKind::H265 => ("rtph265depay", "video/x-h265"),
            };
            let depay = gst::ElementFactory::make(depay).build()?;
            let filter = gst::ElementFactory::make("capsfilter")
                .property(
                    "caps",
                    gst::Caps::builder(media_type)
                        .field("stream-format", "byte-stream")
                        .field("alignment", "au")
                        .build(),
                )
                .build()?;
            vec![depay, filter]
        }
        _ => vec![gst::ElementFactory::make("fakesink")
            .property("sync", false)
            .build()?],
    };

    pipeline.add_many(chain.iter())?;
    if chain.len() == 2 {
        gst::Element::link_many([&chain[0], &chain[1], sink.upcast_ref::<gst::Element>()])?;
    }
    for element in &chain {
        element.sync_state_with_parent()?;
    }
    let target = chain[0]
        .static_pad("sink")
        .context("depayloader has no sink pad")?;
    pad.link(&target)?;
    Ok(())
}

/// Strip the leading Annex-B start code from an `alignment=au` buffer.
fn without_leading_start_code(data: &[u8]) -> &[u8] {
    data.strip_prefix(&[0, 0, 0, 1])
        .or_else(|| data.strip_prefix(&[0, 0, 1]))
        .unwrap_or(data)
}

impl StreamSession for GstreamerSession {
    fn describe(&mut self, scope: &CancelScope) -> CaptureResult<MediaDescription> {
        self.change_state(gst::State::Paused, scope)?;
        let tracks = lock(&self.shared)
            .tracks
            .iter()
            .map(|(_, track)| track.clone())
            .collect();
        Ok(MediaDescription {
            session_control: None,
            tracks,
        })
    }

    fn setup(&mut self, track: &Track, _scope: &CancelScope) -> CaptureResult<()> {
        let codec = track.codec().ok_or(CaptureError::MediaNotFound)?;
        lock(&self.shared).selected = Some((track.payload_type, codec));
        self.codec = Some(codec);
        Ok(())
    }

    fn play(&mut self, scope: &CancelScope) -> CaptureResult<()> {
        if self.codec.is_none() {
            return Err(CaptureError::protocol("PLAY before SETUP"));
        }
        self.change_state(gst::State::Playing, scope)?;
        self.playing = true;
        Ok(())
    }

    fn next_access_unit(&mut self, scope: &CancelScope) -> CaptureResult<AccessUnit> {
        let codec = match (self.playing, self.codec) {
            (true, Some(codec)) => codec,
            _ => return Err(CaptureError::protocol("session is not playing")),
        };
        loop {
            scope.check()?;
            self.poll_bus()?;
            let wait = clock_time(scope.clamp(self.options.poll_interval));
            let Some(sample) = self.appsink.try_pull_sample(wait) else {
                continue;
            };
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            let map = buffer
                .map_readable()
                .map_err(|e| gst_error("map rtsp buffer", e))?;
            let data = without_leading_start_code(map.as_slice());
            if data.is_empty() {
                continue;
            }
            return Ok(AccessUnit {
                codec,
                rtp_timestamp: buffer
                    .pts()
                    .map(|pts| (pts.mseconds() * 90) as u32)
                    .unwrap_or_default(),
                data: data.to_vec(),
            });
        }
    }

    fn close(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        if let Err(err) = pipeline.set_state(gst::State::Null) {
            log::debug!("rtsp pipeline shutdown: {}", err);
        }
        self.playing = false;
    }
}

impl Drop for GstreamerSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_code_is_stripped_once() {
        assert_eq!(without_leading_start_code(&[0, 0, 0, 1, 0x65, 0]), &[0x65, 0]);
        assert_eq!(without_leading_start_code(&[0, 0, 1, 0x41]), &[0x41]);
        assert_eq!(without_leading_start_code(&[0x41, 0, 0, 1]), &[0x41, 0, 0, 1]);
    }

    #[test]
    fn caps_become_tracks() -> anyhow::Result<()> {
        gst::init()?;
        let caps = gst::Caps::builder("application/x-rtp")
            .field("media", "video")
            .field("payload", 96i32)
            .field("clock-rate", 90_000i32)
            .field("encoding-name", "H264")
            .field("sprop-parameter-sets", "Z0IAHg==,aM4=")
            .build();
        let track = track_from_caps(1, &caps).ok_or_else(|| anyhow::anyhow!("no track"))?;
        assert_eq!(track.codec(), Some(CodecKind::H264));
        assert_eq!(track.payload_type, 96);
        assert_eq!(track.clock_rate, Some(90_000));
        assert_eq!(track.parameter_sets().len(), 2);
        Ok(())
    }

    #[test]
    fn non_rtsp_scheme_is_rejected() -> anyhow::Result<()> {
        let connector = GstreamerConnector::new(RtspOptions::default())?;
        let result = connector.connect("http://camera/stream", &CancelScope::root());
        assert!(matches!(result, Err(CaptureError::Protocol(_))));
        Ok(())
    }
}
