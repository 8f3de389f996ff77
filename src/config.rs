use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control_plane::{Endpoints, OidcCredentials};
use crate::encode::EncoderKind;
use crate::rtsp::RtspOptions;

const DEFAULT_ROSTER_URL: &str = "http://127.0.0.1:8080/api/cameras";
const DEFAULT_UPLOAD_URL: &str = "http://127.0.0.1:8080/api/cameras";
const DEFAULT_HEARTBEAT_URL: &str = "http://127.0.0.1:8080/api/agent/heartbeat";
const DEFAULT_TOKEN_URL: &str = "http://127.0.0.1:8080/auth/token";
const DEFAULT_CLIENT_ID: &str = "snapshot-agent";
const DEFAULT_HEARTBEAT_SECS: u64 = 60;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_ENCODER: &str = "png";
const DEFAULT_SYNTHETIC_WIDTH: u32 = 640;
const DEFAULT_SYNTHETIC_HEIGHT: u32 = 480;

const DEFAULT_DECODER: &str = "ffmpeg";
const DEFAULT_RTSP_CLIENT: &str = "tcp";

/// Decoder backends compiled into this build.
#[cfg(feature = "decode-ffmpeg")]
pub const KNOWN_DECODERS: &[&str] = &["synthetic", "ffmpeg"];
#[cfg(not(feature = "decode-ffmpeg"))]
pub const KNOWN_DECODERS: &[&str] = &["synthetic"];

/// RTSP clients compiled into this build.
#[cfg(feature = "rtsp-gstreamer")]
pub const KNOWN_RTSP_CLIENTS: &[&str] = &["tcp", "gstreamer"];
#[cfg(not(feature = "rtsp-gstreamer"))]
pub const KNOWN_RTSP_CLIENTS: &[&str] = &["tcp"];

#[derive(Debug, Deserialize, Default)]
struct AgentConfigFile {
    heartbeat_secs: Option<u64>,
    control_plane: Option<ControlPlaneConfigFile>,
    auth: Option<AuthConfigFile>,
    rtsp: Option<RtspConfigFile>,
    decoder: Option<DecoderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ControlPlaneConfigFile {
    roster_url: Option<String>,
    upload_url: Option<String>,
    heartbeat_url: Option<String>,
    http_timeout_secs: Option<u64>,
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthConfigFile {
    token_url: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RtspConfigFile {
    connect_timeout_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    user_agent: Option<String>,
    client: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DecoderConfigFile {
    backend: Option<String>,
    encoder: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoints: Endpoints,
    pub credentials: OidcCredentials,
    pub heartbeat_interval: Duration,
    pub http_timeout: Duration,
    pub rtsp: RtspOptions,
    /// `tcp` (built-in) or `gstreamer`.
    pub rtsp_client: String,
    pub decoder: DecoderSettings,
}

#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub backend: String,
    pub encoder: EncoderKind,
    /// Picture size produced by the synthetic backend.
    pub width: u32,
    pub height: u32,
}

impl AgentConfig {
    /// Load from `SNAPSHOT_AGENT_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SNAPSHOT_AGENT_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        Self::load_with_decoder(path, None)
    }

    /// As [`load_from`](Self::load_from), with a decoder override (CLI flag)
    /// taking precedence over file and env before validation.
    pub fn load_with_decoder(path: Option<&Path>, decoder: Option<&str>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        if let Some(decoder) = decoder {
            cfg.decoder.backend = decoder.to_string();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AgentConfigFile) -> Result<Self> {
        let control = file.control_plane.unwrap_or_default();
        let auth = file.auth.unwrap_or_default();
        let rtsp = file.rtsp.unwrap_or_default();
        let decoder = file.decoder.unwrap_or_default();

        let endpoints = Endpoints {
            roster_url: control
                .roster_url
                .unwrap_or_else(|| DEFAULT_ROSTER_URL.to_string()),
            upload_base: control
                .upload_url
                .unwrap_or_else(|| DEFAULT_UPLOAD_URL.to_string()),
            heartbeat_url: control
                .heartbeat_url
                .unwrap_or_else(|| DEFAULT_HEARTBEAT_URL.to_string()),
            page_size: control.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        };
        let credentials = OidcCredentials {
            token_url: auth.token_url.unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            client_id: auth.client_id.unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            username: auth.username.unwrap_or_default(),
            password: auth.password.unwrap_or_default(),
        };
        let defaults = RtspOptions::default();
        let rtsp_client = rtsp
            .client
            .clone()
            .unwrap_or_else(|| DEFAULT_RTSP_CLIENT.to_string());
        let rtsp = RtspOptions {
            connect_timeout: Duration::from_millis(
                rtsp.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            response_timeout: Duration::from_millis(
                rtsp.response_timeout_ms
                    .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_MS),
            ),
            poll_interval: Duration::from_millis(
                rtsp.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            user_agent: rtsp.user_agent.unwrap_or(defaults.user_agent),
        };
        let encoder = EncoderKind::from_name(decoder.encoder.as_deref().unwrap_or(DEFAULT_ENCODER))?;
        let decoder = DecoderSettings {
            backend: decoder
                .backend
                .unwrap_or_else(|| DEFAULT_DECODER.to_string()),
            encoder,
            width: decoder.width.unwrap_or(DEFAULT_SYNTHETIC_WIDTH),
            height: decoder.height.unwrap_or(DEFAULT_SYNTHETIC_HEIGHT),
        };
        Ok(Self {
            endpoints,
            credentials,
            heartbeat_interval: Duration::from_secs(
                file.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS),
            ),
            http_timeout: Duration::from_secs(
                control
                    .http_timeout_secs
                    .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            ),
            rtsp,
            rtsp_client,
            decoder,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        let overrides: [(&str, &mut String); 9] = [
            ("SNAPSHOT_AGENT_ROSTER_URL", &mut self.endpoints.roster_url),
            ("SNAPSHOT_AGENT_UPLOAD_URL", &mut self.endpoints.upload_base),
            ("SNAPSHOT_AGENT_HEARTBEAT_URL", &mut self.endpoints.heartbeat_url),
            ("SNAPSHOT_AGENT_TOKEN_URL", &mut self.credentials.token_url),
            ("SNAPSHOT_AGENT_CLIENT_ID", &mut self.credentials.client_id),
            ("SNAPSHOT_AGENT_USERNAME", &mut self.credentials.username),
            ("SNAPSHOT_AGENT_PASSWORD", &mut self.credentials.password),
            ("SNAPSHOT_AGENT_DECODER", &mut self.decoder.backend),
            ("SNAPSHOT_AGENT_RTSP_CLIENT", &mut self.rtsp_client),
        ];
        for (name, target) in overrides {
            if let Ok(value) = std::env::var(name) {
                if !value.trim().is_empty() {
                    *target = value;
                }
            }
        }
        if let Ok(secs) = std::env::var("SNAPSHOT_AGENT_HEARTBEAT_SECS") {
            let seconds: u64 = secs.parse().map_err(|_| {
                anyhow!("SNAPSHOT_AGENT_HEARTBEAT_SECS must be an integer number of seconds")
            })?;
            self.heartbeat_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for (label, value) in [
            ("roster url", &self.endpoints.roster_url),
            ("upload url", &self.endpoints.upload_base),
            ("heartbeat url", &self.endpoints.heartbeat_url),
            ("token url", &self.credentials.token_url),
        ] {
            let url = url::Url::parse(value.trim())
                .map_err(|e| anyhow!("{} '{}' is invalid: {}", label, value, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!("{} must be http(s), got '{}'", label, value));
            }
        }
        if self.heartbeat_interval.is_zero() {
            return Err(anyhow!("heartbeat interval must be greater than zero"));
        }
        if self.endpoints.page_size == 0 {
            return Err(anyhow!("roster page size must be greater than zero"));
        }
        if self.http_timeout.is_zero() {
            return Err(anyhow!("http timeout must be greater than zero"));
        }
        if self.rtsp.connect_timeout.is_zero()
            || self.rtsp.response_timeout.is_zero()
            || self.rtsp.poll_interval.is_zero()
        {
            return Err(anyhow!("rtsp timeouts must be greater than zero"));
        }
        if self.decoder.width == 0 || self.decoder.height == 0 {
            return Err(anyhow!("synthetic decoder dimensions must be non-zero"));
        }
        self.rtsp_client = self.rtsp_client.trim().to_lowercase();
        validate_named(
            "rtsp client",
            &self.rtsp_client,
            KNOWN_RTSP_CLIENTS,
            &["gstreamer"],
            "rtsp-gstreamer",
        )?;
        self.decoder.backend = self.decoder.backend.trim().to_lowercase();
        validate_decoder(&self.decoder.backend)
    }
}

/// `synthetic` is never the default; builds without ffmpeg must name it.
fn validate_decoder(name: &str) -> Result<()> {
    validate_named("decoder backend", name, KNOWN_DECODERS, &["ffmpeg"], "decode-ffmpeg").map_err(
        |err| match KNOWN_DECODERS.contains(&"ffmpeg") {
            true => err,
            false => anyhow!("{}; pass --decoder synthetic for test-pattern snapshots", err),
        },
    )
}

fn validate_named(
    label: &str,
    name: &str,
    compiled: &[&str],
    gated: &[&str],
    feature: &str,
) -> Result<()> {
    if compiled.contains(&name) {
        return Ok(());
    }
    if gated.contains(&name) {
        return Err(anyhow!(
            "{} '{}' requires the {} feature, which this build lacks",
            label,
            name,
            feature
        ));
    }
    Err(anyhow!(
        "unknown {} '{}'; available: {}",
        label,
        name,
        compiled.join(", ")
    ))
}

fn read_config_file(path: &Path) -> Result<AgentConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
