//! Control-plane collaborators: token, roster, snapshot upload, heartbeat.
//!
//! The capture core only sees the traits; `HttpControlPlane` is the
//! production implementation over HTTP/JSON.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

use crate::camera::{Camera, SnapshotImage};

/// Opaque authorization artifact; attached verbatim to control-plane calls.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds as reported by the issuer.
    #[serde(default)]
    pub expires_in: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl AccessToken {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            token_type: default_token_type(),
            expires_in: 0,
        }
    }

    /// `Authorization` header value.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

pub trait Authenticator: Send + Sync {
    fn token(&self) -> Result<AccessToken>;
}

pub trait RosterSource: Send + Sync {
    /// Every camera on the roster, all pages included.
    fn cameras(&self, token: &AccessToken) -> Result<Vec<Camera>>;
}

pub trait SnapshotSink: Send + Sync {
    fn upload(&self, token: &AccessToken, image: &SnapshotImage) -> Result<()>;
}

pub trait HeartbeatSink: Send + Sync {
    fn heartbeat(&self, token: Option<&AccessToken>, healthy: bool) -> Result<()>;
}

/// OIDC client-credentials grant parameters.
#[derive(Clone, Debug)]
pub struct OidcCredentials {
    pub token_url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct Endpoints {
    pub roster_url: String,
    /// Snapshots go to `{upload_base}/{camera_id}/snapshot`.
    pub upload_base: String,
    pub heartbeat_url: String,
    pub page_size: u32,
}

#[derive(Debug, Deserialize)]
struct RosterPage {
    items: Vec<Camera>,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    pages: u32,
}

/// Upper bound on roster pages fetched per cycle.
const MAX_ROSTER_PAGES: u32 = 1000;

pub struct HttpControlPlane {
    agent: ureq::Agent,
    credentials: OidcCredentials,
    endpoints: Endpoints,
}

impl HttpControlPlane {
    pub fn new(credentials: OidcCredentials, endpoints: Endpoints, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            credentials,
            endpoints,
        }
    }

    fn upload_url(&self, camera_id: &str) -> String {
        format!(
            "{}/{}/snapshot",
            self.endpoints.upload_base.trim_end_matches('/'),
            camera_id
        )
    }
}

impl Authenticator for HttpControlPlane {
    fn token(&self) -> Result<AccessToken> {
        let creds = &self.credentials;
        let token: AccessToken = self
            .agent
            .post(&creds.token_url)
            .send_form(&[
                ("grant_type", "client_credentials"),
                ("client_id", creds.client_id.as_str()),
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
                ("scope", "profile"),
            ])
            .with_context(|| format!("request token from {}", creds.token_url))?
            .into_json()
            .context("parse token response")?;
        if token.access_token.is_empty() {
            return Err(anyhow!("token endpoint returned an empty access token"));
        }
        log::debug!("token acquired, expires in {}s", token.expires_in);
        Ok(token)
    }
}

impl RosterSource for HttpControlPlane {
    fn cameras(&self, token: &AccessToken) -> Result<Vec<Camera>> {
        let mut cameras = Vec::new();
        let mut page = 1u32;
        loop {
            let body: RosterPage = self
                .agent
                .get(&self.endpoints.roster_url)
                .set("Authorization", &token.authorization())
                .query("page", &page.to_string())
                .query("size", &self.endpoints.page_size.to_string())
                .call()
                .with_context(|| format!("fetch roster page {}", page))?
                .into_json()
                .with_context(|| format!("parse roster page {}", page))?;
            log::debug!(
                "roster page {}/{}: {} cameras (total {})",
                body.page.max(page),
                body.pages,
                body.items.len(),
                body.total
            );
            let last = body.items.is_empty() || page >= body.pages;
            cameras.extend(body.items);
            if last {
                break;
            }
            if page >= MAX_ROSTER_PAGES {
                return Err(anyhow!("roster exceeds {} pages", MAX_ROSTER_PAGES));
            }
            page += 1;
        }
        Ok(cameras)
    }
}

impl SnapshotSink for HttpControlPlane {
    fn upload(&self, token: &AccessToken, image: &SnapshotImage) -> Result<()> {
        let url = self.upload_url(&image.camera_id);
        self.agent
            .post(&url)
            .set("Authorization", &token.authorization())
            .send_json(serde_json::json!({
                "image_base64": STANDARD.encode(&image.bytes),
            }))
            .with_context(|| format!("upload snapshot to {}", url))?;
        Ok(())
    }
}

impl HeartbeatSink for HttpControlPlane {
    fn heartbeat(&self, token: Option<&AccessToken>, healthy: bool) -> Result<()> {
        let mut request = self.agent.post(&self.endpoints.heartbeat_url);
        if let Some(token) = token {
            request = request.set("Authorization", &token.authorization());
        }
        request
            .send_json(serde_json::json!({ "healthy": healthy }))
            .with_context(|| format!("send heartbeat to {}", self.endpoints.heartbeat_url))?;
        Ok(())
    }
}
