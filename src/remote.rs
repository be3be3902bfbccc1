use crate::config::RemoteConfig;
use async_trait::async_trait;
use eyre::Context;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Snapshot of one entity as returned by `GET /api/states/{entity_id}`.
/// A body without an `attributes` object does not decode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityState {
    pub state: String,
    pub attributes: Map<String, Value>,
}

impl EntityState {
    /// An absent attribute is `None`; a present one must be a string.
    fn attribute_str(&self, name: &str) -> Result<Option<&str>, RemoteError> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(RemoteError::Malformed(format!(
                "attribute {name} is not a string: {other}"
            ))),
        }
    }
}

/// What the media player is doing right now, reduced to the fields the
/// display cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackObservation {
    pub state: String,
    pub source: Option<String>,
    pub artwork: Option<String>,
}

impl PlaybackObservation {
    pub fn is_playing(&self) -> bool {
        self.state == "playing"
    }

    pub fn is_airplay(&self) -> bool {
        self.source
            .as_deref()
            .is_some_and(|s| s.to_ascii_lowercase().contains("airplay"))
    }
}

impl TryFrom<EntityState> for PlaybackObservation {
    type Error = RemoteError;

    fn try_from(entity: EntityState) -> Result<Self, Self::Error> {
        let source = entity.attribute_str("source")?.map(str::to_owned);
        // A null picture means there is none.
        let artwork = match entity.attributes.get("entity_picture") {
            Some(Value::Null) => None,
            _ => entity
                .attribute_str("entity_picture")?
                .filter(|p| !p.is_empty())
                .map(str::to_owned),
        };
        Ok(PlaybackObservation {
            state: entity.state,
            source,
            artwork,
        })
    }
}

/// The remote playback controller as seen by both control loops.
#[async_trait]
pub trait Remote: Send + Sync {
    /// `POST /api/services/media_player/{service}` for one entity.
    async fn call_service(&self, service: &str, entity_id: &str) -> Result<(), RemoteError>;

    async fn entity_state(&self, entity_id: &str) -> Result<EntityState, RemoteError>;

    /// Downloads the bytes behind an artwork reference, which may be relative
    /// to the remote's base URL.
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, RemoteError>;
}

/// Upper bounds for a whole request, connect included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTimeouts {
    pub service: Duration,
    /// Entity state and artwork downloads.
    pub state: Duration,
}

impl Default for RemoteTimeouts {
    fn default() -> Self {
        RemoteTimeouts {
            service: Duration::from_secs(3),
            state: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    base_url: String,
    client: Client,
    timeouts: RemoteTimeouts,
}

impl RemoteClient {
    pub fn new(config: &RemoteConfig) -> eyre::Result<Self> {
        Self::with_timeouts(config, RemoteTimeouts::default())
    }

    pub fn with_timeouts(config: &RemoteConfig, timeouts: RemoteTimeouts) -> eyre::Result<Self> {
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {}", config.token))
            .context("HA_TOKEN is not a valid header value")?;
        auth.set_sensitive(true);

        let mut headers = header::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(timeouts.service)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(RemoteClient {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            client,
            timeouts,
        })
    }

    pub fn resolve(&self, reference: &str) -> String {
        resolve_reference(&self.base_url, reference)
    }
}

pub fn resolve_reference(base_url: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        reference.to_owned()
    } else if reference.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), reference)
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), reference)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status { status, body })
    }
}

#[async_trait]
impl Remote for RemoteClient {
    #[instrument(skip(self), level = "debug")]
    async fn call_service(&self, service: &str, entity_id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/api/services/media_player/{}", self.base_url, service);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "entity_id": entity_id }))
            .timeout(self.timeouts.service)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn entity_state(&self, entity_id: &str) -> Result<EntityState, RemoteError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeouts.state)
            .send()
            .await?;
        let body = check_status(response).await?.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| RemoteError::Malformed(e.to_string()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, RemoteError> {
        let url = self.resolve(reference);
        debug!("Fetching {}", url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeouts.state)
            .send()
            .await?;
        let body = check_status(response).await?.bytes().await?;
        Ok(body.to_vec())
    }
}
