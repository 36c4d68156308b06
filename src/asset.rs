//! Remote asset resolution.
//!
//! Elements reference images and videos by public URL. The destination host
//! cannot use those directly: each one is probed for its media type, submitted
//! to the host import API, and awaited until the host reports a durable
//! reference.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::stream::proto::ElementKind;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const ASSET_API_BASE_URL: &str = "https://api.deckstream.app";
pub const LOCAL_ASSET_API_BASE_URL: &str = "http://localhost:8000";
const UPLOADS_PATH: &str = "/v1/assets/uploads";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AssetResolverDefaults;

impl AssetResolverDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
    pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn for_element(kind: ElementKind) -> Option<Self> {
        match kind {
            ElementKind::Image => Some(Self::Image),
            ElementKind::Video => Some(Self::Video),
            _ => None,
        }
    }

    fn default_mime_type(self) -> &'static str {
        match self {
            Self::Image => "image/png",
            Self::Video => "video/mp4",
        }
    }

    fn top_level_type(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.top_level_type())
    }
}

/// Provenance tag sent with every import.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiDisclosure {
    #[default]
    None,
    AppGenerated,
}

/// Opaque host reference for an imported asset.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetRef(String);

impl AssetRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns an external locator into a host reference.
///
/// Implementations must be safe to share across concurrent sessions.
#[async_trait]
pub trait AssetResolver: Send + Sync {
    async fn resolve(&self, locator: &str, kind: MediaKind) -> Result<AssetRef, ResolveError>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("probe request failed: {0}")]
    ProbeTransport(reqwest::Error),

    #[error("probe returned http status {0}")]
    ProbeStatus(StatusCode),

    #[error("unsupported media type {mime_type} for {kind} asset")]
    UnsupportedMediaType { mime_type: String, kind: MediaKind },

    #[error("upload request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("upload not confirmed within {0:?}")]
    UploadTimeout(Duration),

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProbeTransport(err) | Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::ProbeStatus(status) | Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::UnsupportedMediaType { .. }
            | Self::Rejected(_)
            | Self::UploadTimeout(_)
            | Self::Parse(_) => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AssetResolverOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Delay between status checks while the host processes an upload.
    pub poll_interval: Duration,
    /// Upper bound on waiting for the host to confirm an upload.
    pub upload_timeout: Duration,
    pub disclosure: AiDisclosure,
}

impl Default for AssetResolverOptions {
    fn default() -> Self {
        Self {
            connect_timeout: AssetResolverDefaults::CONNECT_TIMEOUT,
            attempt_timeout: AssetResolverDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::asset_import(),
            poll_interval: AssetResolverDefaults::POLL_INTERVAL,
            upload_timeout: AssetResolverDefaults::UPLOAD_TIMEOUT,
            disclosure: AiDisclosure::default(),
        }
    }
}

/// Body of an import request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadAssetRequest {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub url: String,
    pub mime_type: String,
    pub thumbnail_url: String,
    pub ai_disclosure: AiDisclosure,
}

/// [`AssetResolver`] backed by the host's HTTP import API.
#[derive(Clone)]
pub struct HttpAssetResolver {
    http: Client,
    api_key: Option<SecretString>,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    poll_interval: Duration,
    upload_timeout: Duration,
    disclosure: AiDisclosure,
}

impl HttpAssetResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_options(None, AssetResolverOptions::default())
    }

    pub fn with_api_key(api_key: SecretString) -> Result<Self, ResolveError> {
        Self::with_options(Some(api_key), AssetResolverOptions::default())
    }

    pub fn with_options(
        api_key: Option<SecretString>,
        options: AssetResolverOptions,
    ) -> Result<Self, ResolveError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ResolveError::Transport)?;

        Ok(Self {
            http,
            api_key,
            base_url: ASSET_API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            poll_interval: options.poll_interval,
            upload_timeout: options.upload_timeout,
            disclosure: options.disclosure,
        })
    }

    pub fn with_local_mode(self, local: bool) -> Self {
        let base = if local {
            LOCAL_ASSET_API_BASE_URL
        } else {
            ASSET_API_BASE_URL
        };
        self.with_base_url(base)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim().trim_end_matches('/').to_string();
        self
    }

    fn uploads_endpoint(&self) -> String {
        format!("{}{}", self.base_url, UPLOADS_PATH)
    }

    fn upload_status_endpoint(&self, upload_id: &str) -> String {
        format!("{}{}/{}", self.base_url, UPLOADS_PATH, upload_id)
    }

    async fn probe_mime_type(&self, locator: &str, kind: MediaKind) -> Result<String, ResolveError> {
        let content_type = retry_async(
            &self.retry_policy,
            |_| self.probe_attempt(locator),
            ResolveError::is_retryable,
        )
        .await?;
        debug!(
            event = "asset_probed",
            locator,
            content_type = content_type.as_deref().unwrap_or("<none>")
        );
        select_mime_type(content_type.as_deref(), kind)
    }

    async fn probe_attempt(&self, locator: &str) -> Result<Option<String>, ResolveError> {
        let head = self
            .http
            .head(locator)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(ResolveError::ProbeTransport)?;
        if head.status().is_success() {
            return Ok(header_content_type(&head));
        }

        // Some CDNs refuse HEAD; the body of the GET is never read.
        let get = self
            .http
            .get(locator)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(ResolveError::ProbeTransport)?;
        if !get.status().is_success() {
            return Err(ResolveError::ProbeStatus(get.status()));
        }
        Ok(header_content_type(&get))
    }

    async fn submit_upload(&self, request: &UploadAssetRequest) -> Result<UploadState, ResolveError> {
        let endpoint = self.uploads_endpoint();
        retry_async(
            &self.retry_policy,
            |_| {
                let builder = self
                    .http
                    .post(endpoint.as_str())
                    .timeout(self.attempt_timeout)
                    .json(request);
                self.send_attempt(builder)
            },
            ResolveError::is_retryable,
        )
        .await
    }

    async fn await_upload(&self, upload_id: &str) -> Result<AssetRef, ResolveError> {
        let endpoint = self.upload_status_endpoint(upload_id);
        let poll = async {
            loop {
                tokio::time::sleep(self.poll_interval).await;
                let state = retry_async(
                    &self.retry_policy,
                    |_| {
                        let builder = self.http.get(endpoint.as_str()).timeout(self.attempt_timeout);
                        self.send_attempt(builder)
                    },
                    ResolveError::is_retryable,
                )
                .await?;
                match state {
                    UploadState::Ready(asset) => return Ok::<_, ResolveError>(asset),
                    UploadState::Pending(_) => {
                        debug!(event = "asset_upload_pending", upload_id);
                    }
                }
            }
        };

        with_timeout(self.upload_timeout, poll)
            .await
            .map_err(|_| ResolveError::UploadTimeout(self.upload_timeout))?
    }

    async fn send_attempt(
        &self,
        mut builder: reqwest::RequestBuilder,
    ) -> Result<UploadState, ResolveError> {
        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = builder.send().await.map_err(ResolveError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ResolveError::Transport)?;

        if !status.is_success() {
            return Err(ResolveError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_upload_response(&body)
    }
}

#[async_trait]
impl AssetResolver for HttpAssetResolver {
    async fn resolve(&self, locator: &str, kind: MediaKind) -> Result<AssetRef, ResolveError> {
        let mime_type = self.probe_mime_type(locator, kind).await?;
        let request = UploadAssetRequest {
            kind,
            url: locator.to_string(),
            mime_type,
            thumbnail_url: locator.to_string(),
            ai_disclosure: self.disclosure,
        };

        let asset = match self.submit_upload(&request).await? {
            UploadState::Ready(asset) => asset,
            UploadState::Pending(upload_id) => self.await_upload(&upload_id).await?,
        };
        debug!(event = "asset_uploaded", locator, asset_ref = %asset);
        Ok(asset)
    }
}

fn header_content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Normalizes a probed `Content-Type` and checks it against the element kind.
fn select_mime_type(content_type: Option<&str>, kind: MediaKind) -> Result<String, ResolveError> {
    let essence = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty());

    let Some(mime_type) = essence else {
        return Ok(kind.default_mime_type().to_string());
    };

    let top_level = mime_type.split('/').next().unwrap_or_default();
    if top_level != kind.top_level_type() {
        return Err(ResolveError::UnsupportedMediaType { mime_type, kind });
    }
    Ok(mime_type)
}

#[derive(Debug, PartialEq, Eq)]
enum UploadState {
    Ready(AssetRef),
    Pending(String),
}

#[derive(Debug, Deserialize)]
struct UploadEnvelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
    #[serde(default)]
    upload_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_upload_response(body: &str) -> Result<UploadState, ResolveError> {
    let envelope: UploadEnvelope = serde_json::from_str(body)
        .map_err(|err| ResolveError::Parse(format!("upload response: {err}")))?;

    let status = envelope
        .status
        .as_deref()
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "ok".to_string());

    match status.as_str() {
        "ok" | "ready" | "completed" => envelope
            .reference
            .map(|reference| UploadState::Ready(AssetRef::new(reference)))
            .ok_or_else(|| ResolveError::Parse("status=ok payload missing ref".to_string())),
        "pending" | "processing" => envelope
            .upload_id
            .map(UploadState::Pending)
            .ok_or_else(|| ResolveError::Parse("pending payload missing upload_id".to_string())),
        _ => Err(ResolveError::Rejected(
            envelope
                .reason
                .or(envelope.message)
                .or(envelope.error)
                .unwrap_or(status),
        )),
    }
}

pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_ready_upload() {
        let state = parse_upload_response(r#"{"status":"ok","ref":"M4fA1"}"#).expect("ready");
        assert_eq!(state, UploadState::Ready(AssetRef::new("M4fA1")));
    }

    #[test]
    fn parse_bare_ref_as_ready() {
        let state = parse_upload_response(r#"{"ref":"M4fA1"}"#).expect("ready");
        assert_eq!(state, UploadState::Ready(AssetRef::new("M4fA1")));
    }

    #[test]
    fn parse_pending_upload() {
        let state = parse_upload_response(r#"{"status":"PENDING","upload_id":"up-7"}"#)
            .expect("pending");
        assert_eq!(state, UploadState::Pending("up-7".to_string()));
    }

    #[test]
    fn parse_failed_upload_carries_reason() {
        let err = parse_upload_response(r#"{"status":"failed","reason":"image too large"}"#)
            .expect_err("failed");
        match err {
            ResolveError::Rejected(detail) => assert_eq!(detail, "image too large"),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn parse_ok_without_ref_is_error() {
        assert!(matches!(
            parse_upload_response(r#"{"status":"ok"}"#),
            Err(ResolveError::Parse(_))
        ));
    }

    #[test]
    fn mime_type_defaults_when_header_missing() {
        assert_eq!(
            select_mime_type(None, MediaKind::Image).expect("default"),
            "image/png"
        );
        assert_eq!(
            select_mime_type(Some("  "), MediaKind::Video).expect("default"),
            "video/mp4"
        );
    }

    #[test]
    fn mime_type_strips_parameters() {
        assert_eq!(
            select_mime_type(Some("Image/JPEG; charset=binary"), MediaKind::Image)
                .expect("jpeg"),
            "image/jpeg"
        );
    }

    #[test]
    fn mime_type_must_match_media_kind() {
        let err = select_mime_type(Some("text/html"), MediaKind::Image).expect_err("html");
        assert!(matches!(err, ResolveError::UnsupportedMediaType { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn upload_request_wire_shape() {
        let request = UploadAssetRequest {
            kind: MediaKind::Image,
            url: "https://images.example/a.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            thumbnail_url: "https://images.example/a.jpg".to_string(),
            ai_disclosure: AiDisclosure::None,
        };
        assert_eq!(
            serde_json::to_value(request).expect("encode"),
            json!({
                "type": "image",
                "url": "https://images.example/a.jpg",
                "mime_type": "image/jpeg",
                "thumbnail_url": "https://images.example/a.jpg",
                "ai_disclosure": "none"
            })
        );
    }

    #[test]
    fn base_url_selection() {
        let resolver = HttpAssetResolver::new().expect("build resolver");
        assert_eq!(
            resolver.uploads_endpoint(),
            "https://api.deckstream.app/v1/assets/uploads"
        );

        let resolver = resolver.with_local_mode(true);
        assert_eq!(
            resolver.upload_status_endpoint("up-1"),
            "http://localhost:8000/v1/assets/uploads/up-1"
        );

        let resolver = resolver.with_base_url("http://127.0.0.1:9999/ \n");
        assert_eq!(
            resolver.uploads_endpoint(),
            "http://127.0.0.1:9999/v1/assets/uploads"
        );
    }

    #[test]
    fn media_kind_only_for_image_and_video() {
        assert_eq!(MediaKind::for_element(ElementKind::Image), Some(MediaKind::Image));
        assert_eq!(MediaKind::for_element(ElementKind::Video), Some(MediaKind::Video));
        assert_eq!(MediaKind::for_element(ElementKind::Text), None);
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = ResolveError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(!ResolveError::Rejected("nope".into()).is_retryable());
    }
}
