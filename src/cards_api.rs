//! Card generation backend client.
//!
//! Turns a free-form prompt into the list of cards that a batch streams, one
//! page per card.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::asset::summarize_error_body;
use crate::retry::{retry_async, RetryPolicy};
use crate::stream::proto::CardMsg;

pub const CARDS_API_BASE_URL: &str = "https://api.deckstream.app";
pub const LOCAL_CARDS_API_BASE_URL: &str = "http://localhost:8000";
const CREATE_CARDS_PATH: &str = "/cards/create_cards";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CardsApiDefaults;

impl CardsApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Card generation runs a model server-side and is slow.
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const CARD_COUNT: usize = 5;
}

/// One generated slide topic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl Card {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

impl From<&Card> for CardMsg {
    fn from(card: &Card) -> Self {
        Self {
            title: card.title.clone(),
            description: card.description.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateCardsRequest {
    pub session_id: Uuid,
    pub user_input: String,
    pub n_cards: usize,
}

/// Cards returned for one prompt, tagged with the session id sent upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedCards {
    pub session_id: Uuid,
    pub cards: Vec<Card>,
}

#[derive(Debug, Error)]
pub enum CardsApiError {
    #[error("user input is empty")]
    EmptyInput,

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl CardsApiError {
    /// Card generation is not idempotent, so only failures where the backend
    /// never started work are retried. A timeout may still produce cards.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_connect(),
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::SERVICE_UNAVAILABLE
            }
            Self::EmptyInput | Self::Parse(_) => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CardsApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for CardsApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: CardsApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: CardsApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::backend_request(),
        }
    }
}

#[derive(Clone)]
pub struct CardsApiClient {
    http: Client,
    api_key: Option<SecretString>,
    local: bool,
    base_url_override: Option<String>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl CardsApiClient {
    pub fn new() -> Result<Self, CardsApiError> {
        Self::with_options(None, CardsApiClientOptions::default())
    }

    pub fn with_api_key(api_key: SecretString) -> Result<Self, CardsApiError> {
        Self::with_options(Some(api_key), CardsApiClientOptions::default())
    }

    pub fn with_options(
        api_key: Option<SecretString>,
        options: CardsApiClientOptions,
    ) -> Result<Self, CardsApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(CardsApiError::Transport)?;

        Ok(Self {
            http,
            api_key,
            local: false,
            base_url_override: None,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url_override = Some(base_url.into().trim().trim_end_matches('/').to_string());
        self
    }

    /// Generates [`CardsApiDefaults::CARD_COUNT`] cards for `user_input`.
    pub async fn create_cards(&self, user_input: &str) -> Result<CreatedCards, CardsApiError> {
        self.create_cards_with_count(user_input, CardsApiDefaults::CARD_COUNT)
            .await
    }

    pub async fn create_cards_with_count(
        &self,
        user_input: &str,
        n_cards: usize,
    ) -> Result<CreatedCards, CardsApiError> {
        let user_input = user_input.trim();
        if user_input.is_empty() {
            return Err(CardsApiError::EmptyInput);
        }

        let request = CreateCardsRequest {
            session_id: Uuid::new_v4(),
            user_input: user_input.to_string(),
            n_cards,
        };
        let endpoint = self.url(CREATE_CARDS_PATH);
        let cards = retry_async(
            &self.retry_policy,
            |_| self.send_attempt(endpoint.as_str(), &request),
            CardsApiError::is_retryable,
        )
        .await?;

        debug!(
            event = "cards_created",
            session_id = %request.session_id,
            requested = n_cards,
            received = cards.len()
        );
        Ok(CreatedCards {
            session_id: request.session_id,
            cards,
        })
    }

    async fn send_attempt(
        &self,
        endpoint: &str,
        request: &CreateCardsRequest,
    ) -> Result<Vec<Card>, CardsApiError> {
        let mut builder = self
            .http
            .post(endpoint)
            .timeout(self.attempt_timeout)
            .json(request);
        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = builder.send().await.map_err(CardsApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(CardsApiError::Transport)?;

        if !status.is_success() {
            return Err(CardsApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_cards_response(&body)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn base_url(&self) -> &str {
        if let Some(base_url) = self.base_url_override.as_deref() {
            return base_url;
        }
        if self.local {
            LOCAL_CARDS_API_BASE_URL
        } else {
            CARDS_API_BASE_URL
        }
    }
}

fn parse_cards_response(body: &str) -> Result<Vec<Card>, CardsApiError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CardsResponse {
        Bare(Vec<Card>),
        Envelope { cards: Vec<Card> },
    }

    match serde_json::from_str::<CardsResponse>(body) {
        Ok(CardsResponse::Bare(cards)) | Ok(CardsResponse::Envelope { cards }) => Ok(cards),
        Err(err) => Err(CardsApiError::Parse(format!("cards response: {err}"))),
    }
}
