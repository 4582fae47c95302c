use crate::error::TransportError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;

const USER_AGENT: &str = "crystal-guide/0.1 (+stone-analysis)";
const MESSAGE_LIMIT: usize = 160;

/// OpenAI-compatible endpoint used for stone analysis.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// `POST {base}{endpoint}` with a JSON body; 2xx JSON comes back as-is.
    async fn post_json(
        &self,
        endpoint: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<Value, TransportError>;

    /// `GET {base}{endpoint}`, succeeding on any 2xx.
    async fn get(&self, endpoint: &str, api_key: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn post_json(
        &self,
        endpoint: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<Value, TransportError> {
        let url = self.url(endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|error| network_failure(&error, &url))?;

        if !response.status().is_success() {
            return Err(failure_from_response(response).await);
        }

        response
            .json::<Value>()
            .await
            .map_err(|error| TransportError::Decode(one_line(&error.to_string())))
    }

    async fn get(&self, endpoint: &str, api_key: &str) -> Result<(), TransportError> {
        let url = self.url(endpoint);
        let response = self
            .client
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|error| network_failure(&error, &url))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(failure_from_response(response).await)
        }
    }
}

/// Label for a non-2xx reply, e.g. `invalid_api_key` for a rejected bearer token.
fn status_label(status: StatusCode) -> &'static str {
    match status.as_u16() {
        401 => "invalid_api_key",
        402 => "billing_required",
        403 => "access_denied",
        404 => "model_or_endpoint_not_found",
        413 => "image_too_large",
        429 => "provider_rate_limited",
        408 | 504 => "provider_timeout",
        400..=499 => "request_rejected",
        500..=599 => "provider_unavailable",
        _ => "unexpected_status",
    }
}

/// Status label plus the provider's own error message when the body has one.
async fn failure_from_response(response: reqwest::Response) -> TransportError {
    let status = response.status();
    let label = status_label(status);
    let detail = response
        .text()
        .await
        .ok()
        .and_then(|body| provider_message(&body));
    let reason = match detail {
        Some(message) => format!("{label}: {message}"),
        None => label.to_string(),
    };
    TransportError::Status {
        status: status.as_u16(),
        reason,
    }
}

/// `error.message` of an OpenAI-style error body.
fn provider_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let message = value.pointer("/error/message")?.as_str()?;
    let message = one_line(message);
    (!message.is_empty()).then_some(message)
}

fn network_failure(error: &reqwest::Error, url: &str) -> TransportError {
    let label = if error.is_timeout() {
        "provider_timeout"
    } else if error.is_connect() {
        "provider_unreachable"
    } else if error.is_body() || error.is_decode() {
        "reply_interrupted"
    } else {
        "transport_failed"
    };
    TransportError::Network(format!("{label} ({url})"))
}

/// Collapses whitespace and caps the length so messages stay log-friendly.
fn one_line(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MESSAGE_LIMIT)
        .collect()
}

fn build_client() -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        header::HeaderValue::from_static(USER_AGENT),
    );
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/json"),
    );
    // Per-attempt deadlines are enforced by the retry layer.
    Client::builder()
        .default_headers(headers)
        .build()
        .context("Failed to build provider HTTP client")
}
