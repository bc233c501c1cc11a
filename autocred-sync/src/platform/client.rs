//! External messaging platform API client
//!
//! ManyChat-compatible HTTP API: subscriber lookup, tag mutation, custom
//! fields, message send. Every outbound call goes through one shared
//! rate-limited execution primitive with the retry policy keyed on error
//! kind: 404 is a normal miss (never retried), 429 sleeps the server-supplied
//! retry-after and replays without consuming the attempt budget, 401/403 fail
//! immediately, everything else retries with exponential backoff.

use super::rate_limit::RateLimiter;
use super::types::{LookupIdentifiers, Subscriber, Tag};
use crate::tags::normalize_tag;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Platform client errors
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Server asked us to slow down (HTTP 429)
    #[error("Rate limited by platform, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Subscriber or resource missing (HTTP 404). A normal outcome for
    /// lookups, surfaced as `Ok(None)` there.
    #[error("Not found on platform")]
    NotFound,

    /// Credentials rejected (HTTP 401/403). Fatal for the whole client.
    #[error("Platform authentication failed (HTTP {0})")]
    AuthFailed(u16),

    /// Tag name has no registered id on the platform. A configuration
    /// problem upstream, never a transient fault.
    #[error("Tag not registered on platform: {0}")]
    TagNotRegistered(String),

    /// Platform answered with a non-JSON (HTML) body
    #[error("Platform returned non-JSON response (HTTP {0})")]
    NonJsonResponse(u16),

    /// Network-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Other HTTP error after retries exhausted
    #[error("Platform API error {0}: {1}")]
    Api(u16, String),

    /// Response body did not match the expected shape
    #[error("Parse error: {0}")]
    Parse(String),
}

impl PlatformError {
    /// Might a later retry succeed? Configuration and credential problems
    /// require a human fix; missing subscribers never reappear by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. }
                | PlatformError::Network(_)
                | PlatformError::Api(_, _)
                | PlatformError::NonJsonResponse(_)
        )
    }
}

/// Standard `{status, data}` response envelope. `data` stays a plain
/// `Option` so a missing field is `None` without a `Default` bound on `T`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
}

/// The platform can answer HTTP 200 with an error status in the envelope;
/// mutations must not treat that as success.
fn require_success(envelope: &Envelope<serde_json::Value>) -> Result<(), PlatformError> {
    if envelope.status == "success" {
        Ok(())
    } else {
        Err(PlatformError::Api(
            200,
            format!("platform reported status {:?}", envelope.status),
        ))
    }
}

/// Exponential backoff for transient failures: 2^attempt seconds.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

/// Resolve a tag name to its platform id, case-insensitive and trimmed.
fn find_tag_id(tags: &[Tag], name: &str) -> Option<i64> {
    let wanted = normalize_tag(name);
    tags.iter()
        .find(|t| normalize_tag(&t.name) == wanted)
        .and_then(|t| t.id)
}

/// External platform API client
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    rate_limiter: Arc<RateLimiter>,
    max_attempts: u32,
}

impl PlatformClient {
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        rate_limiter: Arc<RateLimiter>,
        max_attempts: u32,
    ) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            rate_limiter,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Single request-execution primitive used by every endpoint.
    async fn execute<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T, PlatformError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut attempt: u32 = 0;

        loop {
            self.rate_limiter.acquire().await;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.api_token);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let failure = match request.send().await {
                Err(e) => PlatformError::Network(e.to_string()),
                Ok(response) => {
                    let status = response.status().as_u16();

                    if status == 404 {
                        return Err(PlatformError::NotFound);
                    }
                    if status == 401 || status == 403 {
                        error!(path, status, "Platform rejected credentials");
                        return Err(PlatformError::AuthFailed(status));
                    }
                    if status == 429 {
                        let retry_after = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or(DEFAULT_RETRY_AFTER);
                        warn!(path, ?retry_after, "Platform rate limit hit, backing off");
                        tokio::time::sleep(retry_after).await;
                        // Retry-after pauses do not consume the attempt budget
                        continue;
                    }
                    if (200..300).contains(&status) {
                        let is_json = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(|v| v.contains("json"))
                            .unwrap_or(false);
                        if !is_json {
                            // HTML error pages must not reach the JSON parser
                            return Err(PlatformError::NonJsonResponse(status));
                        }
                        return response
                            .json::<T>()
                            .await
                            .map_err(|e| PlatformError::Parse(e.to_string()));
                    }

                    let text = response.text().await.unwrap_or_default();
                    PlatformError::Api(status, text)
                }
            };

            attempt += 1;
            if attempt >= self.max_attempts {
                error!(path, attempt, error = %failure, "Platform request failed, retries exhausted");
                return Err(failure);
            }

            let delay = backoff_delay(attempt);
            warn!(path, attempt, ?delay, error = %failure, "Platform request failed, will retry");
            tokio::time::sleep(delay).await;
        }
    }

    /// POST a mutation and require the envelope to report success
    async fn mutate(&self, path: &str, body: &serde_json::Value) -> Result<(), PlatformError> {
        let envelope: Envelope<serde_json::Value> = self
            .execute(reqwest::Method::POST, path, &[], Some(body))
            .await?;
        require_success(&envelope)
    }

    async fn lookup(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<Subscriber>, PlatformError> {
        match self
            .execute::<Envelope<Subscriber>>(reqwest::Method::GET, path, query, None)
            .await
        {
            Ok(envelope) if envelope.status == "success" => Ok(envelope.data),
            Ok(_) => Ok(None),
            Err(PlatformError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch a subscriber by platform id. `Ok(None)` when unknown.
    pub async fn get_info(&self, subscriber_id: &str) -> Result<Option<Subscriber>, PlatformError> {
        self.lookup("subscriber/getInfo", &[("subscriber_id", subscriber_id)])
            .await
    }

    /// Find a subscriber, trying identifiers in priority order: platform id,
    /// then phone, then email. First hit wins; `Ok(None)` when nothing
    /// matches. A miss is a normal outcome, never an error.
    pub async fn find_subscriber(
        &self,
        ids: &LookupIdentifiers,
    ) -> Result<Option<Subscriber>, PlatformError> {
        if let Some(id) = &ids.subscriber_id {
            if let Some(subscriber) = self.get_info(id).await? {
                return Ok(Some(subscriber));
            }
            debug!(subscriber_id = %id, "Subscriber id unknown to platform, trying other identifiers");
        }

        if let Some(phone) = &ids.phone {
            let found = self
                .lookup("subscriber/findBySystemField", &[("phone", phone)])
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        if let Some(email) = &ids.email {
            let found = self
                .lookup("subscriber/findBySystemField", &[("email", email)])
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        Ok(None)
    }

    /// List every tag registered on the platform
    pub async fn get_tags(&self) -> Result<Vec<Tag>, PlatformError> {
        let envelope: Envelope<Vec<Tag>> = self
            .execute(reqwest::Method::GET, "page/getTags", &[], None)
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }

    async fn resolve_tag_id(&self, tag_name: &str) -> Result<i64, PlatformError> {
        let tags = self.get_tags().await?;
        find_tag_id(&tags, tag_name)
            .ok_or_else(|| PlatformError::TagNotRegistered(tag_name.to_string()))
    }

    /// Add a tag to a subscriber. The platform requires tag ids, so the name
    /// is resolved first; an unregistered name is a configuration error.
    pub async fn add_tag(&self, subscriber_id: &str, tag_name: &str) -> Result<(), PlatformError> {
        let tag_id = self.resolve_tag_id(tag_name).await?;
        let body = json!({"subscriber_id": subscriber_id, "tag_id": tag_id});
        self.mutate("subscriber/addTag", &body).await?;
        info!(subscriber_id, tag = tag_name, "Tag added");
        Ok(())
    }

    /// Remove a tag from a subscriber
    pub async fn remove_tag(
        &self,
        subscriber_id: &str,
        tag_name: &str,
    ) -> Result<(), PlatformError> {
        let tag_id = self.resolve_tag_id(tag_name).await?;
        let body = json!({"subscriber_id": subscriber_id, "tag_id": tag_id});
        self.mutate("subscriber/removeTag", &body).await?;
        info!(subscriber_id, tag = tag_name, "Tag removed");
        Ok(())
    }

    /// Set a custom field on a subscriber by field name
    pub async fn set_custom_field(
        &self,
        subscriber_id: &str,
        field_name: &str,
        value: &str,
    ) -> Result<(), PlatformError> {
        let body = json!({
            "subscriber_id": subscriber_id,
            "field_name": field_name,
            "field_value": value,
        });
        self.mutate("subscriber/setCustomFieldByName", &body).await
    }

    /// Send text messages to a subscriber, optionally under a message tag
    pub async fn send_message(
        &self,
        subscriber_id: &str,
        messages: &[String],
        message_tag: Option<&str>,
    ) -> Result<(), PlatformError> {
        let content: Vec<serde_json::Value> = messages
            .iter()
            .map(|text| json!({"type": "text", "text": text}))
            .collect();
        let mut body = json!({
            "subscriber_id": subscriber_id,
            "data": {"version": "v2", "content": {"messages": content}},
        });
        if let Some(tag) = message_tag {
            body["message_tag"] = json!(tag);
        }
        self.mutate("sending/sendContent", &body).await?;
        info!(subscriber_id, count = messages.len(), "Messages sent");
        Ok(())
    }
}
