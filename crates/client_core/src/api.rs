use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChatMessage, Conversation, ConversationId, MessageId, UserId},
    error::ValidationError,
    protocol::{CurrentUserResponse, MatchPayload, MessagePayload, ReadReceiptRequest},
};
use tracing::{debug, warn};
use url::Url;

use crate::error::ApiClientError;

/// Upper bound for a single REST round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// REST surface of the chat backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_current_user(&self) -> Result<UserId, ApiClientError>;
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ApiClientError>;
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, ApiClientError>;
    async fn submit_read_receipt(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), ApiClientError>;
}

pub struct HttpChatApi {
    http: Client,
    base: Url,
    credential: String,
}

impl HttpChatApi {
    pub fn new(api_base_url: &str, credential: impl Into<String>) -> Result<Self, ApiClientError> {
        let base = Url::parse(api_base_url).map_err(|err| ApiClientError::InvalidBase {
            url: api_base_url.to_string(),
            reason: err.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(ApiClientError::InvalidBase {
                url: api_base_url.to_string(),
                reason: "url cannot carry a path".into(),
            });
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ApiClientError::Transport {
                url: api_base_url.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base,
            credential: credential.into(),
        })
    }

    /// Appends percent-encoded path segments to the API base.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiClientError> {
        let response = self
            .http
            .get(url.clone())
            .bearer_auth(&self.credential)
            .send()
            .await
            .map_err(|source| ApiClientError::Transport {
                url: url.to_string(),
                source,
            })?;
        let response = check_status(&url, response).await?;
        response
            .json::<T>()
            .await
            .map_err(|source| ApiClientError::Transport {
                url: url.to_string(),
                source,
            })
    }
}

async fn check_status(url: &Url, response: Response) -> Result<Response, ApiClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiClientError::Status {
        url: url.to_string(),
        status,
        body,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_current_user(&self) -> Result<UserId, ApiClientError> {
        let url = self.endpoint(&["users", "me"]);
        let body: CurrentUserResponse = self.get_json(url.clone()).await?;
        if body.id.as_str().trim().is_empty() {
            return Err(ApiClientError::Invalid {
                url: url.to_string(),
                source: ValidationError::MissingIdentity,
            });
        }
        Ok(body.id)
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ApiClientError> {
        let url = self.endpoint(&["matches"]);
        let matches: Vec<MatchPayload> = self.get_json(url).await?;
        let conversations = matches
            .into_iter()
            .filter(|payload| {
                let keep = !payload.id.as_str().is_empty();
                if !keep {
                    warn!(error = %ValidationError::MissingMatchId, "dropping match without id");
                }
                keep
            })
            .map(Conversation::from)
            .collect::<Vec<_>>();
        debug!(count = conversations.len(), "fetched conversations");
        Ok(conversations)
    }

    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, ApiClientError> {
        let url = self.endpoint(&["matches", conversation_id.as_str(), "messages"]);
        let payloads: Vec<MessagePayload> = self.get_json(url).await?;
        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match payload.into_chat_message(Some(conversation_id)) {
                Ok(message) => messages.push(message),
                Err(err) => warn!(%conversation_id, error = %err, "dropping malformed history entry"),
            }
        }
        Ok(messages)
    }

    async fn submit_read_receipt(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), ApiClientError> {
        let url = self.endpoint(&["matches", conversation_id.as_str(), "read"]);
        let response = self
            .http
            .post(url.clone())
            .bearer_auth(&self.credential)
            .json(&ReadReceiptRequest {
                message_ids: message_ids.to_vec(),
            })
            .send()
            .await
            .map_err(|source| ApiClientError::Transport {
                url: url.to_string(),
                source,
            })?;
        check_status(&url, response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
