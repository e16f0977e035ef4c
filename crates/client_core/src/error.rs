use reqwest::StatusCode;
use shared::error::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiClientError {
    #[error("invalid api base url {url}: {reason}")]
    InvalidBase { url: String, reason: String },
    #[error("request to {url} failed with status {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid response from {url}: {source}")]
    Invalid {
        url: String,
        #[source]
        source: ValidationError,
    },
}

impl ApiClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::Status { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("event channel is not connected")]
    NotConnected,
    #[error("invalid event channel url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("credential cannot be sent as an authorization header")]
    InvalidCredential,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid client configuration: {0}")]
    Config(#[source] ApiClientError),
    #[error("failed to resolve current user: {0}")]
    Identity(#[source] ApiClientError),
    #[error("event channel failure: {0}")]
    Channel(#[from] ChannelError),
}
