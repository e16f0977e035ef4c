use thiserror::Error;

/// Reasons an inbound payload is refused at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message is missing its conversation id")]
    MissingConversation,
    #[error("message is missing its sender")]
    MissingSender,
    #[error("message text is empty")]
    EmptyText,
    #[error("message carries neither a server id nor a client temp id")]
    MissingIdentity,
    #[error("match is missing its id")]
    MissingMatchId,
}
