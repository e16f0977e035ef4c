use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ChatMessage, ClientTempId, Conversation, ConversationId, LastPreview, MessageId,
        Participant, PetId, PetSummary, UserId,
    },
    error::ValidationError,
};

/// Frames written by the client on the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "join")]
    JoinRoom(JoinRoomPayload),
    #[serde(rename = "message")]
    SendMessage(OutgoingMessage),
    #[serde(rename = "message:read")]
    ReadReceipt(ReadReceiptCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub match_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub match_id: ConversationId,
    pub text: String,
    pub client_temp_id: ClientTempId,
    pub from: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptCommand {
    pub match_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

/// Frames pushed by the server on the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(MessagePayload),
    #[serde(rename = "match:updated")]
    MatchUpdated(ConversationUpdatedPayload),
    #[serde(rename = "message:read")]
    MessageRead(ReadReceiptPayload),
    #[serde(rename = "message:ack")]
    MessageAck(SendAckPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

/// Body of an `error` frame. Anything besides the message is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// A message as the backend serializes it. Every field the backend may omit
/// is optional here; [`MessagePayload::into_chat_message`] decides what is
/// acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<ClientTempId>,
    #[serde(
        rename = "match",
        alias = "matchId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<ConversationId>,
    #[serde(rename = "from", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seen_by: Vec<UserId>,
}

impl MessagePayload {
    /// Validates and normalizes the payload. `fallback_conversation` fills a
    /// missing conversation id for history responses, where the owning match
    /// is implied by the request path.
    pub fn into_chat_message(
        self,
        fallback_conversation: Option<&ConversationId>,
    ) -> Result<ChatMessage, ValidationError> {
        let conversation_id = self
            .conversation_id
            .or_else(|| fallback_conversation.cloned())
            .ok_or(ValidationError::MissingConversation)?;
        let sender_id = self.sender_id.ok_or(ValidationError::MissingSender)?;
        if self.text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        if self.id.is_none() && self.client_temp_id.is_none() {
            return Err(ValidationError::MissingIdentity);
        }

        let mut seen_by: BTreeSet<UserId> = self.seen_by.into_iter().collect();
        seen_by.insert(sender_id.clone());

        Ok(ChatMessage {
            id: self.id,
            client_temp_id: self.client_temp_id,
            conversation_id,
            sender_id,
            text: self.text,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            seen_by,
        })
    }
}

impl TryFrom<MessagePayload> for ChatMessage {
    type Error = ValidationError;

    fn try_from(value: MessagePayload) -> Result<Self, Self::Error> {
        value.into_chat_message(None)
    }
}

impl From<&ChatMessage> for MessagePayload {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id.clone(),
            client_temp_id: message.client_temp_id.clone(),
            conversation_id: Some(message.conversation_id.clone()),
            sender_id: Some(message.sender_id.clone()),
            text: message.text.clone(),
            created_at: Some(message.created_at),
            seen_by: message.seen_by.iter().cloned().collect(),
        }
    }
}

/// Preview-only update for a match, sent to members not viewing the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdatedPayload {
    pub match_id: ConversationId,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<UserId>,
}

impl ConversationUpdatedPayload {
    pub fn preview(&self) -> LastPreview {
        LastPreview {
            text: self.text.clone(),
            created_at: self.created_at,
            sender_id: self.from.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub match_id: ConversationId,
    pub reader_id: UserId,
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAckPayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<ClientTempId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUserResponse {
    #[serde(rename = "_id")]
    pub id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptRequest {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetPayload {
    #[serde(rename = "_id")]
    pub id: PetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub pets: Vec<PetPayload>,
    #[serde(default)]
    pub owned_pets: Vec<PetPayload>,
}

impl From<UserPayload> for Participant {
    fn from(user: UserPayload) -> Self {
        let pets = if user.owned_pets.is_empty() {
            user.pets
        } else {
            user.owned_pets
        };
        Participant {
            user_id: user.id,
            display_name: user.name,
            pets: pets
                .into_iter()
                .map(|pet| PetSummary {
                    pet_id: pet.id,
                    name: pet.name,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPayload {
    #[serde(rename = "_id")]
    pub id: ConversationId,
    #[serde(default)]
    pub users: Vec<UserPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

impl From<MatchPayload> for Conversation {
    fn from(payload: MatchPayload) -> Self {
        let last_preview = payload
            .last_message
            .filter(|last| last.text.is_some() || last.created_at.is_some())
            .map(|last| LastPreview {
                text: last.text.unwrap_or_default(),
                created_at: last.created_at,
                sender_id: last.from,
            });
        Conversation {
            id: payload.id,
            participants: payload.users.into_iter().map(Participant::from).collect(),
            last_preview,
            unread_count: payload.unread_count.unwrap_or(0),
        }
    }
}
