use std::{
    collections::BTreeSet,
    fmt,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ClientTempId);
id_newtype!(PetId);

static LAST_TEMP_ID_MILLIS: AtomicI64 = AtomicI64::new(0);

impl ClientTempId {
    /// Allocates `tmp-<unix millis>`, bumped past the previous allocation so
    /// two sends in the same millisecond never share an id.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let mut previous = LAST_TEMP_ID_MILLIS.load(Ordering::Relaxed);
        loop {
            let next = now.max(previous + 1);
            match LAST_TEMP_ID_MILLIS.compare_exchange_weak(
                previous,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self(format!("tmp-{next}")),
                Err(actual) => previous = actual,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetSummary {
    pub pet_id: PetId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub pets: Vec<PetSummary>,
}

impl Participant {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            pets: Vec::new(),
        }
    }

    /// "Name (Pet, Pet)" as shown in the match list.
    pub fn label(&self) -> String {
        let name = self.display_name.as_deref().unwrap_or("Partner");
        let pets = self
            .pets
            .iter()
            .filter_map(|pet| pet.name.as_deref())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        if pets.is_empty() {
            name.to_string()
        } else {
            format!("{name} ({pets})")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPreview {
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub sender_id: Option<UserId>,
}

impl LastPreview {
    pub fn of(message: &ChatMessage) -> Self {
        Self {
            text: message.text.clone(),
            created_at: Some(message.created_at),
            sender_id: Some(message.sender_id.clone()),
        }
    }

    pub fn sort_key(&self) -> i64 {
        self.created_at.map_or(0, |at| at.timestamp_millis())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<Participant>,
    pub last_preview: Option<LastPreview>,
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: impl Into<ConversationId>, participants: Vec<Participant>) -> Self {
        Self {
            id: id.into(),
            participants,
            last_preview: None,
            unread_count: 0,
        }
    }

    /// Recency key for directory ordering; no preview sorts as the epoch.
    pub fn activity_key(&self) -> i64 {
        self.last_preview.as_ref().map_or(0, LastPreview::sort_key)
    }

    pub fn peer_of(&self, me: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id != me)
    }

    pub fn peers_of<'a>(&'a self, me: &'a UserId) -> impl Iterator<Item = &'a Participant> + 'a {
        self.participants.iter().filter(move |p| &p.user_id != me)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Option<MessageId>,
    pub client_temp_id: Option<ClientTempId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub seen_by: BTreeSet<UserId>,
}

impl ChatMessage {
    /// A locally-created entry awaiting server confirmation.
    pub fn optimistic(
        client_temp_id: ClientTempId,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut seen_by = BTreeSet::new();
        seen_by.insert(sender_id.clone());
        Self {
            id: None,
            client_temp_id: Some(client_temp_id),
            conversation_id,
            sender_id,
            text: text.into(),
            created_at,
            seen_by,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        &self.sender_id == user
    }

    pub fn seen_by_user(&self, user: &UserId) -> bool {
        self.seen_by.contains(user)
    }

    /// True when this entry is the one a send with `temp` produced, whether
    /// the temp id sits in `client_temp_id` or was stored as the id itself.
    pub fn matches_temp_id(&self, temp: &ClientTempId) -> bool {
        self.client_temp_id.as_ref() == Some(temp)
            || self.id.as_ref().is_some_and(|id| id.0 == temp.0)
    }
}
