//! Hand-written fakes for the controller seams.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use shared::{
    domain::{
        ChatMessage, Conversation, ConversationId, LastPreview, MessageId, Participant, UserId,
    },
    protocol::OutgoingMessage,
};
use tokio::sync::{broadcast, oneshot};

use crate::{
    api::ChatApi,
    channel::{ChannelEvent, EventChannel, PendingAck, SendOutcome},
    error::{ApiClientError, ChannelError},
};

pub const ME: &str = "u-me";
pub const PEER: &str = "u-peer";

pub fn me() -> UserId {
    UserId::from(ME)
}

pub fn peer() -> UserId {
    UserId::from(PEER)
}

pub fn conversation(id: &str, at_secs: Option<i64>, unread_count: u32) -> Conversation {
    let mut conversation = Conversation::new(id, vec![Participant::new(ME), Participant::new(PEER)]);
    conversation.last_preview = at_secs.map(|secs| LastPreview {
        text: format!("latest in {id}"),
        created_at: Utc.timestamp_opt(secs, 0).single(),
        sender_id: Some(peer()),
    });
    conversation.unread_count = unread_count;
    conversation
}

pub fn message(conversation_id: &str, id: &str, sender: &UserId, text: &str) -> ChatMessage {
    let mut seen_by = std::collections::BTreeSet::new();
    seen_by.insert(sender.clone());
    ChatMessage {
        id: Some(MessageId::from(id)),
        client_temp_id: None,
        conversation_id: ConversationId::from(conversation_id),
        sender_id: sender.clone(),
        text: text.into(),
        created_at: Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_else(Utc::now),
        seen_by,
    }
}

/// Polls `check` until it holds, panicking after a few seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Default)]
pub struct FakeApi {
    pub conversations: StdMutex<Vec<Conversation>>,
    pub histories: StdMutex<HashMap<ConversationId, Vec<ChatMessage>>>,
    pub gates: StdMutex<HashMap<ConversationId, oneshot::Receiver<()>>>,
    pub failing_histories: StdMutex<HashSet<ConversationId>>,
    pub history_calls: StdMutex<Vec<ConversationId>>,
    pub conversation_calls: AtomicUsize,
    pub receipts: StdMutex<Vec<(ConversationId, Vec<MessageId>)>>,
    pub reject_identity: AtomicBool,
    /// Read receipts never complete while set.
    pub stall_receipts: AtomicBool,
}

impl FakeApi {
    pub fn with_conversations(conversations: Vec<Conversation>) -> Self {
        let api = Self::default();
        *api.conversations.lock().expect("conversations") = conversations;
        api
    }

    pub fn set_history(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        self.histories
            .lock()
            .expect("histories")
            .insert(ConversationId::from(conversation_id), messages);
    }

    /// Holds the next history response for `conversation_id` until the
    /// returned sender fires.
    pub fn gate_history(&self, conversation_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates
            .lock()
            .expect("gates")
            .insert(ConversationId::from(conversation_id), rx);
        tx
    }

    pub fn history_calls_for(&self, conversation_id: &str) -> usize {
        self.history_calls
            .lock()
            .expect("history calls")
            .iter()
            .filter(|id| id.as_str() == conversation_id)
            .count()
    }

    pub fn receipt_count(&self) -> usize {
        self.receipts.lock().expect("receipts").len()
    }
}

fn server_error(url: &str) -> ApiClientError {
    ApiClientError::Status {
        url: url.to_string(),
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: "boom".into(),
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_current_user(&self) -> Result<UserId, ApiClientError> {
        if self.reject_identity.load(Ordering::SeqCst) {
            return Err(ApiClientError::Status {
                url: "/users/me".into(),
                status: StatusCode::UNAUTHORIZED,
                body: String::new(),
            });
        }
        Ok(me())
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ApiClientError> {
        self.conversation_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.conversations.lock().expect("conversations").clone())
    }

    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, ApiClientError> {
        self.history_calls
            .lock()
            .expect("history calls")
            .push(conversation_id.clone());
        let gate = self.gates.lock().expect("gates").remove(conversation_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self
            .failing_histories
            .lock()
            .expect("failing")
            .contains(conversation_id)
        {
            return Err(server_error("/matches/messages"));
        }
        Ok(self
            .histories
            .lock()
            .expect("histories")
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn submit_read_receipt(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), ApiClientError> {
        self.receipts
            .lock()
            .expect("receipts")
            .push((conversation_id.clone(), message_ids.to_vec()));
        if self.stall_receipts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

pub struct FakeChannel {
    events: broadcast::Sender<ChannelEvent>,
    pub joins: StdMutex<Vec<ConversationId>>,
    pub sent: StdMutex<Vec<OutgoingMessage>>,
    pub receipts: StdMutex<Vec<(ConversationId, Vec<MessageId>)>>,
    acks: StdMutex<VecDeque<oneshot::Sender<SendOutcome>>>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub offline: AtomicBool,
}

impl Default for FakeChannel {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            joins: StdMutex::new(Vec::new()),
            sent: StdMutex::new(Vec::new()),
            receipts: StdMutex::new(Vec::new()),
            acks: StdMutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }
}

impl FakeChannel {
    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    pub fn join_count(&self) -> usize {
        self.joins.lock().expect("joins").len()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent").len()
    }

    pub fn receipt_count(&self) -> usize {
        self.receipts.lock().expect("receipts").len()
    }

    /// Resolves the oldest unresolved send.
    pub fn resolve_next(&self, outcome: SendOutcome) {
        let tx = self
            .acks
            .lock()
            .expect("acks")
            .pop_front()
            .expect("a pending send");
        let _ = tx.send(outcome);
    }
}

#[async_trait]
impl EventChannel for FakeChannel {
    async fn connect(&self, _credential: &str) -> Result<(), ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn join_room(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.joins.lock().expect("joins").push(conversation_id.clone());
        Ok(())
    }

    async fn send_message(&self, message: OutgoingMessage) -> PendingAck {
        let (tx, ack) = PendingAck::channel(message.client_temp_id.clone());
        self.sent.lock().expect("sent").push(message);
        self.acks.lock().expect("acks").push_back(tx);
        ack
    }

    async fn send_read_receipt(
        &self,
        conversation_id: &ConversationId,
        message_ids: Vec<MessageId>,
    ) -> Result<(), ChannelError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.receipts
            .lock()
            .expect("receipts")
            .push((conversation_id.clone(), message_ids));
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
