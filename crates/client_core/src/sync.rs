//! Orchestrates the stores, the event channel and the REST API for the chat
//! screen.
//!
//! All state sits behind one async mutex. Every mutation is a short
//! synchronous critical section; REST calls and channel sends always happen
//! with the lock released, and their results are re-validated against the
//! current state before they are applied.

use std::{
    mem,
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
};

use chrono::Utc;
use shared::{
    domain::{ChatMessage, ClientTempId, Conversation, ConversationId, LastPreview, UserId},
    protocol::{ConversationUpdatedPayload, MessagePayload, OutgoingMessage, ReadReceiptPayload},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    channel::{ChannelEvent, EventChannel, SendOutcome},
    config::ClientSettings,
    directory::ConversationDirectory,
    error::SyncError,
    read_state::{ReadReceiptBatch, ReadStateReconciler},
    timeline::{MergeOutcome, MessageTimeline},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    NoConversationSelected,
    LoadingHistory(ConversationId),
    Active(ConversationId),
}

impl SyncPhase {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::NoConversationSelected => None,
            Self::LoadingHistory(id) | Self::Active(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Changed,
    SendFailed { text: String, error: String },
}

/// Draft text plus the in-flight send flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composer {
    pub draft: String,
    pub sending: bool,
}

/// Read-only view handed to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub phase: SyncPhase,
    pub local_user: Option<UserId>,
    pub conversations: Vec<Conversation>,
    pub messages: Vec<ChatMessage>,
    pub composer: Composer,
    pub connected: bool,
    pub visible: bool,
    pub last_error: Option<String>,
    pub total_unread: u32,
    /// Whether a peer has seen the newest message the local user sent.
    pub peer_read_last_own: bool,
}

struct SyncState {
    reconciler: Option<ReadStateReconciler>,
    directory: ConversationDirectory,
    timeline: MessageTimeline,
    composer: Composer,
    phase: SyncPhase,
    connected: bool,
    visible: bool,
    last_error: Option<String>,
    history_generation: u64,
    /// The last history load for the open conversation failed.
    history_failed: bool,
    /// Inbound messages for the conversation whose history is in flight.
    buffered_inbound: Vec<ChatMessage>,
}

impl SyncState {
    fn local_user(&self) -> Option<&UserId> {
        self.reconciler.as_ref().map(ReadStateReconciler::local_user)
    }

    fn mark_read_locally(&mut self, conversation_id: &ConversationId) -> Option<ReadReceiptBatch> {
        let batch = self
            .reconciler
            .as_ref()?
            .mark_read_locally(conversation_id, &mut self.timeline);
        self.directory.reset_unread(conversation_id);
        batch
    }

    /// Moves `conversation_id` into `LoadingHistory` and stamps a new
    /// request generation.
    fn begin_history_load(&mut self, conversation_id: ConversationId) -> u64 {
        self.phase = SyncPhase::LoadingHistory(conversation_id);
        self.history_generation += 1;
        self.history_generation
    }

    fn is_current_history(&self, conversation_id: &ConversationId, generation: u64) -> bool {
        self.phase == SyncPhase::LoadingHistory(conversation_id.clone())
            && self.history_generation == generation
    }

    fn viewing(&self, conversation_id: &ConversationId) -> bool {
        self.visible && self.phase.conversation_id() == Some(conversation_id)
    }

    /// Loading, or loaded successfully. A failed load can be retried by
    /// selecting the conversation again.
    fn holds_conversation(&self, conversation_id: &ConversationId) -> bool {
        match &self.phase {
            SyncPhase::LoadingHistory(id) => id == conversation_id,
            SyncPhase::Active(id) => id == conversation_id && !self.history_failed,
            SyncPhase::NoConversationSelected => false,
        }
    }
}

/// Aborts the channel listener when dropped.
struct EventSubscription(JoinHandle<()>);

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct SyncController {
    api: Arc<dyn ChatApi>,
    channel: Arc<dyn EventChannel>,
    live_mark_read: bool,
    state: Mutex<SyncState>,
    updates: broadcast::Sender<SyncEvent>,
    subscription: StdMutex<Option<EventSubscription>>,
}

impl SyncController {
    pub fn new(
        api: Arc<dyn ChatApi>,
        channel: Arc<dyn EventChannel>,
        settings: &ClientSettings,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(256);
        Arc::new(Self {
            api,
            channel,
            live_mark_read: settings.live_mark_read,
            state: Mutex::new(SyncState {
                reconciler: None,
                directory: ConversationDirectory::new(),
                timeline: MessageTimeline::new(),
                composer: Composer::default(),
                phase: SyncPhase::NoConversationSelected,
                connected: false,
                visible: true,
                last_error: None,
                history_generation: 0,
                history_failed: false,
                buffered_inbound: Vec::new(),
            }),
            updates,
            subscription: StdMutex::new(None),
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SyncEvent> {
        self.updates.subscribe()
    }

    fn notify_changed(&self) {
        let _ = self.updates.send(SyncEvent::Changed);
    }

    async fn deliver(&self, batch: Option<ReadReceiptBatch>) {
        if let Some(batch) = batch {
            ReadStateReconciler::deliver(&batch, self.channel.as_ref(), self.api.as_ref()).await;
        }
    }

    /// Delivers `batch` on its own task so the event listener keeps draining
    /// the channel while the receipt is in flight.
    fn spawn_delivery(&self, batch: Option<ReadReceiptBatch>) {
        let Some(batch) = batch else {
            return;
        };
        let api = Arc::clone(&self.api);
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            ReadStateReconciler::deliver(&batch, channel.as_ref(), api.as_ref()).await;
        });
    }

    /// Resolves the local user, connects the event channel, loads the
    /// conversation list and opens the most recent conversation.
    pub async fn start(self: &Arc<Self>, credential: &str) -> Result<(), SyncError> {
        let local_user = self
            .api
            .fetch_current_user()
            .await
            .map_err(SyncError::Identity)?;
        info!(user_id = %local_user, "sync: identity resolved");
        {
            let mut state = self.state.lock().await;
            state.reconciler = Some(ReadStateReconciler::new(local_user));
        }
        self.notify_changed();

        self.install_subscription();
        self.channel.connect(credential).await?;

        self.refresh_directory().await;
        let first = {
            let state = self.state.lock().await;
            match state.phase {
                SyncPhase::NoConversationSelected => state.directory.first_id().cloned(),
                _ => None,
            }
        };
        if let Some(conversation_id) = first {
            self.select_conversation(conversation_id).await;
        }
        Ok(())
    }

    fn install_subscription(self: &Arc<Self>) {
        let mut events = self.channel.subscribe_events();
        let controller: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let received = events.recv().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                match received {
                    Ok(event) => controller.handle_channel_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: channel events lost, resyncing");
                        tokio::spawn(async move { controller.resync().await });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let previous = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(EventSubscription(handle));
        drop(previous);
    }

    /// Opens `conversation_id`. Selecting the conversation that is already
    /// open or loading does nothing.
    pub async fn select_conversation(&self, conversation_id: ConversationId) {
        let generation = {
            let mut state = self.state.lock().await;
            if state.holds_conversation(&conversation_id) {
                debug!(%conversation_id, "sync: conversation already selected");
                return;
            }
            state.timeline.reset_for(conversation_id.clone());
            state.buffered_inbound.clear();
            state.begin_history_load(conversation_id.clone())
        };
        info!(%conversation_id, "sync: conversation selected");
        self.notify_changed();

        if let Err(err) = self.channel.join_room(&conversation_id).await {
            debug!(%conversation_id, error = %err, "sync: join deferred until connected");
        }
        self.load_history(conversation_id, generation).await;
    }

    async fn load_history(&self, conversation_id: ConversationId, generation: u64) {
        let result = self.api.fetch_history(&conversation_id).await;

        let batch = {
            let mut state = self.state.lock().await;
            if !state.is_current_history(&conversation_id, generation) {
                debug!(%conversation_id, generation, "sync: stale history response discarded");
                return;
            }
            let buffered = mem::take(&mut state.buffered_inbound);
            let batch = match result {
                Ok(messages) => {
                    state.timeline.load_snapshot(conversation_id.clone(), messages);
                    for message in buffered {
                        state.timeline.merge_inbound(message);
                    }
                    state.history_failed = false;
                    state.last_error = None;
                    state.mark_read_locally(&conversation_id)
                }
                Err(err) => {
                    warn!(%conversation_id, error = %err, "sync: history fetch failed");
                    for message in buffered {
                        state.timeline.merge_inbound(message);
                    }
                    state.history_failed = true;
                    state.last_error = Some(err.to_string());
                    None
                }
            };
            state.phase = SyncPhase::Active(conversation_id.clone());
            batch
        };
        debug!(%conversation_id, "sync: conversation active");
        self.notify_changed();
        self.deliver(batch).await;
    }

    async fn refresh_directory(&self) {
        let result = self.api.fetch_conversations().await;
        {
            let mut state = self.state.lock().await;
            match result {
                Ok(conversations) => state.directory.load_snapshot(conversations),
                Err(err) => {
                    warn!(error = %err, "sync: conversation list fetch failed");
                    state.last_error = Some(err.to_string());
                }
            }
        }
        self.notify_changed();
    }

    /// Re-joins the open conversation and reloads the directory and its
    /// history from the server.
    pub async fn resync(&self) {
        let target = self.state.lock().await.phase.conversation_id().cloned();
        info!(conversation_id = ?target.as_ref().map(ConversationId::as_str), "sync: resync");
        if let Some(conversation_id) = &target {
            if let Err(err) = self.channel.join_room(conversation_id).await {
                debug!(%conversation_id, error = %err, "sync: join deferred until connected");
            }
        }

        self.refresh_directory().await;

        let Some(conversation_id) = target else {
            return;
        };
        let generation = {
            let mut state = self.state.lock().await;
            if state.phase.conversation_id() != Some(&conversation_id) {
                return;
            }
            state.begin_history_load(conversation_id.clone())
        };
        self.notify_changed();
        self.load_history(conversation_id, generation).await;
    }

    /// Tracks whether the chat screen is in front of the user. Regaining
    /// visibility triggers a full resync.
    pub async fn set_visibility(&self, visible: bool) {
        let regained = {
            let mut state = self.state.lock().await;
            let regained = visible && !state.visible;
            state.visible = visible;
            regained
        };
        self.notify_changed();
        if regained {
            self.resync().await;
        }
    }

    pub async fn set_draft(&self, text: impl Into<String>) {
        self.state.lock().await.composer.draft = text.into();
        self.notify_changed();
    }

    /// Sends the current draft optimistically. Ignored when the draft is
    /// blank, nothing is selected, the local user is unknown or another send
    /// is still waiting for its acknowledgment.
    pub async fn send_message(self: &Arc<Self>) {
        let outgoing = {
            let mut state = self.state.lock().await;
            let text = state.composer.draft.trim().to_string();
            if text.is_empty() || state.composer.sending {
                return;
            }
            let (Some(conversation_id), Some(local_user)) = (
                state.phase.conversation_id().cloned(),
                state.local_user().cloned(),
            ) else {
                return;
            };

            let client_temp_id = ClientTempId::generate();
            let message = ChatMessage::optimistic(
                client_temp_id.clone(),
                conversation_id.clone(),
                local_user.clone(),
                text.clone(),
                Utc::now(),
            );
            state
                .directory
                .bump_on_inbound(&conversation_id, LastPreview::of(&message), true, true);
            state.timeline.append_optimistic(message);
            state.composer.draft.clear();
            state.composer.sending = true;

            OutgoingMessage {
                match_id: conversation_id,
                text,
                client_temp_id,
                from: local_user,
            }
        };
        debug!(
            conversation_id = %outgoing.match_id,
            client_temp_id = %outgoing.client_temp_id,
            "sync: sending message"
        );
        self.notify_changed();

        let ack = self.channel.send_message(outgoing.clone()).await;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = ack.outcome().await;
            controller
                .apply_send_outcome(
                    &outgoing.match_id,
                    &outgoing.client_temp_id,
                    &outgoing.text,
                    outcome,
                )
                .await;
        });
    }

    pub async fn apply_send_outcome(
        &self,
        conversation_id: &ConversationId,
        client_temp_id: &ClientTempId,
        text: &str,
        outcome: SendOutcome,
    ) {
        let failure = {
            let mut state = self.state.lock().await;
            state.composer.sending = false;
            let owns_timeline = state.timeline.conversation_id() == Some(conversation_id);
            match outcome {
                SendOutcome::Confirmed { server_id, .. } => {
                    if owns_timeline {
                        state.timeline.confirm_sent(client_temp_id, server_id);
                    }
                    None
                }
                SendOutcome::Failed { error } => {
                    warn!(%conversation_id, %client_temp_id, %error, "sync: send rejected");
                    if owns_timeline {
                        state.timeline.rollback(client_temp_id);
                    }
                    if owns_timeline && state.composer.draft.is_empty() {
                        state.composer.draft = text.to_string();
                    }
                    state.last_error = Some(error.clone());
                    Some(error)
                }
                SendOutcome::Indeterminate => {
                    warn!(%conversation_id, %client_temp_id, "sync: send outcome unknown, left pending");
                    None
                }
            }
        };
        self.notify_changed();
        if let Some(error) = failure {
            let _ = self.updates.send(SyncEvent::SendFailed {
                text: text.to_string(),
                error,
            });
        }
    }

    /// Marks everything in the open conversation as read.
    pub async fn mark_active_read(&self) {
        let batch = {
            let mut state = self.state.lock().await;
            let SyncPhase::Active(conversation_id) = state.phase.clone() else {
                return;
            };
            state.mark_read_locally(&conversation_id)
        };
        if batch.is_some() {
            self.notify_changed();
        }
        self.deliver(batch).await;
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => self.on_connected().await,
            ChannelEvent::Disconnected { reason } => {
                info!(%reason, "sync: channel disconnected");
                self.state.lock().await.connected = false;
                self.notify_changed();
            }
            ChannelEvent::NewMessage(payload) => self.on_new_message(payload).await,
            ChannelEvent::ConversationUpdated(payload) => self.on_conversation_updated(payload).await,
            ChannelEvent::ReadReceipt(payload) => self.on_read_receipt(payload).await,
            ChannelEvent::Error(message) => {
                warn!(%message, "sync: channel error");
                self.state.lock().await.last_error = Some(message);
                self.notify_changed();
            }
        }
    }

    /// Re-joins the current room; history is not reloaded on reconnect.
    async fn on_connected(&self) {
        let target = {
            let mut state = self.state.lock().await;
            state.connected = true;
            state.phase.conversation_id().cloned()
        };
        self.notify_changed();
        if let Some(conversation_id) = target {
            if let Err(err) = self.channel.join_room(&conversation_id).await {
                warn!(%conversation_id, error = %err, "sync: rejoin failed");
            }
        }
    }

    async fn on_new_message(&self, payload: MessagePayload) {
        let message = match payload.into_chat_message(None) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "sync: dropping malformed message");
                return;
            }
        };

        let batch = {
            let mut state = self.state.lock().await;
            let Some(local_user) = state.local_user().cloned() else {
                return;
            };
            let conversation_id = message.conversation_id.clone();
            let is_own = message.is_from(&local_user);
            let viewing = state.viewing(&conversation_id);
            state.directory.bump_on_inbound(
                &conversation_id,
                LastPreview::of(&message),
                viewing,
                is_own,
            );

            match state.phase.clone() {
                SyncPhase::LoadingHistory(id) if id == conversation_id => {
                    state.buffered_inbound.push(message);
                    None
                }
                SyncPhase::Active(id) if id == conversation_id => {
                    let outcome = state.timeline.merge_inbound(message);
                    if outcome != MergeOutcome::Duplicate && self.live_mark_read && viewing && !is_own {
                        state.mark_read_locally(&conversation_id)
                    } else {
                        None
                    }
                }
                _ => {
                    debug!(%conversation_id, "sync: message for background conversation");
                    None
                }
            }
        };
        self.notify_changed();
        self.spawn_delivery(batch);
    }

    async fn on_conversation_updated(&self, payload: ConversationUpdatedPayload) {
        {
            let mut state = self.state.lock().await;
            let is_own = payload.from.is_some() && payload.from.as_ref() == state.local_user();
            let viewing = state.viewing(&payload.match_id);
            state
                .directory
                .bump_on_inbound(&payload.match_id, payload.preview(), viewing, is_own);
        }
        self.notify_changed();
    }

    async fn on_read_receipt(&self, payload: ReadReceiptPayload) {
        {
            let mut state = self.state.lock().await;
            if state.timeline.conversation_id() != Some(&payload.match_id) {
                return;
            }
            let changed = state
                .timeline
                .apply_read_receipt(&payload.message_ids, &payload.reader_id);
            if changed == 0 {
                return;
            }
            if state.local_user() == Some(&payload.reader_id) {
                let remaining = state.timeline.unread_count_for(&payload.reader_id);
                let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
                state.directory.set_unread(&payload.match_id, remaining);
            }
        }
        self.notify_changed();
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let state = self.state.lock().await;
        let local_user = state.local_user().cloned();
        let peer_read_last_own = match (&local_user, state.phase.conversation_id()) {
            (Some(me), Some(conversation_id)) => state
                .directory
                .get(conversation_id)
                .is_some_and(|conversation| {
                    conversation
                        .peers_of(me)
                        .any(|peer| state.timeline.last_own_read_by(me, &peer.user_id))
                }),
            _ => false,
        };
        ChatSnapshot {
            phase: state.phase.clone(),
            local_user,
            conversations: state.directory.conversations().to_vec(),
            messages: state.timeline.messages().to_vec(),
            composer: state.composer.clone(),
            connected: state.connected,
            visible: state.visible,
            last_error: state.last_error.clone(),
            total_unread: state.directory.total_unread(),
            peer_read_last_own,
        }
    }

    /// Stops listening to the channel and disconnects it.
    pub async fn shutdown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(subscription);
        self.channel.disconnect().await;
        self.state.lock().await.connected = false;
        info!("sync: shut down");
        self.notify_changed();
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
