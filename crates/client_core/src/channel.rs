//! Persistent event channel to the chat backend.
//!
//! One connection carries every conversation. Outgoing sends are correlated
//! with their acknowledgment by client temp id; an acknowledgment that never
//! arrives because the connection dropped resolves as
//! [`SendOutcome::Indeterminate`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ClientTempId, ConversationId, MessageId},
    protocol::{
        ClientCommand, ConversationUpdatedPayload, JoinRoomPayload, MessagePayload,
        OutgoingMessage, ReadReceiptCommand, ReadReceiptPayload, SendAckPayload, ServerEvent,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::ClientSettings, error::ChannelError};

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Fired on the first connection and on every reconnection.
    Connected,
    Disconnected { reason: String },
    NewMessage(MessagePayload),
    ConversationUpdated(ConversationUpdatedPayload),
    ReadReceipt(ReadReceiptPayload),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed {
        server_id: MessageId,
        client_temp_id: ClientTempId,
    },
    Failed {
        error: String,
    },
    /// The connection went away before the server answered.
    Indeterminate,
}

/// Single-use handle on the acknowledgment of one send.
#[derive(Debug)]
pub struct PendingAck {
    client_temp_id: ClientTempId,
    rx: oneshot::Receiver<SendOutcome>,
}

impl PendingAck {
    pub fn channel(client_temp_id: ClientTempId) -> (oneshot::Sender<SendOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { client_temp_id, rx })
    }

    pub fn resolved(client_temp_id: ClientTempId, outcome: SendOutcome) -> Self {
        let (tx, ack) = Self::channel(client_temp_id);
        let _ = tx.send(outcome);
        ack
    }

    pub fn client_temp_id(&self) -> &ClientTempId {
        &self.client_temp_id
    }

    pub async fn outcome(self) -> SendOutcome {
        self.rx.await.unwrap_or(SendOutcome::Indeterminate)
    }
}

#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Starts, or restarts, the connection supervisor. Network failures are
    /// retried in the background and never reported here.
    async fn connect(&self, credential: &str) -> Result<(), ChannelError>;
    async fn disconnect(&self);
    async fn join_room(&self, conversation_id: &ConversationId) -> Result<(), ChannelError>;
    async fn send_message(&self, message: OutgoingMessage) -> PendingAck;
    async fn send_read_receipt(
        &self,
        conversation_id: &ConversationId,
        message_ids: Vec<MessageId>,
    ) -> Result<(), ChannelError>;
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// WebSocket implementation of [`EventChannel`].
pub struct WsEventChannel {
    url: Url,
    backoff: Backoff,
    shared: Arc<ChannelShared>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

struct ChannelShared {
    events: broadcast::Sender<ChannelEvent>,
    connected: AtomicBool,
    state: Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending_acks: HashMap<ClientTempId, oneshot::Sender<SendOutcome>>,
}

impl WsEventChannel {
    pub fn new(url: Url, backoff: Backoff) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            url,
            backoff,
            shared: Arc::new(ChannelShared {
                events,
                connected: AtomicBool::new(false),
                state: Mutex::new(ConnectionState::default()),
            }),
            supervisor: StdMutex::new(None),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ChannelError> {
        Ok(Self::new(
            settings.resolved_ws_url()?,
            Backoff {
                initial: settings.reconnect_initial_delay,
                max: settings.reconnect_max_delay,
            },
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn send_command(&self, command: &ClientCommand) -> Result<(), ChannelError> {
        let frame = serde_json::to_string(command)?;
        let state = self.shared.state.lock().await;
        let outbound = state.outbound.as_ref().ok_or(ChannelError::NotConnected)?;
        outbound.send(frame).map_err(|_| ChannelError::NotConnected)
    }
}

impl Drop for WsEventChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.take_supervisor() {
            handle.abort();
        }
    }
}

fn handshake_request(url: &Url, credential: &str) -> Result<Request, ChannelError> {
    let mut request =
        url.as_str()
            .into_client_request()
            .map_err(|err| ChannelError::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
    let header = HeaderValue::from_str(&format!("Bearer {credential}"))
        .map_err(|_| ChannelError::InvalidCredential)?;
    request.headers_mut().insert(AUTHORIZATION, header);
    Ok(request)
}

impl ChannelShared {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Drops every outstanding acknowledgment; their receivers resolve as
    /// indeterminate.
    async fn reset_connection(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.outbound = None;
        let dropped = state.pending_acks.len();
        state.pending_acks.clear();
        if dropped > 0 {
            warn!(dropped, "event channel: pending sends left unacknowledged");
        }
        was_connected
    }

    async fn dispatch_frame(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(ServerEvent::MessageAck(ack)) => self.resolve_ack(ack).await,
            Ok(ServerEvent::MessageNew(payload)) => self.emit(ChannelEvent::NewMessage(payload)),
            Ok(ServerEvent::MatchUpdated(payload)) => {
                self.emit(ChannelEvent::ConversationUpdated(payload))
            }
            Ok(ServerEvent::MessageRead(payload)) => self.emit(ChannelEvent::ReadReceipt(payload)),
            Ok(ServerEvent::Error(err)) => self.emit(ChannelEvent::Error(err.message)),
            Err(err) => self.emit(ChannelEvent::Error(format!("invalid server event: {err}"))),
        }
    }

    async fn resolve_ack(&self, ack: SendAckPayload) {
        let Some(client_temp_id) = ack.client_temp_id else {
            warn!("event channel: acknowledgment without client temp id ignored");
            return;
        };
        let Some(tx) = self.state.lock().await.pending_acks.remove(&client_temp_id) else {
            debug!(%client_temp_id, "event channel: acknowledgment for unknown send ignored");
            return;
        };
        let outcome = match (ack.ok, ack.server_id) {
            (true, Some(server_id)) => SendOutcome::Confirmed {
                server_id,
                client_temp_id,
            },
            (true, None) => SendOutcome::Indeterminate,
            (false, _) => SendOutcome::Failed {
                error: ack.error.unwrap_or_else(|| "message rejected by server".into()),
            },
        };
        let _ = tx.send(outcome);
    }

    /// Runs one connection until it closes. `Err` means the handshake never
    /// completed; `Ok` carries the close reason.
    async fn run_session(&self, request: Request) -> Result<String, String> {
        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| err.to_string())?;
        let (mut writer, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        self.state.lock().await.outbound = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        info!("event channel: connected");
        self.emit(ChannelEvent::Connected);

        let reason = loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(err) = writer.send(Message::Text(frame)).await {
                            break err.to_string();
                        }
                    }
                    None => break "outbound queue closed".to_string(),
                },
                inbound = reader.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.dispatch_frame(&text).await,
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break err.to_string(),
                    None => break "connection closed".to_string(),
                },
            }
        };
        Ok(reason)
    }
}

async fn supervise(shared: Arc<ChannelShared>, url: Url, credential: String, backoff: Backoff) {
    let mut delay = backoff.initial;
    loop {
        let request = match handshake_request(&url, &credential) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "event channel: giving up");
                return;
            }
        };
        match shared.run_session(request).await {
            Ok(reason) => {
                shared.reset_connection().await;
                info!(%reason, "event channel: disconnected");
                shared.emit(ChannelEvent::Disconnected { reason });
                delay = backoff.initial;
            }
            Err(err) => {
                debug!(error = %err, delay_ms = delay.as_millis() as u64, "event channel: connect failed");
            }
        }
        sleep(delay).await;
        delay = backoff.next(delay);
    }
}

#[async_trait]
impl EventChannel for WsEventChannel {
    async fn connect(&self, credential: &str) -> Result<(), ChannelError> {
        handshake_request(&self.url, credential)?;
        if let Some(previous) = self.take_supervisor() {
            previous.abort();
            self.shared.reset_connection().await;
        }
        info!(url = %self.url, "event channel: starting");
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            self.url.clone(),
            credential.to_string(),
            self.backoff,
        ));
        *self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(handle) = self.take_supervisor() else {
            return;
        };
        handle.abort();
        if self.shared.reset_connection().await {
            self.shared.emit(ChannelEvent::Disconnected {
                reason: "client disconnect".into(),
            });
        }
        info!("event channel: stopped");
    }

    async fn join_room(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        self.send_command(&ClientCommand::JoinRoom(JoinRoomPayload {
            match_id: conversation_id.clone(),
        }))
        .await
    }

    async fn send_message(&self, message: OutgoingMessage) -> PendingAck {
        let client_temp_id = message.client_temp_id.clone();
        let frame = match serde_json::to_string(&ClientCommand::SendMessage(message)) {
            Ok(frame) => frame,
            Err(err) => {
                return PendingAck::resolved(
                    client_temp_id,
                    SendOutcome::Failed {
                        error: err.to_string(),
                    },
                )
            }
        };

        let (tx, ack) = PendingAck::channel(client_temp_id.clone());
        let mut state = self.shared.state.lock().await;
        let Some(outbound) = state.outbound.clone() else {
            debug!(%client_temp_id, "event channel: send while disconnected");
            return ack;
        };
        state.pending_acks.insert(client_temp_id.clone(), tx);
        if outbound.send(frame).is_err() {
            state.pending_acks.remove(&client_temp_id);
        }
        ack
    }

    async fn send_read_receipt(
        &self,
        conversation_id: &ConversationId,
        message_ids: Vec<MessageId>,
    ) -> Result<(), ChannelError> {
        self.send_command(&ClientCommand::ReadReceipt(ReadReceiptCommand {
            match_id: conversation_id.clone(),
            message_ids,
        }))
        .await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
