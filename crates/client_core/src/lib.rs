//! Client-side synchronization engine for match chat: conversation list,
//! message timeline, optimistic sends and read receipts kept consistent
//! over a persistent event channel and the REST API.

use std::sync::Arc;

pub mod api;
pub mod channel;
pub mod config;
pub mod directory;
pub mod error;
pub mod read_state;
pub mod sync;
pub mod timeline;

pub use api::{ChatApi, HttpChatApi};
pub use channel::{Backoff, ChannelEvent, EventChannel, PendingAck, SendOutcome, WsEventChannel};
pub use config::{load_settings, ClientSettings};
pub use directory::ConversationDirectory;
pub use error::{ApiClientError, ChannelError, SyncError};
pub use read_state::{ReadReceiptBatch, ReadStateReconciler};
pub use sync::{ChatSnapshot, Composer, SyncController, SyncEvent, SyncPhase};
pub use timeline::{MergeOutcome, MessageTimeline};

/// Wires the HTTP API and the WebSocket channel described by `settings`
/// into a controller. Nothing connects until [`SyncController::start`].
pub fn build_controller(
    settings: &ClientSettings,
    credential: &str,
) -> Result<Arc<SyncController>, SyncError> {
    let api = HttpChatApi::new(&settings.api_base_url, credential).map_err(SyncError::Config)?;
    let channel = WsEventChannel::from_settings(settings)?;
    Ok(SyncController::new(
        Arc::new(api),
        Arc::new(channel),
        settings,
    ))
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
