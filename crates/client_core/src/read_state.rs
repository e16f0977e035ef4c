use shared::domain::{ConversationId, MessageId, UserId};
use tracing::{debug, warn};

use crate::{api::ChatApi, channel::EventChannel, timeline::MessageTimeline};

/// Message ids marked read locally and still to be reported to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceiptBatch {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone)]
pub struct ReadStateReconciler {
    local_user: UserId,
}

impl ReadStateReconciler {
    pub fn new(local_user: UserId) -> Self {
        Self { local_user }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Peer messages the local user has not seen. Entries without a server
    /// id cannot be receipted and are skipped.
    pub fn unread_message_ids(&self, timeline: &MessageTimeline) -> Vec<MessageId> {
        timeline
            .messages()
            .iter()
            .filter(|m| !m.is_from(&self.local_user) && !m.seen_by_user(&self.local_user))
            .filter_map(|m| m.id.clone())
            .collect()
    }

    /// Marks every unread peer message in `timeline` as seen by the local
    /// user. Returns `None`, leaving the timeline untouched, when there is
    /// nothing to mark or the timeline belongs to another conversation.
    pub fn mark_read_locally(
        &self,
        conversation_id: &ConversationId,
        timeline: &mut MessageTimeline,
    ) -> Option<ReadReceiptBatch> {
        if timeline.conversation_id() != Some(conversation_id) {
            debug!(%conversation_id, "mark read skipped for foreign timeline");
            return None;
        }
        let message_ids = self.unread_message_ids(timeline);
        if message_ids.is_empty() {
            return None;
        }
        timeline.apply_read_receipt(&message_ids, &self.local_user);
        Some(ReadReceiptBatch {
            conversation_id: conversation_id.clone(),
            message_ids,
        })
    }

    /// Reports a batch over the live channel and durably over REST. Both are
    /// best effort: failures are logged and the local state stays marked.
    pub async fn deliver(batch: &ReadReceiptBatch, channel: &dyn EventChannel, api: &dyn ChatApi) {
        let conversation_id = &batch.conversation_id;
        let count = batch.message_ids.len();
        let (live, durable) = tokio::join!(
            channel.send_read_receipt(conversation_id, batch.message_ids.clone()),
            api.submit_read_receipt(conversation_id, &batch.message_ids),
        );
        if let Err(err) = live {
            warn!(%conversation_id, count, error = %err, "read receipt not sent over channel");
        }
        if let Err(err) = durable {
            warn!(%conversation_id, count, error = %err, "read receipt not persisted");
        }
        debug!(%conversation_id, count, "read receipt delivered");
    }
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
