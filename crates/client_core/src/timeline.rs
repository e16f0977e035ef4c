//! Ordered message log for the open conversation.
//!
//! Every operation is a synchronous structural edit; none of them fail.
//! Insertion order is the display order and is never re-sorted by timestamp.

use shared::domain::{ChatMessage, ClientTempId, ConversationId, MessageId, UserId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// An optimistic entry was superseded by the server's copy.
    Replaced,
    /// Already present by server id.
    Duplicate,
    Appended,
}

#[derive(Debug, Default, Clone)]
pub struct MessageTimeline {
    conversation_id: Option<ConversationId>,
    messages: Vec<ChatMessage>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Empties the log and binds it to `conversation_id`.
    pub fn reset_for(&mut self, conversation_id: ConversationId) {
        self.conversation_id = Some(conversation_id);
        self.messages.clear();
    }

    pub fn clear(&mut self) {
        self.conversation_id = None;
        self.messages.clear();
    }

    /// Replaces the whole log with a server snapshot.
    pub fn load_snapshot(&mut self, conversation_id: ConversationId, messages: Vec<ChatMessage>) {
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "timeline snapshot loaded"
        );
        self.conversation_id = Some(conversation_id);
        self.messages = messages;
    }

    pub fn append_optimistic(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Attaches the server id to the optimistic entry for `client_temp_id`.
    /// Returns whether the log changed.
    pub fn confirm_sent(&mut self, client_temp_id: &ClientTempId, server_id: MessageId) -> bool {
        if self
            .messages
            .iter()
            .any(|m| m.id.as_ref() == Some(&server_id))
        {
            // The broadcast already delivered the confirmed copy; drop any
            // optimistic leftover instead of attaching a second server id.
            let before = self.messages.len();
            self.messages
                .retain(|m| !is_optimistic_for(m, client_temp_id));
            let mut changed = before != self.messages.len();
            for message in &mut self.messages {
                if message.id.as_ref() == Some(&server_id)
                    && message.client_temp_id.as_ref() == Some(client_temp_id)
                {
                    message.client_temp_id = None;
                    changed = true;
                }
            }
            return changed;
        }

        let Some(entry) = self
            .messages
            .iter_mut()
            .find(|m| m.matches_temp_id(client_temp_id))
        else {
            return false;
        };
        entry.id = Some(server_id);
        entry.client_temp_id = None;
        true
    }

    /// Removes the still-pending entry for `client_temp_id`. A confirmed
    /// entry is kept even if it still remembers the temp id.
    pub fn rollback(&mut self, client_temp_id: &ClientTempId) -> bool {
        let before = self.messages.len();
        self.messages
            .retain(|m| !is_optimistic_for(m, client_temp_id));
        before != self.messages.len()
    }

    /// Temp-id replacement is checked before id de-duplication: a just-sent
    /// message echoed by the broadcast already carries a server id that the
    /// log only knows through its temp id.
    pub fn merge_inbound(&mut self, message: ChatMessage) -> MergeOutcome {
        if let Some(temp) = &message.client_temp_id {
            if let Some(index) = self.messages.iter().position(|m| m.matches_temp_id(temp)) {
                self.messages[index] = message;
                return MergeOutcome::Replaced;
            }
        }

        if let Some(id) = &message.id {
            if self.messages.iter().any(|m| m.id.as_ref() == Some(id)) {
                return MergeOutcome::Duplicate;
            }
        }

        self.messages.push(message);
        MergeOutcome::Appended
    }

    /// Adds `reader_id` to `seen_by` of every listed message. Returns the
    /// number of messages that were not already marked.
    pub fn apply_read_receipt(&mut self, message_ids: &[MessageId], reader_id: &UserId) -> usize {
        let mut changed = 0;
        for message in &mut self.messages {
            let Some(id) = &message.id else {
                continue;
            };
            if message_ids.contains(id) && message.seen_by.insert(reader_id.clone()) {
                changed += 1;
            }
        }
        changed
    }

    /// Messages from others that `user` has not seen.
    pub fn unread_count_for(&self, user: &UserId) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.is_from(user) && !m.seen_by_user(user))
            .count()
    }

    /// Whether `peer` has seen the newest message sent by `own`.
    pub fn last_own_read_by(&self, own: &UserId, peer: &UserId) -> bool {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_from(own))
            .is_some_and(|m| m.seen_by_user(peer))
    }
}

fn is_optimistic_for(message: &ChatMessage, client_temp_id: &ClientTempId) -> bool {
    match &message.id {
        None => message.client_temp_id.as_ref() == Some(client_temp_id),
        Some(id) => id.0 == client_temp_id.0,
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
