//! Conversation list with last-message preview and unread projections,
//! kept ordered by most recent activity.

use std::cmp::Reverse;

use shared::domain::{Conversation, ConversationId, LastPreview};
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct ConversationDirectory {
    conversations: Vec<Conversation>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn first_id(&self) -> Option<&ConversationId> {
        self.conversations.first().map(|c| &c.id)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    pub fn load_snapshot(&mut self, conversations: Vec<Conversation>) {
        debug!(count = conversations.len(), "directory snapshot loaded");
        self.conversations = conversations;
        self.sort();
    }

    /// Records a new last message for `conversation_id`.
    ///
    /// The open conversation is being read live, so its counter drops to
    /// zero; otherwise only messages from someone else count as unread. A
    /// preview identical to the stored one is treated as a repeat delivery
    /// of the same message and never counted twice.
    pub fn bump_on_inbound(
        &mut self,
        conversation_id: &ConversationId,
        preview: LastPreview,
        is_active_conversation: bool,
        is_own_message: bool,
    ) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| &c.id == conversation_id)
        else {
            debug!(%conversation_id, "preview for unknown conversation ignored");
            return false;
        };

        let repeated = conversation.last_preview.as_ref() == Some(&preview);
        if is_active_conversation {
            conversation.unread_count = 0;
        } else if !is_own_message && !repeated {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        conversation.last_preview = Some(preview);

        self.sort();
        true
    }

    pub fn reset_unread(&mut self, conversation_id: &ConversationId) -> bool {
        self.set_unread(conversation_id, 0)
    }

    pub fn set_unread(&mut self, conversation_id: &ConversationId, unread_count: u32) -> bool {
        match self
            .conversations
            .iter_mut()
            .find(|c| &c.id == conversation_id)
        {
            Some(conversation) => {
                conversation.unread_count = unread_count;
                true
            }
            None => false,
        }
    }

    // `sort_by_key` is stable, so equal timestamps keep their relative order.
    fn sort(&mut self) {
        self.conversations
            .sort_by_key(|c| Reverse(c.activity_key()));
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
