// Message store and push-event reducers.
//
// Every reducer here is idempotent and monotonic: re-applying an event is a
// no-op and no reducer ever lowers a delivery status. Display order is
// ascending `created_at`, ties kept in insertion order.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashSet;

use crate::models::{DeliveryStatus, Message};

#[derive(Debug, Clone)]
pub struct MessageStore {
    local_user_id: String,
    messages: Vec<Message>,
    /// Peer-authored messages already covered by one of our mark-read requests.
    acknowledged: HashSet<String>,
}

/// Combine a stored message with a newer observation of the same message.
///
/// Server fields come from `incoming`; the status is the more advanced of
/// the two and the earliest known read receipt is kept.
pub fn merge_message(existing: &Message, incoming: Message) -> Message {
    let mut merged = incoming;
    if !existing.delivery_status.can_advance_to(merged.delivery_status) {
        merged.delivery_status = existing.delivery_status;
    }

    let keep_existing_receipt = match (existing.read_at, merged.read_at) {
        (Some(current), Some(candidate)) => current <= candidate,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if keep_existing_receipt {
        merged.read_at = existing.read_at;
        merged.read_by = existing.read_by.clone();
    } else if merged.read_by.is_none() {
        merged.read_by = existing.read_by.clone();
    }

    if merged.chat_id.is_none() {
        merged.chat_id = existing.chat_id.clone();
    }
    if merged.client_message_id.is_none() {
        merged.client_message_id = existing.client_message_id.clone();
    }
    merged
}

impl MessageStore {
    pub fn new(local_user_id: &str) -> Self {
        MessageStore {
            local_user_id: local_user_id.to_string(),
            messages: Vec::new(),
            acknowledged: HashSet::new(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.acknowledged.clear();
    }

    fn sort(&mut self) {
        // Stable: equal timestamps keep insertion order.
        self.messages.sort_by_key(|m| m.created_at);
    }

    fn position_of_pending(&self, pending_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.is_pending() && m.id == pending_id)
    }

    /// Insert or merge `incoming` by message id. Returns whether the store changed.
    ///
    /// A message whose `client_message_id` names a pending optimistic entry
    /// replaces that entry in place.
    pub fn upsert(&mut self, incoming: Message) -> bool {
        let pending_id = incoming.client_message_id.clone();
        let by_id = self.messages.iter().position(|m| m.id == incoming.id);

        let changed = match by_id {
            Some(index) => {
                let merged = merge_message(&self.messages[index], incoming);
                if merged == self.messages[index] {
                    false
                } else {
                    self.messages[index] = merged;
                    true
                }
            }
            None => {
                match pending_id.as_deref().and_then(|id| self.position_of_pending(id)) {
                    Some(index) => {
                        debug!("Confirming pending message {} as {}", self.messages[index].id, incoming.id);
                        let merged = merge_message(&self.messages[index], incoming);
                        self.messages[index] = merged;
                    }
                    None => self.messages.push(incoming),
                }
                true
            }
        };

        // The echo may have been stored before the pending entry was matched.
        let removed_pending = match pending_id.as_deref().and_then(|id| self.position_of_pending(id)) {
            Some(index) => {
                self.messages.remove(index);
                true
            }
            None => false,
        };

        if changed || removed_pending {
            self.sort();
        }
        changed || removed_pending
    }

    /// Merge a page of REST history. Returns how many entries changed.
    pub fn merge_page(&mut self, messages: Vec<Message>) -> usize {
        messages
            .into_iter()
            .map(|message| self.upsert(message))
            .filter(|changed| *changed)
            .count()
    }

    /// Add an optimistic entry. Its id doubles as the pending id.
    pub fn insert_pending(&mut self, message: Message) {
        debug_assert!(message.is_pending());
        self.messages.push(message);
        self.sort();
    }

    /// Drop an optimistic entry that was never confirmed.
    pub fn remove_pending(&mut self, pending_id: &str) -> Option<Message> {
        self.position_of_pending(pending_id)
            .map(|index| self.messages.remove(index))
    }

    /// `message-delivered`: only our own messages, only from SENT.
    pub fn apply_delivered(&mut self, message_id: &str) -> bool {
        let local = self.local_user_id.clone();
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) if message.is_authored_by(&local) && message.delivery_status == DeliveryStatus::Sent => {
                message.delivery_status = DeliveryStatus::Delivered;
                true
            }
            Some(message) => {
                debug!(
                    "Ignoring delivered receipt for {} (status {:?}, sender {})",
                    message_id, message.delivery_status, message.sender_id
                );
                false
            }
            None => {
                debug!("Ignoring delivered receipt for unknown message {}", message_id);
                false
            }
        }
    }

    /// Chat-level read by the peer: every confirmed message we authored in
    /// `chat_id` that is not READ yet becomes READ.
    pub fn mark_own_messages_read(&mut self, chat_id: &str, reader: Option<&str>, read_at: DateTime<Utc>) -> usize {
        let local = self.local_user_id.clone();
        let mut updated = 0;
        for message in self.messages.iter_mut() {
            if message.chat_id.as_deref() != Some(chat_id)
                || !message.is_authored_by(&local)
                || message.is_pending()
                || message.delivery_status == DeliveryStatus::Read
            {
                continue;
            }
            message.delivery_status = DeliveryStatus::Read;
            message.read_at = Some(read_at);
            message.read_by = reader.map(str::to_string);
            updated += 1;
        }
        updated
    }

    /// Our own read of the peer's messages in `chat_id`: bookkeeping only,
    /// the peer's delivery statuses are left alone.
    pub fn acknowledge_peer_messages(&mut self, chat_id: &str) -> usize {
        let local = self.local_user_id.clone();
        let mut added = 0;
        for message in &self.messages {
            if message.chat_id.as_deref() == Some(chat_id)
                && !message.is_authored_by(&local)
                && self.acknowledged.insert(message.id.clone())
            {
                added += 1;
            }
        }
        added
    }

    pub fn is_acknowledged(&self, message_id: &str) -> bool {
        self.acknowledged.contains(message_id)
    }

    /// Whether some peer message is neither READ nor covered by a mark-read.
    pub fn has_unacknowledged_peer_messages(&self) -> bool {
        self.messages.iter().any(|m| {
            !m.is_authored_by(&self.local_user_id)
                && m.delivery_status != DeliveryStatus::Read
                && !self.acknowledged.contains(&m.id)
        })
    }

    /// The peer came online: everything we sent is now reachable.
    pub fn promote_on_peer_online(&mut self, user_id: &str) -> usize {
        if user_id == self.local_user_id {
            return 0;
        }
        let local = self.local_user_id.clone();
        let mut promoted = 0;
        for message in self.messages.iter_mut() {
            if message.is_authored_by(&local) && message.delivery_status == DeliveryStatus::Sent {
                message.delivery_status = DeliveryStatus::Delivered;
                promoted += 1;
            }
        }
        promoted
    }
}
