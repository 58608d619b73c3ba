//! Message timeline for a single thread, as the client renders it.
//!
//! Rows arrive from three directions: optimistic local echoes created at
//! send time, pages fetched over HTTP, and live events from the WebSocket.
//! The same message routinely shows up twice because the send receipt and
//! the broadcast both carry it, so persisted rows are keyed by server id
//! and merged idempotently. Local echoes ride at the tail until they are
//! confirmed, and a failed echo stays visible until the user retries or
//! discards it.

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, ThreadId},
    protocol::{AttachmentDraft, MessagePayload, ServerEvent},
};

/// Where an optimistic send stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sending,
    Failed,
}

/// What the user asked to send, kept verbatim so a retry is identical.
#[derive(Debug, Clone)]
pub struct OutboundDraft {
    pub content: Option<String>,
    pub reply_to_message_id: Option<MessageId>,
    pub attachments: Vec<AttachmentDraft>,
}

/// One rendered slot: either a confirmed server row or a pending echo.
#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Persisted(MessagePayload),
    Local {
        temp_id: u64,
        draft: OutboundDraft,
        status: SendStatus,
        queued_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct PendingSend {
    temp_id: u64,
    draft: OutboundDraft,
    status: SendStatus,
    queued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Timeline {
    thread_id: ThreadId,
    /// Confirmed rows, oldest first, unique by message id.
    messages: Vec<MessagePayload>,
    /// Optimistic echoes in send order, rendered after the confirmed rows.
    pending: Vec<PendingSend>,
    next_temp_id: u64,
    has_more: bool,
}

impl Timeline {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            messages: Vec::new(),
            pending: Vec::new(),
            next_temp_id: 1,
            has_more: false,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether older history exists beyond the oldest loaded row.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Registers an optimistic echo and returns its temp id.
    pub fn begin_send(&mut self, draft: OutboundDraft) -> u64 {
        let temp_id = self.next_temp_id;
        self.next_temp_id += 1;
        self.pending.push(PendingSend {
            temp_id,
            draft,
            status: SendStatus::Sending,
            queued_at: Utc::now(),
        });
        temp_id
    }

    /// Swaps an echo for the server row from its receipt.
    pub fn confirm_send(&mut self, temp_id: u64, message: MessagePayload) {
        self.pending.retain(|pending| pending.temp_id != temp_id);
        self.upsert(message);
    }

    /// Parks an echo as failed. It stays on screen until retried or
    /// discarded.
    pub fn fail_send(&mut self, temp_id: u64) {
        if let Some(pending) = self
            .pending
            .iter_mut()
            .find(|pending| pending.temp_id == temp_id)
        {
            pending.status = SendStatus::Failed;
        }
    }

    /// Removes a failed echo and hands back its draft for a retry. Echoes
    /// still in flight are left alone.
    pub fn take_failed(&mut self, temp_id: u64) -> Option<OutboundDraft> {
        let at = self.pending.iter().position(|pending| {
            pending.temp_id == temp_id && pending.status == SendStatus::Failed
        })?;
        Some(self.pending.remove(at).draft)
    }

    /// Folds one pushed event in. Returns whether anything changed, so the
    /// caller knows whether to refresh. Events for other threads are
    /// ignored.
    pub fn apply_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::MessageReceived { message } if message.thread_id == self.thread_id => {
                self.upsert(message.clone());
                true
            }
            // An edit for a row outside the loaded window is dropped; it
            // arrives with its page when the user scrolls back.
            ServerEvent::MessageEdited { message } if message.thread_id == self.thread_id => {
                match self.slot_of(message.message_id) {
                    Some(slot) => {
                        self.messages[slot] = message.clone();
                        true
                    }
                    None => false,
                }
            }
            ServerEvent::MessageDeleted {
                thread_id,
                message_id,
            } if *thread_id == self.thread_id => match self.slot_of(*message_id) {
                Some(slot) => {
                    let row = &mut self.messages[slot];
                    row.is_deleted = true;
                    row.content = None;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Merges one fetched page. Pages walk backwards from the newest row,
    /// so the page's `has_more` always describes the timeline's oldest
    /// frontier.
    pub fn merge_page(&mut self, page: &[MessagePayload], has_more: bool) {
        for message in page {
            if message.thread_id == self.thread_id {
                self.upsert(message.clone());
            }
        }
        self.has_more = has_more;
    }

    /// Drops a row outright. Used for local-only hides, which never get a
    /// server event.
    pub fn remove(&mut self, message_id: MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|message| message.message_id != message_id);
        self.messages.len() != before
    }

    pub fn newest_message_id(&self) -> Option<MessageId> {
        self.messages.last().map(|message| message.message_id)
    }

    /// Cloned view for rendering: confirmed rows oldest first, then the
    /// pending echoes in send order.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        let mut entries: Vec<TimelineEntry> = self
            .messages
            .iter()
            .cloned()
            .map(TimelineEntry::Persisted)
            .collect();
        entries.extend(self.pending.iter().map(|pending| TimelineEntry::Local {
            temp_id: pending.temp_id,
            draft: pending.draft.clone(),
            status: pending.status,
            queued_at: pending.queued_at,
        }));
        entries
    }

    fn slot_of(&self, message_id: MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.message_id == message_id)
    }

    fn upsert(&mut self, message: MessagePayload) {
        if let Some(slot) = self.slot_of(message.message_id) {
            self.messages[slot] = message;
            return;
        }
        let key = sort_key(&message);
        let at = self.messages.partition_point(|row| sort_key(row) <= key);
        self.messages.insert(at, message);
    }
}

fn sort_key(message: &MessagePayload) -> (DateTime<Utc>, i64) {
    (message.created_at, message.message_id.0)
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
