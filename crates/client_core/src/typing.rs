//! Receiver-side typing state.
//!
//! The server relays raw typing signals without any timing attached; each
//! client expires what it heard after a quiet interval, so a peer whose
//! signal was lost stops "typing" on its own.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use shared::domain::{ThreadId, UserId};

/// How long a typing signal stays live without a renewal.
pub const TYPING_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Default)]
pub struct TypingTracker {
    seen: HashMap<(ThreadId, UserId), Instant>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one relayed signal. An explicit `false` clears at once.
    pub fn apply(&mut self, thread_id: ThreadId, user_id: UserId, is_typing: bool, now: Instant) {
        if is_typing {
            self.seen.insert((thread_id, user_id), now);
        } else {
            self.seen.remove(&(thread_id, user_id));
        }
    }

    /// Who is still typing in `thread_id` as of `now`, expired state
    /// pruned.
    pub fn typists_in(&mut self, thread_id: ThreadId, now: Instant) -> Vec<UserId> {
        self.prune(now);
        let mut typists: Vec<UserId> = self
            .seen
            .keys()
            .filter(|(thread, _)| *thread == thread_id)
            .map(|(_, user)| *user)
            .collect();
        typists.sort();
        typists
    }

    pub fn prune(&mut self, now: Instant) {
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < TYPING_TTL);
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
