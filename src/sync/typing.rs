// Typing signals. Ephemeral, never part of the message store.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Local side: emits start on the first keystroke after idle and stop after
/// `idle` without keystrokes, or immediately on send.
#[derive(Debug)]
pub struct TypingNotifier {
    idle: Duration,
    typing: bool,
    last_keystroke: Option<Instant>,
}

impl TypingNotifier {
    pub fn new(idle: Duration) -> Self {
        TypingNotifier {
            idle,
            typing: false,
            last_keystroke: None,
        }
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_keystroke = Some(now);
        if self.typing {
            None
        } else {
            self.typing = true;
            Some(TypingSignal::Start)
        }
    }

    /// Stop once the idle window has passed since the last keystroke.
    pub fn poll_idle(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.last_keystroke {
            Some(last) if self.typing && now.duration_since(last) >= self.idle => {
                self.typing = false;
                Some(TypingSignal::Stop)
            }
            _ => None,
        }
    }

    pub fn on_send(&mut self) -> Option<TypingSignal> {
        self.last_keystroke = None;
        if self.typing {
            self.typing = false;
            Some(TypingSignal::Stop)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.typing = false;
        self.last_keystroke = None;
    }
}

/// Remote side: which peers are typing right now.
#[derive(Debug)]
pub struct TypingIndicator {
    expiry: Duration,
    typing_until: HashMap<String, Instant>,
}

impl TypingIndicator {
    pub fn new(expiry: Duration) -> Self {
        TypingIndicator {
            expiry,
            typing_until: HashMap::new(),
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Start or refresh. Returns true when the user was not shown as typing.
    pub fn on_typing(&mut self, user_id: &str, now: Instant) -> bool {
        let was_typing = self.is_typing(user_id, now);
        self.typing_until.insert(user_id.to_string(), now + self.expiry);
        !was_typing
    }

    /// Returns true when an active indicator was removed.
    pub fn on_stopped(&mut self, user_id: &str, now: Instant) -> bool {
        let was_typing = self.is_typing(user_id, now);
        self.typing_until.remove(user_id);
        was_typing
    }

    pub fn is_typing(&self, user_id: &str, now: Instant) -> bool {
        self.typing_until
            .get(user_id)
            .map_or(false, |until| *until > now)
    }

    /// Drop expired entries, returning the users whose indicator expired.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .typing_until
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            self.typing_until.remove(user);
        }
        expired
    }

    pub fn typing_users(&self, now: Instant) -> Vec<String> {
        let mut users: Vec<String> = self
            .typing_until
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    pub fn clear(&mut self) {
        self.typing_until.clear();
    }
}
