//! # Conversation Window
//! Bounded, per-team buffer of the most recent chat messages. This is the
//! history handed to the evaluator as `recentMessages`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::model::ChatMessage;

pub const DEFAULT_WINDOW_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct ConversationWindow {
    buf: VecDeque<ChatMessage>,
    cap: usize,
}

impl ConversationWindow {
    /// `cap` of zero is treated as one.
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Append a message, evicting the oldest when full.
    /// A message id already present is ignored (redelivery).
    pub fn push(&mut self, message: ChatMessage) -> bool {
        if self.buf.iter().any(|m| m.id == message.id) {
            return false;
        }
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(message);
        true
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.buf.iter().cloned().collect()
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.buf.back().map(|m| m.created_at)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn msg(i: i64) -> ChatMessage {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(i);
        ChatMessage::new(format!("m{i}"), "u", "hi", t)
    }

    #[test]
    fn evicts_oldest() {
        let mut w = ConversationWindow::with_capacity(2);
        w.push(msg(1));
        w.push(msg(2));
        w.push(msg(3));
        let ids: Vec<_> = w.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert_eq!(w.last_message_at(), Some(msg(3).created_at));
    }

    #[test]
    fn redelivery_is_ignored() {
        let mut w = ConversationWindow::with_capacity(5);
        assert!(w.push(msg(1)));
        assert!(!w.push(msg(1)));
        assert_eq!(w.len(), 1);
    }
}
