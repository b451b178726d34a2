//! Conversation history for follow-up questions.
//!
//! A [`ChatHistory`] records alternating user and assistant turns. Only the
//! most recent turns are replayed to the model, so follow-ups like "and for
//! newborns?" resolve against what was just discussed without the prompt
//! growing with the whole session.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Default number of stored turns before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Bounded, ordered chat transcript.
#[derive(Debug, Clone)]
pub struct ChatHistory {
    turns: VecDeque<ChatTurn>,
    capacity: usize,
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A history that keeps at most `capacity` turns (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(ChatTurn {
            role,
            content: content.into(),
        });
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content);
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Role::Assistant, content);
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ChatTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    /// The last `n` turns rendered as `role: message` lines.
    pub fn transcript(&self, n: usize) -> String {
        self.recent(n)
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<Vec<ChatTurn>> for ChatHistory {
    fn from(turns: Vec<ChatTurn>) -> Self {
        let mut history = ChatHistory::with_capacity(turns.len().max(DEFAULT_CAPACITY));
        for t in turns {
            history.push(t.role, t.content);
        }
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_tail_in_order() {
        let mut h = ChatHistory::new();
        for i in 0..6 {
            h.push_user(format!("q{}", i));
            h.push_assistant(format!("a{}", i));
        }
        let tail = h.recent(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "a4");
        assert_eq!(tail[1].content, "q5");
        assert_eq!(tail[2].role, Role::Assistant);
    }

    #[test]
    fn transcript_formats_role_prefixes() {
        let mut h = ChatHistory::new();
        h.push_user("What are burping methods?");
        h.push_assistant("Over the shoulder, sitting up, face down on lap.");
        assert_eq!(
            h.transcript(5),
            "user: What are burping methods?\nassistant: Over the shoulder, sitting up, face down on lap."
        );
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut h = ChatHistory::with_capacity(2);
        h.push_user("one");
        h.push_user("two");
        h.push_user("three");
        assert_eq!(h.len(), 2);
        assert_eq!(h.recent(10)[0].content, "two");
    }

    #[test]
    fn clear_empties_history() {
        let mut h = ChatHistory::new();
        h.push_user("hi");
        h.clear();
        assert!(h.is_empty());
        assert_eq!(h.transcript(5), "");
    }
}
