//! Prompt assembly for retrieval-augmented answers.
//!
//! The model sees a system instruction, the recent conversation as real
//! chat turns, and a final user message holding numbered passages followed
//! by the question. Passages are cited as `[n]` in the answer.

use serde::{Deserialize, Serialize};

use crate::conversation::{ChatTurn, Role};
use crate::models::ContextPassage;

pub const SYSTEM_PROMPT: &str = "You answer questions about the user's personal notes, papers, and books. \
Use only the numbered context passages. Cite passages inline as [n]. \
If the passages do not contain the answer, say so plainly instead of guessing.";

/// Fixed reply when retrieval finds nothing to ground an answer on.
pub const NO_CONTEXT_ANSWER: &str = "I couldn't find anything in your indexed documents about that.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&ChatTurn> for ChatMessage {
    fn from(turn: &ChatTurn) -> Self {
        let role = match turn.role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        };
        ChatMessage::new(role, turn.content.clone())
    }
}

/// Render passages as a numbered context block.
pub fn context_block(passages: &[ContextPassage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}] {} ({})\n{}", i + 1, p.label(), p.source_id, p.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the full message list for one question.
pub fn build_messages(
    question: &str,
    history: &[ChatTurn],
    passages: &[ContextPassage],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new(MessageRole::System, SYSTEM_PROMPT));
    messages.extend(history.iter().map(ChatMessage::from));
    messages.push(ChatMessage::new(
        MessageRole::User,
        format!(
            "Context:\n{}\n\nQuestion: {}",
            context_block(passages),
            question.trim()
        ),
    ));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(title: &str, text: &str) -> ContextPassage {
        ContextPassage {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            chunk_index: 0,
            title: Some(title.to_string()),
            source: "filesystem:notes".to_string(),
            source_id: format!("{}.md", title),
            source_url: None,
            score: 1.0,
            text: text.to_string(),
        }
    }

    #[test]
    fn messages_wrap_history_between_system_and_question() {
        let history = vec![
            ChatTurn {
                role: Role::User,
                content: "How long should naps be?".to_string(),
            },
            ChatTurn {
                role: Role::Assistant,
                content: "About 30 to 90 minutes [1].".to_string(),
            },
        ];
        let passages = vec![passage("Sleep", "Newborns nap often.")];
        let messages = build_messages("And at night?", &history, &passages);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[1].role, MessageRole::User);
        assert_eq!(messages[2].role, MessageRole::Assistant);
        let last = &messages[3].content;
        assert!(last.contains("[1] Sleep (Sleep.md)\nNewborns nap often."));
        assert!(last.ends_with("Question: And at night?"));
    }

    #[test]
    fn context_block_numbers_passages() {
        let block = context_block(&[passage("A", "one"), passage("B", "two")]);
        assert!(block.starts_with("[1] A"));
        assert!(block.contains("\n\n[2] B (B.md)\ntwo"));
    }
}
