//! Conversation history
//!
//! An ordered, append-only list of [`ChatMessageContent`]. The orchestration
//! loop borrows it mutably for the duration of one call and appends assistant
//! replies and tool results in a deterministic order.

use crate::contents::{AuthorRole, ChatMessageContent, FunctionResultContent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatHistory {
    messages: Vec<ChatMessageContent>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A history that opens with a system message.
    pub fn with_system_message(text: impl Into<String>) -> Self {
        let mut history = Self::new();
        history.add_system_message(text);
        history
    }

    /// A history holding a rendered prompt as its single user turn.
    pub fn from_rendered_prompt(prompt: impl Into<String>) -> Self {
        let mut history = Self::new();
        history.add_user_message(prompt);
        history
    }

    pub fn add_message(&mut self, message: ChatMessageContent) {
        self.messages.push(message);
    }

    pub fn add_system_message(&mut self, text: impl Into<String>) {
        self.add_message(ChatMessageContent::system(text));
    }

    pub fn add_user_message(&mut self, text: impl Into<String>) {
        self.add_message(ChatMessageContent::user(text));
    }

    pub fn add_assistant_message(&mut self, text: impl Into<String>) {
        self.add_message(ChatMessageContent::assistant(text));
    }

    /// Append one tool message per result, keeping the given order.
    pub fn add_tool_results(&mut self, results: impl IntoIterator<Item = FunctionResultContent>) {
        for result in results {
            self.add_message(ChatMessageContent::tool(result));
        }
    }

    pub fn messages(&self) -> &[ChatMessageContent] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChatMessageContent> {
        self.messages.iter()
    }

    pub fn last(&self) -> Option<&ChatMessageContent> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether a system message, if any, comes before everything else.
    pub fn system_message_first(&self) -> bool {
        self.messages
            .iter()
            .skip(1)
            .all(|m| m.role != AuthorRole::System)
    }
}

impl<'a> IntoIterator for &'a ChatHistory {
    type Item = &'a ChatMessageContent;
    type IntoIter = std::slice::Iter<'a, ChatMessageContent>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

impl From<Vec<ChatMessageContent>> for ChatHistory {
    fn from(messages: Vec<ChatMessageContent>) -> Self {
        Self { messages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contents::FunctionCallContent;
    use serde_json::json;

    #[test]
    fn test_insertion_order() {
        let mut history = ChatHistory::with_system_message("be terse");
        history.add_user_message("What is 2+2?");
        history.add_assistant_message("4");

        let roles: Vec<_> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![AuthorRole::System, AuthorRole::User, AuthorRole::Assistant]
        );
        assert!(history.system_message_first());
    }

    #[test]
    fn test_tool_results_keep_order() {
        let mut history = ChatHistory::new();
        let a = FunctionCallContent::new("a", "math-Add", "{}");
        let b = FunctionCallContent::new("b", "math-Add", "{}");
        history.add_tool_results(vec![
            FunctionResultContent::success(&a, json!(1)),
            FunctionResultContent::success(&b, json!(2)),
        ]);

        let ids: Vec<_> = history
            .iter()
            .flat_map(|m| m.function_results())
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_late_system_message_detected() {
        let mut history = ChatHistory::from_rendered_prompt("hi");
        history.add_system_message("late");
        assert!(!history.system_message_first());
    }

    #[test]
    fn test_serialization() {
        let history = ChatHistory::from_rendered_prompt("hi");
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        let back: ChatHistory = serde_json::from_value(json).unwrap();
        assert_eq!(back, history);
    }
}
