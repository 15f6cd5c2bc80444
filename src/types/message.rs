//! Message types
//!
//! Chat messages as they arrive over the wire, and their flattening into a
//! single prompt.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// Message from the user
    User,
    /// Message from the model
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One `role: content` line per message
pub fn flatten(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_format() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"role": "assistant", "content": "hi"}"#).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
        assert!(serde_json::from_str::<Role>("\"robot\"").is_err());
    }

    #[test]
    fn test_flatten() {
        let messages = vec![
            ChatMessage::new(Role::System, "Be terse."),
            ChatMessage::new(Role::User, "Hello"),
        ];
        assert_eq!(flatten(&messages), "system: Be terse.\nuser: Hello");
        assert_eq!(flatten(&[]), "");
    }
}
