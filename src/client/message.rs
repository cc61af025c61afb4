use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// True when the non-system messages strictly alternate user/assistant,
/// starting with a user turn.
pub fn is_alternating(messages: &[Message]) -> bool {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .enumerate()
        .all(|(i, m)| {
            if i % 2 == 0 {
                m.role == Role::User
            } else {
                m.role == Role::Assistant
            }
        })
}
