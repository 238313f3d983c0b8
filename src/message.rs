//! Message types exchanged with the chat-completion operation.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Role of a message's sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions.
    System,
    /// End-user content.
    User,
    /// Model-generated content.
    Assistant,
}

impl MessageRole {
    /// The lowercase wire representation of this role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation.
///
/// Value object: immutable once enqueued. Unlike a full chat client's message
/// type, there is no tool-calling or image surface here — chat completion and
/// transcription are the only two operations this crate performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sender role.
    pub role: MessageRole,
    /// Message body. Must be non-empty.
    pub content: String,
}

impl Message {
    /// Construct a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Construct a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Construct an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// The literal framed form `<|im_start|>{role}\n{content}<|im_end|>` the
    /// token counter tokenizes independently for each message.
    #[must_use]
    pub fn render(&self) -> String {
        format!("<|im_start|>{}\n{}<|im_end|>", self.role.as_str(), self.content)
    }

    /// Validate that this message is well-formed: non-empty content.
    ///
    /// `index` is only used to annotate the returned error.
    pub fn validate(&self, index: usize) -> Result<(), Error> {
        if self.content.is_empty() {
            return Err(Error::MessageFormat {
                index,
                reason: "content must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Validate a full message sequence: non-empty list, every element well-formed.
pub fn validate_messages(messages: &[Message]) -> Result<(), Error> {
    if messages.is_empty() {
        return Err(Error::MessageFormat {
            index: 0,
            reason: "message sequence must not be empty".to_string(),
        });
    }
    for (index, message) in messages.iter().enumerate() {
        message.validate(index)?;
    }
    Ok(())
}
