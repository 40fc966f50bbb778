use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Opening message shown when a follow-up session starts.
pub const CHAT_GREETING: &str = "I've analyzed the media. Do you have specific questions about the visual evidence, location, or potential manipulation?";

/// Appended as the model turn when a chat exchange fails; the session stays
/// usable and the user may simply send again.
pub const CHAT_FAILURE_TEXT: &str = "Connection error. Please try again.";

/// Substituted when the model returns an empty reply body.
pub const EMPTY_REPLY_TEXT: &str = "I couldn't generate a response.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
    pub timestamp: String,
}

impl ChatMessage {
    pub fn now(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: now_utc_iso(),
        }
    }
}

/// Append-only record of the visible conversation. Owned by the active chat
/// session and discarded with it; the original report is never mutated by
/// anything appended here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
}

impl ChatTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> &ChatMessage {
        self.push(ChatMessage::now(ChatRole::User, text))
    }

    pub fn push_model(&mut self, text: impl Into<String>) -> &ChatMessage {
        self.push(ChatMessage::now(ChatRole::Model, text))
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn push(&mut self, message: ChatMessage) -> &ChatMessage {
        self.messages.push(message);
        self.messages.last().expect("transcript push")
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn transcript_appends_in_order() {
        let mut transcript = ChatTranscript::new();
        transcript.push_model(CHAT_GREETING);
        transcript.push_user("Where was this taken?");
        transcript.push_model("The landmarks match central Dhaka.");

        let roles: Vec<ChatRole> = transcript.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::Model, ChatRole::User, ChatRole::Model]);
        assert_eq!(transcript.len(), 3);
        assert_eq!(
            transcript.last().map(|m| m.text.as_str()),
            Some("The landmarks match central Dhaka.")
        );
    }

    #[test]
    fn roles_serialize_lowercase() -> anyhow::Result<()> {
        let message = ChatMessage::now(ChatRole::User, "hello");
        let value: Value = serde_json::from_str(&serde_json::to_string(&message)?)?;
        assert_eq!(value["role"], json!("user"));
        Ok(())
    }

    #[test]
    fn timestamps_are_rfc3339() -> anyhow::Result<()> {
        let message = ChatMessage::now(ChatRole::Model, "reply");
        DateTime::parse_from_rfc3339(&message.timestamp)?;
        Ok(())
    }
}
