use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Ordered, append-only conversation history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    turns: Vec<ChatTurn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(ChatTurn {
            role: Role::User,
            content: content.into(),
        });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(ChatTurn {
            role: Role::Assistant,
            content: content.into(),
        });
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Wire payload for a chat-completions call: one system turn, the
    /// recorded history in order, then the new user message last.
    pub fn to_messages(&self, system_prompt: &str, user_message: &str) -> Value {
        let mut messages = vec![json!({
            "role": "system",
            "content": system_prompt,
        })];
        for turn in &self.turns {
            messages.push(json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            }));
        }
        messages.push(json!({
            "role": "user",
            "content": user_message,
        }));
        Value::Array(messages)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{Role, Transcript};

    #[test]
    fn to_messages_orders_system_history_then_user() {
        let mut transcript = Transcript::new();
        transcript.push_user("hello");
        transcript.push_assistant("hi there");

        let messages = transcript.to_messages("be helpful", "next question");
        let rows = messages.as_array().expect("array payload");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["role"], json!("system"));
        assert_eq!(rows[0]["content"], json!("be helpful"));
        assert_eq!(rows[1]["role"], json!("user"));
        assert_eq!(rows[1]["content"], json!("hello"));
        assert_eq!(rows[2]["role"], json!("assistant"));
        assert_eq!(rows[3]["role"], json!("user"));
        assert_eq!(rows[3]["content"], json!("next question"));
    }

    #[test]
    fn transcript_is_append_only_in_order() {
        let mut transcript = Transcript::new();
        transcript.push_user("one");
        transcript.push_assistant("two");
        transcript.push_user("three");

        let roles: Vec<Role> = transcript.turns().iter().map(|turn| turn.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(transcript.len(), 3);
    }

    #[test]
    fn empty_transcript_still_produces_system_and_user() {
        let transcript = Transcript::new();
        let messages = transcript.to_messages("system", "question");
        let rows = messages.as_array().expect("array payload");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["role"], json!("system"));
        assert_eq!(rows[1], json!({"role": "user", "content": "question"}));
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Role::Assistant).unwrap_or(Value::Null), json!("assistant"));
    }
}
