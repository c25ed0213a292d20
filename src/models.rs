use crate::json::JsonValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub function: ToolCallFunction,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: JsonValue,
}

fn empty_arguments() -> JsonValue {
    JsonValue::Object(Default::default())
}

// One turn of a conversation.
//
// While `is_streaming` is set, only the fixed/pending pairs are authoritative;
// `content` and `thinking` are written when the stream terminates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,

    pub fixed_content: String,
    pub pending_content: String,

    pub thinking: Option<String>,
    pub fixed_thinking: String,
    pub pending_thinking: String,
    pub is_thinking_completed: bool,

    pub is_streaming: bool,
    pub is_stopped: bool,

    pub created_at: Option<String>,
    pub total_duration: Option<u64>,
    pub eval_count: Option<u64>,
    pub eval_duration: Option<u64>,

    // Archived complete versions, oldest first. `current_revision_index ==
    // revisions.len()` means the latest version is on display.
    pub revisions: Vec<ChatMessage>,
    pub current_revision_index: usize,

    pub original_content: String,
    pub latest_content: String,

    // Latest finalized state, restored when navigating forward past the last revision.
    pub final_thinking: Option<String>,
    pub final_is_thinking_completed: bool,
    pub final_created_at: Option<String>,
    pub final_total_duration: Option<u64>,
    pub final_eval_count: Option<u64>,
    pub final_eval_duration: Option<u64>,
    pub final_is_stopped: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,

    // Local send time, used to order retries. Not part of the wire format.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            role,
            fixed_content: String::new(),
            pending_content: String::new(),
            thinking: None,
            fixed_thinking: String::new(),
            pending_thinking: String::new(),
            is_thinking_completed: false,
            is_streaming: false,
            is_stopped: false,
            created_at: None,
            total_duration: None,
            eval_count: None,
            eval_duration: None,
            revisions: Vec::new(),
            current_revision_index: 0,
            original_content: content.clone(),
            latest_content: content.clone(),
            final_thinking: None,
            final_is_thinking_completed: false,
            final_created_at: None,
            final_total_duration: None,
            final_eval_count: None,
            final_eval_duration: None,
            final_is_stopped: false,
            tool_calls: None,
            tool_name: None,
            images: None,
            timestamp: Utc::now(),
            content,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::User, content);
        message.created_at = Some(message.timestamp.to_rfc3339());
        message
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// An empty assistant message waiting for its stream.
    pub fn assistant_placeholder() -> Self {
        let mut message = Self::new(Role::Assistant, "");
        message.is_streaming = true;
        message
    }

    /// The text a UI should render right now.
    pub fn display_content(&self) -> String {
        if self.is_streaming {
            format!("{}{}", self.fixed_content, self.pending_content)
        } else {
            self.content.clone()
        }
    }

    pub fn display_thinking(&self) -> Option<String> {
        if self.is_streaming {
            let text = format!("{}{}", self.fixed_thinking, self.pending_thinking);
            (!text.is_empty()).then_some(text)
        } else {
            self.thinking.clone()
        }
    }

    pub fn is_viewing_latest(&self) -> bool {
        self.current_revision_index == self.revisions.len()
    }

    pub fn version_count(&self) -> usize {
        self.revisions.len() + 1
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        let count = self.eval_count?;
        let duration = self.eval_duration?;
        if duration == 0 {
            return None;
        }
        Some(count as f64 / (duration as f64 / 1_000_000_000.0))
    }
}

/// The ordered list of messages in one chat.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }
}

impl Conversation {
    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn get(&self, id: Uuid) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    pub fn is_streaming(&self) -> bool {
        self.messages.iter().any(|m| m.is_streaming)
    }
}
