// Core domain types shared across all QuizForge crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat conversation between one user and the authoring assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    /// Soft-delete marker; a deleted conversation is hidden, not purged.
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One exchange in a conversation. Immutable once written; ordering within
/// a conversation is insertion (rowid) order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: i64,
    pub conversation_id: Uuid,
    /// What the user typed. Absent for worker-generated replies.
    pub user_text: Option<String>,
    /// The assistant's reply. Absent until a reply exists.
    pub reply_text: Option<String>,
    /// Background tasks spawned by this message, if any.
    #[serde(default)]
    pub task_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a background AI task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// A unit of asynchronous AI work. Tasks form a two-level tree: a parent
/// (`parent_id = None`) optionally decomposed into children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AiTask {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub owner_id: String,
    pub parent_id: Option<Uuid>,
    pub status: TaskStatus,
    /// Opaque request payload (message text, targeted sections, ...).
    pub request_payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A parent task with its children, for uniform list rendering.
/// A standalone task appears as a single-element group of itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskGroup {
    pub parent: AiTask,
    pub children: Vec<AiTask>,
}

/// An append-only token ledger row. `amount` is negative for spends and
/// positive for grants; rows are never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenTransaction {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub source: String,
    pub conversation_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
