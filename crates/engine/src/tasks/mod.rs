// Background AI task machinery: durable task records with a guarded
// status state machine, an in-process queue, and a worker pool running
// the same parse/merge pipeline as the immediate path.

pub mod store;
pub mod worker;

use serde::{Deserialize, Serialize};

/// The request payload stored on every task. For a decomposed bulk
/// request, each child carries the section it is scoped to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl TaskPayload {
    pub fn whole_test(message: impl Into<String>) -> Self {
        Self { message: message.into(), section: None }
    }

    pub fn for_section(message: impl Into<String>, section: impl Into<String>) -> Self {
        Self { message: message.into(), section: Some(section.into()) }
    }
}
