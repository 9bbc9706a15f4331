use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message contract used by the sample program.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoMessage {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl DemoMessage {
    /// Creates a new DemoMessage with the current timestamp and a generated UUID.
    pub fn new(content: impl Into<String>) -> Self {
        DemoMessage {
            id: Uuid::new_v4(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}
