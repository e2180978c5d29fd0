use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{Priority, RequirementStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: Uuid,
    pub project_id: String,
    /// Human-readable code such as `REQ-001`.
    pub code: String,
    pub description: String,
    pub category: Option<String>,
    pub priority: Priority,
    pub status: RequirementStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Requirement {
    pub fn new(
        project_id: impl Into<String>,
        code: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            code: code.into(),
            description: description.into(),
            category: None,
            priority: Priority::Medium,
            status: RequirementStatus::InProgress,
            created_at: now,
            updated_at: now,
        }
    }

    /// Category as presented to analysis providers.
    pub fn category_or_default(&self) -> &str {
        self.category
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or("General")
    }
}
