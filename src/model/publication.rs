use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{HistoryId, Id};

/// Moderation state of a single entity version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Requested,
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ApprovalStatus::Requested => write!(f, "REQUESTED"),
            ApprovalStatus::Pending => write!(f, "PENDING"),
            ApprovalStatus::Approved => write!(f, "APPROVED"),
            ApprovalStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// One publication record for a specific `(entity, history row)` pair.
///
/// The live entity and the historic row both carry a denormalized copy of
/// the latest record's status; the store updates all three together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedRecord {
    pub id: Id,
    pub entity_prefix: String,
    pub entity_id: i64,
    pub entity_history_id: HistoryId,
    pub approval_status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moderator_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}
