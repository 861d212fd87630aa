use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AccessLevel, CodelistEntry, HistoryId, Id, PublicId};

/// A versioned collection of rulesets in a single coding system.
///
/// A concept may be owned by a phenotype (generic entity); that link is
/// kept consistent by the write path, which is the only code allowed to
/// touch both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: Id,
    pub name: String,
    pub coding_system_id: Id,
    /// Ordered attribute column names; empty when the concept carries no
    /// per-code attributes.
    #[serde(default)]
    pub code_attribute_header: Vec<String>,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Id>,
    #[serde(default)]
    pub owner_access: AccessLevel,
    #[serde(default)]
    pub group_access: AccessLevel,
    #[serde(default)]
    pub world_access: AccessLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phenotype_owner_id: Option<PublicId>,
    #[serde(default)]
    pub is_deleted: bool,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Concept {
    pub fn has_attributes(&self) -> bool {
        !self.code_attribute_header.is_empty()
    }
}

/// A concept version together with its fully derived codelist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptWithCodes {
    pub concept_id: Id,
    pub concept_version_id: HistoryId,
    pub name: String,
    pub coding_system_id: Id,
    #[serde(default)]
    pub code_attribute_header: Vec<String>,
    pub codes: Vec<CodelistEntry>,
}

/// Wholesale write of a concept and all of its children.
///
/// Updates rewrite rulesets, codelists and codes in one atomic store
/// operation: children absent from the payload are tombstoned, changed
/// children get new history rows, and the concept history row is written
/// last so every child row pre-dates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptSave {
    /// `None` creates a new concept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub name: String,
    pub coding_system_id: Id,
    #[serde(default)]
    pub code_attribute_header: Vec<String>,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Id>,
    #[serde(default)]
    pub owner_access: AccessLevel,
    #[serde(default)]
    pub group_access: AccessLevel,
    #[serde(default)]
    pub world_access: AccessLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phenotype_owner_id: Option<PublicId>,
    #[serde(default)]
    pub components: Vec<ComponentSave>,
    /// Per-code attribute rows aligned with `code_attribute_header`.
    #[serde(default)]
    pub attributes: Vec<(String, Vec<serde_json::Value>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSave {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub name: String,
    pub logical_type: crate::model::LogicalType,
    pub source_type: crate::model::SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_ref: Option<crate::model::ConceptRef>,
    #[serde(default)]
    pub codes: Vec<CodeSave>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSave {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub code: String,
    #[serde(default)]
    pub description: String,
}

/// Minimal projection for API list views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptSummary {
    pub concept_id: Id,
    pub concept_version_id: HistoryId,
    pub name: String,
    pub coding_system_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phenotype_owner_id: Option<PublicId>,
}
