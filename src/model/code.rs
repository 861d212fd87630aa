use serde::{Deserialize, Serialize};

use crate::model::Id;

/// A single clinical code inside a codelist.
///
/// Uniqueness of `code` within a codelist is deliberately not enforced at
/// storage; duplicates across rulesets are resolved at aggregation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub id: Id,
    pub codelist_id: Id,
    pub code: String,
    #[serde(default)]
    pub description: String,
}

/// The codelist owned by exactly one ruleset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codelist {
    pub id: Id,
    pub component_id: Id,
    #[serde(default)]
    pub description: String,
}

/// Per-concept, per-code attribute values aligned with the concept's
/// `code_attribute_header`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptCodeAttribute {
    pub id: Id,
    pub concept_id: Id,
    pub code: String,
    pub attributes: Vec<serde_json::Value>,
}

/// One row of a derived (aggregated) codelist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodelistEntry {
    pub code: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<serde_json::Value>>,
}
