use serde::{Deserialize, Serialize};

use crate::model::{HistoryId, Id};

/// Whether a ruleset contributes to or subtracts from the final codelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalType {
    Include,
    Exclude,
}

/// How the ruleset's codes were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    SearchTerm,
    QueryBuilder,
    Expression,
    SelectImport,
    FileUpload,
    ConceptRef,
}

/// Pinned reference to another concept at a specific version.
///
/// Only the id pair is stored, never an object handle; the child codelist
/// is resolved on demand, and the referenced version must pre-date the
/// parent write so reference chains cannot form cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptRef {
    pub concept_id: Id,
    pub concept_version_id: HistoryId,
}

/// An include-or-exclude ruleset belonging to exactly one concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: Id,
    pub concept_id: Id,
    pub name: String,
    pub logical_type: LogicalType,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_ref: Option<ConceptRef>,
}

impl Component {
    pub fn is_exclusion(&self) -> bool {
        self.logical_type == LogicalType::Exclude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&LogicalType::Include).unwrap(),
            "\"INCLUDE\""
        );
        let parsed: LogicalType = serde_json::from_str("\"EXCLUDE\"").unwrap();
        assert_eq!(parsed, LogicalType::Exclude);
    }

    #[test]
    fn source_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&SourceType::ConceptRef).unwrap(),
            "\"concept_ref\""
        );
        let parsed: SourceType = serde_json::from_str("\"file_upload\"").unwrap();
        assert_eq!(parsed, SourceType::FileUpload);
    }
}
