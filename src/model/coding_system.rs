use serde::{Deserialize, Serialize};

use crate::model::Id;

/// A recognized clinical coding vocabulary (ICD-10, SNOMED CT, Read v2, ...).
///
/// The registry only describes where a vocabulary's terminology lives and
/// how its codes are labelled; the codes themselves are pre-loaded data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodingSystem {
    pub id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Column holding the code in the backing terminology table.
    pub code_column: String,
    /// Column holding the human-readable description.
    pub description_column: String,
    /// Optional fixed filter applied to every terminology lookup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Ordering of per-system code attribute headers.
    #[serde(default)]
    pub attribute_headers: Vec<String>,
}

impl CodingSystem {
    pub fn new(id: Id, name: &str, code_column: &str, description_column: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: None,
            code_column: code_column.to_string(),
            description_column: description_column.to_string(),
            filter: None,
            attribute_headers: Vec::new(),
        }
    }
}
