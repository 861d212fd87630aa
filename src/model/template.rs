use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Id;

/// Runtime type of a single template field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Enum,
    IntArray,
    String,
    StringArray,
    StringInputbox,
    Textarea,
    TextareaMarkdown,
    ListOfInputboxes,
    Datetime,
    Concept,
    Code,
    UrlList,
    Publication,
    GroupSelect,
    #[serde(rename = "clinical/concept")]
    ClinicalConcept,
    DataSources,
    Collections,
    Tags,
    CodingSystem,
}

/// Declarative source for enumerated/sourced field values.
///
/// `table` names an entry in the source registry; `query` is the value
/// column and `relative` the label column. `trees` switches the source to
/// an ontology category set. `filter` names a filter generator applied on
/// top with logical AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSource {
    pub table: String,
    #[serde(default = "default_query_column")]
    pub query: String,
    #[serde(default = "default_relative_column")]
    pub relative: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trees: Option<Vec<Id>>,
}

fn default_query_column() -> String {
    "id".to_string()
}

fn default_relative_column() -> String {
    "name".to_string()
}

/// Validation rules attached to a field descriptor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldValidation {
    /// Coercion type name, e.g. "int", "int_array", "string".
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FieldSource>,
    /// Fixed option map for enum-like fields (value -> label).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub has_children: bool,
    /// Mandatory subfields of structured array elements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composition: Option<Vec<String>>,
    #[serde(default)]
    pub sanitise: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<(usize, usize)>,
    /// Extra behaviours the filter engine may honour, e.g. "descendants".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
}

/// How a field participates in search and filtering.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchBehaviour {
    #[serde(default)]
    pub filterable: bool,
    #[serde(default)]
    pub api: bool,
    #[serde(default)]
    pub single_search_only: bool,
}

/// One field of a template definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub is_base_field: bool,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub validation: FieldValidation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchBehaviour>,
}

fn default_true() -> bool {
    true
}

impl FieldDef {
    pub fn new(name: &str, title: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            field_type,
            active: true,
            requires_auth: false,
            is_base_field: false,
            order: 0,
            validation: FieldValidation::default(),
            search: None,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.validation.mandatory = true;
        self
    }

    pub fn base_field(mut self) -> Self {
        self.is_base_field = true;
        self
    }

    pub fn filterable(mut self) -> Self {
        let search = self.search.get_or_insert_with(SearchBehaviour::default);
        search.filterable = true;
        search.api = true;
        self
    }

    pub fn is_filterable(&self) -> bool {
        self.search.as_ref().map(|s| s.filterable).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplateDetails {
    #[serde(default = "default_template_version")]
    pub version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_template_version() -> i32 {
    1
}

/// The JSON schema descriptor governing an entity class's payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplateDefinition {
    #[serde(default)]
    pub template_details: TemplateDetails,
    /// Declared fields in order; base fields may appear as partial
    /// overrides of the base metadata schema.
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detail_page_sections: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layout_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_filters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_order: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_statistics: Option<serde_json::Value>,
}

impl TemplateDefinition {
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A versioned schema descriptor. Historized like every other aggregate;
/// `template_version` is content-derived from the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Id,
    pub name: String,
    pub template_version: i32,
    pub definition: TemplateDefinition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_class_id: Option<Id>,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// A resolved field descriptor as returned by effective-schema lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub key: String,
    pub descriptor: FieldDef,
    pub is_metadata: bool,
}

/// One selectable option of a sourced field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOption {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub included: serde_json::Map<String, serde_json::Value>,
}
