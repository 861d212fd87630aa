pub mod codelist;
pub mod entity_filter;
pub mod field_types;
pub mod ontology_ops;
pub mod permissions;
pub mod publish;
pub mod template_schema;
pub mod write_path;

pub use codelist::CodelistDeriver;
pub use entity_filter::{
    search_concepts, search_entities, ConceptSearchRequest, EntitySearchRequest, OrderBy,
    SearchPage,
};
