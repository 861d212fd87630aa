use anyhow::Result;

use crate::model::{
    ApprovalStatus, Brand, Code, Codelist, CodingSystem, Component, Concept, ConceptCodeAttribute,
    ConceptSave, DataSource, EntityClass, GenericEntity, Group, HistoryId, HistoryRow, Id,
    OntologyNode, PublicId, PublishedRecord, Tag, TagType, Template,
};

#[async_trait::async_trait]
pub trait CodingSystemStore: Send + Sync {
    async fn get_coding_system(&self, id: Id) -> Result<Option<CodingSystem>>;
    async fn list_coding_systems(&self) -> Result<Vec<CodingSystem>>;
    async fn upsert_coding_system(&self, coding_system: CodingSystem) -> Result<()>;
}

#[async_trait::async_trait]
pub trait OntologyStore: Send + Sync {
    async fn get_ontology_node(&self, id: Id) -> Result<Option<OntologyNode>>;
    async fn list_ontology_nodes(&self, type_id: Id) -> Result<Vec<OntologyNode>>;
    async fn list_ontology_type_ids(&self) -> Result<Vec<Id>>;
    /// Upsert recomputes the node's search vector before persisting.
    async fn upsert_ontology_node(&self, node: OntologyNode) -> Result<()>;
}

#[async_trait::async_trait]
pub trait TaxonomyStore: Send + Sync {
    async fn get_tag(&self, id: Id) -> Result<Option<Tag>>;
    async fn list_tags(&self, tag_type: Option<TagType>) -> Result<Vec<Tag>>;
    async fn upsert_tag(&self, tag: Tag) -> Result<()>;

    async fn get_brand(&self, id: Id) -> Result<Option<Brand>>;
    async fn get_brand_by_name(&self, name: &str) -> Result<Option<Brand>>;
    async fn list_brands(&self) -> Result<Vec<Brand>>;
    async fn upsert_brand(&self, brand: Brand) -> Result<()>;

    async fn get_data_source(&self, id: Id) -> Result<Option<DataSource>>;
    async fn list_data_sources(&self) -> Result<Vec<DataSource>>;
    async fn upsert_data_source(&self, data_source: DataSource) -> Result<()>;

    async fn get_group(&self, id: Id) -> Result<Option<Group>>;
    async fn list_groups(&self) -> Result<Vec<Group>>;
    async fn upsert_group(&self, group: Group) -> Result<()>;
}

#[async_trait::async_trait]
pub trait TemplateStore: Send + Sync {
    /// Latest live template row.
    async fn get_template(&self, id: Id) -> Result<Option<Template>>;
    /// A specific historic template version.
    async fn get_template_version(&self, id: Id, version: i32) -> Result<Option<Template>>;
    async fn list_templates(&self) -> Result<Vec<Template>>;
    async fn list_template_history(&self, id: Id) -> Result<Vec<HistoryRow<Template>>>;
    /// Persist a new template version (allocating an id when `template.id == 0`).
    async fn save_template(&self, template: Template, user: &str) -> Result<(Id, HistoryId)>;
}

#[async_trait::async_trait]
pub trait ConceptStore: Send + Sync {
    async fn get_concept(&self, id: Id) -> Result<Option<Concept>>;
    async fn get_concept_version(
        &self,
        id: Id,
        history_id: HistoryId,
    ) -> Result<Option<HistoryRow<Concept>>>;
    async fn latest_concept_version_id(&self, id: Id) -> Result<Option<HistoryId>>;
    async fn list_concepts(&self) -> Result<Vec<Concept>>;
    async fn list_concept_history(&self, id: Id) -> Result<Vec<HistoryRow<Concept>>>;

    /// History vectors the temporal derivation is computed from.
    async fn component_history_for_concept(
        &self,
        concept_id: Id,
    ) -> Result<Vec<HistoryRow<Component>>>;
    async fn codelist_history_for_component(
        &self,
        component_id: Id,
    ) -> Result<Vec<HistoryRow<Codelist>>>;
    async fn code_history_for_codelist(&self, codelist_id: Id) -> Result<Vec<HistoryRow<Code>>>;
    async fn attribute_history_for_concept(
        &self,
        concept_id: Id,
    ) -> Result<Vec<HistoryRow<ConceptCodeAttribute>>>;

    /// Atomic wholesale write of a concept and its rulesets/codelists/codes.
    /// Returns the concept id and the new concept history id.
    async fn save_concept_tree(&self, save: ConceptSave, user: &str) -> Result<(Id, HistoryId)>;
    /// Tombstone a concept (history row with a delete marker).
    async fn delete_concept(&self, id: Id, user: &str) -> Result<HistoryId>;
}

#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity_class(&self, prefix: &str) -> Result<Option<EntityClass>>;
    async fn list_entity_classes(&self) -> Result<Vec<EntityClass>>;
    async fn upsert_entity_class(&self, class: EntityClass) -> Result<()>;

    /// Reserve the next public id by atomically incrementing the class
    /// counter. Two concurrent allocations never share or skip an id.
    async fn allocate_public_id(&self, prefix: &str) -> Result<PublicId>;
    /// Write the first history row for a freshly allocated public id.
    /// Fails if an entity with that id already exists.
    async fn create_entity(&self, entity: GenericEntity) -> Result<(PublicId, HistoryId)>;
    /// Write a new history row for an existing entity.
    async fn update_entity(&self, entity: GenericEntity) -> Result<HistoryId>;

    async fn get_entity(&self, public_id: &PublicId) -> Result<Option<GenericEntity>>;
    async fn get_entity_version(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
    ) -> Result<Option<HistoryRow<GenericEntity>>>;
    async fn latest_entity_version_id(&self, public_id: &PublicId) -> Result<Option<HistoryId>>;
    async fn list_entity_history(
        &self,
        public_id: &PublicId,
    ) -> Result<Vec<HistoryRow<GenericEntity>>>;
    async fn list_entities(&self) -> Result<Vec<GenericEntity>>;
    async fn list_entities_for_template(
        &self,
        template_id: Id,
        template_version: Option<i32>,
    ) -> Result<Vec<HistoryRow<GenericEntity>>>;
}

#[async_trait::async_trait]
pub trait PublicationStore: Send + Sync {
    async fn publication_records(&self, public_id: &PublicId) -> Result<Vec<PublishedRecord>>;
    async fn latest_publication_record(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
    ) -> Result<Option<PublishedRecord>>;
    /// Write a publication record and refresh the denormalized
    /// `publish_status` on the live entity and the historic row, atomically.
    async fn set_publication(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
        status: ApprovalStatus,
        moderator_id: Option<&str>,
        actor: &str,
    ) -> Result<PublishedRecord>;
}

pub trait Store:
    CodingSystemStore
    + OntologyStore
    + TaxonomyStore
    + TemplateStore
    + ConceptStore
    + EntityStore
    + PublicationStore
    + Send
    + Sync
{
}
