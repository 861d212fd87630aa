use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::model::{
    ApprovalStatus, Code, Codelist, CodingSystem, Component, Concept, ConceptCodeAttribute,
    ConceptSave, DataSource, EntityClass, GenericEntity, Group, HistoryId, HistoryRow, HistoryType,
    Id, OntologyNode, PublicId, PublishedRecord, Tag, TagType, Template,
};
use crate::store::traits::{
    CodingSystemStore, ConceptStore, EntityStore, OntologyStore, PublicationStore, Store,
    TaxonomyStore, TemplateStore,
};

#[derive(Debug, Default)]
struct Counters {
    history: HistoryId,
    concept: Id,
    component: Id,
    codelist: Id,
    code: Id,
    attribute: Id,
    template: Id,
    publication: Id,
}

impl Counters {
    fn next_history(&mut self) -> HistoryId {
        self.history += 1;
        self.history
    }
}

#[derive(Debug, Default)]
struct State {
    counters: Counters,

    coding_systems: BTreeMap<Id, CodingSystem>,
    ontology: BTreeMap<Id, OntologyNode>,
    tags: BTreeMap<Id, Tag>,
    brands: BTreeMap<Id, crate::model::Brand>,
    data_sources: BTreeMap<Id, DataSource>,
    groups: BTreeMap<Id, Group>,

    templates: BTreeMap<Id, Template>,
    template_history: Vec<HistoryRow<Template>>,

    concepts: BTreeMap<Id, Concept>,
    concept_history: Vec<HistoryRow<Concept>>,
    component_history: Vec<HistoryRow<Component>>,
    codelist_history: Vec<HistoryRow<Codelist>>,
    code_history: Vec<HistoryRow<Code>>,
    attribute_history: Vec<HistoryRow<ConceptCodeAttribute>>,

    entity_classes: BTreeMap<Id, EntityClass>,
    entities: BTreeMap<(String, i64), GenericEntity>,
    entity_history: Vec<HistoryRow<GenericEntity>>,

    publications: Vec<PublishedRecord>,
}

/// In-memory store used by tests and local development.
///
/// One `RwLock` guards the whole state, so every composite write (concept
/// tree rewrite, entity id allocation, publication denormalisation) is
/// atomic with respect to readers; they see either the pre- or the
/// post-write state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_component_rows(state: &State, concept_id: Id) -> Vec<Component> {
        let rows: Vec<HistoryRow<Component>> = state
            .component_history
            .iter()
            .filter(|row| row.row.concept_id == concept_id)
            .cloned()
            .collect();
        crate::model::latest_surviving_at(&rows, crate::model::cutoff_now(), |c: &Component| c.id)
            .into_iter()
            .map(|row| row.row.clone())
            .collect()
    }

    fn codelist_for_component(state: &State, component_id: Id) -> Option<Codelist> {
        let rows: Vec<HistoryRow<Codelist>> = state
            .codelist_history
            .iter()
            .filter(|row| row.row.component_id == component_id)
            .cloned()
            .collect();
        crate::model::latest_surviving_at(&rows, crate::model::cutoff_now(), |c: &Codelist| c.id)
            .into_iter()
            .map(|row| row.row.clone())
            .next()
    }

    fn surviving_codes(state: &State, codelist_id: Id) -> Vec<Code> {
        let rows: Vec<HistoryRow<Code>> = state
            .code_history
            .iter()
            .filter(|row| row.row.codelist_id == codelist_id)
            .cloned()
            .collect();
        crate::model::latest_surviving_at(&rows, crate::model::cutoff_now(), |c: &Code| c.id)
            .into_iter()
            .map(|row| row.row.clone())
            .collect()
    }

    fn surviving_attributes(state: &State, concept_id: Id) -> Vec<ConceptCodeAttribute> {
        let rows: Vec<HistoryRow<ConceptCodeAttribute>> = state
            .attribute_history
            .iter()
            .filter(|row| row.row.concept_id == concept_id)
            .cloned()
            .collect();
        crate::model::latest_surviving_at(&rows, crate::model::cutoff_now(), |a: &ConceptCodeAttribute| a.id)
            .into_iter()
            .map(|row| row.row.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl CodingSystemStore for MemoryStore {
    async fn get_coding_system(&self, id: Id) -> Result<Option<CodingSystem>> {
        Ok(self.state.read().coding_systems.get(&id).cloned())
    }

    async fn list_coding_systems(&self) -> Result<Vec<CodingSystem>> {
        Ok(self.state.read().coding_systems.values().cloned().collect())
    }

    async fn upsert_coding_system(&self, coding_system: CodingSystem) -> Result<()> {
        self.state
            .write()
            .coding_systems
            .insert(coding_system.id, coding_system);
        Ok(())
    }
}

#[async_trait::async_trait]
impl OntologyStore for MemoryStore {
    async fn get_ontology_node(&self, id: Id) -> Result<Option<OntologyNode>> {
        Ok(self.state.read().ontology.get(&id).cloned())
    }

    async fn list_ontology_nodes(&self, type_id: Id) -> Result<Vec<OntologyNode>> {
        Ok(self
            .state
            .read()
            .ontology
            .values()
            .filter(|n| n.type_id == type_id)
            .cloned()
            .collect())
    }

    async fn list_ontology_type_ids(&self) -> Result<Vec<Id>> {
        let mut ids: Vec<Id> = self
            .state
            .read()
            .ontology
            .values()
            .map(|n| n.type_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn upsert_ontology_node(&self, mut node: OntologyNode) -> Result<()> {
        node.refresh_search_vector();
        let mut state = self.state.write();
        // Keep edges bidirectional.
        let node_id = node.id;
        for parent_id in node.parents.clone() {
            if let Some(parent) = state.ontology.get_mut(&parent_id) {
                if !parent.children.contains(&node_id) {
                    parent.children.push(node_id);
                }
            }
        }
        for child_id in node.children.clone() {
            if let Some(child) = state.ontology.get_mut(&child_id) {
                if !child.parents.contains(&node_id) {
                    child.parents.push(node_id);
                }
            }
        }
        state.ontology.insert(node_id, node);
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaxonomyStore for MemoryStore {
    async fn get_tag(&self, id: Id) -> Result<Option<Tag>> {
        Ok(self.state.read().tags.get(&id).cloned())
    }

    async fn list_tags(&self, tag_type: Option<TagType>) -> Result<Vec<Tag>> {
        Ok(self
            .state
            .read()
            .tags
            .values()
            .filter(|t| tag_type.map(|tt| t.tag_type == tt).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn upsert_tag(&self, tag: Tag) -> Result<()> {
        self.state.write().tags.insert(tag.id, tag);
        Ok(())
    }

    async fn get_brand(&self, id: Id) -> Result<Option<crate::model::Brand>> {
        Ok(self.state.read().brands.get(&id).cloned())
    }

    async fn get_brand_by_name(&self, name: &str) -> Result<Option<crate::model::Brand>> {
        Ok(self
            .state
            .read()
            .brands
            .values()
            .find(|b| b.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn list_brands(&self) -> Result<Vec<crate::model::Brand>> {
        Ok(self.state.read().brands.values().cloned().collect())
    }

    async fn upsert_brand(&self, brand: crate::model::Brand) -> Result<()> {
        self.state.write().brands.insert(brand.id, brand);
        Ok(())
    }

    async fn get_data_source(&self, id: Id) -> Result<Option<DataSource>> {
        Ok(self.state.read().data_sources.get(&id).cloned())
    }

    async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        Ok(self.state.read().data_sources.values().cloned().collect())
    }

    async fn upsert_data_source(&self, data_source: DataSource) -> Result<()> {
        self.state
            .write()
            .data_sources
            .insert(data_source.id, data_source);
        Ok(())
    }

    async fn get_group(&self, id: Id) -> Result<Option<Group>> {
        Ok(self.state.read().groups.get(&id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        Ok(self.state.read().groups.values().cloned().collect())
    }

    async fn upsert_group(&self, group: Group) -> Result<()> {
        self.state.write().groups.insert(group.id, group);
        Ok(())
    }
}

#[async_trait::async_trait]
impl TemplateStore for MemoryStore {
    async fn get_template(&self, id: Id) -> Result<Option<Template>> {
        Ok(self.state.read().templates.get(&id).cloned())
    }

    async fn get_template_version(&self, id: Id, version: i32) -> Result<Option<Template>> {
        let state = self.state.read();
        let row = state
            .template_history
            .iter()
            .rev()
            .find(|row| row.row.id == id && row.row.template_version == version);
        Ok(row.map(|r| r.row.clone()))
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        Ok(self.state.read().templates.values().cloned().collect())
    }

    async fn list_template_history(&self, id: Id) -> Result<Vec<HistoryRow<Template>>> {
        Ok(self
            .state
            .read()
            .template_history
            .iter()
            .filter(|row| row.row.id == id)
            .cloned()
            .collect())
    }

    async fn save_template(&self, mut template: Template, user: &str) -> Result<(Id, HistoryId)> {
        let mut state = self.state.write();
        let is_new = template.id == 0 || !state.templates.contains_key(&template.id);
        if template.id == 0 {
            state.counters.template += 1;
            template.id = state.counters.template;
        }
        template.updated_by = user.to_string();
        template.updated_at = Utc::now();
        let history_id = state.counters.next_history();
        let history_type = if is_new {
            HistoryType::Created
        } else {
            HistoryType::Changed
        };
        state.template_history.push(HistoryRow::new(
            history_id,
            history_type,
            Some(user.to_string()),
            template.clone(),
        ));
        let id = template.id;
        state.templates.insert(id, template);
        Ok((id, history_id))
    }
}

#[async_trait::async_trait]
impl ConceptStore for MemoryStore {
    async fn get_concept(&self, id: Id) -> Result<Option<Concept>> {
        Ok(self.state.read().concepts.get(&id).cloned())
    }

    async fn get_concept_version(
        &self,
        id: Id,
        history_id: HistoryId,
    ) -> Result<Option<HistoryRow<Concept>>> {
        Ok(self
            .state
            .read()
            .concept_history
            .iter()
            .find(|row| row.row.id == id && row.history_id == history_id)
            .cloned())
    }

    async fn latest_concept_version_id(&self, id: Id) -> Result<Option<HistoryId>> {
        Ok(self
            .state
            .read()
            .concept_history
            .iter()
            .filter(|row| row.row.id == id)
            .map(|row| row.history_id)
            .max())
    }

    async fn list_concepts(&self) -> Result<Vec<Concept>> {
        Ok(self.state.read().concepts.values().cloned().collect())
    }

    async fn list_concept_history(&self, id: Id) -> Result<Vec<HistoryRow<Concept>>> {
        Ok(self
            .state
            .read()
            .concept_history
            .iter()
            .filter(|row| row.row.id == id)
            .cloned()
            .collect())
    }

    async fn component_history_for_concept(
        &self,
        concept_id: Id,
    ) -> Result<Vec<HistoryRow<Component>>> {
        Ok(self
            .state
            .read()
            .component_history
            .iter()
            .filter(|row| row.row.concept_id == concept_id)
            .cloned()
            .collect())
    }

    async fn codelist_history_for_component(
        &self,
        component_id: Id,
    ) -> Result<Vec<HistoryRow<Codelist>>> {
        Ok(self
            .state
            .read()
            .codelist_history
            .iter()
            .filter(|row| row.row.component_id == component_id)
            .cloned()
            .collect())
    }

    async fn code_history_for_codelist(&self, codelist_id: Id) -> Result<Vec<HistoryRow<Code>>> {
        Ok(self
            .state
            .read()
            .code_history
            .iter()
            .filter(|row| row.row.codelist_id == codelist_id)
            .cloned()
            .collect())
    }

    async fn attribute_history_for_concept(
        &self,
        concept_id: Id,
    ) -> Result<Vec<HistoryRow<ConceptCodeAttribute>>> {
        Ok(self
            .state
            .read()
            .attribute_history
            .iter()
            .filter(|row| row.row.concept_id == concept_id)
            .cloned()
            .collect())
    }

    async fn save_concept_tree(&self, save: ConceptSave, user: &str) -> Result<(Id, HistoryId)> {
        let mut state = self.state.write();
        let now = Utc::now();

        let (concept_id, is_new, created_by, created_at, was_deleted) = match save.id {
            Some(id) => {
                let existing = state
                    .concepts
                    .get(&id)
                    .ok_or_else(|| anyhow!("concept {} does not exist", id))?;
                (
                    id,
                    false,
                    existing.created_by.clone(),
                    existing.created_at,
                    existing.is_deleted,
                )
            }
            None => {
                state.counters.concept += 1;
                (state.counters.concept, true, user.to_string(), now, false)
            }
        };
        if was_deleted {
            return Err(anyhow!("concept {} is deleted", concept_id));
        }

        // Children first: every child row must pre-date the concept row.
        let existing_components = Self::latest_component_rows(&state, concept_id);
        let submitted_ids: Vec<Id> = save.components.iter().filter_map(|c| c.id).collect();

        for stale in existing_components
            .iter()
            .filter(|c| !submitted_ids.contains(&c.id))
        {
            let history_id = state.counters.next_history();
            state.component_history.push(HistoryRow::new(
                history_id,
                HistoryType::Deleted,
                Some(user.to_string()),
                stale.clone(),
            ));
        }

        for component_save in &save.components {
            let (component_id, component_type) = match component_save.id {
                Some(id) => {
                    if !existing_components.iter().any(|c| c.id == id) {
                        return Err(anyhow!(
                            "component {} does not belong to concept {}",
                            id,
                            concept_id
                        ));
                    }
                    (id, HistoryType::Changed)
                }
                None => {
                    state.counters.component += 1;
                    (state.counters.component, HistoryType::Created)
                }
            };

            let component = Component {
                id: component_id,
                concept_id,
                name: component_save.name.clone(),
                logical_type: component_save.logical_type,
                source_type: component_save.source_type,
                source: component_save.source.clone(),
                concept_ref: component_save.concept_ref,
            };
            let history_id = state.counters.next_history();
            state.component_history.push(HistoryRow::new(
                history_id,
                component_type,
                Some(user.to_string()),
                component,
            ));

            let codelist = match Self::codelist_for_component(&state, component_id) {
                Some(codelist) => codelist,
                None => {
                    state.counters.codelist += 1;
                    let codelist = Codelist {
                        id: state.counters.codelist,
                        component_id,
                        description: component_save.name.clone(),
                    };
                    let history_id = state.counters.next_history();
                    state.codelist_history.push(HistoryRow::new(
                        history_id,
                        HistoryType::Created,
                        Some(user.to_string()),
                        codelist.clone(),
                    ));
                    codelist
                }
            };

            let existing_codes = Self::surviving_codes(&state, codelist.id);
            let submitted_code_ids: Vec<Id> =
                component_save.codes.iter().filter_map(|c| c.id).collect();
            for stale in existing_codes
                .iter()
                .filter(|c| !submitted_code_ids.contains(&c.id))
            {
                let history_id = state.counters.next_history();
                state.code_history.push(HistoryRow::new(
                    history_id,
                    HistoryType::Deleted,
                    Some(user.to_string()),
                    stale.clone(),
                ));
            }
            for code_save in &component_save.codes {
                let (code_id, code_type) = match code_save.id {
                    Some(id) => (id, HistoryType::Changed),
                    None => {
                        state.counters.code += 1;
                        (state.counters.code, HistoryType::Created)
                    }
                };
                let unchanged = existing_codes.iter().any(|c| {
                    c.id == code_id && c.code == code_save.code && c.description == code_save.description
                });
                if unchanged && code_save.id.is_some() {
                    continue;
                }
                let history_id = state.counters.next_history();
                state.code_history.push(HistoryRow::new(
                    history_id,
                    code_type,
                    Some(user.to_string()),
                    Code {
                        id: code_id,
                        codelist_id: codelist.id,
                        code: code_save.code.clone(),
                        description: code_save.description.clone(),
                    },
                ));
            }
        }

        // Attribute rows are rewritten wholesale as well.
        let existing_attributes = Self::surviving_attributes(&state, concept_id);
        for stale in existing_attributes
            .iter()
            .filter(|a| !save.attributes.iter().any(|(code, _)| *code == a.code))
        {
            let history_id = state.counters.next_history();
            state.attribute_history.push(HistoryRow::new(
                history_id,
                HistoryType::Deleted,
                Some(user.to_string()),
                stale.clone(),
            ));
        }
        for (code, values) in &save.attributes {
            let existing = existing_attributes.iter().find(|a| a.code == *code);
            if let Some(existing) = existing {
                if existing.attributes == *values {
                    continue;
                }
            }
            let (attribute_id, attribute_type) = match existing {
                Some(a) => (a.id, HistoryType::Changed),
                None => {
                    state.counters.attribute += 1;
                    (state.counters.attribute, HistoryType::Created)
                }
            };
            let history_id = state.counters.next_history();
            state.attribute_history.push(HistoryRow::new(
                history_id,
                attribute_type,
                Some(user.to_string()),
                ConceptCodeAttribute {
                    id: attribute_id,
                    concept_id,
                    code: code.clone(),
                    attributes: values.clone(),
                },
            ));
        }

        let concept = Concept {
            id: concept_id,
            name: save.name.clone(),
            coding_system_id: save.coding_system_id,
            code_attribute_header: save.code_attribute_header.clone(),
            owner_id: save.owner_id.clone(),
            group_id: save.group_id,
            owner_access: save.owner_access,
            group_access: save.group_access,
            world_access: save.world_access,
            phenotype_owner_id: save.phenotype_owner_id.clone(),
            is_deleted: false,
            created_by,
            created_at,
            updated_by: user.to_string(),
            updated_at: now,
        };
        let history_id = state.counters.next_history();
        let history_type = if is_new {
            HistoryType::Created
        } else {
            HistoryType::Changed
        };
        state.concept_history.push(HistoryRow::new(
            history_id,
            history_type,
            Some(user.to_string()),
            concept.clone(),
        ));
        state.concepts.insert(concept_id, concept);

        Ok((concept_id, history_id))
    }

    async fn delete_concept(&self, id: Id, user: &str) -> Result<HistoryId> {
        let mut state = self.state.write();
        let mut concept = state
            .concepts
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("concept {} does not exist", id))?;
        concept.is_deleted = true;
        concept.updated_by = user.to_string();
        concept.updated_at = Utc::now();
        let history_id = state.counters.next_history();
        state.concept_history.push(HistoryRow::new(
            history_id,
            HistoryType::Deleted,
            Some(user.to_string()),
            concept.clone(),
        ));
        state.concepts.insert(id, concept);
        Ok(history_id)
    }
}

#[async_trait::async_trait]
impl EntityStore for MemoryStore {
    async fn get_entity_class(&self, prefix: &str) -> Result<Option<EntityClass>> {
        Ok(self
            .state
            .read()
            .entity_classes
            .values()
            .find(|c| c.entity_prefix.eq_ignore_ascii_case(prefix))
            .cloned())
    }

    async fn list_entity_classes(&self) -> Result<Vec<EntityClass>> {
        Ok(self.state.read().entity_classes.values().cloned().collect())
    }

    async fn upsert_entity_class(&self, class: EntityClass) -> Result<()> {
        let mut state = self.state.write();
        let clash = state
            .entity_classes
            .values()
            .any(|c| c.id != class.id && c.entity_prefix.eq_ignore_ascii_case(&class.entity_prefix));
        if clash {
            return Err(anyhow!(
                "entity prefix '{}' is already taken",
                class.entity_prefix
            ));
        }
        state.entity_classes.insert(class.id, class);
        Ok(())
    }

    async fn allocate_public_id(&self, prefix: &str) -> Result<PublicId> {
        let mut state = self.state.write();
        let class = state
            .entity_classes
            .values_mut()
            .find(|c| c.entity_prefix.eq_ignore_ascii_case(prefix))
            .ok_or_else(|| anyhow!("no entity class with prefix '{}'", prefix))?;
        class.entity_count += 1;
        Ok(PublicId::new(&class.entity_prefix, class.entity_count))
    }

    async fn create_entity(&self, mut entity: GenericEntity) -> Result<(PublicId, HistoryId)> {
        let mut state = self.state.write();
        let key = (entity.public_id.prefix.clone(), entity.public_id.entity_id);
        if state.entities.contains_key(&key) {
            return Err(anyhow!("entity {} already exists", entity.public_id));
        }
        let public_id = entity.public_id.clone();
        entity.publish_status = None;
        let history_id = state.counters.next_history();
        state.entity_history.push(HistoryRow::new(
            history_id,
            HistoryType::Created,
            Some(entity.created_by.clone()),
            entity.clone(),
        ));
        state.entities.insert(key, entity);
        Ok((public_id, history_id))
    }

    async fn update_entity(&self, entity: GenericEntity) -> Result<HistoryId> {
        let mut state = self.state.write();
        let key = (entity.public_id.prefix.clone(), entity.public_id.entity_id);
        if !state.entities.contains_key(&key) {
            return Err(anyhow!("entity {} does not exist", entity.public_id));
        }
        let history_id = state.counters.next_history();
        let history_type = if entity.is_deleted {
            HistoryType::Deleted
        } else {
            HistoryType::Changed
        };
        state.entity_history.push(HistoryRow::new(
            history_id,
            history_type,
            Some(entity.updated_by.clone()),
            entity.clone(),
        ));
        state.entities.insert(key, entity);
        Ok(history_id)
    }

    async fn get_entity(&self, public_id: &PublicId) -> Result<Option<GenericEntity>> {
        Ok(self
            .state
            .read()
            .entities
            .get(&(public_id.prefix.clone(), public_id.entity_id))
            .cloned())
    }

    async fn get_entity_version(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
    ) -> Result<Option<HistoryRow<GenericEntity>>> {
        Ok(self
            .state
            .read()
            .entity_history
            .iter()
            .find(|row| row.row.public_id == *public_id && row.history_id == history_id)
            .cloned())
    }

    async fn latest_entity_version_id(&self, public_id: &PublicId) -> Result<Option<HistoryId>> {
        Ok(self
            .state
            .read()
            .entity_history
            .iter()
            .filter(|row| row.row.public_id == *public_id)
            .map(|row| row.history_id)
            .max())
    }

    async fn list_entity_history(
        &self,
        public_id: &PublicId,
    ) -> Result<Vec<HistoryRow<GenericEntity>>> {
        Ok(self
            .state
            .read()
            .entity_history
            .iter()
            .filter(|row| row.row.public_id == *public_id)
            .cloned()
            .collect())
    }

    async fn list_entities(&self) -> Result<Vec<GenericEntity>> {
        let mut entities: Vec<GenericEntity> =
            self.state.read().entities.values().cloned().collect();
        entities.sort_by_key(|e| e.natural_order_key());
        Ok(entities)
    }

    async fn list_entities_for_template(
        &self,
        template_id: Id,
        template_version: Option<i32>,
    ) -> Result<Vec<HistoryRow<GenericEntity>>> {
        Ok(self
            .state
            .read()
            .entity_history
            .iter()
            .filter(|row| {
                row.row.template_id == template_id
                    && template_version
                        .map(|v| row.row.template_version == v)
                        .unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl PublicationStore for MemoryStore {
    async fn publication_records(&self, public_id: &PublicId) -> Result<Vec<PublishedRecord>> {
        Ok(self
            .state
            .read()
            .publications
            .iter()
            .filter(|r| r.entity_prefix == public_id.prefix && r.entity_id == public_id.entity_id)
            .cloned()
            .collect())
    }

    async fn latest_publication_record(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
    ) -> Result<Option<PublishedRecord>> {
        Ok(self
            .state
            .read()
            .publications
            .iter()
            .filter(|r| {
                r.entity_prefix == public_id.prefix
                    && r.entity_id == public_id.entity_id
                    && r.entity_history_id == history_id
            })
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn set_publication(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
        status: ApprovalStatus,
        moderator_id: Option<&str>,
        actor: &str,
    ) -> Result<PublishedRecord> {
        let mut state = self.state.write();
        let now = Utc::now();
        state.counters.publication += 1;
        let record = PublishedRecord {
            id: state.counters.publication,
            entity_prefix: public_id.prefix.clone(),
            entity_id: public_id.entity_id,
            entity_history_id: history_id,
            approval_status: status,
            moderator_id: moderator_id.map(|m| m.to_string()),
            created_by: actor.to_string(),
            created_at: now,
            modified_at: now,
        };
        state.publications.push(record.clone());

        // Denormalise onto the historic row and, when this is the latest
        // version, onto the live entity as well.
        for row in state
            .entity_history
            .iter_mut()
            .filter(|row| row.row.public_id == *public_id && row.history_id == history_id)
        {
            row.row.publish_status = Some(status);
        }
        let latest = state
            .entity_history
            .iter()
            .filter(|row| row.row.public_id == *public_id)
            .map(|row| row.history_id)
            .max();
        if latest == Some(history_id) {
            if let Some(entity) = state
                .entities
                .get_mut(&(public_id.prefix.clone(), public_id.entity_id))
            {
                entity.publish_status = Some(status);
            }
        }
        Ok(record)
    }
}

impl Store for MemoryStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessLevel, CodeSave, ComponentSave, LogicalType, SourceType};

    fn concept_save(name: &str, codes: &[&str]) -> ConceptSave {
        ConceptSave {
            id: None,
            name: name.to_string(),
            coding_system_id: 1,
            code_attribute_header: Vec::new(),
            owner_id: "alice".to_string(),
            group_id: None,
            owner_access: AccessLevel::Edit,
            group_access: AccessLevel::None,
            world_access: AccessLevel::None,
            phenotype_owner_id: None,
            components: vec![ComponentSave {
                id: None,
                name: "codes".to_string(),
                logical_type: LogicalType::Include,
                source_type: SourceType::SelectImport,
                source: None,
                concept_ref: None,
                codes: codes
                    .iter()
                    .map(|c| CodeSave {
                        id: None,
                        code: c.to_string(),
                        description: format!("{c} description"),
                    })
                    .collect(),
            }],
            attributes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn concept_tree_save_appends_history_rows() {
        let store = MemoryStore::new();
        let (concept_id, v1) = store
            .save_concept_tree(concept_save("HTN", &["I10", "I11"]), "alice")
            .await
            .unwrap();

        let components = store.component_history_for_concept(concept_id).await.unwrap();
        assert_eq!(components.len(), 1);
        let codelists = store
            .codelist_history_for_component(components[0].row.id)
            .await
            .unwrap();
        assert_eq!(codelists.len(), 1);
        let codes = store
            .code_history_for_codelist(codelists[0].row.id)
            .await
            .unwrap();
        assert_eq!(codes.len(), 2);
        // Children pre-date the concept row.
        assert!(codes.iter().all(|c| c.history_id < v1));
    }

    #[tokio::test]
    async fn entity_id_allocation_is_sequential() {
        let store = MemoryStore::new();
        store
            .upsert_entity_class(EntityClass {
                id: 1,
                name: "Phenotype".to_string(),
                entity_prefix: "PH".to_string(),
                entity_count: 10,
                description: None,
            })
            .await
            .unwrap();

        let mut first = sample_entity();
        first.public_id = store.allocate_public_id("PH").await.unwrap();
        let mut second = sample_entity();
        second.public_id = store.allocate_public_id("PH").await.unwrap();

        let (id_a, _) = store.create_entity(first).await.unwrap();
        let (id_b, _) = store.create_entity(second).await.unwrap();
        assert_eq!(id_a.to_string(), "PH11");
        assert_eq!(id_b.to_string(), "PH12");

        // Re-using an allocated id is rejected.
        let mut dup = sample_entity();
        dup.public_id = PublicId::new("PH", 11);
        assert!(store.create_entity(dup).await.is_err());
    }

    #[tokio::test]
    async fn prefix_clash_is_rejected() {
        let store = MemoryStore::new();
        store
            .upsert_entity_class(EntityClass {
                id: 1,
                name: "Phenotype".to_string(),
                entity_prefix: "PH".to_string(),
                entity_count: 0,
                description: None,
            })
            .await
            .unwrap();
        let result = store
            .upsert_entity_class(EntityClass {
                id: 2,
                name: "Other".to_string(),
                entity_prefix: "ph".to_string(),
                entity_count: 0,
                description: None,
            })
            .await;
        assert!(result.is_err());
    }

    fn sample_entity() -> GenericEntity {
        let now = Utc::now();
        GenericEntity {
            public_id: PublicId::new("PH", 0),
            entity_class_id: 1,
            name: "Hypertension".to_string(),
            author: Some("alice".to_string()),
            definition: None,
            implementation: None,
            validation: None,
            publications: Vec::new(),
            tags: Vec::new(),
            collections: Vec::new(),
            citation_requirements: None,
            internal_comments: None,
            template_id: 1,
            template_version: 1,
            template_data: serde_json::json!({}),
            brands: Vec::new(),
            owner_id: "alice".to_string(),
            group_id: None,
            owner_access: AccessLevel::Edit,
            group_access: AccessLevel::None,
            world_access: AccessLevel::None,
            is_deleted: false,
            publish_status: None,
            created_by: "alice".to_string(),
            created_at: now,
            updated_by: "alice".to_string(),
            updated_at: now,
        }
    }
}
