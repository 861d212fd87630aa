use std::collections::BTreeSet;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::{
    AccessLevel, ApiError, CodeSave, ComponentSave, ConceptSave, FieldError, FieldType,
    GenericEntity, HistoryId, Id, LogicalType, PublicId, RequestContext, SourceType, Template,
};
use crate::store::traits::Store;

use super::field_types::coerce_value;
use super::permissions::{can_user_edit, can_user_edit_concept};
use super::template_schema::effective_definition;

pub const METHOD_CREATE: i32 = 1;
pub const METHOD_UPDATE: i32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRef {
    pub id: Id,
    pub version: i32,
}

/// Reference to the entity being updated, carrying the advisory
/// concurrent-edit token observed when the form was loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityRef {
    pub id: String,
    #[serde(default)]
    pub version_id: Option<HistoryId>,
    /// Override a stale `version_id` after explicit confirmation.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionPayload {
    pub method: Option<i32>,
    pub template: Option<TemplateRef>,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct SavedEntity {
    pub public_id: PublicId,
    pub history_id: HistoryId,
}

/// One child concept of a submission, in the wire shape the form posts.
#[derive(Debug, Clone, Deserialize)]
struct ChildConceptPayload {
    #[serde(default)]
    is_new: bool,
    #[serde(default)]
    is_dirty: bool,
    concept_id: Option<Id>,
    concept_history_id: Option<HistoryId>,
    #[serde(default)]
    details: ChildDetails,
    #[serde(default)]
    components: Vec<ChildComponent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChildDetails {
    #[serde(default)]
    name: String,
    coding_system: Option<Id>,
    #[serde(default)]
    code_attribute_header: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChildComponent {
    #[serde(default)]
    is_new: bool,
    id: Option<Id>,
    name: String,
    logical_type: LogicalType,
    source_type: SourceType,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    codes: Vec<ChildCode>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChildCode {
    #[serde(default)]
    is_new: bool,
    id: Option<Id>,
    code: String,
    #[serde(default)]
    description: String,
}

/// The staged create/update pipeline: method, template, entity and edit
/// rights, per-field coercion, child concept materialisation, persist.
/// Everything is validated before the first write, so a failed submission
/// leaves no partial state behind.
pub async fn submit_entity<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    payload: SubmissionPayload,
) -> Result<SavedEntity, ApiError> {
    if !ctx.user.is_authenticated() {
        return Err(ApiError::Unauthenticated);
    }

    let method = match payload.method {
        Some(METHOD_CREATE) => METHOD_CREATE,
        Some(METHOD_UPDATE) => METHOD_UPDATE,
        _ => return Err(ApiError::validation("method", "method must be 1 or 2")),
    };

    let template_ref = payload
        .template
        .as_ref()
        .ok_or_else(|| ApiError::validation("template", "template reference is missing"))?;
    let template = store
        .get_template_version(template_ref.id, template_ref.version)
        .await?
        .ok_or_else(|| ApiError::validation("template", "unknown template version"))?;

    let existing = resolve_existing(store, ctx, method, payload.entity.as_ref()).await?;

    let data = payload
        .data
        .as_object()
        .cloned()
        .ok_or_else(|| ApiError::validation("data", "expected an object"))?;

    let mut errors: Vec<FieldError> = Vec::new();
    let (metadata, mut template_data) = validate_fields(&template, &data, &mut errors);

    if let Some(group_value) = data.get("group").filter(|v| !v.is_null()) {
        match group_value.as_i64() {
            Some(group_id) if ctx.user.is_superuser || ctx.user.is_member_of(group_id) => {}
            Some(_) => errors.push(FieldError::new("group", "not a member of this group")),
            None => errors.push(FieldError::new("group", "expected a group id")),
        }
    }

    let children = parse_children(data.get("concept_information"), &mut errors);
    if !errors.is_empty() {
        return Err(ApiError::ValidationFailed(errors));
    }

    let public_id = match &existing {
        Some(entity) => entity.public_id.clone(),
        None => {
            let class_id = template.entity_class_id.ok_or_else(|| {
                ApiError::validation("template", "template is not bound to an entity class")
            })?;
            let prefix = store
                .list_entity_classes()
                .await?
                .into_iter()
                .find(|c| c.id == class_id)
                .map(|c| c.entity_prefix)
                .ok_or_else(|| {
                    ApiError::validation("template", "template's entity class does not exist")
                })?;
            store.allocate_public_id(&prefix).await?
        }
    };

    let materialised =
        materialise_children(store, ctx, &public_id, children, existing.as_ref()).await?;
    let coding_systems: BTreeSet<Id> = materialised.iter().map(|c| c.coding_system_id).collect();
    template_data.insert(
        "concept_information".to_string(),
        Value::Array(materialised.into_iter().map(|c| c.reference).collect()),
    );
    template_data.insert(
        "coding_system".to_string(),
        Value::from(coding_systems.into_iter().collect::<Vec<Id>>()),
    );

    let entity = build_entity(
        ctx,
        &template,
        &public_id,
        &metadata,
        &data,
        Value::Object(template_data),
        existing.as_ref(),
    );

    let history_id = match existing {
        Some(_) => store.update_entity(entity).await?,
        None => store.create_entity(entity).await?.1,
    };
    Ok(SavedEntity {
        public_id,
        history_id,
    })
}

async fn resolve_existing<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    method: i32,
    entity_ref: Option<&EntityRef>,
) -> Result<Option<GenericEntity>, ApiError> {
    if method == METHOD_CREATE {
        return Ok(None);
    }
    let entity_ref = entity_ref
        .ok_or_else(|| ApiError::validation("entity", "entity reference is missing"))?;
    let public_id = PublicId::parse(&entity_ref.id)?;
    let live = store
        .get_entity(&public_id)
        .await?
        .filter(|e| !e.is_deleted)
        .ok_or(ApiError::NotFound)?;
    if !can_user_edit(&ctx.user, &live, ctx.brand.as_ref()) {
        return Err(ApiError::Forbidden);
    }
    if let Some(observed) = entity_ref.version_id {
        let latest = store
            .latest_entity_version_id(&public_id)
            .await?
            .ok_or(ApiError::NotFound)?;
        if observed != latest && !entity_ref.force {
            return Err(ApiError::Conflict {
                expected: latest,
                found: observed,
            });
        }
    }
    Ok(Some(live))
}

/// Coerce every effective-schema field. Metadata values land on the fixed
/// columns, dynamic values in `template_data`; missing optional dynamic
/// fields are nulled explicitly so the payload shape is stable.
fn validate_fields(
    template: &Template,
    data: &Map<String, Value>,
    errors: &mut Vec<FieldError>,
) -> (Map<String, Value>, Map<String, Value>) {
    let mut metadata = Map::new();
    let mut dynamic = Map::new();

    for field in effective_definition(&template.definition) {
        match field.key.as_str() {
            // Audit fields are computed, never submitted.
            "created" | "updated" | "created_by" | "updated_by" | "template" => continue,
            _ => {}
        }
        if field.descriptor.field_type == FieldType::ClinicalConcept {
            continue;
        }
        let raw = data.get(&field.key).cloned().unwrap_or(Value::Null);
        match coerce_value(&field.descriptor, &raw) {
            Ok(value) => {
                if field.is_metadata {
                    metadata.insert(field.key, value);
                } else {
                    dynamic.insert(field.key, value);
                }
            }
            Err(err) => errors.push(err),
        }
    }
    (metadata, dynamic)
}

fn parse_children(
    raw: Option<&Value>,
    errors: &mut Vec<FieldError>,
) -> Vec<ChildConceptPayload> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Vec::new();
    };
    let children: Vec<ChildConceptPayload> = match serde_json::from_value(raw.clone()) {
        Ok(children) => children,
        Err(err) => {
            errors.push(FieldError::new(
                "concept_information",
                format!("malformed child concepts: {}", err),
            ));
            return Vec::new();
        }
    };
    for (idx, child) in children.iter().enumerate() {
        let needs_content = child.is_new || child.is_dirty;
        if needs_content && child.details.name.trim().is_empty() {
            errors.push(FieldError::new(
                "concept_information",
                format!("child {} is missing a name", idx),
            ));
        }
        if needs_content && child.details.coding_system.is_none() {
            errors.push(FieldError::new(
                "concept_information",
                format!("child {} is missing a coding system", idx),
            ));
        }
        if !needs_content && (child.concept_id.is_none() || child.concept_history_id.is_none()) {
            errors.push(FieldError::new(
                "concept_information",
                format!("child {} carries neither content nor a version reference", idx),
            ));
        }
    }
    children
}

struct MaterialisedChild {
    coding_system_id: Id,
    reference: Value,
}

/// An unchanged reference is kept as-is; a dirty child
/// the user owns is rewritten wholesale; anything else is created anew.
async fn materialise_children<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    owner: &PublicId,
    children: Vec<ChildConceptPayload>,
    existing: Option<&GenericEntity>,
) -> Result<Vec<MaterialisedChild>, ApiError> {
    let mut out = Vec::new();

    for (idx, child) in children.into_iter().enumerate() {
        if !child.is_new && !child.is_dirty {
            // Retained reference. The pinned version must exist.
            let (concept_id, version_id) = (
                child.concept_id.unwrap_or_default(),
                child.concept_history_id.unwrap_or_default(),
            );
            let row = store
                .get_concept_version(concept_id, version_id)
                .await?
                .ok_or_else(|| {
                    ApiError::validation(
                        "concept_information",
                        format!("child {} references an unknown concept version", idx),
                    )
                })?;
            out.push(MaterialisedChild {
                coding_system_id: row.row.coding_system_id,
                reference: reference_json(concept_id, version_id, &row.row.name),
            });
            continue;
        }

        // Only a concept the user can edit is updated in place.
        let update_id = match child.concept_id {
            Some(id) if !child.is_new => match store.get_concept(id).await? {
                Some(concept)
                    if can_user_edit_concept(store, &ctx.user, &concept, ctx.brand.as_ref())
                        .await? =>
                {
                    Some(id)
                }
                _ => None,
            },
            _ => None,
        };

        let coding_system_id = child.details.coding_system.unwrap_or_default();
        let save = ConceptSave {
            id: update_id,
            name: child.details.name.clone(),
            coding_system_id,
            code_attribute_header: child.details.code_attribute_header.clone(),
            owner_id: ctx.user.audit_id(),
            group_id: existing.and_then(|e| e.group_id),
            owner_access: AccessLevel::Edit,
            group_access: existing.map(|e| e.group_access).unwrap_or(AccessLevel::None),
            world_access: AccessLevel::None,
            phenotype_owner_id: Some(owner.clone()),
            components: child
                .components
                .iter()
                .map(|c| ComponentSave {
                    id: if c.is_new || update_id.is_none() { None } else { c.id },
                    name: c.name.clone(),
                    logical_type: c.logical_type,
                    source_type: c.source_type,
                    source: c.source.clone(),
                    concept_ref: None,
                    codes: c
                        .codes
                        .iter()
                        .map(|code| CodeSave {
                            id: if code.is_new || update_id.is_none() { None } else { code.id },
                            code: code.code.clone(),
                            description: code.description.clone(),
                        })
                        .collect(),
                })
                .collect(),
            attributes: Vec::new(),
        };
        let name = save.name.clone();
        let (concept_id, version_id) = store.save_concept_tree(save, &ctx.user.audit_id()).await?;
        out.push(MaterialisedChild {
            coding_system_id,
            reference: reference_json(concept_id, version_id, &name),
        });
    }
    Ok(out)
}

fn reference_json(concept_id: Id, version_id: HistoryId, name: &str) -> Value {
    serde_json::json!({
        "concept_id": concept_id,
        "concept_version_id": version_id,
        "name": name,
    })
}

fn build_entity(
    ctx: &RequestContext,
    template: &Template,
    public_id: &PublicId,
    metadata: &Map<String, Value>,
    data: &Map<String, Value>,
    template_data: Value,
    existing: Option<&GenericEntity>,
) -> GenericEntity {
    let now = Utc::now();
    let text = |key: &str| -> Option<String> {
        metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let ids = |key: &str| -> Vec<Id> {
        metadata
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default()
    };

    GenericEntity {
        public_id: public_id.clone(),
        entity_class_id: existing
            .map(|e| e.entity_class_id)
            .or(template.entity_class_id)
            .unwrap_or_default(),
        name: text("name").unwrap_or_default(),
        author: text("author"),
        definition: text("definition"),
        implementation: text("implementation"),
        validation: text("validation"),
        publications: metadata
            .get("publications")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        tags: ids("tags"),
        collections: ids("collections"),
        citation_requirements: text("citation_requirements"),
        internal_comments: data
            .get("internal_comments")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        template_id: template.id,
        template_version: template.template_version,
        template_data,
        brands: existing
            .map(|e| e.brands.clone())
            .or_else(|| ctx.brand.as_ref().map(|b| vec![b.id]))
            .unwrap_or_default(),
        owner_id: existing
            .map(|e| e.owner_id.clone())
            .unwrap_or_else(|| ctx.user.audit_id()),
        group_id: data
            .get("group")
            .and_then(|v| v.as_i64())
            .or_else(|| existing.and_then(|e| e.group_id)),
        owner_access: AccessLevel::Edit,
        group_access: access_from(data, "group_access")
            .or_else(|| existing.map(|e| e.group_access))
            .unwrap_or(AccessLevel::None),
        world_access: access_from(data, "world_access")
            .or_else(|| existing.map(|e| e.world_access))
            .unwrap_or(AccessLevel::None),
        is_deleted: false,
        // A fresh version has no publication record yet; the live status
        // only advances when a moderator decides on this version.
        publish_status: None,
        created_by: existing
            .map(|e| e.created_by.clone())
            .unwrap_or_else(|| ctx.user.audit_id()),
        created_at: existing.map(|e| e.created_at).unwrap_or(now),
        updated_by: ctx.user.audit_id(),
        updated_at: now,
    }
}

fn access_from(data: &Map<String, Value>, key: &str) -> Option<AccessLevel> {
    data.get(key)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityClass, FieldDef, TemplateDefinition, UserContext};
    use crate::store::memory::MemoryStore;
    use crate::store::traits::{ConceptStore, EntityStore, TemplateStore};
    use serde_json::json;

    async fn seed(store: &MemoryStore) -> TemplateRef {
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

        let definition = TemplateDefinition {
            fields: vec![
                FieldDef::new("concept_information", "Concepts", FieldType::ClinicalConcept),
                FieldDef::new("sex", "Sex", FieldType::Enum),
            ],
            ..TemplateDefinition::default()
        };
        let now = Utc::now();
        let (id, _) = store
            .save_template(
                Template {
                    id: 0,
                    name: "Clinical Phenotype".to_string(),
                    template_version: 1,
                    definition,
                    entity_class_id: Some(1),
                    created_by: "admin".to_string(),
                    created_at: now,
                    updated_by: "admin".to_string(),
                    updated_at: now,
                },
                "admin",
            )
            .await
            .unwrap();
        TemplateRef { id, version: 1 }
    }

    fn create_payload(template: &TemplateRef) -> SubmissionPayload {
        SubmissionPayload {
            method: Some(METHOD_CREATE),
            template: Some(template.clone()),
            entity: None,
            data: json!({
                "name": "Hypertension",
                "author": "Kuan et al.",
                "sex": 3,
                "concept_information": [{
                    "is_new": true,
                    "details": { "name": "HTN codes", "coding_system": 1 },
                    "components": [{
                        "is_new": true,
                        "name": "ICD-10 terms",
                        "logical_type": "INCLUDE",
                        "source_type": "select_import",
                        "codes": [
                            { "is_new": true, "code": "I10", "description": "Essential hypertension" },
                            { "is_new": true, "code": "I11", "description": "Hypertensive heart disease" }
                        ]
                    }]
                }]
            }),
        }
    }

    #[tokio::test]
    async fn create_materialises_children_and_injects_coding_systems() {
        let store = MemoryStore::new();
        let template = seed(&store).await;
        let ctx = RequestContext::new(UserContext::user("alice"), None);

        let saved = submit_entity(&store, &ctx, create_payload(&template))
            .await
            .unwrap();
        assert_eq!(saved.public_id.to_string(), "PH1");

        let entity = store.get_entity(&saved.public_id).await.unwrap().unwrap();
        assert_eq!(entity.name, "Hypertension");
        assert_eq!(entity.template_data["coding_system"], json!([1]));
        let refs = entity.concept_references();
        assert_eq!(refs.len(), 1);

        // The child carries the backlink to its phenotype owner.
        let concept = store.get_concept(refs[0].0).await.unwrap().unwrap();
        assert_eq!(concept.phenotype_owner_id, Some(saved.public_id.clone()));
        assert_eq!(concept.owner_id, "alice");
    }

    #[tokio::test]
    async fn dynamic_fields_are_nulled_when_absent() {
        let store = MemoryStore::new();
        let template = seed(&store).await;
        let ctx = RequestContext::new(UserContext::user("alice"), None);

        let mut payload = create_payload(&template);
        payload.data["sex"] = Value::Null;
        let saved = submit_entity(&store, &ctx, payload).await.unwrap();
        let entity = store.get_entity(&saved.public_id).await.unwrap().unwrap();
        assert!(entity.template_data.get("sex").unwrap().is_null());
    }

    #[tokio::test]
    async fn missing_method_and_name_fail_validation() {
        let store = MemoryStore::new();
        let template = seed(&store).await;
        let ctx = RequestContext::new(UserContext::user("alice"), None);

        let mut no_method = create_payload(&template);
        no_method.method = None;
        assert!(matches!(
            submit_entity(&store, &ctx, no_method).await,
            Err(ApiError::ValidationFailed(_))
        ));

        let mut no_name = create_payload(&template);
        no_name.data["name"] = Value::Null;
        let Err(ApiError::ValidationFailed(errors)) =
            submit_entity(&store, &ctx, no_name).await
        else {
            panic!("expected validation failure");
        };
        assert!(errors.iter().any(|e| e.field == "name"));
    }

    #[tokio::test]
    async fn anonymous_submissions_are_rejected() {
        let store = MemoryStore::new();
        let template = seed(&store).await;
        let ctx = RequestContext::anonymous();
        assert!(matches!(
            submit_entity(&store, &ctx, create_payload(&template)).await,
            Err(ApiError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn stale_version_conflicts_unless_forced() {
        let store = MemoryStore::new();
        let template = seed(&store).await;
        let ctx = RequestContext::new(UserContext::user("alice"), None);

        let saved = submit_entity(&store, &ctx, create_payload(&template))
            .await
            .unwrap();

        let update = |version_id: Option<HistoryId>, force: bool| {
            let mut payload = create_payload(&template);
            payload.method = Some(METHOD_UPDATE);
            payload.entity = Some(EntityRef {
                id: saved.public_id.to_string(),
                version_id,
                force,
            });
            // Keep the existing child untouched this time.
            let entity_refs = json!([{
                "is_new": false,
                "is_dirty": false,
                "concept_id": 1,
                "concept_history_id": saved.history_id - 1,
            }]);
            payload.data["concept_information"] = entity_refs;
            payload
        };

        // A fresh update against the observed latest version succeeds.
        let second = submit_entity(&store, &ctx, update(Some(saved.history_id), false))
            .await
            .unwrap();
        assert!(second.history_id > saved.history_id);

        // Repeating with the stale token conflicts, unless forced.
        assert!(matches!(
            submit_entity(&store, &ctx, update(Some(saved.history_id), false)).await,
            Err(ApiError::Conflict { .. })
        ));
        assert!(submit_entity(&store, &ctx, update(Some(saved.history_id), true))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn strangers_cannot_update() {
        let store = MemoryStore::new();
        let template = seed(&store).await;
        let alice = RequestContext::new(UserContext::user("alice"), None);
        let saved = submit_entity(&store, &alice, create_payload(&template))
            .await
            .unwrap();

        let mut payload = create_payload(&template);
        payload.method = Some(METHOD_UPDATE);
        payload.entity = Some(EntityRef {
            id: saved.public_id.to_string(),
            version_id: None,
            force: false,
        });
        let bob = RequestContext::new(UserContext::user("bob"), None);
        assert!(matches!(
            submit_entity(&store, &bob, payload).await,
            Err(ApiError::Forbidden)
        ));
    }
}
