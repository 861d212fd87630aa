use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::logic::{
    publish, search_concepts, search_entities, CodelistDeriver, ConceptSearchRequest,
    EntitySearchRequest, OrderBy, SearchPage,
};
use crate::logic::permissions::{can_user_view_concept, can_user_view_version};
use crate::logic::write_path::{submit_entity, SubmissionPayload};
use crate::model::{
    ApiError, ApprovalStatus, Concept, ConceptSummary, ConceptWithCodes, FieldError, GenericEntity, HistoryId,
    HistoryRow, Id, OntologyNodeSummary, PublicId, PublishBlocker, RequestContext, Tag, TagType,
    Template,
};
use crate::store::traits::Store;

pub type AppState<S> = Arc<S>;
pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// JSON body returned on every failure path.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<PublishBlocker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_version: Option<i64>,
}

impl ErrorResponse {
    fn message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            fields: Vec::new(),
            blockers: Vec::new(),
            expected_version: None,
            found_version: None,
        }
    }
}

pub fn fail(err: ApiError) -> (StatusCode, Json<ErrorResponse>) {
    let status = err.status_code();
    let body = match err {
        ApiError::ValidationFailed(fields) => ErrorResponse {
            fields,
            ..ErrorResponse::message("validation failed")
        },
        ApiError::PublicationBlocked(blockers) => ErrorResponse {
            blockers,
            ..ErrorResponse::message("publication blocked")
        },
        ApiError::Conflict { expected, found } => ErrorResponse {
            expected_version: Some(expected),
            found_version: Some(found),
            ..ErrorResponse::message("concurrent edit detected")
        },
        ApiError::Internal(err) => {
            log::error!("internal error: {:#}", err);
            ErrorResponse::message("internal server error")
        }
        other => ErrorResponse::message(other.to_string()),
    };
    (status, Json(body))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

pub async fn read_only_rejected() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse::message("service is in read-only mode")),
    )
}

// ---------------------------------------------------------------------------
// Phenotypes (generic entities)
// ---------------------------------------------------------------------------

/// Query keys with a fixed meaning; everything else is treated as a
/// filterable template field.
const RESERVED_QUERY_KEYS: [&str; 7] = [
    "template_id",
    "template_version_id",
    "search",
    "page",
    "page_size",
    "order_by",
    "descendants",
];

fn entity_search_request(params: HashMap<String, String>) -> EntitySearchRequest {
    let mut request = EntitySearchRequest {
        template_id: params.get("template_id").and_then(|v| v.parse().ok()),
        template_version: params
            .get("template_version_id")
            .and_then(|v| v.parse().ok()),
        search: params.get("search").cloned().filter(|s| !s.is_empty()),
        descendants: params
            .get("descendants")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        order_by: params
            .get("order_by")
            .map(|v| OrderBy::parse(v))
            .unwrap_or_default(),
        page: params.get("page").and_then(|v| v.parse().ok()).unwrap_or(1),
        page_size: params
            .get("page_size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(20),
        ..Default::default()
    };
    request.filters = params
        .into_iter()
        .filter(|(key, _)| !RESERVED_QUERY_KEYS.contains(&key.as_str()))
        .collect();
    request
}

pub async fn list_phenotypes<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<SearchPage<GenericEntity>> {
    let request = entity_search_request(params);
    let page = search_entities(store.as_ref(), &ctx, &request)
        .await
        .map_err(fail)?;
    Ok(Json(page))
}

async fn version_status<S: Store + ?Sized>(
    store: &S,
    public_id: &PublicId,
    history_id: HistoryId,
) -> Result<Option<ApprovalStatus>, ApiError> {
    Ok(store
        .latest_publication_record(public_id, history_id)
        .await?
        .map(|r| r.approval_status))
}

/// Load one entity version, enforcing view access. Inaccessible and
/// tombstoned versions surface as `NotFound`.
async fn viewable_version<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    public_id: &PublicId,
    history_id: HistoryId,
) -> Result<HistoryRow<GenericEntity>, ApiError> {
    let row = store
        .get_entity_version(public_id, history_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if row.history_type.is_delete() || row.row.is_deleted {
        return Err(ApiError::NotFound);
    }
    let status = version_status(store, public_id, history_id).await?;
    if !can_user_view_version(&ctx.user, &row.row, status, ctx.brand.as_ref()) {
        return Err(ApiError::NotFound);
    }
    Ok(row)
}

async fn latest_viewable<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    raw_id: &str,
) -> Result<HistoryRow<GenericEntity>, ApiError> {
    let public_id = PublicId::parse(raw_id)?;
    let mut history = store.list_entity_history(&public_id).await?;
    if history.is_empty() {
        return Err(ApiError::NotFound);
    }
    history.reverse();
    for row in history {
        if row.history_type.is_delete() || row.row.is_deleted {
            continue;
        }
        let status = version_status(store, &public_id, row.history_id).await?;
        if can_user_view_version(&ctx.user, &row.row, status, ctx.brand.as_ref()) {
            return Ok(row);
        }
    }
    Err(ApiError::NotFound)
}

pub async fn get_phenotype<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path(public_id): Path<String>,
) -> ApiResult<HistoryRow<GenericEntity>> {
    let row = latest_viewable(store.as_ref(), &ctx, &public_id)
        .await
        .map_err(fail)?;
    Ok(Json(row))
}

#[derive(Debug, Serialize)]
pub struct PhenotypeVersionResponse {
    #[serde(flatten)]
    pub version: HistoryRow<GenericEntity>,
    pub concepts: Vec<ConceptSummary>,
}

pub async fn get_phenotype_version<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path((public_id, history_id)): Path<(String, HistoryId)>,
) -> ApiResult<PhenotypeVersionResponse> {
    let public_id = PublicId::parse(&public_id).map_err(fail)?;
    let row = viewable_version(store.as_ref(), &ctx, &public_id, history_id)
        .await
        .map_err(fail)?;
    let mut concepts = Vec::new();
    for (concept_id, version_id) in row.row.concept_references() {
        concepts.push(
            CodelistDeriver::summarise(store.as_ref(), concept_id, Some(version_id))
                .await
                .map_err(fail)?,
        );
    }
    Ok(Json(PhenotypeVersionResponse {
        version: row,
        concepts,
    }))
}

/// One field of a version. `codes` is an alias for the aggregated
/// codelists of every referenced child concept.
pub async fn get_phenotype_field<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path((public_id, history_id, field)): Path<(String, HistoryId, String)>,
) -> ApiResult<serde_json::Value> {
    let public_id = PublicId::parse(&public_id).map_err(fail)?;
    let row = viewable_version(store.as_ref(), &ctx, &public_id, history_id)
        .await
        .map_err(fail)?;

    if field == "codes" {
        let mut derived: Vec<ConceptWithCodes> = Vec::new();
        for (concept_id, version_id) in row.row.concept_references() {
            let codes = CodelistDeriver::derive(store.as_ref(), concept_id, Some(version_id))
                .await
                .map_err(fail)?;
            derived.push(codes);
        }
        return serde_json::to_value(derived)
            .map(Json)
            .map_err(|e| fail(ApiError::Internal(e.into())));
    }

    let serialized = serde_json::to_value(&row.row)
        .map_err(|e| fail(ApiError::Internal(e.into())))?;
    let value = serialized
        .get(&field)
        .or_else(|| serialized.get("template_data").and_then(|d| d.get(&field)))
        .cloned()
        .ok_or_else(|| fail(ApiError::NotFound))?;
    Ok(Json(value))
}

#[derive(Debug, Serialize)]
pub struct VersionSummary {
    pub version_id: HistoryId,
    pub created: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_status: Option<ApprovalStatus>,
}

pub async fn list_phenotype_versions<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path(public_id): Path<String>,
) -> ApiResult<Vec<VersionSummary>> {
    let public_id = PublicId::parse(&public_id).map_err(fail)?;
    let history = store
        .list_entity_history(&public_id)
        .await
        .map_err(|e| fail(e.into()))?;
    if history.is_empty() {
        return Err(fail(ApiError::NotFound));
    }

    let mut versions = Vec::new();
    for row in history.into_iter().rev() {
        if row.history_type.is_delete() || row.row.is_deleted {
            continue;
        }
        let status = version_status(store.as_ref(), &public_id, row.history_id)
            .await
            .map_err(fail)?;
        if !can_user_view_version(&ctx.user, &row.row, status, ctx.brand.as_ref()) {
            continue;
        }
        versions.push(VersionSummary {
            version_id: row.history_id,
            created: row.history_date.to_rfc3339(),
            created_by: row.history_user.clone(),
            publish_status: status,
        });
    }
    if versions.is_empty() {
        return Err(fail(ApiError::NotFound));
    }
    Ok(Json(versions))
}

#[derive(Debug, Serialize)]
pub struct SavedEntityResponse {
    pub id: String,
    pub version_id: HistoryId,
}

pub async fn create_phenotype<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Json(payload): Json<SubmissionPayload>,
) -> Result<(StatusCode, Json<SavedEntityResponse>), (StatusCode, Json<ErrorResponse>)> {
    let saved = submit_entity(store.as_ref(), &ctx, payload)
        .await
        .map_err(fail)?;
    Ok((
        StatusCode::CREATED,
        Json(SavedEntityResponse {
            id: saved.public_id.to_string(),
            version_id: saved.history_id,
        }),
    ))
}

pub async fn update_phenotype<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Json(payload): Json<SubmissionPayload>,
) -> ApiResult<SavedEntityResponse> {
    let saved = submit_entity(store.as_ref(), &ctx, payload)
        .await
        .map_err(fail)?;
    Ok(Json(SavedEntityResponse {
        id: saved.public_id.to_string(),
        version_id: saved.history_id,
    }))
}

// ---------------------------------------------------------------------------
// Publication workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PublicationResponse {
    pub id: String,
    pub version_id: HistoryId,
    pub approval_status: ApprovalStatus,
}

fn publication_response(record: crate::model::PublishedRecord) -> PublicationResponse {
    PublicationResponse {
        id: format!("{}{}", record.entity_prefix, record.entity_id),
        version_id: record.entity_history_id,
        approval_status: record.approval_status,
    }
}

pub async fn request_publication<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path((public_id, history_id)): Path<(String, HistoryId)>,
) -> ApiResult<PublicationResponse> {
    let public_id = PublicId::parse(&public_id).map_err(fail)?;
    let record = publish::submit_for_publication(store.as_ref(), &ctx, &public_id, history_id)
        .await
        .map_err(fail)?;
    Ok(Json(publication_response(record)))
}

pub async fn mark_publication_pending<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path((public_id, history_id)): Path<(String, HistoryId)>,
) -> ApiResult<PublicationResponse> {
    let public_id = PublicId::parse(&public_id).map_err(fail)?;
    let record = publish::mark_pending(store.as_ref(), &ctx, &public_id, history_id)
        .await
        .map_err(fail)?;
    Ok(Json(publication_response(record)))
}

pub async fn approve_publication<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path((public_id, history_id)): Path<(String, HistoryId)>,
) -> ApiResult<PublicationResponse> {
    let public_id = PublicId::parse(&public_id).map_err(fail)?;
    let record = publish::approve(store.as_ref(), &ctx, &public_id, history_id)
        .await
        .map_err(fail)?;
    Ok(Json(publication_response(record)))
}

pub async fn reject_publication<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path((public_id, history_id)): Path<(String, HistoryId)>,
) -> ApiResult<PublicationResponse> {
    let public_id = PublicId::parse(&public_id).map_err(fail)?;
    let record = publish::reject(store.as_ref(), &ctx, &public_id, history_id)
        .await
        .map_err(fail)?;
    Ok(Json(publication_response(record)))
}

// ---------------------------------------------------------------------------
// Concepts
// ---------------------------------------------------------------------------

fn csv_ids(raw: Option<&String>) -> Option<Vec<Id>> {
    let raw = raw?;
    let ids: Vec<Id> = raw
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

pub async fn list_concepts<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<SearchPage<Concept>> {
    let request = ConceptSearchRequest {
        search: params.get("search").cloned().filter(|s| !s.is_empty()),
        coding_system: csv_ids(params.get("coding_system")),
        owner: params.get("owner").cloned(),
        phenotype_id: params.get("phenotype_id").cloned(),
        tags: csv_ids(params.get("tags")),
        collections: csv_ids(params.get("collections")),
        page: params.get("page").and_then(|v| v.parse().ok()).unwrap_or(1),
        page_size: params
            .get("page_size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(20),
    };
    let page = search_concepts(store.as_ref(), &ctx, &request)
        .await
        .map_err(fail)?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
pub struct ConceptDetailResponse {
    #[serde(flatten)]
    pub concept: Concept,
    pub latest_version_id: HistoryId,
    pub codes: Vec<crate::model::CodelistEntry>,
}

async fn load_viewable_concept<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    concept_id: Id,
) -> Result<Concept, ApiError> {
    let concept = store
        .get_concept(concept_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if concept.is_deleted {
        return Err(ApiError::NotFound);
    }
    if !can_user_view_concept(store, &ctx.user, &concept, ctx.brand.as_ref()).await? {
        return Err(ApiError::NotFound);
    }
    Ok(concept)
}

pub async fn get_concept<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path(concept_id): Path<Id>,
) -> ApiResult<ConceptDetailResponse> {
    let concept = load_viewable_concept(store.as_ref(), &ctx, concept_id)
        .await
        .map_err(fail)?;
    let derived = CodelistDeriver::derive(store.as_ref(), concept_id, None)
        .await
        .map_err(fail)?;
    Ok(Json(ConceptDetailResponse {
        concept,
        latest_version_id: derived.concept_version_id,
        codes: derived.codes,
    }))
}

#[derive(Debug, Serialize)]
pub struct RulesetCodes {
    #[serde(flatten)]
    pub component: crate::model::Component,
    pub codes: Vec<crate::model::CodelistEntry>,
}

#[derive(Debug, Serialize)]
pub struct ConceptVersionResponse {
    #[serde(flatten)]
    pub derived: ConceptWithCodes,
    pub components: Vec<RulesetCodes>,
}

pub async fn get_concept_version<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path((concept_id, history_id)): Path<(Id, HistoryId)>,
) -> ApiResult<ConceptVersionResponse> {
    load_viewable_concept(store.as_ref(), &ctx, concept_id)
        .await
        .map_err(fail)?;
    let derived = CodelistDeriver::derive(store.as_ref(), concept_id, Some(history_id))
        .await
        .map_err(fail)?;
    let components = CodelistDeriver::expand(store.as_ref(), concept_id, Some(history_id))
        .await
        .map_err(fail)?
        .into_iter()
        .map(|(component, codes)| RulesetCodes { component, codes })
        .collect();
    Ok(Json(ConceptVersionResponse {
        derived,
        components,
    }))
}

/// One row of the codelist export for a concept version.
#[derive(Debug, Serialize)]
pub struct CodeExportRow {
    pub code: String,
    pub description: String,
    pub coding_system: String,
    pub concept_id: Id,
    pub concept_version_id: HistoryId,
    pub concept_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<serde_json::Value>>,
}

pub async fn export_concept_codes<S: Store + 'static>(
    State(store): State<AppState<S>>,
    ctx: RequestContext,
    Path((concept_id, history_id)): Path<(Id, HistoryId)>,
) -> ApiResult<Vec<CodeExportRow>> {
    load_viewable_concept(store.as_ref(), &ctx, concept_id)
        .await
        .map_err(fail)?;
    let derived = CodelistDeriver::derive(store.as_ref(), concept_id, Some(history_id))
        .await
        .map_err(fail)?;
    let coding_system = store
        .get_coding_system(derived.coding_system_id)
        .await
        .map_err(|e| fail(e.into()))?
        .map(|cs| cs.name)
        .unwrap_or_default();

    let rows = derived
        .codes
        .into_iter()
        .map(|entry| CodeExportRow {
            code: entry.code,
            description: entry.description,
            coding_system: coding_system.clone(),
            concept_id,
            concept_version_id: derived.concept_version_id,
            concept_name: derived.name.clone(),
            attributes: entry.attributes,
        })
        .collect();
    Ok(Json(rows))
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

pub async fn list_templates<S: Store + 'static>(
    State(store): State<AppState<S>>,
) -> ApiResult<Vec<Template>> {
    let templates = store
        .list_templates()
        .await
        .map_err(|e| fail(e.into()))?;
    Ok(Json(templates))
}

pub async fn get_template<S: Store + 'static>(
    State(store): State<AppState<S>>,
    Path(template_id): Path<Id>,
) -> ApiResult<Template> {
    let template = store
        .get_template(template_id)
        .await
        .map_err(|e| fail(e.into()))?
        .ok_or_else(|| fail(ApiError::NotFound))?;
    Ok(Json(template))
}

pub async fn get_template_version<S: Store + 'static>(
    State(store): State<AppState<S>>,
    Path((template_id, version)): Path<(Id, i32)>,
) -> ApiResult<Template> {
    let template = store
        .get_template_version(template_id, version)
        .await
        .map_err(|e| fail(e.into()))?
        .ok_or_else(|| fail(ApiError::NotFound))?;
    Ok(Json(template))
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

pub async fn list_tags<S: Store + 'static>(
    State(store): State<AppState<S>>,
) -> ApiResult<Vec<Tag>> {
    let tags = store
        .list_tags(Some(TagType::Tag))
        .await
        .map_err(|e| fail(e.into()))?;
    Ok(Json(tags))
}

pub async fn list_collections<S: Store + 'static>(
    State(store): State<AppState<S>>,
) -> ApiResult<Vec<Tag>> {
    let collections = store
        .list_tags(Some(TagType::Collection))
        .await
        .map_err(|e| fail(e.into()))?;
    Ok(Json(collections))
}

async fn tag_of_type<S: Store + ?Sized>(
    store: &S,
    id: Id,
    tag_type: TagType,
) -> Result<Tag, ApiError> {
    let tag = store.get_tag(id).await?.ok_or(ApiError::NotFound)?;
    if tag.tag_type != tag_type {
        return Err(ApiError::NotFound);
    }
    Ok(tag)
}

pub async fn get_tag<S: Store + 'static>(
    State(store): State<AppState<S>>,
    Path(id): Path<Id>,
) -> ApiResult<Tag> {
    let tag = tag_of_type(store.as_ref(), id, TagType::Tag)
        .await
        .map_err(fail)?;
    Ok(Json(tag))
}

pub async fn get_collection<S: Store + 'static>(
    State(store): State<AppState<S>>,
    Path(id): Path<Id>,
) -> ApiResult<Tag> {
    let collection = tag_of_type(store.as_ref(), id, TagType::Collection)
        .await
        .map_err(fail)?;
    Ok(Json(collection))
}

// ---------------------------------------------------------------------------
// Ontology
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct OntologyGroupResponse {
    pub type_id: Id,
    pub roots: Vec<OntologyNodeSummary>,
}

pub async fn list_ontology_groups<S: Store + 'static>(
    State(store): State<AppState<S>>,
) -> ApiResult<Vec<OntologyGroupResponse>> {
    let type_ids = store
        .list_ontology_type_ids()
        .await
        .map_err(|e| fail(e.into()))?;
    let mut groups = Vec::new();
    for type_id in type_ids {
        let roots = crate::logic::ontology_ops::roots_of_type(store.as_ref(), type_id)
            .await
            .map_err(fail)?;
        groups.push(OntologyGroupResponse {
            type_id,
            roots: roots.iter().map(OntologyNodeSummary::from).collect(),
        });
    }
    Ok(Json(groups))
}

pub async fn get_ontology_group<S: Store + 'static>(
    State(store): State<AppState<S>>,
    Path(type_id): Path<Id>,
) -> ApiResult<OntologyGroupResponse> {
    let roots = crate::logic::ontology_ops::roots_of_type(store.as_ref(), type_id)
        .await
        .map_err(fail)?;
    if roots.is_empty() {
        return Err(fail(ApiError::NotFound));
    }
    Ok(Json(OntologyGroupResponse {
        type_id,
        roots: roots.iter().map(OntologyNodeSummary::from).collect(),
    }))
}

pub async fn get_ontology_node<S: Store + 'static>(
    State(store): State<AppState<S>>,
    Path((type_id, node_id)): Path<(Id, Id)>,
) -> ApiResult<crate::model::OntologyNode> {
    let node = store
        .get_ontology_node(node_id)
        .await
        .map_err(|e| fail(e.into()))?
        .filter(|node| node.type_id == type_id)
        .ok_or_else(|| fail(ApiError::NotFound))?;
    Ok(Json(node))
}
