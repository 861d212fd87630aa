use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    ApiError, Concept, FieldType, GenericEntity, Id, RequestContext, TemplateDefinition,
};
use crate::store::traits::Store;

use super::field_types::{parse_filter_values, value_matches, FilterValue};
use super::ontology_ops::expand_with_descendants;
use super::permissions::{can_user_view_concept, can_user_view_version};
use super::template_schema::effective_definition;

pub const PAGE_SIZES: [usize; 3] = [20, 50, 100];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    Relevance,
    CreatedAsc,
    CreatedDesc,
    UpdatedAsc,
    UpdatedDesc,
}

impl OrderBy {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "created" | "created_asc" => OrderBy::CreatedAsc,
            "created_desc" => OrderBy::CreatedDesc,
            "updated" | "updated_asc" => OrderBy::UpdatedAsc,
            "updated_desc" => OrderBy::UpdatedDesc,
            _ => OrderBy::Relevance,
        }
    }
}

/// A search/filter request over the entity library: metadata filters plus
/// template-dynamic filters keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct EntitySearchRequest {
    pub template_id: Option<Id>,
    pub template_version: Option<i32>,
    pub search: Option<String>,
    /// Raw CSV filter values keyed by (filterable) field name.
    pub filters: HashMap<String, String>,
    /// Expand ontology-backed int_array filters to descendants.
    pub descendants: bool,
    pub order_by: OrderBy,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage<T> {
    pub results: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total_count: usize,
}

/// Nearest admitted page size; requests outside {20, 50, 100} snap to the
/// smallest.
pub fn normalise_page_size(requested: usize) -> usize {
    if PAGE_SIZES.contains(&requested) {
        requested
    } else {
        PAGE_SIZES[0]
    }
}

/// Run the full pipeline: brand pre-filter, latest-accessible-version
/// resolution, field filters, full-text ranking, ordering, pagination.
pub async fn search_entities<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    request: &EntitySearchRequest,
) -> Result<SearchPage<GenericEntity>, ApiError> {
    let mut definitions: HashMap<(Id, i32), Option<TemplateDefinition>> = HashMap::new();
    let mut candidates: Vec<(GenericEntity, f64)> = Vec::new();

    for entity in store.list_entities().await? {
        if entity.is_deleted {
            continue;
        }
        if let Some(template_id) = request.template_id {
            if entity.template_id != template_id {
                continue;
            }
        }
        if let Some(template_version) = request.template_version {
            if entity.template_version != template_version {
                continue;
            }
        }
        if !brand_admits_listing(&entity, ctx) {
            continue;
        }
        let Some(version) = latest_accessible_version(store, ctx, &entity).await? else {
            continue;
        };

        let definition = cached_definition(store, &mut definitions, &version).await?;
        if !field_filters_match(store, request, &version, definition.as_ref()).await? {
            continue;
        }

        let score = match &request.search {
            Some(query) => {
                let score = rank(&version, query);
                if score <= 0.0 {
                    continue;
                }
                score
            }
            None => 0.0,
        };
        candidates.push((version, score));
    }

    order_candidates(&mut candidates, request.order_by);
    let results: Vec<GenericEntity> = candidates.into_iter().map(|(e, _)| e).collect();
    Ok(paginate(results, request.page, request.page_size))
}

/// The newest history row of an entity the user may view, walking history
/// from latest to oldest.
pub async fn latest_accessible_version<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    entity: &GenericEntity,
) -> Result<Option<GenericEntity>, ApiError> {
    let mut history = store.list_entity_history(&entity.public_id).await?;
    history.sort_by_key(|row| std::cmp::Reverse(row.history_id));
    for row in history {
        if row.history_type.is_delete() {
            continue;
        }
        let status = store
            .latest_publication_record(&entity.public_id, row.history_id)
            .await?
            .map(|r| r.approval_status);
        if can_user_view_version(&ctx.user, &row.row, status, ctx.brand.as_ref()) {
            return Ok(Some(row.row));
        }
    }
    Ok(None)
}

/// Brand pre-filter for list views. Without a brand everything passes;
/// with one, the entity must carry the brand, or satisfy the brand's
/// declared visibility rules (id whitelist, allow-null for untagged).
fn brand_admits_listing(entity: &GenericEntity, ctx: &RequestContext) -> bool {
    let Some(brand) = &ctx.brand else {
        return true;
    };
    if entity.brands.contains(&brand.id) {
        return true;
    }
    if let Some(ids) = &brand.visibility.ids {
        if entity.brands.iter().any(|b| ids.contains(b)) {
            return true;
        }
    }
    brand.visibility.allow_null && entity.brands.is_empty()
}

async fn cached_definition<S: Store + ?Sized>(
    store: &S,
    cache: &mut HashMap<(Id, i32), Option<TemplateDefinition>>,
    entity: &GenericEntity,
) -> Result<Option<TemplateDefinition>, ApiError> {
    let key = (entity.template_id, entity.template_version);
    if let Some(cached) = cache.get(&key) {
        return Ok(cached.clone());
    }
    let definition = store
        .get_template_version(key.0, key.1)
        .await?
        .map(|t| t.definition);
    cache.insert(key, definition.clone());
    Ok(definition)
}

async fn field_filters_match<S: Store + ?Sized>(
    store: &S,
    request: &EntitySearchRequest,
    entity: &GenericEntity,
    definition: Option<&TemplateDefinition>,
) -> Result<bool, ApiError> {
    if request.filters.is_empty() {
        return Ok(true);
    }
    let schema = match definition {
        Some(def) => effective_definition(def),
        None => effective_definition(&TemplateDefinition::default()),
    };

    for (name, raw) in &request.filters {
        let Some(resolved) = schema.iter().find(|f| &f.key == name) else {
            // Unknown filters degrade the filter, not the request.
            log::warn!("ignoring filter on unknown field '{}'", name);
            continue;
        };
        let field = &resolved.descriptor;
        if !field.is_filterable() {
            continue;
        }
        let Some(filter) = parse_filter_values(field, raw) else {
            continue;
        };

        let expanded = match &filter {
            FilterValue::Ints(ids)
                if request.descendants
                    && field.field_type == FieldType::IntArray
                    && field.validation.modifiers.iter().any(|m| m == "descendants") =>
            {
                Some(expand_with_descendants(store, ids).await?)
            }
            _ => None,
        };

        let stored = stored_field_value(entity, name);
        if !value_matches(field, &stored, &filter, expanded.as_ref()) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The stored value of a field: metadata fields come from the entity's
/// fixed columns, everything else from `template_data`.
fn stored_field_value(entity: &GenericEntity, name: &str) -> Value {
    match name {
        "name" => Value::String(entity.name.clone()),
        "author" => entity
            .author
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        "tags" => Value::from(entity.tags.clone()),
        "collections" => Value::from(entity.collections.clone()),
        "created" => Value::String(entity.created_at.to_rfc3339()),
        "updated" => Value::String(entity.updated_at.to_rfc3339()),
        "template" => Value::from(entity.template_id),
        other => entity
            .template_data
            .get(other)
            .cloned()
            .unwrap_or(Value::Null),
    }
}

/// Weighted full-text rank: name carries weight A, author and definition
/// weight B. Tokens match on word prefixes, every token must hit at least
/// one column.
fn rank(entity: &GenericEntity, query: &str) -> f64 {
    const WEIGHT_A: f64 = 1.0;
    const WEIGHT_B: f64 = 0.4;

    let tokens: Vec<String> = query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    for token in &tokens {
        let mut hit = 0.0f64;
        if prefix_match(&entity.name, token) {
            hit = hit.max(WEIGHT_A);
        }
        if entity.author.as_deref().map_or(false, |a| prefix_match(a, token)) {
            hit = hit.max(WEIGHT_B);
        }
        if entity
            .definition
            .as_deref()
            .map_or(false, |d| prefix_match(d, token))
        {
            hit = hit.max(WEIGHT_B);
        }
        if hit == 0.0 {
            return 0.0;
        }
        score += hit;
    }
    score
}

fn prefix_match(text: &str, token: &str) -> bool {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| !word.is_empty() && word.starts_with(token))
}

fn order_candidates(candidates: &mut [(GenericEntity, f64)], order_by: OrderBy) {
    match order_by {
        OrderBy::Relevance => candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.natural_order_key().cmp(&b.0.natural_order_key()))
        }),
        OrderBy::CreatedAsc => candidates.sort_by_key(|(e, _)| e.created_at),
        OrderBy::CreatedDesc => candidates.sort_by_key(|(e, _)| std::cmp::Reverse(e.created_at)),
        OrderBy::UpdatedAsc => candidates.sort_by_key(|(e, _)| e.updated_at),
        OrderBy::UpdatedDesc => candidates.sort_by_key(|(e, _)| std::cmp::Reverse(e.updated_at)),
    }
}

pub fn paginate<T>(results: Vec<T>, page: usize, page_size: usize) -> SearchPage<T> {
    let page_size = normalise_page_size(page_size);
    let total_count = results.len();
    let total_pages = (total_count.max(1) + page_size - 1) / page_size;
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * page_size;
    let results: Vec<T> = results
        .into_iter()
        .skip(start)
        .take(page_size)
        .collect();
    SearchPage {
        results,
        page,
        page_size,
        total_pages,
        total_count,
    }
}

/// A filter request over the concept library. Taxonomy filters resolve
/// through the concept's phenotype owner.
#[derive(Debug, Clone, Default)]
pub struct ConceptSearchRequest {
    pub search: Option<String>,
    pub coding_system: Option<Vec<Id>>,
    pub owner: Option<String>,
    pub phenotype_id: Option<String>,
    pub tags: Option<Vec<Id>>,
    pub collections: Option<Vec<Id>>,
    pub page: usize,
    pub page_size: usize,
}

pub async fn search_concepts<S: Store + ?Sized>(
    store: &S,
    ctx: &RequestContext,
    request: &ConceptSearchRequest,
) -> Result<SearchPage<Concept>, ApiError> {
    let mut matched = Vec::new();

    for concept in store.list_concepts().await? {
        if concept.is_deleted {
            continue;
        }
        if !can_user_view_concept(store, &ctx.user, &concept, ctx.brand.as_ref()).await? {
            continue;
        }
        if let Some(systems) = &request.coding_system {
            if !systems.contains(&concept.coding_system_id) {
                continue;
            }
        }
        if let Some(owner) = &request.owner {
            if &concept.owner_id != owner {
                continue;
            }
        }
        if let Some(phenotype_id) = &request.phenotype_id {
            if concept.phenotype_owner_id.as_ref().map(|p| p.to_string())
                != Some(phenotype_id.clone())
            {
                continue;
            }
        }
        if request.tags.is_some() || request.collections.is_some() {
            if !owner_taxonomy_matches(store, &concept, request).await? {
                continue;
            }
        }
        if let Some(query) = &request.search {
            let q = query.to_lowercase();
            if !concept.name.to_lowercase().contains(&q) {
                continue;
            }
        }
        matched.push(concept);
    }

    matched.sort_by_key(|c| c.id);
    Ok(paginate(matched, request.page, request.page_size))
}

async fn owner_taxonomy_matches<S: Store + ?Sized>(
    store: &S,
    concept: &Concept,
    request: &ConceptSearchRequest,
) -> Result<bool, ApiError> {
    let Some(owner_id) = &concept.phenotype_owner_id else {
        return Ok(false);
    };
    let Some(owner) = store.get_entity(owner_id).await? else {
        return Ok(false);
    };
    if let Some(tags) = &request.tags {
        let wanted: BTreeSet<Id> = tags.iter().copied().collect();
        if !owner.tags.iter().any(|t| wanted.contains(t)) {
            return Ok(false);
        }
    }
    if let Some(collections) = &request.collections {
        let wanted: BTreeSet<Id> = collections.iter().copied().collect();
        if !owner.collections.iter().any(|c| wanted.contains(c)) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessLevel, PublicId};
    use chrono::Utc;

    fn entity(id: i64, name: &str) -> GenericEntity {
        let now = Utc::now();
        GenericEntity {
            public_id: PublicId::new("PH", id),
            entity_class_id: 1,
            name: name.to_string(),
            author: Some("Kuan".to_string()),
            definition: Some("Hypertension in primary care".to_string()),
            implementation: None,
            validation: None,
            publications: Vec::new(),
            tags: vec![1],
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

    #[test]
    fn ranking_prefers_name_hits() {
        let by_name = entity(1, "Hypertension");
        let by_definition = entity(2, "Blood pressure phenotype");
        let a = rank(&by_name, "hyperten");
        let b = rank(&by_definition, "hyperten");
        assert!(a > b);
        assert!(b > 0.0);
        assert_eq!(rank(&by_definition, "diabetes"), 0.0);
    }

    #[test]
    fn every_token_must_match_somewhere() {
        let e = entity(1, "Chronic kidney disease");
        assert!(rank(&e, "chronic kidney") > 0.0);
        assert_eq!(rank(&e, "chronic liver"), 0.0);
    }

    #[test]
    fn page_sizes_snap_to_allowed_values() {
        assert_eq!(normalise_page_size(50), 50);
        assert_eq!(normalise_page_size(33), 20);
    }

    #[test]
    fn pagination_is_ceiling_bounded() {
        let page = paginate((0..45).collect::<Vec<i32>>(), 99, 20);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.page, 3);
        assert_eq!(page.results, (40..45).collect::<Vec<i32>>());

        let empty = paginate(Vec::<i32>::new(), 1, 20);
        assert_eq!(empty.total_pages, 1);
        assert!(empty.results.is_empty());
    }

    #[test]
    fn brand_listing_rules() {
        let mut e = entity(1, "x");
        e.brands = vec![1];
        let mut brand = crate::model::Brand::new(2, "b", "B");
        let ctx = RequestContext::new(crate::model::UserContext::anonymous(), Some(brand.clone()));
        assert!(!brand_admits_listing(&e, &ctx));

        brand.visibility.ids = Some(vec![1]);
        let ctx = RequestContext::new(crate::model::UserContext::anonymous(), Some(brand.clone()));
        assert!(brand_admits_listing(&e, &ctx));

        let mut untagged = entity(2, "y");
        untagged.brands = Vec::new();
        brand.visibility.ids = None;
        brand.visibility.allow_null = true;
        let ctx = RequestContext::new(crate::model::UserContext::anonymous(), Some(brand));
        assert!(brand_admits_listing(&untagged, &ctx));
    }
}
