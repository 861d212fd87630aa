use serde_json::Value;

use crate::model::{
    ApiError, FieldDef, FieldType, RequestContext, ResolvedField, SourceOption, Tag, TagType,
    TemplateDefinition,
};
use crate::store::traits::{CodingSystemStore, OntologyStore, TaxonomyStore};

/// The process-wide base metadata schema. Every template's effective
/// definition starts from these fields; a template may partially override a
/// base field by redeclaring it with `is_base_field: true`.
pub fn base_metadata_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new("name", "Name", FieldType::String)
            .mandatory()
            .base_field(),
        FieldDef::new("definition", "Definition", FieldType::TextareaMarkdown).base_field(),
        FieldDef::new("implementation", "Implementation", FieldType::TextareaMarkdown).base_field(),
        FieldDef::new("publications", "Publications", FieldType::Publication).base_field(),
        FieldDef::new("validation", "Validation", FieldType::TextareaMarkdown).base_field(),
        FieldDef::new(
            "citation_requirements",
            "Citation Requirements",
            FieldType::Textarea,
        )
        .base_field(),
        FieldDef::new("created", "Date", FieldType::Datetime)
            .base_field()
            .filterable(),
        FieldDef::new("author", "Author", FieldType::String)
            .mandatory()
            .base_field(),
        FieldDef::new("collections", "Collections", FieldType::Collections)
            .base_field()
            .filterable(),
        FieldDef::new("tags", "Tags", FieldType::Tags)
            .base_field()
            .filterable(),
        FieldDef::new("updated", "Updated", FieldType::Datetime).base_field(),
        FieldDef::new("created_by", "Created By", FieldType::String).base_field(),
        FieldDef::new("updated_by", "Updated By", FieldType::String).base_field(),
        FieldDef::new("template", "Template", FieldType::Int).base_field(),
    ]
}

pub fn is_metadata_field(name: &str) -> bool {
    base_metadata_fields().iter().any(|f| f.name == name)
}

/// Merge a template's declared fields with the base metadata schema into the
/// ordered effective schema. Base fields take their descriptor from the base
/// schema with the template's partial override applied on top; inactive
/// fields are dropped.
pub fn effective_definition(definition: &TemplateDefinition) -> Vec<ResolvedField> {
    let base = base_metadata_fields();
    let mut resolved: Vec<ResolvedField> = Vec::new();

    for field in &definition.fields {
        if !field.active {
            continue;
        }
        let descriptor = match base.iter().find(|b| b.name == field.name) {
            Some(base_field) if field.is_base_field => override_base(base_field, field),
            _ => field.clone(),
        };
        resolved.push(ResolvedField {
            key: field.name.clone(),
            descriptor,
            is_metadata: is_metadata_field(&field.name),
        });
    }

    // Base fields the template never mentions are still part of the schema.
    for base_field in base {
        if resolved.iter().any(|r| r.key == base_field.name) {
            continue;
        }
        resolved.push(ResolvedField {
            key: base_field.name.clone(),
            is_metadata: true,
            descriptor: base_field,
        });
    }
    resolved
}

/// Apply a template's partial base-field override on top of the base
/// descriptor. Empty/default values in the override leave the base value in
/// place.
fn override_base(base: &FieldDef, partial: &FieldDef) -> FieldDef {
    let mut merged = base.clone();
    merged.field_type = partial.field_type;
    if !partial.title.is_empty() {
        merged.title = partial.title.clone();
    }
    merged.requires_auth = partial.requires_auth;
    merged.order = partial.order;
    if partial.validation.mandatory {
        merged.validation.mandatory = true;
    }
    if partial.validation.kind.is_some() {
        merged.validation.kind = partial.validation.kind.clone();
    }
    if partial.validation.source.is_some() {
        merged.validation.source = partial.validation.source.clone();
    }
    if partial.validation.options.is_some() {
        merged.validation.options = partial.validation.options.clone();
    }
    if !partial.validation.modifiers.is_empty() {
        merged.validation.modifiers = partial.validation.modifiers.clone();
    }
    if partial.search.is_some() {
        merged.search = partial.search.clone();
    }
    merged
}

pub fn get_field(definition: &TemplateDefinition, name: &str) -> Option<ResolvedField> {
    effective_definition(definition)
        .into_iter()
        .find(|f| f.key == name)
}

/// `template_version` is content-derived: it is whatever the definition's
/// `template_details.version` declares.
pub fn compute_template_version(definition: &TemplateDefinition) -> i32 {
    definition.template_details.version
}

/// Recompute each field's `order` from the declared `layout_order`; fields
/// missing from the layout keep their relative position after the listed
/// ones.
pub fn reindex_field_order(definition: &mut TemplateDefinition) {
    if definition.layout_order.is_empty() {
        for (idx, field) in definition.fields.iter_mut().enumerate() {
            field.order = idx as i32;
        }
        return;
    }
    let layout = definition.layout_order.clone();
    let mut next = layout.len() as i32;
    for field in definition.fields.iter_mut() {
        field.order = match layout.iter().position(|n| n == &field.name) {
            Some(pos) => pos as i32,
            None => {
                let order = next;
                next += 1;
                order
            }
        };
    }
    definition.fields.sort_by_key(|f| f.order);
}

/// Resolve the selectable options of a sourced field.
///
/// `source.table` names an entry in the source registry; `trees` switches
/// the lookup to ontology roots of the named categories. A `filter` names a
/// generator (currently `brand_filter`) applied with logical AND. Lookup
/// failures degrade to an empty list with a WARN, never an error.
pub async fn resolve_source_options<S>(
    store: &S,
    field: &FieldDef,
    ctx: &RequestContext,
) -> Vec<SourceOption>
where
    S: TaxonomyStore + OntologyStore + CodingSystemStore + ?Sized,
{
    let Some(source) = &field.validation.source else {
        // Fixed option maps need no store lookup.
        if let Some(options) = &field.validation.options {
            return options
                .iter()
                .map(|(value, label)| SourceOption {
                    name: label.as_str().unwrap_or_default().to_string(),
                    value: Value::String(value.clone()),
                    included: serde_json::Map::new(),
                })
                .collect();
        }
        return Vec::new();
    };

    match lookup_source(store, field, ctx).await {
        Ok(options) => options,
        Err(err) => {
            log::warn!(
                "source lookup failed for field '{}' (table '{}'): {}",
                field.name,
                source.table,
                err
            );
            Vec::new()
        }
    }
}

async fn lookup_source<S>(
    store: &S,
    field: &FieldDef,
    ctx: &RequestContext,
) -> Result<Vec<SourceOption>, ApiError>
where
    S: TaxonomyStore + OntologyStore + CodingSystemStore + ?Sized,
{
    let source = field
        .validation
        .source
        .as_ref()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("field has no source")))?;

    if let Some(trees) = &source.trees {
        let mut options = Vec::new();
        for &type_id in trees {
            for node in store.list_ontology_nodes(type_id).await? {
                if !node.is_root() {
                    continue;
                }
                let mut included = serde_json::Map::new();
                if source.include.iter().any(|c| c == "type_id") {
                    included.insert("type_id".to_string(), Value::from(node.type_id));
                }
                options.push(SourceOption {
                    name: node.name,
                    value: Value::from(node.id),
                    included,
                });
            }
        }
        return Ok(options);
    }

    let options = match source.table.as_str() {
        "tags" => tag_options(store.list_tags(Some(TagType::Tag)).await?, field, ctx),
        "collections" => tag_options(store.list_tags(Some(TagType::Collection)).await?, field, ctx),
        "data_sources" => store
            .list_data_sources()
            .await?
            .into_iter()
            .map(|ds| {
                let mut included = serde_json::Map::new();
                if source.include.iter().any(|c| c == "url") {
                    if let Some(url) = ds.url {
                        included.insert("url".to_string(), Value::String(url));
                    }
                }
                SourceOption {
                    name: ds.name,
                    value: Value::from(ds.id),
                    included,
                }
            })
            .collect(),
        "coding_systems" => store
            .list_coding_systems()
            .await?
            .into_iter()
            .map(|cs| SourceOption {
                name: cs.name,
                value: Value::from(cs.id),
                included: serde_json::Map::new(),
            })
            .collect(),
        "groups" => store
            .list_groups()
            .await?
            .into_iter()
            .map(|g| SourceOption {
                name: g.name,
                value: Value::from(g.id),
                included: serde_json::Map::new(),
            })
            .collect(),
        "brands" => store
            .list_brands()
            .await?
            .into_iter()
            .map(|b| SourceOption {
                name: b.name,
                value: Value::from(b.id),
                included: serde_json::Map::new(),
            })
            .collect(),
        other => {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "unknown source table '{}'",
                other
            )))
        }
    };
    Ok(options)
}

/// Tags and collections honour the `brand_filter` generator: with a brand in
/// context, a collection is visible when it is unbranded or branded for the
/// current brand.
fn tag_options(tags: Vec<Tag>, field: &FieldDef, ctx: &RequestContext) -> Vec<SourceOption> {
    let brand_filtered = field
        .validation
        .source
        .as_ref()
        .and_then(|s| s.filter.as_deref())
        == Some("brand_filter");

    tags.into_iter()
        .filter(|tag| {
            if !brand_filtered {
                return true;
            }
            match (&ctx.brand, tag.collection_brand) {
                (Some(brand), Some(tag_brand)) => tag_brand == brand.id,
                _ => true,
            }
        })
        .map(|tag| SourceOption {
            name: tag.description,
            value: Value::from(tag.id),
            included: serde_json::Map::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Brand, FieldSource, UserContext};
    use crate::store::memory::MemoryStore;

    fn definition_with(fields: Vec<FieldDef>) -> TemplateDefinition {
        TemplateDefinition {
            fields,
            ..TemplateDefinition::default()
        }
    }

    #[test]
    fn base_fields_merge_into_every_definition() {
        let definition = definition_with(vec![FieldDef::new(
            "concept_information",
            "Concepts",
            FieldType::ClinicalConcept,
        )]);
        let effective = effective_definition(&definition);
        assert!(effective.iter().any(|f| f.key == "concept_information"));
        assert!(effective.iter().any(|f| f.key == "name" && f.is_metadata));
        assert!(effective.iter().any(|f| f.key == "author"));
    }

    #[test]
    fn template_overrides_win_over_base_descriptors() {
        let mut declared = FieldDef::new("definition", "Phenotype Definition", FieldType::Textarea)
            .base_field()
            .mandatory();
        declared.order = 3;
        let definition = definition_with(vec![declared]);

        let field = get_field(&definition, "definition").unwrap();
        assert_eq!(field.descriptor.title, "Phenotype Definition");
        assert!(field.descriptor.validation.mandatory);
        // The base schema's type survives unless overridden away from it.
        assert_eq!(field.descriptor.field_type, FieldType::Textarea);
        assert!(field.is_metadata);
    }

    #[test]
    fn inactive_fields_are_omitted() {
        let mut hidden = FieldDef::new("sex", "Sex", FieldType::Enum);
        hidden.active = false;
        let definition = definition_with(vec![hidden]);
        assert!(get_field(&definition, "sex").is_none());
    }

    #[test]
    fn layout_order_reindexes_fields() {
        let mut definition = definition_with(vec![
            FieldDef::new("b", "B", FieldType::String),
            FieldDef::new("a", "A", FieldType::String),
            FieldDef::new("c", "C", FieldType::String),
        ]);
        definition.layout_order = vec!["a".to_string(), "b".to_string()];
        reindex_field_order(&mut definition);
        let names: Vec<&str> = definition.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(definition.fields[2].order, 2);
    }

    #[tokio::test]
    async fn brand_filter_scopes_collection_options() {
        let store = MemoryStore::new();
        store.upsert_tag(Tag::collection(1, "Open", None)).await.unwrap();
        store
            .upsert_tag(Tag::collection(2, "Brand A only", Some(10)))
            .await
            .unwrap();
        store
            .upsert_tag(Tag::collection(3, "Brand B only", Some(20)))
            .await
            .unwrap();

        let mut field = FieldDef::new("collections", "Collections", FieldType::Collections);
        field.validation.source = Some(FieldSource {
            table: "collections".to_string(),
            query: "id".to_string(),
            relative: "description".to_string(),
            filter: Some("brand_filter".to_string()),
            include: Vec::new(),
            trees: None,
        });

        let ctx = RequestContext::new(
            UserContext::anonymous(),
            Some(Brand::new(10, "a", "Brand A")),
        );
        let options = resolve_source_options(&store, &field, &ctx).await;
        let names: Vec<&str> = options.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["Open", "Brand A only"]);
    }

    #[tokio::test]
    async fn unknown_source_table_degrades_to_empty() {
        let store = MemoryStore::new();
        let mut field = FieldDef::new("weird", "Weird", FieldType::Enum);
        field.validation.source = Some(FieldSource {
            table: "no_such_table".to_string(),
            query: "id".to_string(),
            relative: "name".to_string(),
            filter: None,
            include: Vec::new(),
            trees: None,
        });
        let options = resolve_source_options(&store, &field, &RequestContext::anonymous()).await;
        assert!(options.is_empty());
    }
}
