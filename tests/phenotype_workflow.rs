//! End-to-end workflows against the in-memory store: creating phenotypes
//! through the staged write path, deriving codelists, moderating
//! publication, and brand-scoped search.

use chrono::Utc;
use serde_json::json;

use phenotype_library::logic::permissions::can_user_view_version;
use phenotype_library::logic::publish;
use phenotype_library::logic::write_path::{
    submit_entity, SubmissionPayload, TemplateRef, METHOD_CREATE,
};
use phenotype_library::logic::{search_entities, CodelistDeriver, EntitySearchRequest};
use phenotype_library::model::{
    AccessLevel, ApiError, ApprovalStatus, CodeSave, ComponentSave, ConceptSave, EntityClass,
    FieldDef, FieldType, LogicalType, PublicId, RequestContext, SourceType, Template,
    TemplateDefinition, UserContext,
};
use phenotype_library::store::memory::MemoryStore;
use phenotype_library::store::traits::{
    CodingSystemStore, ConceptStore, EntityStore, PublicationStore, TaxonomyStore, TemplateStore,
};

async fn store_with_template() -> (MemoryStore, TemplateRef) {
    let store = MemoryStore::new();
    store
        .upsert_coding_system(phenotype_library::model::CodingSystem::new(
            1,
            "ICD-10",
            "code",
            "description",
        ))
        .await
        .unwrap();
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
            FieldDef::new(
                "concept_information",
                "Concepts",
                FieldType::ClinicalConcept,
            ),
            FieldDef::new("sex", "Sex", FieldType::Enum),
        ],
        ..TemplateDefinition::default()
    };
    let now = Utc::now();
    let (template_id, _) = store
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
    (
        store,
        TemplateRef {
            id: template_id,
            version: 1,
        },
    )
}

fn phenotype_payload(template: &TemplateRef, codes: &[(&str, &str)]) -> SubmissionPayload {
    let codes: Vec<_> = codes
        .iter()
        .map(|(code, description)| {
            json!({ "is_new": true, "code": code, "description": description })
        })
        .collect();
    SubmissionPayload {
        method: Some(METHOD_CREATE),
        template: Some(template.clone()),
        entity: None,
        data: json!({
            "name": "Hypertension",
            "author": "Kuan et al.",
            "concept_information": [{
                "is_new": true,
                "details": { "name": "HTN codes", "coding_system": 1 },
                "components": [{
                    "is_new": true,
                    "name": "ICD-10 terms",
                    "logical_type": "INCLUDE",
                    "source_type": "select_import",
                    "codes": codes
                }]
            }]
        }),
    }
}

fn reference_payload(template: &TemplateRef, concept_id: i64, version_id: i64) -> SubmissionPayload {
    SubmissionPayload {
        method: Some(METHOD_CREATE),
        template: Some(template.clone()),
        entity: None,
        data: json!({
            "name": "Downstream phenotype",
            "author": "Nissen et al.",
            "concept_information": [{
                "concept_id": concept_id,
                "concept_history_id": version_id,
            }]
        }),
    }
}

fn ruleset(
    name: &str,
    logical_type: LogicalType,
    codes: &[&str],
    id: Option<i64>,
    code_ids: Vec<Option<i64>>,
) -> ComponentSave {
    ComponentSave {
        id,
        name: name.to_string(),
        logical_type,
        source_type: SourceType::SelectImport,
        source: None,
        concept_ref: None,
        codes: codes
            .iter()
            .zip(code_ids)
            .map(|(code, id)| CodeSave {
                id,
                code: code.to_string(),
                description: format!("{} description", code),
            })
            .collect(),
    }
}

fn concept_save(name: &str, components: Vec<ComponentSave>, id: Option<i64>) -> ConceptSave {
    ConceptSave {
        id,
        name: name.to_string(),
        coding_system_id: 1,
        code_attribute_header: Vec::new(),
        owner_id: "alice".to_string(),
        group_id: None,
        owner_access: AccessLevel::Edit,
        group_access: AccessLevel::None,
        world_access: AccessLevel::None,
        phenotype_owner_id: None,
        components,
        attributes: Vec::new(),
    }
}

#[tokio::test]
async fn create_and_publish_phenotype() {
    let (store, template) = store_with_template().await;
    let owner = RequestContext::new(UserContext::user("alice"), None);
    let moderator = RequestContext::new(UserContext::moderator("mod"), None);

    let saved = submit_entity(
        &store,
        &owner,
        phenotype_payload(&template, &[("I10", "Essential hypertension"), ("I11", "Hypertensive heart disease")]),
    )
    .await
    .unwrap();

    let entity = store.get_entity(&saved.public_id).await.unwrap().unwrap();
    let refs = entity.concept_references();
    assert_eq!(refs.len(), 1);
    let derived = CodelistDeriver::derive(&store, refs[0].0, Some(refs[0].1))
        .await
        .unwrap();
    let codes: Vec<&str> = derived.codes.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes, vec!["I10", "I11"]);

    // Owner requests, moderator approves.
    let record = publish::submit_for_publication(&store, &owner, &saved.public_id, saved.history_id)
        .await
        .unwrap();
    assert_eq!(record.approval_status, ApprovalStatus::Requested);

    let record = publish::approve(&store, &moderator, &saved.public_id, saved.history_id)
        .await
        .unwrap();
    assert_eq!(record.approval_status, ApprovalStatus::Approved);

    let entity = store.get_entity(&saved.public_id).await.unwrap().unwrap();
    assert_eq!(entity.publish_status, Some(ApprovalStatus::Approved));
}

#[tokio::test]
async fn exclude_rulesets_subtract_from_includes() {
    let (store, _) = store_with_template().await;
    let save = concept_save(
        "Mixed",
        vec![
            ruleset(
                "include",
                LogicalType::Include,
                &["A", "B", "C"],
                None,
                vec![None, None, None],
            ),
            ruleset("exclude", LogicalType::Exclude, &["B"], None, vec![None]),
        ],
        None,
    );
    let (concept_id, _) = store.save_concept_tree(save, "alice").await.unwrap();

    let derived = CodelistDeriver::derive(&store, concept_id, None).await.unwrap();
    let codes: Vec<&str> = derived.codes.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes, vec!["A", "C"]);
}

#[tokio::test]
async fn historic_versions_derive_their_own_codelists() {
    let (store, _) = store_with_template().await;
    let save = concept_save(
        "Mixed",
        vec![
            ruleset(
                "include",
                LogicalType::Include,
                &["A", "B", "C"],
                None,
                vec![None, None, None],
            ),
            ruleset("exclude", LogicalType::Exclude, &["B"], None, vec![None]),
        ],
        None,
    );
    let (concept_id, v1) = store.save_concept_tree(save, "alice").await.unwrap();

    // Version 2 gains a second include ruleset; the original children are
    // resubmitted unchanged.
    let history = store.component_history_for_concept(concept_id).await.unwrap();
    let mut components: Vec<ComponentSave> = Vec::new();
    for row in &history {
        let codes = store
            .code_history_for_codelist(
                store
                    .codelist_history_for_component(row.row.id)
                    .await
                    .unwrap()[0]
                    .row
                    .id,
            )
            .await
            .unwrap();
        components.push(ComponentSave {
            id: Some(row.row.id),
            name: row.row.name.clone(),
            logical_type: row.row.logical_type,
            source_type: row.row.source_type,
            source: None,
            concept_ref: None,
            codes: codes
                .iter()
                .map(|code| CodeSave {
                    id: Some(code.row.id),
                    code: code.row.code.clone(),
                    description: code.row.description.clone(),
                })
                .collect(),
        });
    }
    components.push(ruleset(
        "late include",
        LogicalType::Include,
        &["D"],
        None,
        vec![None],
    ));
    let (_, v2) = store
        .save_concept_tree(concept_save("Mixed", components, Some(concept_id)), "alice")
        .await
        .unwrap();
    assert!(v2 > v1);

    let at_v1 = CodelistDeriver::derive(&store, concept_id, Some(v1)).await.unwrap();
    let codes_v1: Vec<&str> = at_v1.codes.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes_v1, vec!["A", "C"]);

    let at_v2 = CodelistDeriver::derive(&store, concept_id, Some(v2)).await.unwrap();
    let codes_v2: Vec<&str> = at_v2.codes.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes_v2, vec!["A", "C", "D"]);
}

#[tokio::test]
async fn concurrent_creates_never_share_or_skip_ids() {
    let (store, template) = store_with_template().await;
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

    let ctx = RequestContext::new(UserContext::user("alice"), None);
    let (first, second) = tokio::join!(
        submit_entity(&store, &ctx, phenotype_payload(&template, &[("I10", "x")])),
        submit_entity(&store, &ctx, phenotype_payload(&template, &[("I11", "y")])),
    );
    let mut ids = vec![
        first.unwrap().public_id.to_string(),
        second.unwrap().public_id.to_string(),
    ];
    ids.sort();
    assert_eq!(ids, vec!["PH11", "PH12"]);
}

#[tokio::test]
async fn brand_scoping_hides_listings_but_not_published_fetches() {
    let (store, template) = store_with_template().await;
    store
        .upsert_brand(phenotype_library::model::Brand::new(1, "adp", "ADP"))
        .await
        .unwrap();
    store
        .upsert_brand(phenotype_library::model::Brand::new(2, "other", "Other"))
        .await
        .unwrap();

    let owner = RequestContext::new(UserContext::user("alice"), None);
    let saved = submit_entity(
        &store,
        &owner,
        phenotype_payload(&template, &[("I10", "Essential hypertension")]),
    )
    .await
    .unwrap();

    // Tag the entity with brand 1 only.
    let mut entity = store.get_entity(&saved.public_id).await.unwrap().unwrap();
    entity.brands = vec![1];
    let latest = store.update_entity(entity).await.unwrap();

    let brand2 = store.get_brand(2).await.unwrap();
    let other_brand_ctx = RequestContext::new(UserContext::user("alice"), brand2.clone());

    let page = search_entities(&store, &other_brand_ctx, &EntitySearchRequest::default())
        .await
        .unwrap();
    assert!(page.results.is_empty());

    // Once approved, the version is fetchable by id from any brand.
    let moderator = RequestContext::new(UserContext::moderator("mod"), None);
    publish::submit_for_publication(&store, &owner, &saved.public_id, latest)
        .await
        .unwrap();
    publish::approve(&store, &moderator, &saved.public_id, latest)
        .await
        .unwrap();

    let version = store
        .get_entity_version(&saved.public_id, latest)
        .await
        .unwrap()
        .unwrap();
    assert!(can_user_view_version(
        &UserContext::anonymous(),
        &version.row,
        Some(ApprovalStatus::Approved),
        brand2.as_ref(),
    ));
}

#[tokio::test]
async fn deleted_child_blocks_publication() {
    let (store, template) = store_with_template().await;
    let owner = RequestContext::new(UserContext::user("alice"), None);

    let saved = submit_entity(
        &store,
        &owner,
        phenotype_payload(&template, &[("I10", "Essential hypertension")]),
    )
    .await
    .unwrap();
    let entity = store.get_entity(&saved.public_id).await.unwrap().unwrap();
    let (concept_id, _) = entity.concept_references()[0];

    store.delete_concept(concept_id, "alice").await.unwrap();

    let result =
        publish::submit_for_publication(&store, &owner, &saved.public_id, saved.history_id).await;
    let Err(ApiError::PublicationBlocked(blockers)) = result else {
        panic!("expected a blocked publication");
    };
    assert!(blockers
        .iter()
        .any(|b| b.reason == format!("Child concept({}) is deleted", concept_id)));

    // No record was written, the approval state did not advance.
    assert!(store
        .latest_publication_record(&saved.public_id, saved.history_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn referencing_an_unpublished_foreign_concept_blocks_publication() {
    let (store, template) = store_with_template().await;
    let bob = RequestContext::new(UserContext::user("bob"), None);
    let alice = RequestContext::new(UserContext::user("alice"), None);
    let moderator = RequestContext::new(UserContext::moderator("mod"), None);

    // Bob's phenotype owns a concept; a second version opens it up for
    // world viewing so Alice can reference it.
    let bobs = submit_entity(
        &store,
        &bob,
        phenotype_payload(&template, &[("J45", "Asthma")]),
    )
    .await
    .unwrap();
    let bob_entity = store.get_entity(&bobs.public_id).await.unwrap().unwrap();
    let (child_id, _) = bob_entity.concept_references()[0];
    let mut save = concept_save(
        "Asthma codes",
        vec![ruleset(
            "include",
            LogicalType::Include,
            &["J45"],
            None,
            vec![None],
        )],
        Some(child_id),
    );
    save.owner_id = "bob".to_string();
    save.world_access = AccessLevel::View;
    save.phenotype_owner_id = Some(bobs.public_id.clone());
    let (_, child_version) = store.save_concept_tree(save, "bob").await.unwrap();

    // The child is viewable but has never been published.
    let saved = submit_entity(
        &store,
        &alice,
        reference_payload(&template, child_id, child_version),
    )
    .await
    .unwrap();
    let result =
        publish::submit_for_publication(&store, &alice, &saved.public_id, saved.history_id).await;
    let Err(ApiError::PublicationBlocked(blockers)) = result else {
        panic!("expected a blocked publication");
    };
    assert!(blockers
        .iter()
        .any(|b| b.reason == format!("Child concept({}) is not published", child_id)));
    assert!(store
        .latest_publication_record(&saved.public_id, saved.history_id)
        .await
        .unwrap()
        .is_none());

    // Approving Bob's owning phenotype publishes the child, unblocking
    // Alice's reference.
    publish::submit_for_publication(&store, &bob, &bobs.public_id, bobs.history_id)
        .await
        .unwrap();
    publish::approve(&store, &moderator, &bobs.public_id, bobs.history_id)
        .await
        .unwrap();
    let record =
        publish::submit_for_publication(&store, &alice, &saved.public_id, saved.history_id)
            .await
            .unwrap();
    assert_eq!(record.approval_status, ApprovalStatus::Requested);
}

#[tokio::test]
async fn public_ids_round_trip_and_reject_garbage() {
    for raw in ["PH1", "PH123", "C9000"] {
        assert_eq!(PublicId::parse(raw).unwrap().to_string(), raw);
    }
    assert!(matches!(
        PublicId::parse("nonsense"),
        Err(ApiError::MalformedId(_))
    ));
}

#[tokio::test]
async fn collections_enrich_search_through_seeded_taxonomy() {
    let store = MemoryStore::new();
    phenotype_library::seed::load_seed_data(&store).await.unwrap();

    let tags = store.list_tags(None).await.unwrap();
    assert!(tags
        .iter()
        .any(|t| t.tag_type == phenotype_library::model::TagType::Collection));

    let template = store.get_template(1).await.unwrap().unwrap();
    assert_eq!(template.entity_class_id, Some(1));

    // The seeded template version is content-derived and stable.
    let again = store.get_template_version(1, template.template_version).await.unwrap();
    assert!(again.is_some());
}
