use anyhow::Result;
use chrono::Utc;

use crate::logic::template_schema::compute_template_version;
use crate::model::{
    Brand, CodingSystem, DataSource, EntityClass, FieldDef, FieldType, Group, OntologyNode, Tag,
    Template, TemplateDefinition, TemplateDetails,
};
use crate::store::traits::Store;

const SYSTEM_USER: &str = "system";

fn coding_systems() -> Vec<CodingSystem> {
    vec![
        CodingSystem::new(1, "ICD-10", "code", "description"),
        CodingSystem::new(2, "SNOMED CT", "conceptid", "term"),
        CodingSystem::new(3, "Read codes v2", "read_code", "pref_term_30"),
        CodingSystem::new(4, "CTV3", "read_code", "term"),
        CodingSystem::new(5, "OPCS-4", "opcs_code", "description"),
        CodingSystem::new(6, "BNF", "bnf_code", "name"),
        CodingSystem::new(7, "dm+d", "dmd_code", "term"),
        CodingSystem::new(8, "MeSH", "code", "description"),
    ]
}

/// The base clinical-phenotype template bound to the PH entity class.
fn clinical_phenotype_template() -> Template {
    let now = Utc::now();
    let definition = TemplateDefinition {
        template_details: TemplateDetails {
            version: 1,
            name: Some("Clinical-Coded Phenotype".to_string()),
            description: Some(
                "Phenotype defined by one or more clinical codelists".to_string(),
            ),
        },
        fields: vec![
            {
                let mut field = FieldDef::new("type", "Phenotype Type", FieldType::Enum)
                    .mandatory()
                    .filterable();
                field.validation.kind = Some("enum".to_string());
                field.validation.options = Some(
                    serde_json::json!({
                        "1": "Biomarker",
                        "2": "Disease or syndrome",
                        "3": "Drug",
                        "4": "Lifestyle risk factor",
                        "5": "Musculoskeletal",
                        "6": "Surgical procedure"
                    })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                );
                field
            },
            {
                let mut field = FieldDef::new(
                    "concept_information",
                    "Clinical Codelists",
                    FieldType::ClinicalConcept,
                );
                field.validation.kind = Some("int_array".to_string());
                field.validation.has_children = true;
                field
            },
            {
                let mut field =
                    FieldDef::new("coding_system", "Coding System", FieldType::CodingSystem)
                        .filterable();
                field.validation.kind = Some("int_array".to_string());
                field.validation.source = Some(crate::model::FieldSource {
                    table: "coding_systems".to_string(),
                    query: "id".to_string(),
                    relative: "name".to_string(),
                    filter: None,
                    include: Vec::new(),
                    trees: None,
                });
                field
            },
            {
                let mut field =
                    FieldDef::new("data_sources", "Data Sources", FieldType::DataSources)
                        .filterable();
                field.validation.kind = Some("int_array".to_string());
                field.validation.source = Some(crate::model::FieldSource {
                    table: "data_sources".to_string(),
                    query: "id".to_string(),
                    relative: "name".to_string(),
                    filter: None,
                    include: Vec::new(),
                    trees: None,
                });
                field
            },
            {
                let mut field = FieldDef::new("sex", "Sex", FieldType::Enum).filterable();
                field.validation.kind = Some("enum".to_string());
                field.validation.options = Some(
                    serde_json::json!({ "1": "Female", "2": "Male", "3": "Both" })
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                );
                field
            },
            {
                let mut field = FieldDef::new(
                    "event_date_range",
                    "Valid Event Date Range",
                    FieldType::StringInputbox,
                );
                field.validation.kind = Some("string".to_string());
                field.validation.sanitise = true;
                field
            },
        ],
        card_type: Some("clinical".to_string()),
        detail_page_sections: Vec::new(),
        layout_order: vec![
            "name".to_string(),
            "author".to_string(),
            "type".to_string(),
            "definition".to_string(),
            "concept_information".to_string(),
        ],
        entity_filters: vec![
            "type".to_string(),
            "coding_system".to_string(),
            "data_sources".to_string(),
            "tags".to_string(),
            "collections".to_string(),
        ],
        entity_order: None,
        entity_statistics: None,
    };

    Template {
        id: 1,
        name: "Clinical-Coded Phenotype".to_string(),
        template_version: compute_template_version(&definition),
        definition,
        entity_class_id: Some(1),
        created_by: SYSTEM_USER.to_string(),
        created_at: now,
        updated_by: SYSTEM_USER.to_string(),
        updated_at: now,
    }
}

/// Idempotent bootstrap of the reference registries, the base template
/// and a demo brand/taxonomy. Safe to run on every startup.
pub async fn load_seed_data<S: Store + ?Sized>(store: &S) -> Result<()> {
    for coding_system in coding_systems() {
        store.upsert_coding_system(coding_system).await?;
    }

    if store.get_entity_class("PH").await?.is_none() {
        store
            .upsert_entity_class(EntityClass {
                id: 1,
                name: "Phenotype".to_string(),
                entity_prefix: "PH".to_string(),
                entity_count: 0,
                description: Some("Clinical-coded phenotype definitions".to_string()),
            })
            .await?;
    }

    if store.get_template(1).await?.is_none() {
        store
            .save_template(clinical_phenotype_template(), SYSTEM_USER)
            .await?;
    }

    if store.get_brand(1).await?.is_none() {
        store
            .upsert_brand(Brand::new(1, "main", "Phenotype Library"))
            .await?;
    }

    if store.list_tags(None).await?.is_empty() {
        store.upsert_tag(Tag::tag(1, "preprint")).await?;
        store.upsert_tag(Tag::tag(2, "peer reviewed")).await?;
        store.upsert_tag(Tag::collection(10, "Breathe", None)).await?;
        store
            .upsert_tag(Tag::collection(11, "BREATHE Asthma", Some(1)))
            .await?;
    }

    if store.list_data_sources().await?.is_empty() {
        store
            .upsert_data_source(DataSource {
                id: 1,
                name: "Clinical Practice Research Datalink".to_string(),
                uid: Some("CPRD".to_string()),
                url: None,
            })
            .await?;
        store
            .upsert_data_source(DataSource {
                id: 2,
                name: "Hospital Episode Statistics".to_string(),
                uid: Some("HES".to_string()),
                url: None,
            })
            .await?;
    }

    if store.list_groups().await?.is_empty() {
        store
            .upsert_group(Group {
                id: 1,
                name: "Research Group".to_string(),
            })
            .await?;
    }

    if store.list_ontology_type_ids().await?.is_empty() {
        for node in demo_ontology() {
            store.upsert_ontology_node(node).await?;
        }
    }

    log::info!("seed data loaded");
    Ok(())
}

/// A small disease-classification sample: a root with two children, one
/// of which has a grandchild.
fn demo_ontology() -> Vec<OntologyNode> {
    let mut respiratory = OntologyNode::new(1, 1, "Diseases of the respiratory system");
    let mut asthma = OntologyNode::new(2, 1, "Asthma");
    let mut copd = OntologyNode::new(3, 1, "Chronic obstructive pulmonary disease");
    let mut severe_asthma = OntologyNode::new(4, 1, "Severe asthma");

    respiratory.children = vec![2, 3];
    asthma.parents = vec![1];
    asthma.children = vec![4];
    copd.parents = vec![1];
    severe_asthma.parents = vec![2];

    vec![respiratory, asthma, copd, severe_asthma]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::traits::{CodingSystemStore, EntityStore, TemplateStore};

    #[tokio::test]
    async fn seed_is_idempotent() {
        let store = MemoryStore::new();
        load_seed_data(&store).await.unwrap();
        load_seed_data(&store).await.unwrap();

        assert_eq!(store.list_coding_systems().await.unwrap().len(), 8);
        assert_eq!(store.list_templates().await.unwrap().len(), 1);
        let class = store.get_entity_class("PH").await.unwrap().unwrap();
        assert_eq!(class.entity_count, 0);
    }

    #[test]
    fn template_version_is_content_derived() {
        let template = clinical_phenotype_template();
        assert_eq!(
            template.template_version,
            template.definition.template_details.version
        );
    }
}
