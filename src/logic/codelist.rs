use std::collections::{HashMap, HashSet};

use crate::model::{
    latest_surviving_at, ApiError, ConceptSummary, Cutoff, Code, CodelistEntry, Component,
    ConceptWithCodes, HistoryId, HistoryRow, Id, LogicalType, SourceType,
};
use crate::store::traits::ConceptStore;

/// Temporal reconstruction of a concept's final codelist.
///
/// The derivation is a pure function of the history tables at the concept
/// version's history date T: only child rows written at or before T count,
/// per id only the latest row, tombstones drop the id. Exclusion removes a
/// code everywhere, even when an include ruleset also contributes it, and
/// output order is first occurrence across rulesets in id order.
pub struct CodelistDeriver;

impl CodelistDeriver {
    /// Derive the aggregated codelist for `(concept_id, history_id)`;
    /// `None` selects the latest version.
    pub async fn derive<S: ConceptStore>(
        store: &S,
        concept_id: Id,
        history_id: Option<HistoryId>,
    ) -> Result<ConceptWithCodes, ApiError> {
        Self::derive_filtered(store, concept_id, history_id, None).await
    }

    /// Derivation restricted to rulesets of one logical type. `None`
    /// aggregates include and exclude rulesets as usual.
    pub async fn derive_filtered<S: ConceptStore>(
        store: &S,
        concept_id: Id,
        history_id: Option<HistoryId>,
        logical_type: Option<LogicalType>,
    ) -> Result<ConceptWithCodes, ApiError> {
        let (concept_row, version_id) = Self::load_version(store, concept_id, history_id).await?;
        let at: Cutoff = (concept_row.history_date, version_id);
        let concept = &concept_row.row;

        let expanded = Self::expand_components(store, concept_id, at).await?;

        let attributes = if concept.has_attributes() {
            Some(Self::attributes_at(store, concept_id, at).await?)
        } else {
            None
        };

        let mut included: Vec<CodelistEntry> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut excluded: HashSet<String> = HashSet::new();

        for (component, codes) in &expanded {
            if let Some(wanted) = logical_type {
                if component.logical_type != wanted {
                    continue;
                }
            }
            if component.is_exclusion() && logical_type.is_none() {
                for code in codes {
                    excluded.insert(code.code.clone());
                }
                continue;
            }
            for code in codes {
                if seen.insert(code.code.clone()) {
                    included.push(code.clone());
                }
            }
        }

        let codes: Vec<CodelistEntry> = included
            .into_iter()
            .filter(|entry| !excluded.contains(&entry.code))
            .map(|mut entry| {
                if let Some(attributes) = &attributes {
                    entry.attributes = attributes.get(&entry.code).cloned();
                }
                entry
            })
            .collect();

        Ok(ConceptWithCodes {
            concept_id,
            concept_version_id: version_id,
            name: concept.name.clone(),
            coding_system_id: concept.coding_system_id,
            code_attribute_header: concept.code_attribute_header.clone(),
            codes,
        })
    }

    /// Minimal projection for list views; no child rows are loaded.
    pub async fn summarise<S: ConceptStore>(
        store: &S,
        concept_id: Id,
        history_id: Option<HistoryId>,
    ) -> Result<ConceptSummary, ApiError> {
        let (concept_row, version_id) = Self::load_version(store, concept_id, history_id).await?;
        let concept = &concept_row.row;
        Ok(ConceptSummary {
            concept_id,
            concept_version_id: version_id,
            name: concept.name.clone(),
            coding_system_id: concept.coding_system_id,
            phenotype_owner_id: concept.phenotype_owner_id.clone(),
        })
    }

    /// Per-ruleset expansion without aggregation, in ruleset id order.
    pub async fn expand<S: ConceptStore>(
        store: &S,
        concept_id: Id,
        history_id: Option<HistoryId>,
    ) -> Result<Vec<(Component, Vec<CodelistEntry>)>, ApiError> {
        let (concept_row, _) = Self::load_version(store, concept_id, history_id).await?;
        Self::expand_components(store, concept_id, (concept_row.history_date, concept_row.history_id)).await
    }

    async fn load_version<S: ConceptStore>(
        store: &S,
        concept_id: Id,
        history_id: Option<HistoryId>,
    ) -> Result<(HistoryRow<crate::model::Concept>, HistoryId), ApiError> {
        let version_id = match history_id {
            Some(id) => id,
            None => store
                .latest_concept_version_id(concept_id)
                .await?
                .ok_or(ApiError::NotFound)?,
        };
        let row = store
            .get_concept_version(concept_id, version_id)
            .await?
            .ok_or(ApiError::NotFound)?;
        Ok((row, version_id))
    }

    async fn expand_components<S: ConceptStore>(
        store: &S,
        concept_id: Id,
        at: Cutoff,
    ) -> Result<Vec<(Component, Vec<CodelistEntry>)>, ApiError> {
        let component_rows = store.component_history_for_concept(concept_id).await?;
        let survivors = latest_surviving_at(&component_rows, at, |c: &Component| c.id);

        let mut expanded = Vec::with_capacity(survivors.len());
        for row in survivors {
            let component = row.row.clone();
            let codes = Self::component_codes(store, &component, at).await?;
            expanded.push((component, codes));
        }
        Ok(expanded)
    }

    async fn component_codes<S: ConceptStore>(
        store: &S,
        component: &Component,
        at: Cutoff,
    ) -> Result<Vec<CodelistEntry>, ApiError> {
        if component.source_type == SourceType::ConceptRef {
            if let Some(reference) = component.concept_ref {
                // Pinned child version; exclusion inside the child was
                // already applied when its own codelist was derived.
                let child = Box::pin(Self::derive(
                    store,
                    reference.concept_id,
                    Some(reference.concept_version_id),
                ))
                .await?;
                return Ok(child
                    .codes
                    .into_iter()
                    .map(|mut entry| {
                        entry.attributes = None;
                        entry
                    })
                    .collect());
            }
            return Ok(Vec::new());
        }

        let codelist_rows = store.codelist_history_for_component(component.id).await?;
        let codelist = match latest_surviving_at(&codelist_rows, at, |c| c.id)
            .into_iter()
            .next()
        {
            Some(row) => row.row.clone(),
            None => return Ok(Vec::new()),
        };

        let code_rows = store.code_history_for_codelist(codelist.id).await?;
        let codes = latest_surviving_at(&code_rows, at, |c: &Code| c.id);
        Ok(codes
            .into_iter()
            .map(|row| CodelistEntry {
                code: row.row.code.clone(),
                description: row.row.description.clone(),
                attributes: None,
            })
            .collect())
    }

    async fn attributes_at<S: ConceptStore>(
        store: &S,
        concept_id: Id,
        at: Cutoff,
    ) -> Result<HashMap<String, Vec<serde_json::Value>>, ApiError> {
        let rows = store.attribute_history_for_concept(concept_id).await?;
        let survivors = latest_surviving_at(&rows, at, |a| a.id);
        Ok(survivors
            .into_iter()
            .map(|row| (row.row.code.clone(), row.row.attributes.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessLevel, CodeSave, ComponentSave, ConceptRef, ConceptSave};
    use crate::store::memory::MemoryStore;

    fn component(name: &str, logical_type: LogicalType, codes: &[&str]) -> ComponentSave {
        ComponentSave {
            id: None,
            name: name.to_string(),
            logical_type,
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
        }
    }

    fn save(name: &str, components: Vec<ComponentSave>) -> ConceptSave {
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
            components,
            attributes: Vec::new(),
        }
    }

    fn codes_of(derived: &ConceptWithCodes) -> Vec<&str> {
        derived.codes.iter().map(|c| c.code.as_str()).collect()
    }

    #[tokio::test]
    async fn include_rulesets_aggregate_in_order() {
        let store = MemoryStore::new();
        let (id, _) = store
            .save_concept_tree(
                save(
                    "HTN",
                    vec![
                        component("first", LogicalType::Include, &["I10", "I11"]),
                        component("second", LogicalType::Include, &["I11", "I12"]),
                    ],
                ),
                "alice",
            )
            .await
            .unwrap();

        let derived = CodelistDeriver::derive(&store, id, None).await.unwrap();
        assert_eq!(codes_of(&derived), vec!["I10", "I11", "I12"]);
    }

    #[tokio::test]
    async fn exclusion_removes_codes_across_rulesets() {
        let store = MemoryStore::new();
        let (id, _) = store
            .save_concept_tree(
                save(
                    "demo",
                    vec![
                        component("include", LogicalType::Include, &["A", "B", "C"]),
                        component("exclude", LogicalType::Exclude, &["B"]),
                    ],
                ),
                "alice",
            )
            .await
            .unwrap();

        let derived = CodelistDeriver::derive(&store, id, None).await.unwrap();
        assert_eq!(codes_of(&derived), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn historic_versions_stay_stable() {
        let store = MemoryStore::new();
        let (id, v1) = store
            .save_concept_tree(
                save(
                    "demo",
                    vec![
                        component("include", LogicalType::Include, &["A", "B", "C"]),
                        component("exclude", LogicalType::Exclude, &["B"]),
                    ],
                ),
                "alice",
            )
            .await
            .unwrap();

        // Re-submit the surviving components plus a new include ruleset.
        let existing = store.component_history_for_concept(id).await.unwrap();
        let mut components: Vec<ComponentSave> = Vec::new();
        for row in crate::model::latest_surviving_at(&existing, crate::model::cutoff_now(), |c: &Component| c.id) {
            let codelists = store
                .codelist_history_for_component(row.row.id)
                .await
                .unwrap();
            let code_rows = store
                .code_history_for_codelist(codelists[0].row.id)
                .await
                .unwrap();
            components.push(ComponentSave {
                id: Some(row.row.id),
                name: row.row.name.clone(),
                logical_type: row.row.logical_type,
                source_type: row.row.source_type,
                source: None,
                concept_ref: None,
                codes: code_rows
                    .iter()
                    .map(|c| CodeSave {
                        id: Some(c.row.id),
                        code: c.row.code.clone(),
                        description: c.row.description.clone(),
                    })
                    .collect(),
            });
        }
        components.push(component("added", LogicalType::Include, &["D"]));

        let mut update = save("demo", components);
        update.id = Some(id);
        let (_, v2) = store.save_concept_tree(update, "alice").await.unwrap();
        assert!(v2 > v1);

        let at_v1 = CodelistDeriver::derive(&store, id, Some(v1)).await.unwrap();
        assert_eq!(codes_of(&at_v1), vec!["A", "C"]);
        let at_v2 = CodelistDeriver::derive(&store, id, Some(v2)).await.unwrap();
        assert_eq!(codes_of(&at_v2), vec!["A", "C", "D"]);

        // Re-derivation is stable.
        let again = CodelistDeriver::derive(&store, id, Some(v1)).await.unwrap();
        assert_eq!(again.codes, at_v1.codes);
    }

    #[tokio::test]
    async fn concept_ref_resolves_pinned_child_version() {
        let store = MemoryStore::new();
        let (child_id, child_v1) = store
            .save_concept_tree(
                save("child", vec![component("codes", LogicalType::Include, &["X"])]),
                "alice",
            )
            .await
            .unwrap();

        let mut parent = save("parent", vec![component("own", LogicalType::Include, &["P"])]);
        parent.components.push(ComponentSave {
            id: None,
            name: "reference".to_string(),
            logical_type: LogicalType::Include,
            source_type: SourceType::ConceptRef,
            source: None,
            concept_ref: Some(ConceptRef {
                concept_id: child_id,
                concept_version_id: child_v1,
            }),
            codes: Vec::new(),
        });
        let (parent_id, _) = store.save_concept_tree(parent, "alice").await.unwrap();

        let derived = CodelistDeriver::derive(&store, parent_id, None).await.unwrap();
        assert_eq!(codes_of(&derived), vec!["P", "X"]);
    }

    #[tokio::test]
    async fn filtered_variant_selects_one_logical_type() {
        let store = MemoryStore::new();
        let (id, _) = store
            .save_concept_tree(
                save(
                    "demo",
                    vec![
                        component("include", LogicalType::Include, &["A", "B"]),
                        component("exclude", LogicalType::Exclude, &["B"]),
                    ],
                ),
                "alice",
            )
            .await
            .unwrap();

        let excludes =
            CodelistDeriver::derive_filtered(&store, id, None, Some(LogicalType::Exclude))
                .await
                .unwrap();
        assert_eq!(codes_of(&excludes), vec!["B"]);
    }

    #[tokio::test]
    async fn attributes_join_on_code() {
        let store = MemoryStore::new();
        let mut concept = save("demo", vec![component("codes", LogicalType::Include, &["A"])]);
        concept.code_attribute_header = vec!["severity".to_string()];
        concept.attributes = vec![("A".to_string(), vec![serde_json::json!("high")])];
        let (id, _) = store.save_concept_tree(concept, "alice").await.unwrap();

        let derived = CodelistDeriver::derive(&store, id, None).await.unwrap();
        assert_eq!(
            derived.codes[0].attributes,
            Some(vec![serde_json::json!("high")])
        );
    }
}
