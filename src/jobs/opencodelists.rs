use std::time::Duration;

use serde::Deserialize;

use crate::model::{AccessLevel, ApiError, CodeSave, ComponentSave, ConceptSave, LogicalType, SourceType};
use crate::store::traits::Store;

const MAX_ATTEMPTS: u32 = 5;
const RETRIABLE: [u16; 5] = [429, 500, 502, 503, 504];

/// Client for the external codelist registry the sync job imports from.
pub struct OpenCodelistsClient {
    http: reqwest::Client,
    base_url: String,
}

/// One codelist as published by the remote registry.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCodelist {
    pub slug: String,
    pub name: String,
    pub coding_system: String,
    #[serde(default)]
    pub codes: Vec<RemoteCode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCode {
    pub code: String,
    #[serde(default)]
    pub term: String,
}

#[derive(Debug, Deserialize)]
struct RemoteIndex {
    codelists: Vec<RemoteCodelist>,
}

/// Outcome counters for one sync run.
#[derive(Debug, Default, PartialEq)]
pub struct SyncReport {
    pub imported: usize,
    pub skipped: usize,
}

impl OpenCodelistsClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Upstream(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET with bounded retries and exponential backoff on the retriable
    /// status list.
    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut last_error = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * (1 << attempt));
                tokio::time::sleep(backoff).await;
            }
            match self.http.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .map_err(|e| ApiError::Upstream(e.to_string()));
                    }
                    last_error = format!("{} returned {}", url, status);
                    if !RETRIABLE.contains(&status.as_u16()) {
                        break;
                    }
                    log::warn!("{} (attempt {}/{})", last_error, attempt + 1, MAX_ATTEMPTS);
                }
                Err(err) => {
                    last_error = format!("{} failed: {}", url, err);
                    log::warn!("{} (attempt {}/{})", last_error, attempt + 1, MAX_ATTEMPTS);
                }
            }
        }
        Err(ApiError::Upstream(last_error))
    }

    pub async fn list_codelists(&self, organisation: &str) -> Result<Vec<RemoteCodelist>, ApiError> {
        let index: RemoteIndex = self
            .fetch_json(&format!("codelist/{}/", organisation))
            .await?;
        Ok(index.codelists)
    }
}

/// Import an organisation's codelists as concepts owned by `owner`.
///
/// A failed item is logged and skipped; the run keeps going and the
/// report counts both outcomes.
pub async fn sync_codelists<S: Store + ?Sized>(
    store: &S,
    client: &OpenCodelistsClient,
    organisation: &str,
    owner: &str,
) -> Result<SyncReport, ApiError> {
    let run_id = uuid::Uuid::new_v4();
    log::info!("codelist sync {} started for '{}'", run_id, organisation);

    let remote = client.list_codelists(organisation).await?;
    let coding_systems = store.list_coding_systems().await?;
    let mut report = SyncReport::default();

    for codelist in remote {
        let Some(coding_system) = coding_systems
            .iter()
            .find(|cs| cs.name.eq_ignore_ascii_case(&codelist.coding_system))
        else {
            log::warn!(
                "skipping '{}': unknown coding system '{}'",
                codelist.slug,
                codelist.coding_system
            );
            report.skipped += 1;
            continue;
        };

        let save = import_save(&codelist, coding_system.id, owner);
        match store.save_concept_tree(save, owner).await {
            Ok((concept_id, history_id)) => {
                log::info!(
                    "imported '{}' as concept {} version {}",
                    codelist.slug,
                    concept_id,
                    history_id
                );
                report.imported += 1;
            }
            Err(err) => {
                log::warn!("skipping '{}': {:#}", codelist.slug, err);
                report.skipped += 1;
            }
        }
    }
    log::info!(
        "codelist sync {} finished: {} imported, {} skipped",
        run_id,
        report.imported,
        report.skipped
    );
    Ok(report)
}

fn import_save(codelist: &RemoteCodelist, coding_system_id: i64, owner: &str) -> ConceptSave {
    ConceptSave {
        id: None,
        name: codelist.name.clone(),
        coding_system_id,
        code_attribute_header: Vec::new(),
        owner_id: owner.to_string(),
        group_id: None,
        owner_access: AccessLevel::Edit,
        group_access: AccessLevel::None,
        world_access: AccessLevel::View,
        phenotype_owner_id: None,
        components: vec![ComponentSave {
            id: None,
            name: codelist.name.clone(),
            logical_type: LogicalType::Include,
            source_type: SourceType::SelectImport,
            source: Some(codelist.slug.clone()),
            concept_ref: None,
            codes: codelist
                .codes
                .iter()
                .map(|code| CodeSave {
                    id: None,
                    code: code.code.clone(),
                    description: code.term.clone(),
                })
                .collect(),
        }],
        attributes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_builds_single_include_ruleset() {
        let codelist = RemoteCodelist {
            slug: "opensafely/asthma".to_string(),
            name: "Asthma".to_string(),
            coding_system: "SNOMED CT".to_string(),
            codes: vec![RemoteCode {
                code: "195967001".to_string(),
                term: "Asthma".to_string(),
            }],
        };
        let save = import_save(&codelist, 2, "importer");
        assert_eq!(save.coding_system_id, 2);
        assert_eq!(save.components.len(), 1);
        assert_eq!(save.components[0].logical_type, LogicalType::Include);
        assert_eq!(save.components[0].codes[0].code, "195967001");
        assert_eq!(save.components[0].source.as_deref(), Some("opensafely/asthma"));
    }
}
