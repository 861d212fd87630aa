use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::model::{
    latest_surviving_at, cutoff_now, ApprovalStatus, Code, Codelist, CodingSystem, Component,
    Concept, ConceptCodeAttribute, ConceptSave, DataSource, EntityClass, GenericEntity, Group,
    HistoryId, HistoryRow, HistoryType, Id, OntologyNode, PublicId, PublishedRecord, Tag, TagType,
    Template,
};
use crate::store::template_cache::TemplateCache;
use crate::store::traits::{
    CodingSystemStore, ConceptStore, EntityStore, OntologyStore, PublicationStore, Store,
    TaxonomyStore, TemplateStore,
};

/// Production store. Every aggregate row is kept as a JSONB payload next to
/// the key columns queries filter on; composite writes run in one
/// transaction so readers see either the pre- or the post-write state.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    template_cache: TemplateCache,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;
        Ok(Self {
            pool,
            template_cache: TemplateCache::default(),
        })
    }

    pub fn with_template_cache_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.template_cache = TemplateCache::new(ttl);
        self
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Drop cached template versions that have outlived their TTL.
    pub async fn evict_expired_templates(&self) {
        self.template_cache.clear_expired().await;
    }
}

fn marker_of(history_type: HistoryType) -> &'static str {
    match history_type {
        HistoryType::Created => "+",
        HistoryType::Changed => "~",
        HistoryType::Deleted => "-",
    }
}

fn parse_marker(marker: &str) -> Result<HistoryType> {
    match marker {
        "+" => Ok(HistoryType::Created),
        "~" => Ok(HistoryType::Changed),
        "-" => Ok(HistoryType::Deleted),
        other => Err(anyhow!("unknown history marker '{}'", other)),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).context("Failed to serialize row payload")
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).context("Failed to deserialize row payload")
}

fn decode_data<T: DeserializeOwned>(row: &PgRow) -> Result<T> {
    decode(row.get::<serde_json::Value, _>("data"))
}

fn decode_history<T: DeserializeOwned>(row: &PgRow) -> Result<HistoryRow<T>> {
    let marker: String = row.get("history_type");
    Ok(HistoryRow {
        history_id: row.get("history_id"),
        history_date: row.get("history_date"),
        history_type: parse_marker(&marker)?,
        history_user: row.get("history_user"),
        row: decode_data(row)?,
    })
}

async fn next_id(tx: &mut Transaction<'_, Postgres>, sequence: &str) -> Result<Id> {
    let row = sqlx::query(&format!("SELECT nextval('{}') AS id", sequence))
        .fetch_one(&mut **tx)
        .await
        .context("Failed to allocate id")?;
    Ok(row.get::<i64, _>("id"))
}

const HISTORY_COLUMNS: &str = "history_id, history_date, history_type, history_user, data";

#[async_trait::async_trait]
impl CodingSystemStore for PostgresStore {
    async fn get_coding_system(&self, id: Id) -> Result<Option<CodingSystem>> {
        let row = sqlx::query("SELECT data FROM coding_systems WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch coding system")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn list_coding_systems(&self) -> Result<Vec<CodingSystem>> {
        let rows = sqlx::query("SELECT data FROM coding_systems ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list coding systems")?;
        rows.iter().map(decode_data).collect()
    }

    async fn upsert_coding_system(&self, coding_system: CodingSystem) -> Result<()> {
        sqlx::query(
            "INSERT INTO coding_systems (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(coding_system.id)
        .bind(encode(&coding_system)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert coding system")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl OntologyStore for PostgresStore {
    async fn get_ontology_node(&self, id: Id) -> Result<Option<OntologyNode>> {
        let row = sqlx::query("SELECT data FROM ontology_nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch ontology node")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn list_ontology_nodes(&self, type_id: Id) -> Result<Vec<OntologyNode>> {
        let rows = sqlx::query("SELECT data FROM ontology_nodes WHERE type_id = $1 ORDER BY id")
            .bind(type_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list ontology nodes")?;
        rows.iter().map(decode_data).collect()
    }

    async fn list_ontology_type_ids(&self) -> Result<Vec<Id>> {
        let rows = sqlx::query("SELECT DISTINCT type_id FROM ontology_nodes ORDER BY type_id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list ontology categories")?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("type_id")).collect())
    }

    async fn upsert_ontology_node(&self, mut node: OntologyNode) -> Result<()> {
        node.refresh_search_vector();
        let mut tx = self.pool.begin().await?;

        // Keep edges bidirectional.
        for &parent_id in &node.parents {
            let row = sqlx::query("SELECT data FROM ontology_nodes WHERE id = $1 FOR UPDATE")
                .bind(parent_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = row {
                let mut parent: OntologyNode = decode_data(&row)?;
                if !parent.children.contains(&node.id) {
                    parent.children.push(node.id);
                    sqlx::query("UPDATE ontology_nodes SET data = $2 WHERE id = $1")
                        .bind(parent_id)
                        .bind(encode(&parent)?)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        for &child_id in &node.children {
            let row = sqlx::query("SELECT data FROM ontology_nodes WHERE id = $1 FOR UPDATE")
                .bind(child_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = row {
                let mut child: OntologyNode = decode_data(&row)?;
                if !child.parents.contains(&node.id) {
                    child.parents.push(node.id);
                    sqlx::query("UPDATE ontology_nodes SET data = $2 WHERE id = $1")
                        .bind(child_id)
                        .bind(encode(&child)?)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        sqlx::query(
            "INSERT INTO ontology_nodes (id, type_id, data) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET type_id = EXCLUDED.type_id, data = EXCLUDED.data",
        )
        .bind(node.id)
        .bind(node.type_id)
        .bind(encode(&node)?)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert ontology node")?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaxonomyStore for PostgresStore {
    async fn get_tag(&self, id: Id) -> Result<Option<Tag>> {
        let row = sqlx::query("SELECT data FROM tags WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch tag")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn list_tags(&self, tag_type: Option<TagType>) -> Result<Vec<Tag>> {
        let rows = match tag_type {
            Some(tag_type) => {
                sqlx::query("SELECT data FROM tags WHERE tag_type = $1 ORDER BY id")
                    .bind(tag_type.to_string())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT data FROM tags ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to list tags")?;
        rows.iter().map(decode_data).collect()
    }

    async fn upsert_tag(&self, tag: Tag) -> Result<()> {
        sqlx::query(
            "INSERT INTO tags (id, tag_type, data) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET tag_type = EXCLUDED.tag_type, data = EXCLUDED.data",
        )
        .bind(tag.id)
        .bind(tag.tag_type.to_string())
        .bind(encode(&tag)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert tag")?;
        Ok(())
    }

    async fn get_brand(&self, id: Id) -> Result<Option<crate::model::Brand>> {
        let row = sqlx::query("SELECT data FROM brands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch brand")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn get_brand_by_name(&self, name: &str) -> Result<Option<crate::model::Brand>> {
        let row = sqlx::query("SELECT data FROM brands WHERE LOWER(name) = LOWER($1)")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch brand by name")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn list_brands(&self) -> Result<Vec<crate::model::Brand>> {
        let rows = sqlx::query("SELECT data FROM brands ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list brands")?;
        rows.iter().map(decode_data).collect()
    }

    async fn upsert_brand(&self, brand: crate::model::Brand) -> Result<()> {
        sqlx::query(
            "INSERT INTO brands (id, name, data) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, data = EXCLUDED.data",
        )
        .bind(brand.id)
        .bind(brand.name.clone())
        .bind(encode(&brand)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert brand")?;
        Ok(())
    }

    async fn get_data_source(&self, id: Id) -> Result<Option<DataSource>> {
        let row = sqlx::query("SELECT data FROM data_sources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch data source")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        let rows = sqlx::query("SELECT data FROM data_sources ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list data sources")?;
        rows.iter().map(decode_data).collect()
    }

    async fn upsert_data_source(&self, data_source: DataSource) -> Result<()> {
        sqlx::query(
            "INSERT INTO data_sources (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(data_source.id)
        .bind(encode(&data_source)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert data source")?;
        Ok(())
    }

    async fn get_group(&self, id: Id) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT data FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch group")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query("SELECT data FROM groups ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list groups")?;
        rows.iter().map(decode_data).collect()
    }

    async fn upsert_group(&self, group: Group) -> Result<()> {
        sqlx::query(
            "INSERT INTO groups (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(group.id)
        .bind(encode(&group)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert group")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TemplateStore for PostgresStore {
    async fn get_template(&self, id: Id) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT data FROM templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch template")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn get_template_version(&self, id: Id, version: i32) -> Result<Option<Template>> {
        // Template versions are content-addressed and never rewritten, so a
        // cache hit is always current.
        if let Some(template) = self.template_cache.get(id, version).await {
            return Ok(Some(template));
        }
        let row = sqlx::query(
            "SELECT data FROM template_history
             WHERE template_id = $1 AND template_version = $2
             ORDER BY history_id DESC LIMIT 1",
        )
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch template version")?;
        let template: Option<Template> = row.map(|r| decode_data(&r)).transpose()?;
        if let Some(template) = &template {
            self.template_cache.put(template.clone()).await;
        }
        Ok(template)
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let rows = sqlx::query("SELECT data FROM templates ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list templates")?;
        rows.iter().map(decode_data).collect()
    }

    async fn list_template_history(&self, id: Id) -> Result<Vec<HistoryRow<Template>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM template_history
             WHERE template_id = $1 ORDER BY history_id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list template history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn save_template(&self, mut template: Template, user: &str) -> Result<(Id, HistoryId)> {
        let mut tx = self.pool.begin().await?;

        let is_new = if template.id == 0 {
            template.id = next_id(&mut tx, "template_id_seq").await?;
            true
        } else {
            sqlx::query("SELECT 1 FROM templates WHERE id = $1")
                .bind(template.id)
                .fetch_optional(&mut *tx)
                .await?
                .is_none()
        };
        template.updated_by = user.to_string();
        template.updated_at = chrono::Utc::now();

        let marker = marker_of(if is_new {
            HistoryType::Created
        } else {
            HistoryType::Changed
        });
        let row = sqlx::query(
            "INSERT INTO template_history (history_type, history_user, template_id, template_version, data)
             VALUES ($1, $2, $3, $4, $5) RETURNING history_id",
        )
        .bind(marker)
        .bind(user)
        .bind(template.id)
        .bind(template.template_version)
        .bind(encode(&template)?)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to write template history")?;
        let history_id: HistoryId = row.get("history_id");

        sqlx::query(
            "INSERT INTO templates (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(template.id)
        .bind(encode(&template)?)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert template")?;

        // Seeded templates carry fixed ids; keep the allocator ahead of them.
        sqlx::query("SELECT setval('template_id_seq', (SELECT GREATEST(MAX(id), 1) FROM templates))")
            .execute(&mut *tx)
            .await
            .context("Failed to advance template id sequence")?;

        tx.commit().await?;
        self.template_cache.put(template.clone()).await;
        Ok((template.id, history_id))
    }
}

impl PostgresStore {
    async fn component_rows_tx(
        tx: &mut Transaction<'_, Postgres>,
        concept_id: Id,
    ) -> Result<Vec<HistoryRow<Component>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM component_history
             WHERE concept_id = $1 ORDER BY history_id"
        ))
        .bind(concept_id)
        .fetch_all(&mut **tx)
        .await
        .context("Failed to fetch component history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn codelist_rows_tx(
        tx: &mut Transaction<'_, Postgres>,
        component_id: Id,
    ) -> Result<Vec<HistoryRow<Codelist>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM codelist_history
             WHERE component_id = $1 ORDER BY history_id"
        ))
        .bind(component_id)
        .fetch_all(&mut **tx)
        .await
        .context("Failed to fetch codelist history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn code_rows_tx(
        tx: &mut Transaction<'_, Postgres>,
        codelist_id: Id,
    ) -> Result<Vec<HistoryRow<Code>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM code_history
             WHERE codelist_id = $1 ORDER BY history_id"
        ))
        .bind(codelist_id)
        .fetch_all(&mut **tx)
        .await
        .context("Failed to fetch code history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn attribute_rows_tx(
        tx: &mut Transaction<'_, Postgres>,
        concept_id: Id,
    ) -> Result<Vec<HistoryRow<ConceptCodeAttribute>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM attribute_history
             WHERE concept_id = $1 ORDER BY history_id"
        ))
        .bind(concept_id)
        .fetch_all(&mut **tx)
        .await
        .context("Failed to fetch attribute history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn insert_component_row(
        tx: &mut Transaction<'_, Postgres>,
        history_type: HistoryType,
        user: &str,
        component: &Component,
    ) -> Result<HistoryId> {
        let row = sqlx::query(
            "INSERT INTO component_history (history_type, history_user, component_id, concept_id, data)
             VALUES ($1, $2, $3, $4, $5) RETURNING history_id",
        )
        .bind(marker_of(history_type))
        .bind(user)
        .bind(component.id)
        .bind(component.concept_id)
        .bind(encode(component)?)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to write component history")?;
        Ok(row.get("history_id"))
    }

    async fn insert_code_row(
        tx: &mut Transaction<'_, Postgres>,
        history_type: HistoryType,
        user: &str,
        code: &Code,
    ) -> Result<HistoryId> {
        let row = sqlx::query(
            "INSERT INTO code_history (history_type, history_user, code_id, codelist_id, data)
             VALUES ($1, $2, $3, $4, $5) RETURNING history_id",
        )
        .bind(marker_of(history_type))
        .bind(user)
        .bind(code.id)
        .bind(code.codelist_id)
        .bind(encode(code)?)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to write code history")?;
        Ok(row.get("history_id"))
    }

    async fn insert_attribute_row(
        tx: &mut Transaction<'_, Postgres>,
        history_type: HistoryType,
        user: &str,
        attribute: &ConceptCodeAttribute,
    ) -> Result<HistoryId> {
        let row = sqlx::query(
            "INSERT INTO attribute_history (history_type, history_user, attribute_id, concept_id, data)
             VALUES ($1, $2, $3, $4, $5) RETURNING history_id",
        )
        .bind(marker_of(history_type))
        .bind(user)
        .bind(attribute.id)
        .bind(attribute.concept_id)
        .bind(encode(attribute)?)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to write attribute history")?;
        Ok(row.get("history_id"))
    }
}

#[async_trait::async_trait]
impl ConceptStore for PostgresStore {
    async fn get_concept(&self, id: Id) -> Result<Option<Concept>> {
        let row = sqlx::query("SELECT data FROM concepts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch concept")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn get_concept_version(
        &self,
        id: Id,
        history_id: HistoryId,
    ) -> Result<Option<HistoryRow<Concept>>> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM concept_history
             WHERE concept_id = $1 AND history_id = $2"
        ))
        .bind(id)
        .bind(history_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch concept version")?;
        row.map(|r| decode_history(&r)).transpose()
    }

    async fn latest_concept_version_id(&self, id: Id) -> Result<Option<HistoryId>> {
        let row = sqlx::query(
            "SELECT MAX(history_id) AS history_id FROM concept_history WHERE concept_id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch latest concept version")?;
        Ok(row.get::<Option<i64>, _>("history_id"))
    }

    async fn list_concepts(&self) -> Result<Vec<Concept>> {
        let rows = sqlx::query("SELECT data FROM concepts ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list concepts")?;
        rows.iter().map(decode_data).collect()
    }

    async fn list_concept_history(&self, id: Id) -> Result<Vec<HistoryRow<Concept>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM concept_history
             WHERE concept_id = $1 ORDER BY history_id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list concept history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn component_history_for_concept(
        &self,
        concept_id: Id,
    ) -> Result<Vec<HistoryRow<Component>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM component_history
             WHERE concept_id = $1 ORDER BY history_id"
        ))
        .bind(concept_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch component history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn codelist_history_for_component(
        &self,
        component_id: Id,
    ) -> Result<Vec<HistoryRow<Codelist>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM codelist_history
             WHERE component_id = $1 ORDER BY history_id"
        ))
        .bind(component_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch codelist history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn code_history_for_codelist(&self, codelist_id: Id) -> Result<Vec<HistoryRow<Code>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM code_history
             WHERE codelist_id = $1 ORDER BY history_id"
        ))
        .bind(codelist_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch code history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn attribute_history_for_concept(
        &self,
        concept_id: Id,
    ) -> Result<Vec<HistoryRow<ConceptCodeAttribute>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM attribute_history
             WHERE concept_id = $1 ORDER BY history_id"
        ))
        .bind(concept_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch attribute history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn save_concept_tree(&self, save: ConceptSave, user: &str) -> Result<(Id, HistoryId)> {
        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now();

        let (concept_id, is_new, created_by, created_at) = match save.id {
            Some(id) => {
                let row = sqlx::query("SELECT data FROM concepts WHERE id = $1 FOR UPDATE")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| anyhow!("concept {} does not exist", id))?;
                let existing: Concept = decode_data(&row)?;
                if existing.is_deleted {
                    return Err(anyhow!("concept {} is deleted", id));
                }
                (id, false, existing.created_by, existing.created_at)
            }
            None => {
                let id = next_id(&mut tx, "concept_id_seq").await?;
                (id, true, user.to_string(), now)
            }
        };

        // Children first: every child row must pre-date the concept row.
        let component_rows = Self::component_rows_tx(&mut tx, concept_id).await?;
        let existing_components: Vec<Component> =
            latest_surviving_at(&component_rows, cutoff_now(), |c: &Component| c.id)
                .into_iter()
                .map(|row| row.row.clone())
                .collect();
        let submitted_ids: Vec<Id> = save.components.iter().filter_map(|c| c.id).collect();

        for stale in existing_components
            .iter()
            .filter(|c| !submitted_ids.contains(&c.id))
        {
            Self::insert_component_row(&mut tx, HistoryType::Deleted, user, stale).await?;
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
                None => (
                    next_id(&mut tx, "component_id_seq").await?,
                    HistoryType::Created,
                ),
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
            Self::insert_component_row(&mut tx, component_type, user, &component).await?;

            let codelist_rows = Self::codelist_rows_tx(&mut tx, component_id).await?;
            let codelist = match latest_surviving_at(&codelist_rows, cutoff_now(), |c: &Codelist| {
                c.id
            })
            .into_iter()
            .next()
            {
                Some(row) => row.row.clone(),
                None => {
                    let codelist = Codelist {
                        id: next_id(&mut tx, "codelist_id_seq").await?,
                        component_id,
                        description: component_save.name.clone(),
                    };
                    sqlx::query(
                        "INSERT INTO codelist_history (history_type, history_user, codelist_id, component_id, data)
                         VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(marker_of(HistoryType::Created))
                    .bind(user)
                    .bind(codelist.id)
                    .bind(component_id)
                    .bind(encode(&codelist)?)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to write codelist history")?;
                    codelist
                }
            };

            let code_rows = Self::code_rows_tx(&mut tx, codelist.id).await?;
            let existing_codes: Vec<Code> =
                latest_surviving_at(&code_rows, cutoff_now(), |c: &Code| c.id)
                    .into_iter()
                    .map(|row| row.row.clone())
                    .collect();
            let submitted_code_ids: Vec<Id> =
                component_save.codes.iter().filter_map(|c| c.id).collect();
            for stale in existing_codes
                .iter()
                .filter(|c| !submitted_code_ids.contains(&c.id))
            {
                Self::insert_code_row(&mut tx, HistoryType::Deleted, user, stale).await?;
            }
            for code_save in &component_save.codes {
                let (code_id, code_type) = match code_save.id {
                    Some(id) => (id, HistoryType::Changed),
                    None => (next_id(&mut tx, "code_id_seq").await?, HistoryType::Created),
                };
                let unchanged = existing_codes.iter().any(|c| {
                    c.id == code_id
                        && c.code == code_save.code
                        && c.description == code_save.description
                });
                if unchanged && code_save.id.is_some() {
                    continue;
                }
                let code = Code {
                    id: code_id,
                    codelist_id: codelist.id,
                    code: code_save.code.clone(),
                    description: code_save.description.clone(),
                };
                Self::insert_code_row(&mut tx, code_type, user, &code).await?;
            }
        }

        // Attribute rows are rewritten wholesale as well.
        let attribute_rows = Self::attribute_rows_tx(&mut tx, concept_id).await?;
        let existing_attributes: Vec<ConceptCodeAttribute> =
            latest_surviving_at(&attribute_rows, cutoff_now(), |a: &ConceptCodeAttribute| {
                a.id
            })
            .into_iter()
            .map(|row| row.row.clone())
            .collect();
        for stale in existing_attributes
            .iter()
            .filter(|a| !save.attributes.iter().any(|(code, _)| *code == a.code))
        {
            Self::insert_attribute_row(&mut tx, HistoryType::Deleted, user, stale).await?;
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
                None => (
                    next_id(&mut tx, "attribute_id_seq").await?,
                    HistoryType::Created,
                ),
            };
            let attribute = ConceptCodeAttribute {
                id: attribute_id,
                concept_id,
                code: code.clone(),
                attributes: values.clone(),
            };
            Self::insert_attribute_row(&mut tx, attribute_type, user, &attribute).await?;
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
        let marker = marker_of(if is_new {
            HistoryType::Created
        } else {
            HistoryType::Changed
        });
        let row = sqlx::query(
            "INSERT INTO concept_history (history_type, history_user, concept_id, data)
             VALUES ($1, $2, $3, $4) RETURNING history_id",
        )
        .bind(marker)
        .bind(user)
        .bind(concept_id)
        .bind(encode(&concept)?)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to write concept history")?;
        let history_id: HistoryId = row.get("history_id");

        sqlx::query(
            "INSERT INTO concepts (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(concept_id)
        .bind(encode(&concept)?)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert concept")?;

        tx.commit().await?;
        Ok((concept_id, history_id))
    }

    async fn delete_concept(&self, id: Id, user: &str) -> Result<HistoryId> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data FROM concepts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("concept {} does not exist", id))?;
        let mut concept: Concept = decode_data(&row)?;
        concept.is_deleted = true;
        concept.updated_by = user.to_string();
        concept.updated_at = chrono::Utc::now();

        let history_row = sqlx::query(
            "INSERT INTO concept_history (history_type, history_user, concept_id, data)
             VALUES ($1, $2, $3, $4) RETURNING history_id",
        )
        .bind(marker_of(HistoryType::Deleted))
        .bind(user)
        .bind(id)
        .bind(encode(&concept)?)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to write concept tombstone")?;
        let history_id: HistoryId = history_row.get("history_id");

        sqlx::query("UPDATE concepts SET data = $2 WHERE id = $1")
            .bind(id)
            .bind(encode(&concept)?)
            .execute(&mut *tx)
            .await
            .context("Failed to update concept")?;

        tx.commit().await?;
        Ok(history_id)
    }
}

#[async_trait::async_trait]
impl EntityStore for PostgresStore {
    async fn get_entity_class(&self, prefix: &str) -> Result<Option<EntityClass>> {
        let row = sqlx::query(
            "SELECT data FROM entity_classes WHERE UPPER(entity_prefix) = UPPER($1)",
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch entity class")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn list_entity_classes(&self) -> Result<Vec<EntityClass>> {
        let rows = sqlx::query("SELECT data FROM entity_classes ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entity classes")?;
        rows.iter().map(decode_data).collect()
    }

    async fn upsert_entity_class(&self, class: EntityClass) -> Result<()> {
        // The unique index on UPPER(entity_prefix) rejects prefix clashes.
        sqlx::query(
            "INSERT INTO entity_classes (id, entity_prefix, entity_count, data)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                 entity_prefix = EXCLUDED.entity_prefix,
                 data = EXCLUDED.data",
        )
        .bind(class.id)
        .bind(class.entity_prefix.clone())
        .bind(class.entity_count)
        .bind(encode(&class)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert entity class")?;
        Ok(())
    }

    async fn allocate_public_id(&self, prefix: &str) -> Result<PublicId> {
        // Single-statement increment: the row lock serialises allocations.
        let row = sqlx::query(
            "UPDATE entity_classes
             SET entity_count = entity_count + 1,
                 data = jsonb_set(data, '{entity_count}', to_jsonb(entity_count + 1))
             WHERE UPPER(entity_prefix) = UPPER($1)
             RETURNING entity_prefix, entity_count",
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to allocate public id")?
        .ok_or_else(|| anyhow!("no entity class with prefix '{}'", prefix))?;
        Ok(PublicId::new(
            &row.get::<String, _>("entity_prefix"),
            row.get::<i64, _>("entity_count"),
        ))
    }

    async fn create_entity(&self, mut entity: GenericEntity) -> Result<(PublicId, HistoryId)> {
        entity.publish_status = None;
        let mut tx = self.pool.begin().await?;
        let public_id = entity.public_id.clone();

        let row = sqlx::query(
            "INSERT INTO entity_history (history_type, history_user, prefix, entity_id, template_id, template_version, data)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING history_id",
        )
        .bind(marker_of(HistoryType::Created))
        .bind(entity.created_by.clone())
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .bind(entity.template_id)
        .bind(entity.template_version)
        .bind(encode(&entity)?)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to write entity history")?;
        let history_id: HistoryId = row.get("history_id");

        // The primary key rejects a re-used public id.
        sqlx::query("INSERT INTO entities (prefix, entity_id, data) VALUES ($1, $2, $3)")
            .bind(public_id.prefix.clone())
            .bind(public_id.entity_id)
            .bind(encode(&entity)?)
            .execute(&mut *tx)
            .await
            .context("Failed to insert entity")?;

        tx.commit().await?;
        Ok((public_id, history_id))
    }

    async fn update_entity(&self, entity: GenericEntity) -> Result<HistoryId> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM entities WHERE prefix = $1 AND entity_id = $2")
            .bind(entity.public_id.prefix.clone())
            .bind(entity.public_id.entity_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(anyhow!("entity {} does not exist", entity.public_id));
        }

        let history_type = if entity.is_deleted {
            HistoryType::Deleted
        } else {
            HistoryType::Changed
        };
        let row = sqlx::query(
            "INSERT INTO entity_history (history_type, history_user, prefix, entity_id, template_id, template_version, data)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING history_id",
        )
        .bind(marker_of(history_type))
        .bind(entity.updated_by.clone())
        .bind(entity.public_id.prefix.clone())
        .bind(entity.public_id.entity_id)
        .bind(entity.template_id)
        .bind(entity.template_version)
        .bind(encode(&entity)?)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to write entity history")?;
        let history_id: HistoryId = row.get("history_id");

        sqlx::query("UPDATE entities SET data = $3 WHERE prefix = $1 AND entity_id = $2")
            .bind(entity.public_id.prefix.clone())
            .bind(entity.public_id.entity_id)
            .bind(encode(&entity)?)
            .execute(&mut *tx)
            .await
            .context("Failed to update entity")?;

        tx.commit().await?;
        Ok(history_id)
    }

    async fn get_entity(&self, public_id: &PublicId) -> Result<Option<GenericEntity>> {
        let row = sqlx::query("SELECT data FROM entities WHERE prefix = $1 AND entity_id = $2")
            .bind(public_id.prefix.clone())
            .bind(public_id.entity_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch entity")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn get_entity_version(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
    ) -> Result<Option<HistoryRow<GenericEntity>>> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM entity_history
             WHERE prefix = $1 AND entity_id = $2 AND history_id = $3"
        ))
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .bind(history_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch entity version")?;
        row.map(|r| decode_history(&r)).transpose()
    }

    async fn latest_entity_version_id(&self, public_id: &PublicId) -> Result<Option<HistoryId>> {
        let row = sqlx::query(
            "SELECT MAX(history_id) AS history_id FROM entity_history
             WHERE prefix = $1 AND entity_id = $2",
        )
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch latest entity version")?;
        Ok(row.get::<Option<i64>, _>("history_id"))
    }

    async fn list_entity_history(
        &self,
        public_id: &PublicId,
    ) -> Result<Vec<HistoryRow<GenericEntity>>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM entity_history
             WHERE prefix = $1 AND entity_id = $2 ORDER BY history_id"
        ))
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list entity history")?;
        rows.iter().map(decode_history).collect()
    }

    async fn list_entities(&self) -> Result<Vec<GenericEntity>> {
        let rows = sqlx::query("SELECT data FROM entities ORDER BY entity_id, prefix")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entities")?;
        rows.iter().map(decode_data).collect()
    }

    async fn list_entities_for_template(
        &self,
        template_id: Id,
        template_version: Option<i32>,
    ) -> Result<Vec<HistoryRow<GenericEntity>>> {
        let rows = match template_version {
            Some(version) => {
                sqlx::query(&format!(
                    "SELECT {HISTORY_COLUMNS} FROM entity_history
                     WHERE template_id = $1 AND template_version = $2 ORDER BY history_id"
                ))
                .bind(template_id)
                .bind(version)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {HISTORY_COLUMNS} FROM entity_history
                     WHERE template_id = $1 ORDER BY history_id"
                ))
                .bind(template_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list entity history for template")?;
        rows.iter().map(decode_history).collect()
    }
}

#[async_trait::async_trait]
impl PublicationStore for PostgresStore {
    async fn publication_records(&self, public_id: &PublicId) -> Result<Vec<PublishedRecord>> {
        let rows = sqlx::query(
            "SELECT data FROM publications WHERE prefix = $1 AND entity_id = $2 ORDER BY id",
        )
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch publication records")?;
        rows.iter().map(decode_data).collect()
    }

    async fn latest_publication_record(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
    ) -> Result<Option<PublishedRecord>> {
        let row = sqlx::query(
            "SELECT data FROM publications
             WHERE prefix = $1 AND entity_id = $2 AND entity_history_id = $3
             ORDER BY id DESC LIMIT 1",
        )
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .bind(history_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest publication record")?;
        row.map(|r| decode_data(&r)).transpose()
    }

    async fn set_publication(
        &self,
        public_id: &PublicId,
        history_id: HistoryId,
        status: ApprovalStatus,
        moderator_id: Option<&str>,
        actor: &str,
    ) -> Result<PublishedRecord> {
        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now();

        let id_row = sqlx::query(
            "INSERT INTO publications (prefix, entity_id, entity_history_id, data)
             VALUES ($1, $2, $3, '{}'::jsonb) RETURNING id",
        )
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .bind(history_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert publication record")?;
        let record = PublishedRecord {
            id: id_row.get::<i64, _>("id"),
            entity_prefix: public_id.prefix.clone(),
            entity_id: public_id.entity_id,
            entity_history_id: history_id,
            approval_status: status,
            moderator_id: moderator_id.map(str::to_string),
            created_by: actor.to_string(),
            created_at: now,
            modified_at: now,
        };
        sqlx::query("UPDATE publications SET data = $2 WHERE id = $1")
            .bind(record.id)
            .bind(encode(&record)?)
            .execute(&mut *tx)
            .await
            .context("Failed to store publication record")?;

        // Denormalise onto the historic row and, when this is the latest
        // version, onto the live entity as well.
        let status_json = encode(&status)?;
        sqlx::query(
            "UPDATE entity_history SET data = jsonb_set(data, '{publish_status}', $4)
             WHERE prefix = $1 AND entity_id = $2 AND history_id = $3",
        )
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .bind(history_id)
        .bind(status_json.clone())
        .execute(&mut *tx)
        .await
        .context("Failed to denormalise publish status on history")?;

        sqlx::query(
            "UPDATE entities SET data = jsonb_set(data, '{publish_status}', $3)
             WHERE prefix = $1 AND entity_id = $2
               AND $4 = (SELECT MAX(history_id) FROM entity_history
                         WHERE prefix = $1 AND entity_id = $2)",
        )
        .bind(public_id.prefix.clone())
        .bind(public_id.entity_id)
        .bind(status_json)
        .bind(history_id)
        .execute(&mut *tx)
        .await
        .context("Failed to denormalise publish status on entity")?;

        tx.commit().await?;
        Ok(record)
    }
}

impl Store for PostgresStore {}
