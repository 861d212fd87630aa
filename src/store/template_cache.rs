use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::model::{Id, Template};

#[derive(Clone, Debug)]
struct CacheEntry {
    template: Template,
    last_accessed: Instant,
}

/// In-memory TTL cache for resolved template versions.
///
/// Template versions are immutable once written, so expiry exists only to
/// bound memory; a stale read is never incorrect.
#[derive(Debug, Clone)]
pub struct TemplateCache {
    entries: Arc<RwLock<HashMap<(Id, i32), CacheEntry>>>,
    ttl: Duration,
}

impl TemplateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn get(&self, template_id: Id, version: i32) -> Option<Template> {
        let mut entries = self.entries.write().await;
        let key = (template_id, version);
        if let Some(entry) = entries.get_mut(&key) {
            if entry.last_accessed.elapsed() > self.ttl {
                entries.remove(&key);
                return None;
            }
            entry.last_accessed = Instant::now();
            Some(entry.template.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, template: Template) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (template.id, template.template_version),
            CacheEntry {
                template,
                last_accessed: Instant::now(),
            },
        );
    }

    pub async fn clear_expired(&self) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        let now = Instant::now();
        entries.retain(|_, entry| now.duration_since(entry.last_accessed) <= ttl);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        // 1 hour
        Self::new(Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TemplateDefinition;
    use chrono::Utc;

    fn template(id: Id, version: i32) -> Template {
        let now = Utc::now();
        Template {
            id,
            name: "Clinical Phenotype".to_string(),
            template_version: version,
            definition: TemplateDefinition::default(),
            entity_class_id: Some(1),
            created_by: "admin".to_string(),
            created_at: now,
            updated_by: "admin".to_string(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn cache_keys_on_id_and_version() {
        let cache = TemplateCache::default();
        cache.put(template(1, 1)).await;
        cache.put(template(1, 2)).await;

        assert!(cache.get(1, 1).await.is_some());
        assert!(cache.get(1, 2).await.is_some());
        assert!(cache.get(1, 3).await.is_none());

        cache.clear().await;
        assert!(cache.get(1, 1).await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let cache = TemplateCache::new(Duration::from_millis(0));
        cache.put(template(1, 1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get(1, 1).await.is_none());
    }
}
