//! NodeId → Tag cache in front of the metadata repository.
//!
//! Populated lazily, invalidated explicitly. Misses are not cached: a tag
//! added to the store becomes visible after the next operator reload, an
//! unknown node id costs one lookup each time. Concurrent readers share the
//! map; invalidation takes the exclusive lock and the last writer wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::model::Tag;
use crate::storage::{MetadataRepository, StoreError};

pub struct TagCache {
    repository: Arc<MetadataRepository>,
    map: RwLock<HashMap<String, Arc<Tag>>>,
    /// Repository generation the map was filled under; a reload bumps the
    /// repository's counter and the next resolve clears stale entries.
    filled_generation: AtomicU64,
}

impl std::fmt::Debug for TagCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagCache")
            .field("entries", &self.map.read().map(|m| m.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl TagCache {
    pub fn new(repository: Arc<MetadataRepository>) -> Self {
        Self {
            repository,
            map: RwLock::new(HashMap::new()),
            filled_generation: AtomicU64::new(0),
        }
    }

    /// Resolve a node id to its tag definition.
    ///
    /// Cached entries are returned without touching the store. A miss
    /// consults the repository and caches a hit; an unknown node id returns
    /// `None` without negative caching.
    pub async fn resolve(&self, node_id: &str) -> Result<Option<Arc<Tag>>, StoreError> {
        self.drop_stale_entries();

        if let Some(tag) = self
            .map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
        {
            return Ok(Some(Arc::clone(tag)));
        }

        let Some(tag) = self.repository.get_tag_by_node_id(node_id).await? else {
            return Ok(None);
        };

        let tag = Arc::new(tag);
        self.map
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.to_string(), Arc::clone(&tag));

        Ok(Some(tag))
    }

    /// Empty the map; the next resolve repopulates from the repository.
    pub fn invalidate(&self) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        let dropped = map.len();
        map.clear();
        self.filled_generation
            .store(self.repository.generation(), Ordering::SeqCst);
        tracing::debug!(dropped, "Tag cache invalidated");
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drop_stale_entries(&self) {
        let current = self.repository.generation();
        if self.filled_generation.load(Ordering::SeqCst) != current {
            self.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;
    use crate::storage::connect;

    async fn repository() -> Arc<MetadataRepository> {
        let pool = connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO Machines (Name, OpcEndpoint, AutomateType, IsActive)
             VALUES ('press-01', 'opc.tcp://10.0.0.1:4840', 'S7-1500', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO Tags (MachineId, Name, NodeId, DataType, IsActive)
             VALUES (1, 'temperature', 'ns=2;s=T', 'Float', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        Arc::new(MetadataRepository::new(pool))
    }

    #[tokio::test]
    async fn test_resolve_caches_hit() {
        let cache = TagCache::new(repository().await);

        let tag = cache.resolve("ns=2;s=T").await.unwrap().unwrap();
        assert_eq!(tag.name, "temperature");
        assert_eq!(cache.len(), 1);

        // Second resolve is served from the map.
        let again = cache.resolve("ns=2;s=T").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&tag, &again));
    }

    #[tokio::test]
    async fn test_miss_is_not_cached() {
        let cache = TagCache::new(repository().await);

        assert!(cache.resolve("ns=2;s=UNKNOWN").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_clears_map() {
        let cache = TagCache::new(repository().await);
        cache.resolve("ns=2;s=T").await.unwrap();
        assert_eq!(cache.len(), 1);

        cache.invalidate();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_repository_reload_invalidates_on_next_resolve() {
        let repo = repository().await;
        let cache = TagCache::new(Arc::clone(&repo));
        cache.resolve("ns=2;s=T").await.unwrap();
        assert_eq!(cache.len(), 1);

        repo.reload();

        // The next resolve observes the bumped generation, refetches, and
        // the entry is a fresh allocation.
        let tag = cache.resolve("ns=2;s=T").await.unwrap().unwrap();
        assert_eq!(tag.name, "temperature");
        assert_eq!(cache.len(), 1);
    }
}
