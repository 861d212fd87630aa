use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::model::{ApiError, Id, OntologyNode};
use crate::store::traits::OntologyStore;

/// Root nodes of an ontology category.
pub async fn roots_of_type<S: OntologyStore + ?Sized>(
    store: &S,
    type_id: Id,
) -> Result<Vec<OntologyNode>, ApiError> {
    let nodes = store.list_ontology_nodes(type_id).await?;
    Ok(nodes.into_iter().filter(|n| n.is_root()).collect())
}

/// Transitive closure downward from `node_id`, excluding the node itself.
/// The graph is a DAG so a visited set suffices to terminate.
pub async fn descendant_ids<S: OntologyStore + ?Sized>(
    store: &S,
    node_id: Id,
) -> Result<BTreeSet<Id>, ApiError> {
    walk(store, node_id, |n| n.children.clone()).await
}

/// Transitive closure upward from `node_id`, excluding the node itself.
pub async fn ancestor_ids<S: OntologyStore + ?Sized>(
    store: &S,
    node_id: Id,
) -> Result<BTreeSet<Id>, ApiError> {
    walk(store, node_id, |n| n.parents.clone()).await
}

/// The roots reachable upward from `node_id` (the node itself when it is a
/// root).
pub async fn roots_of<S: OntologyStore + ?Sized>(
    store: &S,
    node_id: Id,
) -> Result<Vec<OntologyNode>, ApiError> {
    let Some(start) = store.get_ontology_node(node_id).await? else {
        return Err(ApiError::NotFound);
    };
    if start.is_root() {
        return Ok(vec![start]);
    }
    let mut roots = Vec::new();
    for id in ancestor_ids(store, node_id).await? {
        if let Some(node) = store.get_ontology_node(id).await? {
            if node.is_root() {
                roots.push(node);
            }
        }
    }
    Ok(roots)
}

/// Expand a set of node ids to include every descendant. Used by the
/// search engine's `descendants` filter modifier.
pub async fn expand_with_descendants<S: OntologyStore + ?Sized>(
    store: &S,
    ids: &[Id],
) -> Result<BTreeSet<Id>, ApiError> {
    let mut expanded: BTreeSet<Id> = ids.iter().copied().collect();
    for &id in ids {
        expanded.extend(descendant_ids(store, id).await?);
    }
    Ok(expanded)
}

async fn walk<S, F>(store: &S, start: Id, next: F) -> Result<BTreeSet<Id>, ApiError>
where
    S: OntologyStore + ?Sized,
    F: Fn(&OntologyNode) -> Vec<Id>,
{
    let mut seen: BTreeSet<Id> = BTreeSet::new();
    let mut cache: HashMap<Id, Option<OntologyNode>> = HashMap::new();
    let mut queue: VecDeque<Id> = VecDeque::new();
    queue.push_back(start);

    while let Some(id) = queue.pop_front() {
        let node = match cache.get(&id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = store.get_ontology_node(id).await?;
                cache.insert(id, fetched.clone());
                fetched
            }
        };
        let Some(node) = node else { continue };
        for link in next(&node) {
            if link != start && seen.insert(link) {
                queue.push_back(link);
            }
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn seed_tree(store: &MemoryStore) {
        // 1 -> {2, 3}, 2 -> {4}, 3 -> {4}  (diamond)
        let mut n1 = OntologyNode::new(1, 1, "cardiology");
        n1.children = vec![2, 3];
        let mut n2 = OntologyNode::new(2, 1, "hypertension");
        n2.parents = vec![1];
        n2.children = vec![4];
        let mut n3 = OntologyNode::new(3, 1, "heart failure");
        n3.parents = vec![1];
        n3.children = vec![4];
        let mut n4 = OntologyNode::new(4, 1, "secondary hypertension");
        n4.parents = vec![2, 3];
        for node in [n1, n2, n3, n4] {
            store.upsert_ontology_node(node).await.unwrap();
        }
    }

    #[tokio::test]
    async fn descendants_cover_the_diamond_once() {
        let store = MemoryStore::new();
        seed_tree(&store).await;
        let ids = descendant_ids(&store, 1).await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn ancestors_and_roots() {
        let store = MemoryStore::new();
        seed_tree(&store).await;
        let ids = ancestor_ids(&store, 4).await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let roots = roots_of(&store, 4).await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, 1);
    }

    #[tokio::test]
    async fn expansion_keeps_the_seed_ids() {
        let store = MemoryStore::new();
        seed_tree(&store).await;
        let ids = expand_with_descendants(&store, &[2]).await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![2, 4]);
    }

    #[tokio::test]
    async fn roots_of_type_excludes_children() {
        let store = MemoryStore::new();
        seed_tree(&store).await;
        let roots = roots_of_type(&store, 1).await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, "cardiology");
    }
}
