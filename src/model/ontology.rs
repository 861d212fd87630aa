use serde::{Deserialize, Serialize};

use crate::model::Id;

/// A typed node inside the clinical ontology DAG.
///
/// Parent/child edges are stored on both sides; a node is a root iff it
/// has no parents and a leaf iff it has no children. `search_vector` is
/// recomputed from the name on every write, so full-text matching never
/// depends on an external trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyNode {
    pub id: Id,
    /// Ontology category (e.g. disease classification, anatomy).
    pub type_id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atlas_id: Option<Id>,
    #[serde(default)]
    pub parents: Vec<Id>,
    #[serde(default)]
    pub children: Vec<Id>,
    /// Lowercased token soup derived from `name`.
    #[serde(default)]
    pub search_vector: String,
}

impl OntologyNode {
    pub fn new(id: Id, type_id: Id, name: &str) -> Self {
        let mut node = Self {
            id,
            type_id,
            name: name.to_string(),
            atlas_id: None,
            parents: Vec::new(),
            children: Vec::new(),
            search_vector: String::new(),
        };
        node.refresh_search_vector();
        node
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Rebuild the search vector from the node name.
    pub fn refresh_search_vector(&mut self) {
        self.search_vector = self
            .name
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
    }

    /// Whether the node's search vector matches every token of `query`.
    pub fn matches_search(&self, query: &str) -> bool {
        let vector = &self.search_vector;
        query
            .split_whitespace()
            .all(|token| vector.contains(&token.to_lowercase()))
    }
}

/// Lightweight projection used when listing grouped ontology roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyNodeSummary {
    pub id: Id,
    pub name: String,
    pub type_id: Id,
    pub is_leaf: bool,
}

impl From<&OntologyNode> for OntologyNodeSummary {
    fn from(node: &OntologyNode) -> Self {
        Self {
            id: node.id,
            name: node.name.clone(),
            type_id: node.type_id,
            is_leaf: node.is_leaf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_vector_follows_name() {
        let mut node = OntologyNode::new(1, 1, "Chronic Kidney-Disease");
        assert_eq!(node.search_vector, "chronic kidney disease");
        assert!(node.matches_search("kidney chronic"));
        assert!(!node.matches_search("liver"));

        node.name = "Hypertension".to_string();
        node.refresh_search_vector();
        assert!(node.matches_search("hyper"));
    }

    #[test]
    fn root_and_leaf_follow_edges() {
        let mut node = OntologyNode::new(1, 1, "root");
        assert!(node.is_root());
        assert!(node.is_leaf());
        node.children.push(2);
        assert!(!node.is_leaf());
        node.parents.push(3);
        assert!(!node.is_root());
    }
}
