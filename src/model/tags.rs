use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::Id;

/// Whether a tag is a free taxonomy label or a curated collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    Tag,
    Collection,
}

impl std::fmt::Display for TagType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TagType::Tag => write!(f, "tag"),
            TagType::Collection => write!(f, "collection"),
        }
    }
}

impl std::str::FromStr for TagType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tag" => Ok(TagType::Tag),
            "collection" => Ok(TagType::Collection),
            _ => Err(format!("Unknown tag type: {}", s)),
        }
    }
}

/// Taxonomy label used for filtering; collections additionally scope to a
/// brand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Id,
    pub description: String,
    pub tag_type: TagType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_brand: Option<Id>,
}

impl Tag {
    pub fn tag(id: Id, description: &str) -> Self {
        Self {
            id,
            description: description.to_string(),
            tag_type: TagType::Tag,
            collection_brand: None,
        }
    }

    pub fn collection(id: Id, description: &str, brand: Option<Id>) -> Self {
        Self {
            id,
            description: description.to_string(),
            tag_type: TagType::Collection,
            collection_brand: brand,
        }
    }
}

/// Per-template visibility rule for a brand: an id whitelist and/or an
/// allow-null flag for untagged entities.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrandVisibility {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<Id>>,
    #[serde(default)]
    pub allow_null: bool,
}

/// A tenant label scoping default visibility but never published content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brand {
    pub id: Id,
    pub name: String,
    pub site_title: String,
    #[serde(default)]
    pub overrides: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub allowed_tabs: Vec<String>,
    #[serde(default)]
    pub collections_excluded_from_filters: Vec<Id>,
    #[serde(default)]
    pub visibility: BrandVisibility,
}

impl Brand {
    pub fn new(id: Id, name: &str, site_title: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            site_title: site_title.to_string(),
            overrides: HashMap::new(),
            allowed_tabs: Vec::new(),
            collections_excluded_from_filters: Vec::new(),
            visibility: BrandVisibility::default(),
        }
    }
}

/// External data source an entity can declare provenance against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
