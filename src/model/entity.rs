use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::{AccessLevel, ApiError, ApprovalStatus, HistoryId, Id};

/// A class of generic entities sharing a public id prefix.
///
/// `entity_count` is the id allocator: creation increments it and the
/// dependent insert in one atomic store operation, so two concurrent
/// creates can never share or skip an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityClass {
    pub id: Id,
    pub name: String,
    pub entity_prefix: String,
    pub entity_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Public identifier of a generic entity, e.g. `PH12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicId {
    pub prefix: String,
    pub entity_id: i64,
}

impl PublicId {
    pub fn new(prefix: &str, entity_id: i64) -> Self {
        Self {
            prefix: prefix.to_string(),
            entity_id,
        }
    }

    /// Split `<prefix><digits>` at the first digit group.
    pub fn parse(raw: &str) -> Result<Self, ApiError> {
        let trimmed = raw.trim();
        let split = trimmed
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map(|(i, _)| i)
            .ok_or_else(|| ApiError::MalformedId(raw.to_string()))?;
        let (prefix, digits) = trimmed.split_at(split);
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ApiError::MalformedId(raw.to_string()));
        }
        let entity_id: i64 = digits
            .parse()
            .map_err(|_| ApiError::MalformedId(raw.to_string()))?;
        Ok(Self {
            prefix: prefix.to_uppercase(),
            entity_id,
        })
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.entity_id)
    }
}

impl FromStr for PublicId {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicId::parse(s)
    }
}

impl Serialize for PublicId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PublicId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A template-shaped top-level artifact (phenotype, working set, ...).
///
/// The fixed metadata fields are shared by every template via the base
/// metadata schema; everything template-specific lives in `template_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericEntity {
    #[serde(rename = "id")]
    pub public_id: PublicId,
    pub entity_class_id: Id,

    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Id>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_requirements: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_comments: Option<String>,

    pub template_id: Id,
    pub template_version: i32,
    /// JSON object shaped by the template at `template_version`.
    pub template_data: serde_json::Value,

    #[serde(default)]
    pub brands: Vec<Id>,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Id>,
    #[serde(default)]
    pub owner_access: AccessLevel,
    #[serde(default)]
    pub group_access: AccessLevel,
    #[serde(default)]
    pub world_access: AccessLevel,
    #[serde(default)]
    pub is_deleted: bool,
    /// Denormalized approval status of the latest published record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_status: Option<ApprovalStatus>,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl GenericEntity {
    /// Pinned `(concept_id, concept_version_id)` pairs referenced from
    /// `template_data.concept_information`.
    pub fn concept_references(&self) -> Vec<(Id, HistoryId)> {
        concept_references_in(&self.template_data)
    }

    /// Natural ordering key for pagination: the integer tail of the id,
    /// tie-broken by the raw id string.
    pub fn natural_order_key(&self) -> (i64, String) {
        (self.public_id.entity_id, self.public_id.to_string())
    }
}

/// Extract concept references from a `template_data` object.
pub fn concept_references_in(template_data: &serde_json::Value) -> Vec<(Id, HistoryId)> {
    let mut refs = Vec::new();
    if let Some(items) = template_data
        .get("concept_information")
        .and_then(|v| v.as_array())
    {
        for item in items {
            let concept_id = item.get("concept_id").and_then(|v| v.as_i64());
            let version_id = item.get("concept_version_id").and_then(|v| v.as_i64());
            if let (Some(cid), Some(vid)) = (concept_id, version_id) {
                refs.push((cid, vid));
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_id_round_trips() {
        for raw in ["PH1", "PH123", "WS40", "C9000"] {
            let parsed = PublicId::parse(raw).unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn public_id_rejects_malformed_input() {
        for raw in ["", "PH", "123", "P-1", "1PH2", "PH1x"] {
            assert!(PublicId::parse(raw).is_err(), "expected {raw:?} to fail");
        }
    }

    #[test]
    fn public_id_uppercases_prefix() {
        let parsed = PublicId::parse("ph12").unwrap();
        assert_eq!(parsed.prefix, "PH");
        assert_eq!(parsed.entity_id, 12);
    }

    #[test]
    fn concept_references_read_from_template_data() {
        let data = serde_json::json!({
            "concept_information": [
                { "concept_id": 9, "concept_version_id": 3 },
                { "concept_id": 11, "concept_version_id": 7, "details": {} },
                { "concept_id": "bad" }
            ]
        });
        assert_eq!(concept_references_in(&data), vec![(9, 3), (11, 7)]);
        assert!(concept_references_in(&serde_json::json!({})).is_empty());
    }
}
