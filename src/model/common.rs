use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric primary key used by concepts, templates, tags and friends.
pub type Id = i64;

/// Monotonically increasing identifier of a single history row.
pub type HistoryId = i64;

/// Access level granted to the owner, the owning group, or the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    None,
    View,
    Edit,
}

impl Default for AccessLevel {
    fn default() -> Self {
        AccessLevel::None
    }
}

impl AccessLevel {
    pub fn can_view(&self) -> bool {
        matches!(self, AccessLevel::View | AccessLevel::Edit)
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, AccessLevel::Edit)
    }
}

/// Kind of mutation a history row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryType {
    #[serde(rename = "+")]
    Created,
    #[serde(rename = "~")]
    Changed,
    #[serde(rename = "-")]
    Deleted,
}

impl HistoryType {
    pub fn is_delete(&self) -> bool {
        matches!(self, HistoryType::Deleted)
    }
}

/// An immutable snapshot of a row at a specific version.
///
/// History tables are append-only and are the source of truth for every
/// read path; the live tables only cache the latest row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow<T> {
    pub history_id: HistoryId,
    pub history_date: DateTime<Utc>,
    pub history_type: HistoryType,
    pub history_user: Option<String>,
    #[serde(flatten)]
    pub row: T,
}

impl<T> HistoryRow<T> {
    pub fn new(
        history_id: HistoryId,
        history_type: HistoryType,
        history_user: Option<String>,
        row: T,
    ) -> Self {
        Self {
            history_id,
            history_date: Utc::now(),
            history_type,
            history_user,
            row,
        }
    }
}

/// Point on the history timeline a temporal read is anchored to.
///
/// The `history_id` component breaks same-instant ties: rows written in
/// the same transaction as the anchoring version (and earlier) count,
/// later ones do not.
pub type Cutoff = (DateTime<Utc>, HistoryId);

/// Cutoff admitting every row written so far.
pub fn cutoff_now() -> Cutoff {
    (Utc::now(), HistoryId::MAX)
}

/// Keep, per id, only the latest history row at or before `at`, dropping
/// ids whose latest surviving row is a tombstone.
///
/// This is the primitive every temporal read is built from.
pub fn latest_surviving_at<T, F>(
    rows: &[HistoryRow<T>],
    at: Cutoff,
    id_of: F,
) -> Vec<&HistoryRow<T>>
where
    F: Fn(&T) -> Id,
{
    use std::collections::HashMap;

    let mut latest: HashMap<Id, &HistoryRow<T>> = HashMap::new();
    for row in rows {
        if (row.history_date, row.history_id) > at {
            continue;
        }
        let key = id_of(&row.row);
        match latest.get(&key) {
            Some(existing) if existing.history_id >= row.history_id => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }

    let mut survivors: Vec<&HistoryRow<T>> = latest
        .into_values()
        .filter(|row| !row.history_type.is_delete())
        .collect();
    survivors.sort_by_key(|row| id_of(&row.row));
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: Id,
        value: i32,
    }

    fn row(history_id: HistoryId, id: Id, value: i32, history_type: HistoryType) -> HistoryRow<Row> {
        HistoryRow::new(history_id, history_type, None, Row { id, value })
    }

    #[test]
    fn latest_surviving_keeps_newest_row_per_id() {
        let rows = vec![
            row(1, 10, 1, HistoryType::Created),
            row(2, 10, 2, HistoryType::Changed),
            row(3, 11, 5, HistoryType::Created),
        ];
        let survivors = latest_surviving_at(&rows, cutoff_now(), |r| r.id);
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].row.value, 2);
        assert_eq!(survivors[1].row.value, 5);
    }

    #[test]
    fn latest_surviving_drops_tombstoned_ids() {
        let rows = vec![
            row(1, 10, 1, HistoryType::Created),
            row(2, 10, 1, HistoryType::Deleted),
            row(3, 11, 5, HistoryType::Created),
        ];
        let survivors = latest_surviving_at(&rows, cutoff_now(), |r| r.id);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].row.id, 11);
    }

    #[test]
    fn history_type_markers_serialize_as_symbols() {
        assert_eq!(
            serde_json::to_string(&HistoryType::Created).unwrap(),
            "\"+\""
        );
        assert_eq!(
            serde_json::to_string(&HistoryType::Deleted).unwrap(),
            "\"-\""
        );
    }
}
