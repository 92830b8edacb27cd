use std::collections::BTreeMap;
use std::fmt;

use serde_derive::Serialize;

use crate::clock::Timestamp;
use crate::history::{HistoryBuffer, HistoryPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Free,
    Occupied,
    #[default]
    Unknown,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotStatus::Free => "free",
            SlotStatus::Occupied => "occupied",
            SlotStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Partial update decoded from one payload. Only `Some` fields are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub status: Option<SlotStatus>,
    pub distance: Option<f64>,
    pub rssi: Option<f64>,
    pub uptime: Option<f64>,
    pub online: Option<bool>,
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.distance.is_none()
            && self.rssi.is_none()
            && self.uptime.is_none()
            && self.online.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub id: String,
    pub status: SlotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl EntityState {
    pub fn new(id: &str, status: SlotStatus) -> Self {
        EntityState {
            id: id.to_string(),
            status,
            distance: None,
            rssi: None,
            uptime: None,
            online: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The id had no entry before this merge.
    pub created: bool,
}

#[derive(Debug)]
struct Entry {
    state: EntityState,
    distance_at: Option<Timestamp>,
    history: HistoryBuffer,
}

impl Entry {
    fn new(id: &str, status: SlotStatus, capacity: usize) -> Self {
        Entry {
            state: EntityState::new(id, status),
            distance_at: None,
            history: HistoryBuffer::new(capacity),
        }
    }
}

/// Authoritative id -> state mapping. Mutated only through `merge`, apart from
/// staleness invalidation and explicit view resets.
#[derive(Debug)]
pub struct StateStore {
    entries: BTreeMap<String, Entry>,
    history_capacity: usize,
}

impl StateStore {
    pub fn new(history_capacity: usize) -> Self {
        StateStore {
            entries: BTreeMap::new(),
            history_capacity,
        }
    }

    /// Creates entries for `ids` that do not exist yet.
    pub fn seed<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>, status: SlotStatus) {
        for id in ids {
            if !self.entries.contains_key(id) {
                let entry = Entry::new(id, status, self.history_capacity);
                self.entries.insert(id.to_string(), entry);
            }
        }
    }

    /// Upserts `id` and overwrites exactly the fields present in `fragment`.
    pub fn merge(&mut self, id: &str, fragment: &Fragment, now: Timestamp) -> MergeOutcome {
        let created = !self.entries.contains_key(id);
        let capacity = self.history_capacity;
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Entry::new(id, SlotStatus::Unknown, capacity));

        let state = &mut entry.state;
        if let Some(status) = fragment.status {
            state.status = status;
        }
        if let Some(distance) = fragment.distance {
            state.distance = Some(distance);
            entry.distance_at = Some(now);
            entry.history.push(HistoryPoint { at: now, distance });
        }
        if let Some(rssi) = fragment.rssi {
            state.rssi = Some(rssi);
        }
        if let Some(uptime) = fragment.uptime {
            state.uptime = Some(uptime);
        }
        if let Some(online) = fragment.online {
            state.online = Some(online);
        }
        state.updated_at = Some(state.updated_at.map_or(now, |prev| prev.max(now)));

        MergeOutcome { created }
    }

    pub fn read(&self, id: &str) -> EntityState {
        self.entries
            .get(id)
            .map(|entry| entry.state.clone())
            .unwrap_or_else(|| EntityState::new(id, SlotStatus::Unknown))
    }

    pub fn history(&self, id: &str) -> Vec<HistoryPoint> {
        self.entries
            .get(id)
            .map(|entry| entry.history.to_vec())
            .unwrap_or_default()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Ids holding a distance reading, with the time it was merged.
    pub fn distance_stamps(&self) -> impl Iterator<Item = (&str, Timestamp)> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| entry.distance_at.map(|at| (id.as_str(), at)))
    }

    /// Drops the distance reading without counting as a merge.
    pub fn invalidate_distance(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.distance_at.is_some() || entry.state.distance.is_some() => {
                entry.state.distance = None;
                entry.distance_at = None;
                true
            }
            _ => false,
        }
    }

    /// Puts `id` back to its initial `unknown` view and empties its history.
    pub fn reset(&mut self, id: &str) {
        let entry = Entry::new(id, SlotStatus::Unknown, self.history_capacity);
        self.entries.insert(id.to_string(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: SlotStatus) -> Fragment {
        Fragment {
            status: Some(status),
            ..Fragment::default()
        }
    }

    fn distance(cm: f64) -> Fragment {
        Fragment {
            distance: Some(cm),
            ..Fragment::default()
        }
    }

    #[test]
    fn test_merge_creates_entity_once() {
        let mut store = StateStore::new(20);
        assert!(store.merge("bay-01", &status(SlotStatus::Free), 10).created);
        assert!(!store.merge("bay-01", &status(SlotStatus::Occupied), 20).created);
    }

    #[test]
    fn test_merge_only_touches_present_fields() {
        let mut store = StateStore::new(20);
        let full = Fragment {
            status: Some(SlotStatus::Occupied),
            distance: Some(15.2),
            rssi: Some(-50.0),
            uptime: Some(120.0),
            online: Some(true),
        };
        store.merge("bay-01", &full, 100);
        store.merge(
            "bay-01",
            &Fragment {
                rssi: Some(-61.0),
                ..Fragment::default()
            },
            200,
        );

        let state = store.read("bay-01");
        assert_eq!(state.status, SlotStatus::Occupied);
        assert_eq!(state.distance, Some(15.2));
        assert_eq!(state.rssi, Some(-61.0));
        assert_eq!(state.uptime, Some(120.0));
        assert_eq!(state.online, Some(true));
        assert_eq!(state.updated_at, Some(200));
    }

    #[test]
    fn test_updated_at_never_decreases() {
        let mut store = StateStore::new(20);
        store.merge("bay-01", &status(SlotStatus::Free), 500);
        store.merge("bay-01", &status(SlotStatus::Occupied), 400);
        assert_eq!(store.read("bay-01").updated_at, Some(500));
        store.merge("bay-01", &status(SlotStatus::Free), 600);
        assert_eq!(store.read("bay-01").updated_at, Some(600));
    }

    #[test]
    fn test_read_unknown_id_is_default_snapshot() {
        let store = StateStore::new(20);
        let state = store.read("nowhere");
        assert_eq!(state, EntityState::new("nowhere", SlotStatus::Unknown));
        assert!(store.history("nowhere").is_empty());
        assert_eq!(store.ids().count(), 0);
    }

    #[test]
    fn test_distance_merges_feed_history() {
        let mut store = StateStore::new(3);
        store.merge("bay-01", &status(SlotStatus::Free), 1);
        for (i, cm) in [10.0, 11.0, 12.0, 13.0].into_iter().enumerate() {
            store.merge("bay-01", &distance(cm), 10 + i as Timestamp);
        }
        let history = store.history("bay-01");
        let readings: Vec<_> = history.iter().map(|p| p.distance).collect();
        assert_eq!(readings, vec![11.0, 12.0, 13.0]);
        assert_eq!(history.last().map(|p| p.at), Some(13));
    }

    #[test]
    fn test_seed_keeps_existing_state() {
        let mut store = StateStore::new(20);
        store.merge("A1", &status(SlotStatus::Occupied), 1);
        store.seed(["A1", "A2"], SlotStatus::Free);
        assert_eq!(store.read("A1").status, SlotStatus::Occupied);
        assert_eq!(store.read("A2").status, SlotStatus::Free);
        assert_eq!(store.read("A2").updated_at, None);
    }

    #[test]
    fn test_invalidate_distance_leaves_other_fields() {
        let mut store = StateStore::new(20);
        store.merge(
            "bay-01",
            &Fragment {
                distance: Some(30.0),
                rssi: Some(-40.0),
                ..Fragment::default()
            },
            100,
        );
        assert!(store.invalidate_distance("bay-01"));
        assert!(!store.invalidate_distance("bay-01"));

        let state = store.read("bay-01");
        assert_eq!(state.distance, None);
        assert_eq!(state.rssi, Some(-40.0));
        assert_eq!(state.updated_at, Some(100));
        assert_eq!(store.distance_stamps().count(), 0);
        assert_eq!(store.history("bay-01").len(), 1);
    }

    #[test]
    fn test_reset_clears_view() {
        let mut store = StateStore::new(20);
        store.merge("bay-02", &distance(40.0), 1);
        store.reset("bay-02");
        assert_eq!(store.read("bay-02"), EntityState::new("bay-02", SlotStatus::Unknown));
        assert!(store.history("bay-02").is_empty());
    }

    #[test]
    fn test_snapshot_serializes_present_fields_only() {
        let mut store = StateStore::new(20);
        store.merge("bay-01", &status(SlotStatus::Occupied), 42);
        let json = serde_json::to_string(&store.read("bay-01")).unwrap();
        assert_eq!(json, r#"{"id":"bay-01","status":"occupied","updated_at":42}"#);
    }
}
