use std::collections::BTreeMap;

use super::{
    message::{Step, ValueSet},
    peers::ProcessId,
};

/// TLC records by step, at most one per source.
#[derive(Default)]
pub struct TlcStore {
    pub records: BTreeMap<Step, BTreeMap<ProcessId, ValueSet>>,
}

impl TlcStore {
    pub fn new() -> Self {
        TlcStore {
            records: BTreeMap::new(),
        }
    }

    /// Returns false if `source` already had a record for `step`.
    pub fn add_record(&mut self, step: Step, source: ProcessId, value: ValueSet) -> bool {
        let records = self.records.entry(step).or_default();
        if records.contains_key(&source) {
            return false;
        }
        records.insert(source, value);
        true
    }

    pub fn count(&self, step: Step) -> usize {
        self.records.get(&step).map_or(0, |r| r.len())
    }

    pub fn get(&self, step: Step, source: ProcessId) -> Option<&ValueSet> {
        self.records.get(&step)?.get(&source)
    }

    /// Union of every record held for `step`.
    pub fn join(&self, step: Step) -> ValueSet {
        self.records
            .get(&step)
            .into_iter()
            .flat_map(|r| r.values())
            .flatten()
            .copied()
            .collect()
    }

    /// Drops every record for `step` except the one from `keep`.
    pub fn prune(&mut self, step: Step, keep: ProcessId) {
        if let Some(records) = self.records.get_mut(&step) {
            records.retain(|source, _| *source == keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_record_per_source() {
        let mut store = TlcStore::new();
        assert!(store.add_record(0, 1, ValueSet::from([1])));
        assert!(!store.add_record(0, 1, ValueSet::from([2])));
        assert!(store.add_record(0, 2, ValueSet::from([3])));
        assert_eq!(store.count(0), 2);
        assert_eq!(store.get(0, 1), Some(&ValueSet::from([1])));
        assert_eq!(store.join(0), ValueSet::from([1, 3]));
        assert!(store.join(1).is_empty());
    }

    #[test]
    fn test_prune_keeps_own_record() {
        let mut store = TlcStore::new();
        store.add_record(4, 1, ValueSet::from([1]));
        store.add_record(4, 2, ValueSet::from([2]));
        store.add_record(5, 2, ValueSet::from([2]));
        store.prune(4, 1);
        assert_eq!(store.count(4), 1);
        assert!(store.get(4, 1).is_some());
        assert_eq!(store.count(5), 1);
    }
}
