use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::store::{increment_field, Collection, RecordStore, StoreError};

/// Record store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    collections: RwLock<IndexMap<Collection, IndexMap<String, Value>>>,
}

impl MemoryRecordStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .get(&collection)
            .map_or(0, IndexMap::len)
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .and_then(|records| records.get(key))
            .cloned())
    }

    fn put(&self, collection: Collection, key: &str, record: Value) -> Result<(), StoreError> {
        self.collections
            .write()
            .entry(collection)
            .or_default()
            .insert(key.to_string(), record);
        Ok(())
    }

    fn query(
        &self,
        collection: Collection,
        predicate: &dyn Fn(&Value) -> bool,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let guard = self.collections.read();
        let mut matches: Vec<_> = guard
            .get(&collection)
            .into_iter()
            .flatten()
            .filter(|(_, record)| predicate(record))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }

    fn increment(
        &self,
        collection: Collection,
        key: &str,
        field: &str,
        delta: f64,
    ) -> Result<f64, StoreError> {
        let mut guard = self.collections.write();
        let record = guard
            .entry(collection)
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        increment_field(collection, key, record, field, delta)
    }

    fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .collections
            .write()
            .get_mut(&collection)
            .and_then(|records| records.shift_remove(key))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{sync::Arc, thread};

    #[test]
    fn get_put_query() {
        let store = MemoryRecordStore::new();
        store
            .put(Collection::Plans, "b", json!({"status": "completed"}))
            .unwrap();
        store
            .put(Collection::Plans, "a", json!({"status": "failed"}))
            .unwrap();
        assert!(store.get(Collection::Signatures, "a").unwrap().is_none());
        let completed = store
            .query(Collection::Plans, &|record| record["status"] == "completed")
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, "b");
        assert!(store.delete(Collection::Plans, "a").unwrap());
        assert_eq!(store.len(Collection::Plans), 1);
    }

    #[test]
    fn increments_are_atomic() {
        let store = Arc::new(MemoryRecordStore::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .increment(Collection::ActionStats, "measure", "execution_count", 1.0)
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let record = store.get(Collection::ActionStats, "measure").unwrap().unwrap();
        assert_eq!(record["execution_count"], 400);
    }

    #[test]
    fn increment_rejects_non_numeric_fields() {
        let store = MemoryRecordStore::new();
        store
            .put(Collection::ActionStats, "scan", json!({"execution_count": "many"}))
            .unwrap();
        assert!(matches!(
            store.increment(Collection::ActionStats, "scan", "execution_count", 1.0),
            Err(StoreError::InvalidRecord { .. })
        ));
    }
}
