use std::{
    fs,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::store::{increment_field, Collection, RecordStore, StoreError};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    record: Value,
}

/// File-system backed record store: one pretty-printed JSON file per record
/// under `<root>/<collection>/`.
///
/// Writes go through a temporary file and a rename so readers never observe
/// a partial record. Writers inside one process are serialized.
#[derive(Debug)]
pub struct FileRecordStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    /// Opens (and creates) a store rooted at `base_path`.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        for collection in Collection::ALL {
            fs::create_dir_all(base_path.join(collection.dir_name()))?;
        }
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, collection: Collection, key: &str) -> PathBuf {
        self.base_path
            .join(collection.dir_name())
            .join(format!("{}.json", file_stem(key)))
    }

    fn read(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.record_path(collection, key);
        if !path.exists() {
            return Ok(None);
        }
        let envelope: Envelope = serde_json::from_slice(&fs::read(&path)?)?;
        if envelope.key != key {
            return Err(StoreError::InvalidRecord {
                collection,
                key: key.to_string(),
                reason: format!("file holds record `{}`", envelope.key),
            });
        }
        Ok(Some(envelope.record))
    }

    fn write(&self, collection: Collection, key: &str, record: Value) -> Result<(), StoreError> {
        let path = self.record_path(collection, key);
        let staging = path.with_extension("json.tmp");
        let envelope = Envelope {
            key: key.to_string(),
            record,
        };
        fs::write(&staging, serde_json::to_vec_pretty(&envelope)?)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }
}

/// File name for a key; unusual characters are escaped as `_xx` hex.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

impl RecordStore for FileRecordStore {
    fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        self.read(collection, key)
    }

    fn put(&self, collection: Collection, key: &str, record: Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.write(collection, key, record)
    }

    fn query(
        &self,
        collection: Collection,
        predicate: &dyn Fn(&Value) -> bool,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let dir = self.base_path.join(collection.dir_name());
        let mut matches = Vec::new();
        let Ok(read_dir) = fs::read_dir(&dir) else {
            return Ok(matches);
        };
        for entry in read_dir
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        {
            let path = entry.path();
            let envelope = fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|data| Ok(serde_json::from_slice::<Envelope>(&data)?));
            match envelope {
                Ok(envelope) if predicate(&envelope.record) => {
                    matches.push((envelope.key, envelope.record));
                }
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable record"),
            }
        }
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
        let _guard = self.write_lock.lock();
        let mut record = self
            .read(collection, key)?
            .unwrap_or_else(|| Value::Object(Map::new()));
        let next = increment_field(collection, key, &mut record, field, delta)?;
        self.write(collection, key, record)?;
        Ok(next)
    }

    fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let path = self.record_path(collection, key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}
