use std::{fmt, fs, path::Path};

use goap_actions::ActionId;
use goap_world::{StateValue, WorldState};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Discretized world state used as the Q-table row key.
///
/// Numbers fall into `floor(value / bucket_size)` buckets, flags into
/// `0`/`1`, lists into their length; text is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateBucket(String);

impl StateBucket {
    /// Buckets `state`.
    #[must_use]
    pub fn of(state: &WorldState, bucket_size: f64) -> Self {
        let size = if bucket_size > 0.0 { bucket_size } else { 1.0 };
        let parts: Vec<String> = state
            .iter()
            .map(|(key, value)| match value {
                StateValue::Number(number) => format!("{key}={}", (number / size).floor()),
                StateValue::Bool(flag) => format!("{key}={}", u8::from(*flag)),
                StateValue::Text(text) => format!("{key}={text}"),
                StateValue::List(items) => format!("{key}=#{}", items.len()),
            })
            .collect();
        Self(parts.join("|"))
    }

    /// Encoded key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialized Q-table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QEntry {
    /// State bucket.
    pub state: StateBucket,
    /// Action taken.
    pub action_id: ActionId,
    /// Learned value.
    pub value: f64,
}

/// Tabular Q-learner over `(state bucket, action)` pairs.
#[derive(Debug)]
pub struct QTable {
    values: RwLock<IndexMap<StateBucket, IndexMap<ActionId, f64>>>,
    learning_rate: f64,
    discount: f64,
}

impl QTable {
    /// Empty table.
    #[must_use]
    pub fn new(learning_rate: f64, discount: f64) -> Self {
        Self {
            values: RwLock::new(IndexMap::new()),
            learning_rate: learning_rate.clamp(0.0, 1.0),
            discount: discount.clamp(0.0, 1.0),
        }
    }

    /// Learned value, `0.0` when unseen.
    #[must_use]
    pub fn value(&self, state: &StateBucket, action_id: &str) -> f64 {
        self.values
            .read()
            .get(state)
            .and_then(|row| row.get(action_id))
            .copied()
            .unwrap_or(0.0)
    }

    /// Highest-valued action among `candidates`; ties go to the earlier one.
    #[must_use]
    pub fn best_action<'a>(
        &self,
        state: &StateBucket,
        candidates: impl IntoIterator<Item = &'a str>,
    ) -> Option<(&'a str, f64)> {
        candidates
            .into_iter()
            .map(|id| (id, self.value(state, id)))
            .fold(None, |best, (id, value)| match best {
                Some((_, best_value)) if best_value >= value => best,
                _ => Some((id, value)),
            })
    }

    /// Q-learning update:
    /// `Q(s,a) += lr * (reward + discount * max_a' Q(s',a') - Q(s,a))`.
    /// `next` is `None` for terminal transitions. Returns the new value.
    pub fn update(
        &self,
        state: &StateBucket,
        action_id: &str,
        reward: f64,
        next: Option<&StateBucket>,
    ) -> f64 {
        let mut values = self.values.write();
        let future = next
            .and_then(|next| values.get(next))
            .and_then(|row| row.values().copied().reduce(f64::max))
            .unwrap_or(0.0);
        let slot = values
            .entry(state.clone())
            .or_default()
            .entry(action_id.to_string())
            .or_insert(0.0);
        *slot += self.learning_rate * self.discount.mul_add(future, reward) - self.learning_rate * *slot;
        *slot
    }

    /// Number of learned pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.read().values().map(IndexMap::len).sum()
    }

    /// Whether nothing is learned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every learned pair.
    #[must_use]
    pub fn entries(&self) -> Vec<QEntry> {
        self.values
            .read()
            .iter()
            .flat_map(|(state, row)| {
                row.iter().map(move |(action_id, value)| QEntry {
                    state: state.clone(),
                    action_id: action_id.clone(),
                    value: *value,
                })
            })
            .collect()
    }

    /// Replaces the table contents.
    pub fn restore(&self, entries: impl IntoIterator<Item = QEntry>) {
        let mut values = self.values.write();
        values.clear();
        for entry in entries {
            values
                .entry(entry.state)
                .or_default()
                .insert(entry.action_id, entry.value);
        }
    }

    /// Writes the table as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let encoded = serde_json::to_vec_pretty(&self.entries())?;
        fs::write(path, encoded)
    }

    /// Loads a table written by [`QTable::save`]; a missing file leaves the
    /// table empty.
    pub fn load(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let entries: Vec<QEntry> = serde_json::from_slice(&fs::read(path)?)?;
        self.restore(entries);
        Ok(())
    }
}
