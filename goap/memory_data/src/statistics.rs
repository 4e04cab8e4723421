use std::sync::Arc;

use chrono::Utc;
use goap_actions::{
    statistics::{ema, DEFAULT_EMA_ALPHA},
    ActionId, ActionStats, StatisticsError, StatisticsRepository,
};
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::{
    records::ActionStatsRecord,
    store::{Collection, RecordStore, RecordStoreExt, StoreError},
};

fn backend(err: StoreError) -> StatisticsError {
    StatisticsError::Backend(err.to_string())
}

/// Statistics repository persisted through a [`RecordStore`].
///
/// Counters go through the store's atomic increment; the EMA is a
/// read-modify-write serialized within this process.
pub struct StoreBackedStatistics {
    store: Arc<dyn RecordStore>,
    alpha: f64,
    initial_rate: f64,
    rate_lock: Mutex<()>,
}

impl std::fmt::Debug for StoreBackedStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBackedStatistics")
            .field("alpha", &self.alpha)
            .field("initial_rate", &self.initial_rate)
            .finish_non_exhaustive()
    }
}

impl StoreBackedStatistics {
    /// Wraps a store, smoothing with the default alpha.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            alpha: DEFAULT_EMA_ALPHA,
            initial_rate: 1.0,
            rate_lock: Mutex::new(()),
        }
    }

    /// Overrides the smoothing factor.
    #[must_use]
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.clamp(0.0, 1.0);
        self
    }

    /// Success rate assumed for actions never seen before.
    #[must_use]
    pub const fn with_initial_rate(mut self, rate: f64) -> Self {
        self.initial_rate = rate;
        self
    }

    fn record(&self, action_id: &str) -> Result<Option<ActionStatsRecord>, StatisticsError> {
        self.store
            .get_as(Collection::ActionStats, action_id)
            .map_err(backend)
    }
}

impl StatisticsRepository for StoreBackedStatistics {
    fn get(&self, action_id: &str) -> Result<Option<ActionStats>, StatisticsError> {
        Ok(self.record(action_id)?.map(|record| record.stats()))
    }

    fn record_outcome(
        &self,
        action_id: &str,
        success: bool,
    ) -> Result<ActionStats, StatisticsError> {
        let _guard = self.rate_lock.lock();
        let previous = self
            .record(action_id)?
            .map_or(self.initial_rate, |record| record.success_rate);
        let counter = if success { "successes" } else { "failures" };
        self.store
            .increment(Collection::ActionStats, action_id, counter, 1.0)
            .map_err(backend)?;
        self.store
            .increment(Collection::ActionStats, action_id, "execution_count", 1.0)
            .map_err(backend)?;
        let mut record = self
            .store
            .get(Collection::ActionStats, action_id)
            .map_err(backend)?
            .unwrap_or_default();
        if let Some(fields) = record.as_object_mut() {
            fields.insert("action_id".into(), action_id.into());
            fields.insert("success_rate".into(), ema(previous, success, self.alpha).into());
            fields.insert(
                "last_updated".into(),
                serde_json::to_value(Utc::now()).map_err(|err| StatisticsError::Backend(err.to_string()))?,
            );
        }
        self.store
            .put(Collection::ActionStats, action_id, record)
            .map_err(backend)?;
        self.get(action_id)?
            .ok_or_else(|| StatisticsError::Backend(format!("statistics for `{action_id}` vanished")))
    }

    fn seed(&self, action_id: &str, stats: ActionStats) -> Result<(), StatisticsError> {
        let _guard = self.rate_lock.lock();
        if self.record(action_id)?.is_some() {
            return Ok(());
        }
        let record = ActionStatsRecord {
            action_id: action_id.to_string(),
            success_rate: stats.success_rate,
            execution_count: stats.execution_count,
            successes: 0,
            failures: 0,
            last_updated: stats.last_updated,
        };
        self.store
            .put_as(Collection::ActionStats, action_id, &record)
            .map_err(backend)
    }

    fn snapshot(&self) -> Result<IndexMap<ActionId, ActionStats>, StatisticsError> {
        Ok(self
            .store
            .all_as::<ActionStatsRecord>(Collection::ActionStats)
            .map_err(backend)?
            .into_iter()
            .map(|record| (record.action_id.clone(), record.stats()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{file_store::FileRecordStore, memory_store::MemoryRecordStore};

    #[test]
    fn persists_outcomes() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let stats = StoreBackedStatistics::new(Arc::clone(&store));
        stats.seed("measure", ActionStats::with_rate(0.5)).unwrap();
        let updated = stats.record_outcome("measure", true).unwrap();
        assert_eq!(updated.execution_count, 1);
        assert!((updated.success_rate - 0.55).abs() < 1e-12);

        let record: ActionStatsRecord = store
            .get_as(Collection::ActionStats, "measure")
            .unwrap()
            .unwrap();
        assert_eq!(record.successes, 1);
        assert_eq!(record.failures, 0);
    }

    #[test]
    fn statistics_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Arc::new(FileRecordStore::open(dir.path()).unwrap());
            let stats = StoreBackedStatistics::new(store);
            stats.record_outcome("scan", false).unwrap();
            stats.record_outcome("scan", false).unwrap();
        }
        let stats = StoreBackedStatistics::new(Arc::new(FileRecordStore::open(dir.path()).unwrap()));
        stats.seed("scan", ActionStats::default()).unwrap();
        let scan = stats.get("scan").unwrap().unwrap();
        assert_eq!(scan.execution_count, 2);
        assert!((scan.success_rate - 0.81).abs() < 1e-9);
        assert_eq!(stats.snapshot().unwrap().len(), 1);
    }
}
