use std::{fs, path::Path, sync::Arc};

use goap_world::ValueKind;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    actions::Action,
    library::{ActionLibrary, CostModel, LibraryError},
    statistics::StatisticsRepository,
};

/// Serializable action library: declared state keys plus action records.
///
/// Files ending in `.toml` are read and written as TOML, anything else as
/// JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryDocument {
    /// Keys goals may reference even though no action touches them.
    #[serde(default)]
    pub schema: IndexMap<String, ValueKind>,
    /// Action records, including persisted statistics.
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl LibraryDocument {
    /// Reads a document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LibraryError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| LibraryError::Document(format!("{}: {err}", path.display())))?;
        if is_toml(path) {
            Self::from_toml(&raw)
        } else {
            Self::from_json(&raw)
        }
    }

    /// Parses TOML.
    pub fn from_toml(raw: &str) -> Result<Self, LibraryError> {
        toml::from_str(raw).map_err(|err| LibraryError::Document(err.to_string()))
    }

    /// Parses JSON.
    pub fn from_json(raw: &str) -> Result<Self, LibraryError> {
        serde_json::from_str(raw).map_err(|err| LibraryError::Document(err.to_string()))
    }

    /// Writes the document, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LibraryError> {
        let path = path.as_ref();
        let encoded = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|err| LibraryError::Document(err.to_string()))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|err| LibraryError::Document(err.to_string()))?
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| LibraryError::Document(format!("{}: {err}", parent.display())))?;
        }
        fs::write(path, encoded)
            .map_err(|err| LibraryError::Document(format!("{}: {err}", path.display())))
    }

    /// Builds a library over `stats`, seeding statistics from the records.
    pub fn into_library(
        self,
        stats: Arc<dyn StatisticsRepository>,
        cost_model: CostModel,
    ) -> Result<ActionLibrary, LibraryError> {
        let library = ActionLibrary::new(stats).with_cost_model(cost_model);
        for (key, kind) in self.schema {
            library.declare_key(key, kind);
        }
        library.extend(self.actions)?;
        Ok(library)
    }

    /// Captures a library with its live statistics.
    #[must_use]
    pub fn from_library(library: &ActionLibrary, schema: IndexMap<String, ValueKind>) -> Self {
        Self {
            schema,
            actions: library.export(),
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::InMemoryStatistics;
    use goap_world::{GoalCondition, Operator};

    const LIBRARY: &str = r#"
[schema]
"coverage.branch" = "number"

[[actions]]
id = "measure"
name = "Measure coverage"
category = "coverage"
capability = "coverage-analyzer"
cost = 1.0
effects = [{ op = "mark_flag", key = "testsMeasured" }]

[[actions]]
id = "increase-coverage"
name = "Generate tests"
category = "test"
capability = "test-generator"
cost = 3.0
duration_ms = 500
preconditions = [{ key = "testsMeasured", op = "eq", value = true }]
effects = [{ op = "increase_by", key = "coverage.line", amount = 15.0 }]

[actions.stats]
success_rate = 0.8
execution_count = 12
"#;

    #[test]
    fn loads_toml_documents() {
        let document = LibraryDocument::from_toml(LIBRARY).unwrap();
        assert_eq!(document.actions.len(), 2);
        let increase = &document.actions[1];
        assert_eq!(increase.preconditions[0].op, Operator::Eq);
        assert_eq!(increase.stats.execution_count, 12);

        let library = document
            .into_library(Arc::new(InMemoryStatistics::default()), CostModel::default())
            .unwrap();
        assert!(library.schema().contains("coverage.branch"));
        let cost = library.effective_cost("increase-coverage").unwrap();
        assert!((cost - 3.6).abs() < 1e-9);
        assert_eq!(
            library.get("increase-coverage").unwrap().preconditions[0],
            GoalCondition::eq("testsMeasured", true)
        );
    }

    #[test]
    fn saves_learned_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let library = LibraryDocument::from_toml(LIBRARY)
            .unwrap()
            .into_library(Arc::new(InMemoryStatistics::default()), CostModel::default())
            .unwrap();
        library.record_outcome("measure", false).unwrap();

        for name in ["library.json", "nested/library.toml"] {
            let path = dir.path().join(name);
            LibraryDocument::from_library(&library, IndexMap::new())
                .save(&path)
                .unwrap();
            let reloaded = LibraryDocument::load(&path).unwrap();
            assert_eq!(reloaded.actions[0].stats.execution_count, 1);
            assert!((reloaded.actions[0].stats.success_rate - 0.9).abs() < 1e-9);
        }
    }
}
