use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use tokio::runtime::{Builder, Handle, Runtime};
use uuid::Uuid;

use crate::{JsonLogger, LogLevel, LogRecord, LogSink};

/// Builder for telemetry handles.
pub struct TelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    sinks: Vec<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl TelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            sinks: Vec::new(),
            event_publisher: None,
        }
    }

    /// Adds a JSON-lines file sink at `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Adds an arbitrary sink.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<Telemetry> {
        let mut sinks = self.sinks;
        if let Some(path) = self.log_path {
            sinks.push(Arc::new(JsonLogger::new(path)?));
        }
        Ok(Telemetry {
            module: self.module,
            sinks: Arc::new(sinks),
            event: self.event_publisher.map(|publisher| {
                Arc::new(EventHandle {
                    publisher,
                    fallback: OnceCell::new(),
                })
            }),
        })
    }
}

/// Telemetry handle shared across planner components.
///
/// Cloning is cheap; [`Telemetry::scoped`] derives a handle writing to the
/// same sinks under a nested module name.
#[derive(Clone)]
pub struct Telemetry {
    module: String,
    sinks: Arc<Vec<Arc<dyn LogSink>>>,
    event: Option<Arc<EventHandle>>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("module", &self.module)
            .field("sinks", &self.sinks.len())
            .field("events", &self.event.is_some())
            .finish()
    }
}

struct EventHandle {
    publisher: Arc<dyn EventPublisher>,
    fallback: OnceCell<Runtime>,
}

impl EventHandle {
    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            let runtime = self
                .fallback
                .get_or_try_init(|| Builder::new_current_thread().build())?;
            runtime.block_on(self.publisher.publish(record))
        }
    }
}

impl Telemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> TelemetryBuilder {
        TelemetryBuilder::new(module)
    }

    /// Module name attached to every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Handle writing to the same sinks as `<module>.<child>`.
    #[must_use]
    pub fn scoped(&self, child: &str) -> Self {
        Self {
            module: format!("{}.{child}", self.module),
            sinks: Arc::clone(&self.sinks),
            event: self.event.clone(),
        }
    }

    /// Logs structured metadata to every sink accepting `level`.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if self.sinks.is_empty() {
            return Ok(());
        }
        let record = LogRecord::new(&self.module, level, message).with_metadata(metadata);
        for sink in self.sinks.iter().filter(|sink| level >= sink.min_level()) {
            sink.write(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.event {
            handle.publish(EventRecord {
                id: format!("evt-{}", Uuid::new_v4()),
                source: self.module.clone(),
                event_type: event_type.into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                payload,
            })?;
        }
        Ok(())
    }
}
