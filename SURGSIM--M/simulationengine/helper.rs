use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};

/// Telemetry builder for the simulation engine.
pub struct SimulationTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    sink: Option<Arc<dyn LogSink>>,
}

impl SimulationTelemetryBuilder {
    /// Creates a new builder scoped to a module label.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            sink: None,
        }
    }

    /// Writes JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops file records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Uses an existing sink instead of a file.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds telemetry.
    pub fn build(self) -> Result<SimulationTelemetry> {
        let sink = match (self.sink, self.log_path) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => {
                Some(Arc::new(JsonLogger::with_min_level(path, self.min_level)?) as Arc<dyn LogSink>)
            }
            (None, None) => None,
        };
        Ok(SimulationTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sink,
            }),
        })
    }
}

/// Telemetry handle shared across simulation components.
#[derive(Clone)]
pub struct SimulationTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for SimulationTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationTelemetry")
            .field("module", &self.inner.module)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    sink: Option<Arc<dyn LogSink>>,
}

impl SimulationTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> SimulationTelemetryBuilder {
        SimulationTelemetryBuilder::new(module)
    }

    /// Logs a structured record; `metadata` object keys become record fields.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(sink) = &self.inner.sink {
            let mut record = LogRecord::new(&self.inner.module, level, message);
            if let Value::Object(fields) = metadata {
                record.metadata = fields;
            }
            sink.write(&record)?;
        }
        Ok(())
    }

    /// Info-level shorthand.
    pub fn info(&self, message: &str, metadata: Value) -> Result<()> {
        self.log(LogLevel::Info, message, metadata)
    }

    /// Warn-level shorthand.
    pub fn warn(&self, message: &str, metadata: Value) -> Result<()> {
        self.log(LogLevel::Warn, message, metadata)
    }
}

/// Generates a random seed for simulation runs.
#[must_use]
pub fn random_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Returns a reproducible RNG.
#[must_use]
pub fn seeded_rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}
