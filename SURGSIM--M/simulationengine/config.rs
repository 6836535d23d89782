use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::catalog::Difficulty;

/// Engine configuration, usually loaded from TOML.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Assessment constants.
    pub scoring: ScoringConfig,
    /// Vitals model parameters.
    pub signal: SignalConfig,
    /// Complication counts per difficulty.
    pub complications: ComplicationDensity,
    /// Log destination.
    pub logging: LoggingConfig,
    /// Catalog replacing the builtin one, resolved against the config file.
    pub catalog_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config =
            Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(catalog) = config.catalog_path.as_mut() {
            if catalog.is_relative() {
                *catalog = source_dir.join(&*catalog);
            }
        }
        if let Some(log) = config.logging.path.as_mut() {
            if log.is_relative() {
                *log = source_dir.join(&*log);
            }
        }
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let document: EngineConfigSerde = toml::from_str(raw)?;
        let config = Self {
            scoring: document.scoring,
            signal: document.signal,
            complications: document.complications,
            logging: LoggingConfig {
                path: document.logging.path,
                min_level: document
                    .logging
                    .min_level
                    .as_deref()
                    .map(str::parse::<LogLevel>)
                    .transpose()?
                    .unwrap_or(LogLevel::Info),
            },
            catalog_path: document.catalog_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let scoring = &self.scoring;
        let weights = scoring.technical_weight + scoring.non_technical_weight + scoring.time_weight;
        if (weights - 1.0).abs() > 1e-3 {
            bail!("scoring weights must sum to 1.0, got {weights:.3}");
        }
        ensure!(
            [
                scoring.technical_weight,
                scoring.non_technical_weight,
                scoring.time_weight,
                scoring.help_penalty,
                scoring.timeout_penalty,
                scoring.decision_penalty,
                scoring.time_grace_ratio,
                scoring.overrun_penalty,
            ]
            .iter()
            .all(|value| *value >= 0.0),
            "scoring weights and penalties must be non-negative"
        );
        ensure!(
            (0.0..=1.0).contains(&scoring.structure_accuracy_threshold),
            "structure_accuracy_threshold must lie in [0, 1]"
        );
        ensure!(
            scoring.recommendation_cap > 0,
            "recommendation_cap must be positive"
        );
        ensure!(self.signal.noise_scale >= 0.0, "noise_scale must be non-negative");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EngineConfigSerde {
    #[serde(default)]
    scoring: ScoringConfig,
    #[serde(default)]
    signal: SignalConfig,
    #[serde(default)]
    complications: ComplicationDensity,
    #[serde(default)]
    logging: LoggingSerde,
    #[serde(default)]
    catalog_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSerde {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    min_level: Option<String>,
}

/// Tunable assessment constants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    /// Weight of the technical score in a step's overall score.
    pub technical_weight: f64,
    /// Weight of the non-technical score.
    pub non_technical_weight: f64,
    /// Weight of the time score.
    pub time_weight: f64,
    /// Points lost per help request.
    pub help_penalty: f64,
    /// Points lost per timeout.
    pub timeout_penalty: f64,
    /// Points lost per unit of missed management accuracy.
    pub decision_penalty: f64,
    /// Fraction of the budget tolerated before the time score drops.
    pub time_grace_ratio: f64,
    /// Points lost per full budget of overrun beyond the grace margin.
    pub overrun_penalty: f64,
    /// Accuracy at which a structure counts as handled.
    pub structure_accuracy_threshold: f64,
    /// Maximum number of final recommendations.
    pub recommendation_cap: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            technical_weight: 0.5,
            non_technical_weight: 0.3,
            time_weight: 0.2,
            help_penalty: 10.0,
            timeout_penalty: 25.0,
            decision_penalty: 15.0,
            time_grace_ratio: 0.2,
            overrun_penalty: 50.0,
            structure_accuracy_threshold: 0.6,
            recommendation_cap: 8,
        }
    }
}

/// Vitals model parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalConfig {
    /// Seconds for a complication impact to decay to half; 0 disables decay.
    pub half_life_secs: f64,
    /// Multiplier on the random-walk noise; 0 silences it.
    pub noise_scale: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            half_life_secs: 300.0,
            noise_scale: 1.0,
        }
    }
}

/// Number of complications scheduled per difficulty.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComplicationDensity {
    /// Beginner count.
    pub beginner: usize,
    /// Intermediate count.
    pub intermediate: usize,
    /// Advanced count.
    pub advanced: usize,
    /// Expert count.
    pub expert: usize,
}

impl ComplicationDensity {
    /// Count for `difficulty`.
    #[must_use]
    pub const fn for_difficulty(&self, difficulty: Difficulty) -> usize {
        match difficulty {
            Difficulty::Beginner => self.beginner,
            Difficulty::Intermediate => self.intermediate,
            Difficulty::Advanced => self.advanced,
            Difficulty::Expert => self.expert,
        }
    }
}

impl Default for ComplicationDensity {
    fn default() -> Self {
        Self {
            beginner: 0,
            intermediate: 1,
            advanced: 2,
            expert: 3,
        }
    }
}

/// Log destination.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// JSON-lines file; logging is disabled when absent.
    pub path: Option<PathBuf>,
    /// Records below this level are dropped.
    pub min_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            path: None,
            min_level: LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.scoring, ScoringConfig::default());
        assert_eq!(config.complications.for_difficulty(Difficulty::Advanced), 2);
        assert_eq!(config.logging.min_level, LogLevel::Info);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [scoring]
            help_penalty = 5.0
            [signal]
            noise_scale = 0.0
            [complications]
            expert = 4
            [logging]
            min_level = "warn"
            "#,
        )
        .unwrap();
        assert_eq!(config.scoring.help_penalty, 5.0);
        assert_eq!(config.scoring.timeout_penalty, 25.0);
        assert_eq!(config.signal.half_life_secs, 300.0);
        assert_eq!(config.complications.expert, 4);
        assert_eq!(config.complications.intermediate, 1);
        assert_eq!(config.logging.min_level, LogLevel::Warn);
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let err = EngineConfig::from_toml_str("[scoring]\ntechnical_weight = 0.9").unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn resolves_relative_paths_against_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            "catalog_path = \"catalog.toml\"\n[logging]\npath = \"logs/sim.log\"\n",
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.catalog_path.unwrap(), dir.path().join("catalog.toml"));
        assert_eq!(config.logging.path.unwrap(), dir.path().join("logs/sim.log"));
    }
}
