use std::{collections::HashSet, fmt, fs, path::Path, str::FromStr};

use anyhow::{bail, ensure, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{errors::SimulationError, signal_model::VitalsDelta};

const BUILTIN_CATALOG: &str = include_str!("builtin_catalog.toml");

/// Training difficulty, ordered from easiest to hardest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Detailed guidance, generous time budgets, no complications.
    Beginner,
    /// Moderate guidance, one complication.
    Intermediate,
    /// Minimal guidance, tighter budgets, two complications.
    Advanced,
    /// No guidance, tightest budgets, three complications.
    Expert,
}

impl Difficulty {
    /// Every level, easiest first.
    pub const ALL: [Self; 4] = [
        Self::Beginner,
        Self::Intermediate,
        Self::Advanced,
        Self::Expert,
    ];

    /// Label used on the wire and in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
            Self::Expert => "expert",
        }
    }

    /// Multiplier applied to each step's time budget.
    #[must_use]
    pub const fn time_factor(self) -> f64 {
        match self {
            Self::Beginner => 1.5,
            Self::Intermediate => 1.0,
            Self::Advanced => 0.8,
            Self::Expert => 0.7,
        }
    }

    /// Amount of in-step guidance offered to the trainee.
    #[must_use]
    pub const fn guidance(self) -> GuidanceLevel {
        match self {
            Self::Beginner => GuidanceLevel::Detailed,
            Self::Intermediate => GuidanceLevel::Moderate,
            Self::Advanced => GuidanceLevel::Minimal,
            Self::Expert => GuidanceLevel::None,
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Difficulty {
    type Err = SimulationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|level| level.label() == wanted)
            .ok_or_else(|| SimulationError::InvalidRequest(format!("unknown difficulty `{raw}`")))
    }
}

/// Guidance attached to a planned step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceLevel {
    /// Step-by-step hints.
    Detailed,
    /// Decision prompts only.
    Moderate,
    /// Occasional prompts.
    Minimal,
    /// Unassisted.
    None,
}

/// Complication severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Manageable without interrupting the step.
    Minor,
    /// Requires prompt intervention.
    Moderate,
    /// Threatens the subject if unmanaged.
    Severe,
}

/// Recommended duration window for a step, in minutes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeBudget {
    /// Lower end of the window.
    pub min_minutes: f64,
    /// Upper end of the window.
    pub max_minutes: f64,
}

impl TimeBudget {
    /// Recommended budget in seconds (upper end of the window).
    #[must_use]
    pub fn budget_secs(&self) -> f64 {
        self.max_minutes * 60.0
    }

    /// Midpoint of the window in minutes.
    #[must_use]
    pub fn midpoint_minutes(&self) -> f64 {
        (self.min_minutes + self.max_minutes) / 2.0
    }

    /// Window scaled by `factor`.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            min_minutes: self.min_minutes * factor,
            max_minutes: self.max_minutes * factor,
        }
    }
}

/// One step of a procedure as authored in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepTemplate {
    /// 1-based position within the procedure.
    pub index: usize,
    /// Short title.
    pub title: String,
    /// Instructions shown to the trainee.
    pub description: String,
    /// Safety-critical points for the step.
    #[serde(default)]
    pub critical_points: Vec<String>,
    /// Instruments appropriate for the step.
    #[serde(default)]
    pub instruments: Vec<String>,
    /// Structures the trainee is expected to work on.
    #[serde(default)]
    pub relevant_structures: Vec<String>,
    /// Optional hints authored for the step.
    #[serde(default)]
    pub hints: Vec<String>,
    /// Recommended duration.
    pub time_budget: TimeBudget,
    /// Canned advice keyed by structure.
    #[serde(default)]
    pub advice: IndexMap<String, String>,
}

impl StepTemplate {
    /// Whether the instrument is on the step's whitelist.
    #[must_use]
    pub fn allows_instrument(&self, instrument: &str) -> bool {
        contains_ignore_case(&self.instruments, instrument)
    }

    /// Whether the structure is one the step is scored on.
    #[must_use]
    pub fn is_relevant(&self, structure: &str) -> bool {
        contains_ignore_case(&self.relevant_structures, structure)
    }

    /// Advice for an unmet structure, falling back to a generic prompt.
    #[must_use]
    pub fn advice_for(&self, structure: &str) -> String {
        self.advice
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(structure))
            .map_or_else(
                || {
                    format!(
                        "Identify and work on the {structure} during {}",
                        self.title.to_lowercase()
                    )
                },
                |(_, text)| text.clone(),
            )
    }
}

/// Inclusive range of step indices.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepRange {
    /// First step index.
    pub first: usize,
    /// Last step index.
    pub last: usize,
}

impl StepRange {
    /// Whether `index` falls inside the range.
    #[must_use]
    pub const fn contains(&self, index: usize) -> bool {
        self.first <= index && index <= self.last
    }
}

/// A complication that may be scheduled into a procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplicationTemplate {
    /// Type tag, e.g. `bleeding`.
    pub kind: String,
    /// Narrative shown when the complication fires.
    pub description: String,
    /// Severity.
    pub severity: Severity,
    /// Steps at which the complication may be triggered.
    pub trigger_steps: StepRange,
    /// Management options offered to the trainee.
    pub management_options: Vec<String>,
    /// Option considered best practice.
    pub preferred_option: String,
    /// Seconds the trainee has to respond.
    pub response_time_limit_secs: f64,
    /// Change applied to the vitals once resolved.
    #[serde(default)]
    pub vitals_impact: VitalsDelta,
    /// Lowest difficulty at which the complication is offered.
    #[serde(default = "default_min_difficulty")]
    pub min_difficulty: Difficulty,
}

impl ComplicationTemplate {
    /// Whether the template may be scheduled at `difficulty`.
    #[must_use]
    pub fn eligible_for(&self, difficulty: Difficulty) -> bool {
        difficulty >= self.min_difficulty
    }

    /// Accuracy credited to a management choice.
    #[must_use]
    pub fn option_accuracy(&self, choice: &str) -> f64 {
        if self.preferred_option.eq_ignore_ascii_case(choice) {
            1.0
        } else if contains_ignore_case(&self.management_options, choice) {
            0.7
        } else {
            0.0
        }
    }
}

/// Complete procedure definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcedureDefinition {
    /// Stable identifier, e.g. `appendectomy`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Specialty.
    pub category: String,
    /// Ordered steps.
    pub steps: Vec<StepTemplate>,
    /// Complication templates.
    #[serde(default)]
    pub complications: Vec<ComplicationTemplate>,
    /// Difficulties the procedure can be generated at.
    pub difficulties: Vec<Difficulty>,
}

impl ProcedureDefinition {
    /// Whether the procedure may be generated at `difficulty`.
    #[must_use]
    pub fn supports(&self, difficulty: Difficulty) -> bool {
        self.difficulties.contains(&difficulty)
    }

    /// Step by 1-based index.
    #[must_use]
    pub fn step(&self, index: usize) -> Option<&StepTemplate> {
        index.checked_sub(1).and_then(|idx| self.steps.get(idx))
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.id.trim().is_empty(), "procedure id must not be empty");
        ensure!(!self.steps.is_empty(), "procedure `{}` has no steps", self.id);
        ensure!(
            !self.difficulties.is_empty(),
            "procedure `{}` allows no difficulty",
            self.id
        );
        for (position, step) in self.steps.iter().enumerate() {
            if step.index != position + 1 {
                bail!(
                    "procedure `{}`: step `{}` has index {}, expected {}",
                    self.id,
                    step.title,
                    step.index,
                    position + 1
                );
            }
            let budget = step.time_budget;
            if !(budget.min_minutes > 0.0 && budget.min_minutes <= budget.max_minutes) {
                bail!(
                    "procedure `{}`: step {} has an invalid time budget",
                    self.id,
                    step.index
                );
            }
        }
        for template in &self.complications {
            let range = template.trigger_steps;
            ensure!(
                range.first >= 1 && range.first <= range.last,
                "procedure `{}`: complication `{}` has an empty trigger range",
                self.id,
                template.kind
            );
            ensure!(
                contains_ignore_case(&template.management_options, &template.preferred_option),
                "procedure `{}`: complication `{}` prefers an unlisted option",
                self.id,
                template.kind
            );
            ensure!(
                template.response_time_limit_secs > 0.0,
                "procedure `{}`: complication `{}` needs a positive time limit",
                self.id,
                template.kind
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    procedures: Vec<ProcedureDefinition>,
}

/// Read-only registry of procedure definitions.
#[derive(Debug, Clone, Default)]
pub struct ProcedureCatalog {
    procedures: IndexMap<String, ProcedureDefinition>,
}

impl ProcedureCatalog {
    /// Builds a catalog, validating every definition.
    pub fn new(procedures: Vec<ProcedureDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut map = IndexMap::with_capacity(procedures.len());
        for procedure in procedures {
            procedure.validate()?;
            if !seen.insert(procedure.id.clone()) {
                bail!("duplicate procedure id `{}`", procedure.id);
            }
            map.insert(procedure.id.clone(), procedure);
        }
        Ok(Self { procedures: map })
    }

    /// Catalog shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_CATALOG).context("parsing builtin catalog")
    }

    /// Parses a catalog from TOML (`[[procedures]]` tables).
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let document: CatalogDocument = toml::from_str(raw)?;
        Self::new(document.procedures)
    }

    /// Loads a catalog file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Looks up a procedure.
    pub fn get(&self, id: &str) -> Result<&ProcedureDefinition, SimulationError> {
        self.procedures
            .get(id)
            .ok_or_else(|| SimulationError::UnknownProcedure(id.to_string()))
    }

    /// Procedures in catalog order.
    pub fn procedures(&self) -> impl Iterator<Item = &ProcedureDefinition> {
        self.procedures.values()
    }

    /// Number of procedures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    /// True when the catalog holds no procedure.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

fn contains_ignore_case(haystack: &[String], needle: &str) -> bool {
    let needle = needle.trim();
    haystack.iter().any(|item| item.eq_ignore_ascii_case(needle))
}

const fn default_min_difficulty() -> Difficulty {
    Difficulty::Intermediate
}
