//! JSON shapes exchanged with callers.
//!
//! Untyped payloads are parsed here once and converted into the typed
//! requests the rest of the crate works with.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    catalog::{Difficulty, ProcedureDefinition},
    errors::SimulationError,
    patient_generator::{GenderSelector, HistoryTag, SubjectConstraints, SubjectProfile},
    scenario_builder::{PlannedStep, ProcedureInfo, ScenarioRequest, SimulationPlan},
    session::{ActionInput, ActionKind, PendingComplication},
};

/// Parses a JSON document, reporting failures as `InvalidRequest`.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, SimulationError> {
    serde_json::from_str(raw).map_err(|err| SimulationError::InvalidRequest(err.to_string()))
}

/// Session creation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateSimulationRequest {
    /// Catalog procedure id.
    pub procedure_type: String,
    /// Difficulty label.
    #[serde(default = "default_difficulty")]
    pub difficulty_level: String,
    /// Inclusive `[min, max]` age range.
    #[serde(default = "default_age_range")]
    pub age_range: [i64; 2],
    /// `male`, `female`, or absent for random.
    #[serde(default)]
    pub gender: Option<String>,
    /// History tags; absent samples a history, empty means none.
    #[serde(default)]
    pub medical_history: Option<Vec<String>>,
    /// Free-text learning objectives.
    #[serde(default)]
    pub learning_objectives: Vec<String>,
    /// Whether complications are scheduled.
    #[serde(default = "enabled")]
    pub complications_enabled: bool,
    /// Fixed seed for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl TryFrom<GenerateSimulationRequest> for ScenarioRequest {
    type Error = SimulationError;

    fn try_from(raw: GenerateSimulationRequest) -> Result<Self, Self::Error> {
        let procedure_id = raw.procedure_type.trim().to_string();
        if procedure_id.is_empty() {
            return Err(SimulationError::InvalidRequest(
                "procedure_type must not be empty".into(),
            ));
        }
        let gender = raw
            .gender
            .as_deref()
            .map(str::parse::<GenderSelector>)
            .transpose()?
            .unwrap_or_default();
        // Unrecognised conditions ride along on the profile.
        let mut other_history = Vec::new();
        let history = raw.medical_history.map(|tags| {
            tags.into_iter()
                .filter_map(|tag| match tag.parse::<HistoryTag>() {
                    Ok(known) => Some(known),
                    Err(_) => {
                        other_history.push(tag);
                        None
                    }
                })
                .collect::<Vec<_>>()
        });
        Ok(Self {
            procedure_id,
            difficulty: raw.difficulty_level.parse()?,
            subject: SubjectConstraints {
                age_min: raw.age_range[0],
                age_max: raw.age_range[1],
                gender,
                history,
                other_history,
            },
            learning_objectives: raw.learning_objectives,
            complications_enabled: raw.complications_enabled,
            seed: raw.seed,
        })
    }
}

fn default_difficulty() -> String {
    Difficulty::Intermediate.label().to_string()
}

const fn default_age_range() -> [i64; 2] {
    [20, 80]
}

const fn enabled() -> bool {
    true
}

/// Plan section of the creation response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimulationView {
    /// Procedure summary.
    pub procedure_info: ProcedureInfo,
    /// Difficulty.
    pub difficulty_level: Difficulty,
    /// Requested objectives.
    pub learning_objectives: Vec<String>,
    /// Customised steps.
    pub steps: Vec<PlannedStep>,
    /// Scheduled complications in trigger order.
    pub complications: Vec<PendingComplication>,
    /// Scheduling notes.
    pub warnings: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Creation response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanEnvelope {
    /// Session id.
    pub simulation_id: Uuid,
    /// Generated subject.
    pub patient: SubjectProfile,
    /// Plan.
    pub simulation: SimulationView,
}

impl From<&SimulationPlan> for PlanEnvelope {
    fn from(plan: &SimulationPlan) -> Self {
        Self {
            simulation_id: plan.id,
            patient: plan.subject.clone(),
            simulation: SimulationView {
                procedure_info: plan.procedure.clone(),
                difficulty_level: plan.difficulty,
                learning_objectives: plan.learning_objectives.clone(),
                steps: plan.steps.clone(),
                complications: plan
                    .complications
                    .values()
                    .map(PendingComplication::from)
                    .collect(),
                warnings: plan.warnings.clone(),
                created_at: plan.created_at,
            },
        }
    }
}

/// Step completion payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSubmission {
    /// Step being completed; must equal the session's current step.
    pub step_number: usize,
    /// Raw actions, each `{"type": ..., ...}`.
    #[serde(default)]
    pub actions: Vec<Value>,
    /// Seconds spent on the step.
    #[serde(default)]
    pub time_taken: f64,
}

impl StepSubmission {
    /// Parses every action, failing on the first malformed one.
    pub fn parse_actions(&self) -> Result<Vec<ActionInput>, SimulationError> {
        if !self.time_taken.is_finite() || self.time_taken < 0.0 {
            return Err(SimulationError::InvalidRequest(format!(
                "time_taken must be a non-negative number, got {}",
                self.time_taken
            )));
        }
        self.actions.iter().map(parse_action).collect()
    }
}

/// Parses one raw action, keeping the raw value as its payload.
pub fn parse_action(raw: &Value) -> Result<ActionInput, SimulationError> {
    let kind: ActionKind = serde_json::from_value(raw.clone())
        .map_err(|err| SimulationError::InvalidRequest(format!("invalid action: {err}")))?;
    if let ActionKind::StructureInteraction { precision, .. } = &kind {
        if !precision.is_finite() {
            return Err(SimulationError::InvalidRequest(
                "precision must be a finite number".into(),
            ));
        }
    }
    Ok(ActionInput::new(kind).with_payload(raw.clone()))
}

/// Catalog listing entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcedureSummary {
    /// Catalog id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Specialty.
    pub category: String,
    /// Number of steps.
    pub step_count: usize,
    /// Supported difficulties.
    pub difficulties: Vec<Difficulty>,
}

impl From<&ProcedureDefinition> for ProcedureSummary {
    fn from(procedure: &ProcedureDefinition) -> Self {
        Self {
            id: procedure.id.clone(),
            name: procedure.name.clone(),
            category: procedure.category.clone(),
            step_count: procedure.steps.len(),
            difficulties: procedure.difficulties.clone(),
        }
    }
}
