use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    catalog::{Difficulty, GuidanceLevel, ProcedureCatalog, StepTemplate},
    complication_scheduler::{ComplicationScheduler, Schedule, ScheduledComplication},
    config::ComplicationDensity,
    errors::SimulationError,
    helper::{random_seed, seeded_rng, SimulationTelemetry},
    patient_generator::{SubjectConstraints, SubjectGenerator, SubjectProfile},
};

const BEGINNER_HINT_COUNT: usize = 3;

/// Validated request for a new plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioRequest {
    /// Catalog id of the procedure.
    pub procedure_id: String,
    /// Requested difficulty.
    pub difficulty: Difficulty,
    /// Subject constraints.
    pub subject: SubjectConstraints,
    /// Free-text objectives matched against step titles and descriptions.
    pub learning_objectives: Vec<String>,
    /// Whether complications are scheduled at all.
    pub complications_enabled: bool,
    /// Seed for every random draw; random when absent.
    pub seed: Option<u64>,
}

impl ScenarioRequest {
    /// Request with default subject constraints and complications enabled.
    #[must_use]
    pub fn new(procedure_id: impl Into<String>, difficulty: Difficulty) -> Self {
        Self {
            procedure_id: procedure_id.into(),
            difficulty,
            subject: SubjectConstraints::default(),
            learning_objectives: Vec::new(),
            complications_enabled: true,
            seed: None,
        }
    }

    /// Sets the seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Procedure summary carried on a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcedureInfo {
    /// Catalog id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Specialty.
    pub category: String,
    /// Sum of the customised budget midpoints.
    pub estimated_duration_minutes: f64,
}

/// A step customised for the plan's difficulty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedStep {
    /// Catalog step with its budget scaled and hints replaced.
    #[serde(flatten)]
    pub template: StepTemplate,
    /// Guidance offered during the step.
    pub guidance_level: GuidanceLevel,
    /// Whether the trainee works under explicit time pressure.
    pub time_pressure: bool,
    /// Learning objectives matching this step.
    pub learning_focus: Vec<String>,
    /// Judgement calls posed during the step; intermediate plans only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decision_points: Vec<DecisionPoint>,
    /// Alternative techniques the trainee may choose; advanced plans only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variations: Vec<String>,
}

/// A judgement call offered inside a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionPoint {
    /// Situation presented.
    pub scenario: String,
    /// Choices offered.
    pub options: Vec<String>,
    /// Expected choice; one of `options`.
    pub correct_choice: String,
}

impl PlannedStep {
    /// 1-based step index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.template.index
    }

    /// Scaled budget in seconds.
    #[must_use]
    pub fn budget_secs(&self) -> f64 {
        self.template.time_budget.budget_secs()
    }
}

/// Immutable plan for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationPlan {
    /// Plan id; the session reuses it.
    pub id: Uuid,
    /// Procedure summary.
    pub procedure: ProcedureInfo,
    /// Difficulty.
    pub difficulty: Difficulty,
    /// Objectives as requested.
    pub learning_objectives: Vec<String>,
    /// Steps in execution order.
    pub steps: Vec<PlannedStep>,
    /// Trigger step to complication.
    pub complications: IndexMap<usize, ScheduledComplication>,
    /// Generated subject.
    pub subject: SubjectProfile,
    /// Scheduling notes.
    pub warnings: Vec<String>,
    /// Seed for the session's vitals noise.
    pub signal_seed: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl SimulationPlan {
    /// Step by 1-based index.
    #[must_use]
    pub fn step(&self, index: usize) -> Option<&PlannedStep> {
        index.checked_sub(1).and_then(|idx| self.steps.get(idx))
    }

    /// Number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Complication scheduled to fire on entry to `step`.
    #[must_use]
    pub fn complication_at(&self, step: usize) -> Option<&ScheduledComplication> {
        self.complications.get(&step)
    }
}

/// Builds plans from the catalog.
#[derive(Debug, Clone)]
pub struct ScenarioBuilder {
    catalog: Arc<ProcedureCatalog>,
    generator: SubjectGenerator,
    scheduler: ComplicationScheduler,
    telemetry: Option<SimulationTelemetry>,
}

impl ScenarioBuilder {
    /// Creates a builder over `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<ProcedureCatalog>, density: ComplicationDensity) -> Self {
        Self {
            catalog,
            generator: SubjectGenerator::new(),
            scheduler: ComplicationScheduler::new(density),
            telemetry: None,
        }
    }

    /// Attaches telemetry to the builder and its scheduler.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<SimulationTelemetry>) -> Self {
        self.scheduler = self.scheduler.with_telemetry(telemetry.clone());
        self.telemetry = telemetry;
        self
    }

    /// Shared catalog.
    #[must_use]
    pub const fn catalog(&self) -> &Arc<ProcedureCatalog> {
        &self.catalog
    }

    /// Builds a plan seeded from the request, or from a fresh seed.
    pub fn build(&self, request: &ScenarioRequest) -> Result<SimulationPlan, SimulationError> {
        let seed = request.seed.unwrap_or_else(random_seed);
        let plan = self.build_with_rng(request, &mut seeded_rng(seed))?;
        if let Some(tel) = &self.telemetry {
            let _ = tel.info(
                "scenario.plan.generated",
                json!({
                    "simulation_id": plan.id.to_string(),
                    "procedure": plan.procedure.id,
                    "difficulty": plan.difficulty.label(),
                    "steps": plan.step_count(),
                    "complications": plan.complications.len(),
                    "seed": seed,
                }),
            );
        }
        Ok(plan)
    }

    /// Builds a plan drawing every random value from `rng`.
    ///
    /// The procedure, difficulty and age range are validated before the
    /// first draw.
    pub fn build_with_rng<R: Rng + ?Sized>(
        &self,
        request: &ScenarioRequest,
        rng: &mut R,
    ) -> Result<SimulationPlan, SimulationError> {
        let procedure = self.catalog.get(&request.procedure_id)?;
        let difficulty = request.difficulty;
        if !procedure.supports(difficulty) {
            return Err(SimulationError::UnsupportedDifficulty {
                procedure: procedure.id.clone(),
                difficulty,
            });
        }
        request.subject.validate()?;

        let subject = self.generator.generate(&request.subject, rng)?;
        let step_count = procedure.steps.len();
        let schedule = match self.scheduler.schedule(
            procedure,
            difficulty,
            request.complications_enabled,
            step_count,
            rng,
        ) {
            Ok(schedule) => schedule,
            Err(err) if err.is_recoverable() => {
                if let Some(tel) = &self.telemetry {
                    let _ = tel.warn(
                        "scenario.complications.fallback",
                        json!({
                            "procedure": procedure.id,
                            "difficulty": difficulty.label(),
                            "reason": err.to_string(),
                        }),
                    );
                }
                Schedule {
                    complications: IndexMap::new(),
                    warnings: vec![err.to_string()],
                }
            }
            Err(err) => return Err(err),
        };

        let steps: Vec<PlannedStep> = procedure
            .steps
            .iter()
            .map(|step| customise_step(step, difficulty, &request.learning_objectives))
            .collect();
        let estimated_duration_minutes = steps
            .iter()
            .map(|step| step.template.time_budget.midpoint_minutes())
            .sum();

        Ok(SimulationPlan {
            id: Uuid::new_v4(),
            procedure: ProcedureInfo {
                id: procedure.id.clone(),
                name: procedure.name.clone(),
                category: procedure.category.clone(),
                estimated_duration_minutes,
            },
            difficulty,
            learning_objectives: request.learning_objectives.clone(),
            steps,
            complications: schedule.complications,
            subject,
            warnings: schedule.warnings,
            signal_seed: rng.gen(),
            created_at: Utc::now(),
        })
    }
}

fn customise_step(step: &StepTemplate, difficulty: Difficulty, objectives: &[String]) -> PlannedStep {
    let mut template = step.clone();
    template.time_budget = step.time_budget.scaled(difficulty.time_factor());
    template.hints = match difficulty {
        Difficulty::Beginner => beginner_hints(step),
        Difficulty::Intermediate => step.hints.clone(),
        Difficulty::Advanced | Difficulty::Expert => Vec::new(),
    };
    PlannedStep {
        learning_focus: learning_focus(step, objectives),
        guidance_level: difficulty.guidance(),
        time_pressure: difficulty == Difficulty::Expert,
        decision_points: if difficulty == Difficulty::Intermediate {
            decision_points()
        } else {
            Vec::new()
        },
        variations: if difficulty == Difficulty::Advanced {
            technique_variations(step)
        } else {
            Vec::new()
        },
        template,
    }
}

fn decision_points() -> Vec<DecisionPoint> {
    vec![DecisionPoint {
        scenario: "Unusual anatomy encountered".into(),
        options: vec![
            "Continue with caution".into(),
            "Seek senior help".into(),
            "Convert to open".into(),
        ],
        correct_choice: "Seek senior help".into(),
    }]
}

fn technique_variations(step: &StepTemplate) -> Vec<String> {
    let title = step.title.to_lowercase();
    vec![
        format!("Standard {title}"),
        format!("{} with limited exposure", step.title),
        format!("Single-operator {title} without an assistant"),
    ]
}

fn beginner_hints(step: &StepTemplate) -> Vec<String> {
    let generic = [
        format!("Take your time with {}", step.title.to_lowercase()),
        "Ensure proper visualization before proceeding".to_string(),
        "Communicate with your team throughout the step".to_string(),
    ];
    step.hints
        .iter()
        .cloned()
        .chain(generic)
        .take(BEGINNER_HINT_COUNT)
        .collect()
}

fn learning_focus(step: &StepTemplate, objectives: &[String]) -> Vec<String> {
    let title = step.title.to_lowercase();
    let description = step.description.to_lowercase();
    objectives
        .iter()
        .filter(|objective| {
            let needle = objective.trim().to_lowercase();
            !needle.is_empty() && (title.contains(&needle) || description.contains(&needle))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient_generator::HistoryTag;
    use shared_logging::MemoryLogger;

    fn builder() -> ScenarioBuilder {
        ScenarioBuilder::new(
            Arc::new(ProcedureCatalog::builtin().unwrap()),
            ComplicationDensity::default(),
        )
    }

    #[test]
    fn rejects_bad_requests_before_sampling() {
        let builder = builder();
        let unknown = ScenarioRequest::new("heart_transplant", Difficulty::Beginner);
        assert_eq!(
            builder.build(&unknown).unwrap_err(),
            SimulationError::UnknownProcedure("heart_transplant".into())
        );
        let expert = ScenarioRequest::new("appendectomy", Difficulty::Expert);
        assert!(matches!(
            builder.build(&expert).unwrap_err(),
            SimulationError::UnsupportedDifficulty { .. }
        ));
        let mut inverted = ScenarioRequest::new("appendectomy", Difficulty::Beginner);
        inverted.subject.age_min = 70;
        inverted.subject.age_max = 30;
        assert_eq!(
            builder.build(&inverted).unwrap_err(),
            SimulationError::InvalidRange { min: 70, max: 30 }
        );
    }

    #[test]
    fn beginner_plan_keeps_steps_and_extends_budgets() {
        let builder = builder();
        let plan = builder
            .build(&ScenarioRequest::new("laparoscopic_cholecystectomy", Difficulty::Beginner).with_seed(1))
            .unwrap();
        let source = builder.catalog().get("laparoscopic_cholecystectomy").unwrap();
        assert_eq!(plan.step_count(), source.steps.len());
        assert!(plan.complications.is_empty());
        for (planned, original) in plan.steps.iter().zip(&source.steps) {
            assert_eq!(planned.index(), original.index);
            assert_eq!(planned.guidance_level, GuidanceLevel::Detailed);
            assert_eq!(planned.template.hints.len(), BEGINNER_HINT_COUNT);
            assert!(
                (planned.template.time_budget.max_minutes - original.time_budget.max_minutes * 1.5)
                    .abs()
                    < 1e-9
            );
        }
        let expected: f64 = plan
            .steps
            .iter()
            .map(|step| step.template.time_budget.midpoint_minutes())
            .sum();
        assert!((plan.procedure.estimated_duration_minutes - expected).abs() < 1e-9);
    }

    #[test]
    fn expert_plan_is_unguided_and_pressured() {
        let plan = builder()
            .build(&ScenarioRequest::new("knee_arthroscopy", Difficulty::Expert).with_seed(4))
            .unwrap();
        assert_eq!(plan.complications.len(), 3);
        assert!(plan.steps.iter().all(|step| step.time_pressure
            && step.template.hints.is_empty()
            && step.guidance_level == GuidanceLevel::None));
    }

    #[test]
    fn objectives_become_learning_focus() {
        let mut request = ScenarioRequest::new("laparoscopic_cholecystectomy", Difficulty::Intermediate);
        request.learning_objectives = vec!["Critical View".into(), "".into()];
        let plan = builder().build(&request.with_seed(2)).unwrap();
        let focused: Vec<_> = plan
            .steps
            .iter()
            .filter(|step| !step.learning_focus.is_empty())
            .collect();
        assert!(!focused.is_empty());
        for step in focused {
            assert_eq!(step.learning_focus, vec!["Critical View".to_string()]);
        }
    }

    #[test]
    fn step_extras_follow_difficulty() {
        let builder = builder();
        let plan_at = |difficulty| {
            builder
                .build(&ScenarioRequest::new("laparoscopic_cholecystectomy", difficulty).with_seed(6))
                .unwrap()
        };
        let intermediate = plan_at(Difficulty::Intermediate);
        for step in &intermediate.steps {
            assert_eq!(step.decision_points.len(), 1);
            let point = &step.decision_points[0];
            assert!(point.options.contains(&point.correct_choice));
            assert!(step.variations.is_empty());
        }
        let advanced = plan_at(Difficulty::Advanced);
        for step in &advanced.steps {
            assert!(step.decision_points.is_empty());
            assert_eq!(step.variations.len(), 3);
            assert!(step.variations[0].contains(&step.template.title.to_lowercase()));
        }
        for difficulty in [Difficulty::Beginner, Difficulty::Expert] {
            let plan = plan_at(difficulty);
            assert!(plan
                .steps
                .iter()
                .all(|step| step.decision_points.is_empty() && step.variations.is_empty()));
        }
        let rendered = serde_json::to_value(&plan_at(Difficulty::Expert).steps[0]).unwrap();
        assert!(rendered.get("variations").is_none());
    }

    #[test]
    fn same_seed_reproduces_subject_and_schedule() {
        let builder = builder();
        let mut request = ScenarioRequest::new("laparoscopic_cholecystectomy", Difficulty::Advanced);
        request.subject.history = Some(vec![HistoryTag::Diabetes]);
        let a = builder.build(&request.clone().with_seed(99)).unwrap();
        let b = builder.build(&request.with_seed(99)).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.subject, b.subject);
        assert_eq!(a.subject.lab_results, b.subject.lab_results);
        assert_eq!(a.subject.imaging, b.subject.imaging);
        assert_eq!(a.subject.social_history, b.subject.social_history);
        assert_eq!(a.complications, b.complications);
        assert_eq!(a.signal_seed, b.signal_seed);
    }

    #[test]
    fn missing_eligible_templates_falls_back_with_warning() {
        let mut procedure = ProcedureCatalog::builtin()
            .unwrap()
            .get("appendectomy")
            .unwrap()
            .clone();
        for template in &mut procedure.complications {
            template.min_difficulty = Difficulty::Advanced;
        }
        let catalog = Arc::new(ProcedureCatalog::new(vec![procedure]).unwrap());
        let sink = Arc::new(MemoryLogger::new(8));
        let telemetry = SimulationTelemetry::builder("scenario")
            .sink(sink.clone())
            .build()
            .unwrap();
        let builder = ScenarioBuilder::new(catalog, ComplicationDensity::default())
            .with_telemetry(Some(telemetry));
        let plan = builder
            .build(&ScenarioRequest::new("appendectomy", Difficulty::Intermediate).with_seed(3))
            .unwrap();
        assert!(plan.complications.is_empty());
        assert_eq!(plan.warnings.len(), 1);
        assert_eq!(sink.find("scenario.complications.fallback").len(), 1);
        assert_eq!(sink.find("scenario.plan.generated").len(), 1);
    }
}
