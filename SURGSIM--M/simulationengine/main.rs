use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    assessment::{FinalAssessment, StepAssessment},
    boundary::{GenerateSimulationRequest, PlanEnvelope, ProcedureSummary, StepSubmission},
    catalog::ProcedureCatalog,
    config::EngineConfig,
    errors::SimulationError,
    helper::SimulationTelemetry,
    scenario_builder::{ScenarioBuilder, ScenarioRequest, SimulationPlan},
    session::{
        AdvanceOutcome, ComplicationResponse, ResolutionOutcome, SessionStateMachine,
        SessionStatus,
    },
    signal_model::VitalsReading,
};

type SessionHandle = Arc<Mutex<SessionStateMachine>>;

/// Result of submitting a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutcome {
    /// Assessment of the submitted step.
    pub assessment: StepAssessment,
    /// What happened when moving on.
    pub next: AdvanceOutcome,
}

/// Owns the catalog, the plan builder and every live session.
///
/// Sessions are locked individually, so distinct sessions can be driven from
/// different threads at the same time.
pub struct SimulationEngine {
    builder: ScenarioBuilder,
    config: EngineConfig,
    telemetry: Option<SimulationTelemetry>,
    sessions: RwLock<IndexMap<Uuid, SessionHandle>>,
}

impl SimulationEngine {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> SimulationEngineBuilder {
        SimulationEngineBuilder::default()
    }

    /// Builds an engine from a loaded configuration.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Returns telemetry handle.
    #[must_use]
    pub fn telemetry(&self) -> Option<&SimulationTelemetry> {
        self.telemetry.as_ref()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Catalog entries in catalog order.
    #[must_use]
    pub fn procedures(&self) -> Vec<ProcedureSummary> {
        self.builder
            .catalog()
            .procedures()
            .map(ProcedureSummary::from)
            .collect()
    }

    /// Parses a creation payload, builds the plan and opens a session.
    pub fn generate(
        &self,
        request: GenerateSimulationRequest,
    ) -> Result<PlanEnvelope, SimulationError> {
        let request = ScenarioRequest::try_from(request)?;
        let plan = self.generate_plan(&request)?;
        Ok(PlanEnvelope::from(&plan))
    }

    /// Builds a plan from a typed request and opens a session for it.
    pub fn generate_plan(&self, request: &ScenarioRequest) -> Result<SimulationPlan, SimulationError> {
        let plan = self.builder.build(request)?;
        let machine = SessionStateMachine::new(
            plan.clone(),
            self.config.scoring.clone(),
            self.config.signal,
        )
        .with_telemetry(self.telemetry.clone());
        self.sessions
            .write()
            .insert(plan.id, Arc::new(Mutex::new(machine)));
        Ok(plan)
    }

    /// Records the submitted actions, scores the step and moves on.
    pub fn submit_step(
        &self,
        id: Uuid,
        submission: &StepSubmission,
    ) -> Result<StepOutcome, SimulationError> {
        let actions = submission.parse_actions()?;
        let handle = self.session(id)?;
        let mut machine = handle.lock();
        match machine.status() {
            SessionStatus::Complete => return Err(SimulationError::SessionClosed(id)),
            SessionStatus::AwaitingComplication => {
                return Err(SimulationError::NoActiveStep {
                    status: machine.status(),
                })
            }
            SessionStatus::Created | SessionStatus::InProgress => {}
        }
        let current = machine.current_step();
        if submission.step_number != current {
            return Err(SimulationError::InvalidRequest(format!(
                "step_number {} does not match current step {current}",
                submission.step_number
            )));
        }
        if machine.session().assessment_for(current).is_some() {
            return Err(SimulationError::StepAlreadyAssessed(current));
        }
        for action in actions {
            machine.record_action(action)?;
        }
        let assessment = machine.complete_step(submission.time_taken)?;
        let next = machine.advance()?;
        Ok(StepOutcome { assessment, next })
    }

    /// Resolves the complication a session is waiting on.
    pub fn resolve_complication(
        &self,
        id: Uuid,
        response: ComplicationResponse,
    ) -> Result<ResolutionOutcome, SimulationError> {
        let handle = self.session(id)?;
        let mut machine = handle.lock();
        machine.resolve_complication(response)
    }

    /// Current vitals of a session.
    pub fn vitals(&self, id: Uuid) -> Result<VitalsReading, SimulationError> {
        let handle = self.session(id)?;
        let mut machine = handle.lock();
        Ok(machine.current_vitals())
    }

    /// Status of a session.
    pub fn status(&self, id: Uuid) -> Result<SessionStatus, SimulationError> {
        Ok(self.session(id)?.lock().status())
    }

    /// Final assessment of a complete session; the session is released afterwards.
    pub fn complete(&self, id: Uuid) -> Result<FinalAssessment, SimulationError> {
        let handle = self.session(id)?;
        let assessment = handle.lock().finalize()?;
        self.sessions.write().shift_remove(&id);
        if let Some(tel) = &self.telemetry {
            let _ = tel.info(
                "engine.session.released",
                json!({
                    "simulation_id": id.to_string(),
                    "certification_level": assessment.certification_level.label(),
                }),
            );
        }
        Ok(assessment)
    }

    /// Drops a session without assessing it.
    pub fn abandon(&self, id: Uuid) -> Result<(), SimulationError> {
        let removed = self
            .sessions
            .write()
            .shift_remove(&id)
            .ok_or(SimulationError::UnknownSession(id))?;
        if let Some(tel) = &self.telemetry {
            let _ = tel.warn(
                "engine.session.abandoned",
                json!({
                    "simulation_id": id.to_string(),
                    "step": removed.lock().current_step(),
                }),
            );
        }
        Ok(())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    fn session(&self, id: Uuid) -> Result<SessionHandle, SimulationError> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(SimulationError::UnknownSession(id))
    }
}

/// Builder for `SimulationEngine`.
#[derive(Default)]
pub struct SimulationEngineBuilder {
    catalog: Option<Arc<ProcedureCatalog>>,
    config: EngineConfig,
    telemetry: Option<SimulationTelemetry>,
}

impl SimulationEngineBuilder {
    /// Uses an already loaded catalog instead of the configured one.
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<ProcedureCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Sets configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets telemetry, overriding the configured log file.
    #[must_use]
    pub fn telemetry(mut self, telemetry: SimulationTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Result<SimulationEngine> {
        let config = self.config;
        config.validate()?;
        let catalog = match (self.catalog, &config.catalog_path) {
            (Some(catalog), _) => catalog,
            (None, Some(path)) => Arc::new(ProcedureCatalog::load(path)?),
            (None, None) => Arc::new(ProcedureCatalog::builtin()?),
        };
        let telemetry = match (self.telemetry, &config.logging.path) {
            (Some(telemetry), _) => Some(telemetry),
            (None, Some(path)) => Some(
                SimulationTelemetry::builder("simulation-engine")
                    .log_path(path)
                    .min_level(config.logging.min_level)
                    .build()
                    .with_context(|| format!("opening log file {}", path.display()))?,
            ),
            (None, None) => None,
        };
        let builder = ScenarioBuilder::new(catalog, config.complications)
            .with_telemetry(telemetry.clone());
        Ok(SimulationEngine {
            builder,
            config,
            telemetry,
            sessions: RwLock::new(IndexMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assessment::CertificationLevel, boundary::parse_json, catalog::Difficulty,
        patient_generator::HistoryTag,
    };
    use serde_json::json;
    use shared_logging::MemoryLogger;
    use std::{fs, thread};
    use tempfile::tempdir;

    fn engine() -> SimulationEngine {
        SimulationEngine::builder().build().unwrap()
    }

    fn request(procedure: &str, difficulty: &str, seed: u64) -> GenerateSimulationRequest {
        parse_json(
            &json!({
                "procedure_type": procedure,
                "difficulty_level": difficulty,
                "age_range": [30, 60],
                "seed": seed,
            })
            .to_string(),
        )
        .unwrap()
    }

    fn run_to_completion(engine: &SimulationEngine, id: Uuid) -> FinalAssessment {
        let mut step = 1;
        loop {
            let submission = StepSubmission {
                step_number: step,
                actions: vec![json!({"type": "help_request"})],
                time_taken: 90.0,
            };
            let outcome = engine.submit_step(id, &submission).unwrap();
            assert_eq!(outcome.assessment.step_index, step);
            match outcome.next {
                AdvanceOutcome::Advanced { step: next } => step = next,
                AdvanceOutcome::Completed => break,
                AdvanceOutcome::ComplicationTriggered { complication } => {
                    let resolved = engine
                        .resolve_complication(
                            id,
                            ComplicationResponse {
                                choice: complication.management_options.last().cloned(),
                                response_secs: 12.0,
                            },
                        )
                        .unwrap();
                    match resolved.next {
                        AdvanceOutcome::Advanced { step: next } => step = next,
                        other => panic!("unexpected {other:?}"),
                    }
                }
            }
        }
        engine.complete(id).unwrap()
    }

    #[test]
    fn lists_builtin_procedures() {
        let procedures = engine().procedures();
        assert_eq!(procedures.len(), 3);
        assert_eq!(procedures[0].id, "laparoscopic_cholecystectomy");
        assert_eq!(procedures[1].step_count, 5);
    }

    #[test]
    fn full_session_round_trip() {
        let engine = engine();
        let envelope = engine
            .generate(request("laparoscopic_cholecystectomy", "advanced", 7))
            .unwrap();
        assert_eq!(envelope.simulation.complications.len(), 2);
        assert_eq!(envelope.simulation.steps.len(), 6);
        let age = envelope.patient.demographics.age;
        assert!((30..=60).contains(&age));
        let id = envelope.simulation_id;
        assert_eq!(engine.status(id).unwrap(), SessionStatus::Created);
        let vitals = engine.vitals(id).unwrap();
        assert!(vitals.vitals.within_bounds());

        let report = run_to_completion(&engine, id);
        assert_eq!(report.simulation_id, id);
        assert_eq!(report.scores.individual_steps.len(), 6);
        assert_eq!(report.performance_metrics.complications_handled, 2);
        assert_eq!(engine.active_sessions(), 0);
        assert_eq!(
            engine.vitals(id).unwrap_err(),
            SimulationError::UnknownSession(id)
        );
    }

    #[test]
    fn rejects_out_of_order_submissions() {
        let engine = engine();
        let id = engine
            .generate(request("appendectomy", "beginner", 2))
            .unwrap()
            .simulation_id;
        let wrong = StepSubmission {
            step_number: 3,
            actions: Vec::new(),
            time_taken: 10.0,
        };
        assert!(matches!(
            engine.submit_step(id, &wrong).unwrap_err(),
            SimulationError::InvalidRequest(_)
        ));
        assert!(matches!(
            engine.complete(id).unwrap_err(),
            SimulationError::SessionIncomplete { .. }
        ));
        assert_eq!(engine.active_sessions(), 1);
    }

    #[test]
    fn unknown_and_abandoned_sessions() {
        let engine = engine();
        let missing = Uuid::new_v4();
        assert_eq!(
            engine.abandon(missing).unwrap_err(),
            SimulationError::UnknownSession(missing)
        );
        let id = engine
            .generate(request("knee_arthroscopy", "intermediate", 4))
            .unwrap()
            .simulation_id;
        engine.abandon(id).unwrap();
        assert_eq!(engine.active_sessions(), 0);
        assert_eq!(
            engine
                .resolve_complication(id, ComplicationResponse::default())
                .unwrap_err(),
            SimulationError::UnknownSession(id)
        );
    }

    #[test]
    fn unsupported_difficulty_opens_no_session() {
        let engine = engine();
        let err = engine
            .generate(request("appendectomy", "expert", 1))
            .unwrap_err();
        assert!(matches!(err, SimulationError::UnsupportedDifficulty { .. }));
        assert_eq!(engine.active_sessions(), 0);
    }

    #[test]
    fn unlisted_history_still_generates_a_plan() {
        let engine = engine();
        let mut raw = request("appendectomy", "beginner", 17);
        raw.medical_history = Some(vec!["diabetes".into(), "asthma".into()]);
        let envelope = engine.generate(raw).unwrap();
        let subject = &envelope.patient;
        assert!(subject.has(HistoryTag::Diabetes));
        assert_eq!(subject.history.len(), 1);
        assert_eq!(subject.other_history, vec!["asthma".to_string()]);
        assert_eq!(engine.active_sessions(), 1);
    }

    #[test]
    fn sessions_run_in_parallel() {
        let engine = engine();
        let ids: Vec<Uuid> = (0..4)
            .map(|seed| {
                engine
                    .generate(request("knee_arthroscopy", "expert", seed))
                    .unwrap()
                    .simulation_id
            })
            .collect();
        let shared = &engine;
        let reports: Vec<FinalAssessment> = thread::scope(|scope| {
            let handles: Vec<_> = ids
                .iter()
                .map(|&id| scope.spawn(move || run_to_completion(shared, id)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });
        assert_eq!(reports.len(), 4);
        for (report, id) in reports.iter().zip(&ids) {
            assert_eq!(report.simulation_id, *id);
            assert_eq!(report.scores.individual_steps.len(), 6);
            assert_eq!(report.performance_metrics.complications_handled, 3);
        }
        assert_eq!(engine.active_sessions(), 0);
    }

    #[test]
    fn typed_plans_share_the_registry() {
        let engine = engine();
        let plan = engine
            .generate_plan(&ScenarioRequest::new("appendectomy", Difficulty::Beginner).with_seed(5))
            .unwrap();
        assert_eq!(engine.status(plan.id).unwrap(), SessionStatus::Created);
        let report = run_to_completion(&engine, plan.id);
        assert_eq!(report.scores.technical_average, 0.0);
        assert_eq!(report.certification_level, CertificationLevel::Novice);
    }

    #[test]
    fn builds_from_config_file() {
        let dir = tempdir().unwrap();
        let catalog = dir.path().join("catalog.toml");
        fs::write(
            &catalog,
            r#"
            [[procedures]]
            id = "suture"
            name = "Skin Suture"
            category = "General"
            difficulties = ["beginner"]

            [[procedures.steps]]
            index = 1
            title = "Close"
            description = "Close the wound"
            instruments = ["needle driver"]
            time_budget = { min_minutes = 2.0, max_minutes = 4.0 }
            "#,
        )
        .unwrap();
        let config_path = dir.path().join("engine.toml");
        fs::write(
            &config_path,
            "catalog_path = \"catalog.toml\"\n[logging]\npath = \"engine.log\"\n",
        )
        .unwrap();
        let engine = SimulationEngine::from_config(EngineConfig::load(&config_path).unwrap()).unwrap();
        assert_eq!(engine.procedures().len(), 1);
        let id = engine
            .generate(request("suture", "beginner", 1))
            .unwrap()
            .simulation_id;
        run_to_completion(&engine, id);
        let log = fs::read_to_string(dir.path().join("engine.log")).unwrap();
        assert!(log.contains("scenario.plan.generated"));
        assert!(log.contains("engine.session.released"));
    }

    #[test]
    fn telemetry_sink_sees_lifecycle() {
        let sink = Arc::new(MemoryLogger::new(128));
        let telemetry = SimulationTelemetry::builder("simulation-engine")
            .sink(sink.clone())
            .build()
            .unwrap();
        let engine = SimulationEngine::builder()
            .telemetry(telemetry)
            .build()
            .unwrap();
        let id = engine
            .generate(request("appendectomy", "intermediate", 9))
            .unwrap()
            .simulation_id;
        run_to_completion(&engine, id);
        assert_eq!(sink.find("session.step.completed").len(), 5);
        assert_eq!(sink.find("session.complication.triggered").len(), 1);
        assert_eq!(sink.find("engine.session.released").len(), 1);
    }
}
