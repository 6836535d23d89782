use std::{collections::VecDeque, fmt};

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    assessment::{AssessmentEngine, FinalAssessment, StepAssessment},
    catalog::Severity,
    complication_scheduler::ScheduledComplication,
    config::{ScoringConfig, SignalConfig},
    errors::SimulationError,
    helper::SimulationTelemetry,
    scenario_builder::SimulationPlan,
    signal_model::{AppliedImpact, SignalModel, VitalsReading},
};

const VITALS_HISTORY_CAP: usize = 512;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Generated, not yet started.
    Created,
    /// Steps are being worked.
    InProgress,
    /// A complication fired and waits for a response.
    AwaitingComplication,
    /// Every step has been passed.
    Complete,
}

impl SessionStatus {
    /// Wire label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::AwaitingComplication => "awaiting_complication",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a trainee did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Picked up an instrument.
    InstrumentSelection {
        /// Instrument name.
        instrument: String,
    },
    /// Worked on an anatomical structure.
    StructureInteraction {
        /// Structure name.
        structure: String,
        /// Instrument used, if reported.
        #[serde(default)]
        instrument: Option<String>,
        /// Self-reported precision in `[0, 1]`.
        #[serde(default = "full_precision")]
        precision: f64,
    },
    /// Chose a complication management option.
    ComplicationManagement {
        /// Chosen option.
        option: String,
    },
    /// Let a complication deadline pass.
    Timeout,
    /// Asked for help.
    HelpRequest,
}

impl ActionKind {
    /// Wire label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::InstrumentSelection { .. } => "instrument_selection",
            Self::StructureInteraction { .. } => "structure_interaction",
            Self::ComplicationManagement { .. } => "complication_management",
            Self::Timeout => "timeout",
            Self::HelpRequest => "help_request",
        }
    }
}

const fn full_precision() -> f64 {
    1.0
}

/// Caller-supplied action before the session stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInput {
    /// Parsed action.
    pub kind: ActionKind,
    /// Raw payload kept for audit.
    pub payload: Value,
}

impl ActionInput {
    /// Input without payload.
    #[must_use]
    pub const fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            payload: Value::Null,
        }
    }

    /// Attaches the raw payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Recorded action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    /// Record id.
    pub id: Uuid,
    /// Action.
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Raw payload.
    pub payload: Value,
    /// Step the action belongs to.
    pub step_index: usize,
    /// Server timestamp.
    pub recorded_at: DateTime<Utc>,
    /// Accuracy in `[0, 1]`, absent for help requests and timeouts.
    pub accuracy: Option<f64>,
}

/// Complication waiting for a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingComplication {
    /// Step the complication is attached to.
    pub trigger_step: usize,
    /// Type tag.
    pub kind: String,
    /// Narrative.
    pub description: String,
    /// Severity.
    pub severity: Severity,
    /// Options offered to the trainee.
    pub management_options: Vec<String>,
    /// Seconds allowed to respond.
    pub time_limit_secs: f64,
}

impl From<&ScheduledComplication> for PendingComplication {
    fn from(scheduled: &ScheduledComplication) -> Self {
        let template = &scheduled.template;
        Self {
            trigger_step: scheduled.trigger_step,
            kind: template.kind.clone(),
            description: template.description.clone(),
            severity: template.severity,
            management_options: template.management_options.clone(),
            time_limit_secs: template.response_time_limit_secs,
        }
    }
}

/// Trainee response to a pending complication.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComplicationResponse {
    /// Chosen option; `None` means no decision was made.
    #[serde(default)]
    pub choice: Option<String>,
    /// Seconds between the trigger and the response.
    #[serde(default)]
    pub response_secs: f64,
}

/// How a complication was handled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplicationResolution {
    /// Type tag.
    pub kind: String,
    /// Step the complication fired at.
    pub trigger_step: usize,
    /// Chosen option, if any.
    pub choice: Option<String>,
    /// Whether the deadline passed.
    pub timed_out: bool,
    /// Management accuracy; zero on timeout.
    pub accuracy: f64,
    /// Response latency.
    pub response_secs: f64,
}

/// Result of `advance`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Pointer moved to `step`.
    Advanced {
        /// New current step.
        step: usize,
    },
    /// A complication must be resolved before entering its step.
    ComplicationTriggered {
        /// The complication.
        complication: PendingComplication,
    },
    /// Every step has been passed.
    Completed,
}

/// Result of `resolve_complication`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolutionOutcome {
    /// Resolution summary.
    pub resolution: ComplicationResolution,
    /// Action recorded for the response.
    pub action: ActionRecord,
    /// Pointer movement after resolution.
    pub next: AdvanceOutcome,
}

/// Session data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationSession {
    /// Session id, equal to the plan id.
    pub id: Uuid,
    /// Plan being executed.
    pub plan: SimulationPlan,
    /// 1-based step pointer; `step_count + 1` once complete.
    pub current_step: usize,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Actions in recording order.
    pub actions: Vec<ActionRecord>,
    /// Elapsed seconds per completed step.
    pub step_times: IndexMap<usize, f64>,
    /// Step assessments in completion order.
    pub assessments: Vec<StepAssessment>,
    /// Complication resolutions in order.
    pub resolutions: Vec<ComplicationResolution>,
    /// Impacts applied to the vitals.
    pub impacts: Vec<AppliedImpact>,
    /// Vitals readings, oldest first.
    pub vitals_history: VecDeque<VitalsReading>,
    /// Trigger steps whose complication has fired.
    pub fired: IndexSet<usize>,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
}

impl SimulationSession {
    /// Fresh session over `plan`.
    #[must_use]
    pub fn new(plan: SimulationPlan) -> Self {
        Self {
            id: plan.id,
            plan,
            current_step: 1,
            status: SessionStatus::Created,
            actions: Vec::new(),
            step_times: IndexMap::new(),
            assessments: Vec::new(),
            resolutions: Vec::new(),
            impacts: Vec::new(),
            vitals_history: VecDeque::with_capacity(VITALS_HISTORY_CAP),
            fired: IndexSet::new(),
            started_at: None,
        }
    }

    /// Actions tagged with `step`.
    pub fn actions_for(&self, step: usize) -> impl Iterator<Item = &ActionRecord> {
        self.actions
            .iter()
            .filter(move |record| record.step_index == step)
    }

    /// Assessment for `step`, if completed.
    #[must_use]
    pub fn assessment_for(&self, step: usize) -> Option<&StepAssessment> {
        self.assessments
            .iter()
            .find(|assessment| assessment.step_index == step)
    }
}

/// Drives one session through its lifecycle.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    session: SimulationSession,
    signal: SignalModel,
    assessor: AssessmentEngine,
    telemetry: Option<SimulationTelemetry>,
    final_assessment: Option<FinalAssessment>,
}

impl SessionStateMachine {
    /// Creates a machine in `created` state.
    #[must_use]
    pub fn new(plan: SimulationPlan, scoring: ScoringConfig, signal: SignalConfig) -> Self {
        let signal = SignalModel::new(signal, plan.signal_seed);
        Self {
            session: SimulationSession::new(plan),
            signal,
            assessor: AssessmentEngine::new(scoring),
            telemetry: None,
            final_assessment: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<SimulationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.session.id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.session.status
    }

    /// Current step pointer.
    #[must_use]
    pub const fn current_step(&self) -> usize {
        self.session.current_step
    }

    /// Read access to the session data.
    #[must_use]
    pub const fn session(&self) -> &SimulationSession {
        &self.session
    }

    /// Seconds since the session started, by wall clock.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.session.started_at.map_or(0.0, |started| {
            (Utc::now() - started)
                .to_std()
                .map_or(0.0, |elapsed| elapsed.as_secs_f64())
        })
    }

    /// Moves `created` to `in_progress` and records the first vitals reading.
    pub fn start(&mut self) -> Result<(), SimulationError> {
        match self.session.status {
            SessionStatus::Complete => Err(SimulationError::SessionClosed(self.session.id)),
            SessionStatus::Created => {
                self.session.status = SessionStatus::InProgress;
                self.session.started_at = Some(Utc::now());
                self.vitals_at(0.0);
                self.emit(
                    "session.started",
                    json!({ "procedure": self.session.plan.procedure.id }),
                );
                Ok(())
            }
            SessionStatus::InProgress | SessionStatus::AwaitingComplication => Ok(()),
        }
    }

    /// Records an action against the current step.
    pub fn record_action(&mut self, input: ActionInput) -> Result<ActionRecord, SimulationError> {
        self.ensure_open()?;
        self.start()?;
        let step_index = self.session.current_step;
        let accuracy = self.accuracy_for(step_index, &input.kind);
        Ok(self.push_action(input, step_index, accuracy))
    }

    /// Scores the current step from its recorded actions.
    pub fn complete_step(&mut self, elapsed_secs: f64) -> Result<StepAssessment, SimulationError> {
        if matches!(
            self.session.status,
            SessionStatus::Complete | SessionStatus::AwaitingComplication
        ) {
            return Err(SimulationError::NoActiveStep {
                status: self.session.status,
            });
        }
        self.start()?;
        let index = self.session.current_step;
        if self.session.assessment_for(index).is_some() {
            return Err(SimulationError::StepAlreadyAssessed(index));
        }
        let step = self
            .session
            .plan
            .step(index)
            .ok_or(SimulationError::NoActiveStep {
                status: self.session.status,
            })?;
        let actions: Vec<ActionRecord> = self.session.actions_for(index).cloned().collect();
        let elapsed_secs = elapsed_secs.max(0.0);
        let assessment = self.assessor.score_step(step, &actions, elapsed_secs);
        self.session.step_times.insert(index, elapsed_secs);
        self.session.assessments.push(assessment.clone());
        self.emit(
            "session.step.completed",
            json!({
                "step": index,
                "overall_score": assessment.overall_score,
                "time_taken_secs": elapsed_secs,
            }),
        );
        let now = self.elapsed_secs();
        self.vitals_at(now);
        Ok(assessment)
    }

    /// Moves to the next step, or fires the complication attached to it.
    pub fn advance(&mut self) -> Result<AdvanceOutcome, SimulationError> {
        self.ensure_open()?;
        self.start()?;
        if let Some(pending) = self.pending_complication() {
            return Ok(AdvanceOutcome::ComplicationTriggered {
                complication: pending,
            });
        }
        let next = self.session.current_step + 1;
        if self.session.plan.complication_at(next).is_some() && !self.session.fired.contains(&next)
        {
            self.session.status = SessionStatus::AwaitingComplication;
            if let Some(pending) = self.pending_complication() {
                self.emit(
                    "session.complication.triggered",
                    json!({
                        "kind": pending.kind,
                        "trigger_step": next,
                        "time_limit_secs": pending.time_limit_secs,
                    }),
                );
                return Ok(AdvanceOutcome::ComplicationTriggered {
                    complication: pending,
                });
            }
        }
        Ok(self.move_to(next))
    }

    /// Complication currently awaiting a response.
    #[must_use]
    pub fn pending_complication(&self) -> Option<PendingComplication> {
        if self.session.status != SessionStatus::AwaitingComplication {
            return None;
        }
        self.session
            .plan
            .complication_at(self.session.current_step + 1)
            .map(PendingComplication::from)
    }

    /// Resolves the pending complication and enters its step.
    ///
    /// A missing choice or a response past the limit counts as a timeout.
    /// The complication's full vitals impact is applied either way.
    pub fn resolve_complication(
        &mut self,
        response: ComplicationResponse,
    ) -> Result<ResolutionOutcome, SimulationError> {
        self.ensure_open()?;
        if self.session.status != SessionStatus::AwaitingComplication {
            return Err(SimulationError::NoPendingComplication {
                status: self.session.status,
            });
        }
        let trigger_step = self.session.current_step + 1;
        let template = self
            .session
            .plan
            .complication_at(trigger_step)
            .map(|scheduled| scheduled.template.clone())
            .ok_or(SimulationError::NoPendingComplication {
                status: self.session.status,
            })?;

        let timed_out = response.choice.is_none()
            || response.response_secs > template.response_time_limit_secs;
        let accuracy = match (&response.choice, timed_out) {
            (Some(choice), false) => template.option_accuracy(choice),
            _ => 0.0,
        };
        let payload = json!({
            "complication": template.kind,
            "choice": response.choice,
            "response_secs": response.response_secs,
            "time_limit_secs": template.response_time_limit_secs,
        });
        let action = match (&response.choice, timed_out) {
            (Some(choice), false) => self.push_action(
                ActionInput::new(ActionKind::ComplicationManagement {
                    option: choice.clone(),
                })
                .with_payload(payload),
                trigger_step,
                Some(accuracy),
            ),
            _ => self.push_action(
                ActionInput::new(ActionKind::Timeout).with_payload(payload),
                trigger_step,
                None,
            ),
        };

        let applied_at_secs = self.elapsed_secs();
        self.session.impacts.push(AppliedImpact {
            kind: template.kind.clone(),
            delta: template.vitals_impact,
            applied_at_secs,
        });
        self.session.fired.insert(trigger_step);
        let resolution = ComplicationResolution {
            kind: template.kind.clone(),
            trigger_step,
            choice: response.choice,
            timed_out,
            accuracy,
            response_secs: response.response_secs,
        };
        self.session.resolutions.push(resolution.clone());
        self.emit(
            "session.complication.resolved",
            json!({
                "kind": resolution.kind,
                "trigger_step": trigger_step,
                "timed_out": timed_out,
                "accuracy": accuracy,
            }),
        );
        self.vitals_at(applied_at_secs);
        let next = self.move_to(trigger_step);
        Ok(ResolutionOutcome {
            resolution,
            action,
            next,
        })
    }

    /// Vitals now, by wall clock since start.
    pub fn current_vitals(&mut self) -> VitalsReading {
        let elapsed = self.elapsed_secs();
        self.vitals_at(elapsed)
    }

    /// Vitals at a caller-supplied session time.
    pub fn vitals_at(&mut self, elapsed_secs: f64) -> VitalsReading {
        let reading = self.signal.sample(
            &self.session.plan.subject.baseline,
            &self.session.impacts,
            elapsed_secs,
        );
        let history = &mut self.session.vitals_history;
        if history.len() >= VITALS_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(reading);
        reading
    }

    /// Final assessment of a complete session; repeated calls return the same value.
    pub fn finalize(&mut self) -> Result<FinalAssessment, SimulationError> {
        if self.session.status != SessionStatus::Complete {
            return Err(SimulationError::SessionIncomplete {
                status: self.session.status,
            });
        }
        if let Some(done) = &self.final_assessment {
            return Ok(done.clone());
        }
        let assessment = self.assessor.score_final(&self.session);
        self.emit(
            "session.finalized",
            json!({
                "overall_average": assessment.scores.overall_average,
                "certification_level": assessment.certification_level.label(),
            }),
        );
        self.final_assessment = Some(assessment.clone());
        Ok(assessment)
    }

    fn ensure_open(&self) -> Result<(), SimulationError> {
        if self.session.status == SessionStatus::Complete {
            return Err(SimulationError::SessionClosed(self.session.id));
        }
        Ok(())
    }

    fn move_to(&mut self, step: usize) -> AdvanceOutcome {
        self.session.current_step = step;
        if step > self.session.plan.step_count() {
            self.session.status = SessionStatus::Complete;
            self.emit(
                "session.completed",
                json!({ "steps_assessed": self.session.assessments.len() }),
            );
            AdvanceOutcome::Completed
        } else {
            self.session.status = SessionStatus::InProgress;
            AdvanceOutcome::Advanced { step }
        }
    }

    fn accuracy_for(&self, step_index: usize, kind: &ActionKind) -> Option<f64> {
        if let ActionKind::ComplicationManagement { option } = kind {
            // While awaiting, the pending complication belongs to the next step.
            let trigger = if self.session.status == SessionStatus::AwaitingComplication {
                step_index + 1
            } else {
                step_index
            };
            let accuracy = self
                .session
                .plan
                .complication_at(trigger)
                .map_or(0.0, |scheduled| scheduled.template.option_accuracy(option));
            return Some(accuracy);
        }
        self.session
            .plan
            .step(step_index)
            .and_then(|step| AssessmentEngine::action_accuracy(&step.template, kind))
    }

    fn push_action(
        &mut self,
        input: ActionInput,
        step_index: usize,
        accuracy: Option<f64>,
    ) -> ActionRecord {
        let record = ActionRecord {
            id: Uuid::new_v4(),
            kind: input.kind,
            payload: input.payload,
            step_index,
            recorded_at: Utc::now(),
            accuracy,
        };
        self.session.actions.push(record.clone());
        record
    }

    fn emit(&self, message: &str, mut metadata: Value) {
        if let Some(tel) = &self.telemetry {
            if let Value::Object(fields) = &mut metadata {
                fields.insert("simulation_id".into(), json!(self.session.id.to_string()));
            }
            let _ = tel.info(message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{Difficulty, ProcedureCatalog},
        config::ComplicationDensity,
        scenario_builder::{ScenarioBuilder, ScenarioRequest},
        signal_model::VitalsDelta,
    };
    use shared_logging::MemoryLogger;
    use std::sync::Arc;

    fn plan(procedure: &str, difficulty: Difficulty, seed: u64) -> SimulationPlan {
        ScenarioBuilder::new(
            Arc::new(ProcedureCatalog::builtin().unwrap()),
            ComplicationDensity::default(),
        )
        .build(&ScenarioRequest::new(procedure, difficulty).with_seed(seed))
        .unwrap()
    }

    fn silent() -> SignalConfig {
        SignalConfig {
            half_life_secs: 300.0,
            noise_scale: 0.0,
        }
    }

    fn machine(plan: SimulationPlan) -> SessionStateMachine {
        SessionStateMachine::new(plan, ScoringConfig::default(), silent())
    }

    fn drive_to_completion(machine: &mut SessionStateMachine) -> Vec<usize> {
        let mut visited = vec![machine.current_step()];
        loop {
            machine.complete_step(60.0).unwrap();
            match machine.advance().unwrap() {
                AdvanceOutcome::Advanced { step } => visited.push(step),
                AdvanceOutcome::Completed => break,
                AdvanceOutcome::ComplicationTriggered { complication } => {
                    let outcome = machine
                        .resolve_complication(ComplicationResponse {
                            choice: complication.management_options.first().cloned(),
                            response_secs: 5.0,
                        })
                        .unwrap();
                    match outcome.next {
                        AdvanceOutcome::Advanced { step } => visited.push(step),
                        other => panic!("unexpected {other:?}"),
                    }
                }
            }
        }
        visited
    }

    #[test]
    fn steps_are_visited_once_in_order() {
        for (procedure, difficulty) in [
            ("laparoscopic_cholecystectomy", Difficulty::Expert),
            ("appendectomy", Difficulty::Advanced),
            ("knee_arthroscopy", Difficulty::Beginner),
        ] {
            for seed in 0..10 {
                let plan = plan(procedure, difficulty, seed);
                let count = plan.step_count();
                let scheduled = plan.complications.len();
                let mut machine = machine(plan);
                let visited = drive_to_completion(&mut machine);
                assert_eq!(visited, (1..=count).collect::<Vec<_>>());
                assert_eq!(machine.status(), SessionStatus::Complete);
                assert_eq!(machine.current_step(), count + 1);
                assert_eq!(machine.session().resolutions.len(), scheduled);
                assert_eq!(machine.session().fired.len(), scheduled);
            }
        }
    }

    #[test]
    fn operations_auto_start_and_closed_sessions_reject_input() {
        let mut machine = machine(plan("knee_arthroscopy", Difficulty::Beginner, 1));
        assert_eq!(machine.status(), SessionStatus::Created);
        machine.record_action(ActionInput::new(ActionKind::HelpRequest)).unwrap();
        assert_eq!(machine.status(), SessionStatus::InProgress);
        assert!(machine.session().started_at.is_some());
        drive_to_completion(&mut machine);
        let id = machine.id();
        assert_eq!(
            machine
                .record_action(ActionInput::new(ActionKind::HelpRequest))
                .unwrap_err(),
            SimulationError::SessionClosed(id)
        );
        assert_eq!(machine.advance().unwrap_err(), SimulationError::SessionClosed(id));
        assert_eq!(
            machine.complete_step(1.0).unwrap_err(),
            SimulationError::NoActiveStep {
                status: SessionStatus::Complete
            }
        );
    }

    #[test]
    fn second_completion_of_a_step_is_rejected() {
        let mut machine = machine(plan("appendectomy", Difficulty::Beginner, 2));
        machine.complete_step(30.0).unwrap();
        assert_eq!(
            machine.complete_step(30.0).unwrap_err(),
            SimulationError::StepAlreadyAssessed(1)
        );
        assert_eq!(machine.session().assessments.len(), 1);
    }

    #[test]
    fn accuracy_is_computed_against_the_current_step() {
        let mut machine = machine(plan("laparoscopic_cholecystectomy", Difficulty::Beginner, 3));
        for _ in 1..4 {
            machine.advance().unwrap();
        }
        assert_eq!(machine.current_step(), 4);
        let good = machine
            .record_action(ActionInput::new(ActionKind::StructureInteraction {
                structure: "Cystic Duct".into(),
                instrument: Some("dissector".into()),
                precision: 0.9,
            }))
            .unwrap();
        assert_eq!(good.step_index, 4);
        assert_eq!(good.accuracy, Some(0.9));
        let wrong_tool = machine
            .record_action(ActionInput::new(ActionKind::InstrumentSelection {
                instrument: "bone saw".into(),
            }))
            .unwrap();
        assert_eq!(wrong_tool.accuracy, Some(0.0));
        let help = machine
            .record_action(ActionInput::new(ActionKind::HelpRequest))
            .unwrap();
        assert_eq!(help.accuracy, None);
    }

    #[test]
    fn complication_blocks_advance_until_resolved() {
        let plan = plan("appendectomy", Difficulty::Intermediate, 8);
        let (&trigger, scheduled) = plan.complications.first().unwrap();
        let preferred = scheduled.template.preferred_option.clone();
        let mut machine = machine(plan);
        while machine.current_step() + 1 < trigger {
            machine.advance().unwrap();
        }
        let first = machine.advance().unwrap();
        assert_eq!(machine.status(), SessionStatus::AwaitingComplication);
        assert_eq!(machine.current_step(), trigger - 1);
        assert_eq!(machine.advance().unwrap(), first);
        assert!(matches!(
            machine.complete_step(10.0).unwrap_err(),
            SimulationError::NoActiveStep { .. }
        ));
        let outcome = machine
            .resolve_complication(ComplicationResponse {
                choice: Some(preferred),
                response_secs: 3.0,
            })
            .unwrap();
        assert!(!outcome.resolution.timed_out);
        assert_eq!(outcome.resolution.accuracy, 1.0);
        assert_eq!(outcome.action.step_index, trigger);
        assert_eq!(outcome.next, AdvanceOutcome::Advanced { step: trigger });
        assert_eq!(
            machine
                .resolve_complication(ComplicationResponse::default())
                .unwrap_err(),
            SimulationError::NoPendingComplication {
                status: SessionStatus::InProgress
            }
        );
    }

    #[test]
    fn timeout_applies_full_impact_exactly_once() {
        let plan = plan("laparoscopic_cholecystectomy", Difficulty::Intermediate, 21);
        let (&trigger, scheduled) = plan.complications.first().unwrap();
        let impact = scheduled.template.vitals_impact;
        let limit = scheduled.template.response_time_limit_secs;
        let baseline = plan.subject.baseline;
        let mut machine = machine(plan);
        while machine.status() != SessionStatus::AwaitingComplication {
            machine.advance().unwrap();
        }
        assert_eq!(machine.current_step(), trigger - 1);
        let outcome = machine
            .resolve_complication(ComplicationResponse {
                choice: None,
                response_secs: limit + 30.0,
            })
            .unwrap();
        assert!(outcome.resolution.timed_out);
        assert_eq!(outcome.action.kind, ActionKind::Timeout);
        assert_eq!(outcome.action.payload["complication"], scheduled_kind(&machine));

        let session = machine.session();
        assert_eq!(session.impacts.len(), 1);
        assert_eq!(session.impacts[0].delta, impact);
        let applied_at = session.impacts[0].applied_at_secs;
        let reading = machine.vitals_at(applied_at);
        assert_eq!(reading.vitals, baseline.shifted(&impact).rounded());

        while machine.status() != SessionStatus::Complete {
            if machine.advance().unwrap() == AdvanceOutcome::Completed {
                break;
            }
            assert_ne!(machine.status(), SessionStatus::AwaitingComplication);
        }
        assert_eq!(machine.session().impacts.len(), 1);
    }

    fn scheduled_kind(machine: &SessionStateMachine) -> String {
        machine.session().resolutions[0].kind.clone()
    }

    #[test]
    fn late_choice_counts_as_timeout() {
        let plan = plan("knee_arthroscopy", Difficulty::Intermediate, 5);
        let limit = plan.complications[0].template.response_time_limit_secs;
        let option = plan.complications[0].template.preferred_option.clone();
        let mut machine = machine(plan);
        while machine.status() != SessionStatus::AwaitingComplication {
            machine.advance().unwrap();
        }
        let outcome = machine
            .resolve_complication(ComplicationResponse {
                choice: Some(option),
                response_secs: limit + 0.5,
            })
            .unwrap();
        assert!(outcome.resolution.timed_out);
        assert_eq!(outcome.resolution.accuracy, 0.0);
    }

    #[test]
    fn vitals_stay_within_bounds_under_stacked_impacts() {
        let mut plan = plan("laparoscopic_cholecystectomy", Difficulty::Expert, 13);
        for scheduled in plan.complications.values_mut() {
            scheduled.template.vitals_impact = VitalsDelta {
                heart_rate: 150.0,
                systolic: -150.0,
                diastolic: -90.0,
                respiratory_rate: 30.0,
                temperature: 8.0,
                oxygen_saturation: -40.0,
            };
        }
        let mut machine =
            SessionStateMachine::new(plan, ScoringConfig::default(), SignalConfig::default());
        drive_to_completion(&mut machine);
        for tick in 0..100 {
            assert!(machine.vitals_at(f64::from(tick) * 10.0).vitals.within_bounds());
        }
        assert!(machine.current_vitals().vitals.within_bounds());
        assert!(machine
            .session()
            .vitals_history
            .iter()
            .all(|reading| reading.vitals.within_bounds()));
    }

    #[test]
    fn vitals_history_keeps_the_latest_readings() {
        let mut machine = machine(plan("appendectomy", Difficulty::Beginner, 6));
        for tick in 0..600_u32 {
            machine.vitals_at(f64::from(tick));
        }
        let history = &machine.session().vitals_history;
        assert_eq!(history.len(), VITALS_HISTORY_CAP);
        assert_eq!(history.front().unwrap().elapsed_secs, 88.0);
        assert_eq!(history.back().unwrap().elapsed_secs, 599.0);
    }

    #[test]
    fn elapsed_clock_is_zero_until_started() {
        let mut machine = machine(plan("appendectomy", Difficulty::Beginner, 2));
        assert_eq!(machine.elapsed_secs(), 0.0);
        machine.start().unwrap();
        let elapsed = machine.elapsed_secs();
        assert!((0.0..60.0).contains(&elapsed), "{elapsed}");
    }

    #[test]
    fn management_recorded_while_awaiting_scores_against_pending_complication() {
        let plan = plan("appendectomy", Difficulty::Intermediate, 8);
        let preferred = plan
            .complications
            .first()
            .map(|(_, scheduled)| scheduled.template.preferred_option.clone())
            .unwrap();
        let mut machine = machine(plan);
        while machine.status() != SessionStatus::AwaitingComplication {
            machine.advance().unwrap();
        }
        let current = machine.current_step();
        let record = machine
            .record_action(ActionInput::new(ActionKind::ComplicationManagement {
                option: preferred,
            }))
            .unwrap();
        assert_eq!(record.step_index, current);
        assert_eq!(record.accuracy, Some(1.0));
        let unlisted = machine
            .record_action(ActionInput::new(ActionKind::ComplicationManagement {
                option: "wait and see".into(),
            }))
            .unwrap();
        assert_eq!(unlisted.accuracy, Some(0.0));
    }

    #[test]
    fn finalize_requires_completion_and_is_idempotent() {
        let sink = Arc::new(MemoryLogger::new(64));
        let telemetry = SimulationTelemetry::builder("session")
            .sink(sink.clone())
            .build()
            .unwrap();
        let mut machine =
            machine(plan("appendectomy", Difficulty::Advanced, 4)).with_telemetry(Some(telemetry));
        assert_eq!(
            machine.finalize().unwrap_err(),
            SimulationError::SessionIncomplete {
                status: SessionStatus::Created
            }
        );
        drive_to_completion(&mut machine);
        let first = machine.finalize().unwrap();
        let second = machine.finalize().unwrap();
        assert_eq!(first, second);
        assert_eq!(sink.find("session.finalized").len(), 1);
        assert_eq!(sink.find("session.completed").len(), 1);
        assert_eq!(sink.find("session.complication.resolved").len(), 2);
    }
}
