//! Step and session scoring.

/// Session-level report.
pub mod final_report;
/// Per-step scores and feedback.
pub mod step_scoring;

pub use final_report::{
    CertificationLevel, EfficiencyRating, FinalAssessment, FinalFeedback, LearningPlan,
    PerformanceMetrics, PerformanceTrends, ScoreSummary, StepScoreEntry, TrendDirection,
};
pub use step_scoring::{FeedbackLevel, StepAssessment, StepFeedback};

use crate::{
    catalog::StepTemplate,
    config::ScoringConfig,
    scenario_builder::PlannedStep,
    session::{ActionKind, ActionRecord, SimulationSession},
};

/// Scores steps and sessions with a fixed set of constants.
#[derive(Debug, Clone, Default)]
pub struct AssessmentEngine {
    config: ScoringConfig,
}

impl AssessmentEngine {
    /// Creates engine.
    #[must_use]
    pub const fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Active constants.
    #[must_use]
    pub const fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Accuracy of a technical action against `step`; `None` for actions
    /// scored elsewhere.
    #[must_use]
    pub fn action_accuracy(step: &StepTemplate, kind: &ActionKind) -> Option<f64> {
        match kind {
            ActionKind::InstrumentSelection { instrument } => {
                Some(if step.allows_instrument(instrument) { 1.0 } else { 0.0 })
            }
            ActionKind::StructureInteraction {
                structure,
                instrument,
                precision,
            } => {
                let tool_ok = instrument
                    .as_deref()
                    .map_or(true, |tool| step.allows_instrument(tool));
                if step.is_relevant(structure) && tool_ok {
                    Some(precision.clamp(0.0, 1.0))
                } else {
                    Some(0.0)
                }
            }
            ActionKind::ComplicationManagement { .. }
            | ActionKind::Timeout
            | ActionKind::HelpRequest => None,
        }
    }

    /// Scores one step from its actions and elapsed time.
    #[must_use]
    pub fn score_step(
        &self,
        step: &PlannedStep,
        actions: &[ActionRecord],
        elapsed_secs: f64,
    ) -> StepAssessment {
        step_scoring::score(&self.config, step, actions, elapsed_secs)
    }

    /// Aggregates a session's step assessments. Pure; repeated calls agree.
    #[must_use]
    pub fn score_final(&self, session: &SimulationSession) -> FinalAssessment {
        final_report::summarise(&self.config, session)
    }
}
