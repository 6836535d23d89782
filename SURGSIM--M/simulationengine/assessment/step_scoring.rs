use serde::{Deserialize, Serialize};

use crate::{
    config::ScoringConfig,
    scenario_builder::PlannedStep,
    session::{ActionKind, ActionRecord},
};

/// Qualitative band of a step's overall score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLevel {
    /// 90 and above.
    Excellent,
    /// 70 to 89.
    Good,
    /// 40 to 69.
    NeedsImprovement,
    /// Below 40.
    Poor,
}

impl FeedbackLevel {
    /// Band for an overall score.
    #[must_use]
    pub const fn from_score(score: u8) -> Self {
        if score >= 90 {
            Self::Excellent
        } else if score >= 70 {
            Self::Good
        } else if score >= 40 {
            Self::NeedsImprovement
        } else {
            Self::Poor
        }
    }
}

/// Feedback attached to a step assessment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFeedback {
    /// Band.
    pub level: FeedbackLevel,
    /// One-line summary naming the step and score.
    pub summary: String,
    /// Comment on technical execution.
    pub technical: String,
    /// Comment on decisions and teamwork.
    pub non_technical: String,
    /// Concrete advice, most specific first.
    pub recommendations: Vec<String>,
}

/// Scores for one completed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepAssessment {
    /// 1-based step index.
    pub step_index: usize,
    /// Step title.
    pub step_title: String,
    /// Technical score, 0-100.
    pub technical_score: f64,
    /// Non-technical score, 0-100.
    pub non_technical_score: f64,
    /// Time management score, 0-100.
    pub time_score: f64,
    /// Weighted overall score.
    pub overall_score: u8,
    /// Seconds spent on the step.
    pub time_taken_secs: f64,
    /// Feedback.
    pub feedback: StepFeedback,
}

pub(super) fn score(
    config: &ScoringConfig,
    step: &PlannedStep,
    actions: &[ActionRecord],
    elapsed_secs: f64,
) -> StepAssessment {
    let technical = technical_score(actions);
    let tally = Tally::of(actions);
    let non_technical = (100.0
        - config.help_penalty * f64::from(tally.helps)
        - config.timeout_penalty * f64::from(tally.timeouts)
        - config.decision_penalty * tally.missed_management)
        .max(0.0);
    let budget = step.budget_secs();
    let allowed = budget * (1.0 + config.time_grace_ratio);
    let overran = elapsed_secs > allowed;
    let time = if !overran || budget <= 0.0 {
        100.0
    } else {
        (100.0 - config.overrun_penalty * ((elapsed_secs - allowed) / budget)).max(0.0)
    };
    let weighted = config.technical_weight * technical
        + config.non_technical_weight * non_technical
        + config.time_weight * time;
    let overall = to_score(weighted);

    let title = &step.template.title;
    let level = FeedbackLevel::from_score(overall);
    let mut recommendations = untouched_structures(config, step, actions);
    if tally.helps > 0 {
        recommendations
            .push("Review the step plan beforehand to reduce reliance on assistance".to_string());
    }
    if tally.timeouts > 0 {
        recommendations.push(
            "Rehearse complication protocols so a decision is made within the time limit"
                .to_string(),
        );
    }
    if tally.missed_management > 0.0 {
        recommendations
            .push("Review best-practice management of intraoperative complications".to_string());
    }
    if overran {
        recommendations.push("Improve efficiency to stay within the step time budget".to_string());
    }

    StepAssessment {
        step_index: step.index(),
        step_title: title.clone(),
        technical_score: round1(technical),
        non_technical_score: round1(non_technical),
        time_score: round1(time),
        overall_score: overall,
        time_taken_secs: elapsed_secs,
        feedback: StepFeedback {
            level,
            summary: summary(level, title, overall),
            technical: technical_comment(technical).to_string(),
            non_technical: non_technical_comment(non_technical).to_string(),
            recommendations,
        },
    }
}

#[derive(Debug, Default)]
struct Tally {
    helps: u32,
    timeouts: u32,
    missed_management: f64,
}

impl Tally {
    fn of(actions: &[ActionRecord]) -> Self {
        actions.iter().fold(Self::default(), |mut tally, action| {
            match action.kind {
                ActionKind::HelpRequest => tally.helps += 1,
                ActionKind::Timeout => tally.timeouts += 1,
                ActionKind::ComplicationManagement { .. } => {
                    tally.missed_management += 1.0 - action.accuracy.unwrap_or(0.0);
                }
                ActionKind::InstrumentSelection { .. }
                | ActionKind::StructureInteraction { .. } => {}
            }
            tally
        })
    }
}

/// Mean accuracy of structure work. A wrong instrument pick adds a zero entry;
/// a whitelisted pick adds nothing.
fn technical_score(actions: &[ActionRecord]) -> f64 {
    let (sum, count) = actions
        .iter()
        .filter_map(|action| {
            let accuracy = action.accuracy.unwrap_or(0.0);
            match action.kind {
                ActionKind::StructureInteraction { .. } => Some(accuracy),
                ActionKind::InstrumentSelection { .. } if accuracy <= 0.0 => Some(0.0),
                _ => None,
            }
        })
        .fold((0.0, 0_u32), |(sum, count), accuracy| (sum + accuracy, count + 1));
    if count == 0 {
        return 0.0;
    }
    100.0 * sum / f64::from(count)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_score(weighted: f64) -> u8 {
    weighted.round().clamp(0.0, 100.0) as u8
}

fn untouched_structures(
    config: &ScoringConfig,
    step: &PlannedStep,
    actions: &[ActionRecord],
) -> Vec<String> {
    step.template
        .relevant_structures
        .iter()
        .filter(|structure| {
            !actions.iter().any(|action| match &action.kind {
                ActionKind::StructureInteraction { structure: touched, .. } => {
                    touched.trim().eq_ignore_ascii_case(structure)
                        && action.accuracy.unwrap_or(0.0) >= config.structure_accuracy_threshold
                }
                _ => false,
            })
        })
        .map(|structure| step.template.advice_for(structure))
        .collect()
}

fn summary(level: FeedbackLevel, title: &str, score: u8) -> String {
    match level {
        FeedbackLevel::Excellent => format!("Outstanding execution of {title} ({score}/100)"),
        FeedbackLevel::Good => {
            format!("Solid work on {title} with minor areas to refine ({score}/100)")
        }
        FeedbackLevel::NeedsImprovement => {
            format!("{title} needs refinement in key areas ({score}/100)")
        }
        FeedbackLevel::Poor => {
            format!("{title} requires significant additional practice ({score}/100)")
        }
    }
}

fn technical_comment(score: f64) -> &'static str {
    if score >= 85.0 {
        "Excellent technical execution with proper instrument handling and surgical technique."
    } else if score >= 70.0 {
        "Good technical skills demonstrated with room for refinement in precision."
    } else if score >= 55.0 {
        "Technical skills need improvement. Focus on instrument control and anatomical identification."
    } else {
        "Significant technical deficiencies identified. Additional practice and supervision recommended."
    }
}

fn non_technical_comment(score: f64) -> &'static str {
    if score >= 85.0 {
        "Outstanding communication and decision-making throughout the step."
    } else if score >= 70.0 {
        "Good team interaction and appropriate clinical decisions made."
    } else if score >= 55.0 {
        "Communication and decision-making skills need development."
    } else {
        "Poor team communication and questionable clinical decisions observed."
    }
}

pub(super) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
