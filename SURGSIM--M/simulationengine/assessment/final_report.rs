use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{catalog::Difficulty, config::ScoringConfig, session::SimulationSession};

use super::step_scoring::{round1, StepAssessment};

const TREND_MARGIN: f64 = 5.0;
const FOCUS_THRESHOLD: f64 = 70.0;
const CERTIFICATION_THRESHOLD: f64 = 75.0;
const NEXT_DIFFICULTY_THRESHOLD: f64 = 85.0;

/// Certification tier derived from the rounded overall average.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum CertificationLevel {
    /// 0 to 50.
    Novice,
    /// 51 to 70.
    Beginner,
    /// 71 to 85.
    Competent,
    /// 86 to 95.
    Proficient,
    /// 96 to 100.
    Expert,
}

impl CertificationLevel {
    /// Tier for an overall average; the average is rounded first.
    #[must_use]
    pub fn from_average(average: f64) -> Self {
        let rounded = average.round();
        if rounded <= 50.0 {
            Self::Novice
        } else if rounded <= 70.0 {
            Self::Beginner
        } else if rounded <= 85.0 {
            Self::Competent
        } else if rounded <= 95.0 {
            Self::Proficient
        } else {
            Self::Expert
        }
    }

    /// Display label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Novice => "Novice",
            Self::Beginner => "Beginner",
            Self::Competent => "Competent",
            Self::Proficient => "Proficient",
            Self::Expert => "Expert",
        }
    }
}

impl fmt::Display for CertificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Overall score for one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepScoreEntry {
    /// Step index.
    pub step: usize,
    /// Overall score.
    pub score: u8,
    /// Seconds spent.
    pub time_secs: f64,
}

/// Averages across steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreSummary {
    /// Mean overall score, one decimal.
    pub overall_average: f64,
    /// Mean technical score, one decimal.
    pub technical_average: f64,
    /// Mean non-technical score, one decimal.
    pub non_technical_average: f64,
    /// Per-step scores in step order.
    pub individual_steps: Vec<StepScoreEntry>,
}

/// How the total time compares with the plan's estimate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EfficiencyRating {
    /// At or under the estimate.
    Excellent,
    /// Up to 20% over.
    Good,
    /// Up to 50% over.
    Acceptable,
    /// More than 50% over.
    #[serde(rename = "Needs Improvement")]
    NeedsImprovement,
}

/// Session-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    /// Sum of step times, minutes, one decimal.
    pub total_time_minutes: f64,
    /// Complications resolved with a decision in time.
    pub complications_handled: usize,
    /// Complications that timed out.
    pub complications_timed_out: usize,
    /// Time against the estimate.
    pub efficiency_rating: EfficiencyRating,
}

/// Direction of overall scores between the first and second half of the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    /// Second half more than five points higher.
    Improving,
    /// Second half more than five points lower.
    Declining,
    /// Within five points.
    Stable,
    /// Fewer than two steps.
    InsufficientData,
}

/// Score trend analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceTrends {
    /// Direction.
    pub direction: TrendDirection,
    /// `max(0, 100 - 2σ)` of the overall scores.
    pub consistency: f64,
    /// First step with the highest score.
    pub peak_step: Option<usize>,
    /// First step with the lowest score.
    pub lowest_step: Option<usize>,
}

/// Narrative summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalFeedback {
    /// Performance band.
    pub performance_level: String,
    /// Headline message.
    pub summary_message: String,
    /// Trend sentence.
    pub trend_analysis: String,
    /// Consistency sentence.
    pub consistency_note: String,
}

/// Follow-up plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearningPlan {
    /// Skill areas to work on first.
    pub immediate_focus: Vec<String>,
    /// Concrete practice items, most frequent step advice first.
    pub practice_recommendations: Vec<String>,
    /// What to attempt next.
    pub next_steps: Vec<String>,
}

/// End-of-session report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalAssessment {
    /// Session id.
    pub simulation_id: Uuid,
    /// Procedure id.
    pub procedure_id: String,
    /// Difficulty.
    pub difficulty: Difficulty,
    /// Averages.
    pub scores: ScoreSummary,
    /// Counters.
    pub performance_metrics: PerformanceMetrics,
    /// Certification tier.
    pub certification_level: CertificationLevel,
    /// Trend analysis.
    pub trends: PerformanceTrends,
    /// Narrative.
    pub final_feedback: FinalFeedback,
    /// Step advice ranked by frequency, deduplicated and capped.
    pub recommendations: Vec<String>,
    /// Follow-up plan.
    pub learning_plan: LearningPlan,
    /// Overall average of at least 75.
    pub certification_eligible: bool,
    /// Overall average of at least 85.
    pub next_difficulty_ready: bool,
}

pub(super) fn summarise(config: &ScoringConfig, session: &SimulationSession) -> FinalAssessment {
    let mut assessments: Vec<&StepAssessment> = session.assessments.iter().collect();
    assessments.sort_by_key(|assessment| assessment.step_index);

    let overall_average =
        round1(mean(assessments.iter().map(|a| f64::from(a.overall_score))));
    let technical_average = round1(mean(assessments.iter().map(|a| a.technical_score)));
    let non_technical_average = round1(mean(assessments.iter().map(|a| a.non_technical_score)));
    let total_secs: f64 = assessments.iter().map(|a| a.time_taken_secs).sum();

    let trends = trends(&assessments);
    let recommendations = ranked_recommendations(&assessments, config.recommendation_cap);
    let timed_out = session
        .resolutions
        .iter()
        .filter(|resolution| resolution.timed_out)
        .count();
    let plan = &session.plan;

    FinalAssessment {
        simulation_id: session.id,
        procedure_id: plan.procedure.id.clone(),
        difficulty: plan.difficulty,
        scores: ScoreSummary {
            overall_average,
            technical_average,
            non_technical_average,
            individual_steps: assessments
                .iter()
                .map(|a| StepScoreEntry {
                    step: a.step_index,
                    score: a.overall_score,
                    time_secs: a.time_taken_secs,
                })
                .collect(),
        },
        performance_metrics: PerformanceMetrics {
            total_time_minutes: round1(total_secs / 60.0),
            complications_handled: session.resolutions.len() - timed_out,
            complications_timed_out: timed_out,
            efficiency_rating: efficiency(total_secs, plan.procedure.estimated_duration_minutes),
        },
        certification_level: CertificationLevel::from_average(overall_average),
        final_feedback: final_feedback(overall_average, &trends, &plan.procedure.name, plan.difficulty),
        learning_plan: learning_plan(technical_average, non_technical_average, &recommendations),
        trends,
        recommendations,
        certification_eligible: overall_average >= CERTIFICATION_THRESHOLD,
        next_difficulty_ready: overall_average >= NEXT_DIFFICULTY_THRESHOLD,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0_u32), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / f64::from(count)
    }
}

fn trends(assessments: &[&StepAssessment]) -> PerformanceTrends {
    let scores: Vec<f64> = assessments
        .iter()
        .map(|a| f64::from(a.overall_score))
        .collect();
    let direction = if scores.len() < 2 {
        TrendDirection::InsufficientData
    } else {
        let (first, second) = scores.split_at(scores.len() / 2);
        let first = mean(first.iter().copied());
        let second = mean(second.iter().copied());
        if second > first + TREND_MARGIN {
            TrendDirection::Improving
        } else if second < first - TREND_MARGIN {
            TrendDirection::Declining
        } else {
            TrendDirection::Stable
        }
    };
    let consistency = if scores.len() < 2 {
        100.0
    } else {
        let avg = mean(scores.iter().copied());
        let variance = mean(scores.iter().map(|score| (score - avg).powi(2)));
        round1((100.0 - 2.0 * variance.sqrt()).max(0.0))
    };
    let mut peak: Option<&StepAssessment> = None;
    let mut lowest: Option<&StepAssessment> = None;
    for &assessment in assessments {
        if peak.map_or(true, |best| assessment.overall_score > best.overall_score) {
            peak = Some(assessment);
        }
        if lowest.map_or(true, |worst| assessment.overall_score < worst.overall_score) {
            lowest = Some(assessment);
        }
    }
    PerformanceTrends {
        direction,
        consistency,
        peak_step: peak.map(|a| a.step_index),
        lowest_step: lowest.map(|a| a.step_index),
    }
}

fn ranked_recommendations(assessments: &[&StepAssessment], cap: usize) -> Vec<String> {
    let mut counts: IndexMap<&str, usize> = IndexMap::new();
    for recommendation in assessments
        .iter()
        .flat_map(|a| a.feedback.recommendations.iter())
    {
        *counts.entry(recommendation.as_str()).or_insert(0) += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
        .into_iter()
        .take(cap)
        .map(|(text, _)| text.to_string())
        .collect()
}

fn efficiency(total_secs: f64, estimated_minutes: f64) -> EfficiencyRating {
    let expected = estimated_minutes * 60.0;
    if expected <= 0.0 || total_secs <= expected {
        EfficiencyRating::Excellent
    } else if total_secs <= expected * 1.2 {
        EfficiencyRating::Good
    } else if total_secs <= expected * 1.5 {
        EfficiencyRating::Acceptable
    } else {
        EfficiencyRating::NeedsImprovement
    }
}

fn final_feedback(
    overall: f64,
    trends: &PerformanceTrends,
    procedure: &str,
    difficulty: Difficulty,
) -> FinalFeedback {
    let (level, message) = if overall >= 90.0 {
        (
            "Outstanding",
            format!("Exceptional performance on {procedure} at {difficulty} level."),
        )
    } else if overall >= 75.0 {
        (
            "Proficient",
            format!("Good performance on {procedure} with areas for refinement."),
        )
    } else if overall >= 60.0 {
        (
            "Developing",
            format!("Developing skills demonstrated. Continue practice on {procedure}."),
        )
    } else {
        (
            "Novice",
            format!("Foundational skills need development before attempting {procedure}."),
        )
    };
    let direction = match trends.direction {
        TrendDirection::Improving => "improving",
        TrendDirection::Declining => "declining",
        TrendDirection::Stable => "stable",
        TrendDirection::InsufficientData => "insufficient data",
    };
    FinalFeedback {
        performance_level: level.to_string(),
        summary_message: message,
        trend_analysis: format!("Performance trend: {direction}"),
        consistency_note: format!("Consistency rating: {}%", trends.consistency),
    }
}

fn learning_plan(technical: f64, non_technical: f64, ranked: &[String]) -> LearningPlan {
    let mut plan = LearningPlan {
        practice_recommendations: ranked.to_vec(),
        ..LearningPlan::default()
    };
    if technical < FOCUS_THRESHOLD {
        plan.immediate_focus.push("Technical Skill Development".to_string());
        plan.practice_recommendations.extend(
            [
                "Practice basic laparoscopic skills on trainer",
                "Review anatomical landmarks",
                "Work on instrument handling precision",
            ]
            .map(String::from),
        );
    }
    if non_technical < FOCUS_THRESHOLD {
        plan.immediate_focus
            .push("Communication & Decision Making".to_string());
        plan.practice_recommendations.extend(
            [
                "Practice team communication scenarios",
                "Review decision-making frameworks",
                "Participate in team-based simulations",
            ]
            .map(String::from),
        );
    }
    let next: [&str; 2] = if technical >= 85.0 && non_technical >= 85.0 {
        [
            "Ready for increased difficulty level",
            "Consider mentoring junior trainees",
        ]
    } else if technical >= 75.0 && non_technical >= 75.0 {
        [
            "Practice additional procedure variations",
            "Focus on efficiency improvements",
        ]
    } else {
        [
            "Repeat current difficulty level",
            "Seek additional supervision",
        ]
    };
    plan.next_steps = next.map(String::from).to_vec();
    plan
}
