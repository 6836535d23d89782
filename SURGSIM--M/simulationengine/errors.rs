use thiserror::Error;
use uuid::Uuid;

use crate::{catalog::Difficulty, session::SessionStatus};

/// Errors surfaced by scenario generation and the session lifecycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SimulationError {
    /// Age range is inverted or outside `[0, 120]`.
    #[error("invalid age range [{min}, {max}]: expected min < max within [0, 120]")]
    InvalidRange {
        /// Requested lower bound.
        min: i64,
        /// Requested upper bound.
        max: i64,
    },
    /// Procedure id is not present in the catalog.
    #[error("unknown procedure `{0}`")]
    UnknownProcedure(String),
    /// Procedure does not offer the requested difficulty.
    #[error("procedure `{procedure}` does not support difficulty {difficulty}")]
    UnsupportedDifficulty {
        /// Procedure id.
        procedure: String,
        /// Requested difficulty.
        difficulty: Difficulty,
    },
    /// Complications were requested but no template qualifies.
    #[error("no eligible complication for `{procedure}` at {difficulty}")]
    NoEligibleComplication {
        /// Procedure id.
        procedure: String,
        /// Requested difficulty.
        difficulty: Difficulty,
    },
    /// Session already reached its terminal state.
    #[error("session {0} is complete")]
    SessionClosed(Uuid),
    /// No step can be completed in the current state.
    #[error("no active step while session is {status}")]
    NoActiveStep {
        /// Status at the time of the call.
        status: SessionStatus,
    },
    /// Step was already scored.
    #[error("step {0} has already been assessed")]
    StepAlreadyAssessed(usize),
    /// No complication is waiting for a response.
    #[error("no pending complication while session is {status}")]
    NoPendingComplication {
        /// Status at the time of the call.
        status: SessionStatus,
    },
    /// Final assessment requested before the last step.
    #[error("session is {status}; final assessment requires completion")]
    SessionIncomplete {
        /// Status at the time of the call.
        status: SessionStatus,
    },
    /// Session id is not registered with the engine.
    #[error("unknown session {0}")]
    UnknownSession(Uuid),
    /// Transport payload failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SimulationError {
    /// True for errors the generator recovers from locally.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoEligibleComplication { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_input() {
        let err = SimulationError::InvalidRange { min: 80, max: 20 };
        assert!(err.to_string().contains("[80, 20]"));
        let err = SimulationError::UnsupportedDifficulty {
            procedure: "appendectomy".into(),
            difficulty: Difficulty::Expert,
        };
        assert_eq!(
            err.to_string(),
            "procedure `appendectomy` does not support difficulty expert"
        );
    }

    #[test]
    fn only_scheduling_shortfalls_are_recoverable() {
        assert!(SimulationError::NoEligibleComplication {
            procedure: "p1".into(),
            difficulty: Difficulty::Advanced,
        }
        .is_recoverable());
        assert!(!SimulationError::UnknownProcedure("p9".into()).is_recoverable());
    }
}
