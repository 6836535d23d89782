#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! SurgSim simulation engine – builds procedure training sessions, drives them step by
//! step, models patient vitals, and scores the trainee.

/// Error taxonomy shared by every operation.
#[path = "../errors.rs"]
pub mod errors;

/// Procedure catalog and difficulty levels.
#[path = "../catalog.rs"]
pub mod catalog;

/// Vital signs and their evolution over a session.
#[path = "../signal_model.rs"]
pub mod signal_model;

/// Telemetry for simulation engine.
#[path = "../helper.rs"]
pub mod helper;

/// Engine configuration.
#[path = "../config.rs"]
pub mod config;

/// Social history, labs and imaging attached to a subject.
#[path = "../clinical_record.rs"]
pub mod clinical_record;

/// Synthetic patient generation.
#[path = "../patient_generator.rs"]
pub mod patient_generator;

/// Complication placement.
#[path = "../complication_scheduler.rs"]
pub mod complication_scheduler;

/// Plan generation.
#[path = "../scenario_builder.rs"]
pub mod scenario_builder;

/// Session state machine.
#[path = "../session.rs"]
pub mod session;

/// Step and session assessment.
#[path = "../assessment/main.rs"]
pub mod assessment;

/// JSON request and response shapes.
#[path = "../boundary.rs"]
pub mod boundary;

/// Engine facade and session registry.
#[path = "../main.rs"]
pub mod runtime;

pub use assessment::{AssessmentEngine, FinalAssessment, StepAssessment};
pub use boundary::{GenerateSimulationRequest, PlanEnvelope, ProcedureSummary, StepSubmission};
pub use catalog::{Difficulty, ProcedureCatalog};
pub use config::EngineConfig;
pub use errors::SimulationError;
pub use helper::{SimulationTelemetry, SimulationTelemetryBuilder};
pub use runtime::{SimulationEngine, SimulationEngineBuilder, StepOutcome};
pub use scenario_builder::{ScenarioBuilder, ScenarioRequest, SimulationPlan};
pub use session::{
    AdvanceOutcome, ComplicationResponse, ResolutionOutcome, SessionStateMachine, SessionStatus,
};
