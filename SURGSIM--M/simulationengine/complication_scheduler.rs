use indexmap::IndexMap;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    catalog::{ComplicationTemplate, Difficulty, ProcedureDefinition},
    config::ComplicationDensity,
    errors::SimulationError,
    helper::SimulationTelemetry,
};

/// First step a complication may be attached to; step 1 is never entered via `advance`.
pub const FIRST_TRIGGER_STEP: usize = 2;

/// A complication bound to the step at which it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledComplication {
    /// Step whose entry triggers the complication.
    pub trigger_step: usize,
    /// Template being fired.
    pub template: ComplicationTemplate,
}

/// Result of a scheduling pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    /// Trigger step to complication, ordered by step.
    pub complications: IndexMap<usize, ScheduledComplication>,
    /// Shortfall notes to carry on the plan.
    pub warnings: Vec<String>,
}

/// Places complication templates onto distinct steps.
#[derive(Debug, Clone, Default)]
pub struct ComplicationScheduler {
    density: ComplicationDensity,
    telemetry: Option<SimulationTelemetry>,
}

impl ComplicationScheduler {
    /// Creates a scheduler with the given density table.
    #[must_use]
    pub const fn new(density: ComplicationDensity) -> Self {
        Self {
            density,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<SimulationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Number of complications targeted at `difficulty`.
    #[must_use]
    pub const fn density(&self, difficulty: Difficulty) -> usize {
        self.density.for_difficulty(difficulty)
    }

    /// Schedules complications for `procedure`.
    ///
    /// Each round picks a free step uniformly among those that still have an
    /// unused eligible template, then a template uniformly among the unused
    /// templates eligible there. Fewer slots than the density yields a
    /// partial schedule plus a warning.
    pub fn schedule<R: Rng + ?Sized>(
        &self,
        procedure: &ProcedureDefinition,
        difficulty: Difficulty,
        enabled: bool,
        step_count: usize,
        rng: &mut R,
    ) -> Result<Schedule, SimulationError> {
        let target = self.density(difficulty);
        if !enabled || target == 0 {
            return Ok(Schedule::default());
        }
        let eligible: Vec<&ComplicationTemplate> = procedure
            .complications
            .iter()
            .filter(|template| template.eligible_for(difficulty))
            .collect();
        if eligible.is_empty() {
            return Err(SimulationError::NoEligibleComplication {
                procedure: procedure.id.clone(),
                difficulty,
            });
        }

        let mut used = vec![false; eligible.len()];
        let mut placed: IndexMap<usize, ScheduledComplication> = IndexMap::new();
        while placed.len() < target {
            let unused_at = |slot: usize, used: &[bool]| -> Vec<usize> {
                eligible
                    .iter()
                    .enumerate()
                    .filter(|(idx, template)| !used[*idx] && template.trigger_steps.contains(slot))
                    .map(|(idx, _)| idx)
                    .collect()
            };
            let free_slots: Vec<usize> = (FIRST_TRIGGER_STEP..=step_count)
                .filter(|slot| !placed.contains_key(slot) && !unused_at(*slot, &used).is_empty())
                .collect();
            let Some(&slot) = free_slots.choose(rng) else {
                break;
            };
            let Some(&pick) = unused_at(slot, &used).choose(rng) else {
                break;
            };
            used[pick] = true;
            placed.insert(
                slot,
                ScheduledComplication {
                    trigger_step: slot,
                    template: eligible[pick].clone(),
                },
            );
        }
        placed.sort_keys();

        let mut warnings = Vec::new();
        if placed.len() < target {
            let warning = format!(
                "scheduled {} of {} complications for `{}` at {difficulty}: not enough eligible steps",
                placed.len(),
                target,
                procedure.id
            );
            if let Some(tel) = &self.telemetry {
                let _ = tel.warn(
                    "scheduler.shortfall",
                    json!({
                        "procedure": procedure.id,
                        "difficulty": difficulty.label(),
                        "requested": target,
                        "scheduled": placed.len(),
                    }),
                );
            }
            warnings.push(warning);
        }
        Ok(Schedule {
            complications: placed,
            warnings,
        })
    }
}
