use std::ops::RangeInclusive;

use rand::{rngs::SmallRng, Rng};
use serde::{Deserialize, Serialize};

use crate::{config::SignalConfig, helper::seeded_rng};

/// Physiological clamp ranges applied to every computed vital.
pub mod bounds {
    use std::ops::RangeInclusive;

    /// Beats per minute.
    pub const HEART_RATE: RangeInclusive<f64> = 30.0..=200.0;
    /// mmHg.
    pub const SYSTOLIC: RangeInclusive<f64> = 50.0..=240.0;
    /// mmHg.
    pub const DIASTOLIC: RangeInclusive<f64> = 25.0..=140.0;
    /// Breaths per minute.
    pub const RESPIRATORY_RATE: RangeInclusive<f64> = 4.0..=40.0;
    /// Degrees Celsius.
    pub const TEMPERATURE: RangeInclusive<f64> = 33.0..=42.0;
    /// Percent.
    pub const OXYGEN_SATURATION: RangeInclusive<f64> = 70.0..=100.0;
}

/// Per-vital change, used both for complication impacts and noise offsets.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VitalsDelta {
    /// Heart rate change (bpm).
    pub heart_rate: f64,
    /// Systolic change (mmHg).
    pub systolic: f64,
    /// Diastolic change (mmHg).
    pub diastolic: f64,
    /// Respiratory rate change (breaths/min).
    pub respiratory_rate: f64,
    /// Temperature change (°C).
    pub temperature: f64,
    /// Saturation change (%).
    pub oxygen_saturation: f64,
}

impl VitalsDelta {
    /// Delta multiplied by `factor`.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            heart_rate: self.heart_rate * factor,
            systolic: self.systolic * factor,
            diastolic: self.diastolic * factor,
            respiratory_rate: self.respiratory_rate * factor,
            temperature: self.temperature * factor,
            oxygen_saturation: self.oxygen_saturation * factor,
        }
    }

    /// Field-wise sum.
    #[must_use]
    pub fn plus(&self, other: &Self) -> Self {
        Self {
            heart_rate: self.heart_rate + other.heart_rate,
            systolic: self.systolic + other.systolic,
            diastolic: self.diastolic + other.diastolic,
            respiratory_rate: self.respiratory_rate + other.respiratory_rate,
            temperature: self.temperature + other.temperature,
            oxygen_saturation: self.oxygen_saturation + other.oxygen_saturation,
        }
    }
}

/// Blood pressure pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BloodPressure {
    /// Systolic pressure (mmHg).
    pub systolic: f64,
    /// Diastolic pressure (mmHg).
    pub diastolic: f64,
}

/// Vital sign vector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VitalSigns {
    /// Heart rate (bpm).
    pub heart_rate: f64,
    /// Blood pressure.
    pub blood_pressure: BloodPressure,
    /// Respiratory rate (breaths/min).
    pub respiratory_rate: f64,
    /// Core temperature (°C).
    pub temperature: f64,
    /// Peripheral oxygen saturation (%).
    pub oxygen_saturation: f64,
}

impl VitalSigns {
    /// Adds a delta and clamps to physiological bounds.
    #[must_use]
    pub fn shifted(&self, delta: &VitalsDelta) -> Self {
        Self {
            heart_rate: self.heart_rate + delta.heart_rate,
            blood_pressure: BloodPressure {
                systolic: self.blood_pressure.systolic + delta.systolic,
                diastolic: self.blood_pressure.diastolic + delta.diastolic,
            },
            respiratory_rate: self.respiratory_rate + delta.respiratory_rate,
            temperature: self.temperature + delta.temperature,
            oxygen_saturation: self.oxygen_saturation + delta.oxygen_saturation,
        }
        .clamped()
    }

    /// Every field clamped into its physiological range.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            heart_rate: clamp(self.heart_rate, &bounds::HEART_RATE),
            blood_pressure: BloodPressure {
                systolic: clamp(self.blood_pressure.systolic, &bounds::SYSTOLIC),
                diastolic: clamp(self.blood_pressure.diastolic, &bounds::DIASTOLIC),
            },
            respiratory_rate: clamp(self.respiratory_rate, &bounds::RESPIRATORY_RATE),
            temperature: clamp(self.temperature, &bounds::TEMPERATURE),
            oxygen_saturation: clamp(self.oxygen_saturation, &bounds::OXYGEN_SATURATION),
        }
    }

    /// Values rounded to one decimal place.
    #[must_use]
    pub fn rounded(&self) -> Self {
        Self {
            heart_rate: round1(self.heart_rate),
            blood_pressure: BloodPressure {
                systolic: round1(self.blood_pressure.systolic),
                diastolic: round1(self.blood_pressure.diastolic),
            },
            respiratory_rate: round1(self.respiratory_rate),
            temperature: round1(self.temperature),
            oxygen_saturation: round1(self.oxygen_saturation),
        }
    }

    /// Whether every field lies inside its physiological range.
    #[must_use]
    pub fn within_bounds(&self) -> bool {
        bounds::HEART_RATE.contains(&self.heart_rate)
            && bounds::SYSTOLIC.contains(&self.blood_pressure.systolic)
            && bounds::DIASTOLIC.contains(&self.blood_pressure.diastolic)
            && bounds::RESPIRATORY_RATE.contains(&self.respiratory_rate)
            && bounds::TEMPERATURE.contains(&self.temperature)
            && bounds::OXYGEN_SATURATION.contains(&self.oxygen_saturation)
    }

    /// Coarse clinical status.
    #[must_use]
    pub fn status(&self) -> VitalsStatus {
        let hr = self.heart_rate;
        let sys = self.blood_pressure.systolic;
        let spo2 = self.oxygen_saturation;
        if spo2 < 85.0 || !(40.0..=150.0).contains(&hr) || sys < 80.0 {
            VitalsStatus::Critical
        } else if spo2 < 92.0
            || !(50.0..=120.0).contains(&hr)
            || !(90.0..=180.0).contains(&sys)
            || self.temperature > 38.5
        {
            VitalsStatus::Warning
        } else {
            VitalsStatus::Stable
        }
    }
}

/// Monitoring status derived from a vitals vector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VitalsStatus {
    /// All vitals in the expected range.
    Stable,
    /// At least one vital needs attention.
    Warning,
    /// At least one vital is dangerous.
    Critical,
}

/// Vitals as reported to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VitalsReading {
    /// Current vitals.
    #[serde(flatten)]
    pub vitals: VitalSigns,
    /// Derived status.
    pub status: VitalsStatus,
    /// Session time the reading refers to.
    pub elapsed_secs: f64,
}

/// A complication impact applied to the running trajectory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedImpact {
    /// Complication type tag.
    pub kind: String,
    /// Full delta at the moment of application.
    pub delta: VitalsDelta,
    /// Session time of application.
    pub applied_at_secs: f64,
}

// (step, bound) pairs for the random walk at noise_scale 1.0.
const WALK_HEART_RATE: (f64, f64) = (2.0, 8.0);
const WALK_SYSTOLIC: (f64, f64) = (2.0, 8.0);
const WALK_DIASTOLIC: (f64, f64) = (1.5, 6.0);
const WALK_RESPIRATORY: (f64, f64) = (0.5, 2.0);
const WALK_TEMPERATURE: (f64, f64) = (0.05, 0.3);
const WALK_SATURATION: (f64, f64) = (0.3, 1.5);

/// Computes live vitals from a baseline, decaying impacts, and bounded noise.
#[derive(Debug, Clone)]
pub struct SignalModel {
    config: SignalConfig,
    walk: VitalsDelta,
    rng: SmallRng,
}

impl SignalModel {
    /// Creates a model whose noise is reproducible for `seed`.
    #[must_use]
    pub fn new(config: SignalConfig, seed: u64) -> Self {
        Self {
            config,
            walk: VitalsDelta::default(),
            rng: seeded_rng(seed),
        }
    }

    /// Sum of impacts at `elapsed_secs`, each decayed by the configured half-life.
    /// Impacts applied after `elapsed_secs` are ignored.
    #[must_use]
    pub fn impact_at(&self, impacts: &[AppliedImpact], elapsed_secs: f64) -> VitalsDelta {
        impacts
            .iter()
            .filter(|impact| impact.applied_at_secs <= elapsed_secs)
            .fold(VitalsDelta::default(), |acc, impact| {
                let age = elapsed_secs - impact.applied_at_secs;
                acc.plus(&impact.delta.scaled(self.decay(age)))
            })
    }

    /// Samples the vitals at `elapsed_secs`, advancing the noise walk by one step.
    pub fn sample(
        &mut self,
        baseline: &VitalSigns,
        impacts: &[AppliedImpact],
        elapsed_secs: f64,
    ) -> VitalsReading {
        self.step_walk();
        let offset = self.impact_at(impacts, elapsed_secs).plus(&self.walk);
        let vitals = baseline.shifted(&offset).rounded();
        VitalsReading {
            vitals,
            status: vitals.status(),
            elapsed_secs,
        }
    }

    fn decay(&self, age_secs: f64) -> f64 {
        if self.config.half_life_secs <= 0.0 {
            return 1.0;
        }
        0.5_f64.powf(age_secs.max(0.0) / self.config.half_life_secs)
    }

    fn step_walk(&mut self) {
        let scale = self.config.noise_scale;
        if scale <= 0.0 {
            return;
        }
        let rng = &mut self.rng;
        let walk = &mut self.walk;
        walk.heart_rate = walk_field(rng, walk.heart_rate, WALK_HEART_RATE, scale);
        walk.systolic = walk_field(rng, walk.systolic, WALK_SYSTOLIC, scale);
        walk.diastolic = walk_field(rng, walk.diastolic, WALK_DIASTOLIC, scale);
        walk.respiratory_rate = walk_field(rng, walk.respiratory_rate, WALK_RESPIRATORY, scale);
        walk.temperature = walk_field(rng, walk.temperature, WALK_TEMPERATURE, scale);
        walk.oxygen_saturation = walk_field(rng, walk.oxygen_saturation, WALK_SATURATION, scale);
    }
}

fn walk_field(rng: &mut SmallRng, current: f64, (step, bound): (f64, f64), scale: f64) -> f64 {
    let step = step * scale;
    let bound = bound * scale;
    (current + rng.gen_range(-step..=step)).clamp(-bound, bound)
}

/// Clamps `value` into `range`.
#[must_use]
pub fn clamp(value: f64, range: &RangeInclusive<f64>) -> f64 {
    value.clamp(*range.start(), *range.end())
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
