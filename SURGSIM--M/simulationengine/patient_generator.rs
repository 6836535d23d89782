use std::{fmt, str::FromStr};

use indexmap::IndexSet;
use rand::{seq::SliceRandom, Rng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    clinical_record::{
        sample_imaging, sample_labs, sample_social, ImagingFindings, LabResults, SocialHistory,
    },
    errors::SimulationError,
    signal_model::{BloodPressure, VitalSigns},
};

/// Oldest age the generator accepts.
pub const MAX_AGE: i64 = 120;

const MEDICATIONS: [&str; 8] = [
    "metformin",
    "lisinopril",
    "atorvastatin",
    "metoprolol",
    "omeprazole",
    "aspirin",
    "warfarin",
    "levothyroxine",
];
const ALLERGENS: [&str; 5] = ["penicillin", "latex", "iodine", "eggs", "shellfish"];

/// Resolved subject gender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    /// Male.
    Male,
    /// Female.
    Female,
}

/// Gender requested by the caller.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenderSelector {
    /// Always male.
    Male,
    /// Always female.
    Female,
    /// Uniform choice.
    #[default]
    Random,
}

impl FromStr for GenderSelector {
    type Err = SimulationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            "" | "random" => Ok(Self::Random),
            other => Err(SimulationError::InvalidRequest(format!(
                "unknown gender `{other}`"
            ))),
        }
    }
}

/// Medical history tag; each one shifts the baseline vitals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryTag {
    /// Diabetes mellitus.
    Diabetes,
    /// Essential hypertension.
    Hypertension,
    /// BMI above 30.
    Obesity,
    /// Prior abdominal surgery.
    PreviousSurgery,
}

impl HistoryTag {
    /// Every tag.
    pub const ALL: [Self; 4] = [
        Self::Diabetes,
        Self::Hypertension,
        Self::Obesity,
        Self::PreviousSurgery,
    ];

    /// Wire label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Diabetes => "diabetes",
            Self::Hypertension => "hypertension",
            Self::Obesity => "obesity",
            Self::PreviousSurgery => "previous_surgery",
        }
    }
}

impl fmt::Display for HistoryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for HistoryTag {
    type Err = SimulationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|tag| tag.label() == wanted)
            .ok_or_else(|| {
                SimulationError::InvalidRequest(format!("unknown medical history tag `{raw}`"))
            })
    }
}

/// Inputs constraining a generated subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectConstraints {
    /// Youngest allowed age.
    pub age_min: i64,
    /// Oldest allowed age.
    pub age_max: i64,
    /// Requested gender.
    pub gender: GenderSelector,
    /// Fixed history; `None` samples an age-appropriate one.
    pub history: Option<Vec<HistoryTag>>,
    /// Caller-supplied conditions outside [`HistoryTag`]; carried without a vitals shift.
    pub other_history: Vec<String>,
}

impl SubjectConstraints {
    /// Validates the age range.
    pub fn validate(&self) -> Result<(), SimulationError> {
        let in_bounds = |age: i64| (0..=MAX_AGE).contains(&age);
        if self.age_min >= self.age_max || !in_bounds(self.age_min) || !in_bounds(self.age_max) {
            return Err(SimulationError::InvalidRange {
                min: self.age_min,
                max: self.age_max,
            });
        }
        Ok(())
    }
}

impl Default for SubjectConstraints {
    fn default() -> Self {
        Self {
            age_min: 20,
            age_max: 80,
            gender: GenderSelector::Random,
            history: None,
            other_history: Vec::new(),
        }
    }
}

/// Demographic block of a subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Demographics {
    /// Age in years.
    pub age: u8,
    /// Gender.
    pub gender: Gender,
    /// Weight in kilograms.
    pub weight_kg: f64,
    /// Height in centimetres.
    pub height_cm: f64,
    /// Body-mass index.
    pub bmi: f64,
}

/// Synthetic subject; immutable once generated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectProfile {
    /// Demographics.
    pub demographics: Demographics,
    /// History tags.
    pub history: IndexSet<HistoryTag>,
    /// Conditions the vitals model does not know.
    #[serde(default)]
    pub other_history: Vec<String>,
    /// Current medications.
    pub medications: Vec<String>,
    /// Known allergies.
    pub allergies: Vec<String>,
    /// Resting vitals before the procedure.
    pub baseline: VitalSigns,
    /// Lifestyle.
    pub social_history: SocialHistory,
    /// Pre-operative labs.
    pub lab_results: LabResults,
    /// Pre-operative imaging.
    pub imaging: ImagingFindings,
}

impl SubjectProfile {
    /// Whether the subject carries `tag`.
    #[must_use]
    pub fn has(&self, tag: HistoryTag) -> bool {
        self.history.contains(&tag)
    }
}

#[derive(Debug, Clone, Copy)]
struct Prior {
    mean: f64,
    sd: f64,
}

impl Prior {
    const fn new(mean: f64, sd: f64) -> Self {
        Self { mean, sd }
    }

    fn shift(&mut self, mean: f64, spread: f64) {
        self.mean += mean;
        self.sd *= spread;
    }

    fn sample<R: Rng + ?Sized>(self, rng: &mut R) -> f64 {
        let z: f64 = rng.sample(StandardNormal);
        self.mean + self.sd * z
    }
}

#[derive(Debug, Clone, Copy)]
struct VitalPriors {
    heart_rate: Prior,
    systolic: Prior,
    diastolic: Prior,
    respiratory_rate: Prior,
    temperature: Prior,
    oxygen_saturation: Prior,
}

impl VitalPriors {
    fn for_subject(age: u8, history: &IndexSet<HistoryTag>) -> Self {
        let mut priors = Self {
            heart_rate: Prior::new(78.0, 8.0),
            systolic: Prior::new(122.0, 9.0),
            diastolic: Prior::new(78.0, 6.0),
            respiratory_rate: Prior::new(15.0, 2.0),
            temperature: Prior::new(36.8, 0.2),
            oxygen_saturation: Prior::new(97.5, 1.0),
        };
        for tag in history {
            match tag {
                HistoryTag::Hypertension => {
                    priors.systolic.shift(20.0, 1.4);
                    priors.diastolic.shift(10.0, 1.3);
                }
                HistoryTag::Diabetes => {
                    priors.heart_rate.shift(5.0, 1.0);
                    priors.systolic.shift(4.0, 1.0);
                }
                HistoryTag::Obesity => {
                    priors.heart_rate.shift(6.0, 1.1);
                    priors.systolic.shift(6.0, 1.0);
                    priors.respiratory_rate.shift(2.0, 1.0);
                    priors.oxygen_saturation.shift(-1.5, 1.3);
                }
                HistoryTag::PreviousSurgery => {}
            }
        }
        if age > 60 {
            priors.systolic.shift(6.0, 1.0);
            priors.heart_rate.shift(-3.0, 1.0);
        }
        priors
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> VitalSigns {
        let systolic = self.systolic.sample(rng);
        let diastolic = self.diastolic.sample(rng).min(systolic - 15.0);
        VitalSigns {
            heart_rate: self.heart_rate.sample(rng),
            blood_pressure: BloodPressure {
                systolic,
                diastolic,
            },
            respiratory_rate: self.respiratory_rate.sample(rng),
            temperature: self.temperature.sample(rng),
            oxygen_saturation: self.oxygen_saturation.sample(rng),
        }
        .clamped()
        .rounded()
    }
}

/// Produces subject profiles from constraints and an explicit RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectGenerator;

impl SubjectGenerator {
    /// Creates generator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Generates a subject; fails only on an invalid age range.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        constraints: &SubjectConstraints,
        rng: &mut R,
    ) -> Result<SubjectProfile, SimulationError> {
        constraints.validate()?;
        let age = u8::try_from(rng.gen_range(constraints.age_min..=constraints.age_max))
            .unwrap_or(u8::MAX);
        let gender = match constraints.gender {
            GenderSelector::Male => Gender::Male,
            GenderSelector::Female => Gender::Female,
            GenderSelector::Random => {
                if rng.gen_bool(0.5) {
                    Gender::Male
                } else {
                    Gender::Female
                }
            }
        };
        let history = constraints.history.as_ref().map_or_else(
            || sample_history(age, rng),
            |tags| tags.iter().copied().collect(),
        );
        let demographics = sample_demographics(age, gender, &history, rng);
        let baseline = VitalPriors::for_subject(age, &history).sample(rng);
        let medications = sample_medications(age, &history, rng);
        let allergies = sample_allergies(rng);
        let social_history = sample_social(age, rng);
        let lab_results = sample_labs(&history, &medications, rng);
        let imaging = sample_imaging(rng);
        let mut other_history = IndexSet::new();
        for condition in &constraints.other_history {
            let condition = condition.trim().to_ascii_lowercase();
            if !condition.is_empty() {
                other_history.insert(condition);
            }
        }
        Ok(SubjectProfile {
            demographics,
            history,
            other_history: other_history.into_iter().collect(),
            medications,
            allergies,
            baseline,
            social_history,
            lab_results,
            imaging,
        })
    }
}

fn sample_history<R: Rng + ?Sized>(age: u8, rng: &mut R) -> IndexSet<HistoryTag> {
    let mut history = IndexSet::new();
    if age > 40 {
        if rng.gen_bool(0.3) {
            history.insert(HistoryTag::Hypertension);
        }
        if rng.gen_bool(0.2) {
            history.insert(HistoryTag::Diabetes);
        }
    }
    if age > 50 {
        if rng.gen_bool(0.4) {
            history.insert(HistoryTag::Obesity);
        }
        if rng.gen_bool(0.3) {
            history.insert(HistoryTag::PreviousSurgery);
        }
    }
    if rng.gen_bool(0.2) {
        let remaining: Vec<_> = HistoryTag::ALL
            .into_iter()
            .filter(|tag| !history.contains(tag))
            .collect();
        if let Some(extra) = remaining.choose(rng) {
            history.insert(*extra);
        }
    }
    history
}

fn sample_demographics<R: Rng + ?Sized>(
    age: u8,
    gender: Gender,
    history: &IndexSet<HistoryTag>,
    rng: &mut R,
) -> Demographics {
    let (weight_range, height_range) = match gender {
        Gender::Male => (65.0..=95.0, 165.0..=190.0),
        Gender::Female => (55.0..=85.0, 155.0..=180.0),
    };
    let mut weight_kg: f64 = rng.gen_range(weight_range);
    if age > 50 {
        weight_kg += rng.gen_range(0.0..=15.0);
    }
    if history.contains(&HistoryTag::Obesity) {
        weight_kg += rng.gen_range(20.0..=35.0);
    }
    let height_cm: f64 = rng.gen_range(height_range);
    let height_m = height_cm / 100.0;
    Demographics {
        age,
        gender,
        weight_kg: (weight_kg * 10.0).round() / 10.0,
        height_cm: height_cm.round(),
        bmi: (weight_kg / (height_m * height_m) * 10.0).round() / 10.0,
    }
}

fn sample_medications<R: Rng + ?Sized>(
    age: u8,
    history: &IndexSet<HistoryTag>,
    rng: &mut R,
) -> Vec<String> {
    let mut medications = IndexSet::new();
    if history.contains(&HistoryTag::Hypertension) {
        medications.insert("lisinopril");
    }
    if history.contains(&HistoryTag::Diabetes) {
        medications.insert("metformin");
    }
    if age > 45 && rng.gen_bool(0.4) {
        medications.insert("atorvastatin");
    }
    if age > 60 && rng.gen_bool(0.2) {
        medications.insert("aspirin");
    }
    if rng.gen_bool(0.3) {
        if let Some(extra) = MEDICATIONS.choose(rng) {
            medications.insert(*extra);
        }
    }
    medications.into_iter().map(str::to_string).collect()
}

fn sample_allergies<R: Rng + ?Sized>(rng: &mut R) -> Vec<String> {
    if !rng.gen_bool(0.2) {
        return Vec::new();
    }
    let count = rng.gen_range(1..=2);
    ALLERGENS
        .choose_multiple(rng, count)
        .map(|allergen| (*allergen).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::seeded_rng;

    fn constraints(min: i64, max: i64) -> SubjectConstraints {
        SubjectConstraints {
            age_min: min,
            age_max: max,
            ..SubjectConstraints::default()
        }
    }

    #[test]
    fn age_stays_within_requested_range() {
        let generator = SubjectGenerator::new();
        let ranges = [(0_u64, 0, 1), (1, 18, 19), (2, 20, 80), (3, 0, 120), (4, 65, 90)];
        for (seed, min, max) in ranges {
            let mut rng = seeded_rng(seed);
            for _ in 0..50 {
                let subject = generator.generate(&constraints(min, max), &mut rng).unwrap();
                let age = i64::from(subject.demographics.age);
                assert!((min..=max).contains(&age), "{age} outside [{min}, {max}]");
                assert!(subject.baseline.within_bounds());
            }
        }
    }

    #[test]
    fn rejects_invalid_ranges() {
        let generator = SubjectGenerator::new();
        let mut rng = seeded_rng(1);
        for (min, max) in [(50, 50), (60, 20), (-1, 30), (30, 121)] {
            assert_eq!(
                generator.generate(&constraints(min, max), &mut rng),
                Err(SimulationError::InvalidRange { min, max })
            );
        }
    }

    #[test]
    fn same_seed_same_subject() {
        let generator = SubjectGenerator::new();
        let a = generator
            .generate(&SubjectConstraints::default(), &mut seeded_rng(77))
            .unwrap();
        let b = generator
            .generate(&SubjectConstraints::default(), &mut seeded_rng(77))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.social_history, b.social_history);
        assert_eq!(a.lab_results, b.lab_results);
        assert_eq!(a.imaging, b.imaging);
        let other = generator
            .generate(&SubjectConstraints::default(), &mut seeded_rng(78))
            .unwrap();
        assert_ne!(
            (&a.lab_results, &a.imaging),
            (&other.lab_results, &other.imaging)
        );
    }

    #[test]
    fn unlisted_conditions_are_kept_without_shifting_vitals() {
        let generator = SubjectGenerator::new();
        let known_only = SubjectConstraints {
            history: Some(vec![HistoryTag::Diabetes]),
            ..SubjectConstraints::default()
        };
        let with_asthma = SubjectConstraints {
            other_history: vec![" Asthma ".into(), "asthma".into(), String::new()],
            ..known_only.clone()
        };
        let plain = generator.generate(&known_only, &mut seeded_rng(4)).unwrap();
        let subject = generator.generate(&with_asthma, &mut seeded_rng(4)).unwrap();
        assert_eq!(subject.other_history, vec!["asthma".to_string()]);
        assert!(subject.has(HistoryTag::Diabetes));
        assert_eq!(subject.baseline, plain.baseline);
        assert_eq!(subject.lab_results, plain.lab_results);
    }

    #[test]
    fn explicit_history_and_gender_are_respected() {
        let generator = SubjectGenerator::new();
        let request = SubjectConstraints {
            gender: GenderSelector::Female,
            history: Some(Vec::new()),
            ..SubjectConstraints::default()
        };
        let mut rng = seeded_rng(3);
        for _ in 0..20 {
            let subject = generator.generate(&request, &mut rng).unwrap();
            assert_eq!(subject.demographics.gender, Gender::Female);
            assert!(subject.history.is_empty());
        }
    }

    #[test]
    fn hypertension_raises_systolic_pressure() {
        let generator = SubjectGenerator::new();
        let mean_systolic = |history: Vec<HistoryTag>| {
            let request = SubjectConstraints {
                age_min: 30,
                age_max: 40,
                history: Some(history),
                ..SubjectConstraints::default()
            };
            let mut rng = seeded_rng(11);
            let total: f64 = (0..300)
                .map(|_| {
                    generator
                        .generate(&request, &mut rng)
                        .unwrap()
                        .baseline
                        .blood_pressure
                        .systolic
                })
                .sum();
            total / 300.0
        };
        let healthy = mean_systolic(Vec::new());
        let hypertensive = mean_systolic(vec![HistoryTag::Hypertension]);
        assert!(hypertensive > healthy + 10.0, "{hypertensive} vs {healthy}");
    }

    #[test]
    fn parses_history_labels() {
        assert_eq!(
            "Previous Surgery".parse::<HistoryTag>().unwrap(),
            HistoryTag::PreviousSurgery
        );
        assert!("asthma".parse::<HistoryTag>().is_err());
        assert_eq!("Diabetes".parse::<HistoryTag>().unwrap(), HistoryTag::Diabetes);
        assert_eq!("".parse::<GenderSelector>().unwrap(), GenderSelector::Random);
    }
}
