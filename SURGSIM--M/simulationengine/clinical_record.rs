use indexmap::IndexSet;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::patient_generator::HistoryTag;

const OCCUPATIONS: [&str; 5] = ["teacher", "engineer", "nurse", "retired", "student"];

/// Tobacco use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Smoking {
    /// Never smoked.
    Never,
    /// Quit.
    Former,
    /// Smokes now.
    Current,
}

/// Alcohol intake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Alcohol {
    /// Abstains.
    None,
    /// Occasional.
    Social,
    /// Regular, within limits.
    Moderate,
}

/// Physical activity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Exercise {
    /// Little or none.
    Sedentary,
    /// Walks, light chores.
    Light,
    /// A few sessions a week.
    Moderate,
    /// Daily training.
    Active,
}

/// Lifestyle block of a subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocialHistory {
    /// Tobacco use; adults only.
    pub smoking: Smoking,
    /// Alcohol intake; over 21 only.
    pub alcohol: Alcohol,
    /// Occupation.
    pub occupation: String,
    /// Activity level.
    pub exercise: Exercise,
}

/// Complete blood count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteBloodCount {
    /// g/dL.
    pub hemoglobin: f64,
    /// Percent.
    pub hematocrit: f64,
    /// 10^3 per microlitre.
    pub white_blood_cells: f64,
    /// 10^3 per microlitre.
    pub platelets: u32,
}

/// Basic metabolic panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetabolicPanel {
    /// mmol/L.
    pub sodium: u32,
    /// mmol/L.
    pub potassium: f64,
    /// mmol/L.
    pub chloride: u32,
    /// mg/dL, fasting.
    pub glucose: u32,
    /// mg/dL.
    pub creatinine: f64,
}

/// Liver function tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiverFunction {
    /// U/L.
    pub alt: u32,
    /// U/L.
    pub ast: u32,
    /// mg/dL.
    pub bilirubin: f64,
}

/// Coagulation studies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coagulation {
    /// Prothrombin time, seconds.
    pub pt: f64,
    /// Partial thromboplastin time, seconds.
    pub ptt: f64,
    /// International normalised ratio.
    pub inr: f64,
}

/// Pre-operative laboratory panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabResults {
    /// CBC.
    pub complete_blood_count: CompleteBloodCount,
    /// BMP.
    pub basic_metabolic_panel: MetabolicPanel,
    /// LFT.
    pub liver_function: LiverFunction,
    /// Coagulation.
    pub coagulation: Coagulation,
}

/// Inflammation grade on CT.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InflammationGrade {
    /// No inflammation.
    None,
    /// Mild.
    Mild,
    /// Moderate.
    Moderate,
    /// Severe.
    Severe,
}

/// Complicating finding on CT.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CtComplication {
    /// Nothing seen.
    None,
    /// Free perforation.
    Perforation,
    /// Walled-off collection.
    Abscess,
}

/// Ultrasound report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UltrasoundFindings {
    /// Millimetres.
    pub gallbladder_wall_thickness: f64,
    /// Gallstones seen.
    pub stones_present: bool,
    /// Fluid around the gallbladder.
    pub pericholecystic_fluid: bool,
    /// Sonographic Murphy sign.
    pub murphy_sign: bool,
}

/// CT report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CtFindings {
    /// Inflammation grade.
    pub inflammation: InflammationGrade,
    /// Complicating finding.
    pub complications: CtComplication,
    /// Anatomical variant reported.
    pub anatomy_variants: bool,
}

/// Pre-operative imaging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImagingFindings {
    /// Ultrasound.
    pub ultrasound: UltrasoundFindings,
    /// CT.
    pub ct_findings: CtFindings,
}

fn pick<T: Copy, R: Rng + ?Sized>(rng: &mut R, options: &[T]) -> T {
    options[rng.gen_range(0..options.len())]
}

fn tenths<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    (rng.gen_range(low..=high) * 10.0).round() / 10.0
}

fn hundredths<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    (rng.gen_range(low..=high) * 100.0).round() / 100.0
}

pub(crate) fn sample_social<R: Rng + ?Sized>(age: u8, rng: &mut R) -> SocialHistory {
    let smoking = if age > 18 {
        pick(rng, &[Smoking::Never, Smoking::Former, Smoking::Current])
    } else {
        Smoking::Never
    };
    let alcohol = if age > 21 {
        pick(rng, &[Alcohol::None, Alcohol::Social, Alcohol::Moderate])
    } else {
        Alcohol::None
    };
    SocialHistory {
        smoking,
        alcohol,
        occupation: pick(rng, &OCCUPATIONS).to_string(),
        exercise: pick(
            rng,
            &[
                Exercise::Sedentary,
                Exercise::Light,
                Exercise::Moderate,
                Exercise::Active,
            ],
        ),
    }
}

/// Diabetes lifts fasting glucose; warfarin prolongs clotting.
pub(crate) fn sample_labs<R: Rng + ?Sized>(
    history: &IndexSet<HistoryTag>,
    medications: &[String],
    rng: &mut R,
) -> LabResults {
    let complete_blood_count = CompleteBloodCount {
        hemoglobin: tenths(rng, 12.0, 16.0),
        hematocrit: tenths(rng, 36.0, 48.0),
        white_blood_cells: tenths(rng, 4.0, 11.0),
        platelets: rng.gen_range(150..=450),
    };
    let glucose = if history.contains(&HistoryTag::Diabetes) {
        130..=220
    } else {
        80..=120
    };
    let basic_metabolic_panel = MetabolicPanel {
        sodium: rng.gen_range(135..=145),
        potassium: tenths(rng, 3.5, 5.0),
        chloride: rng.gen_range(98..=108),
        glucose: rng.gen_range(glucose),
        creatinine: tenths(rng, 0.6, 1.2),
    };
    let liver_function = LiverFunction {
        alt: rng.gen_range(10..=40),
        ast: rng.gen_range(10..=40),
        bilirubin: tenths(rng, 0.2, 1.2),
    };
    let anticoagulated = medications.iter().any(|m| m == "warfarin");
    let coagulation = Coagulation {
        pt: tenths(rng, 11.0, 13.0),
        ptt: tenths(rng, 25.0, 35.0),
        inr: if anticoagulated {
            hundredths(rng, 2.0, 3.0)
        } else {
            hundredths(rng, 0.9, 1.1)
        },
    };
    LabResults {
        complete_blood_count,
        basic_metabolic_panel,
        liver_function,
        coagulation,
    }
}

pub(crate) fn sample_imaging<R: Rng + ?Sized>(rng: &mut R) -> ImagingFindings {
    let ultrasound = UltrasoundFindings {
        gallbladder_wall_thickness: tenths(rng, 2.0, 8.0),
        stones_present: rng.gen_bool(0.5),
        pericholecystic_fluid: rng.gen_bool(0.5),
        murphy_sign: rng.gen_bool(0.5),
    };
    let ct_findings = CtFindings {
        inflammation: pick(
            rng,
            &[
                InflammationGrade::None,
                InflammationGrade::Mild,
                InflammationGrade::Moderate,
                InflammationGrade::Severe,
            ],
        ),
        complications: pick(
            rng,
            &[
                CtComplication::None,
                CtComplication::Perforation,
                CtComplication::Abscess,
            ],
        ),
        anatomy_variants: rng.gen_bool(0.5),
    };
    ImagingFindings {
        ultrasound,
        ct_findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::seeded_rng;

    #[test]
    fn minors_neither_smoke_nor_drink() {
        let mut rng = seeded_rng(5);
        for _ in 0..100 {
            let social = sample_social(16, &mut rng);
            assert_eq!(social.smoking, Smoking::Never);
            assert_eq!(social.alcohol, Alcohol::None);
            assert!(OCCUPATIONS.contains(&social.occupation.as_str()));
        }
    }

    #[test]
    fn labs_stay_in_reference_ranges() {
        let mut rng = seeded_rng(9);
        let healthy = IndexSet::new();
        for _ in 0..200 {
            let labs = sample_labs(&healthy, &[], &mut rng);
            let cbc = &labs.complete_blood_count;
            assert!((12.0..=16.0).contains(&cbc.hemoglobin));
            assert!((150..=450).contains(&cbc.platelets));
            let bmp = &labs.basic_metabolic_panel;
            assert!((135..=145).contains(&bmp.sodium));
            assert!((80..=120).contains(&bmp.glucose));
            assert!((0.6..=1.2).contains(&bmp.creatinine));
            assert!((10..=40).contains(&labs.liver_function.alt));
            assert!((0.9..=1.1).contains(&labs.coagulation.inr));
        }
    }

    #[test]
    fn diabetes_and_warfarin_shift_their_labs() {
        let mut rng = seeded_rng(13);
        let diabetic: IndexSet<_> = [HistoryTag::Diabetes].into_iter().collect();
        let medications = vec!["warfarin".to_string()];
        for _ in 0..50 {
            let labs = sample_labs(&diabetic, &medications, &mut rng);
            assert!(labs.basic_metabolic_panel.glucose >= 130);
            assert!(labs.coagulation.inr >= 2.0);
        }
    }

    #[test]
    fn wall_thickness_is_rounded_and_bounded() {
        let mut rng = seeded_rng(2);
        for _ in 0..100 {
            let thickness = sample_imaging(&mut rng).ultrasound.gallbladder_wall_thickness;
            assert!((2.0..=8.0).contains(&thickness));
            assert!(((thickness * 10.0).round() - thickness * 10.0).abs() < 1e-9);
        }
    }
}
