use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StudyError;

/// Ground-truth and judgment labels form a closed two-value set. Anything
/// arriving as a string passes through [`Label::parse`] exactly once, at the
/// boundary; unrecognized values are a [`StudyError::LabelMismatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Real,
    Fake,
}

impl Label {
    pub fn parse(value: &str) -> Result<Self, StudyError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "real" => Ok(Label::Real),
            "fake" => Ok(Label::Fake),
            _ => Err(StudyError::LabelMismatch {
                value: value.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Real => "real",
            Label::Fake => "fake",
        }
    }

    /// Binary code used by the scoring pipeline: real is 0, fake is 1.
    pub fn code(&self) -> u8 {
        match self {
            Label::Real => 0,
            Label::Fake => 1,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const GROUP_COUNT: usize = 3;

/// Fixed experimental conditions. The set and its order are part of the study
/// design: participant assignment indexes into [`StudyGroup::ALL`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StudyGroup {
    #[serde(rename = "720p_audio")]
    Sd720Audio,
    #[serde(rename = "1080p_audio")]
    Hd1080Audio,
    #[serde(rename = "720p_silent")]
    Sd720Silent,
}

impl StudyGroup {
    pub const ALL: [StudyGroup; GROUP_COUNT] = [
        StudyGroup::Sd720Audio,
        StudyGroup::Hd1080Audio,
        StudyGroup::Sd720Silent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StudyGroup::Sd720Audio => "720p_audio",
            StudyGroup::Hd1080Audio => "1080p_audio",
            StudyGroup::Sd720Silent => "720p_silent",
        }
    }

    pub fn parse(value: &str) -> Option<StudyGroup> {
        StudyGroup::ALL.iter().copied().find(|g| g.as_str() == value)
    }

    /// Deterministic group assignment: `participant_id mod GROUP_COUNT`
    /// indexes the fixed group order. Pure and stable across restarts.
    pub fn from_participant(participant_id: u32) -> StudyGroup {
        StudyGroup::ALL[participant_id as usize % GROUP_COUNT]
    }
}

impl fmt::Display for StudyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One clip available to the study, as supplied by the catalog. Identity is
/// the locator; the catalog guarantees uniqueness within a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialItem {
    pub locator: String,
    pub group: StudyGroup,
    pub label: Label,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_parse_accepts_canonical_and_cased_values() {
        assert_eq!(Label::parse("real").expect("real"), Label::Real);
        assert_eq!(Label::parse("Fake").expect("fake"), Label::Fake);
        assert_eq!(Label::parse("  REAL ").expect("trimmed"), Label::Real);
    }

    #[test]
    fn label_parse_rejects_anything_else() {
        let err = Label::parse("deepfake").expect_err("must fail closed");
        assert!(
            err.to_string().contains("label_mismatch"),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn label_codes_are_fixed() {
        assert_eq!(Label::Real.code(), 0);
        assert_eq!(Label::Fake.code(), 1);
    }

    #[test]
    fn group_assignment_is_total_and_periodic() {
        for p in 1u32..=50 {
            let g = StudyGroup::from_participant(p);
            assert!(StudyGroup::ALL.contains(&g));
            assert_eq!(g, StudyGroup::from_participant(p + GROUP_COUNT as u32));
        }
    }

    #[test]
    fn participant_four_lands_in_second_group() {
        assert_eq!(StudyGroup::from_participant(4), StudyGroup::ALL[1]);
    }

    #[test]
    fn group_wire_names_round_trip() {
        for g in StudyGroup::ALL {
            assert_eq!(StudyGroup::parse(g.as_str()), Some(g));
        }
        assert_eq!(StudyGroup::parse("4k_audio"), None);
    }
}
