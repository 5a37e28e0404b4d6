use std::collections::BTreeMap;

use crate::error::StudyError;
use crate::label::StudyGroup;
use crate::session::Phase;

/// The scalar tuple that crosses a process restart. Everything else about a
/// session is re-derivable: the trial set from `(group, seed)` and the
/// outcomes from the local log keyed by `session_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeState {
    pub participant_id: u32,
    pub group: StudyGroup,
    pub current_index: usize,
    pub phase: Phase,
    pub seed: u64,
    pub session_id: String,
}

impl ResumeState {
    pub fn encode(&self) -> String {
        format!(
            "user={}&grp={}&i={}&phase={}&seed={}&sid={}",
            self.participant_id,
            self.group.as_str(),
            self.current_index,
            self.phase.as_str(),
            self.seed,
            self.session_id
        )
    }

    pub fn decode(raw: &str) -> Result<Self, StudyError> {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for pair in raw.trim().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| invalid(format!(
                "'{}' is not a key=value pair",
                pair
            )))?;
            fields.insert(key, value);
        }

        let participant_id = parse_u64(&fields, "user")? as u32;
        let group_raw = required(&fields, "grp")?;
        let group = StudyGroup::parse(group_raw)
            .ok_or_else(|| invalid(format!("unknown group '{}'", group_raw)))?;
        let current_index = parse_u64(&fields, "i")? as usize;
        let phase_raw = required(&fields, "phase")?;
        let phase = Phase::parse(phase_raw)
            .ok_or_else(|| invalid(format!("unknown phase '{}'", phase_raw)))?;
        let seed = parse_u64(&fields, "seed")?;
        let session_id = required(&fields, "sid")?.to_string();
        if session_id.is_empty() {
            return Err(invalid("sid is empty".to_string()));
        }

        Ok(ResumeState {
            participant_id,
            group,
            current_index,
            phase,
            seed,
            session_id,
        })
    }
}

fn invalid(detail: String) -> StudyError {
    StudyError::InvalidResumeState { detail }
}

fn required<'a>(fields: &BTreeMap<&str, &'a str>, key: &str) -> Result<&'a str, StudyError> {
    fields
        .get(key)
        .copied()
        .ok_or_else(|| invalid(format!("missing field '{}'", key)))
}

fn parse_u64(fields: &BTreeMap<&str, &str>, key: &str) -> Result<u64, StudyError> {
    let raw = required(fields, key)?;
    raw.parse::<u64>()
        .map_err(|_| invalid(format!("field '{}' is not an integer: '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ResumeState {
        ResumeState {
            participant_id: 4,
            group: StudyGroup::Hd1080Audio,
            current_index: 2,
            phase: Phase::AwaitingJudgment,
            seed: 42,
            session_id: "c0ffee".to_string(),
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let original = state();
        let decoded = ResumeState::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn encode_uses_the_boundary_key_names() {
        let encoded = state().encode();
        assert_eq!(
            encoded,
            "user=4&grp=1080p_audio&i=2&phase=voting&seed=42&sid=c0ffee"
        );
    }

    #[test]
    fn decode_tolerates_field_reordering() {
        let decoded =
            ResumeState::decode("sid=c0ffee&seed=42&phase=voting&i=2&grp=1080p_audio&user=4")
                .expect("decode");
        assert_eq!(decoded, state());
    }

    #[test]
    fn decode_rejects_missing_and_malformed_fields() {
        for raw in [
            "user=4&grp=1080p_audio&i=2&phase=voting&seed=42",
            "user=four&grp=1080p_audio&i=2&phase=voting&seed=42&sid=x",
            "user=4&grp=4k_hdr&i=2&phase=voting&seed=42&sid=x",
            "user=4&grp=1080p_audio&i=2&phase=paused&seed=42&sid=x",
            "user=4&grp=1080p_audio&i=2&phase=voting&seed=42&sid=",
            "not-parameters",
        ] {
            let err = ResumeState::decode(raw).expect_err(raw);
            assert!(
                err.to_string().contains("invalid_resume_state"),
                "unexpected error for '{}': {}",
                raw,
                err
            );
        }
    }
}
