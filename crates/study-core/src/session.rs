use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StudyError;
use crate::label::{Label, StudyGroup, TrialItem};
use crate::resume::ResumeState;

/// Trial phase. Only meaningful while the session is incomplete; the wire
/// names are the values carried in resume parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Presenting,
    AwaitingJudgment,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Presenting => "viewing",
            Phase::AwaitingJudgment => "voting",
        }
    }

    pub fn parse(value: &str) -> Option<Phase> {
        match value {
            "viewing" => Some(Phase::Presenting),
            "voting" => Some(Phase::AwaitingJudgment),
            _ => None,
        }
    }
}

/// The recorded result of one trial. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub trial_index: usize,
    pub locator: String,
    pub judgment: Label,
    pub truth: Label,
    pub correct: bool,
    pub recorded_at: DateTime<Utc>,
}

/// One participant's run through the trial sequence.
///
/// The identity fields (`participant_id`, `group`, `seed`, `session_id`,
/// `trial_set`) are fixed at creation. The cursor fields move strictly
/// forward: `Presenting(i)` -> `AwaitingJudgment(i)` -> `Presenting(i+1)`,
/// terminating when `current_index` reaches the trial count. Exactly one
/// outcome is appended per completed trial, so `outcomes.len() ==
/// current_index` holds after every transition.
#[derive(Clone, Debug)]
pub struct ParticipantSession {
    participant_id: u32,
    group: StudyGroup,
    seed: u64,
    session_id: String,
    trial_set: Vec<TrialItem>,
    current_index: usize,
    phase: Phase,
    outcomes: Vec<TrialOutcome>,
}

impl ParticipantSession {
    pub fn begin(
        participant_id: u32,
        group: StudyGroup,
        seed: u64,
        session_id: String,
        trial_set: Vec<TrialItem>,
    ) -> Self {
        Self {
            participant_id,
            group,
            seed,
            session_id,
            trial_set,
            current_index: 0,
            phase: Phase::Presenting,
            outcomes: Vec::new(),
        }
    }

    /// Rebuild a mid-flight session from its resume scalars, the re-derived
    /// trial set, and the outcomes rehydrated from the local log. The
    /// outcomes must line up with the front of the trial set; anything else
    /// means the caller re-derived with the wrong `(group, seed)`.
    pub fn restore(
        state: &ResumeState,
        trial_set: Vec<TrialItem>,
        outcomes: Vec<TrialOutcome>,
    ) -> Result<Self, StudyError> {
        if outcomes.len() > trial_set.len() {
            return Err(StudyError::InvalidResumeState {
                detail: format!(
                    "{} rehydrated outcomes exceed the {}-trial set",
                    outcomes.len(),
                    trial_set.len()
                ),
            });
        }
        for (idx, outcome) in outcomes.iter().enumerate() {
            if outcome.locator != trial_set[idx].locator {
                return Err(StudyError::InvalidResumeState {
                    detail: format!(
                        "outcome {} recorded {} but the re-derived trial set has {}",
                        idx, outcome.locator, trial_set[idx].locator
                    ),
                });
            }
        }
        let current_index = outcomes.len();
        let phase = if current_index == trial_set.len() {
            Phase::Presenting
        } else {
            state.phase
        };
        Ok(Self {
            participant_id: state.participant_id,
            group: state.group,
            seed: state.seed,
            session_id: state.session_id.clone(),
            trial_set,
            current_index,
            phase,
            outcomes,
        })
    }

    pub fn participant_id(&self) -> u32 {
        self.participant_id
    }

    pub fn group(&self) -> StudyGroup {
        self.group
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn trial_set(&self) -> &[TrialItem] {
        &self.trial_set
    }

    pub fn trial_count(&self) -> usize {
        self.trial_set.len()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn outcomes(&self) -> &[TrialOutcome] {
        &self.outcomes
    }

    pub fn is_complete(&self) -> bool {
        self.current_index == self.trial_set.len()
    }

    pub fn current_item(&self) -> Option<&TrialItem> {
        self.trial_set.get(self.current_index)
    }

    /// `Presenting(i)` -> `AwaitingJudgment(i)`. The caller resolves the
    /// viewing race (explicit signal vs. budget expiry) first; both triggers
    /// land here, and a second call for the same trial is rejected.
    pub fn finish_viewing(&mut self) -> Result<(), StudyError> {
        if self.is_complete() || self.phase != Phase::Presenting {
            return Err(StudyError::InvalidTransition {
                expected: "viewing",
                index: self.current_index,
            });
        }
        self.phase = Phase::AwaitingJudgment;
        Ok(())
    }

    /// `AwaitingJudgment(i)` -> `Presenting(i+1)` (or completion). Appends
    /// the single outcome for trial `i` and advances the cursor; once taken,
    /// the state has moved past trial `i`, so a duplicate submission for the
    /// same index fails the phase check.
    pub fn submit_judgment(
        &mut self,
        judgment: Label,
        recorded_at: DateTime<Utc>,
    ) -> Result<&TrialOutcome, StudyError> {
        if self.is_complete() || self.phase != Phase::AwaitingJudgment {
            return Err(StudyError::InvalidTransition {
                expected: "voting",
                index: self.current_index,
            });
        }
        let item = &self.trial_set[self.current_index];
        self.outcomes.push(TrialOutcome {
            trial_index: self.current_index,
            locator: item.locator.clone(),
            judgment,
            truth: item.label,
            correct: judgment == item.label,
            recorded_at,
        });
        self.current_index += 1;
        self.phase = Phase::Presenting;
        Ok(&self.outcomes[self.current_index - 1])
    }

    /// The scalar boundary state from which this session can be re-derived.
    pub fn resume_state(&self) -> ResumeState {
        ResumeState {
            participant_id: self.participant_id,
            group: self.group,
            current_index: self.current_index,
            phase: self.phase,
            seed: self.seed,
            session_id: self.session_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(locator: &str, label: Label) -> TrialItem {
        TrialItem {
            locator: locator.to_string(),
            group: StudyGroup::Sd720Audio,
            label,
        }
    }

    fn three_trial_session() -> ParticipantSession {
        ParticipantSession::begin(
            1,
            StudyGroup::Sd720Audio,
            7,
            "sid_test".to_string(),
            vec![
                item("a.mp4", Label::Real),
                item("b.mp4", Label::Fake),
                item("c.mp4", Label::Real),
            ],
        )
    }

    #[test]
    fn outcome_count_tracks_index_through_every_transition() {
        let mut session = three_trial_session();
        assert_eq!(session.phase(), Phase::Presenting);
        let mut last_index = 0;
        while !session.is_complete() {
            session.finish_viewing().expect("viewing done");
            assert_eq!(session.outcomes().len(), session.current_index());
            session
                .submit_judgment(Label::Real, Utc::now())
                .expect("judgment");
            assert_eq!(session.outcomes().len(), session.current_index());
            assert!(session.current_index() > last_index || session.is_complete());
            last_index = session.current_index();
        }
        assert_eq!(session.outcomes().len(), 3);
    }

    #[test]
    fn judgment_before_viewing_ends_is_rejected() {
        let mut session = three_trial_session();
        let err = session
            .submit_judgment(Label::Fake, Utc::now())
            .expect_err("still presenting");
        assert!(err.to_string().contains("invalid_transition"));
    }

    #[test]
    fn double_judgment_for_the_same_trial_is_rejected() {
        let mut session = three_trial_session();
        session.finish_viewing().expect("viewing done");
        session
            .submit_judgment(Label::Fake, Utc::now())
            .expect("first judgment");
        let err = session
            .submit_judgment(Label::Real, Utc::now())
            .expect_err("second judgment for trial 0");
        assert!(err.to_string().contains("invalid_transition"));
        assert_eq!(session.outcomes().len(), 1);
        assert_eq!(session.outcomes()[0].judgment, Label::Fake);
    }

    #[test]
    fn double_viewing_signal_is_rejected() {
        let mut session = three_trial_session();
        session.finish_viewing().expect("first signal");
        let err = session.finish_viewing().expect_err("timer lost the race");
        assert!(err.to_string().contains("invalid_transition"));
    }

    #[test]
    fn correctness_is_judgment_equals_truth() {
        let mut session = three_trial_session();
        session.finish_viewing().expect("viewing");
        let outcome = session
            .submit_judgment(Label::Fake, Utc::now())
            .expect("judgment");
        assert_eq!(outcome.truth, Label::Real);
        assert!(!outcome.correct);
    }

    #[test]
    fn completed_session_accepts_no_further_transitions() {
        let mut session = three_trial_session();
        for _ in 0..3 {
            session.finish_viewing().expect("viewing");
            session
                .submit_judgment(Label::Real, Utc::now())
                .expect("judgment");
        }
        assert!(session.is_complete());
        assert!(session.current_item().is_none());
        assert!(session.finish_viewing().is_err());
        assert!(session.submit_judgment(Label::Real, Utc::now()).is_err());
        assert_eq!(session.current_index(), 3);
    }

    #[test]
    fn restore_checks_outcomes_against_the_trial_set() {
        let mut live = three_trial_session();
        live.finish_viewing().expect("viewing");
        live.submit_judgment(Label::Real, Utc::now()).expect("judgment");
        let state = live.resume_state();

        let restored = ParticipantSession::restore(
            &state,
            live.trial_set().to_vec(),
            live.outcomes().to_vec(),
        )
        .expect("restore");
        assert_eq!(restored.current_index(), 1);
        assert_eq!(restored.phase(), Phase::Presenting);

        let mut wrong_order = live.trial_set().to_vec();
        wrong_order.swap(0, 2);
        let err = ParticipantSession::restore(&state, wrong_order, live.outcomes().to_vec())
            .expect_err("trial set mismatch");
        assert!(err.to_string().contains("invalid_resume_state"));
    }
}
