pub mod error;
pub mod label;
pub mod resume;
pub mod sample;
pub mod session;

pub use error::StudyError;
pub use label::{Label, StudyGroup, TrialItem, GROUP_COUNT};
pub use resume::ResumeState;
pub use sample::sample_trials;
pub use session::{ParticipantSession, Phase, TrialOutcome};

use std::fs;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<(), StudyError> {
    fs::create_dir_all(path)?;
    Ok(())
}
