use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StudyError {
    #[error("catalog_unavailable: cannot read {path}: {source}")]
    CatalogUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no_items_for_group: catalog has no items for group {group}")]
    NoItemsForGroup { group: String },

    #[error("label_mismatch: '{value}' is not one of real|fake")]
    LabelMismatch { value: String },

    #[error("sink_unavailable: {source}")]
    SinkUnavailable {
        #[source]
        source: std::io::Error,
    },

    #[error("invalid_transition: expected phase {expected} at trial index {index}")]
    InvalidTransition { expected: &'static str, index: usize },

    #[error("no_outcomes: scoring requires at least one completed trial")]
    NoOutcomes,

    #[error("invalid_resume_state: {detail}")]
    InvalidResumeState { detail: String },

    #[error("malformed_record: {detail}")]
    MalformedRecord { detail: String },

    #[error("storage: {source}")]
    Storage {
        #[from]
        source: std::io::Error,
    },
}
