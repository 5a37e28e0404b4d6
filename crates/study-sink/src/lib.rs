use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use study_core::{ensure_dir, StudyError, StudyGroup, TrialOutcome};
use tracing::warn;

pub const OUTCOME_FIELDS: &str =
    "timestamp;participant;group;session_id;locator;judgment;truth;correct;mapped_judgment";

const FIELD_COUNT: usize = 9;

/// One persisted outcome row. Labels are carried as their wire strings here;
/// re-validation happens when rows are read back for scoring or rehydration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub timestamp: String,
    pub participant_id: u32,
    pub group: String,
    pub session_id: String,
    pub locator: String,
    pub judgment: String,
    pub truth: String,
    pub correct: u8,
    pub mapped_judgment: u8,
}

impl OutcomeRecord {
    pub fn from_outcome(
        participant_id: u32,
        group: StudyGroup,
        session_id: &str,
        outcome: &TrialOutcome,
    ) -> Self {
        Self {
            timestamp: outcome.recorded_at.to_rfc3339(),
            participant_id,
            group: group.as_str().to_string(),
            session_id: session_id.to_string(),
            locator: outcome.locator.clone(),
            judgment: outcome.judgment.as_str().to_string(),
            truth: outcome.truth.as_str().to_string(),
            correct: outcome.correct as u8,
            mapped_judgment: outcome.judgment.code(),
        }
    }

    fn to_line(&self) -> String {
        format!(
            "{};{};{};{};{};{};{};{};{}",
            self.timestamp,
            self.participant_id,
            self.group,
            self.session_id,
            self.locator,
            self.judgment,
            self.truth,
            self.correct,
            self.mapped_judgment
        )
    }

    fn parse_line(line: &str) -> Result<Self, StudyError> {
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() != FIELD_COUNT {
            return Err(StudyError::MalformedRecord {
                detail: format!("expected {} fields, got {}", FIELD_COUNT, fields.len()),
            });
        }
        let parse_num = |idx: usize, name: &str| -> Result<u32, StudyError> {
            fields[idx]
                .parse::<u32>()
                .map_err(|_| StudyError::MalformedRecord {
                    detail: format!("{} is not an integer: '{}'", name, fields[idx]),
                })
        };
        Ok(Self {
            timestamp: fields[0].to_string(),
            participant_id: parse_num(1, "participant")?,
            group: fields[2].to_string(),
            session_id: fields[3].to_string(),
            locator: fields[4].to_string(),
            judgment: fields[5].to_string(),
            truth: fields[6].to_string(),
            correct: parse_num(7, "correct")? as u8,
            mapped_judgment: parse_num(8, "mapped_judgment")? as u8,
        })
    }
}

/// Append-only local outcome log. One header line on creation, then one row
/// per completed trial; rows are never rewritten in place.
pub struct OutcomeLog {
    path: PathBuf,
}

impl OutcomeLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &OutcomeRecord) -> Result<(), StudyError> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let fresh = !self.path.exists();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if fresh {
            writeln!(file, "{}", OUTCOME_FIELDS)?;
        }
        writeln!(file, "{}", record.to_line())?;
        file.sync_all()?;
        Ok(())
    }

    /// All rows for one session, in append order. A torn or foreign line is
    /// skipped with a warning rather than poisoning the whole log.
    pub fn records_for_session(&self, session_id: &str) -> Result<Vec<OutcomeRecord>, StudyError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for line in data.lines().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            match OutcomeRecord::parse_line(line) {
                Ok(record) => {
                    if record.session_id == session_id {
                        records.push(record);
                    }
                }
                Err(e) => warn!("skipping unreadable outcome row: {}", e),
            }
        }
        Ok(records)
    }
}

/// The remote store contract. Any I/O failure surfaces as
/// `SinkUnavailable`; callers decide whether that degrades (assignment,
/// upload) or aborts.
pub trait WorksheetStore {
    fn count_distinct_participants(&self) -> Result<usize, StudyError>;
    fn session_present(&self, session_id: &str) -> Result<bool, StudyError>;
    fn append_records(&self, records: &[OutcomeRecord]) -> Result<(), StudyError>;
}

/// Worksheet-shaped delimited file standing in for the study's shared
/// spreadsheet. Same row format as the local log.
pub struct CsvWorksheet {
    path: PathBuf,
}

impl CsvWorksheet {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_rows(&self) -> Result<Vec<OutcomeRecord>, StudyError> {
        if !self.path.exists() {
            let parent_ok = self
                .path
                .parent()
                .map(|p| p.as_os_str().is_empty() || p.exists())
                .unwrap_or(true);
            if parent_ok {
                return Ok(Vec::new());
            }
            return Err(StudyError::SinkUnavailable {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("worksheet location missing: {}", self.path.display()),
                ),
            });
        }
        let data = fs::read_to_string(&self.path)
            .map_err(|source| StudyError::SinkUnavailable { source })?;
        let mut rows = Vec::new();
        for line in data.lines().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            match OutcomeRecord::parse_line(line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!("skipping unreadable worksheet row: {}", e),
            }
        }
        Ok(rows)
    }
}

impl WorksheetStore for CsvWorksheet {
    fn count_distinct_participants(&self) -> Result<usize, StudyError> {
        let rows = self.read_rows()?;
        let distinct: BTreeSet<u32> = rows.iter().map(|r| r.participant_id).collect();
        Ok(distinct.len())
    }

    fn session_present(&self, session_id: &str) -> Result<bool, StudyError> {
        let rows = self.read_rows()?;
        Ok(rows.iter().any(|r| r.session_id == session_id))
    }

    fn append_records(&self, records: &[OutcomeRecord]) -> Result<(), StudyError> {
        let fresh = !self.path.exists();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| StudyError::SinkUnavailable { source })?;
        let mut buffer = String::new();
        if fresh {
            buffer.push_str(OUTCOME_FIELDS);
            buffer.push('\n');
        }
        for record in records {
            buffer.push_str(&record.to_line());
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|source| StudyError::SinkUnavailable { source })?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadStatus {
    Uploaded,
    AlreadyPresent,
}

/// At-most-once upload per session id: presence in the store is checked
/// before writing, so retries and duplicate invocations are no-ops.
pub fn upload_session(
    store: &dyn WorksheetStore,
    session_id: &str,
    records: &[OutcomeRecord],
) -> Result<UploadStatus, StudyError> {
    if store.session_present(session_id)? {
        warn!("session {} already uploaded, skipping", session_id);
        return Ok(UploadStatus::AlreadyPresent);
    }
    store.append_records(records)?;
    Ok(UploadStatus::Uploaded)
}

/// One researcher summary per completed session. The AUC column stays empty
/// when the statistic is not applicable.
pub fn write_summary(
    dir: &Path,
    participant_id: u32,
    group: StudyGroup,
    accuracy: f64,
    auc: Option<f64>,
) -> Result<PathBuf, StudyError> {
    ensure_dir(dir)?;
    let path = dir.join(format!(
        "summary_{}_{}.csv",
        participant_id,
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    let auc_cell = auc.map(|v| v.to_string()).unwrap_or_default();
    let content = format!(
        "participant;group;accuracy;auc\n{};{};{};{}\n",
        participant_id,
        group.as_str(),
        accuracy,
        auc_cell
    );
    fs::write(&path, content)?;
    Ok(path)
}
