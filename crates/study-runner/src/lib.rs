use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use study_analysis::{score_labels, score_outcomes, session_report, write_report, SessionScore};
use study_core::{
    ensure_dir, sample_trials, Label, ParticipantSession, Phase, ResumeState, StudyError,
    StudyGroup, TrialItem, TrialOutcome,
};
use study_sink::{upload_session, write_summary, OutcomeLog, OutcomeRecord, UploadStatus, WorksheetStore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Sentinel participant id used when the worksheet store cannot be reached
/// for counting. Degraded but non-fatal; collisions across degraded sessions
/// are possible and accepted (records stay keyed by session id).
pub const FALLBACK_PARTICIPANT_ID: u32 = 999;

// ---------------------------------------------------------------------------
// Study definition
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StudyDefinition {
    pub study: StudySection,
    pub catalog: CatalogSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub design: DesignSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StudySection {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogSection {
    pub manifest: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub worksheet: Option<PathBuf>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            worksheet: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("study_data")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DesignSection {
    #[serde(default = "default_trials_per_session")]
    pub trials_per_session: usize,
    #[serde(default = "default_viewing_seconds")]
    pub viewing_seconds: u64,
}

impl Default for DesignSection {
    fn default() -> Self {
        Self {
            trials_per_session: default_trials_per_session(),
            viewing_seconds: default_viewing_seconds(),
        }
    }
}

fn default_trials_per_session() -> usize {
    5
}

fn default_viewing_seconds() -> u64 {
    20
}

impl StudyDefinition {
    pub fn outcome_log_path(&self) -> PathBuf {
        self.storage.data_dir.join("results.csv")
    }

    pub fn worksheet_path(&self) -> PathBuf {
        self.storage
            .worksheet
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("worksheet.csv"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.storage.data_dir.join("sessions")
    }

    pub fn viewing_budget(&self) -> Duration {
        Duration::from_secs(self.design.viewing_seconds)
    }
}

pub fn load_definition(path: &Path) -> Result<StudyDefinition> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read study definition {}: {}", path.display(), e))?;
    let mut def: StudyDefinition = serde_yaml::from_str(&raw)?;
    let base = path.parent().unwrap_or(Path::new("."));
    def.catalog.manifest = resolve_against(base, &def.catalog.manifest);
    def.storage.data_dir = resolve_against(base, &def.storage.data_dir);
    if let Some(worksheet) = def.storage.worksheet.take() {
        def.storage.worksheet = Some(resolve_against(base, &worksheet));
    }
    validate_definition(&def)?;
    Ok(def)
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn validate_definition(def: &StudyDefinition) -> Result<()> {
    let mut problems = Vec::new();
    if def.study.id.trim().is_empty() {
        problems.push("study.id must not be empty");
    }
    if def.catalog.manifest.as_os_str().is_empty() {
        problems.push("catalog.manifest must not be empty");
    }
    if def.design.trials_per_session == 0 {
        problems.push("design.trials_per_session must be at least 1");
    }
    if def.design.viewing_seconds == 0 {
        problems.push("design.viewing_seconds must be at least 1");
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "study definition invalid:\n{}",
            problems
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Opaque supplier of trial items. The on-disk discovery convention lives
/// behind this seam.
pub trait CatalogProvider {
    fn list_items(&self) -> Result<Vec<TrialItem>, StudyError>;
}

/// JSONL clip manifest: one `{"locator","group","label"}` object per line.
/// Lines that match no known group or label convention are skipped; an
/// unreadable manifest is fatal to session start.
pub struct ManifestCatalog {
    path: PathBuf,
}

impl ManifestCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CatalogProvider for ManifestCatalog {
    fn list_items(&self) -> Result<Vec<TrialItem>, StudyError> {
        let data = fs::read_to_string(&self.path).map_err(|source| {
            StudyError::CatalogUnavailable {
                path: self.path.clone(),
                source,
            }
        })?;
        let mut items = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!("clip manifest line {}: not valid JSON: {}", lineno + 1, e);
                    continue;
                }
            };
            let locator = value.get("locator").and_then(|v| v.as_str());
            let group_raw = value.get("group").and_then(|v| v.as_str());
            let label_raw = value.get("label").and_then(|v| v.as_str());
            let (locator, group_raw, label_raw) = match (locator, group_raw, label_raw) {
                (Some(l), Some(g), Some(t)) => (l, g, t),
                _ => {
                    warn!("clip manifest line {}: missing locator/group/label", lineno + 1);
                    continue;
                }
            };
            let group = match StudyGroup::parse(group_raw) {
                Some(g) => g,
                None => {
                    debug!("clip manifest line {}: unknown group '{}'", lineno + 1, group_raw);
                    continue;
                }
            };
            let label = match Label::parse(label_raw) {
                Ok(l) => l,
                Err(_) => {
                    debug!("clip manifest line {}: unknown label '{}'", lineno + 1, label_raw);
                    continue;
                }
            };
            items.push(TrialItem {
                locator: locator.to_string(),
                group,
                label,
            });
        }
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn canonical_digest(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
}

fn session_state_path(session_dir: &Path) -> PathBuf {
    session_dir.join("session_state.json")
}

fn write_session_state(session_dir: &Path, state: &ResumeState, status: &str) -> Result<()> {
    let payload = json!({
        "schema_version": "session_state_v1",
        "status": status,
        "participant": state.participant_id,
        "group": state.group.as_str(),
        "trial_index": state.current_index,
        "phase": state.phase.as_str(),
        "seed": state.seed,
        "session_id": state.session_id,
        "resume": state.encode(),
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&session_state_path(session_dir), &payload)
}

/// Resume parameters recorded in a session's state file, for resuming by
/// session id instead of pasting the encoded scalars back.
pub fn stored_resume_params(sessions_dir: &Path, session_id: &str) -> Result<String> {
    let path = session_state_path(&sessions_dir.join(session_id));
    let bytes = fs::read(&path)
        .map_err(|e| anyhow!("no stored state for session {}: {}", session_id, e))?;
    let state: Value = serde_json::from_slice(&bytes)?;
    state
        .pointer("/resume")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("session state for {} has no resume field", session_id))
}

struct SessionStateGuard {
    session_dir: PathBuf,
    state: ResumeState,
    done: bool,
}

impl SessionStateGuard {
    fn new(session_dir: &Path, state: ResumeState) -> Self {
        Self {
            session_dir: session_dir.to_path_buf(),
            state,
            done: false,
        }
    }

    fn update(&mut self, state: ResumeState) {
        self.state = state;
    }

    fn complete(&mut self, status: &str) -> Result<()> {
        write_session_state(&self.session_dir, &self.state, status)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for SessionStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_session_state(&self.session_dir, &self.state, "interrupted");
        }
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SessionStart {
    pub session: ParticipantSession,
    pub session_dir: PathBuf,
    pub degraded_assignment: bool,
}

pub fn begin_session(
    def: &StudyDefinition,
    catalog: &dyn CatalogProvider,
    store: &dyn WorksheetStore,
) -> Result<SessionStart> {
    let seed = Utc::now().timestamp() as u64;
    let session_id = Uuid::new_v4().simple().to_string();
    begin_session_with(def, catalog, store, seed, session_id)
}

pub fn begin_session_with(
    def: &StudyDefinition,
    catalog: &dyn CatalogProvider,
    store: &dyn WorksheetStore,
    seed: u64,
    session_id: String,
) -> Result<SessionStart> {
    let items = catalog.list_items()?;
    let (participant_id, degraded_assignment) = match store.count_distinct_participants() {
        Ok(count) => (count as u32 + 1, false),
        Err(e @ StudyError::SinkUnavailable { .. }) => {
            warn!(
                "participant counter unavailable ({}), falling back to sentinel id {}",
                e, FALLBACK_PARTICIPANT_ID
            );
            (FALLBACK_PARTICIPANT_ID, true)
        }
        Err(e) => return Err(e.into()),
    };
    let group = StudyGroup::from_participant(participant_id);
    let trial_set = sample_trials(&items, group, seed, def.design.trials_per_session)?;
    let session = ParticipantSession::begin(participant_id, group, seed, session_id, trial_set);

    let session_dir = def.sessions_dir().join(session.session_id());
    ensure_dir(&session_dir)?;
    let resolved = serde_json::to_value(def)?;
    atomic_write_json_pretty(&session_dir.join("resolved_study.json"), &resolved)?;
    atomic_write_bytes(
        &session_dir.join("resolved_study.digest"),
        canonical_digest(&resolved)?.as_bytes(),
    )?;
    write_session_state(&session_dir, &session.resume_state(), "running")?;

    Ok(SessionStart {
        session,
        session_dir,
        degraded_assignment,
    })
}

/// Rebuild an interrupted session from its encoded scalar state: re-derive
/// the trial set from `(group, seed)` and rehydrate completed outcomes from
/// the local log. Pure re-derivation, no checkpoint replay.
pub fn resume_session(
    def: &StudyDefinition,
    catalog: &dyn CatalogProvider,
    raw_params: &str,
    log: &OutcomeLog,
) -> Result<SessionStart> {
    let state = ResumeState::decode(raw_params)?;
    let items = catalog.list_items()?;
    let trial_set = sample_trials(&items, state.group, state.seed, def.design.trials_per_session)?;

    let rows = log.records_for_session(&state.session_id)?;
    let mut outcomes = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let judgment = Label::parse(&row.judgment)?;
        let truth = Label::parse(&row.truth)?;
        let recorded_at: DateTime<Utc> = row
            .timestamp
            .parse()
            .map_err(|_| StudyError::MalformedRecord {
                detail: format!("bad timestamp '{}' in logged outcome {}", row.timestamp, idx),
            })?;
        outcomes.push(TrialOutcome {
            trial_index: idx,
            locator: row.locator.clone(),
            judgment,
            truth,
            correct: judgment == truth,
            recorded_at,
        });
    }
    if outcomes.len() != state.current_index {
        warn!(
            "resume index {} disagrees with {} logged outcomes; trusting the log",
            state.current_index,
            outcomes.len()
        );
    }
    let session = ParticipantSession::restore(&state, trial_set, outcomes)?;

    let session_dir = def.sessions_dir().join(session.session_id());
    ensure_dir(&session_dir)?;
    write_session_state(&session_dir, &session.resume_state(), "running")?;

    Ok(SessionStart {
        session,
        session_dir,
        degraded_assignment: false,
    })
}

/// How one viewing phase ended: the participant's explicit signal, or the
/// expiry of the viewing budget. Both trigger the same transition; whichever
/// loses the race is discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewingEnd {
    Signaled,
    Expired,
}

/// Resolve the viewing race: block until the done-signal arrives or the
/// budget elapses. A dropped sender cannot end viewing early; the budget
/// still runs out on the clock.
pub fn await_viewing_end<T>(signal: &mpsc::Receiver<T>, budget: Duration) -> ViewingEnd {
    let deadline = Instant::now() + budget;
    let remaining = deadline.saturating_duration_since(Instant::now());
    match signal.recv_timeout(remaining) {
        Ok(_) => ViewingEnd::Signaled,
        Err(mpsc::RecvTimeoutError::Timeout) => ViewingEnd::Expired,
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            thread::sleep(deadline.saturating_duration_since(Instant::now()));
            ViewingEnd::Expired
        }
    }
}

/// The participant-facing layer, narrowed to the two interactions the state
/// machine needs. The console implementation lives in the CLI; tests script
/// it.
pub trait StudyInterface {
    fn present(
        &mut self,
        trial_no: usize,
        total: usize,
        item: &TrialItem,
        budget: Duration,
    ) -> Result<ViewingEnd>;

    fn collect_judgment(&mut self, trial_no: usize) -> Result<Label>;
}

#[derive(Debug)]
pub struct CompletedSession {
    pub score: SessionScore,
    pub report_path: PathBuf,
    pub summary_path: Option<PathBuf>,
    pub upload: Option<UploadStatus>,
}

/// Drive the session to completion. Each judgment appends the outcome, then
/// persists it; a failed local append or remote upload is reported and never
/// rolls the state machine back, so the in-memory outcomes remain the
/// authoritative input to scoring.
pub fn run_session(
    def: &StudyDefinition,
    session: &mut ParticipantSession,
    session_dir: &Path,
    interface: &mut dyn StudyInterface,
    log: &OutcomeLog,
    store: &dyn WorksheetStore,
) -> Result<CompletedSession> {
    let mut guard = SessionStateGuard::new(session_dir, session.resume_state());
    let total = session.trial_count();
    let budget = def.viewing_budget();

    while !session.is_complete() {
        let trial_no = session.current_index() + 1;
        if session.phase() == Phase::Presenting {
            let item = session
                .current_item()
                .cloned()
                .ok_or_else(|| anyhow!("session_corrupt: no item at index {}", session.current_index()))?;
            interface.present(trial_no, total, &item, budget)?;
            session.finish_viewing()?;
            guard.update(session.resume_state());
            if let Err(e) = write_session_state(session_dir, &session.resume_state(), "running") {
                warn!("session state write failed: {}", e);
            }
        }

        let judgment = interface.collect_judgment(trial_no)?;
        let outcome = session.submit_judgment(judgment, Utc::now())?.clone();
        let record = OutcomeRecord::from_outcome(
            session.participant_id(),
            session.group(),
            session.session_id(),
            &outcome,
        );
        if let Err(e) = log.append(&record) {
            warn!("outcome persist failed at trial {}: {}", outcome.trial_index, e);
        }
        guard.update(session.resume_state());
        if let Err(e) = write_session_state(session_dir, &session.resume_state(), "running") {
            warn!("session state write failed: {}", e);
        }
    }

    let score = score_outcomes(session.outcomes())?;
    let report = session_report(
        session.session_id(),
        session.participant_id(),
        session.group(),
        &score,
    );
    let report_path = write_report(session_dir, &report)?;

    let records: Vec<OutcomeRecord> = session
        .outcomes()
        .iter()
        .map(|o| {
            OutcomeRecord::from_outcome(
                session.participant_id(),
                session.group(),
                session.session_id(),
                o,
            )
        })
        .collect();
    let upload = match upload_session(store, session.session_id(), &records) {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("session upload failed: {}", e);
            None
        }
    };
    let summary_path = match write_summary(
        &def.storage.data_dir,
        session.participant_id(),
        session.group(),
        score.accuracy,
        score.auc,
    ) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("summary write failed: {}", e);
            None
        }
    };

    guard.complete("completed")?;
    Ok(CompletedSession {
        score,
        report_path,
        summary_path,
        upload,
    })
}

/// Recompute statistics for a session from the persisted log. Labels are
/// re-validated here and fail closed on anything outside the closed set.
pub fn score_session_from_log(log: &OutcomeLog, session_id: &str) -> Result<SessionScore> {
    let rows = log.records_for_session(session_id)?;
    let pairs: Vec<(&str, &str)> = rows
        .iter()
        .map(|r| (r.truth.as_str(), r.judgment.as_str()))
        .collect();
    Ok(score_labels(&pairs)?)
}

// ---------------------------------------------------------------------------
// Describe
// ---------------------------------------------------------------------------

pub struct StudySummary {
    pub study_id: String,
    pub title: String,
    pub manifest: PathBuf,
    pub data_dir: PathBuf,
    pub trials_per_session: usize,
    pub viewing_seconds: u64,
    pub total_items: usize,
    pub group_counts: Vec<(String, usize)>,
}

pub fn describe_study(
    def: &StudyDefinition,
    catalog: &dyn CatalogProvider,
) -> Result<StudySummary> {
    let items = catalog.list_items()?;
    let group_counts = StudyGroup::ALL
        .iter()
        .map(|g| {
            (
                g.as_str().to_string(),
                items.iter().filter(|it| it.group == *g).count(),
            )
        })
        .collect();
    Ok(StudySummary {
        study_id: def.study.id.clone(),
        title: def.study.title.clone(),
        manifest: def.catalog.manifest.clone(),
        data_dir: def.storage.data_dir.clone(),
        trials_per_session: def.design.trials_per_session,
        viewing_seconds: def.design.viewing_seconds,
        total_items: items.len(),
        group_counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use study_sink::CsvWorksheet;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "study_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    fn write_manifest(dir: &Path, per_group: usize) -> PathBuf {
        let path = dir.join("clips.jsonl");
        let mut lines = Vec::new();
        for group in StudyGroup::ALL {
            for i in 0..per_group {
                let label = if i % 2 == 0 { "real" } else { "fake" };
                lines.push(format!(
                    r#"{{"locator":"{}/clip_{:03}.mp4","group":"{}","label":"{}"}}"#,
                    group.as_str(),
                    i,
                    group.as_str(),
                    label
                ));
            }
        }
        fs::write(&path, lines.join("\n")).expect("manifest");
        path
    }

    fn definition(dir: &Path, manifest: PathBuf) -> StudyDefinition {
        StudyDefinition {
            study: StudySection {
                id: "clip_screening".to_string(),
                title: "Clip screening".to_string(),
            },
            catalog: CatalogSection { manifest },
            storage: StorageSection {
                data_dir: dir.join("study_data"),
                worksheet: None,
            },
            design: DesignSection {
                trials_per_session: 5,
                viewing_seconds: 20,
            },
        }
    }

    struct ScriptedInterface {
        judgments: VecDeque<Label>,
    }

    impl ScriptedInterface {
        fn new(judgments: &[Label]) -> Self {
            Self {
                judgments: judgments.iter().copied().collect(),
            }
        }
    }

    impl StudyInterface for ScriptedInterface {
        fn present(
            &mut self,
            _trial_no: usize,
            _total: usize,
            _item: &TrialItem,
            _budget: Duration,
        ) -> Result<ViewingEnd> {
            Ok(ViewingEnd::Signaled)
        }

        fn collect_judgment(&mut self, _trial_no: usize) -> Result<Label> {
            self.judgments
                .pop_front()
                .ok_or_else(|| anyhow!("script exhausted"))
        }
    }

    #[test]
    fn manifest_catalog_skips_unknown_conventions() {
        let dir = temp_dir("catalog");
        let path = dir.join("clips.jsonl");
        fs::write(
            &path,
            [
                r#"{"locator":"a.mp4","group":"720p_audio","label":"real"}"#,
                r#"{"locator":"b.mp4","group":"4k_hdr","label":"real"}"#,
                r#"{"locator":"c.mp4","group":"720p_audio","label":"genuine"}"#,
                "not json",
                "",
                r#"{"locator":"d.mp4","group":"720p_silent","label":"fake"}"#,
            ]
            .join("\n"),
        )
        .expect("manifest");

        let items = ManifestCatalog::new(path).list_items().expect("items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].locator, "a.mp4");
        assert_eq!(items[1].locator, "d.mp4");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unreadable_manifest_is_catalog_unavailable() {
        let dir = temp_dir("catalog_missing");
        let err = ManifestCatalog::new(dir.join("nope.jsonl"))
            .list_items()
            .expect_err("missing manifest");
        assert!(
            err.to_string().contains("catalog_unavailable"),
            "unexpected error: {}",
            err
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn definition_validation_reports_every_problem() {
        let def = StudyDefinition {
            study: StudySection {
                id: "".to_string(),
                title: "".to_string(),
            },
            catalog: CatalogSection {
                manifest: PathBuf::new(),
            },
            storage: StorageSection::default(),
            design: DesignSection {
                trials_per_session: 0,
                viewing_seconds: 0,
            },
        };
        let err = validate_definition(&def).expect_err("invalid definition");
        let msg = err.to_string();
        assert!(msg.contains("study.id"), "missing study.id: {}", msg);
        assert!(msg.contains("catalog.manifest"), "missing manifest: {}", msg);
        assert!(
            msg.contains("design.trials_per_session"),
            "missing trials: {}",
            msg
        );
        assert!(
            msg.contains("design.viewing_seconds"),
            "missing viewing budget: {}",
            msg
        );
    }

    #[test]
    fn definition_defaults_follow_the_study_design() {
        let dir = temp_dir("defaults");
        let path = dir.join("study.yaml");
        fs::write(
            &path,
            "study:\n  id: clip_screening\ncatalog:\n  manifest: clips.jsonl\n",
        )
        .expect("study.yaml");
        fs::write(dir.join("clips.jsonl"), "").expect("manifest");
        let def = load_definition(&path).expect("load");
        assert_eq!(def.design.trials_per_session, 5);
        assert_eq!(def.design.viewing_seconds, 20);
        assert_eq!(def.catalog.manifest, dir.join("clips.jsonl"));
        assert_eq!(def.storage.data_dir, dir.join("study_data"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn begin_session_assigns_group_from_the_store_count() {
        let dir = temp_dir("begin");
        let manifest = write_manifest(&dir, 8);
        let def = definition(&dir, manifest);
        ensure_dir(&def.storage.data_dir).expect("data dir");
        let store = CsvWorksheet::new(def.worksheet_path());
        let catalog = ManifestCatalog::new(def.catalog.manifest.clone());

        let start = begin_session_with(&def, &catalog, &store, 42, "sid_begin".to_string())
            .expect("begin");
        // Empty store counts zero participants, so this is participant 1.
        assert_eq!(start.session.participant_id(), 1);
        assert_eq!(start.session.group(), StudyGroup::from_participant(1));
        assert_eq!(start.session.trial_count(), 5);
        assert!(!start.degraded_assignment);
        assert!(session_state_path(&start.session_dir).exists());
        assert!(start.session_dir.join("resolved_study.json").exists());
        assert!(start.session_dir.join("resolved_study.digest").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unavailable_store_degrades_to_the_sentinel_id() {
        let dir = temp_dir("sentinel");
        let manifest = write_manifest(&dir, 8);
        let mut def = definition(&dir, manifest);
        def.storage.worksheet = Some(dir.join("no_such_dir").join("worksheet.csv"));
        ensure_dir(&def.storage.data_dir).expect("data dir");
        let store = CsvWorksheet::new(def.worksheet_path());
        let catalog = ManifestCatalog::new(def.catalog.manifest.clone());

        let start = begin_session_with(&def, &catalog, &store, 7, "sid_degraded".to_string())
            .expect("begin degrades, not fails");
        assert_eq!(start.session.participant_id(), FALLBACK_PARTICIPANT_ID);
        assert!(start.degraded_assignment);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_group_pool_stops_the_session_before_any_trial() {
        let dir = temp_dir("empty_group");
        // Manifest with items only for the first group; participant 1 maps to
        // the second.
        let path = dir.join("clips.jsonl");
        fs::write(
            &path,
            r#"{"locator":"a.mp4","group":"720p_audio","label":"real"}"#,
        )
        .expect("manifest");
        let def = definition(&dir, path);
        ensure_dir(&def.storage.data_dir).expect("data dir");
        let store = CsvWorksheet::new(def.worksheet_path());
        let catalog = ManifestCatalog::new(def.catalog.manifest.clone());

        let err = begin_session_with(&def, &catalog, &store, 1, "sid_none".to_string())
            .expect_err("no items for group");
        assert!(
            err.to_string().contains("no_items_for_group"),
            "unexpected error: {}",
            err
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn scripted_session_runs_to_completion_with_artifacts() {
        let dir = temp_dir("run");
        let manifest = write_manifest(&dir, 8);
        let def = definition(&dir, manifest);
        ensure_dir(&def.storage.data_dir).expect("data dir");
        let store = CsvWorksheet::new(def.worksheet_path());
        let catalog = ManifestCatalog::new(def.catalog.manifest.clone());
        let log = OutcomeLog::new(def.outcome_log_path());

        let mut start = begin_session_with(&def, &catalog, &store, 42, "sid_run".to_string())
            .expect("begin");
        let mut interface = ScriptedInterface::new(&[Label::Real; 5]);
        let completed = run_session(
            &def,
            &mut start.session,
            &start.session_dir,
            &mut interface,
            &log,
            &store,
        )
        .expect("run");

        assert!(start.session.is_complete());
        assert_eq!(start.session.outcomes().len(), 5);
        assert_eq!(completed.score.trials, 5);
        assert_eq!(completed.upload, Some(UploadStatus::Uploaded));
        assert!(completed.report_path.exists());
        assert!(completed.summary_path.expect("summary").exists());
        assert_eq!(log.records_for_session("sid_run").expect("log").len(), 5);

        let state: Value = serde_json::from_slice(
            &fs::read(session_state_path(&start.session_dir)).expect("state"),
        )
        .expect("json");
        assert_eq!(
            state.pointer("/status").and_then(|v| v.as_str()),
            Some("completed")
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn resume_re_derives_the_identical_trial_set() {
        let dir = temp_dir("resume");
        let manifest = write_manifest(&dir, 8);
        let def = definition(&dir, manifest);
        ensure_dir(&def.storage.data_dir).expect("data dir");
        let store = CsvWorksheet::new(def.worksheet_path());
        let catalog = ManifestCatalog::new(def.catalog.manifest.clone());
        let log = OutcomeLog::new(def.outcome_log_path());

        let mut start = begin_session_with(&def, &catalog, &store, 42, "sid_resume".to_string())
            .expect("begin");
        let original_set = start.session.trial_set().to_vec();

        // Two completed trials, persisted the way the runner persists them.
        for judgment in [Label::Real, Label::Fake] {
            start.session.finish_viewing().expect("viewing");
            let outcome = start
                .session
                .submit_judgment(judgment, Utc::now())
                .expect("judgment")
                .clone();
            log.append(&OutcomeRecord::from_outcome(
                start.session.participant_id(),
                start.session.group(),
                start.session.session_id(),
                &outcome,
            ))
            .expect("append");
        }
        let params = start.session.resume_state().encode();
        drop(start);

        let resumed = resume_session(&def, &catalog, &params, &log).expect("resume");
        assert_eq!(resumed.session.trial_set(), original_set.as_slice());
        assert_eq!(resumed.session.current_index(), 2);
        assert_eq!(resumed.session.phase(), Phase::Presenting);
        assert_eq!(resumed.session.outcomes().len(), 2);
        assert_eq!(resumed.session.outcomes()[1].judgment, Label::Fake);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn scoring_from_the_log_fails_closed_on_foreign_labels() {
        let dir = temp_dir("score_log");
        let log = OutcomeLog::new(dir.join("results.csv"));
        let outcome = TrialOutcome {
            trial_index: 0,
            locator: "a.mp4".to_string(),
            judgment: Label::Real,
            truth: Label::Real,
            correct: true,
            recorded_at: Utc::now(),
        };
        log.append(&OutcomeRecord::from_outcome(
            1,
            StudyGroup::Sd720Audio,
            "sid_score",
            &outcome,
        ))
        .expect("append");
        let score = score_session_from_log(&log, "sid_score").expect("score");
        assert_eq!(score.trials, 1);

        // Hand-write a row with a label outside the closed set.
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .expect("reopen");
        writeln!(
            file,
            "2026-01-01T00:00:00+00:00;1;720p_audio;sid_score;b.mp4;genuine;real;0;0"
        )
        .expect("bad row");
        let err = score_session_from_log(&log, "sid_score").expect_err("label mismatch");
        assert!(
            err.to_string().contains("label_mismatch"),
            "unexpected error: {}",
            err
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn viewing_race_resolves_to_whichever_fires_first() {
        let (tx, rx) = mpsc::channel::<()>();
        tx.send(()).expect("signal");
        assert_eq!(
            await_viewing_end(&rx, Duration::from_millis(200)),
            ViewingEnd::Signaled
        );

        let (_tx2, rx2) = mpsc::channel::<()>();
        let started = Instant::now();
        assert_eq!(
            await_viewing_end(&rx2, Duration::from_millis(50)),
            ViewingEnd::Expired
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn dropped_signal_sender_still_waits_out_the_budget() {
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        let started = Instant::now();
        assert_eq!(
            await_viewing_end(&rx, Duration::from_millis(60)),
            ViewingEnd::Expired
        );
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn interrupted_sessions_leave_a_resumable_state_file() {
        let dir = temp_dir("interrupt");
        let manifest = write_manifest(&dir, 8);
        let def = definition(&dir, manifest);
        ensure_dir(&def.storage.data_dir).expect("data dir");
        let store = CsvWorksheet::new(def.worksheet_path());
        let catalog = ManifestCatalog::new(def.catalog.manifest.clone());
        let log = OutcomeLog::new(def.outcome_log_path());

        let mut start = begin_session_with(&def, &catalog, &store, 9, "sid_int".to_string())
            .expect("begin");
        // Script runs dry after one judgment, aborting the run mid-session.
        let mut interface = ScriptedInterface::new(&[Label::Fake]);
        let err = run_session(
            &def,
            &mut start.session,
            &start.session_dir,
            &mut interface,
            &log,
            &store,
        )
        .expect_err("script exhausted");
        assert!(err.to_string().contains("script exhausted"));

        let state: Value = serde_json::from_slice(
            &fs::read(session_state_path(&start.session_dir)).expect("state"),
        )
        .expect("json");
        assert_eq!(
            state.pointer("/status").and_then(|v| v.as_str()),
            Some("interrupted")
        );
        let params = stored_resume_params(&def.sessions_dir(), "sid_int").expect("params");
        let resumed = resume_session(&def, &catalog, &params, &log).expect("resume");
        assert_eq!(resumed.session.current_index(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn describe_counts_items_per_group() {
        let dir = temp_dir("describe");
        let manifest = write_manifest(&dir, 4);
        let def = definition(&dir, manifest);
        let catalog = ManifestCatalog::new(def.catalog.manifest.clone());
        let summary = describe_study(&def, &catalog).expect("describe");
        assert_eq!(summary.total_items, 12);
        assert_eq!(summary.trials_per_session, 5);
        for (_, count) in &summary.group_counts {
            assert_eq!(*count, 4);
        }
        let _ = fs::remove_dir_all(dir);
    }
}
