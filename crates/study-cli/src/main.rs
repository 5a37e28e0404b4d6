use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use study_analysis::SessionScore;
use study_core::{Label, TrialItem};
use study_runner::{
    await_viewing_end, begin_session, describe_study, load_definition, resume_session,
    run_session, score_session_from_log, stored_resume_params, CompletedSession, ManifestCatalog,
    SessionStart, StudyDefinition, StudyInterface, StudySummary, ViewingEnd,
};
use study_sink::{CsvWorksheet, OutcomeLog, UploadStatus};

#[derive(Parser)]
#[command(name = "study", version = "0.1.0", about = "Perceptual study session runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new participant session and drive it on the console.
    Run {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Continue an interrupted session from its resume parameters.
    Resume {
        study: PathBuf,
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Validate the study definition and summarize the clip catalog.
    Describe {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Recompute statistics for a session from the persisted outcome log.
    Score {
        study: PathBuf,
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter study.yaml and clip manifest.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Remove per-session state directories.
    Clean {
        study: PathBuf,
        #[arg(long)]
        sessions: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { study, json } => {
            let def = load_definition(&study)?;
            let catalog = ManifestCatalog::new(def.catalog.manifest.clone());
            let store = CsvWorksheet::new(def.worksheet_path());
            let start = begin_session(&def, &catalog, &store)?;
            return drive_session(&def, start, &store, json, "run");
        }
        Commands::Resume {
            study,
            params,
            session_id,
            json,
        } => {
            let def = load_definition(&study)?;
            let catalog = ManifestCatalog::new(def.catalog.manifest.clone());
            let store = CsvWorksheet::new(def.worksheet_path());
            let log = OutcomeLog::new(def.outcome_log_path());
            let raw = match (params, session_id) {
                (Some(p), _) => p,
                (None, Some(sid)) => stored_resume_params(&def.sessions_dir(), &sid)?,
                (None, None) => {
                    return Err(anyhow!("resume needs --params or --session-id"));
                }
            };
            let start = resume_session(&def, &catalog, &raw, &log)?;
            return drive_session(&def, start, &store, json, "resume");
        }
        Commands::Describe { study, json } => {
            let def = load_definition(&study)?;
            let catalog = ManifestCatalog::new(def.catalog.manifest.clone());
            let summary = describe_study(&def, &catalog)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Score {
            study,
            session_id,
            json,
        } => {
            let def = load_definition(&study)?;
            let log = OutcomeLog::new(def.outcome_log_path());
            let score = score_session_from_log(&log, &session_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "score",
                    "session_id": session_id,
                    "score": serde_json::to_value(&score)?,
                })));
            }
            println!("session_id: {}", session_id);
            print_score(&score);
        }
        Commands::Init { force } => {
            write_starter_files(force)?;
            println!("next: study describe study.yaml");
        }
        Commands::Clean { study, sessions } => {
            let def = load_definition(&study)?;
            if sessions {
                let dir = def.sessions_dir();
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                    println!("removed: {}", dir.display());
                }
            }
        }
    }
    Ok(None)
}

fn drive_session(
    def: &StudyDefinition,
    mut start: SessionStart,
    store: &CsvWorksheet,
    json: bool,
    command: &str,
) -> Result<Option<Value>> {
    let log = OutcomeLog::new(def.outcome_log_path());
    println!("participant: {}", start.session.participant_id());
    println!("group: {}", start.session.group());
    println!("session_id: {}", start.session.session_id());
    if start.degraded_assignment {
        println!("warning: participant counter unavailable, running under the fallback id");
    }
    println!("resume: {}", start.session.resume_state().encode());

    let mut interface = ConsoleInterface::new();
    let completed = run_session(
        def,
        &mut start.session,
        &start.session_dir,
        &mut interface,
        &log,
        store,
    )?;

    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": command,
            "session": {
                "participant": start.session.participant_id(),
                "group": start.session.group().as_str(),
                "session_id": start.session.session_id(),
                "trials": start.session.trial_count(),
            },
            "score": serde_json::to_value(&completed.score)?,
            "report": completed.report_path.display().to_string(),
            "summary": completed.summary_path.as_ref().map(|p| p.display().to_string()),
            "upload": upload_label(&completed),
        })));
    }

    println!();
    println!("all {} trials complete, thank you!", start.session.trial_count());
    print_score(&completed.score);
    println!("upload: {}", upload_label(&completed));
    println!("report: {}", completed.report_path.display());
    if let Some(summary) = &completed.summary_path {
        println!("summary: {}", summary.display());
    }
    Ok(None)
}

struct ConsoleInterface {
    lines: mpsc::Receiver<String>,
}

impl ConsoleInterface {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        Self { lines: rx }
    }
}

impl StudyInterface for ConsoleInterface {
    fn present(
        &mut self,
        trial_no: usize,
        total: usize,
        item: &TrialItem,
        budget: Duration,
    ) -> Result<ViewingEnd> {
        println!();
        println!("clip {}/{}: {}", trial_no, total, item.locator);
        println!(
            "press enter when done viewing (advances on its own after {}s)",
            budget.as_secs()
        );
        let end = await_viewing_end(&self.lines, budget);
        if end == ViewingEnd::Expired {
            println!("viewing time is up");
        }
        Ok(end)
    }

    fn collect_judgment(&mut self, _trial_no: usize) -> Result<Label> {
        loop {
            println!("was the clip real or fake? [real/fake]");
            let line = self
                .lines
                .recv()
                .map_err(|_| anyhow!("input_closed: stdin ended before a judgment"))?;
            match Label::parse(&line) {
                Ok(label) => return Ok(label),
                Err(e) => println!("{}", e),
            }
        }
    }
}

fn upload_label(completed: &CompletedSession) -> &'static str {
    match completed.upload {
        Some(UploadStatus::Uploaded) => "uploaded",
        Some(UploadStatus::AlreadyPresent) => "already_present",
        None => "failed",
    }
}

fn print_score(score: &SessionScore) {
    println!("trials: {}", score.trials);
    println!("accuracy: {:.1}%", score.accuracy * 100.0);
    println!("confusion (rows truth, cols judgment, order real/fake):");
    println!("  real: {:?}", score.confusion[0]);
    println!("  fake: {:?}", score.confusion[1]);
    match score.auc {
        Some(auc) => println!("auc: {:.2}", auc),
        None => println!("auc: not applicable (single truth class)"),
    }
}

fn print_summary(summary: &StudySummary) {
    println!("study: {}", summary.study_id);
    if !summary.title.is_empty() {
        println!("title: {}", summary.title);
    }
    println!("manifest: {}", summary.manifest.display());
    println!("data_dir: {}", summary.data_dir.display());
    println!("trials_per_session: {}", summary.trials_per_session);
    println!("viewing_seconds: {}", summary.viewing_seconds);
    println!("total_items: {}", summary.total_items);
    for (group, count) in &summary.group_counts {
        println!("items[{}]: {}", group, count);
    }
}

fn summary_to_json(summary: &StudySummary) -> Value {
    json!({
        "study": summary.study_id,
        "title": summary.title,
        "manifest": summary.manifest.display().to_string(),
        "data_dir": summary.data_dir.display().to_string(),
        "trials_per_session": summary.trials_per_session,
        "viewing_seconds": summary.viewing_seconds,
        "total_items": summary.total_items,
        "groups": summary.group_counts.iter().map(|(g, n)| json!({"group": g, "items": n})).collect::<Vec<_>>(),
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Resume { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Score { json, .. } => *json,
        _ => false,
    }
}

fn write_starter_files(force: bool) -> Result<()> {
    let study_path = PathBuf::from("study.yaml");
    if force || !study_path.exists() {
        let template = r#"study:
  id: clip_screening
  title: Genuine vs. synthetic clip screening
catalog:
  manifest: clips.jsonl
storage:
  data_dir: study_data
design:
  trials_per_session: 5
  viewing_seconds: 20
"#;
        std::fs::write(&study_path, template)?;
        println!("wrote: {}", study_path.display());
    }

    let manifest_path = PathBuf::from("clips.jsonl");
    if force || !manifest_path.exists() {
        let template = r#"{"locator":"720p_audio/real/clip_001.mp4","group":"720p_audio","label":"real"}
{"locator":"720p_audio/fake/clip_002.mp4","group":"720p_audio","label":"fake"}
{"locator":"1080p_audio/real/clip_001.mp4","group":"1080p_audio","label":"real"}
{"locator":"1080p_audio/fake/clip_002.mp4","group":"1080p_audio","label":"fake"}
{"locator":"720p_silent/real/clip_001.mp4","group":"720p_silent","label":"real"}
{"locator":"720p_silent/fake/clip_002.mp4","group":"720p_silent","label":"fake"}
"#;
        std::fs::write(&manifest_path, template)?;
        println!("wrote: {}", manifest_path.display());
    }
    Ok(())
}
