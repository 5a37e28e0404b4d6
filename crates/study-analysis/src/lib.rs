use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use study_core::{ensure_dir, Label, StudyError, StudyGroup, TrialOutcome};

/// ROC curve over the binary judgment score, thresholds descending. With
/// hard 0/1 judgments this is the three-point curve through `(0,0)`, the
/// observed operating point, and `(1,1)`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
}

/// Aggregate statistics for one completed session. `roc`/`auc` are `None`
/// when only one truth class appears in the trials: the curve is undefined
/// there, which is reported as "not applicable" rather than zero.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionScore {
    pub trials: usize,
    pub accuracy: f64,
    /// Rows are truth, columns are judgment, both in `[real, fake]` order.
    pub confusion: [[usize; 2]; 2],
    pub roc: Option<RocCurve>,
    pub auc: Option<f64>,
}

/// Score the in-memory outcome sequence. Pure: the same outcomes always
/// produce bit-identical statistics.
pub fn score_outcomes(outcomes: &[TrialOutcome]) -> Result<SessionScore, StudyError> {
    if outcomes.is_empty() {
        return Err(StudyError::NoOutcomes);
    }
    let pairs: Vec<(u8, u8)> = outcomes
        .iter()
        .map(|o| (o.truth.code(), o.judgment.code()))
        .collect();
    Ok(score_pairs(&pairs))
}

/// Score from persisted label strings, e.g. rows read back from the outcome
/// log. Labels are re-validated at this boundary and fail closed: one
/// unrecognized truth or judgment aborts scoring with `LabelMismatch`.
pub fn score_labels(pairs: &[(&str, &str)]) -> Result<SessionScore, StudyError> {
    if pairs.is_empty() {
        return Err(StudyError::NoOutcomes);
    }
    let mut coded = Vec::with_capacity(pairs.len());
    for (truth, judgment) in pairs {
        coded.push((Label::parse(truth)?.code(), Label::parse(judgment)?.code()));
    }
    Ok(score_pairs(&coded))
}

fn score_pairs(pairs: &[(u8, u8)]) -> SessionScore {
    let trials = pairs.len();
    let correct = pairs.iter().filter(|(t, j)| t == j).count();
    let mut confusion = [[0usize; 2]; 2];
    for (t, j) in pairs {
        confusion[*t as usize][*j as usize] += 1;
    }

    let positives = pairs.iter().filter(|(t, _)| *t == 1).count();
    let (roc, auc) = if positives == 0 || positives == trials {
        (None, None)
    } else {
        let curve = roc_curve(pairs);
        let area = trapezoid_area(&curve.fpr, &curve.tpr);
        (Some(curve), Some(area))
    };

    SessionScore {
        trials,
        accuracy: correct as f64 / trials as f64,
        confusion,
        roc,
        auc,
    }
}

fn roc_curve(pairs: &[(u8, u8)]) -> RocCurve {
    let positives = pairs.iter().filter(|(t, _)| *t == 1).count() as f64;
    let negatives = pairs.len() as f64 - positives;

    let mut thresholds: Vec<u8> = pairs.iter().map(|(_, score)| *score).collect();
    thresholds.sort_unstable_by(|a, b| b.cmp(a));
    thresholds.dedup();

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    for threshold in thresholds {
        let tp = pairs.iter().filter(|(t, s)| *t == 1 && *s >= threshold).count() as f64;
        let fp = pairs.iter().filter(|(t, s)| *t == 0 && *s >= threshold).count() as f64;
        fpr.push(fp / negatives);
        tpr.push(tp / positives);
    }
    if *fpr.last().unwrap_or(&0.0) < 1.0 || *tpr.last().unwrap_or(&0.0) < 1.0 {
        fpr.push(1.0);
        tpr.push(1.0);
    }
    RocCurve { fpr, tpr }
}

fn trapezoid_area(fpr: &[f64], tpr: &[f64]) -> f64 {
    let mut area = 0.0;
    for i in 1..fpr.len() {
        area += (fpr[i] - fpr[i - 1]) * (tpr[i] + tpr[i - 1]) / 2.0;
    }
    area
}

pub fn session_report(
    session_id: &str,
    participant_id: u32,
    group: StudyGroup,
    score: &SessionScore,
) -> Value {
    json!({
        "schema_version": "session_report_v1",
        "session_id": session_id,
        "participant": participant_id,
        "group": group.as_str(),
        "trials": score.trials,
        "accuracy": score.accuracy,
        "confusion": score.confusion,
        "roc": score.roc,
        "auc": score.auc,
        "created_at": Utc::now().to_rfc3339(),
    })
}

pub fn write_report(session_dir: &Path, report: &Value) -> Result<PathBuf, StudyError> {
    ensure_dir(session_dir)?;
    let path = session_dir.join("session_report.json");
    let bytes = serde_json::to_vec_pretty(report).map_err(|e| StudyError::MalformedRecord {
        detail: format!("report serialization failed: {}", e),
    })?;
    fs::write(&path, bytes)?;
    Ok(path)
}
