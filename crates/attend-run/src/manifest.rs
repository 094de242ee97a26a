use anyhow::{Context, Result};
use attend_lib::recorder::{LoopExit, LoopReport, SourceFailure};
use attend_lib::sample::StreamKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StreamRecord {
    pub kind: StreamKind,
    pub source: String,
    pub file: String,
    pub samples: u64,
    pub timeouts: u64,
    pub exit: LoopExit,
}

impl From<&LoopReport> for StreamRecord {
    fn from(report: &LoopReport) -> Self {
        Self {
            kind: report.kind,
            source: report.source.clone(),
            file: report
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            samples: report.samples,
            timeouts: report.timeouts,
            exit: report.exit.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FailureRecord {
    pub kind: StreamKind,
    pub source: String,
    pub error: String,
}

impl From<&SourceFailure> for FailureRecord {
    fn from(failure: &SourceFailure) -> Self {
        Self {
            kind: failure.kind,
            source: failure.source.clone(),
            error: failure.error.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CueRecord {
    pub device: usize,
    pub audio_path: String,
    pub volume_db: f32,
    pub duration_s: f64,
}

/// `session.json`, written next to the stream files of every trial.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionManifest {
    pub session_id: Uuid,
    pub trial: usize,
    pub stim_id: String,
    pub start_time_unix: f64,
    pub stop_time_unix: f64,
    pub degraded: bool,
    pub streams: Vec<StreamRecord>,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    #[serde(default)]
    pub cues: Vec<CueRecord>,
    #[serde(default)]
    pub playback_error: Option<String>,
    #[serde(default)]
    pub stop_error: Option<String>,
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn write_manifest(path: &Path, manifest: &SessionManifest) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("creating manifest {}", path.display()))?;
    serde_json::to_writer_pretty(file, manifest)
        .with_context(|| format!("writing manifest {}", path.display()))?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<SessionManifest> {
    let file =
        fs::File::open(path).with_context(|| format!("opening manifest {}", path.display()))?;
    let manifest = serde_json::from_reader::<_, SessionManifest>(file)
        .with_context(|| format!("parsing manifest {}", path.display()))?;
    Ok(manifest)
}
