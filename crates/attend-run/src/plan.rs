use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, Trim};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct PlanRow {
    trial: usize,
    #[serde(default)]
    stim_id: Option<String>,
    #[serde(default)]
    device: usize,
    #[serde(default)]
    audio_path: Option<String>,
    #[serde(default)]
    volume_db: f32,
}

/// One clip to play on one output slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Cue {
    pub device: usize,
    pub audio_path: PathBuf,
    pub volume_db: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrialSpec {
    pub trial: usize,
    pub stim_id: String,
    pub cues: Vec<Cue>,
}

impl TrialSpec {
    /// Output directory name, e.g. `trial-003_tone-left`.
    pub fn dir_name(&self) -> String {
        format!("trial-{:03}_{}", self.trial, self.stim_id)
    }
}

fn sanitize(stim_id: &str) -> String {
    stim_id
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' => '-',
            other => other,
        })
        .collect()
}

/// Reads a trial plan: one row per trial and output slot, grouped by trial in
/// file order. Relative audio paths resolve against the plan's directory;
/// rows with an empty `audio_path` keep the trial silent on that slot.
pub fn read_trials(path: &Path) -> Result<Vec<TrialSpec>> {
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("opening trial plan {}", path.display()))?;
    let mut trials: Vec<TrialSpec> = Vec::new();
    for (idx, row) in reader.deserialize::<PlanRow>().enumerate() {
        let row = row.with_context(|| format!("parsing trial plan row {}", idx + 1))?;
        if row.trial == 0 {
            bail!("trial plan row {}: trial numbers start at 1", idx + 1);
        }
        let position = match trials.iter().position(|t| t.trial == row.trial) {
            Some(position) => position,
            None => {
                trials.push(TrialSpec {
                    trial: row.trial,
                    stim_id: format!("trial-{}", row.trial),
                    cues: Vec::new(),
                });
                trials.len() - 1
            }
        };
        let trial = &mut trials[position];
        if let Some(stim_id) = row.stim_id.as_deref().filter(|s| !s.trim().is_empty()) {
            trial.stim_id = sanitize(stim_id);
        }
        let Some(audio) = row.audio_path.filter(|p| !p.is_empty()) else {
            continue;
        };
        if trial.cues.iter().any(|cue| cue.device == row.device) {
            bail!(
                "trial plan row {}: trial {} uses output slot {} twice",
                idx + 1,
                row.trial,
                row.device
            );
        }
        let audio_path = PathBuf::from(audio);
        trial.cues.push(Cue {
            device: row.device,
            audio_path: if audio_path.is_relative() {
                base.join(audio_path)
            } else {
                audio_path
            },
            volume_db: row.volume_db,
        });
    }
    Ok(trials)
}
