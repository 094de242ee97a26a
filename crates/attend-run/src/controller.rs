//! Runs one trial: record every configured stream while the stimulus plays.

use crate::manifest::{
    unix_now, write_manifest, CueRecord, FailureRecord, SessionManifest, StreamRecord,
};
use crate::plan::TrialSpec;
use crate::playback::{play_fanout, Clip, OutputDevice, PacedDevice, PlaybackJob};
use anyhow::{anyhow, Context, Result};
use attend_lib::recorder::{Recorder, SessionReport};
use attend_lib::source::StreamSource;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "session.json";

pub type DeviceOpener = Box<dyn Fn(usize) -> Result<Box<dyn OutputDevice>> + Send + Sync>;

pub struct TrialOutcome {
    pub dir: PathBuf,
    pub manifest: SessionManifest,
    /// `None` when the session could not be stopped cleanly; see
    /// `manifest.stop_error`.
    pub report: Option<SessionReport>,
}

impl TrialOutcome {
    pub fn is_clean(&self) -> bool {
        !self.manifest.degraded
            && self.manifest.playback_error.is_none()
            && self.manifest.stop_error.is_none()
    }
}

pub struct TrialController {
    recorder: Recorder,
    root: PathBuf,
    slots: Vec<usize>,
    open_device: DeviceOpener,
}

impl TrialController {
    /// Plays through `PacedDevice`s until `with_devices` installs real outputs.
    pub fn new(recorder: Recorder, root: impl Into<PathBuf>) -> Self {
        Self {
            recorder,
            root: root.into(),
            slots: Vec::new(),
            open_device: Box::new(|index| {
                Ok(Box::new(PacedDevice::new(index)) as Box<dyn OutputDevice>)
            }),
        }
    }

    /// Maps plan output slot `i` to hardware device `slots[i]`. With no
    /// mapping a slot is used as the device index directly.
    pub fn with_slots(mut self, slots: Vec<usize>) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_devices(mut self, open_device: DeviceOpener) -> Self {
        self.open_device = open_device;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_for_slot(&self, slot: usize) -> Result<usize> {
        if self.slots.is_empty() {
            return Ok(slot);
        }
        self.slots.get(slot).copied().ok_or_else(|| {
            anyhow!(
                "output slot {slot} is not mapped ({} playback devices configured)",
                self.slots.len()
            )
        })
    }

    /// Clips and devices are prepared before recording starts, so a bad plan
    /// row fails the trial without leaving a half-written session behind.
    /// Once recording has begun the session is always stopped and its
    /// manifest written, whatever playback does.
    pub fn run_trial(
        &self,
        trial: &TrialSpec,
        sources: Vec<Box<dyn StreamSource>>,
    ) -> Result<TrialOutcome> {
        let mut jobs = Vec::with_capacity(trial.cues.len());
        let mut cues = Vec::with_capacity(trial.cues.len());
        for cue in &trial.cues {
            let clip = Clip::load(&cue.audio_path, cue.volume_db)
                .with_context(|| format!("trial {}", trial.trial))?;
            let index = self.device_for_slot(cue.device)?;
            let device = (self.open_device)(index)
                .with_context(|| format!("opening output device #{index}"))?;
            cues.push(CueRecord {
                device: index,
                audio_path: cue.audio_path.display().to_string(),
                volume_db: cue.volume_db,
                duration_s: clip.duration().as_secs_f64(),
            });
            jobs.push(PlaybackJob { device, clip });
        }

        let dir = self.root.join(trial.dir_name());
        let start_time_unix = unix_now();
        let session = self
            .recorder
            .begin(&dir, sources)
            .with_context(|| format!("starting recording for trial {}", trial.trial))?;
        let failures: Vec<FailureRecord> =
            session.failures().iter().map(FailureRecord::from).collect();
        info!(
            "trial {} ({}): {} cue(s), recording {:?}",
            trial.trial,
            trial.stim_id,
            jobs.len(),
            session.streams()
        );

        let playback_error = play_fanout(jobs).err().map(|err| {
            warn!("trial {}: {err:#}", trial.trial);
            format!("{err:#}")
        });

        let (report, stop_error) = match self.recorder.stop(session) {
            Ok(report) => (Some(report), None),
            Err(err) => {
                error!("trial {}: {err}", trial.trial);
                (None, Some(err.to_string()))
            }
        };
        let manifest = SessionManifest {
            session_id: Uuid::new_v4(),
            trial: trial.trial,
            stim_id: trial.stim_id.clone(),
            start_time_unix,
            stop_time_unix: unix_now(),
            degraded: !failures.is_empty(),
            streams: report
                .as_ref()
                .map(|report| report.loops.iter().map(StreamRecord::from).collect())
                .unwrap_or_default(),
            failures,
            cues,
            playback_error,
            stop_error,
        };
        write_manifest(&dir.join(MANIFEST_FILE), &manifest)?;
        Ok(TrialOutcome {
            dir,
            manifest,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::read_manifest;
    use crate::plan::Cue;
    use attend_lib::config::{GazeConfig, RecorderConfig};
    use attend_lib::io::read_sink;
    use attend_lib::sample::StreamKind;
    use attend_lib::source::{GazeSource, SyntheticGaze};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn recorder() -> Recorder {
        Recorder::new(RecorderConfig {
            verbose: false,
            pull_timeout_ms: 50,
            stop_timeout_ms: 500,
            connect_timeout_ms: 500,
            ..RecorderConfig::default()
        })
    }

    fn gaze_source() -> Vec<Box<dyn StreamSource>> {
        let transport = SyntheticGaze::new(200.0, 11).with_probabilities(0.0, 0.0);
        let gaze: Box<dyn StreamSource> =
            Box::new(GazeSource::new(transport, &GazeConfig::default(), false));
        vec![gaze]
    }

    fn write_silence(path: &Path, frames: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 1000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn records_while_playing_and_writes_manifest() {
        let dir = tempdir().unwrap();
        let clip = dir.path().join("quiet.wav");
        write_silence(&clip, 150);
        let opened = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&opened);
        let controller = TrialController::new(recorder(), dir.path().join("p01"))
            .with_slots(vec![0, 1, 4])
            .with_devices(Box::new(move |index| {
                seen.lock().unwrap().push(index);
                Ok(Box::new(PacedDevice::new(index)) as Box<dyn OutputDevice>)
            }));
        let trial = TrialSpec {
            trial: 7,
            stim_id: "quiet".into(),
            cues: vec![Cue {
                device: 2,
                audio_path: clip.clone(),
                volume_db: -3.0,
            }],
        };

        let outcome = controller.run_trial(&trial, gaze_source()).unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.dir, dir.path().join("p01").join("trial-007_quiet"));
        assert_eq!(*opened.lock().unwrap(), vec![4]);

        let manifest = read_manifest(&outcome.dir.join(MANIFEST_FILE)).unwrap();
        assert_eq!(manifest.session_id, outcome.manifest.session_id);
        assert_eq!(manifest.streams, outcome.manifest.streams);
        assert_eq!(manifest.cues[0].device, 4);
        assert!(manifest.stop_time_unix >= manifest.start_time_unix);
        let recorded = manifest.streams[0].samples;
        assert!(recorded > 0);
        let samples = read_sink(&outcome.dir.join("gaze_data.jsonl")).unwrap();
        assert_eq!(samples.len() as u64, recorded);
        assert!(samples.iter().all(|s| s.kind() == StreamKind::Gaze));
    }

    #[test]
    fn playback_failure_still_stops_recording() {
        let dir = tempdir().unwrap();
        let clip = dir.path().join("quiet.wav");
        write_silence(&clip, 50);
        struct Unplugged;
        impl OutputDevice for Unplugged {
            fn name(&self) -> String {
                "unplugged".into()
            }
            fn play(&mut self, _clip: &Clip) -> Result<()> {
                Err(anyhow!("device went away"))
            }
        }
        let controller = TrialController::new(recorder(), dir.path())
            .with_devices(Box::new(|_| Ok(Box::new(Unplugged) as Box<dyn OutputDevice>)));
        let trial = TrialSpec {
            trial: 1,
            stim_id: "x".into(),
            cues: vec![Cue {
                device: 0,
                audio_path: clip,
                volume_db: 0.0,
            }],
        };
        let outcome = controller.run_trial(&trial, gaze_source()).unwrap();
        assert!(!outcome.is_clean());
        assert!(outcome
            .manifest
            .playback_error
            .as_deref()
            .unwrap()
            .contains("device went away"));
        assert!(outcome.report.is_some());
        assert!(outcome.dir.join(MANIFEST_FILE).exists());
    }

    #[test]
    fn unmapped_slot_fails_before_recording() {
        let dir = tempdir().unwrap();
        let clip = dir.path().join("quiet.wav");
        write_silence(&clip, 10);
        let controller = TrialController::new(recorder(), dir.path()).with_slots(vec![0]);
        let trial = TrialSpec {
            trial: 2,
            stim_id: "y".into(),
            cues: vec![Cue {
                device: 3,
                audio_path: clip,
                volume_db: 0.0,
            }],
        };
        assert!(controller.run_trial(&trial, gaze_source()).is_err());
        assert!(!dir.path().join(trial.dir_name()).exists());
    }
}
