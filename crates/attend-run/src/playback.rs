//! Stimulus clips and simultaneous playback on several output devices.

use anyhow::{anyhow, bail, Context, Result};
use hound::{SampleFormat, WavReader};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A decoded WAV file with gain applied, interleaved `f32` in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct Clip {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

pub fn db_to_gain(volume_db: f32) -> f32 {
    10f32.powf(volume_db / 20.0)
}

impl Clip {
    pub fn load(path: &Path, volume_db: f32) -> Result<Self> {
        let mut reader = WavReader::open(path)
            .with_context(|| format!("opening stimulus {}", path.display()))?;
        let spec = reader.spec();
        let raw: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .with_context(|| format!("decoding {}", path.display()))?,
            (SampleFormat::Int, bits @ (8 | 16 | 24 | 32)) => {
                let scale = 1.0 / (1u64 << (bits - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 * scale))
                    .collect::<Result<_, _>>()
                    .with_context(|| format!("decoding {}", path.display()))?
            }
            (format, bits) => bail!(
                "{}: unsupported WAV encoding ({format:?}, {bits} bits)",
                path.display()
            ),
        };
        let gain = db_to_gain(volume_db);
        Ok(Self {
            path: path.to_path_buf(),
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples: raw
                .into_iter()
                .map(|sample| (sample * gain).clamp(-1.0, 1.0))
                .collect(),
        })
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }
}

/// An audio output that plays one clip to completion before returning.
pub trait OutputDevice: Send {
    fn name(&self) -> String;
    fn play(&mut self, clip: &Clip) -> Result<()>;
}

/// Headless stand-in: takes exactly as long as the clip would.
#[derive(Debug, Clone)]
pub struct PacedDevice {
    index: usize,
}

impl PacedDevice {
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

impl OutputDevice for PacedDevice {
    fn name(&self) -> String {
        format!("paced-{}", self.index)
    }

    fn play(&mut self, clip: &Clip) -> Result<()> {
        std::thread::sleep(clip.duration());
        Ok(())
    }
}

pub struct PlaybackJob {
    pub device: Box<dyn OutputDevice>,
    pub clip: Clip,
}

/// Plays every job at once, one thread per device, and waits for all of them.
/// A failing device never cuts the others short; failures are reported
/// together once everything has finished.
pub fn play_fanout(jobs: Vec<PlaybackJob>) -> Result<()> {
    let total = jobs.len();
    let mut handles = Vec::with_capacity(total);
    for mut job in jobs {
        let name = job.device.name();
        let handle = std::thread::Builder::new()
            .name(format!("playback-{name}"))
            .spawn(move || {
                info!("{}: playing {}", job.device.name(), job.clip.path.display());
                job.device.play(&job.clip)
            })
            .with_context(|| format!("spawning playback thread for {name}"))?;
        handles.push((name, handle));
    }
    let mut failures = Vec::new();
    for (name, handle) in handles {
        let result = handle
            .join()
            .unwrap_or_else(|_| Err(anyhow!("playback thread panicked")));
        if let Err(err) = result {
            error!("{name}: {err:#}");
            failures.push(format!("{name}: {err:#}"));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        bail!(
            "playback failed on {} of {} devices: {}",
            failures.len(),
            total,
            failures.join("; ")
        )
    }
}

#[cfg(feature = "audio")]
pub use self::cpal_output::{list_output_devices, CpalDevice};

#[cfg(feature = "audio")]
mod cpal_output {
    use super::{Clip, OutputDevice};
    use anyhow::{anyhow, Context, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::time::Duration;

    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .context("enumerating output devices")?;
        Ok(devices
            .enumerate()
            .map(|(index, device)| {
                device
                    .name()
                    .unwrap_or_else(|_| format!("output #{index}"))
            })
            .collect())
    }

    /// The N-th output device of the default host.
    pub struct CpalDevice {
        index: usize,
        name: String,
        device: cpal::Device,
    }

    impl CpalDevice {
        pub fn open(index: usize) -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .output_devices()
                .context("enumerating output devices")?
                .nth(index)
                .ok_or_else(|| anyhow!("no output device #{index}"))?;
            let name = device
                .name()
                .unwrap_or_else(|_| format!("output #{index}"));
            Ok(Self {
                index,
                name,
                device,
            })
        }
    }

    impl OutputDevice for CpalDevice {
        fn name(&self) -> String {
            format!("{} (#{})", self.name, self.index)
        }

        fn play(&mut self, clip: &Clip) -> Result<()> {
            let config = cpal::StreamConfig {
                channels: clip.channels,
                sample_rate: cpal::SampleRate(clip.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let samples = clip.samples.clone();
            let mut position = 0usize;
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let name = self.name();
            let stream = self
                .device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _| {
                        let start = position;
                        position += data.len();
                        for (offset, out) in data.iter_mut().enumerate() {
                            *out = samples.get(start + offset).copied().unwrap_or(0.0);
                        }
                        if start + data.len() >= samples.len() {
                            let _ = done_tx.try_send(());
                        }
                    },
                    move |err| log::error!("{name}: output stream error: {err}"),
                    None,
                )
                .with_context(|| format!("opening output stream on {}", self.name()))?;
            stream
                .play()
                .with_context(|| format!("starting playback on {}", self.name()))?;
            let limit = clip.duration() + Duration::from_millis(500);
            if done_rx.recv_timeout(limit).is_err() {
                log::warn!("{}: clip did not drain within {limit:?}", self.name());
            }
            Ok(())
        }
    }
}
