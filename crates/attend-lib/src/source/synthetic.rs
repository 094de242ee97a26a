//! Hardware-free providers for dry runs. They plug into the same `EegSource`
//! and `GazeSource` code paths as the real devices.

use super::eeg::{EegInlet, EegResolver, StreamDescriptor};
use super::gaze::{GazeData, GazeFrame, GazeTransport};
use crate::error::{ConnectionError, StreamError};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::time::{Duration, Instant};

/// Simulated EEG amplifier: alpha-band sine plus noise on every channel.
#[derive(Debug, Clone)]
pub struct SyntheticEeg {
    pub channels: usize,
    pub srate: f64,
    pub seed: u64,
    /// End the stream after this many samples.
    pub limit: Option<u64>,
}

impl SyntheticEeg {
    pub fn new(channels: usize, srate: f64) -> Self {
        Self {
            channels,
            srate,
            seed: 7,
            limit: None,
        }
    }

    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            name: "synthetic-eeg".into(),
            source_id: format!("synthetic-{}", self.seed),
            stream_type: "EEG".into(),
            channel_count: self.channels,
            nominal_srate: self.srate,
        }
    }
}

impl EegResolver for SyntheticEeg {
    fn resolve(
        &mut self,
        stream_type: &str,
        window: Duration,
    ) -> Result<Vec<StreamDescriptor>, ConnectionError> {
        if !stream_type.eq_ignore_ascii_case("EEG") || self.channels == 0 || self.srate <= 0.0 {
            return Err(ConnectionError::NoStreamFound {
                stream_type: stream_type.to_string(),
                window,
            });
        }
        Ok(vec![self.descriptor()])
    }

    fn open(&mut self, descriptor: &StreamDescriptor) -> Result<Box<dyn EegInlet>, ConnectionError> {
        Ok(Box::new(SyntheticInlet {
            channels: descriptor.channel_count,
            srate: descriptor.nominal_srate,
            limit: self.limit,
            started: Instant::now(),
            emitted: 0,
            rng: StdRng::seed_from_u64(self.seed),
        }))
    }
}

struct SyntheticInlet {
    channels: usize,
    srate: f64,
    limit: Option<u64>,
    started: Instant,
    emitted: u64,
    rng: StdRng,
}

impl EegInlet for SyntheticInlet {
    fn try_pull(&mut self) -> Result<Option<(Vec<f32>, f64)>, StreamError> {
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return Err(StreamError::Closed(format!(
                "synthetic EEG finished after {} samples",
                self.emitted
            )));
        }
        let timestamp = self.emitted as f64 / self.srate;
        if self.started.elapsed().as_secs_f64() < timestamp {
            return Ok(None);
        }
        let alpha = 20.0 * (2.0 * PI * 10.0 * timestamp).sin();
        let sample = (0..self.channels)
            .map(|_| (alpha + self.rng.gen_range(-5.0..5.0)) as f32)
            .collect();
        self.emitted += 1;
        Ok(Some((sample, timestamp)))
    }
}

/// Simulated eye tracker: bounded random walk, with occasional frames that
/// carry no fixation or an unresolved timestamp.
pub struct SyntheticGaze {
    rate_hz: f64,
    no_fix_probability: f64,
    unresolved_probability: f64,
    limit: Option<u64>,
    rng: StdRng,
    position: [f64; 2],
    started: Option<tokio::time::Instant>,
    emitted: u64,
}

impl SyntheticGaze {
    pub fn new(rate_hz: f64, seed: u64) -> Self {
        Self {
            rate_hz: rate_hz.max(1.0),
            no_fix_probability: 0.05,
            unresolved_probability: 0.02,
            limit: None,
            rng: StdRng::seed_from_u64(seed),
            position: [0.5, 0.5],
            started: None,
            emitted: 0,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_probabilities(mut self, no_fix: f64, unresolved: f64) -> Self {
        self.no_fix_probability = no_fix.clamp(0.0, 1.0);
        self.unresolved_probability = unresolved.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl GazeTransport for SyntheticGaze {
    fn peer(&self) -> String {
        "synthetic".into()
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.started = Some(tokio::time::Instant::now());
        self.emitted = 0;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<GazeFrame>, StreamError> {
        let started = self
            .started
            .ok_or_else(|| StreamError::Closed("synthetic gaze is not open".into()))?;
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return Ok(None);
        }
        let timestamp = self.emitted as f64 / self.rate_hz;
        tokio::time::sleep_until(started + Duration::from_secs_f64(timestamp)).await;
        self.emitted += 1;

        if self.rng.gen_bool(self.unresolved_probability) {
            return Ok(Some(GazeFrame::default()));
        }
        for axis in self.position.iter_mut() {
            *axis = (*axis + self.rng.gen_range(-0.02..0.02)).clamp(0.0, 1.0);
        }
        let gaze2d = if self.rng.gen_bool(self.no_fix_probability) {
            None
        } else {
            Some(self.position)
        };
        Ok(Some(GazeFrame {
            timestamp: Some(timestamp),
            data: GazeData { gaze2d },
        }))
    }

    async fn close(&mut self) {
        self.started = None;
    }
}
