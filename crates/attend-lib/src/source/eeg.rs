use super::StreamSource;
use crate::config::{EegConfig, RecorderConfig};
use crate::error::{ConnectionError, StreamError};
use crate::sample::{Sample, StreamKind};
use async_trait::async_trait;
use log::{info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// A stream advertised by the resolution service.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub name: String,
    pub source_id: String,
    pub stream_type: String,
    pub channel_count: usize,
    pub nominal_srate: f64,
}

/// An opened EEG stream.
pub trait EegInlet: Send {
    /// Non-blocking fetch of the next buffered sample and its device timestamp.
    /// `Ok(None)` means nothing is buffered yet.
    fn try_pull(&mut self) -> Result<Option<(Vec<f32>, f64)>, StreamError>;
}

/// Stream resolution service (e.g. lab streaming layer).
///
/// Both calls run on the recorder's runtime thread and may block for at most
/// the discovery window; they happen before any pull loop is started.
pub trait EegResolver: Send {
    fn resolve(
        &mut self,
        stream_type: &str,
        window: Duration,
    ) -> Result<Vec<StreamDescriptor>, ConnectionError>;

    fn open(&mut self, descriptor: &StreamDescriptor) -> Result<Box<dyn EegInlet>, ConnectionError>;
}

/// Deterministic pick among advertised streams: lowest `(source_id, name)`.
pub fn select_stream(mut candidates: Vec<StreamDescriptor>) -> Option<StreamDescriptor> {
    candidates.sort_by(|a, b| {
        a.source_id
            .cmp(&b.source_id)
            .then_with(|| a.name.cmp(&b.name))
    });
    if candidates.len() > 1 {
        let skipped: Vec<&str> = candidates[1..].iter().map(|d| d.name.as_str()).collect();
        warn!(
            "{} EEG streams advertised; using {} ({}), ignoring {:?}",
            candidates.len(),
            candidates[0].name,
            candidates[0].source_id,
            skipped
        );
    }
    candidates.into_iter().next()
}

pub struct EegSource<R> {
    resolver: R,
    settings: EegConfig,
    sr_eeg: u32,
    print_every: u32,
    verbose: bool,
    descriptor: Option<StreamDescriptor>,
    inlet: Option<Box<dyn EegInlet>>,
    pulled: u64,
}

impl<R: EegResolver> EegSource<R> {
    pub fn new(resolver: R, settings: EegConfig, recorder: &RecorderConfig) -> Self {
        Self {
            resolver,
            settings,
            sr_eeg: recorder.sr_eeg,
            print_every: recorder.print_every,
            verbose: recorder.verbose,
            descriptor: None,
            inlet: None,
            pulled: 0,
        }
    }

    pub fn descriptor(&self) -> Option<&StreamDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn pulled(&self) -> u64 {
        self.pulled
    }

    fn log_throughput(&self, timestamp: f64, channels: &[f32]) {
        let every = u64::from(self.sr_eeg) * u64::from(self.print_every);
        if !self.verbose || every == 0 || self.pulled % every != 0 {
            return;
        }
        info!(
            "eeg: {} samples (~{}s at {} Hz nominal), ts {:.4}, first channel {:?}",
            self.pulled,
            self.pulled / u64::from(self.sr_eeg),
            self.sr_eeg,
            timestamp,
            channels.first()
        );
    }
}

#[async_trait]
impl<R: EegResolver> StreamSource for EegSource<R> {
    fn kind(&self) -> StreamKind {
        StreamKind::Eeg
    }

    fn describe(&self) -> String {
        match &self.descriptor {
            Some(d) => format!("eeg:{} ({} ch)", d.name, d.channel_count),
            None => format!("eeg:type={}", self.settings.stream_type),
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        let window = self.settings.discovery_window();
        info!("looking for an {} stream...", self.settings.stream_type);
        let candidates = self.resolver.resolve(&self.settings.stream_type, window)?;
        let descriptor =
            select_stream(candidates).ok_or_else(|| ConnectionError::NoStreamFound {
                stream_type: self.settings.stream_type.clone(),
                window,
            })?;
        let inlet = self.resolver.open(&descriptor)?;
        info!(
            "connected to {} ({}, {} channels, {} Hz advertised)",
            descriptor.name, descriptor.source_id, descriptor.channel_count, descriptor.nominal_srate
        );
        self.descriptor = Some(descriptor);
        self.inlet = Some(inlet);
        self.pulled = 0;
        Ok(())
    }

    async fn pull(&mut self, max_wait: Duration) -> Result<Sample, StreamError> {
        let poll = self.settings.poll_interval();
        let deadline = Instant::now() + max_wait;
        loop {
            let inlet = self
                .inlet
                .as_mut()
                .ok_or_else(|| StreamError::Closed("EEG inlet is not connected".into()))?;
            if let Some((channels, timestamp)) = inlet.try_pull()? {
                let expected = self
                    .descriptor
                    .as_ref()
                    .map(|d| d.channel_count)
                    .filter(|count| *count > 0)
                    .unwrap_or(channels.len());
                if channels.len() != expected {
                    return Err(StreamError::Closed(format!(
                        "EEG sample has {} channels, stream advertised {}",
                        channels.len(),
                        expected
                    )));
                }
                self.pulled += 1;
                self.log_throughput(timestamp, &channels);
                return Ok(Sample::eeg(timestamp, channels));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamError::Timeout(max_wait));
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn disconnect(&mut self) {
        if self.inlet.take().is_some() {
            info!("eeg: disconnected after {} samples", self.pulled);
        }
    }
}
