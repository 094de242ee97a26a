use super::StreamSource;
use crate::config::GazeConfig;
use crate::error::{ConnectionError, StreamError};
use crate::sample::{Sample, StreamKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// Consecutive frames without `gaze2d` after which the operator gets a hint.
const NO_FIX_HINT_EVERY: u64 = 50;

/// Decoded frame as delivered by the eye tracker's gaze channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GazeFrame {
    /// Tracker clock; `None` while the decoder has not resolved it yet.
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub data: GazeData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GazeData {
    #[serde(default)]
    pub gaze2d: Option<[f64; 2]>,
}

/// Session with the eye tracker: discovery, handshake and decoded frames.
#[async_trait]
pub trait GazeTransport: Send {
    fn peer(&self) -> String;

    async fn open(&mut self) -> Result<(), ConnectionError>;

    /// Next decoded frame; `Ok(None)` once the device ended the stream.
    /// Must be cancel safe: the caller drops it on timeout.
    async fn next_frame(&mut self) -> Result<Option<GazeFrame>, StreamError>;

    async fn close(&mut self);
}

pub struct GazeSource<T> {
    transport: T,
    initial_backoff: Duration,
    max_backoff: Duration,
    verbose: bool,
    connected: bool,
    frames: u64,
    no_fix: u64,
    no_fix_run: u64,
    unresolved: u64,
}

impl<T: GazeTransport> GazeSource<T> {
    pub fn new(transport: T, settings: &GazeConfig, verbose: bool) -> Self {
        Self {
            transport,
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
            verbose,
            connected: false,
            frames: 0,
            no_fix: 0,
            no_fix_run: 0,
            unresolved: 0,
        }
    }

    /// Frames persisted so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Persisted frames that carried no fixation.
    pub fn no_fixation(&self) -> u64 {
        self.no_fix
    }

    /// Frames discarded because their timestamp was not resolved.
    pub fn unresolved(&self) -> u64 {
        self.unresolved
    }

    fn track_fixation(&mut self, has_fix: bool) {
        if has_fix {
            self.no_fix_run = 0;
            return;
        }
        self.no_fix += 1;
        self.no_fix_run += 1;
        if self.no_fix_run % NO_FIX_HINT_EVERY == 0 {
            warn!(
                "gaze: {} frames without a fixation; is the participant wearing the glasses?",
                self.no_fix_run
            );
        }
    }
}

#[async_trait]
impl<T: GazeTransport> StreamSource for GazeSource<T> {
    fn kind(&self) -> StreamKind {
        StreamKind::Gaze
    }

    fn describe(&self) -> String {
        format!("gaze:{}", self.transport.peer())
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.transport.open().await?;
        self.connected = true;
        info!("gaze: streaming from {}", self.transport.peer());
        Ok(())
    }

    async fn pull(&mut self, max_wait: Duration) -> Result<Sample, StreamError> {
        if !self.connected {
            return Err(StreamError::Closed("gaze session is not open".into()));
        }
        let deadline = Instant::now() + max_wait;
        let mut backoff = self.initial_backoff;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StreamError::Timeout(max_wait));
            }
            let frame = match timeout(remaining, self.transport.next_frame()).await {
                Ok(frame) => frame?,
                Err(_) => return Err(StreamError::Timeout(max_wait)),
            };
            let frame = frame.ok_or_else(|| StreamError::Closed("gaze stream ended".into()))?;
            let Some(timestamp) = frame.timestamp else {
                self.unresolved += 1;
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(backoff.min(remaining)).await;
                backoff = (backoff * 2).min(self.max_backoff);
                continue;
            };
            self.frames += 1;
            let gaze2d = frame.data.gaze2d;
            self.track_fixation(gaze2d.is_some());
            if self.verbose {
                debug!("gaze timestamp: {timestamp}");
            }
            return Ok(Sample::gaze(timestamp, gaze2d));
        }
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.transport.close().await;
        info!(
            "gaze: closed after {} frames ({} without fixation, {} unresolved)",
            self.frames, self.no_fix, self.unresolved
        );
    }
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    subscribe: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubscribeReply {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Line-delimited JSON gaze relay over TCP.
///
/// Handshake: the client sends `{"subscribe":"gaze"}` and expects
/// `{"status":"ok"}`; afterwards every line is one `GazeFrame`.
pub struct TcpGazeTransport {
    address: String,
    connect_timeout: Duration,
    lines: Option<Lines<BufReader<OwnedReadHalf>>>,
    writer: Option<OwnedWriteHalf>,
    malformed: u64,
}

impl TcpGazeTransport {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            lines: None,
            writer: None,
            malformed: 0,
        }
    }

    pub fn from_config(settings: &GazeConfig) -> Self {
        Self::new(settings.address.clone(), settings.connect_timeout())
    }

    async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let (read, mut write) = stream.into_split();
        let mut request = serde_json::to_vec(&SubscribeRequest { subscribe: "gaze" })
            .map_err(|err| self.handshake_error(err.to_string()))?;
        request.push(b'\n');
        write.write_all(&request).await?;

        let mut lines = BufReader::new(read).lines();
        let reply = lines
            .next_line()
            .await?
            .ok_or_else(|| self.handshake_error("connection closed before acknowledgement"))?;
        let reply: SubscribeReply = serde_json::from_str(&reply)
            .map_err(|err| self.handshake_error(format!("unreadable acknowledgement: {err}")))?;
        if reply.status != "ok" {
            return Err(self.handshake_error(format!(
                "device refused gaze subscription ({}): {}",
                reply.status,
                reply.reason.unwrap_or_default()
            )));
        }
        self.lines = Some(lines);
        self.writer = Some(write);
        Ok(())
    }

    fn handshake_error(&self, reason: impl Into<String>) -> ConnectionError {
        ConnectionError::Handshake {
            peer: self.address.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl GazeTransport for TcpGazeTransport {
    fn peer(&self) -> String {
        self.address.clone()
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        match timeout(self.connect_timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout {
                peer: self.address.clone(),
                after: self.connect_timeout,
            }),
        }
    }

    async fn next_frame(&mut self) -> Result<Option<GazeFrame>, StreamError> {
        let lines = self
            .lines
            .as_mut()
            .ok_or_else(|| StreamError::Closed("gaze relay is not connected".into()))?;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(err) => return Err(StreamError::Closed(format!("gaze relay: {err}"))),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<GazeFrame>(&line) {
                Ok(frame) => return Ok(Some(frame)),
                Err(err) => {
                    self.malformed += 1;
                    warn!("gaze: skipping malformed frame #{}: {err}", self.malformed);
                }
            }
        }
    }

    async fn close(&mut self) {
        self.lines = None;
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                debug!("gaze: shutdown of {} failed: {err}", self.address);
            }
        }
    }
}
