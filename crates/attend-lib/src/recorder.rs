//! One recording session per trial.
//!
//! `Recorder::begin` hands every connected source to its own pull loop. All
//! loops share one dedicated OS thread running a single-threaded tokio
//! runtime, so they interleave at their await points but never run at the
//! same time. The caller (the trial flow, which also drives blocking audio
//! playback) talks to that thread only through the session's
//! `CancellationGate` and the outcome channel `stop` waits on.

use crate::config::RecorderConfig;
use crate::error::{ConnectionError, RecorderError, SinkError, StreamError};
use crate::gate::CancellationGate;
use crate::io::sink::SignalSink;
use crate::sample::StreamKind;
use crate::source::StreamSource;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Running,
    Stopping,
    Stopped,
    /// No source could be connected.
    Failed,
}

/// A source that could not be connected; the session runs without it.
#[derive(Debug)]
pub struct SourceFailure {
    pub kind: StreamKind,
    pub source: String,
    pub error: ConnectionError,
}

/// Why a pull loop ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum LoopExit {
    Cancelled,
    Closed(String),
    SinkFailed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub kind: StreamKind,
    pub source: String,
    pub path: PathBuf,
    pub samples: u64,
    pub timeouts: u64,
    pub exit: LoopExit,
}

#[derive(Debug)]
pub struct SessionReport {
    pub output_dir: PathBuf,
    pub loops: Vec<LoopReport>,
    pub failures: Vec<SourceFailure>,
}

impl SessionReport {
    /// Fewer streams were recorded than were configured.
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn samples(&self, kind: StreamKind) -> u64 {
        self.loops
            .iter()
            .filter(|report| report.kind == kind)
            .map(|report| report.samples)
            .sum()
    }

    /// One line for the operator.
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .loops
            .iter()
            .map(|report| {
                let exit = match &report.exit {
                    LoopExit::Cancelled => "stopped".to_string(),
                    LoopExit::Closed(reason) => format!("closed early: {reason}"),
                    LoopExit::SinkFailed(reason) => format!("write failed: {reason}"),
                };
                format!("{} {} samples ({exit})", report.kind, report.samples)
            })
            .collect();
        for failure in &self.failures {
            parts.push(format!("{} missing ({})", failure.kind, failure.error));
        }
        if parts.is_empty() {
            parts.push("no streams".into());
        }
        let banner = if self.degraded() { "DEGRADED " } else { "" };
        format!(
            "{banner}{}: {}",
            self.output_dir.display(),
            parts.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopSettings {
    pull_timeout: Duration,
    max_consecutive_timeouts: u32,
}

struct ConnectReport {
    connected: Vec<StreamKind>,
    failures: Vec<SourceFailure>,
}

struct WorkerOutcome {
    loops: Vec<LoopReport>,
    fatal: Option<SinkError>,
}

pub struct RecordingSession {
    output_dir: PathBuf,
    gate: CancellationGate,
    state: SessionState,
    streams: Vec<StreamKind>,
    failures: Vec<SourceFailure>,
    worker: Option<JoinHandle<()>>,
    outcome_rx: Option<Receiver<WorkerOutcome>>,
    stop_timeout: Duration,
}

impl RecordingSession {
    fn new(output_dir: &Path, stop_timeout: Duration) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            gate: CancellationGate::new(),
            state: SessionState::Created,
            streams: Vec::new(),
            failures: Vec::new(),
            worker: None,
            outcome_rx: None,
            stop_timeout,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Handle on this session's gate, e.g. to abort from another thread.
    pub fn gate(&self) -> CancellationGate {
        self.gate.clone()
    }

    /// Streams whose pull loops were launched.
    pub fn streams(&self) -> &[StreamKind] {
        &self.streams
    }

    pub fn failures(&self) -> &[SourceFailure] {
        &self.failures
    }

    pub fn state(&self) -> SessionState {
        let finished = self
            .worker
            .as_ref()
            .map_or(false, |worker| worker.is_finished());
        if self.state == SessionState::Running && finished {
            SessionState::Stopped
        } else {
            self.state
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.gate.signal() {
            warn!(
                "recording session {} dropped without stop; signaling pull loops",
                self.output_dir.display()
            );
        }
    }
}

pub struct Recorder {
    config: RecorderConfig,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Creates `output_dir`, one sink per source, connects the sources and
    /// launches their pull loops.
    ///
    /// Sources that fail to connect are reported on the session instead of
    /// failing the call; with none connected the session is `Failed`.
    pub fn begin(
        &self,
        output_dir: &Path,
        sources: Vec<Box<dyn StreamSource>>,
    ) -> Result<RecordingSession, RecorderError> {
        fs::create_dir_all(output_dir).map_err(|source| RecorderError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;
        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.kind()) {
                return Err(RecorderError::DuplicateStream(source.kind()));
            }
        }

        let mut session = RecordingSession::new(output_dir, self.config.stop_timeout());
        let mut attached = Vec::with_capacity(sources.len());
        for source in sources {
            let sink = SignalSink::create(&output_dir.join(source.kind().file_name()))?;
            attached.push((source, sink));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RecorderError::Worker)?;
        let (connect_tx, connect_rx) = bounded(1);
        let (outcome_tx, outcome_rx) = bounded(1);
        let gate = session.gate();
        let settings = LoopSettings {
            pull_timeout: self.config.pull_timeout(),
            max_consecutive_timeouts: self.config.max_consecutive_timeouts.max(1),
        };
        let connect_timeout = self.config.connect_timeout();
        let worker = std::thread::Builder::new()
            .name("attend-recorder".into())
            .spawn(move || {
                runtime.block_on(run_session(
                    attached,
                    gate,
                    settings,
                    connect_timeout,
                    connect_tx,
                    outcome_tx,
                ))
            })
            .map_err(RecorderError::Worker)?;
        session.worker = Some(worker);
        session.outcome_rx = Some(outcome_rx);

        let report: ConnectReport = match connect_rx.recv() {
            Ok(report) => report,
            Err(_) => {
                if let Some(worker) = session.worker.take() {
                    let _ = worker.join();
                }
                return Err(RecorderError::WorkerPanicked);
            }
        };
        session.streams = report.connected;
        session.failures = report.failures;
        session.state = if session.streams.is_empty() {
            error!(
                "no stream could be connected for {}; recording nothing",
                output_dir.display()
            );
            SessionState::Failed
        } else {
            info!(
                "recording {:?} into {}",
                session.streams,
                output_dir.display()
            );
            SessionState::Running
        };
        for failure in &session.failures {
            warn!(
                "running without {} ({}): {}",
                failure.kind, failure.source, failure.error
            );
        }
        Ok(session)
    }

    /// Signals the session's gate and waits, at most `stop_timeout`, for every
    /// pull loop to finish and close its sink.
    pub fn stop(&self, mut session: RecordingSession) -> Result<SessionReport, RecorderError> {
        if session.state == SessionState::Running {
            session.state = SessionState::Stopping;
        }
        if session.gate.signal() {
            debug!("stop signaled for {}", session.output_dir.display());
        }
        let outcome_rx = session
            .outcome_rx
            .take()
            .ok_or(RecorderError::WorkerPanicked)?;
        let outcome = match outcome_rx.recv_timeout(session.stop_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    "pull loops for {} did not finish within {:?}; abandoning them",
                    session.output_dir.display(),
                    session.stop_timeout
                );
                session.worker.take();
                return Err(RecorderError::StopTimeout {
                    timeout: session.stop_timeout,
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = session.worker.take() {
                    let _ = worker.join();
                }
                return Err(RecorderError::WorkerPanicked);
            }
        };
        if let Some(worker) = session.worker.take() {
            if worker.join().is_err() {
                return Err(RecorderError::WorkerPanicked);
            }
        }
        session.state = SessionState::Stopped;
        if let Some(err) = outcome.fatal {
            return Err(RecorderError::Sink(err));
        }
        let report = SessionReport {
            output_dir: session.output_dir.clone(),
            loops: outcome.loops,
            failures: std::mem::take(&mut session.failures),
        };
        info!("{}", report.summary());
        Ok(report)
    }
}

async fn run_session(
    attached: Vec<(Box<dyn StreamSource>, SignalSink)>,
    gate: CancellationGate,
    settings: LoopSettings,
    connect_timeout: Duration,
    connect_tx: Sender<ConnectReport>,
    outcome_tx: Sender<WorkerOutcome>,
) {
    let mut connected = Vec::new();
    let mut failures = Vec::new();
    let mut running = Vec::new();
    for (mut source, mut sink) in attached {
        let kind = source.kind();
        let result = match tokio::time::timeout(connect_timeout, source.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout {
                peer: source.describe(),
                after: connect_timeout,
            }),
        };
        match result {
            Ok(()) => {
                info!("{} connected", source.describe());
                connected.push(kind);
                running.push((source, sink));
            }
            Err(error) => {
                source.disconnect().await;
                if let Err(err) = sink.close() {
                    warn!("closing unused {kind} sink: {err}");
                }
                failures.push(SourceFailure {
                    kind,
                    source: source.describe(),
                    error,
                });
            }
        }
    }
    let _ = connect_tx.send(ConnectReport {
        connected,
        failures,
    });

    let mut loops = JoinSet::new();
    for (source, sink) in running {
        loops.spawn(pull_loop(source, sink, gate.clone(), settings));
    }
    let mut reports = Vec::new();
    let mut fatal = None;
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok((report, sink_error)) => {
                if let Some(err) = sink_error {
                    fatal.get_or_insert(err);
                }
                reports.push(report);
            }
            Err(err) => error!("pull loop aborted: {err}"),
        }
    }
    reports.sort_by_key(|report| report.kind);
    let _ = outcome_tx.send(WorkerOutcome {
        loops: reports,
        fatal,
    });
}

async fn pull_loop(
    mut source: Box<dyn StreamSource>,
    mut sink: SignalSink,
    gate: CancellationGate,
    settings: LoopSettings,
) -> (LoopReport, Option<SinkError>) {
    let name = source.describe();
    let mut samples = 0u64;
    let mut timeouts = 0u64;
    let mut consecutive = 0u32;
    let mut fatal = None;
    let exit = loop {
        if gate.is_signaled() {
            break LoopExit::Cancelled;
        }
        // The outer timeout bounds sources that ignore `max_wait`.
        let pulled = match tokio::time::timeout(
            settings.pull_timeout,
            source.pull(settings.pull_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StreamError::Timeout(settings.pull_timeout)),
        };
        match pulled {
            Ok(sample) => {
                consecutive = 0;
                if let Err(err) = sink.append(&sample) {
                    error!("{name}: {err}; stopping the session");
                    gate.signal();
                    let exit = LoopExit::SinkFailed(err.to_string());
                    fatal = Some(err);
                    break exit;
                }
                samples += 1;
            }
            Err(StreamError::Timeout(waited)) => {
                timeouts += 1;
                consecutive += 1;
                if consecutive >= settings.max_consecutive_timeouts {
                    warn!("{name}: {consecutive} pulls in a row timed out; treating stream as closed");
                    break LoopExit::Closed(format!(
                        "no data for {consecutive} consecutive pulls of {waited:?}"
                    ));
                }
                debug!("{name}: no sample within {waited:?}");
            }
            Err(StreamError::Closed(reason)) => {
                warn!("{name}: {reason}");
                break LoopExit::Closed(reason);
            }
        }
    };
    source.disconnect().await;
    if let Err(err) = sink.close() {
        error!("{name}: {err}");
        fatal.get_or_insert(err);
    }
    debug!("{name}: {samples} samples in {}", sink.path().display());
    let report = LoopReport {
        kind: source.kind(),
        source: name,
        path: sink.path().to_path_buf(),
        samples,
        timeouts,
        exit,
    };
    (report, fatal)
}
