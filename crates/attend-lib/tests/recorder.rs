use async_trait::async_trait;
use attend_lib::error::{ConnectionError, RecorderError, StreamError};
use attend_lib::io::read_sink;
use attend_lib::recorder::{LoopExit, Recorder, SessionState};
use attend_lib::sample::{Sample, StreamKind};
use attend_lib::source::StreamSource;
use attend_lib::RecorderConfig;
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[derive(Clone, Copy)]
enum Exhausted {
    /// Never resolves; only the recorder's pull timeout gets it unstuck.
    Pend,
    Close,
    /// Blocks the runtime thread outright.
    Block(Duration),
}

#[derive(Clone, Copy)]
enum Connect {
    Ok,
    Refuse,
    Hang,
}

struct FakeSource {
    kind: StreamKind,
    samples: VecDeque<Sample>,
    exhausted: Exhausted,
    connect: Connect,
}

impl FakeSource {
    fn eeg(count: usize, exhausted: Exhausted) -> Self {
        Self {
            kind: StreamKind::Eeg,
            samples: (0..count)
                .map(|i| Sample::eeg(i as f64 * 0.002, vec![i as f32, -(i as f32)]))
                .collect(),
            exhausted,
            connect: Connect::Ok,
        }
    }

    fn gaze(count: usize, exhausted: Exhausted) -> Self {
        Self {
            kind: StreamKind::Gaze,
            samples: (0..count)
                .map(|i| Sample::gaze(i as f64 * 0.01, Some([0.5, 0.1 * i as f64])))
                .collect(),
            exhausted,
            connect: Connect::Ok,
        }
    }

    fn connecting(mut self, connect: Connect) -> Self {
        self.connect = connect;
        self
    }

    fn boxed(self) -> Box<dyn StreamSource> {
        Box::new(self)
    }
}

#[async_trait]
impl StreamSource for FakeSource {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("fake-{}", self.kind)
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        match self.connect {
            Connect::Ok => Ok(()),
            Connect::Refuse => Err(ConnectionError::Handshake {
                peer: self.describe(),
                reason: "refused".into(),
            }),
            Connect::Hang => std::future::pending().await,
        }
    }

    async fn pull(&mut self, _max_wait: Duration) -> Result<Sample, StreamError> {
        if let Some(sample) = self.samples.pop_front() {
            return Ok(sample);
        }
        match self.exhausted {
            Exhausted::Pend => std::future::pending().await,
            Exhausted::Close => Err(StreamError::Closed("fake stream ended".into())),
            Exhausted::Block(duration) => {
                std::thread::sleep(duration);
                Err(StreamError::Timeout(duration))
            }
        }
    }

    async fn disconnect(&mut self) {}
}

fn config() -> RecorderConfig {
    RecorderConfig {
        verbose: false,
        pull_timeout_ms: 50,
        stop_timeout_ms: 300,
        connect_timeout_ms: 200,
        max_consecutive_timeouts: 1000,
        ..RecorderConfig::default()
    }
}

fn wait_for_records(path: &Path, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if read_sink(path).map(|samples| samples.len()).unwrap_or(0) >= count {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("{} never reached {count} records", path.display());
}

#[test]
fn persists_samples_in_pull_order() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(config());
    let session = recorder
        .begin(
            dir.path(),
            vec![
                FakeSource::eeg(5, Exhausted::Pend).boxed(),
                FakeSource::gaze(3, Exhausted::Pend).boxed(),
            ],
        )
        .unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.streams(), &[StreamKind::Eeg, StreamKind::Gaze]);

    let eeg_path = dir.path().join("eeg_data.jsonl");
    let gaze_path = dir.path().join("gaze_data.jsonl");
    wait_for_records(&eeg_path, 5);
    wait_for_records(&gaze_path, 3);
    let report = recorder.stop(session).unwrap();

    assert!(!report.degraded());
    assert_eq!(report.samples(StreamKind::Eeg), 5);
    assert_eq!(report.samples(StreamKind::Gaze), 3);
    assert!(report.loops.iter().all(|l| l.exit == LoopExit::Cancelled));

    let eeg = read_sink(&eeg_path).unwrap();
    let timestamps: Vec<f64> = eeg.iter().map(|s| s.timestamp).collect();
    let expected: Vec<f64> = (0..5).map(|i| i as f64 * 0.002).collect();
    assert_eq!(timestamps, expected);
    assert_eq!(eeg[3], Sample::eeg(3.0 * 0.002, vec![3.0, -3.0]));
    let gaze = read_sink(&gaze_path).unwrap();
    assert_eq!(gaze[2], Sample::gaze(2.0 * 0.01, Some([0.5, 0.1 * 2.0])));
}

#[test]
fn stalled_source_stops_within_bound() {
    let dir = tempdir().unwrap();
    let config = config();
    // One in-flight pull plus scheduling slack; well under `stop_timeout`.
    let bound = config.pull_timeout() + Duration::from_millis(40);
    let recorder = Recorder::new(config);
    let session = recorder
        .begin(dir.path(), vec![FakeSource::eeg(2, Exhausted::Pend).boxed()])
        .unwrap();
    let eeg_path = dir.path().join("eeg_data.jsonl");
    wait_for_records(&eeg_path, 2);

    let started = Instant::now();
    let report = recorder.stop(session).unwrap();
    assert!(started.elapsed() <= bound, "stop took {:?}", started.elapsed());
    assert_eq!(report.samples(StreamKind::Eeg), 2);
    assert!(report.loops[0].timeouts >= 1);
    assert_eq!(read_sink(&eeg_path).unwrap().len(), 2);
}

#[test]
fn failed_connect_degrades_session() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(config());
    let session = recorder
        .begin(
            dir.path(),
            vec![
                FakeSource::eeg(4, Exhausted::Pend).boxed(),
                FakeSource::gaze(0, Exhausted::Pend)
                    .connecting(Connect::Refuse)
                    .boxed(),
            ],
        )
        .unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.streams(), &[StreamKind::Eeg]);
    assert_eq!(session.failures().len(), 1);
    assert_eq!(session.failures()[0].kind, StreamKind::Gaze);

    wait_for_records(&dir.path().join("eeg_data.jsonl"), 4);
    let report = recorder.stop(session).unwrap();
    assert!(report.degraded());
    assert!(report.summary().contains("gaze missing"));
    let gaze = dir.path().join("gaze_data.jsonl");
    assert!(gaze.exists());
    assert!(read_sink(&gaze).unwrap().is_empty());
}

#[test]
fn no_connected_source_fails_session() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(config());
    let session = recorder
        .begin(
            dir.path(),
            vec![
                FakeSource::eeg(1, Exhausted::Pend)
                    .connecting(Connect::Hang)
                    .boxed(),
                FakeSource::gaze(1, Exhausted::Pend)
                    .connecting(Connect::Refuse)
                    .boxed(),
            ],
        )
        .unwrap();
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.streams().is_empty());
    assert!(matches!(
        session.failures()[0].error,
        ConnectionError::Timeout { .. }
    ));
    let report = recorder.stop(session).unwrap();
    assert!(report.loops.is_empty());
    assert_eq!(report.failures.len(), 2);
}

#[test]
fn duplicate_stream_kinds_are_rejected() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(config());
    let err = recorder
        .begin(
            dir.path(),
            vec![
                FakeSource::eeg(1, Exhausted::Pend).boxed(),
                FakeSource::eeg(1, Exhausted::Pend).boxed(),
            ],
        )
        .err()
        .unwrap();
    assert!(matches!(err, RecorderError::DuplicateStream(StreamKind::Eeg)));
}

#[test]
fn blocking_source_times_out_stop() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(config());
    let session = recorder
        .begin(
            dir.path(),
            vec![FakeSource::eeg(1, Exhausted::Block(Duration::from_secs(2))).boxed()],
        )
        .unwrap();
    wait_for_records(&dir.path().join("eeg_data.jsonl"), 1);
    let gate = session.gate();
    let err = recorder.stop(session).unwrap_err();
    assert!(matches!(err, RecorderError::StopTimeout { .. }));
    assert!(gate.is_signaled());
}

#[test]
fn session_stops_when_every_stream_closes() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(config());
    let session = recorder
        .begin(dir.path(), vec![FakeSource::gaze(3, Exhausted::Close).boxed()])
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != SessionState::Stopped {
        assert!(Instant::now() < deadline, "session never stopped");
        std::thread::sleep(Duration::from_millis(10));
    }
    let report = recorder.stop(session).unwrap();
    assert_eq!(report.samples(StreamKind::Gaze), 3);
    assert!(matches!(report.loops[0].exit, LoopExit::Closed(_)));
}

#[test]
fn creates_missing_output_directory() {
    let dir = tempdir().unwrap();
    let nested = dir.path().join("p01").join("trial-001_tone");
    let recorder = Recorder::new(config());
    let session = recorder
        .begin(&nested, vec![FakeSource::eeg(0, Exhausted::Close).boxed()])
        .unwrap();
    assert_eq!(session.output_dir(), nested.as_path());
    recorder.stop(session).unwrap();
    assert!(nested.join("eeg_data.jsonl").exists());
}

#[cfg(unix)]
#[test]
fn sink_failure_signals_gate_and_fails_stop() {
    let dir = tempdir().unwrap();
    std::os::unix::fs::symlink("/dev/full", dir.path().join("eeg_data.jsonl")).unwrap();
    let recorder = Recorder::new(config());
    let session = recorder
        .begin(
            dir.path(),
            vec![
                FakeSource::eeg(5, Exhausted::Pend).boxed(),
                FakeSource::gaze(0, Exhausted::Pend).boxed(),
            ],
        )
        .unwrap();
    let gate = session.gate();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !gate.is_signaled() {
        assert!(Instant::now() < deadline, "sink failure never signaled the gate");
        std::thread::sleep(Duration::from_millis(10));
    }
    let result = recorder.stop(session);
    assert!(matches!(result, Err(RecorderError::Sink(_))), "{result:?}");
}

#[test]
fn consecutive_timeouts_close_the_stream() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(RecorderConfig {
        max_consecutive_timeouts: 3,
        ..config()
    });
    let session = recorder
        .begin(dir.path(), vec![FakeSource::eeg(0, Exhausted::Pend).boxed()])
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != SessionState::Stopped {
        assert!(Instant::now() < deadline, "silent stream was never closed");
        std::thread::sleep(Duration::from_millis(10));
    }
    let report = recorder.stop(session).unwrap();
    assert!(matches!(report.loops[0].exit, LoopExit::Closed(_)));
    assert_eq!(report.loops[0].timeouts, 3);
    assert_eq!(report.samples(StreamKind::Eeg), 0);
}
