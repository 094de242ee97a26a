//! Lab streaming layer binding for `EegSource`.
//!
//! liblsl handles stay on the thread that created them: resolution runs on
//! the caller, and each opened inlet lives on its own reader thread that
//! forwards samples over a channel.

use super::eeg::{EegInlet, EegResolver, StreamDescriptor};
use crate::error::{ConnectionError, StreamError};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use log::{debug, warn};
use lsl::{ProcessingOption, Pullable};
use std::thread::JoinHandle;
use std::time::Duration;

/// Upper bound on streams collected per resolve; resolution then waits out
/// the whole discovery window instead of returning on the first answer.
const RESOLVE_MINIMUM: i32 = 32;
/// Seconds of data liblsl buffers per inlet.
const INLET_BUFFER_S: i32 = 360;
/// Blocking wait of the reader thread between stop checks.
const READ_TIMEOUT_S: f64 = 0.05;

/// Resolves EEG outlets on the local network through liblsl.
#[derive(Debug, Default)]
pub struct LslResolver {
    window: Duration,
}

impl LslResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn describe(info: &lsl::StreamInfo) -> StreamDescriptor {
    StreamDescriptor {
        name: info.stream_name(),
        source_id: info.source_id(),
        stream_type: info.stream_type(),
        channel_count: info.channel_count().max(0) as usize,
        nominal_srate: info.nominal_srate().max(0.0),
    }
}

impl EegResolver for LslResolver {
    fn resolve(
        &mut self,
        stream_type: &str,
        window: Duration,
    ) -> Result<Vec<StreamDescriptor>, ConnectionError> {
        self.window = window;
        let streams = lsl::resolve_byprop("type", stream_type, RESOLVE_MINIMUM, window.as_secs_f64())
            .map_err(|err| ConnectionError::Handshake {
                peer: format!("lsl type={stream_type}"),
                reason: format!("{err:?}"),
            })?;
        Ok(streams.iter().map(describe).collect())
    }

    fn open(&mut self, descriptor: &StreamDescriptor) -> Result<Box<dyn EegInlet>, ConnectionError> {
        let (ready_tx, ready_rx) = bounded(1);
        let (sample_tx, samples) = unbounded();
        let (stop, stop_rx) = bounded(1);
        let wanted = descriptor.clone();
        let window = self.window;
        let reader = std::thread::Builder::new()
            .name(format!("lsl-{}", descriptor.name))
            .spawn(move || run_inlet(wanted, window, ready_tx, sample_tx, stop_rx))?;

        let handshake = |reason: String| ConnectionError::Handshake {
            peer: descriptor.name.clone(),
            reason,
        };
        match ready_rx.recv_timeout(window + Duration::from_secs(1)) {
            Ok(Ok(())) => Ok(Box::new(LslInlet {
                samples,
                stop,
                reader: Some(reader),
            })),
            Ok(Err(reason)) => Err(handshake(reason)),
            Err(_) => {
                let _ = stop.send(());
                Err(handshake("inlet did not open in time".into()))
            }
        }
    }
}

fn run_inlet(
    wanted: StreamDescriptor,
    window: Duration,
    ready: Sender<Result<(), String>>,
    samples: Sender<(Vec<f32>, f64)>,
    stop: Receiver<()>,
) {
    let opened = lsl::resolve_byprop("source_id", &wanted.source_id, 1, window.as_secs_f64())
        .map_err(|err| format!("re-resolving: {err:?}"))
        .and_then(|streams| {
            streams
                .into_iter()
                .find(|info| info.stream_name() == wanted.name)
                .ok_or_else(|| "stream vanished between resolve and open".to_string())
        })
        .and_then(|info| {
            lsl::StreamInlet::new(&info, INLET_BUFFER_S, 0, true)
                .map_err(|err| format!("failed to open inlet: {err:?}"))
        })
        .and_then(|inlet| {
            inlet
                .set_postprocessing(&[
                    ProcessingOption::ClockSync,
                    ProcessingOption::Dejitter,
                    ProcessingOption::Monotonize,
                ])
                .map(|_| inlet)
                .map_err(|err| format!("failed to configure inlet: {err:?}"))
        });
    let inlet = match opened {
        Ok(inlet) => {
            let _ = ready.send(Ok(()));
            inlet
        }
        Err(reason) => {
            let _ = ready.send(Err(reason));
            return;
        }
    };

    while stop.try_recv().is_err() {
        let pulled: Result<(Vec<f32>, f64), _> = inlet.pull_sample(READ_TIMEOUT_S);
        match pulled {
            Ok((_, timestamp)) if timestamp == 0.0 => continue,
            Ok(sample) => {
                if samples.send(sample).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!("lsl {}: read failed: {err:?}", wanted.name);
                break;
            }
        }
    }
    debug!("lsl {}: reader thread done", wanted.name);
}

struct LslInlet {
    samples: Receiver<(Vec<f32>, f64)>,
    stop: Sender<()>,
    reader: Option<JoinHandle<()>>,
}

impl EegInlet for LslInlet {
    fn try_pull(&mut self) -> Result<Option<(Vec<f32>, f64)>, StreamError> {
        match self.samples.try_recv() {
            Ok(sample) => Ok(Some(sample)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(StreamError::Closed("LSL reader thread stopped".into()))
            }
        }
    }
}

impl Drop for LslInlet {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn handles_move_to_the_recorder_thread() {
        assert_send::<LslResolver>();
        assert_send::<LslInlet>();
    }

    #[test]
    fn buffered_samples_drain_before_close() {
        let (sample_tx, samples) = unbounded();
        let (stop, stop_rx) = bounded(1);
        let reader = std::thread::spawn(move || {
            sample_tx.send((vec![1.0, 2.0], 10.5)).unwrap();
            let _ = stop_rx.recv();
        });
        let mut inlet = LslInlet {
            samples,
            stop: stop.clone(),
            reader: Some(reader),
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let first = loop {
            if let Some(sample) = inlet.try_pull().unwrap() {
                break sample;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        };
        assert_eq!(first, (vec![1.0, 2.0], 10.5));

        stop.send(()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match inlet.try_pull() {
                Err(StreamError::Closed(_)) => break,
                Ok(None) => assert!(std::time::Instant::now() < deadline),
                other => panic!("unexpected pull result: {other:?}"),
            }
            std::thread::yield_now();
        }
    }
}
