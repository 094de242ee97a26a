//! Live data providers the recorder pulls from.
//!
//! Every source is driven by exactly one pull loop on the recorder's
//! single-threaded runtime, so implementations must yield (await) while they
//! wait for data instead of blocking the thread.

pub mod eeg;
pub mod gaze;
#[cfg(feature = "lsl")]
pub mod lsl;
pub mod synthetic;

use crate::error::{ConnectionError, StreamError};
use crate::sample::{Sample, StreamKind};
use async_trait::async_trait;
use std::time::Duration;

pub use eeg::{EegInlet, EegResolver, EegSource, StreamDescriptor};
pub use gaze::{GazeData, GazeFrame, GazeSource, GazeTransport, TcpGazeTransport};
#[cfg(feature = "lsl")]
pub use lsl::LslResolver;
pub use synthetic::{SyntheticEeg, SyntheticGaze};

#[async_trait]
pub trait StreamSource: Send {
    fn kind(&self) -> StreamKind;

    /// Human readable name used in logs and reports.
    fn describe(&self) -> String;

    async fn connect(&mut self) -> Result<(), ConnectionError>;

    /// Next sample, or `StreamError::Timeout` once `max_wait` has elapsed.
    async fn pull(&mut self, max_wait: Duration) -> Result<Sample, StreamError>;

    /// Release the connection. Safe to call repeatedly or without `connect`.
    async fn disconnect(&mut self);
}

