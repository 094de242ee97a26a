pub mod config;
pub mod error;
pub mod gate;
pub mod io;
pub mod recorder;
pub mod sample;
pub mod source;

pub use config::{ExperimentConfig, RecorderConfig};
pub use error::{ConnectionError, RecorderError, SinkError, StreamError};
pub use gate::CancellationGate;
pub use recorder::{
    LoopExit, LoopReport, Recorder, RecordingSession, SessionReport, SessionState, SourceFailure,
};
pub use sample::{Payload, Sample, StreamKind};
pub use source::StreamSource;
