use crate::sample::StreamKind;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Discovery or handshake failure. Fatal for the one source that raised it.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no {stream_type} stream advertised within {window:?}")]
    NoStreamFound {
        stream_type: String,
        window: Duration,
    },
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },
    #[error("connecting to {peer} timed out after {after:?}")]
    Timeout { peer: String, after: Duration },
    #[error("I/O error while connecting: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single `pull()`.
#[derive(Debug, Error)]
pub enum StreamError {
    /// No sample arrived within the allowed wait. The pull loop may retry.
    #[error("no sample within {0:?}")]
    Timeout(Duration),
    /// The provider ended the stream or it became unusable.
    #[error("stream closed: {0}")]
    Closed(String),
}

/// Failure persisting samples. Never retried.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("creating {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("encoding record for {path}: {source}")]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("sink {0} is already closed")]
    Closed(PathBuf),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("creating output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("more than one {0} source configured for one session")]
    DuplicateStream(StreamKind),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("recorder worker failed to start: {0}")]
    Worker(#[source] std::io::Error),
    #[error("recorder worker panicked")]
    WorkerPanicked,
    #[error("pull loops still running {timeout:?} after stop was signaled")]
    StopTimeout { timeout: Duration },
}
