use serde::{Deserialize, Serialize};
use std::fmt;

/// Which live stream a sample came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Eeg,
    Gaze,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Eeg => "eeg",
            StreamKind::Gaze => "gaze",
        }
    }

    /// File name of this stream's log inside a session directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            StreamKind::Eeg => "eeg_data.jsonl",
            StreamKind::Gaze => "gaze_data.jsonl",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Stream-specific body of a sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    /// One value per channel; width is fixed by the connected stream.
    Eeg { channels: Vec<f32> },
    /// Normalized screen coordinates, `None` when the tracker had no fixation.
    Gaze { gaze2d: Option<[f64; 2]> },
}

/// One timestamped observation. Timestamps are in the provider's own clock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp: f64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Sample {
    pub fn eeg(timestamp: f64, channels: Vec<f32>) -> Self {
        Self {
            timestamp,
            payload: Payload::Eeg { channels },
        }
    }

    pub fn gaze(timestamp: f64, gaze2d: Option<[f64; 2]>) -> Self {
        Self {
            timestamp,
            payload: Payload::Gaze { gaze2d },
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self.payload {
            Payload::Eeg { .. } => StreamKind::Eeg,
            Payload::Gaze { .. } => StreamKind::Gaze,
        }
    }

    pub fn has_fixation(&self) -> bool {
        !matches!(self.payload, Payload::Gaze { gaze2d: None })
    }
}
