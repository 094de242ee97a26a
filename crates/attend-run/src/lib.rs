pub mod controller;
pub mod manifest;
pub mod plan;
pub mod playback;

pub use controller::{TrialController, TrialOutcome, MANIFEST_FILE};
pub use manifest::{read_manifest, write_manifest, SessionManifest};
pub use plan::{read_trials, Cue, TrialSpec};
pub use playback::{play_fanout, Clip, OutputDevice, PacedDevice, PlaybackJob};
