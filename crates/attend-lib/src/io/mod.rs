pub mod sink;

pub use sink::{read_sink, SignalSink};
