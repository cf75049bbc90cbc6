pub mod config;
pub mod sink;
pub mod stop;

pub use sink::{MemorySink, OutputSink, StdoutSink, TracingSink};
pub use stop::StopSignal;
