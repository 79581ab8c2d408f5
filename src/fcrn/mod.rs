mod controller;
mod service;

pub use controller::{FcrnController, FcrnStatus, PowerSink};
pub use service::{FcrnService, FrequencySource, PcsFrequencySource, PcsPowerSink};
