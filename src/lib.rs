pub mod alarms;
pub mod api;
pub mod config;
pub mod control;
pub mod devices;
pub mod error;
pub mod fcrn;
pub mod modbus;
pub mod persistence;
pub mod state;
pub mod telemetry;

pub use error::{EmsError, Result};
