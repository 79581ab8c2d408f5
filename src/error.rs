use thiserror::Error;

/// Errors produced by the device layer, the control logic and the FCR-N
/// engine. HTTP and register-server boundaries map these onto their own
/// wire representations; see `api::error` and `modbus::server`.
#[derive(Debug, Error)]
pub enum EmsError {
    #[error("device not connected")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("device returned modbus exception {code}")]
    Protocol { code: u8 },

    #[error("{what} {value} outside allowed range [{min}, {max}]")]
    OutOfRange {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("operation not allowed in {mode} mode")]
    WrongMode { mode: crate::control::Mode },

    #[error("battery {0} is in fault state")]
    DeviceFault(u16),

    #[error("unknown device id {0}")]
    NotFound(u16),

    #[error("frequency source has gone stale")]
    StaleFrequency,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EmsError {
    pub fn out_of_range(what: &'static str, value: f64, min: f64, max: f64) -> Self {
        Self::OutOfRange {
            what,
            value,
            min,
            max,
        }
    }
}

pub type Result<T, E = EmsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_message_names_the_field() {
        let e = EmsError::out_of_range("active power", 1600.0, -1500.0, 1500.0);
        assert!(e.to_string().contains("active power"));
        assert!(e.to_string().contains("1600"));
    }
}
