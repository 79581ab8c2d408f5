//! Static alarm code tables per device class. Codes follow the register
//! bit layout: `(word * 16 + bit) + 1`. Codes absent from a table render
//! as "Unknown" with LOW severity.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use super::Severity;

pub struct CodeEntry {
    pub message: &'static str,
    pub severity: Severity,
}

const fn entry(message: &'static str, severity: Severity) -> CodeEntry {
    CodeEntry { message, severity }
}

pub fn lookup(table: &HashMap<u16, CodeEntry>, code: u16) -> (&'static str, Severity) {
    table
        .get(&code)
        .map(|e| (e.message, e.severity))
        .unwrap_or(("Unknown", Severity::Low))
}

pub static BMS_FAULTS: Lazy<HashMap<u16, CodeEntry>> = Lazy::new(|| {
    use Severity::*;
    HashMap::from([
        (1, entry("Cell overvoltage", High)),
        (2, entry("Cell undervoltage", High)),
        (3, entry("Pack overvoltage", High)),
        (4, entry("Pack undervoltage", High)),
        (5, entry("Charge overcurrent", High)),
        (6, entry("Discharge overcurrent", High)),
        (7, entry("Cell overtemperature", High)),
        (8, entry("Cell undertemperature", High)),
        (9, entry("Cell temperature spread too large", Medium)),
        (10, entry("Cell voltage spread too large", Medium)),
        (11, entry("Insulation resistance low", High)),
        (12, entry("Main contactor failure", High)),
        (13, entry("Precharge failure", High)),
        (14, entry("Fuse blown", High)),
        (15, entry("Current sensor failure", High)),
        (16, entry("Voltage sense failure", High)),
        (17, entry("Temperature sense failure", Medium)),
        (18, entry("Internal CAN communication lost", High)),
        (19, entry("Rack offline", High)),
        (20, entry("Rack voltage mismatch", Medium)),
        (21, entry("Cooling system failure", Medium)),
        (22, entry("Fire suppression activated", High)),
        (23, entry("Smoke detected", High)),
        (24, entry("Door open", Low)),
        (25, entry("Humidity high", Low)),
        (26, entry("SOC estimation error", Medium)),
        (27, entry("Balancing circuit failure", Medium)),
        (28, entry("Charge inhibit active", Medium)),
        (29, entry("Discharge inhibit active", Medium)),
        (30, entry("BMS internal fault", High)),
        (31, entry("Auxiliary supply undervoltage", Medium)),
        (32, entry("Heartbeat lost to EMS", Medium)),
    ])
});

pub static BMS_WARNINGS: Lazy<HashMap<u16, CodeEntry>> = Lazy::new(|| {
    use Severity::*;
    HashMap::from([
        (1, entry("Cell voltage high", Medium)),
        (2, entry("Cell voltage low", Medium)),
        (3, entry("Pack voltage high", Medium)),
        (4, entry("Pack voltage low", Medium)),
        (5, entry("Charge current high", Medium)),
        (6, entry("Discharge current high", Medium)),
        (7, entry("Cell temperature high", Medium)),
        (8, entry("Cell temperature low", Medium)),
        (9, entry("Insulation resistance degrading", Medium)),
        (10, entry("SOC low", Low)),
        (11, entry("SOC high", Low)),
        (12, entry("SOH degraded", Low)),
        (13, entry("Balancing active for extended period", Low)),
        (14, entry("Ambient temperature high", Low)),
        (15, entry("Ambient temperature low", Low)),
        (16, entry("Cooling capacity reduced", Low)),
    ])
});

pub static PCS_FAULTS: Lazy<HashMap<u16, CodeEntry>> = Lazy::new(|| {
    use Severity::*;
    HashMap::from([
        (1, entry("DC overvoltage", High)),
        (2, entry("DC undervoltage", High)),
        (3, entry("DC overcurrent", High)),
        (4, entry("AC overcurrent", High)),
        (5, entry("AC overvoltage", High)),
        (6, entry("AC undervoltage", High)),
        (7, entry("Grid frequency out of range", High)),
        (8, entry("Grid synchronization lost", High)),
        (9, entry("IGBT overtemperature", High)),
        (10, entry("Transformer overtemperature", High)),
        (11, entry("Cabinet overtemperature", Medium)),
        (12, entry("Cooling fan failure", Medium)),
        (13, entry("DC contactor failure", High)),
        (14, entry("AC breaker open unexpectedly", High)),
        (15, entry("Precharge timeout", High)),
        (16, entry("Insulation monitoring fault", High)),
        (17, entry("Ground fault detected", High)),
        (18, entry("Phase loss", High)),
        (19, entry("Phase sequence error", High)),
        (20, entry("Emergency stop engaged", High)),
        (21, entry("Internal communication lost", High)),
        (22, entry("Control supply undervoltage", Medium)),
        (23, entry("Firmware integrity check failed", High)),
        (24, entry("Derating limit exceeded", Medium)),
    ])
});

pub static PCS_WARNINGS: Lazy<HashMap<u16, CodeEntry>> = Lazy::new(|| {
    use Severity::*;
    HashMap::from([
        (1, entry("IGBT temperature high", Medium)),
        (2, entry("Transformer temperature high", Medium)),
        (3, entry("Cabinet temperature high", Low)),
        (4, entry("Grid voltage unbalanced", Medium)),
        (5, entry("Grid frequency deviating", Medium)),
        (6, entry("Active power derated", Medium)),
        (7, entry("Reactive power derated", Low)),
        (8, entry("DC link ripple high", Low)),
        (9, entry("Fan speed reduced", Low)),
        (10, entry("Filter capacitor aging", Low)),
        (11, entry("Heartbeat lost to EMS", Medium)),
        (12, entry("Energy counter near rollover", Low)),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_code_resolves_message_and_severity() {
        let (message, severity) = lookup(&BMS_FAULTS, 1);
        assert_eq!(message, "Cell overvoltage");
        assert_eq!(severity, Severity::High);
    }

    #[test]
    fn unknown_code_defaults_to_low() {
        let (message, severity) = lookup(&BMS_FAULTS, 9999);
        assert_eq!(message, "Unknown");
        assert_eq!(severity, Severity::Low);
    }
}
