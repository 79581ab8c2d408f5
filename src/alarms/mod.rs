pub mod codes;
mod manager;

pub use manager::{AlarmManager, AlarmQuery};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Alarm severity, ordered LOW < MEDIUM < HIGH.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One alarm edge. Identity is `(source, code)`; a cleared alarm is the
/// same event re-emitted with `active = false`.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmEvent {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub code: u16,
    pub message: String,
    pub severity: Severity,
    pub active: bool,
}

/// Extract the alarm codes encoded in a fault/warning register block.
/// Bit `b` of word `w` maps to code `w * 16 + b + 1`.
pub fn decode_alarm_words(words: &[u16]) -> Vec<u16> {
    let mut out = Vec::new();
    for (word_index, word) in words.iter().enumerate() {
        for bit in 0..16u16 {
            if word & (1 << bit) != 0 {
                out.push(word_index as u16 * 16 + bit + 1);
            }
        }
    }
    out
}
