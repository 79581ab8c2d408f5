use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use super::codes::{lookup, CodeEntry};
use super::{decode_alarm_words, AlarmEvent, Severity};

const HISTORY_CAPACITY: usize = 1000;

/// Deduplicating alarm store. Device poll loops feed raw fault/warning
/// register blocks; the manager turns them into active/cleared edges keyed
/// by `(source, code)` and keeps a bounded history of cleared events.
pub struct AlarmManager {
    active: RwLock<HashMap<(String, u16), AlarmEvent>>,
    history: RwLock<VecDeque<AlarmEvent>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AlarmQuery {
    #[serde(rename = "type")]
    pub source: Option<String>,
    pub severity: Option<Severity>,
    pub active: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AlarmManager {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Reconcile the alarm block read in one poll cycle against the active
    /// set for `source`. New bits raise events; bits that vanished clear
    /// the matching event into history.
    pub fn process(&self, source: &str, table: &HashMap<u16, CodeEntry>, words: &[u16]) {
        let now = Utc::now();
        let seen: HashSet<u16> = decode_alarm_words(words).into_iter().collect();

        let mut active = self.active.write();

        let cleared: Vec<(String, u16)> = active
            .keys()
            .filter(|(s, code)| s == source && !seen.contains(code))
            .cloned()
            .collect();
        if !cleared.is_empty() {
            let mut history = self.history.write();
            for key in cleared {
                if let Some(mut event) = active.remove(&key) {
                    event.active = false;
                    event.timestamp = now;
                    info!(source = %event.source, code = event.code, message = %event.message, "alarm cleared");
                    if history.len() >= HISTORY_CAPACITY {
                        history.pop_front();
                    }
                    history.push_back(event);
                }
            }
        }

        for code in seen {
            let key = (source.to_string(), code);
            if active.contains_key(&key) {
                continue;
            }
            let (message, severity) = lookup(table, code);
            let event = AlarmEvent {
                timestamp: now,
                source: source.to_string(),
                code,
                message: message.to_string(),
                severity,
                active: true,
            };
            warn!(source, code, message, severity = %severity, "alarm raised");
            active.insert(key, event);
        }
    }

    /// All currently-active events for a source, newest first.
    pub fn active_for(&self, source: &str) -> Vec<AlarmEvent> {
        let mut events: Vec<AlarmEvent> = self
            .active
            .read()
            .values()
            .filter(|e| e.source == source)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn highest_active_severity(&self) -> Option<Severity> {
        self.active.read().values().map(|e| e.severity).max()
    }

    /// Filtered view over active events and cleared history, newest first.
    pub fn query(&self, q: &AlarmQuery) -> Vec<AlarmEvent> {
        let mut events: Vec<AlarmEvent> = Vec::new();
        if q.active != Some(false) {
            events.extend(self.active.read().values().cloned());
        }
        if q.active != Some(true) {
            events.extend(self.history.read().iter().cloned());
        }

        events.retain(|e| {
            q.source.as_deref().map_or(true, |s| e.source == s)
                && q.severity.map_or(true, |s| e.severity == s)
        });
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let offset = q.offset.unwrap_or(0);
        let limit = q.limit.unwrap_or(100);
        events.into_iter().skip(offset).take(limit).collect()
    }
}

impl Default for AlarmManager {
    fn default() -> Self {
        Self::new()
    }
}
