//! Station configuration keys
//!
//! Read by GetConfiguration / GetVariables and written by
//! ChangeConfiguration / SetVariables.

use std::collections::BTreeMap;

use crate::transaction::METER_SAMPLE_INTERVAL;

pub const HEARTBEAT_INTERVAL_KEY: &str = "HeartbeatInterval";
pub const METER_VALUE_SAMPLE_INTERVAL_KEY: &str = "MeterValueSampleInterval";
pub const NUMBER_OF_CONNECTORS_KEY: &str = "NumberOfConnectors";

/// Heartbeat period used until the central system sets one
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub value: String,
    pub readonly: bool,
}

/// Outcome of writing a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWrite {
    Accepted,
    Rejected,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    entries: BTreeMap<String, ConfigEntry>,
}

impl ConfigStore {
    pub fn new(number_of_connectors: usize) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            HEARTBEAT_INTERVAL_KEY.to_string(),
            ConfigEntry { value: DEFAULT_HEARTBEAT_SECS.to_string(), readonly: false },
        );
        entries.insert(
            METER_VALUE_SAMPLE_INTERVAL_KEY.to_string(),
            ConfigEntry { value: METER_SAMPLE_INTERVAL.as_secs().to_string(), readonly: true },
        );
        entries.insert(
            NUMBER_OF_CONNECTORS_KEY.to_string(),
            ConfigEntry { value: number_of_connectors.to_string(), readonly: true },
        );
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&ConfigEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &ConfigEntry)> {
        self.entries.iter()
    }

    /// Write from the central system: read-only keys and malformed values are rejected
    pub fn set(&mut self, key: &str, value: &str) -> ConfigWrite {
        let Some(entry) = self.entries.get_mut(key) else {
            return ConfigWrite::Unknown;
        };
        if entry.readonly {
            return ConfigWrite::Rejected;
        }
        if key == HEARTBEAT_INTERVAL_KEY && value.trim().parse::<u64>().is_err() {
            return ConfigWrite::Rejected;
        }
        entry.value = value.trim().to_string();
        ConfigWrite::Accepted
    }

    /// Local write that ignores the read-only flag
    pub(crate) fn force(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value.to_string();
        }
    }

    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.get(HEARTBEAT_INTERVAL_KEY)
            .and_then(|entry| entry.value.parse().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_SECS)
    }
}
