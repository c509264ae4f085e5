//! Authoritative `(zone, serial)` state handed to the fan-out broadcaster.
//!
//! Zone management lives elsewhere; this store only keeps the latest serial
//! per zone and guarantees it never moves backwards.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::Utc;
use log::debug;

use crate::error::{ControlError, Result};
use crate::types::ManifestEntry;

#[derive(Debug, Default)]
pub struct ManifestStore {
    zones: RwLock<BTreeMap<String, u64>>,
}

/// Lowercase and strip the trailing root dot.
pub fn normalize_zone(zone: &str) -> String {
    zone.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from seed entries, keeping the highest serial per zone.
    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
        let store = Self::new();
        {
            let mut zones = store.zones.write().unwrap_or_else(|e| e.into_inner());
            for entry in entries {
                let serial = zones.entry(normalize_zone(&entry.zone)).or_insert(0);
                *serial = (*serial).max(entry.serial);
            }
        }
        store
    }

    /// Current manifest, sorted by zone name.
    pub fn snapshot(&self) -> Vec<ManifestEntry> {
        let zones = self.zones.read().unwrap_or_else(|e| e.into_inner());
        zones
            .iter()
            .map(|(zone, serial)| ManifestEntry::new(zone.clone(), *serial))
            .collect()
    }

    pub fn serial(&self, zone: &str) -> Option<u64> {
        let zones = self.zones.read().unwrap_or_else(|e| e.into_inner());
        zones.get(&normalize_zone(zone)).copied()
    }

    /// Record a new serial for `zone`. It must strictly exceed the stored one.
    pub fn publish(&self, zone: &str, serial: u64) -> Result<ManifestEntry> {
        let zone = normalize_zone(zone);
        let mut zones = self.zones.write().unwrap_or_else(|e| e.into_inner());
        if let Some(&current) = zones.get(&zone) {
            if serial <= current {
                return Err(ControlError::SerialRegression {
                    zone,
                    current,
                    proposed: serial,
                });
            }
        }
        zones.insert(zone.clone(), serial);
        debug!("Published {} serial {}", zone, serial);
        Ok(ManifestEntry::new(zone, serial))
    }

    /// Assign a fresh nanosecond-derived serial to `zone`.
    ///
    /// Falls back to `current + 1` when the clock has not advanced past the
    /// stored serial. Fails once the serial space is exhausted.
    pub fn bump(&self, zone: &str) -> Result<ManifestEntry> {
        let zone = normalize_zone(zone);
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX) as u64;
        let mut zones = self.zones.write().unwrap_or_else(|e| e.into_inner());
        let serial = match zones.get(&zone) {
            Some(&current) if now <= current => {
                current
                    .checked_add(1)
                    .ok_or_else(|| ControlError::SerialRegression {
                        zone: zone.clone(),
                        current,
                        proposed: current,
                    })?
            }
            _ => now,
        };
        zones.insert(zone.clone(), serial);
        Ok(ManifestEntry::new(zone, serial))
    }

    pub fn len(&self) -> usize {
        self.zones.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
