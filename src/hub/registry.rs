//! Device registry: stable identity to radio address resolution.
//!
//! The registry is keyed by stable id with a secondary terminal-id index.
//! Records are created on the first message from an unseen stable id and
//! never deleted; the radio address is overwritten on every message
//! (most-recent-wins, so a re-flashed or power-cycled node keeps working).
//! Insertion past capacity is refused, never silently dropped.
//!
//! A separate legacy space holds devices that only ever identified by a
//! terminal id (pre-stable-id firmware). The two identity spaces are not
//! reconciled automatically: a legacy record stays a legacy record even if
//! a stable-id record later claims the same terminal id.

use crate::protocol::constants::REGISTRY_CAPACITY;
use crate::radio::{format_address, RadioAddress};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Errors surfaced by registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry is at capacity; the new device was refused.
    Full { capacity: usize },
    /// No record exists for the given stable id.
    UnknownDevice(u32),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { capacity } => write!(f, "registry full (capacity {})", capacity),
            Self::UnknownDevice(id) => write!(f, "unknown device: {}", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// One known node.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Permanent node identity.
    pub stable_id: u32,
    /// Terminal id assigned by the orchestrator; `None` until supplied.
    pub terminal_id: Option<u32>,
    /// Most recently seen radio address.
    pub radio_address: RadioAddress,
    /// Whether an OTA session is active for this node.
    pub ota_active: bool,
    /// When the active OTA session started.
    pub ota_started_at: Option<Instant>,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new record was created.
    Created,
    /// An existing record was refreshed.
    Refreshed,
}

/// Bounded registry of known nodes.
pub struct DeviceRegistry {
    capacity: usize,
    records: HashMap<u32, DeviceRecord>,
    /// terminal id -> stable id
    terminal_index: HashMap<u32, u32>,
    /// Legacy records keyed by terminal id only.
    legacy: HashMap<u32, RadioAddress>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_capacity(REGISTRY_CAPACITY)
    }
}

impl DeviceRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            records: HashMap::with_capacity(capacity),
            terminal_index: HashMap::new(),
            legacy: HashMap::new(),
        }
    }

    /// Number of records across both identity spaces.
    pub fn len(&self) -> usize {
        self.records.len() + self.legacy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a record by stable id.
    pub fn get(&self, stable_id: u32) -> Option<&DeviceRecord> {
        self.records.get(&stable_id)
    }

    /// Resolve a stable id to its current radio address.
    pub fn resolve(&self, stable_id: u32) -> Option<RadioAddress> {
        self.records.get(&stable_id).map(|r| r.radio_address)
    }

    /// Resolve a terminal id to a radio address: the stable-id index first,
    /// then the legacy space.
    pub fn resolve_legacy(&self, terminal_id: u32) -> Option<RadioAddress> {
        if let Some(stable_id) = self.terminal_index.get(&terminal_id) {
            return self.resolve(*stable_id);
        }
        self.legacy.get(&terminal_id).copied()
    }

    /// Record a sighting of a node.
    ///
    /// Refreshes the radio address on every call. A supplied terminal id is
    /// recorded only when the record has none yet; an already-assigned
    /// terminal id is never overwritten from this path.
    pub fn upsert(
        &mut self,
        stable_id: u32,
        radio_address: RadioAddress,
        terminal_id: Option<u32>,
    ) -> Result<UpsertOutcome, RegistryError> {
        if let Some(record) = self.records.get_mut(&stable_id) {
            record.radio_address = radio_address;
            if record.terminal_id.is_none() {
                if let Some(tid) = terminal_id {
                    record.terminal_id = Some(tid);
                    self.terminal_index.insert(tid, stable_id);
                }
            }
            return Ok(UpsertOutcome::Refreshed);
        }

        if self.len() >= self.capacity {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }

        self.records.insert(
            stable_id,
            DeviceRecord {
                stable_id,
                terminal_id,
                radio_address,
                ota_active: false,
                ota_started_at: None,
            },
        );
        if let Some(tid) = terminal_id {
            self.terminal_index.insert(tid, stable_id);
        }
        Ok(UpsertOutcome::Created)
    }

    /// Record a sighting of a legacy device identified by terminal id only.
    ///
    /// Only creates an independent legacy record when no stable-id record
    /// already owns that terminal id.
    pub fn upsert_legacy(
        &mut self,
        terminal_id: u32,
        radio_address: RadioAddress,
    ) -> Result<(), RegistryError> {
        if self.terminal_index.contains_key(&terminal_id) {
            // The stable-id record is authoritative; refresh its address.
            if let Some(stable_id) = self.terminal_index.get(&terminal_id).copied() {
                if let Some(record) = self.records.get_mut(&stable_id) {
                    record.radio_address = radio_address;
                }
            }
            return Ok(());
        }
        if !self.legacy.contains_key(&terminal_id) && self.len() >= self.capacity {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }
        self.legacy.insert(terminal_id, radio_address);
        Ok(())
    }

    /// Explicit terminal-id reassignment (host `UpdateTerminal` command).
    /// Unlike [`upsert`](Self::upsert), this path may overwrite.
    pub fn reassign_terminal(
        &mut self,
        stable_id: u32,
        new_terminal_id: u32,
    ) -> Result<(), RegistryError> {
        let record = self
            .records
            .get_mut(&stable_id)
            .ok_or(RegistryError::UnknownDevice(stable_id))?;
        if let Some(old) = record.terminal_id.take() {
            self.terminal_index.remove(&old);
        }
        record.terminal_id = Some(new_terminal_id);
        self.terminal_index.insert(new_terminal_id, stable_id);
        Ok(())
    }

    // ==================== OTA session bookkeeping ====================

    /// Mark an OTA session active for one node.
    pub fn begin_ota(&mut self, stable_id: u32, now: Instant) -> Result<(), RegistryError> {
        let record = self
            .records
            .get_mut(&stable_id)
            .ok_or(RegistryError::UnknownDevice(stable_id))?;
        record.ota_active = true;
        record.ota_started_at = Some(now);
        Ok(())
    }

    /// Clear a node's OTA session. Returns whether one was active.
    pub fn clear_ota(&mut self, stable_id: u32) -> bool {
        if let Some(record) = self.records.get_mut(&stable_id) {
            let was_active = record.ota_active;
            record.ota_active = false;
            record.ota_started_at = None;
            return was_active;
        }
        false
    }

    /// Clear every OTA session older than `max_age` and return the stable
    /// ids, each exactly once, so the caller can emit one timeout notice per
    /// node.
    pub fn sweep_ota_timeouts(&mut self, now: Instant, max_age: std::time::Duration) -> Vec<u32> {
        let mut timed_out = Vec::new();
        for record in self.records.values_mut() {
            if record.ota_active {
                if let Some(started) = record.ota_started_at {
                    if now.duration_since(started) > max_age {
                        record.ota_active = false;
                        record.ota_started_at = None;
                        timed_out.push(record.stable_id);
                    }
                }
            }
        }
        timed_out.sort_unstable();
        timed_out
    }

    /// Human-readable dump for the host `Debug` command.
    pub fn describe(&self) -> String {
        let mut ids: Vec<_> = self.records.keys().copied().collect();
        ids.sort_unstable();
        let mut out = format!("registry: {}/{} records", self.len(), self.capacity);
        for id in ids {
            let r = &self.records[&id];
            out.push_str(&format!(
                "\n  stable {} terminal {:?} addr {} ota {}",
                r.stable_id,
                r.terminal_id,
                format_address(&r.radio_address),
                r.ota_active
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(n: u8) -> RadioAddress {
        [n; 6]
    }

    // ==================== Identity resolution ====================

    #[test]
    fn test_last_write_wins_address() {
        let mut reg = DeviceRegistry::with_capacity(4);
        reg.upsert(7, addr(1), None).unwrap();
        reg.upsert(7, addr(2), None).unwrap();
        reg.upsert(7, addr(3), None).unwrap();
        assert_eq!(reg.resolve(7), Some(addr(3)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_terminal_id_set_only_when_unset() {
        let mut reg = DeviceRegistry::with_capacity(4);
        reg.upsert(7, addr(1), None).unwrap();
        reg.upsert(7, addr(1), Some(12)).unwrap();
        assert_eq!(reg.get(7).unwrap().terminal_id, Some(12));

        // A later message with a different terminal id does not overwrite.
        reg.upsert(7, addr(1), Some(99)).unwrap();
        assert_eq!(reg.get(7).unwrap().terminal_id, Some(12));
        assert_eq!(reg.resolve_legacy(12), Some(addr(1)));
        assert_eq!(reg.resolve_legacy(99), None);
    }

    #[test]
    fn test_resolve_legacy_prefers_stable_record() {
        let mut reg = DeviceRegistry::with_capacity(4);
        reg.upsert(7, addr(1), Some(12)).unwrap();
        assert_eq!(reg.resolve_legacy(12), Some(addr(1)));
    }

    #[test]
    fn test_legacy_space_is_independent() {
        let mut reg = DeviceRegistry::with_capacity(4);
        reg.upsert_legacy(55, addr(5)).unwrap();
        assert_eq!(reg.resolve_legacy(55), Some(addr(5)));
        assert_eq!(reg.resolve(55), None);

        // A stable record with the same terminal id takes precedence in
        // resolution but the legacy record is not merged away.
        reg.upsert(7, addr(1), Some(55)).unwrap();
        assert_eq!(reg.resolve_legacy(55), Some(addr(1)));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_reassign_terminal_overwrites() {
        let mut reg = DeviceRegistry::with_capacity(4);
        reg.upsert(7, addr(1), Some(12)).unwrap();
        reg.reassign_terminal(7, 30).unwrap();
        assert_eq!(reg.get(7).unwrap().terminal_id, Some(30));
        assert_eq!(reg.resolve_legacy(30), Some(addr(1)));
        assert_eq!(reg.resolve_legacy(12), None);
    }

    // ==================== Capacity ====================

    #[test]
    fn test_capacity_refusal() {
        let mut reg = DeviceRegistry::with_capacity(3);
        for id in 0..3 {
            reg.upsert(id, addr(id as u8), None).unwrap();
        }
        let result = reg.upsert(99, addr(9), None);
        assert_eq!(result, Err(RegistryError::Full { capacity: 3 }));
        assert_eq!(reg.len(), 3);

        // Existing records can still be refreshed at capacity.
        assert_eq!(reg.upsert(1, addr(7), None), Ok(UpsertOutcome::Refreshed));
        assert_eq!(reg.resolve(1), Some(addr(7)));
    }

    #[test]
    fn test_legacy_counts_toward_capacity() {
        let mut reg = DeviceRegistry::with_capacity(2);
        reg.upsert(1, addr(1), None).unwrap();
        reg.upsert_legacy(50, addr(2)).unwrap();
        assert_eq!(
            reg.upsert(2, addr(3), None),
            Err(RegistryError::Full { capacity: 2 })
        );
    }

    // ==================== OTA bookkeeping ====================

    #[test]
    fn test_begin_ota_touches_only_target() {
        let mut reg = DeviceRegistry::with_capacity(4);
        let now = Instant::now();
        reg.upsert(7, addr(1), None).unwrap();
        reg.upsert(8, addr(2), None).unwrap();

        reg.begin_ota(7, now).unwrap();
        assert!(reg.get(7).unwrap().ota_active);
        assert!(!reg.get(8).unwrap().ota_active);
    }

    #[test]
    fn test_ota_sweep_emits_each_timeout_once() {
        let mut reg = DeviceRegistry::with_capacity(4);
        let start = Instant::now();
        reg.upsert(7, addr(1), None).unwrap();
        reg.upsert(8, addr(2), None).unwrap();
        reg.begin_ota(7, start).unwrap();
        reg.begin_ota(8, start).unwrap();

        let later = start + Duration::from_secs(7 * 60 + 1);
        let timed_out = reg.sweep_ota_timeouts(later, Duration::from_secs(7 * 60));
        assert_eq!(timed_out, vec![7, 8]);

        // Second sweep finds nothing: exactly one notice per session.
        let again = reg.sweep_ota_timeouts(later, Duration::from_secs(7 * 60));
        assert!(again.is_empty());
    }

    #[test]
    fn test_ota_sweep_spares_young_sessions() {
        let mut reg = DeviceRegistry::with_capacity(4);
        let start = Instant::now();
        reg.upsert(7, addr(1), None).unwrap();
        reg.begin_ota(7, start).unwrap();

        let soon = start + Duration::from_secs(60);
        assert!(reg
            .sweep_ota_timeouts(soon, Duration::from_secs(7 * 60))
            .is_empty());
        assert!(reg.get(7).unwrap().ota_active);
    }

    #[test]
    fn test_clear_ota_reports_prior_state() {
        let mut reg = DeviceRegistry::with_capacity(4);
        reg.upsert(7, addr(1), None).unwrap();
        assert!(!reg.clear_ota(7));
        reg.begin_ota(7, Instant::now()).unwrap();
        assert!(reg.clear_ota(7));
        assert!(!reg.clear_ota(7));
    }
}
