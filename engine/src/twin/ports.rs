//! Debug-port allocation for emulated machines.
//!
//! A BLAKE3 digest of `(battle_id, role)` picks a stable starting port;
//! linear probing skips ports already recorded in the shared registry or
//! currently bound on the host. The registry is a JSON map in the work root
//! so concurrently running battles see each other's allocations.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use crate::error::{BattleError, BattleResult};
use crate::model::Role;
use crate::persistence::write_json_atomic;

/// File name of the registry under the work root.
pub const REGISTRY_FILE: &str = "ports.json";

/// Port allocator backed by an on-disk registry.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    registry: PathBuf,
    base: u16,
    span: u16,
}

impl PortAllocator {
    pub fn new(work_root: &Path, base: u16, span: u16) -> Self {
        Self {
            registry: work_root.join(REGISTRY_FILE),
            base,
            span: span.max(1),
        }
    }

    fn key(battle_id: &str, role: Role) -> String {
        format!("{battle_id}/{role}")
    }

    /// Stable first candidate for a battle/role pair.
    pub fn preferred_port(&self, battle_id: &str, role: Role) -> u16 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(battle_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(role.as_str().as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        let offset = u64::from_le_bytes(head) % u64::from(self.span);
        // offset < span <= u16::MAX
        self.base.saturating_add(offset as u16)
    }

    fn load(&self) -> BattleResult<BTreeMap<String, u16>> {
        if !self.registry.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.registry)?;
        serde_json::from_str(&raw)
            .map_err(|e| BattleError::persistence(&self.registry, e.to_string()))
    }

    /// Allocate (or return the existing) port for `battle_id`/`role`.
    pub fn allocate(&self, battle_id: &str, role: Role) -> BattleResult<u16> {
        let mut entries = self.load()?;
        let key = Self::key(battle_id, role);
        if let Some(port) = entries.get(&key) {
            return Ok(*port);
        }

        let start = self.preferred_port(battle_id, role);
        for step in 0..self.span {
            let offset = (u32::from(start - self.base) + u32::from(step)) % u32::from(self.span);
            let Some(port) = self.base.checked_add(offset as u16) else {
                continue;
            };
            if entries.values().any(|p| *p == port) || !port_is_free(port) {
                continue;
            }
            entries.insert(key, port);
            write_json_atomic(&self.registry, &entries)?;
            return Ok(port);
        }

        Err(BattleError::setup(
            "qemu",
            format!("no free debug port in {}..{}", self.base, u32::from(self.base) + u32::from(self.span)),
        ))
    }

    /// Drop every allocation belonging to `battle_id`.
    pub fn release(&self, battle_id: &str) -> BattleResult<()> {
        let mut entries = self.load()?;
        let prefix = format!("{battle_id}/");
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(&prefix));
        if entries.len() != before {
            write_json_atomic(&self.registry, &entries)?;
        }
        Ok(())
    }

    /// Currently recorded port for a pair.
    #[cfg(test)]
    fn lookup(&self, battle_id: &str, role: Role) -> BattleResult<Option<u16>> {
        Ok(self.load()?.get(&Self::key(battle_id, role)).copied())
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_port_is_stable_and_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = PortAllocator::new(dir.path(), 30_000, 1_000);
        let a = alloc.preferred_port("b-1", Role::Arena);
        assert_eq!(a, alloc.preferred_port("b-1", Role::Arena));
        assert!((30_000..31_000).contains(&a));
    }

    #[test]
    fn test_allocations_are_unique_and_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = PortAllocator::new(dir.path(), 40_000, 2_000);

        let mut ports = Vec::new();
        for battle in ["b-1", "b-2"] {
            for role in Role::ALL {
                ports.push(alloc.allocate(battle, role).unwrap());
            }
        }
        let mut unique = ports.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ports.len());

        assert_eq!(alloc.allocate("b-1", Role::Attacker).unwrap(), ports[0]);
    }

    #[test]
    fn test_collision_probes_forward() {
        let dir = tempfile::tempdir().unwrap();
        // span of 3 forces every role of one battle into distinct slots
        let alloc = PortAllocator::new(dir.path(), 41_000, 3);
        let mut ports: Vec<u16> = Role::ALL
            .iter()
            .map(|r| alloc.allocate("b-9", *r).unwrap())
            .collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![41_000, 41_001, 41_002]);
        assert!(alloc.allocate("b-10", Role::Arena).is_err());
    }

    #[test]
    fn test_release_frees_battle_ports() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = PortAllocator::new(dir.path(), 42_000, 500);
        alloc.allocate("b-1", Role::Arena).unwrap();
        alloc.allocate("b-2", Role::Arena).unwrap();

        alloc.release("b-1").unwrap();
        assert_eq!(alloc.lookup("b-1", Role::Arena).unwrap(), None);
        assert!(alloc.lookup("b-2", Role::Arena).unwrap().is_some());
    }
}
