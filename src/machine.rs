use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

use anyhow::bail;

/// A peer node of the cluster. One record per configured peer, created by
///  `add_machine` and never removed.
pub struct ClusterMachine {
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub cluster_port: u16,
    proto_major: AtomicU32,
    proto_minor: AtomicU32,
    /// a dead peer is retried on a much shorter back-off cap
    dead: AtomicBool,
    /// whether an up-notification has been emitted and not yet revoked;
    ///  de-duplicates notifications across the peer's sockets
    up: AtomicBool,
}

impl ClusterMachine {
    fn new(ip: Ipv4Addr, cluster_port: u16) -> ClusterMachine {
        ClusterMachine {
            ip,
            hostname: ip.to_string(),
            cluster_port,
            proto_major: AtomicU32::new(0),
            proto_minor: AtomicU32::new(0),
            dead: AtomicBool::new(false),
            up: AtomicBool::new(false),
        }
    }

    pub fn proto_version(&self) -> (u32, u32) {
        (
            self.proto_major.load(Ordering::Relaxed),
            self.proto_minor.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_proto_version(&self, major: u32, minor: u32) {
        self.proto_major.store(major, Ordering::Relaxed);
        self.proto_minor.store(minor, Ordering::Relaxed);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}

/// One slot of the fixed-size peer array. The free lists hold socket
///  context slots of the two roles; `connected` holds the promoted sockets
///  used for round-robin outbound spreading.
pub(crate) struct MachineSlot {
    /// ip the slot is bound to; 0 while unused. Written once under the
    ///  registry's alloc lock, read lock-free by the probing lookups.
    ip: AtomicU32,
    machine: OnceLock<Arc<ClusterMachine>>,
    pub(crate) accept_free: Mutex<Vec<usize>>,
    pub(crate) connect_free: Mutex<Vec<usize>>,
    connected: Mutex<Vec<usize>>,
    rr_index: AtomicUsize,
}

impl MachineSlot {
    fn new() -> MachineSlot {
        MachineSlot {
            ip: AtomicU32::new(0),
            machine: OnceLock::new(),
            accept_free: Mutex::new(Vec::new()),
            connect_free: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
            rr_index: AtomicUsize::new(0),
        }
    }
}

/// The peer roster: a fixed array of slots addressed by linear probing on
///  `ip % len`. Lookups probe lock-free; slot allocation serializes on one
///  lock.
pub(crate) struct MachineRegistry {
    slots: Box<[MachineSlot]>,
    alloc_lock: Mutex<()>,
}

impl MachineRegistry {
    pub(crate) fn new(max_machines: usize) -> MachineRegistry {
        MachineRegistry {
            slots: (0..max_machines).map(|_| MachineSlot::new()).collect(),
            alloc_lock: Mutex::new(()),
        }
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, index: usize) -> &MachineSlot {
        &self.slots[index]
    }

    /// deterministic slot of `ip`, probing at most `slot_count` entries
    pub(crate) fn machine_index(&self, ip: Ipv4Addr) -> Option<usize> {
        let raw = u32::from(ip);
        let n = self.slots.len();
        for i in 0..n {
            let index = (raw as usize + i) % n;
            if self.slots[index].ip.load(Ordering::Acquire) == raw {
                return Some(index);
            }
        }
        None
    }

    fn alloc_machine_index(&self, ip: Ipv4Addr) -> Option<usize> {
        let raw = u32::from(ip);
        let n = self.slots.len();
        for i in 0..n {
            let index = (raw as usize + i) % n;
            if self.slots[index].ip.load(Ordering::Acquire) == 0 {
                return Some(index);
            }
        }
        warn!("can't allocate slot for ip {}", ip);
        None
    }

    pub(crate) fn get_machine(&self, ip: Ipv4Addr) -> Option<Arc<ClusterMachine>> {
        self.machine_index(ip)
            .and_then(|i| self.slots[i].machine.get().cloned())
    }

    /// register a peer, returning the existing record if it is already known
    pub(crate) fn add_machine(
        &self,
        ip: Ipv4Addr,
        cluster_port: u16,
    ) -> anyhow::Result<Arc<ClusterMachine>> {
        if u32::from(ip) == 0 {
            bail!("0.0.0.0 is not a valid peer address");
        }

        let _guard = self.alloc_lock.lock().unwrap();
        if let Some(existing) = self.machine_index(ip) {
            return Ok(self.slots[existing].machine.get().cloned().unwrap());
        }

        let Some(index) = self.alloc_machine_index(ip) else {
            bail!("no free peer slot for {} (all {} in use)", ip, self.slots.len());
        };

        let machine = Arc::new(ClusterMachine::new(ip, cluster_port));
        self.slots[index]
            .machine
            .set(machine.clone())
            .ok()
            .expect("slot is empty under the alloc lock");
        self.slots[index].ip.store(u32::from(ip), Ordering::Release);

        debug!("added machine {}:{} at slot {}", ip, cluster_port, index);
        Ok(machine)
    }

    /// publish a promoted socket to the peer's round-robin list. Returns
    ///  true when this connection took the peer from down to up (the caller
    ///  emits the notification exactly once).
    pub(crate) fn add_connection(&self, ip: Ipv4Addr, sock_slot: usize) -> anyhow::Result<bool> {
        let Some(index) = self.machine_index(ip) else {
            bail!("no peer slot for {}", ip);
        };
        self.slots[index].connected.lock().unwrap().push(sock_slot);

        let machine = self.slots[index].machine.get().unwrap();
        let became_up = !machine.up.swap(true, Ordering::AcqRel);
        if became_up {
            machine.dead.store(false, Ordering::Relaxed);
        }
        Ok(became_up)
    }

    /// withdraw a closed socket. Returns true when this was the peer's last
    ///  connection (down transition).
    pub(crate) fn remove_connection(&self, ip: Ipv4Addr, sock_slot: usize) -> bool {
        let Some(index) = self.machine_index(ip) else {
            return false;
        };

        let emptied = {
            let mut connected = self.slots[index].connected.lock().unwrap();
            connected.retain(|&s| s != sock_slot);
            connected.is_empty()
        };
        if !emptied {
            return false;
        }

        let machine = self.slots[index].machine.get().unwrap();
        let became_down = machine.up.swap(false, Ordering::AcqRel);
        if became_down {
            machine.dead.store(true, Ordering::Relaxed);
        }
        became_down
    }

    /// one of the peer's sockets, spread round-robin across calls
    pub(crate) fn round_robin_connection(&self, ip: Ipv4Addr) -> Option<usize> {
        let index = self.machine_index(ip)?;
        let slot = &self.slots[index];
        let connected = slot.connected.lock().unwrap();
        if connected.is_empty() {
            return None;
        }
        let i = slot.rr_index.fetch_add(1, Ordering::Relaxed) % connected.len();
        Some(connected[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[test]
    fn test_add_and_get() {
        let registry = MachineRegistry::new(8);
        let machine = registry.add_machine(ip(1), 8086).unwrap();
        assert_eq!(machine.ip, ip(1));
        assert_eq!(machine.hostname, "10.0.0.1");

        let found = registry.get_machine(ip(1)).unwrap();
        assert!(Arc::ptr_eq(&machine, &found));
        assert!(registry.get_machine(ip(2)).is_none());
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = MachineRegistry::new(8);
        let first = registry.add_machine(ip(1), 8086).unwrap();
        let second = registry.add_machine(ip(1), 8086).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_probing_resolves_collisions() {
        // slot count 4: 10.0.0.1 and 10.0.0.5 collide modulo 4
        let registry = MachineRegistry::new(4);
        let a = registry.add_machine(ip(1), 8086).unwrap();
        let b = registry.add_machine(ip(5), 8086).unwrap();

        assert!(Arc::ptr_eq(&a, &registry.get_machine(ip(1)).unwrap()));
        assert!(Arc::ptr_eq(&b, &registry.get_machine(ip(5)).unwrap()));
        assert_ne!(
            registry.machine_index(ip(1)),
            registry.machine_index(ip(5))
        );
    }

    #[test]
    fn test_registry_capacity_bounded() {
        let registry = MachineRegistry::new(2);
        registry.add_machine(ip(1), 8086).unwrap();
        registry.add_machine(ip(2), 8086).unwrap();
        assert!(registry.add_machine(ip(3), 8086).is_err());
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let registry = MachineRegistry::new(16);
        for last in 1..10 {
            registry.add_machine(ip(last), 8086).unwrap();
        }
        for last in 1..10 {
            let first = registry.machine_index(ip(last));
            assert!(first.is_some());
            assert_eq!(first, registry.machine_index(ip(last)));
        }
    }

    #[test]
    fn test_up_down_transitions_deduplicated() {
        let registry = MachineRegistry::new(8);
        let machine = registry.add_machine(ip(1), 8086).unwrap();

        assert!(registry.add_connection(ip(1), 10).unwrap());
        assert!(!registry.add_connection(ip(1), 11).unwrap());
        assert!(machine.is_up());
        assert!(!machine.is_dead());

        assert!(!registry.remove_connection(ip(1), 10));
        assert!(registry.remove_connection(ip(1), 11));
        assert!(!machine.is_up());
        assert!(machine.is_dead());
    }

    #[rstest]
    #[case(vec![10], vec![10, 10, 10])]
    #[case(vec![10, 11], vec![10, 11, 10])]
    #[case(vec![10, 11, 12], vec![10, 11, 12])]
    fn test_round_robin(#[case] socks: Vec<usize>, #[case] expected: Vec<usize>) {
        let registry = MachineRegistry::new(8);
        registry.add_machine(ip(1), 8086).unwrap();
        for s in socks {
            registry.add_connection(ip(1), s).unwrap();
        }

        let picked: Vec<usize> = (0..expected.len())
            .map(|_| registry.round_robin_connection(ip(1)).unwrap())
            .collect();
        assert_eq!(picked, expected);
    }

    #[test]
    fn test_round_robin_empty() {
        let registry = MachineRegistry::new(8);
        registry.add_machine(ip(1), 8086).unwrap();
        assert!(registry.round_robin_connection(ip(1)).is_none());
    }
}
