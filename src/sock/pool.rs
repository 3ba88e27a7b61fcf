use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::machine::MachineRegistry;
use crate::sock::context::{ConnectType, SocketContext};

/// The socket context arena: `connections_per_machine * max_machines + 1`
///  contexts allocated once at init, slot 0 reserved for the acceptor.
///  Each peer slot owns `C/2` contexts per role on its free lists; worker
///  assignment is fixed round-robin at init time.
pub(crate) struct SocketPool {
    contexts: Vec<Arc<SocketContext>>,
}

impl SocketPool {
    pub(crate) fn new(config: &ClusterConfig, registry: &MachineRegistry) -> SocketPool {
        let half = config.half_connections();
        let total = config.connections_per_machine * config.max_machines + 1;

        let mut contexts = Vec::with_capacity(total);
        contexts.push(Arc::new(SocketContext::new(0, ConnectType::Server, 0)));

        let mut thread_index = 0usize;
        let mut slot = 1usize;
        for machine_index in 0..config.max_machines {
            let machine_slot = registry.slot(machine_index);

            let mut accept_free = machine_slot.accept_free.lock().unwrap();
            for _ in 0..half {
                contexts.push(Arc::new(SocketContext::new(
                    slot,
                    ConnectType::Server,
                    thread_index % config.worker_threads,
                )));
                accept_free.push(slot);
                thread_index += 1;
                slot += 1;
            }
            drop(accept_free);

            let mut connect_free = machine_slot.connect_free.lock().unwrap();
            for _ in 0..half {
                contexts.push(Arc::new(SocketContext::new(
                    slot,
                    ConnectType::Client,
                    thread_index % config.worker_threads,
                )));
                connect_free.push(slot);
                thread_index += 1;
                slot += 1;
            }
        }

        SocketPool { contexts }
    }

    pub(crate) fn get(&self, slot: usize) -> &Arc<SocketContext> {
        &self.contexts[slot]
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.len()
    }

    /// take a client-role context for an outbound connect to `ip`
    pub(crate) fn alloc_connect_context(
        &self,
        registry: &MachineRegistry,
        ip: Ipv4Addr,
    ) -> Option<Arc<SocketContext>> {
        let index = registry.machine_index(ip)?;
        let slot = registry.slot(index).connect_free.lock().unwrap().pop()?;

        let sock = self.contexts[slot].clone();
        *sock.machine.lock().unwrap() = registry.get_machine(ip);
        Some(sock)
    }

    /// take a server-role context for a freshly accepted connection
    pub(crate) fn alloc_accept_context(
        &self,
        registry: &MachineRegistry,
        ip: Ipv4Addr,
    ) -> Option<Arc<SocketContext>> {
        let index = registry.machine_index(ip)?;
        let slot = registry.slot(index).accept_free.lock().unwrap().pop()?;

        let sock = self.contexts[slot].clone();
        *sock.machine.lock().unwrap() = registry.get_machine(ip);
        Some(sock)
    }

    /// return a context to its role's free list after close
    pub(crate) fn free_context(&self, registry: &MachineRegistry, sock: &SocketContext) {
        let Some(ip) = sock.peer_ip() else {
            debug!("freeing socket context {} without a machine", sock.slot());
            return;
        };
        let Some(index) = registry.machine_index(ip) else {
            debug!("can't get slot for ip {}", ip);
            return;
        };

        let machine_slot = registry.slot(index);
        match sock.role() {
            ConnectType::Server => machine_slot.accept_free.lock().unwrap().push(sock.slot()),
            ConnectType::Client => machine_slot.connect_free.lock().unwrap().push(sock.slot()),
        }
    }
}
