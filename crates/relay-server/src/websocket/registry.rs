//! Connection ID → state machine map.
//!
//! One instance lives in the server state; nothing here is a global.

use std::sync::Arc;

use dashmap::DashMap;
use relay_core::ConnectionId;
use tracing::debug;

use super::state::ConnectionStateMachine;

/// Concurrent registry of per-connection state machines.
#[derive(Debug, Default)]
pub struct ConnectionStateMachineRegistry {
    machines: DashMap<ConnectionId, Arc<ConnectionStateMachine>>,
}

impl ConnectionStateMachineRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `machine` under `id`, returning any machine it replaced.
    pub fn register(
        &self,
        id: ConnectionId,
        machine: Arc<ConnectionStateMachine>,
    ) -> Option<Arc<ConnectionStateMachine>> {
        debug!(connection_id = %id, "state machine registered");
        self.machines.insert(id, machine)
    }

    /// Remove and return the machine for `id`.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ConnectionStateMachine>> {
        let removed = self.machines.remove(id).map(|(_, m)| m);
        if removed.is_some() {
            debug!(connection_id = %id, "state machine unregistered");
        }
        removed
    }

    /// Machine for `id`, if registered.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionStateMachine>> {
        self.machines.get(id).map(|m| Arc::clone(m.value()))
    }

    /// Machine for `id`, creating a fresh `Connecting` one if absent.
    pub fn get_or_create(&self, id: &ConnectionId) -> Arc<ConnectionStateMachine> {
        Arc::clone(
            self.machines
                .entry(id.clone())
                .or_insert_with(|| Arc::new(ConnectionStateMachine::new(id.clone())))
                .value(),
        )
    }

    /// Number of registered machines.
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Snapshot of registered IDs.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.machines.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop machines that reached a terminal state. Returns how many.
    pub fn prune_terminal(&self) -> usize {
        let before = self.machines.len();
        self.machines.retain(|_, m| !m.is_terminal());
        let pruned = before.saturating_sub(self.machines.len());
        if pruned > 0 {
            debug!(pruned, "pruned terminal state machines");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::state::ConnectionState;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    #[test]
    fn register_get_unregister() {
        let reg = ConnectionStateMachineRegistry::new();
        assert!(reg.is_empty());
        let m = Arc::new(ConnectionStateMachine::new(id("a")));
        assert!(reg.register(id("a"), m.clone()).is_none());
        assert!(Arc::ptr_eq(&reg.get(&id("a")).unwrap(), &m));
        assert_eq!(reg.len(), 1);

        assert!(reg.unregister(&id("a")).is_some());
        assert!(reg.get(&id("a")).is_none());
        assert!(reg.unregister(&id("a")).is_none());
    }

    #[test]
    fn register_replaces_existing() {
        let reg = ConnectionStateMachineRegistry::new();
        let first = Arc::new(ConnectionStateMachine::new(id("a")));
        let second = Arc::new(ConnectionStateMachine::new(id("a")));
        let _ = reg.register(id("a"), first.clone());
        let replaced = reg.register(id("a"), second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&reg.get(&id("a")).unwrap(), &second));
    }

    #[test]
    fn get_or_create_returns_same_instance() {
        let reg = ConnectionStateMachineRegistry::new();
        let a = reg.get_or_create(&id("a"));
        let b = reg.get_or_create(&id("a"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.current_state(), ConnectionState::Connecting);
    }

    #[test]
    fn prune_terminal_keeps_live_machines() {
        let reg = ConnectionStateMachineRegistry::new();
        let live = reg.get_or_create(&id("live"));
        let dead = reg.get_or_create(&id("dead"));
        live.transition(ConnectionState::Accepted, "upgrade").unwrap();
        dead.transition(ConnectionState::Closed, "bye").unwrap();

        assert_eq!(reg.prune_terminal(), 1);
        assert_eq!(reg.connection_ids(), vec![id("live")]);
    }

    #[test]
    fn concurrent_registration_of_distinct_ids() {
        let reg = Arc::new(ConnectionStateMachineRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let cid = id(&format!("c{t}-{i}"));
                        let _ = reg.get_or_create(&cid);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 400);
    }
}
