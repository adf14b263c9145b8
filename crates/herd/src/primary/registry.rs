//! ActiveWorkers registry: which port each live worker process owns.

use std::collections::HashMap;

/// Mapping from worker process id to its assigned port.
///
/// Owned by the primary event loop. Consulted on exit to recover the port a
/// replacement worker must bind.
#[derive(Debug, Default)]
pub struct ActiveWorkers {
    ports: HashMap<u32, u16>,
}

impl ActiveWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the port previously registered for `pid`, if any.
    pub fn register(&mut self, pid: u32, port: u16) -> Option<u16> {
        self.ports.insert(pid, port)
    }

    /// Remove `pid` and return the port it owned.
    pub fn take(&mut self, pid: u32) -> Option<u16> {
        self.ports.remove(&pid)
    }

    pub fn port_of(&self, pid: u32) -> Option<u16> {
        self.ports.get(&pid).copied()
    }

    pub fn pid_on(&self, port: u16) -> Option<u32> {
        self.ports
            .iter()
            .find_map(|(pid, p)| (*p == port).then_some(*pid))
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.ports.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
