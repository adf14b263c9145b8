//! Per-port worker slot lifecycle.
//!
//! ```text
//!   Starting ──ready──▶ Running
//!      │                   │
//!      └──────exit─────────┴──▶ Exited ──▶ Respawning ──spawned──▶ Starting
//!                                              │
//!                                              └──no pid──▶ Abandoned
//! ```
//!
//! A slot is keyed by port, so the balancer's rotation stays valid across
//! any number of restarts.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    /// Process spawned, listener not yet confirmed.
    Starting { pid: u32 },
    Running { pid: u32 },
    Exited { pid: u32, code: Option<i32> },
    Respawning,
    /// Replacement could not be tracked; the port is out of service.
    Abandoned,
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            Self::Starting { .. } => "starting",
            Self::Running { .. } => "running",
            Self::Exited { .. } => "exited",
            Self::Respawning => "respawning",
            Self::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("slot {port}: cannot apply {event} while {from}")]
pub struct TransitionError {
    pub port: u16,
    pub from: &'static str,
    pub event: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSlot {
    pub port: u16,
    #[serde(flatten)]
    pub state: SlotState,
    pub restarts: u32,
}

impl WorkerSlot {
    pub fn spawned(port: u16, pid: u32) -> Self {
        Self {
            port,
            state: SlotState::Starting { pid },
            restarts: 0,
        }
    }

    pub fn abandoned(port: u16) -> Self {
        Self {
            port,
            state: SlotState::Abandoned,
            restarts: 0,
        }
    }

    /// Pid of the process currently bound to this slot, if any.
    pub fn pid(&self) -> Option<u32> {
        match self.state {
            SlotState::Starting { pid } | SlotState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SlotState::Running { .. })
    }

    fn reject(&self, event: &'static str) -> TransitionError {
        TransitionError {
            port: self.port,
            from: self.state.name(),
            event,
        }
    }

    pub fn on_ready(&mut self, pid: u32) -> Result<(), TransitionError> {
        match self.state {
            SlotState::Starting { pid: current } if current == pid => {
                self.state = SlotState::Running { pid };
                Ok(())
            }
            _ => Err(self.reject("ready")),
        }
    }

    pub fn on_exit(&mut self, pid: u32, code: Option<i32>) -> Result<(), TransitionError> {
        match self.pid() {
            Some(current) if current == pid => {
                self.state = SlotState::Exited { pid, code };
                Ok(())
            }
            _ => Err(self.reject("exit")),
        }
    }

    pub fn begin_respawn(&mut self) -> Result<(), TransitionError> {
        match self.state {
            SlotState::Exited { .. } => {
                self.state = SlotState::Respawning;
                Ok(())
            }
            _ => Err(self.reject("respawn")),
        }
    }

    pub fn on_respawned(&mut self, pid: u32) -> Result<(), TransitionError> {
        match self.state {
            SlotState::Respawning => {
                self.state = SlotState::Starting { pid };
                self.restarts += 1;
                Ok(())
            }
            _ => Err(self.reject("spawned")),
        }
    }

    pub fn abandon(&mut self) {
        self.state = SlotState::Abandoned;
    }
}
