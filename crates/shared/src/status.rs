//! Lifecycle states of the supervised backend service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Where the supervised service is in its lifecycle.
///
/// ```text
/// NotStarted -> Starting -> Probing -> Ready
/// Ready -> Crashed -> Restarting -> Starting
/// *  -> Stopped            (explicit stop, no further restarts)
/// Crashed -> Failed        (only when a restart cap is configured)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotStarted,
    Starting,
    Probing,
    Ready,
    Crashed,
    Restarting,
    Stopped,
    /// Restart cap exhausted. Only reachable with `max_restarts` set.
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::NotStarted => "not started",
            ServiceState::Starting => "starting",
            ServiceState::Probing => "waiting for readiness",
            ServiceState::Ready => "ready",
            ServiceState::Crashed => "crashed",
            ServiceState::Restarting => "restarting",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        }
    }

    /// A start attempt (user or restart loop) owns the handle in these states.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Probing | ServiceState::Ready
        )
    }

    /// The transition table. Anything not listed here is a supervisor bug.
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        if next == Stopped {
            return true;
        }
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Probing)
                | (Starting, Crashed)
                | (Probing, Ready)
                | (Probing, Crashed)
                | (Ready, Crashed)
                | (Crashed, Restarting)
                | (Crashed, Starting)
                | (Crashed, Failed)
                | (Restarting, Starting)
                | (Stopped, Starting)
                | (Failed, Starting)
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of the supervisor, published to the rest of the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Only set while `state == Ready`.
    pub address: Option<SocketAddr>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

impl ServiceStatus {
    pub fn is_ready(&self) -> bool {
        self.state == ServiceState::Ready && self.address.is_some()
    }

    /// Base URL for requests, e.g. `http://127.0.0.1:8000`.
    pub fn base_url(&self) -> Option<String> {
        if !self.is_ready() {
            return None;
        }
        self.address.map(|addr| format!("http://{}", addr))
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            state: ServiceState::NotStarted,
            address: None,
            restart_count: 0,
            last_error: None,
        }
    }
}
