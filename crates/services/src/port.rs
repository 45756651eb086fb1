//! Free-port discovery on the loopback interface.
//!
//! There is an accepted race between releasing the probe listener and the
//! child binding the port; the supervisor's probe timeout covers it.

use shared::error::ServiceError;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// Find a bindable loopback port, starting at `preferred` and walking up at
/// most `span` ports. `preferred == 0` lets the OS pick.
pub fn allocate(preferred: u16, span: u16) -> Result<u16, ServiceError> {
    if preferred == 0 {
        return bind_probe(0).ok_or(ServiceError::NoPortAvailable { first: 0, last: 0 });
    }

    let last = preferred.saturating_add(span);
    for port in preferred..=last {
        if let Some(bound) = bind_probe(port) {
            if port != preferred {
                tracing::info!("Port {} busy, using {}", preferred, bound);
            }
            return Ok(bound);
        }
        tracing::debug!("Port {} unavailable", port);
    }

    Err(ServiceError::NoPortAvailable {
        first: preferred,
        last,
    })
}

/// Bind and immediately release, returning the port that was bound.
fn bind_probe(port: u16) -> Option<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).ok()?;
    let bound = listener.local_addr().ok()?.port();
    drop(listener);
    Some(bound)
}

/// Loopback address for a port.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}
