//! Ephemeral TCP port allocation.
//!
//! A [`PortReservation`] keeps the OS-assigned port bound until the service
//! is about to be spawned ([`PortReservation::release_listener`]), so no two
//! environments in this process can be handed the same port. Dropping the
//! reservation returns the port to the [`PortAllocator`].

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};

use bsh_core::error::ProvisioningError;
use tracing::debug;

/// Bind attempts per port before giving up.
const MAX_BIND_ATTEMPTS: usize = 8;

/// Tracks every port currently handed out.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    live: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` distinct ports on `host`.
    ///
    /// All-or-nothing: if any port cannot be bound, the ones already
    /// reserved are dropped (and thereby released) before returning.
    pub fn allocate(
        &self,
        host: &str,
        count: usize,
    ) -> Result<Vec<PortReservation>, ProvisioningError> {
        let mut reserved = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_one(host) {
                Ok(reservation) => reserved.push(reservation),
                Err(reason) => {
                    return Err(ProvisioningError::PortExhausted {
                        requested: count,
                        allocated: reserved.len(),
                        reason,
                    });
                }
            }
        }
        Ok(reserved)
    }

    fn allocate_one(&self, host: &str) -> Result<PortReservation, String> {
        let mut last_error = String::from("no attempt made");
        for _ in 0..MAX_BIND_ATTEMPTS {
            let listener = match TcpListener::bind((host, 0)) {
                Ok(listener) => listener,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            let port = match listener.local_addr() {
                Ok(addr) => addr.port(),
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            // A port released by an earlier reservation can be reissued by
            // the OS while its previous holder is still tracked.
            if !self.lock().insert(port) {
                last_error = format!("port {port} is still allocated");
                continue;
            }

            debug!(host, port, "port reserved");
            return Ok(PortReservation {
                port,
                listener: Some(listener),
                allocator: self.clone(),
            });
        }
        Err(last_error)
    }

    /// Ports currently handed out.
    pub fn allocated_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            debug!(port, "port released");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One allocated port. Returned to the allocator on drop.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    listener: Option<TcpListener>,
    allocator: PortAllocator,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the placeholder socket so the service can bind the port.
    /// The port stays allocated until the reservation is dropped.
    pub fn release_listener(&mut self) {
        self.listener = None;
    }

    pub fn is_held(&self) -> bool {
        self.listener.is_some()
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.listener = None;
        self.allocator.release(self.port);
    }
}
