//! Free-port discovery for the interactive picker.
//!
//! The picker is published on the host, so its port has to be free on the
//! host. Ports are probed by binding a listener and dropping it straight away,
//! starting at the preferred port and scanning upward, which keeps repeated
//! runs on the same address.

use std::net::{IpAddr, Ipv4Addr, TcpListener};

use crate::error::PipelineError;

/// Finds a free TCP port in `[preferred, preferred + range_size]`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl PortAllocator {
    /// Creates an allocator probing on all interfaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes on a specific address instead of all interfaces.
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Returns `preferred` if nothing listens on it, otherwise the lowest free
    /// port in `preferred+1 ..= preferred+range_size`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ResourceExhausted` when every port in the range
    /// is taken.
    pub fn allocate(&self, preferred: u16, range_size: u16) -> Result<u16, PipelineError> {
        allocate_with(preferred, range_size, |port| self.is_free(port))
    }

    /// Whether a listener could be bound on `port` right now.
    pub fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((self.host, port)).is_ok()
    }
}

/// Scans the range in ascending order using `is_free` as the probe.
pub fn allocate_with<F>(preferred: u16, range_size: u16, mut is_free: F) -> Result<u16, PipelineError>
where
    F: FnMut(u16) -> bool,
{
    let end = preferred.saturating_add(range_size);

    for port in preferred..=end {
        if is_free(port) {
            if port != preferred {
                tracing::info!(preferred, port, "preferred port busy, using next free port");
            }
            return Ok(port);
        }
        tracing::debug!(port, "port in use");
    }

    Err(PipelineError::ResourceExhausted {
        start: preferred,
        end,
    })
}
