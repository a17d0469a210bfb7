//! Host port bookkeeping.
//!
//! [`PortAllocator`] takes `&mut self` for every mutation, so sharing one
//! between tasks requires wrapping it in a lock; the orchestrator keeps it
//! behind the same mutex as the volume index so allocation and release are
//! linearizable.

use crate::error::DeployError;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};

pub const DEFAULT_PORT_MIN: u16 = 8_000;
pub const DEFAULT_PORT_MAX: u16 = 9_999;

#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    allocated: BTreeSet<u16>,
    probe_host: bool,
}

impl PortAllocator {
    /// Creates an allocator over the inclusive range `[min, max]`.
    pub fn new(min: u16, max: u16) -> Result<Self, DeployError> {
        if min == 0 || min > max {
            return Err(DeployError::InvalidConfig(format!(
                "invalid port range {}-{}",
                min, max
            )));
        }
        Ok(Self {
            min,
            max,
            allocated: BTreeSet::new(),
            probe_host: false,
        })
    }

    /// Also skip ports that cannot currently be bound on the loopback
    /// interface, e.g. because an unrelated program holds them.
    pub fn with_host_probe(mut self, probe: bool) -> Self {
        self.probe_host = probe;
        self
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Claims a port.
    ///
    /// A free in-range `preferred` port is returned as is. Otherwise the
    /// range is scanned upward from `preferred + 1` (or from the range
    /// minimum), wrapping once, and the first free port is claimed.
    pub fn allocate(&mut self, preferred: Option<u16>) -> Result<u16, DeployError> {
        if let Some(port) = preferred.filter(|p| self.in_range(*p)) {
            if self.is_free(port) {
                self.allocated.insert(port);
                return Ok(port);
            }
        }

        let start = match preferred {
            Some(p) if p >= self.min && p < self.max => p + 1,
            _ => self.min,
        };

        let candidate = (start..=self.max)
            .chain(self.min..start)
            .find(|port| self.is_free(*port));

        match candidate {
            Some(port) => {
                self.allocated.insert(port);
                Ok(port)
            }
            None => Err(DeployError::PortAllocationExhausted {
                min: self.min,
                max: self.max,
            }),
        }
    }

    /// Returns a port to the pool. Releasing an unclaimed port is a no-op.
    pub fn release(&mut self, port: u16) -> bool {
        self.allocated.remove(&port)
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    fn in_range(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    fn is_free(&self, port: u16) -> bool {
        if self.allocated.contains(&port) {
            return false;
        }
        !self.probe_host || TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_MIN,
            max: DEFAULT_PORT_MAX,
            allocated: BTreeSet::new(),
            probe_host: false,
        }
    }
}
