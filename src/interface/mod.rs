//! # Interface Module
//!
//! Physical transports the communication manager multiplexes.
//!
//! This module handles:
//! - The `Interface` send seam every transport implements
//! - The bounded interface table handing out interface indices
//! - UART transport over `tokio-serial`
//! - UDP transport over `tokio::net`
//!
//! Receive paths live with each transport: they decode frames and hand
//! validated packets to [`crate::comm::manager::CommManager::store_received_packet`].

pub mod port_trait;
pub mod uart;
pub mod udp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{FlightLinkError, Result};

/// Hard upper bound on registered interfaces
pub const MAX_INTERFACES: usize = 8;

/// Index handed out by the interface table, used to tag queued packets
pub type InterfaceIndex = u8;

/// Send side of a physical transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Interface: Send + Sync {
    /// Transmit one complete wire frame
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Whether `send` can currently reach the far end
    ///
    /// Links that learn their peer from traffic report `false` until then.
    fn is_ready(&self) -> bool {
        true
    }
}

/// A registered interface
#[derive(Clone)]
pub struct InterfaceDescriptor {
    /// Human readable name used in logs
    pub name: String,
    /// Transport implementation
    pub link: Arc<dyn Interface>,
}

impl fmt::Debug for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity interface registry
#[derive(Debug)]
pub struct InterfaceTable {
    slots: [Option<InterfaceDescriptor>; MAX_INTERFACES],
    len: usize,
    capacity: usize,
}

impl InterfaceTable {
    /// Create a table holding at most `capacity` interfaces (clamped to
    /// [`MAX_INTERFACES`])
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            len: 0,
            capacity: capacity.min(MAX_INTERFACES),
        }
    }

    /// Register an interface
    ///
    /// # Errors
    ///
    /// Returns `InterfaceTableFull` once capacity is exhausted
    pub fn add(&mut self, descriptor: InterfaceDescriptor) -> Result<InterfaceIndex> {
        if self.len >= self.capacity {
            return Err(FlightLinkError::InterfaceTableFull(self.capacity));
        }

        let index = self.len;
        self.slots[index] = Some(descriptor);
        self.len += 1;
        Ok(index as InterfaceIndex)
    }

    /// Look up a registered interface
    pub fn get(&self, index: InterfaceIndex) -> Option<&InterfaceDescriptor> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    /// Number of registered interfaces
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over `(index, descriptor)` pairs in registration order
    pub fn iter(&self) -> impl Iterator<Item = (InterfaceIndex, &InterfaceDescriptor)> {
        self.slots[..self.len]
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|d| (i as InterfaceIndex, d)))
    }
}
