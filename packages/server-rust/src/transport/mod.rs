//! Group transport abstraction.
//!
//! The membership core rides a virtual-synchrony transport: totally-ordered
//! multicast plus configuration-change callbacks. This module defines the
//! contract the core consumes; [`local`] provides an in-process
//! implementation used by tests and single-host runs.
//!
//! Contract highlights:
//! - messages from one sender arrive FIFO at every receiver;
//! - AGREED delivery produces the identical total order at every member that
//!   is in the view at delivery time (SAFE additionally waits for all
//!   reachable members to buffer);
//! - a configuration change is delivered after the last message of the old
//!   view and before the first message of the new view;
//! - `ring_seq` increases with every view and is surfaced as the node
//!   incarnation.

pub mod local;

use bytes::Bytes;
use memberd_core::NodeAddress;
use thiserror::Error;

pub use local::{LoopbackHub, LoopbackTransport};

/// Delivery guarantee requested for one multicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Totally ordered among receivers.
    Agreed,
    /// Agreed, plus delivery only after all reachable members buffered it.
    Safe,
}

/// View type reported with a configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfChangeKind {
    Regular,
    Transitional,
}

/// A membership view change from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfChange {
    pub kind: ConfChangeKind,
    pub members: Vec<NodeAddress>,
    pub left: Vec<NodeAddress>,
    pub joined: Vec<NodeAddress>,
    /// Ring sequence; exposed as the cluster incarnation.
    pub ring_seq: u64,
}

impl ConfChange {
    /// True if `addr` is in the new view.
    #[must_use]
    pub fn contains(&self, addr: &NodeAddress) -> bool {
        self.members.iter().any(|m| m.eq_ignore_family(addr))
    }
}

/// Everything the transport hands up to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Deliver {
        source: NodeAddress,
        payload: Bytes,
        /// Set when the sender's byte order differs from ours.
        endian_swap: bool,
    },
    ConfChange(ConfChange),
}

/// Transport faults. A closed transport means the local node has been
/// ejected; the core treats that as terminal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

/// The group communication surface consumed by the core.
///
/// Implementations multicast to the whole group; targeting individual nodes
/// happens one layer up via the routing header. Sends must not block:
/// ordering is the transport's job, so the core hands messages over and
/// moves on.
pub trait GroupTransport: Send + Sync {
    /// Multicasts `payload` to every member of the group, ourselves
    /// included.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the local node has left or been
    /// ejected.
    fn multicast(&self, payload: Bytes, mode: DeliveryMode) -> Result<(), TransportError>;

    /// Leaves the group. Idempotent.
    fn leave(&self);

    /// The local node's transport address.
    fn local_address(&self) -> NodeAddress;
}
