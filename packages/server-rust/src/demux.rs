//! Port demultiplexer: header handling for everything entering or leaving
//! the group transport, plus the exclusive port-binding table.
//!
//! Outbound, callers give a payload and routing data; the header is
//! prepended and the message multicast (targeting is header-level, the
//! transport always multicasts). Inbound, the header is stripped and the
//! message classified: not-for-us, internal control port, membership port,
//! or a bound application port.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use memberd_core::{
    MessageHeader, FLAG_AGREED, FLAG_SAFE, PORT_CONTROL, PORT_MEMBERSHIP,
};
use parking_lot::RwLock;
use tracing::trace;

use crate::client::connection::ConnectionId;
use crate::transport::{DeliveryMode, GroupTransport, TransportError};

// ---------------------------------------------------------------------------
// Port table
// ---------------------------------------------------------------------------

/// Exclusive port -> connection bindings for the local node.
pub struct PortTable {
    ports: RwLock<[Option<ConnectionId>; 256]>,
}

impl PortTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ports: RwLock::new([None; 256]),
        }
    }

    /// Binds `port` to `conn`. Fails if the port is taken.
    pub fn bind(&self, port: u8, conn: ConnectionId) -> bool {
        let mut ports = self.ports.write();
        if ports[usize::from(port)].is_some() {
            return false;
        }
        ports[usize::from(port)] = Some(conn);
        true
    }

    /// Clears a binding; returns the connection that held it.
    pub fn unbind(&self, port: u8) -> Option<ConnectionId> {
        self.ports.write()[usize::from(port)].take()
    }

    #[must_use]
    pub fn lookup(&self, port: u8) -> Option<ConnectionId> {
        self.ports.read()[usize::from(port)]
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Demultiplexer
// ---------------------------------------------------------------------------

/// Where an inbound message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Targeted at another node; ignore.
    NotForUs,
    /// Port 0: internal control protocol.
    Control { header: MessageHeader, body: Bytes },
    /// Port 1: membership sub-protocol.
    Membership { header: MessageHeader, body: Bytes },
    /// An application port; deliver to the bound client if any.
    Application { header: MessageHeader, body: Bytes },
}

/// Header codec plus transport hand-off. `local_node` tracks our assigned
/// id (0 before the cluster assigns one) and is shared with the runtime.
pub struct Demux {
    transport: Arc<dyn GroupTransport>,
    local_node: Arc<AtomicU32>,
}

impl Demux {
    #[must_use]
    pub fn new(transport: Arc<dyn GroupTransport>, local_node: Arc<AtomicU32>) -> Self {
        Self {
            transport,
            local_node,
        }
    }

    #[must_use]
    pub fn local_node_id(&self) -> u32 {
        self.local_node.load(Ordering::Acquire)
    }

    /// Wraps `payload` in a routing header and multicasts it.
    ///
    /// `target_node` 0 broadcasts; SAFE delivery is selected through the
    /// flags word.
    ///
    /// # Errors
    ///
    /// Propagates [`TransportError::Closed`] once we have left the group.
    pub fn send(
        &self,
        payload: &[u8],
        source_port: u8,
        target_port: u8,
        target_node: u32,
        flags: u32,
    ) -> Result<(), TransportError> {
        let mut header = MessageHeader::new(target_port, source_port, target_node, flags | FLAG_AGREED);
        header.source_node = self.local_node_id();

        let mut buf = BytesMut::with_capacity(memberd_core::HEADER_SIZE + payload.len());
        header.encode(&mut buf);
        buf.extend_from_slice(payload);

        let mode = if flags & FLAG_SAFE != 0 {
            DeliveryMode::Safe
        } else {
            DeliveryMode::Agreed
        };
        trace!(
            target_port,
            target_node,
            len = payload.len(),
            "multicasting message"
        );
        self.transport.multicast(buf.freeze(), mode)
    }

    /// Sends a control message to `target_node` (0 = broadcast).
    ///
    /// # Errors
    ///
    /// Propagates [`TransportError::Closed`].
    pub fn send_control(
        &self,
        msg: &memberd_core::ControlMessage,
        target_node: u32,
    ) -> Result<(), TransportError> {
        self.send(&msg.encode(), PORT_CONTROL, PORT_CONTROL, target_node, 0)
    }

    /// Sends a membership message to `target_node` (0 = broadcast).
    ///
    /// # Errors
    ///
    /// Propagates [`TransportError::Closed`].
    pub fn send_membership(
        &self,
        msg: &memberd_core::MembershipMessage,
        target_node: u32,
        addr_len: usize,
    ) -> Result<(), TransportError> {
        self.send(
            &msg.encode(addr_len),
            PORT_MEMBERSHIP,
            PORT_MEMBERSHIP,
            target_node,
            0,
        )
    }

    /// Strips the header off a delivered message and classifies it.
    ///
    /// Undecodable headers yield `None` (logged by the caller); messages
    /// targeted at other nodes yield `NotForUs`.
    #[must_use]
    pub fn classify(&self, mut payload: Bytes, endian_swap: bool) -> Option<Inbound> {
        let header = MessageHeader::decode(&mut payload, endian_swap).ok()?;

        let us = self.local_node_id();
        if header.target_node != 0 && header.target_node != us {
            return Some(Inbound::NotForUs);
        }

        Some(match header.target_port {
            PORT_CONTROL => Inbound::Control {
                header,
                body: payload,
            },
            PORT_MEMBERSHIP => Inbound::Membership {
                header,
                body: payload,
            },
            _ => Inbound::Application {
                header,
                body: payload,
            },
        })
    }
}
