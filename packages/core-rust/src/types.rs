//! Membership domain types: node identity, states, leave reasons, limits.
//!
//! These types define the internal cluster protocol's data model. They are
//! shared between the pure codecs in this crate and the runtime in
//! `memberd-server`, and use Rust-idiomatic naming while keeping the wire
//! values of the original protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol limits
// ---------------------------------------------------------------------------

/// Largest node id a node may claim or be assigned.
pub const MAX_NODE_ID: u32 = 4096;

/// Maximum length of a node name, in bytes.
pub const MAX_NODE_NAME_LEN: usize = 255;

/// Maximum length of a cluster name, in bytes.
pub const MAX_CLUSTER_NAME_LEN: usize = 16;

/// Maximum length of a barrier name, in bytes.
pub const MAX_BARRIER_NAME_LEN: usize = 32;

/// Maximum size of a single cluster message payload.
pub const MAX_CLUSTER_MESSAGE: usize = 1500;

/// Port reserved for the internal control protocol.
pub const PORT_CONTROL: u8 = 0;

/// Port reserved by the core for the membership sub-protocol.
pub const PORT_MEMBERSHIP: u8 = 1;

/// Ports at or below this number are exempt from quorum gating.
pub const HIGH_PROTECTED_PORT: u8 = 9;

// ---------------------------------------------------------------------------
// Protocol version
// ---------------------------------------------------------------------------

/// Major protocol version. Nodes with differing majors cannot join.
pub const PROTOCOL_MAJOR: u32 = 6;
/// Minor protocol version; backwards compatible.
pub const PROTOCOL_MINOR: u32 = 0;
/// Patch protocol version; backwards and forwards compatible.
pub const PROTOCOL_PATCH: u32 = 1;

/// Full version tuple as carried in JOINREQ/TRANSITION messages and
/// returned by the version-get client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Configuration database version, not a code version.
    pub config: u32,
}

impl ProtocolVersion {
    #[must_use]
    pub fn current(config: u32) -> Self {
        Self {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            patch: PROTOCOL_PATCH,
            config,
        }
    }
}

// ---------------------------------------------------------------------------
// Node state
// ---------------------------------------------------------------------------

/// Membership state of a node as seen by the protocol.
///
/// `TransportOnly` marks a node known to the group transport but never
/// accepted by the membership layer; it is not counted as a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    Joining,
    Member,
    Dead,
    Leaving,
    TransportOnly,
}

impl NodeState {
    /// Wire value used in packed cluster-view entries.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            NodeState::Joining => 1,
            NodeState::Member => 2,
            NodeState::Dead => 3,
            NodeState::Leaving => 4,
            NodeState::TransportOnly => 5,
        }
    }

    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(NodeState::Joining),
            2 => Some(NodeState::Member),
            3 => Some(NodeState::Dead),
            4 => Some(NodeState::Leaving),
            5 => Some(NodeState::TransportOnly),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Leave reasons
// ---------------------------------------------------------------------------

/// Why a node left (or was removed from) the cluster.
///
/// `Removed` is the only reason that permits the quorum to decrease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaveReason {
    /// Normal shutdown.
    Shutdown,
    /// Killed by another node.
    Killed,
    /// Internal failure; the node gave up.
    Panic,
    /// Removed by operator request.
    Removed,
    /// Never admitted to the cluster.
    Rejected,
    /// The node's view of the cluster was in a minority.
    Inconsistent,
    /// Missed too many heartbeats.
    Dead,
    /// Did not respond to protocol messages.
    NoResponse,
}

impl LeaveReason {
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            LeaveReason::Shutdown => 0,
            LeaveReason::Killed => 1,
            LeaveReason::Panic => 2,
            LeaveReason::Removed => 3,
            LeaveReason::Rejected => 4,
            LeaveReason::Inconsistent => 5,
            LeaveReason::Dead => 6,
            LeaveReason::NoResponse => 7,
        }
    }

    #[must_use]
    pub fn from_wire(value: u16) -> Option<Self> {
        match value & 0xF {
            0 => Some(LeaveReason::Shutdown),
            1 => Some(LeaveReason::Killed),
            2 => Some(LeaveReason::Panic),
            3 => Some(LeaveReason::Removed),
            4 => Some(LeaveReason::Rejected),
            5 => Some(LeaveReason::Inconsistent),
            6 => Some(LeaveReason::Dead),
            7 => Some(LeaveReason::NoResponse),
            _ => None,
        }
    }

    /// Permits quorum to be recomputed with a decrease allowed.
    #[must_use]
    pub fn allows_quorum_decrease(self) -> bool {
        self == LeaveReason::Removed
    }
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LeaveReason::Shutdown => "shutdown",
            LeaveReason::Killed => "killed by another node",
            LeaveReason::Panic => "panic",
            LeaveReason::Removed => "removed by operator",
            LeaveReason::Rejected => "membership rejected",
            LeaveReason::Inconsistent => "inconsistent cluster view",
            LeaveReason::Dead => "missed too many heartbeats",
            LeaveReason::NoResponse => "no response to messages",
        };
        f.write_str(text)
    }
}

/// Reason carried in a KILLNODE control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KillReason {
    /// The target was never admitted.
    Rejected,
    /// An operator asked for the kill.
    OperatorRequest,
    /// The target's view dissented during reconciliation.
    Inconsistent,
}

impl KillReason {
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            KillReason::Rejected => 1,
            KillReason::OperatorRequest => 2,
            KillReason::Inconsistent => 3,
        }
    }

    #[must_use]
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(KillReason::Rejected),
            2 => Some(KillReason::OperatorRequest),
            3 => Some(KillReason::Inconsistent),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Node references
// ---------------------------------------------------------------------------

/// Reference to a node: either an assigned cluster id or a process-local
/// temporary id for a peer seen at the wire level but not yet accepted.
///
/// Temporary ids never appear on the wire; outbound messages referencing a
/// temporary node carry 0 ("unknown") and are broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Real(u32),
    Temp(u32),
}

impl NodeRef {
    /// The node id to place in a wire header: real ids as-is, temporary
    /// ids as 0.
    #[must_use]
    pub fn wire_id(self) -> u32 {
        match self {
            NodeRef::Real(id) => id,
            NodeRef::Temp(_) => 0,
        }
    }

    #[must_use]
    pub fn as_real(self) -> Option<u32> {
        match self {
            NodeRef::Real(id) => Some(id),
            NodeRef::Temp(_) => None,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Real(id) => write!(f, "node {id}"),
            NodeRef::Temp(id) => write!(f, "temp node {id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Node addresses
// ---------------------------------------------------------------------------

/// A family-tagged transport address: two bytes of address family followed
/// by the address bytes. All addresses in one cluster have the same length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    bytes: Vec<u8>,
}

impl NodeAddress {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address family tag (first two bytes, zero if too short).
    #[must_use]
    pub fn family(&self) -> u16 {
        if self.bytes.len() < 2 {
            return 0;
        }
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    /// Compares addresses ignoring the family tag. Mixed-endian peers encode
    /// the family field differently, so only the address body is meaningful.
    #[must_use]
    pub fn eq_ignore_family(&self, other: &NodeAddress) -> bool {
        self.bytes.len() == other.bytes.len()
            && self.bytes.len() > 2
            && self.bytes[2..] == other.bytes[2..]
    }

    /// 32 bits of the address body (the first four bytes past the family
    /// tag), used as the NEWCLUSTER tie-breaker. For IPv4 this is the whole
    /// address.
    #[must_use]
    pub fn low32(&self) -> u32 {
        if self.bytes.len() < 6 {
            return 0;
        }
        u32::from_le_bytes([
            self.bytes[2],
            self.bytes[3],
            self.bytes[4],
            self.bytes[5],
        ])
    }
}

// ---------------------------------------------------------------------------
// Client event reasons
// ---------------------------------------------------------------------------

/// Reason codes pushed to event-subscribed client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PortClosed,
    StateChange,
    PortOpened,
    TryShutdown,
}

impl EventKind {
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            EventKind::PortClosed => 0,
            EventKind::StateChange => 1,
            EventKind::PortOpened => 2,
            EventKind::TryShutdown => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster id
// ---------------------------------------------------------------------------

/// Derives the 16-bit cluster id from the cluster name.
///
/// Shift-add over the name bytes, truncated to 16 bits. Kept bit-compatible
/// with the original so default multicast addresses line up across versions.
#[must_use]
pub fn cluster_id_from_name(name: &str) -> u16 {
    let mut value: u32 = 0;
    for b in name.bytes() {
        value = value.wrapping_shl(1).wrapping_add(u32::from(b));
    }
    (value & 0xFFFF) as u16
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_state_wire_roundtrip() {
        for state in [
            NodeState::Joining,
            NodeState::Member,
            NodeState::Dead,
            NodeState::Leaving,
            NodeState::TransportOnly,
        ] {
            assert_eq!(NodeState::from_wire(state.to_wire()), Some(state));
        }
        assert_eq!(NodeState::from_wire(0), None);
        assert_eq!(NodeState::from_wire(6), None);
    }

    #[test]
    fn leave_reason_wire_roundtrip() {
        for reason in [
            LeaveReason::Shutdown,
            LeaveReason::Killed,
            LeaveReason::Panic,
            LeaveReason::Removed,
            LeaveReason::Rejected,
            LeaveReason::Inconsistent,
            LeaveReason::Dead,
            LeaveReason::NoResponse,
        ] {
            assert_eq!(LeaveReason::from_wire(reason.to_wire()), Some(reason));
        }
    }

    #[test]
    fn leave_reason_masks_force_flag() {
        // Operators can OR a force flag (0x10) into the reason; decoding
        // only looks at the low nibble.
        let forced = LeaveReason::Removed.to_wire() | 0x10;
        assert_eq!(LeaveReason::from_wire(forced), Some(LeaveReason::Removed));
    }

    #[test]
    fn only_removed_allows_quorum_decrease() {
        assert!(LeaveReason::Removed.allows_quorum_decrease());
        assert!(!LeaveReason::Dead.allows_quorum_decrease());
        assert!(!LeaveReason::Shutdown.allows_quorum_decrease());
    }

    #[test]
    fn node_ref_wire_id() {
        assert_eq!(NodeRef::Real(7).wire_id(), 7);
        assert_eq!(NodeRef::Temp(3).wire_id(), 0);
        assert_eq!(NodeRef::Real(7).as_real(), Some(7));
        assert_eq!(NodeRef::Temp(3).as_real(), None);
    }

    #[test]
    fn address_family_and_body_comparison() {
        let a = NodeAddress::new(vec![2, 0, 10, 0, 0, 1]);
        let b = NodeAddress::new(vec![0, 2, 10, 0, 0, 1]); // foreign-endian family
        let c = NodeAddress::new(vec![2, 0, 10, 0, 0, 2]);

        assert_eq!(a.family(), 2);
        assert!(a.eq_ignore_family(&b));
        assert!(!a.eq_ignore_family(&c));
    }

    #[test]
    fn address_low32_uses_body_bytes() {
        let a = NodeAddress::new(vec![2, 0, 10, 20, 30, 40, 0, 0]);
        assert_eq!(a.low32(), u32::from_le_bytes([10, 20, 30, 40]));
    }

    #[test]
    fn cluster_id_is_stable_and_16_bit() {
        let id = cluster_id_from_name("alpha");
        assert_eq!(id, cluster_id_from_name("alpha"));
        assert_ne!(id, cluster_id_from_name("beta"));
    }

    #[test]
    fn protocol_version_current() {
        let v = ProtocolVersion::current(9);
        assert_eq!(v.major, PROTOCOL_MAJOR);
        assert_eq!(v.config, 9);
    }
}
