//! Internal protocol messages.
//!
//! Two message families ride the ordered multicast:
//!
//! - **Control messages** on port 0: port open/close notifications, barrier
//!   WAIT/COMPLETE, the post-join TRANSITION announcement, kill/leave and
//!   reconfiguration. Their layouts are fixed and padded exactly as the
//!   protocol requires.
//! - **Membership messages** on port 1: the join handshake and the
//!   master-coordinated transition protocol (STARTTRANS through ENDTRANS),
//!   plus the periodic HELLO.
//!
//! All multi-byte fields are little-endian; decoders accept the transport's
//! endian-swap flag and read big-endian when it is set.

use bytes::{Buf, BufMut, BytesMut};

use crate::ports::PORT_BITS_SIZE;
use crate::types::{
    NodeAddress, NodeState, ProtocolVersion, MAX_BARRIER_NAME_LEN, MAX_CLUSTER_NAME_LEN,
    MAX_NODE_NAME_LEN,
};
use crate::wire::DecodeError;

// ---------------------------------------------------------------------------
// Shared field helpers
// ---------------------------------------------------------------------------

fn get_u16(buf: &mut impl Buf, swap: bool) -> u16 {
    if swap {
        buf.get_u16()
    } else {
        buf.get_u16_le()
    }
}

fn get_u32(buf: &mut impl Buf, swap: bool) -> u32 {
    if swap {
        buf.get_u32()
    } else {
        buf.get_u32_le()
    }
}

fn need(buf: &impl Buf, bytes: usize) -> Result<(), DecodeError> {
    if buf.remaining() < bytes {
        return Err(DecodeError::Truncated {
            need: bytes,
            have: buf.remaining(),
        });
    }
    Ok(())
}

/// Writes a NUL-padded fixed-size name field.
fn put_padded_name(buf: &mut impl BufMut, name: &str, size: usize) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(size);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, size - n);
}

/// Reads a NUL-padded fixed-size name field.
fn get_padded_name(buf: &mut impl Buf, size: usize) -> Result<String, DecodeError> {
    need(buf, size)?;
    let mut raw = vec![0u8; size];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(size);
    String::from_utf8(raw[..end].to_vec())
        .map_err(|_| DecodeError::InvalidField { context: "name" })
}

/// Writes a u8-length-prefixed name.
fn put_short_name(buf: &mut impl BufMut, name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(MAX_NODE_NAME_LEN);
    buf.put_u8(n as u8);
    buf.put_slice(&bytes[..n]);
}

/// Reads a u8-length-prefixed name.
fn get_short_name(buf: &mut impl Buf) -> Result<String, DecodeError> {
    need(buf, 1)?;
    let len = usize::from(buf.get_u8());
    need(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| DecodeError::InvalidField { context: "name" })
}

// ---------------------------------------------------------------------------
// Control messages (port 0)
// ---------------------------------------------------------------------------

const CTRL_ACK: u8 = 1;
const CTRL_PORTOPENED: u8 = 2;
const CTRL_PORTCLOSED: u8 = 3;
const CTRL_BARRIER: u8 = 4;
const CTRL_TRANSITION: u8 = 5;
const CTRL_KILLNODE: u8 = 6;
const CTRL_LEAVE: u8 = 7;
const CTRL_RECONFIGURE: u8 = 8;
const CTRL_PORTENQ: u8 = 9;
const CTRL_PORTSTATUS: u8 = 10;

/// Barrier sub-commands carried inside a control BARRIER message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOp {
    Wait,
    Complete,
}

impl BarrierOp {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            BarrierOp::Wait => 4,
            BarrierOp::Complete => 5,
        }
    }

    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            4 => Some(BarrierOp::Wait),
            5 => Some(BarrierOp::Complete),
            _ => None,
        }
    }
}

/// Parameter selector for RECONFIGURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureParam {
    ExpectedVotes,
    NodeVotes,
    ConfigVersion,
}

impl ReconfigureParam {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            ReconfigureParam::ExpectedVotes => 1,
            ReconfigureParam::NodeVotes => 2,
            ReconfigureParam::ConfigVersion => 3,
        }
    }

    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(ReconfigureParam::ExpectedVotes),
            2 => Some(ReconfigureParam::NodeVotes),
            3 => Some(ReconfigureParam::ConfigVersion),
            _ => None,
        }
    }
}

/// The TRANSITION announcement multicast by a node that has just completed
/// a join (or formed a cluster), letting peers sanity-check compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionAnnounce {
    pub cluster_id: u16,
    pub high_node_id: u32,
    pub expected_votes: u32,
    pub version: ProtocolVersion,
    pub cluster_name: String,
}

/// A cluster control message, sent to port 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Reserved; never sent by this implementation.
    Ack,
    PortOpened {
        port: u8,
    },
    PortClosed {
        port: u8,
    },
    Barrier {
        op: BarrierOp,
        name: String,
    },
    Transition(TransitionAnnounce),
    KillNode {
        reason: u16,
        target_node: u32,
    },
    Leave {
        /// Raw leave reason; may carry the operator force flag.
        reason: u16,
    },
    Reconfigure {
        param: ReconfigureParam,
        node_id: u32,
        value: u32,
    },
    PortEnq,
    PortStatus {
        bitmap: [u8; PORT_BITS_SIZE],
    },
}

impl ControlMessage {
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(48);
        match self {
            ControlMessage::Ack => buf.put_u8(CTRL_ACK),
            ControlMessage::PortOpened { port } => {
                buf.put_u8(CTRL_PORTOPENED);
                buf.put_u8(*port);
            }
            ControlMessage::PortClosed { port } => {
                buf.put_u8(CTRL_PORTCLOSED);
                buf.put_u8(*port);
            }
            ControlMessage::Barrier { op, name } => {
                buf.put_u8(CTRL_BARRIER);
                buf.put_u8(op.to_wire());
                buf.put_u16_le(0); // pad
                put_padded_name(&mut buf, name, MAX_BARRIER_NAME_LEN);
            }
            ControlMessage::Transition(t) => {
                buf.put_u8(CTRL_TRANSITION);
                buf.put_u8(0); // pad
                buf.put_u16_le(t.cluster_id);
                buf.put_u32_le(t.high_node_id);
                buf.put_u32_le(t.expected_votes);
                buf.put_u32_le(t.version.major);
                buf.put_u32_le(t.version.minor);
                buf.put_u32_le(t.version.patch);
                buf.put_u32_le(t.version.config);
                put_padded_name(&mut buf, &t.cluster_name, MAX_CLUSTER_NAME_LEN);
            }
            ControlMessage::KillNode {
                reason,
                target_node,
            } => {
                buf.put_u8(CTRL_KILLNODE);
                buf.put_u8(0); // pad
                buf.put_u16_le(*reason);
                buf.put_u32_le(*target_node);
            }
            ControlMessage::Leave { reason } => {
                buf.put_u8(CTRL_LEAVE);
                buf.put_u8(0); // pad
                buf.put_u16_le(*reason);
            }
            ControlMessage::Reconfigure {
                param,
                node_id,
                value,
            } => {
                buf.put_u8(CTRL_RECONFIGURE);
                buf.put_u8(param.to_wire());
                buf.put_u16_le(0); // pad
                buf.put_u32_le(*node_id);
                buf.put_u32_le(*value);
            }
            ControlMessage::PortEnq => buf.put_u8(CTRL_PORTENQ),
            ControlMessage::PortStatus { bitmap } => {
                buf.put_u8(CTRL_PORTSTATUS);
                buf.put_slice(bitmap);
            }
        }
        buf
    }

    /// Decodes one control message.
    ///
    /// # Errors
    ///
    /// Fails on truncation, unknown command bytes, or invalid field values.
    pub fn decode(buf: &mut impl Buf, swap: bool) -> Result<Self, DecodeError> {
        need(buf, 1)?;
        let cmd = buf.get_u8();
        match cmd {
            CTRL_ACK => Ok(ControlMessage::Ack),
            CTRL_PORTOPENED => {
                need(buf, 1)?;
                Ok(ControlMessage::PortOpened {
                    port: buf.get_u8(),
                })
            }
            CTRL_PORTCLOSED => {
                need(buf, 1)?;
                Ok(ControlMessage::PortClosed {
                    port: buf.get_u8(),
                })
            }
            CTRL_BARRIER => {
                need(buf, 3)?;
                let op = BarrierOp::from_wire(buf.get_u8())
                    .ok_or(DecodeError::InvalidField { context: "barrier" })?;
                let _pad = buf.get_u16_le();
                let name = get_padded_name(buf, MAX_BARRIER_NAME_LEN)?;
                Ok(ControlMessage::Barrier { op, name })
            }
            CTRL_TRANSITION => {
                need(buf, 3)?;
                let _pad = buf.get_u8();
                let cluster_id = get_u16(buf, swap);
                need(buf, 24)?;
                let high_node_id = get_u32(buf, swap);
                let expected_votes = get_u32(buf, swap);
                let version = ProtocolVersion {
                    major: get_u32(buf, swap),
                    minor: get_u32(buf, swap),
                    patch: get_u32(buf, swap),
                    config: get_u32(buf, swap),
                };
                let cluster_name = get_padded_name(buf, MAX_CLUSTER_NAME_LEN)?;
                Ok(ControlMessage::Transition(TransitionAnnounce {
                    cluster_id,
                    high_node_id,
                    expected_votes,
                    version,
                    cluster_name,
                }))
            }
            CTRL_KILLNODE => {
                need(buf, 7)?;
                let _pad = buf.get_u8();
                let reason = get_u16(buf, swap);
                let target_node = get_u32(buf, swap);
                Ok(ControlMessage::KillNode {
                    reason,
                    target_node,
                })
            }
            CTRL_LEAVE => {
                need(buf, 3)?;
                let _pad = buf.get_u8();
                let reason = get_u16(buf, swap);
                Ok(ControlMessage::Leave { reason })
            }
            CTRL_RECONFIGURE => {
                need(buf, 11)?;
                let param = ReconfigureParam::from_wire(buf.get_u8())
                    .ok_or(DecodeError::InvalidField { context: "reconfigure" })?;
                let _pad = buf.get_u16_le();
                let node_id = get_u32(buf, swap);
                let value = get_u32(buf, swap);
                Ok(ControlMessage::Reconfigure {
                    param,
                    node_id,
                    value,
                })
            }
            CTRL_PORTENQ => Ok(ControlMessage::PortEnq),
            CTRL_PORTSTATUS => {
                need(buf, PORT_BITS_SIZE)?;
                let mut bitmap = [0u8; PORT_BITS_SIZE];
                buf.copy_to_slice(&mut bitmap);
                Ok(ControlMessage::PortStatus { bitmap })
            }
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Membership messages (port 1)
// ---------------------------------------------------------------------------

const MEMB_JOINREQ: u8 = 1;
const MEMB_JOINACK: u8 = 2;
const MEMB_JOINCONF: u8 = 3;
const MEMB_CONFACK: u8 = 4;
const MEMB_MASTERVIEW: u8 = 5;
const MEMB_VIEWACK: u8 = 6;
const MEMB_STARTTRANS: u8 = 7;
const MEMB_STARTACK: u8 = 8;
const MEMB_ENDTRANS: u8 = 9;
const MEMB_HELLO: u8 = 10;
const MEMB_NEWCLUSTER: u8 = 11;
const MEMB_NOMINATE: u8 = 12;
const MEMB_NODEDOWN: u8 = 13;

/// HELLO flag: the sender considers the cluster quorate.
pub const HELLO_FLAG_QUORATE: u8 = 1;
/// HELLO flag: the sender is mastering a transition.
pub const HELLO_FLAG_MASTER: u8 = 2;

/// Packed-view packet flag: first packet of a view.
pub const VIEW_FIRST: u8 = 1;
/// Packed-view packet flag: last packet of a view.
pub const VIEW_LAST: u8 = 2;

/// The master's verdict on a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAckType {
    /// Accepted; a JOINCONF will follow.
    Ok,
    /// Rejected outright.
    Nak,
    /// The master is busy; retry after a back-off.
    Wait,
}

impl JoinAckType {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            JoinAckType::Ok => 1,
            JoinAckType::Nak => 2,
            JoinAckType::Wait => 3,
        }
    }

    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(JoinAckType::Ok),
            2 => Some(JoinAckType::Nak),
            3 => Some(JoinAckType::Wait),
            _ => None,
        }
    }
}

/// Why a transition was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    NewNode,
    RemNode,
    NewMaster,
    DeadMaster,
    AnotherRemNode,
    Restart,
    Check,
}

impl TransitionReason {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            TransitionReason::NewNode => 1,
            TransitionReason::RemNode => 2,
            TransitionReason::NewMaster => 3,
            TransitionReason::DeadMaster => 4,
            TransitionReason::AnotherRemNode => 5,
            TransitionReason::Restart => 6,
            TransitionReason::Check => 7,
        }
    }

    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransitionReason::NewNode),
            2 => Some(TransitionReason::RemNode),
            3 => Some(TransitionReason::NewMaster),
            4 => Some(TransitionReason::DeadMaster),
            5 => Some(TransitionReason::AnotherRemNode),
            6 => Some(TransitionReason::Restart),
            7 => Some(TransitionReason::Check),
            _ => None,
        }
    }
}

/// One node as packed into a JOINCONF or MASTERVIEW message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub name: String,
    pub state: NodeState,
    pub addresses: Vec<NodeAddress>,
    pub votes: u8,
    pub expected_votes: u32,
    pub node_id: u32,
}

/// A node's application to join the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub votes: u8,
    pub expected_votes: u32,
    /// Requested node id; 0 asks the master to assign one.
    pub node_id: u32,
    pub version: ProtocolVersion,
    pub addr_len: u32,
    pub cluster_name: String,
    pub addresses: Vec<NodeAddress>,
    pub name: String,
}

/// STARTTRANS / NOMINATE payload. Address and name fields are only
/// populated when the reason is `NewNode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTransition {
    pub reason: TransitionReason,
    pub votes: u8,
    pub leave_reason: u16,
    pub expected_votes: u32,
    pub generation: u32,
    pub node_id: u32,
    pub addresses: Vec<NodeAddress>,
    pub name: String,
}

/// ENDTRANS payload: the agreed outcome of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndTransition {
    pub quorum: u32,
    pub generation: u32,
    pub total_votes: u32,
    /// Node id assigned to the joiner; 0 when the transition had none.
    pub new_node_id: u32,
}

/// Periodic heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub members: u16,
    pub flags: u8,
    pub generation: u32,
}

/// A membership sub-protocol message, sent to port 1.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipMessage {
    JoinReq(JoinRequest),
    JoinAck { ack: JoinAckType },
    JoinConf { flags: u8, nodes: Vec<NodeEntry> },
    ConfAck,
    MasterView { flags: u8, nodes: Vec<NodeEntry> },
    ViewAck { agree: bool },
    StartTrans(StartTransition),
    StartAck { generation: u32 },
    EndTrans(EndTransition),
    Hello(Hello),
    NewCluster { tiebreak: u32 },
    Nominate(StartTransition),
    NodeDown { reason: u16, node_id: u32 },
}

fn put_addresses(buf: &mut BytesMut, addresses: &[NodeAddress]) {
    buf.put_u16_le(addresses.len() as u16);
    for addr in addresses {
        buf.put_slice(addr.as_bytes());
    }
}

fn get_addresses(
    buf: &mut impl Buf,
    swap: bool,
    addr_len: usize,
) -> Result<Vec<NodeAddress>, DecodeError> {
    need(buf, 2)?;
    let count = usize::from(get_u16(buf, swap));
    need(buf, count * addr_len)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let mut raw = vec![0u8; addr_len];
        buf.copy_to_slice(&mut raw);
        out.push(NodeAddress::new(raw));
    }
    Ok(out)
}

fn put_view(buf: &mut BytesMut, flags: u8, nodes: &[NodeEntry], addr_len: usize) {
    buf.put_u8(flags);
    buf.put_u16_le(addr_len as u16);
    for node in nodes {
        put_short_name(buf, &node.name);
        buf.put_u8(node.state.to_wire());
        put_addresses(buf, &node.addresses);
        buf.put_u8(node.votes);
        buf.put_u32_le(node.expected_votes);
        buf.put_u32_le(node.node_id);
    }
}

fn get_view(buf: &mut impl Buf, swap: bool) -> Result<(u8, Vec<NodeEntry>), DecodeError> {
    need(buf, 3)?;
    let flags = buf.get_u8();
    let addr_len = usize::from(get_u16(buf, swap));
    let mut nodes = Vec::new();
    while buf.has_remaining() {
        let name = get_short_name(buf)?;
        need(buf, 1)?;
        let state = NodeState::from_wire(buf.get_u8())
            .ok_or(DecodeError::InvalidField { context: "view state" })?;
        let addresses = get_addresses(buf, swap, addr_len)?;
        need(buf, 9)?;
        let votes = buf.get_u8();
        let expected_votes = get_u32(buf, swap);
        let node_id = get_u32(buf, swap);
        nodes.push(NodeEntry {
            name,
            state,
            addresses,
            votes,
            expected_votes,
            node_id,
        });
    }
    Ok((flags, nodes))
}

fn put_starttrans(buf: &mut BytesMut, cmd: u8, t: &StartTransition, addr_len: usize) {
    buf.put_u8(cmd);
    buf.put_u8(t.reason.to_wire());
    buf.put_u8(t.votes);
    buf.put_u8(0); // pad
    buf.put_u16_le(t.leave_reason);
    buf.put_u16_le(addr_len as u16);
    buf.put_u32_le(t.expected_votes);
    buf.put_u32_le(t.generation);
    buf.put_u32_le(t.node_id);
    put_addresses(buf, &t.addresses);
    put_short_name(buf, &t.name);
}

fn get_starttrans(buf: &mut impl Buf, swap: bool) -> Result<StartTransition, DecodeError> {
    need(buf, 19)?;
    let reason = TransitionReason::from_wire(buf.get_u8())
        .ok_or(DecodeError::InvalidField { context: "transition reason" })?;
    let votes = buf.get_u8();
    let _pad = buf.get_u8();
    let leave_reason = get_u16(buf, swap);
    let addr_len = usize::from(get_u16(buf, swap));
    let expected_votes = get_u32(buf, swap);
    let generation = get_u32(buf, swap);
    let node_id = get_u32(buf, swap);
    let addresses = get_addresses(buf, swap, addr_len)?;
    let name = get_short_name(buf)?;
    Ok(StartTransition {
        reason,
        votes,
        leave_reason,
        expected_votes,
        generation,
        node_id,
        addresses,
        name,
    })
}

impl MembershipMessage {
    /// Encodes the message. Views and join requests need the cluster's
    /// uniform address length for their packed address arrays.
    #[must_use]
    pub fn encode(&self, addr_len: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            MembershipMessage::JoinReq(j) => {
                buf.put_u8(MEMB_JOINREQ);
                buf.put_u8(j.votes);
                buf.put_u32_le(j.expected_votes);
                buf.put_u32_le(j.node_id);
                buf.put_u32_le(j.version.major);
                buf.put_u32_le(j.version.minor);
                buf.put_u32_le(j.version.patch);
                buf.put_u32_le(j.version.config);
                buf.put_u32_le(j.addr_len);
                put_padded_name(&mut buf, &j.cluster_name, MAX_CLUSTER_NAME_LEN);
                put_addresses(&mut buf, &j.addresses);
                put_short_name(&mut buf, &j.name);
            }
            MembershipMessage::JoinAck { ack } => {
                buf.put_u8(MEMB_JOINACK);
                buf.put_u8(ack.to_wire());
            }
            MembershipMessage::JoinConf { flags, nodes } => {
                buf.put_u8(MEMB_JOINCONF);
                put_view(&mut buf, *flags, nodes, addr_len);
            }
            MembershipMessage::ConfAck => buf.put_u8(MEMB_CONFACK),
            MembershipMessage::MasterView { flags, nodes } => {
                buf.put_u8(MEMB_MASTERVIEW);
                put_view(&mut buf, *flags, nodes, addr_len);
            }
            MembershipMessage::ViewAck { agree } => {
                buf.put_u8(MEMB_VIEWACK);
                buf.put_u8(u8::from(*agree));
            }
            MembershipMessage::StartTrans(t) => {
                put_starttrans(&mut buf, MEMB_STARTTRANS, t, addr_len);
            }
            MembershipMessage::StartAck { generation } => {
                buf.put_u8(MEMB_STARTACK);
                buf.put_u32_le(*generation);
            }
            MembershipMessage::EndTrans(e) => {
                buf.put_u8(MEMB_ENDTRANS);
                buf.put_u32_le(e.quorum);
                buf.put_u32_le(e.generation);
                buf.put_u32_le(e.total_votes);
                buf.put_u32_le(e.new_node_id);
            }
            MembershipMessage::Hello(h) => {
                buf.put_u8(MEMB_HELLO);
                buf.put_u8(h.flags);
                buf.put_u16_le(h.members);
                buf.put_u32_le(h.generation);
            }
            MembershipMessage::NewCluster { tiebreak } => {
                buf.put_u8(MEMB_NEWCLUSTER);
                buf.put_u32_le(*tiebreak);
            }
            MembershipMessage::Nominate(t) => {
                put_starttrans(&mut buf, MEMB_NOMINATE, t, addr_len);
            }
            MembershipMessage::NodeDown { reason, node_id } => {
                buf.put_u8(MEMB_NODEDOWN);
                buf.put_u8(0); // pad
                buf.put_u16_le(*reason);
                buf.put_u32_le(*node_id);
            }
        }
        buf
    }

    /// Decodes one membership message.
    ///
    /// # Errors
    ///
    /// Fails on truncation, unknown command bytes, or invalid field values.
    pub fn decode(buf: &mut impl Buf, swap: bool) -> Result<Self, DecodeError> {
        need(buf, 1)?;
        let cmd = buf.get_u8();
        match cmd {
            MEMB_JOINREQ => {
                need(buf, 29)?;
                let votes = buf.get_u8();
                let expected_votes = get_u32(buf, swap);
                let node_id = get_u32(buf, swap);
                let version = ProtocolVersion {
                    major: get_u32(buf, swap),
                    minor: get_u32(buf, swap),
                    patch: get_u32(buf, swap),
                    config: get_u32(buf, swap),
                };
                let addr_len = get_u32(buf, swap);
                let cluster_name = get_padded_name(buf, MAX_CLUSTER_NAME_LEN)?;
                let addresses = get_addresses(buf, swap, addr_len as usize)?;
                let name = get_short_name(buf)?;
                Ok(MembershipMessage::JoinReq(JoinRequest {
                    votes,
                    expected_votes,
                    node_id,
                    version,
                    addr_len,
                    cluster_name,
                    addresses,
                    name,
                }))
            }
            MEMB_JOINACK => {
                need(buf, 1)?;
                let ack = JoinAckType::from_wire(buf.get_u8())
                    .ok_or(DecodeError::InvalidField { context: "joinack" })?;
                Ok(MembershipMessage::JoinAck { ack })
            }
            MEMB_JOINCONF => {
                let (flags, nodes) = get_view(buf, swap)?;
                Ok(MembershipMessage::JoinConf { flags, nodes })
            }
            MEMB_CONFACK => Ok(MembershipMessage::ConfAck),
            MEMB_MASTERVIEW => {
                let (flags, nodes) = get_view(buf, swap)?;
                Ok(MembershipMessage::MasterView { flags, nodes })
            }
            MEMB_VIEWACK => {
                need(buf, 1)?;
                Ok(MembershipMessage::ViewAck {
                    agree: buf.get_u8() != 0,
                })
            }
            MEMB_STARTTRANS => Ok(MembershipMessage::StartTrans(get_starttrans(buf, swap)?)),
            MEMB_STARTACK => {
                need(buf, 4)?;
                Ok(MembershipMessage::StartAck {
                    generation: get_u32(buf, swap),
                })
            }
            MEMB_ENDTRANS => {
                need(buf, 16)?;
                Ok(MembershipMessage::EndTrans(EndTransition {
                    quorum: get_u32(buf, swap),
                    generation: get_u32(buf, swap),
                    total_votes: get_u32(buf, swap),
                    new_node_id: get_u32(buf, swap),
                }))
            }
            MEMB_HELLO => {
                need(buf, 7)?;
                let flags = buf.get_u8();
                let members = get_u16(buf, swap);
                let generation = get_u32(buf, swap);
                Ok(MembershipMessage::Hello(Hello {
                    members,
                    flags,
                    generation,
                }))
            }
            MEMB_NEWCLUSTER => {
                need(buf, 4)?;
                Ok(MembershipMessage::NewCluster {
                    tiebreak: get_u32(buf, swap),
                })
            }
            MEMB_NOMINATE => Ok(MembershipMessage::Nominate(get_starttrans(buf, swap)?)),
            MEMB_NODEDOWN => {
                need(buf, 7)?;
                let _pad = buf.get_u8();
                let reason = get_u16(buf, swap);
                let node_id = get_u32(buf, swap);
                Ok(MembershipMessage::NodeDown { reason, node_id })
            }
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

/// Name of the completion barrier every transition participant waits on.
#[must_use]
pub fn transition_barrier_name(generation: u32) -> String {
    format!("TRANSITION.{generation}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
