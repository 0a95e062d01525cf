//! Local client protocol: the framed request/reply/event format spoken over
//! the unix-stream endpoints.
//!
//! Every message leads with a fixed 20-byte header (magic, version, total
//! length, command, flags). Replies append a 32-bit status; data messages a
//! `{node_id, port}` pair; events a `{reason, arg}` pair. Commands with the
//! top bit set are only honored on the admin endpoint.

use bytes::{Buf, BufMut, BytesMut};

use crate::ports::PORT_BITS_SIZE;
use crate::types::{NodeAddress, NodeState, ProtocolVersion, MAX_BARRIER_NAME_LEN,
    MAX_CLUSTER_NAME_LEN};
use crate::wire::DecodeError;

/// Constant leading every client-protocol message.
pub const CLIENT_MAGIC: u32 = 0x434d_414e;
/// Protocol version constant.
pub const CLIENT_VERSION: u32 = 0x1000_0003;
/// Size of the fixed header.
pub const CLIENT_HEADER_SIZE: usize = 20;

/// Command flag: only allowed on the admin endpoint.
pub const CMDFLAG_PRIV: u32 = 0x8000_0000;
/// Command flag: this message is a reply.
pub const CMDFLAG_REPLY: u32 = 0x4000_0000;

// ---------------------------------------------------------------------------
// Command codes
// ---------------------------------------------------------------------------

/// Client command numbers. The privileged bit is part of the value.
pub mod cmd {
    /// Subscribe to event notifications.
    pub const NOTIFY: u32 = 0x0000_0001;
    /// Unsubscribe from event notifications.
    pub const REMOVE_NOTIFY: u32 = 0x0000_0002;
    pub const SET_EXPECTED_VOTES: u32 = 0x8000_0004;
    pub const IS_QUORATE: u32 = 0x0000_0005;
    pub const IS_LISTENING: u32 = 0x0000_0006;
    pub const GET_ALL_MEMBERS: u32 = 0x0000_0007;
    pub const SET_VOTES: u32 = 0x8000_0008;
    pub const GET_VERSION: u32 = 0x0000_0009;
    pub const SET_VERSION: u32 = 0x8000_000a;
    pub const IS_ACTIVE: u32 = 0x0000_000b;
    pub const KILL_NODE: u32 = 0x8000_000c;
    pub const GET_JOINCOUNT: u32 = 0x0000_000d;
    pub const GET_NODECOUNT: u32 = 0x0000_000e;
    pub const GET_NODE: u32 = 0x0000_0090;
    pub const GET_CLUSTER: u32 = 0x0000_0091;
    pub const GET_EXTRA_INFO: u32 = 0x0000_0092;
    pub const BARRIER: u32 = 0x0000_00a0;
    pub const LEAVE_CLUSTER: u32 = 0x8000_00b4;
    pub const REG_QUORUM_DEV: u32 = 0x8000_00b5;
    pub const UNREG_QUORUM_DEV: u32 = 0x8000_00b6;
    pub const POLL_QUORUM_DEV: u32 = 0x8000_00b7;
    pub const TRY_SHUTDOWN: u32 = 0x8000_00bb;
    pub const SHUTDOWN_REPLY: u32 = 0x0000_00bc;
    pub const GET_NODE_ADDRS: u32 = 0x0000_00bf;
    pub const START_CONFCHG: u32 = 0x0000_00c0;
    pub const STOP_CONFCHG: u32 = 0x0000_00c1;
    pub const SET_DEBUGLOG: u32 = 0x8000_00c3;
    pub const DUMP_CONFIG: u32 = 0x8000_00c4;
    pub const SET_NODENAME: u32 = 0x8000_00d0;
    pub const SET_NODEID: u32 = 0x8000_00d1;
    pub const JOIN_CLUSTER: u32 = 0x8000_00d2;
    pub const ADD_MCAST: u32 = 0x8000_00d3;
    pub const ADD_IFADDR: u32 = 0x8000_00d4;
    pub const ADD_KEYFILE: u32 = 0x8000_00d5;

    pub const DATA: u32 = 0x0000_0100;
    pub const BIND: u32 = 0x0000_0101;
    pub const EVENT: u32 = 0x0000_0102;
    pub const CONFCHG: u32 = 0x0000_0103;
    pub const UNBIND: u32 = 0x0000_0104;
}

/// True if the command may only be issued on the admin endpoint.
#[must_use]
pub fn is_privileged(command: u32) -> bool {
    command & CMDFLAG_PRIV != 0
}

/// TRY_SHUTDOWN flag: shut down even if clients object.
pub const SHUTDOWN_ANYWAY: u32 = 1;
/// TRY_SHUTDOWN flag: leave as "removed", allowing quorum to shrink.
pub const SHUTDOWN_REMOVE: u32 = 2;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Reply status values: 0 or positive for success, small negative integers
/// (errno-shaped) for failures.
pub mod status {
    pub const OK: i32 = 0;
    pub const PERMISSION_DENIED: i32 = -1;
    pub const NO_SUCH_ENTITY: i32 = -2;
    pub const NO_SUCH_PROCESS: i32 = -3;
    pub const IO_ERROR: i32 = -5;
    pub const WOULD_BLOCK: i32 = -11;
    pub const BUSY: i32 = -16;
    pub const INVALID_ARGUMENT: i32 = -22;
    pub const OUT_OF_RANGE: i32 = -34;
    pub const ADDRESS_IN_USE: i32 = -98;
    pub const NOT_CONNECTED: i32 = -107;
    pub const TIMED_OUT: i32 = -110;
    pub const ALREADY: i32 = -114;
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The fixed header leading every client-protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeader {
    pub magic: u32,
    pub version: u32,
    /// Total message length, header included.
    pub length: u32,
    pub command: u32,
    pub flags: u32,
}

impl ClientHeader {
    /// A request/reply header for `command` with `body_len` payload bytes.
    #[must_use]
    pub fn new(command: u32, body_len: usize) -> Self {
        Self {
            magic: CLIENT_MAGIC,
            version: CLIENT_VERSION,
            length: (CLIENT_HEADER_SIZE + body_len) as u32,
            command,
            flags: 0,
        }
    }

    #[must_use]
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(CLIENT_HEADER_SIZE)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.command);
        buf.put_u32_le(self.flags);
    }

    /// Decodes a header and validates magic and version.
    ///
    /// # Errors
    ///
    /// Returns `Truncated` for short input and `InvalidField` for a bad
    /// magic, version, or length field.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < CLIENT_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                need: CLIENT_HEADER_SIZE,
                have: buf.remaining(),
            });
        }
        let header = Self {
            magic: buf.get_u32_le(),
            version: buf.get_u32_le(),
            length: buf.get_u32_le(),
            command: buf.get_u32_le(),
            flags: buf.get_u32_le(),
        };
        if header.magic != CLIENT_MAGIC {
            return Err(DecodeError::InvalidField { context: "magic" });
        }
        if header.version != CLIENT_VERSION {
            return Err(DecodeError::InvalidField { context: "version" });
        }
        if (header.length as usize) < CLIENT_HEADER_SIZE {
            return Err(DecodeError::InvalidField { context: "length" });
        }
        Ok(header)
    }
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

/// Builds a status-only reply for `command`.
#[must_use]
pub fn encode_status_reply(command: u32, status: i32) -> BytesMut {
    encode_reply(command, status, &[])
}

/// Builds a reply carrying `status` and a payload.
#[must_use]
pub fn encode_reply(command: u32, status: i32, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(CLIENT_HEADER_SIZE + 4 + body.len());
    let mut header = ClientHeader::new(command | CMDFLAG_REPLY, 4 + body.len());
    header.flags = CMDFLAG_REPLY;
    header.encode(&mut buf);
    buf.put_i32_le(status);
    buf.put_slice(body);
    buf
}

/// Builds a data message (server-to-client delivery or client send).
#[must_use]
pub fn encode_data(command: u32, node_id: i32, port: u32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(CLIENT_HEADER_SIZE + 8 + payload.len());
    ClientHeader::new(command, 8 + payload.len()).encode(&mut buf);
    buf.put_i32_le(node_id);
    buf.put_u32_le(port);
    buf.put_slice(payload);
    buf
}

/// Builds an event message pushed to subscribed connections.
#[must_use]
pub fn encode_event(reason: u32, arg: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(CLIENT_HEADER_SIZE + 8);
    ClientHeader::new(cmd::EVENT, 8).encode(&mut buf);
    buf.put_u32_le(reason);
    buf.put_u32_le(arg);
    buf
}

/// Builds a configuration-change message: member, left and joined node-id
/// lists, in that order.
#[must_use]
pub fn encode_confchg(members: &[u32], left: &[u32], joined: &[u32]) -> BytesMut {
    let entries = members.len() + left.len() + joined.len();
    let mut buf = BytesMut::with_capacity(CLIENT_HEADER_SIZE + 12 + entries * 4);
    ClientHeader::new(cmd::CONFCHG, 12 + entries * 4).encode(&mut buf);
    buf.put_u32_le(members.len() as u32);
    buf.put_u32_le(left.len() as u32);
    buf.put_u32_le(joined.len() as u32);
    for id in members.iter().chain(left).chain(joined) {
        buf.put_u32_le(*id);
    }
    buf
}

// ---------------------------------------------------------------------------
// Command payloads
// ---------------------------------------------------------------------------

/// One node as returned by node-get and all-members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireNode {
    pub node_id: u32,
    pub us: bool,
    pub leave_reason: u32,
    pub incarnation: u64,
    pub state: NodeState,
    pub votes: u8,
    pub address: Option<NodeAddress>,
    pub name: String,
}

impl WireNode {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.node_id);
        buf.put_u8(u8::from(self.us));
        buf.put_u32_le(self.leave_reason);
        buf.put_u64_le(self.incarnation);
        buf.put_u8(self.state.to_wire());
        buf.put_u8(self.votes);
        match &self.address {
            Some(addr) => {
                buf.put_u16_le(addr.len() as u16);
                buf.put_slice(addr.as_bytes());
            }
            None => buf.put_u16_le(0),
        }
        let name = self.name.as_bytes();
        buf.put_u8(name.len().min(255) as u8);
        buf.put_slice(&name[..name.len().min(255)]);
    }

    /// # Errors
    ///
    /// Fails on truncation or an invalid state byte.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 21 {
            return Err(DecodeError::Truncated {
                need: 21,
                have: buf.remaining(),
            });
        }
        let node_id = buf.get_u32_le();
        let us = buf.get_u8() != 0;
        let leave_reason = buf.get_u32_le();
        let incarnation = buf.get_u64_le();
        let state = NodeState::from_wire(buf.get_u8())
            .ok_or(DecodeError::InvalidField { context: "node state" })?;
        let votes = buf.get_u8();
        let addr_len = usize::from(buf.get_u16_le());
        if buf.remaining() < addr_len {
            return Err(DecodeError::Truncated {
                need: addr_len,
                have: buf.remaining(),
            });
        }
        let address = if addr_len == 0 {
            None
        } else {
            let mut raw = vec![0u8; addr_len];
            buf.copy_to_slice(&mut raw);
            Some(NodeAddress::new(raw))
        };
        if buf.remaining() < 1 {
            return Err(DecodeError::Truncated {
                need: 1,
                have: 0,
            });
        }
        let name_len = usize::from(buf.get_u8());
        if buf.remaining() < name_len {
            return Err(DecodeError::Truncated {
                need: name_len,
                have: buf.remaining(),
            });
        }
        let mut raw = vec![0u8; name_len];
        buf.copy_to_slice(&mut raw);
        let name =
            String::from_utf8(raw).map_err(|_| DecodeError::InvalidField { context: "name" })?;
        Ok(Self {
            node_id,
            us,
            leave_reason,
            incarnation,
            state,
            votes,
            address,
            name,
        })
    }
}

/// Extra-info flag: two-node mode is active.
pub const EXTRA_FLAG_TWO_NODE: u32 = 1;
/// Extra-info flag: the daemon hit an internal error.
pub const EXTRA_FLAG_ERROR: u32 = 2;
/// Extra-info flag: a shutdown is in progress.
pub const EXTRA_FLAG_SHUTDOWN: u32 = 4;

/// The extra-info reply: quorum/vote breakdown plus local addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraInfo {
    pub node_state: NodeState,
    pub flags: u32,
    pub node_votes: u32,
    pub total_votes: u32,
    pub expected_votes: u32,
    pub quorum: u32,
    pub members: u32,
    pub connections: u32,
    pub ports: [u8; PORT_BITS_SIZE],
    pub addresses: Vec<NodeAddress>,
}

impl ExtraInfo {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.node_state.to_wire());
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.node_votes);
        buf.put_u32_le(self.total_votes);
        buf.put_u32_le(self.expected_votes);
        buf.put_u32_le(self.quorum);
        buf.put_u32_le(self.members);
        buf.put_u32_le(self.connections);
        buf.put_slice(&self.ports);
        buf.put_u32_le(self.addresses.len() as u32);
        for addr in &self.addresses {
            buf.put_u16_le(addr.len() as u16);
            buf.put_slice(addr.as_bytes());
        }
    }

    /// # Errors
    ///
    /// Fails on truncation or an invalid state byte.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let fixed = 1 + 7 * 4 + PORT_BITS_SIZE;
        if buf.remaining() < fixed {
            return Err(DecodeError::Truncated {
                need: fixed,
                have: buf.remaining(),
            });
        }
        let node_state = NodeState::from_wire(buf.get_u8())
            .ok_or(DecodeError::InvalidField { context: "node state" })?;
        let flags = buf.get_u32_le();
        let node_votes = buf.get_u32_le();
        let total_votes = buf.get_u32_le();
        let expected_votes = buf.get_u32_le();
        let quorum = buf.get_u32_le();
        let members = buf.get_u32_le();
        let connections = buf.get_u32_le();
        let mut ports = [0u8; PORT_BITS_SIZE];
        buf.copy_to_slice(&mut ports);
        let count = buf.get_u32_le() as usize;
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 2 {
                return Err(DecodeError::Truncated {
                    need: 2,
                    have: buf.remaining(),
                });
            }
            let len = usize::from(buf.get_u16_le());
            if buf.remaining() < len {
                return Err(DecodeError::Truncated {
                    need: len,
                    have: buf.remaining(),
                });
            }
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            addresses.push(NodeAddress::new(raw));
        }
        Ok(Self {
            node_state,
            flags,
            node_votes,
            total_votes,
            expected_votes,
            quorum,
            members,
            connections,
            ports,
            addresses,
        })
    }
}

/// Cluster identity as returned by cluster-info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub number: u16,
    pub generation: u32,
}

impl ClusterInfo {
    pub fn encode(&self, buf: &mut impl BufMut) {
        let name = self.name.as_bytes();
        let n = name.len().min(MAX_CLUSTER_NAME_LEN);
        buf.put_u8(n as u8);
        buf.put_slice(&name[..n]);
        buf.put_u16_le(self.number);
        buf.put_u32_le(self.generation);
    }

    /// # Errors
    ///
    /// Fails on truncation or a non-UTF-8 name.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 1 {
            return Err(DecodeError::Truncated {
                need: 1,
                have: 0,
            });
        }
        let len = usize::from(buf.get_u8());
        if buf.remaining() < len + 6 {
            return Err(DecodeError::Truncated {
                need: len + 6,
                have: buf.remaining(),
            });
        }
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        let name =
            String::from_utf8(raw).map_err(|_| DecodeError::InvalidField { context: "name" })?;
        Ok(Self {
            name,
            number: buf.get_u16_le(),
            generation: buf.get_u32_le(),
        })
    }
}

/// Version get/set payload (4 little-endian u32s).
pub fn encode_version(version: &ProtocolVersion, buf: &mut impl BufMut) {
    buf.put_u32_le(version.major);
    buf.put_u32_le(version.minor);
    buf.put_u32_le(version.patch);
    buf.put_u32_le(version.config);
}

/// # Errors
///
/// Fails on truncation.
pub fn decode_version(buf: &mut impl Buf) -> Result<ProtocolVersion, DecodeError> {
    if buf.remaining() < 16 {
        return Err(DecodeError::Truncated {
            need: 16,
            have: buf.remaining(),
        });
    }
    Ok(ProtocolVersion {
        major: buf.get_u32_le(),
        minor: buf.get_u32_le(),
        patch: buf.get_u32_le(),
        config: buf.get_u32_le(),
    })
}

// ---------------------------------------------------------------------------
// Barrier command payload
// ---------------------------------------------------------------------------

/// Barrier sub-commands from the client API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierCmd {
    Register,
    Change,
    Delete,
    Wait,
}

impl BarrierCmd {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            BarrierCmd::Register => 1,
            BarrierCmd::Change => 2,
            BarrierCmd::Delete => 3,
            BarrierCmd::Wait => 4,
        }
    }

    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(BarrierCmd::Register),
            2 => Some(BarrierCmd::Change),
            3 => Some(BarrierCmd::Delete),
            4 => Some(BarrierCmd::Wait),
            _ => None,
        }
    }
}

/// Barrier attribute bits.
pub const BARRIER_ATTR_AUTODELETE: u32 = 1;
pub const BARRIER_ATTR_MULTISTEP: u32 = 2;
pub const BARRIER_ATTR_ENABLED: u32 = 8;

/// Attribute selectors for the barrier change command.
pub const BARRIER_SETATTR_AUTODELETE: u32 = 1;
pub const BARRIER_SETATTR_MULTISTEP: u32 = 2;
pub const BARRIER_SETATTR_ENABLED: u32 = 3;
pub const BARRIER_SETATTR_NODES: u32 = 4;
pub const BARRIER_SETATTR_TIMEOUT: u32 = 6;

/// A barrier command as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierRequest {
    pub cmd: BarrierCmd,
    pub name: String,
    /// Attribute flags (register) or attribute selector (change).
    pub flags: u32,
    /// Expected nodes (register), attribute value (change).
    pub arg: u32,
}

impl BarrierRequest {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.cmd.to_wire());
        let name = self.name.as_bytes();
        let n = name.len().min(MAX_BARRIER_NAME_LEN);
        buf.put_u8(n as u8);
        buf.put_slice(&name[..n]);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.arg);
    }

    /// # Errors
    ///
    /// Fails on truncation or an unknown sub-command.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 2 {
            return Err(DecodeError::Truncated {
                need: 2,
                have: buf.remaining(),
            });
        }
        let cmd = BarrierCmd::from_wire(buf.get_u8())
            .ok_or(DecodeError::InvalidField { context: "barrier cmd" })?;
        let len = usize::from(buf.get_u8());
        if buf.remaining() < len + 8 {
            return Err(DecodeError::Truncated {
                need: len + 8,
                have: buf.remaining(),
            });
        }
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        let name = String::from_utf8(raw)
            .map_err(|_| DecodeError::InvalidField { context: "barrier name" })?;
        Ok(Self {
            cmd,
            name,
            flags: buf.get_u32_le(),
            arg: buf.get_u32_le(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
