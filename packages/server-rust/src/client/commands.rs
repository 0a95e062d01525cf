//! Client command processing.
//!
//! One entry point, [`process_frame`], dispatches a decoded request to its
//! handler and queues the reply on the connection. Handlers return either
//! a non-negative status (with an optional payload) or a `ServiceError`
//! that maps onto the negative wire status. `WouldBlock` suppresses the
//! reply entirely; it arrives later (barrier completions, shutdown polls).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memberd_core::client::{
    cmd, encode_reply, encode_status_reply, encode_version, is_privileged, BarrierCmd,
    BarrierRequest, ClusterInfo, ExtraInfo, WireNode, EXTRA_FLAG_SHUTDOWN, EXTRA_FLAG_TWO_NODE,
};
use memberd_core::quorum::calculate_quorum;
use memberd_core::{
    EventKind, KillReason, LeaveReason, NodeState, ProtocolVersion, PORT_MEMBERSHIP,
    PROTOCOL_MAJOR, PROTOCOL_MINOR, PROTOCOL_PATCH,
};
use tracing::{debug, info, warn};

use crate::client::codec::ClientFrame;
use crate::client::connection::{ConnectionHandle, EndpointKind, ShutdownReply};
use crate::core::{ClusterCore, TimerKind};
use crate::error::{CmdResult, ServiceError};
use crate::registry::Node;

/// Handles one complete request frame from a client connection.
pub(crate) fn process_frame(core: &mut ClusterCore, conn: &Arc<ConnectionHandle>, frame: &ClientFrame) {
    let command = frame.header.command;
    debug!(command, conn = conn.id.0, "client command");

    if is_privileged(command) && conn.kind != EndpointKind::Admin {
        warn!(command, "privileged command on client endpoint");
        reply_status(conn, command, ServiceError::PermissionDenied.to_status());
        return;
    }

    // The admin endpoint has no data backlog; it cannot bind or send.
    if (command == cmd::DATA || command == cmd::BIND) && conn.kind == EndpointKind::Admin {
        reply_status(conn, command, ServiceError::InvalidArgument.to_status());
        return;
    }

    if command == cmd::DATA {
        if let Err(err) = do_send_data(core, conn, frame) {
            reply_status(conn, command, err.to_status());
        }
        return;
    }

    let mut body = frame.body.clone();
    let mut out = BytesMut::new();
    let result = dispatch(core, conn, command, &mut body, &mut out);
    match result {
        Ok(status) => {
            let reply = encode_reply(command, status, &out).freeze();
            let _ = conn.try_send(reply);
        }
        Err(ServiceError::WouldBlock) => {} // reply delivered later
        Err(err) => reply_status(conn, command, err.to_status()),
    }
}

fn reply_status(conn: &Arc<ConnectionHandle>, command: u32, status: i32) {
    let _ = conn.try_send(encode_status_reply(command, status).freeze());
}

fn dispatch(
    core: &mut ClusterCore,
    conn: &Arc<ConnectionHandle>,
    command: u32,
    body: &mut Bytes,
    out: &mut BytesMut,
) -> CmdResult {
    match command {
        cmd::GET_VERSION => {
            encode_version(&ProtocolVersion::current(core.config_version), out);
            Ok(0)
        }
        cmd::SET_VERSION => do_set_version(core, body),
        cmd::NOTIFY => {
            conn.metadata.write().events = true;
            Ok(0)
        }
        cmd::REMOVE_NOTIFY => {
            conn.metadata.write().events = false;
            Ok(0)
        }
        cmd::START_CONFCHG => {
            conn.metadata.write().confchg = true;
            Ok(0)
        }
        cmd::STOP_CONFCHG => {
            conn.metadata.write().confchg = false;
            Ok(0)
        }
        cmd::IS_QUORATE => Ok(i32::from(core.shared.quorate.load(Ordering::Acquire))),
        cmd::IS_ACTIVE => Ok(i32::from(core.shared.active.load(Ordering::Acquire))),
        cmd::IS_LISTENING => do_is_listening(core, body),
        cmd::GET_ALL_MEMBERS => do_get_all_members(core, out),
        cmd::GET_NODECOUNT => Ok(core.registry.lock().node_count() as i32),
        cmd::GET_NODE => do_get_node(core, body, out),
        cmd::GET_CLUSTER => {
            ClusterInfo {
                name: core.cfg.cluster_name.clone(),
                number: core.cfg.cluster_id,
                generation: core.generation,
            }
            .encode(out);
            Ok(0)
        }
        cmd::GET_EXTRA_INFO => do_get_extra_info(core, out),
        cmd::GET_JOINCOUNT => Ok(core.connections.count() as i32),
        cmd::SET_EXPECTED_VOTES => do_set_expected(core, body),
        cmd::SET_VOTES => do_set_votes(core, body),
        cmd::KILL_NODE => do_kill_node(core, body),
        cmd::BARRIER => do_barrier(core, conn, body),
        cmd::BIND => do_bind(core, conn, body),
        cmd::UNBIND => do_unbind(core, conn),
        cmd::LEAVE_CLUSTER => do_leave_cluster(core, body),
        cmd::TRY_SHUTDOWN => do_try_shutdown(core, conn, body),
        cmd::SHUTDOWN_REPLY => do_shutdown_reply(core, conn, body),
        cmd::REG_QUORUM_DEV => do_register_quorum_device(core, body),
        cmd::UNREG_QUORUM_DEV => do_unregister_quorum_device(core),
        cmd::POLL_QUORUM_DEV => do_poll_quorum_device(core, body),
        cmd::GET_NODE_ADDRS => do_get_node_addrs(core, body, out),
        cmd::SET_DEBUGLOG => {
            let mask = read_u32(body)?;
            info!(mask, "debug mask updated");
            Ok(0)
        }
        cmd::DUMP_CONFIG => do_dump_config(core, out),
        // Pre-join lifecycle: this daemon resolves its configuration and
        // joins at startup, so the staged setup commands report "already".
        cmd::SET_NODENAME
        | cmd::SET_NODEID
        | cmd::ADD_KEYFILE
        | cmd::ADD_MCAST
        | cmd::ADD_IFADDR
        | cmd::JOIN_CLUSTER => {
            if core.shared.active.load(Ordering::Acquire) {
                Err(ServiceError::Already)
            } else {
                Err(ServiceError::NotConnected)
            }
        }
        _ => Err(ServiceError::InvalidArgument),
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn read_u32(body: &mut Bytes) -> Result<u32, ServiceError> {
    if body.remaining() < 4 {
        return Err(ServiceError::InvalidArgument);
    }
    Ok(body.get_u32_le())
}

fn read_i32(body: &mut Bytes) -> Result<i32, ServiceError> {
    if body.remaining() < 4 {
        return Err(ServiceError::InvalidArgument);
    }
    Ok(body.get_i32_le())
}

fn require_member(core: &ClusterCore) -> Result<(), ServiceError> {
    if core.shared.is_member.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(ServiceError::NotAMember)
    }
}

fn wire_node(node: &Node) -> WireNode {
    WireNode {
        node_id: node.node_id,
        us: node.is_us,
        leave_reason: node.leave_reason.map_or(0, |r| u32::from(r.to_wire())),
        incarnation: node.incarnation,
        state: node.state,
        votes: node.votes,
        address: node.addresses.first().cloned(),
        name: node.name.clone(),
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

fn do_send_data(
    core: &mut ClusterCore,
    conn: &Arc<ConnectionHandle>,
    frame: &ClientFrame,
) -> Result<(), ServiceError> {
    let mut body = frame.body.clone();
    if body.remaining() < 8 {
        return Err(ServiceError::InvalidArgument);
    }
    let node_id = body.get_i32_le();
    let mut port = body.get_u32_le();

    let bound = conn.bound_port();
    if port == 0 {
        port = u32::from(bound);
    }
    if port == 0 || port > 255 {
        return Err(ServiceError::InvalidArgument);
    }

    let target = if node_id <= 0 { 0 } else { node_id as u32 };
    core.send_user_data(&body, bound, port as u8, target, frame.header.flags)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn do_is_listening(core: &mut ClusterCore, body: &mut Bytes) -> CmdResult {
    require_member(core)?;
    if body.remaining() < 5 {
        return Err(ServiceError::InvalidArgument);
    }
    let port = body.get_u8();
    let mut node_id = body.get_u32_le();
    if node_id == 0 {
        node_id = core.shared.node_id.load(Ordering::Acquire);
    }

    let us = core.shared.node_id.load(Ordering::Acquire);
    if node_id == us {
        return Ok(i32::from(core.ports.lookup(port).is_some() || port == PORT_MEMBERSHIP));
    }

    let (known, unheard, listening) = {
        let registry = core.registry.lock();
        match registry.get(node_id) {
            None => (false, false, false),
            Some(node) if !node.is_member() => return Err(ServiceError::NotConnected),
            Some(node) => (true, node.ports.is_unknown(), node.ports.get(port)),
        }
    };
    if !known {
        return Err(ServiceError::NoSuchEntity);
    }

    if unheard {
        // We have no port data yet; ask and let the caller retry (or wait
        // for the PORTOPENED notification).
        debug!(node_id, "no port data, sending PORTENQ");
        if core
            .demux
            .send_control(&memberd_core::ControlMessage::PortEnq, node_id)
            .is_err()
        {
            return Err(ServiceError::NotConnected);
        }
        return Ok(0);
    }
    Ok(i32::from(listening))
}

fn do_get_all_members(core: &mut ClusterCore, out: &mut BytesMut) -> CmdResult {
    require_member(core)?;
    let registry = core.registry.lock();
    let mut count = 0;
    for node in registry.iter() {
        wire_node(node).encode(out);
        count += 1;
    }
    if let Some(device) = registry.quorum_device() {
        wire_node(device).encode(out);
        count += 1;
    }
    Ok(count)
}

fn do_get_node(core: &mut ClusterCore, body: &mut Bytes, out: &mut BytesMut) -> CmdResult {
    require_member(core)?;
    let mut node_id = read_u32(body)?;
    let name = read_short_name(body)?;

    let registry = core.registry.lock();
    let node = if name.is_empty() {
        if node_id == 0 {
            node_id = core.shared.node_id.load(Ordering::Acquire);
        }
        registry.get(node_id)
    } else {
        registry.find_by_name(&name)
    };
    match node {
        Some(node) => {
            wire_node(node).encode(out);
            Ok(0)
        }
        None => Err(ServiceError::NoSuchEntity),
    }
}

fn read_short_name(body: &mut Bytes) -> Result<String, ServiceError> {
    if body.remaining() < 1 {
        return Err(ServiceError::InvalidArgument);
    }
    let len = usize::from(body.get_u8());
    if body.remaining() < len {
        return Err(ServiceError::InvalidArgument);
    }
    let mut raw = vec![0u8; len];
    body.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| ServiceError::InvalidArgument)
}

fn do_get_extra_info(core: &mut ClusterCore, out: &mut BytesMut) -> CmdResult {
    require_member(core)?;
    let registry = core.registry.lock();
    let us = registry.us();
    let tally = registry.tally();

    let mut flags = 0;
    if core.cfg.two_node {
        flags |= EXTRA_FLAG_TWO_NODE;
    }
    if core.shutdown.is_shutting_down() {
        flags |= EXTRA_FLAG_SHUTDOWN;
    }

    ExtraInfo {
        node_state: us.state,
        flags,
        node_votes: u32::from(us.votes),
        total_votes: tally.total_votes,
        expected_votes: tally.highest_expected,
        quorum: core.quorum,
        members: registry.member_count() as u32,
        connections: core.connections.count() as u32,
        ports: *us.ports.as_bytes(),
        addresses: us.addresses.clone(),
    }
    .encode(out);
    Ok(0)
}

fn do_get_node_addrs(core: &mut ClusterCore, body: &mut Bytes, out: &mut BytesMut) -> CmdResult {
    require_member(core)?;
    let node_id = read_u32(body)?;
    let registry = core.registry.lock();
    let Some(node) = registry.get(node_id) else {
        return Err(ServiceError::NoSuchEntity);
    };
    out.put_u32_le(node.addresses.len() as u32);
    for addr in &node.addresses {
        out.put_u16_le(addr.len() as u16);
        out.put_slice(addr.as_bytes());
    }
    Ok(0)
}

fn do_dump_config(core: &mut ClusterCore, out: &mut BytesMut) -> CmdResult {
    let cfg = &core.cfg;
    let mut text = format!(
        "cluster {} (id {}), node {} (id {}), votes {}, expected {}, two_node {}\n",
        cfg.cluster_name,
        cfg.cluster_id,
        cfg.nodename,
        core.shared.node_id.load(Ordering::Acquire),
        cfg.votes,
        cfg.expected_votes,
        cfg.two_node,
    );
    for spec in &cfg.nodes {
        text.push_str(&format!(
            "node {} id {} votes {} addr {}\n",
            spec.name,
            spec.node_id,
            spec.votes,
            spec.address.as_deref().unwrap_or("-")
        ));
    }
    text.push_str(&format!("timeouts {:?}\n", cfg.timeouts));
    out.put_slice(text.as_bytes());
    Ok(0)
}

// ---------------------------------------------------------------------------
// Votes and versions
// ---------------------------------------------------------------------------

fn do_set_version(core: &mut ClusterCore, body: &mut Bytes) -> CmdResult {
    require_member(core)?;
    if body.remaining() < 16 {
        return Err(ServiceError::InvalidArgument);
    }
    let major = body.get_u32_le();
    let minor = body.get_u32_le();
    let patch = body.get_u32_le();
    let config = body.get_u32_le();

    if major != PROTOCOL_MAJOR || minor != PROTOCOL_MINOR || patch != PROTOCOL_PATCH {
        return Err(ServiceError::InvalidArgument);
    }
    if config == core.config_version {
        return Ok(0);
    }
    core.config_version = config;
    // Peers adopt it when our own message comes back around.
    let us = core.shared.node_id.load(Ordering::Acquire);
    let msg = memberd_core::ControlMessage::Reconfigure {
        param: memberd_core::ReconfigureParam::ConfigVersion,
        node_id: us,
        value: config,
    };
    core.demux
        .send_control(&msg, 0)
        .map_err(|_| ServiceError::NotConnected)?;
    Ok(0)
}

fn do_set_expected(core: &mut ClusterCore, body: &mut Bytes) -> CmdResult {
    require_member(core)?;
    let new_expected = read_u32(body)?;
    if new_expected == 0 {
        return Err(ServiceError::InvalidArgument);
    }

    let tally = core.registry.lock().tally();
    let check = calculate_quorum(tally, new_expected, 0, true, core.cfg.two_node);
    if !memberd_core::sane_quorum(check.quorum, check.total_votes) {
        return Err(ServiceError::InvalidArgument);
    }

    core.registry.lock().cap_expected_votes(new_expected);
    core.recalculate_quorum(true);

    let us = core.shared.node_id.load(Ordering::Acquire);
    let msg = memberd_core::ControlMessage::Reconfigure {
        param: memberd_core::ReconfigureParam::ExpectedVotes,
        node_id: us,
        value: new_expected,
    };
    core.demux
        .send_control(&msg, 0)
        .map_err(|_| ServiceError::NotConnected)?;
    Ok(0)
}

fn do_set_votes(core: &mut ClusterCore, body: &mut Bytes) -> CmdResult {
    require_member(core)?;
    let mut node_id = read_u32(body)?;
    let votes = read_u32(body)?;
    if votes > 255 {
        return Err(ServiceError::OutOfRange);
    }
    if node_id == 0 {
        node_id = core.shared.node_id.load(Ordering::Acquire);
    }
    debug!(node_id, votes, "setting votes");

    let saved = {
        let mut registry = core.registry.lock();
        let Some(node) = registry.get_mut(node_id) else {
            return Err(ServiceError::NoSuchEntity);
        };
        let saved = node.votes;
        node.votes = votes as u8;
        saved
    };

    let tally = core.registry.lock().tally();
    let check = calculate_quorum(tally, 0, 0, true, core.cfg.two_node);
    if !memberd_core::sane_quorum(check.quorum, check.total_votes) {
        if let Some(node) = core.registry.lock().get_mut(node_id) {
            node.votes = saved;
        }
        return Err(ServiceError::InvalidArgument);
    }

    core.recalculate_quorum(true);
    let msg = memberd_core::ControlMessage::Reconfigure {
        param: memberd_core::ReconfigureParam::NodeVotes,
        node_id,
        value: votes,
    };
    core.demux
        .send_control(&msg, 0)
        .map_err(|_| ServiceError::NotConnected)?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

fn do_kill_node(core: &mut ClusterCore, body: &mut Bytes) -> CmdResult {
    require_member(core)?;
    let node_id = read_u32(body)?;
    {
        let mut registry = core.registry.lock();
        let Some(node) = registry.get_mut(node_id) else {
            return Err(ServiceError::InvalidArgument);
        };
        if node.state != NodeState::Member {
            return Err(ServiceError::InvalidArgument);
        }
        node.leave_reason = Some(LeaveReason::Killed);
        node.state = NodeState::Leaving;
    }
    core.send_kill(node_id, KillReason::OperatorRequest);
    Ok(0)
}

fn do_leave_cluster(core: &mut ClusterCore, body: &mut Bytes) -> CmdResult {
    if !core.shared.active.load(Ordering::Acquire) {
        return Err(ServiceError::NotConnected);
    }
    require_member(core)?;
    let flags = read_u32(body)?;
    let reason = LeaveReason::from_wire(flags as u16).unwrap_or(LeaveReason::Shutdown);
    core.leave_cluster(reason);
    Ok(0)
}

fn do_try_shutdown(
    core: &mut ClusterCore,
    conn: &Arc<ConnectionHandle>,
    body: &mut Bytes,
) -> CmdResult {
    let flags = if body.remaining() >= 4 {
        body.get_u32_le()
    } else {
        0
    };

    let listeners = core.connections.begin_shutdown_poll();
    if !core.shutdown.begin_poll(conn.id, flags, listeners) {
        return Err(ServiceError::Busy);
    }
    info!(flags, listeners, "shutdown requested, polling clients");

    if listeners == 0 {
        core.resolve_shutdown_poll(true);
    } else {
        core.notify_event(EventKind::TryShutdown, flags, None);
        core.timers.arm(
            TimerKind::Shutdown,
            Duration::from_millis(core.cfg.timeouts.shutdown_timeout),
        );
    }
    // The requester hears back when the poll resolves.
    Err(ServiceError::WouldBlock)
}

fn do_shutdown_reply(
    core: &mut ClusterCore,
    conn: &Arc<ConnectionHandle>,
    body: &mut Bytes,
) -> CmdResult {
    let agreed = read_u32(body)? != 0;
    conn.metadata.write().shutdown_reply = if agreed {
        ShutdownReply::Yes
    } else {
        ShutdownReply::No
    };
    core.resolve_shutdown_poll(false);
    Ok(0)
}

impl ClusterCore {
    /// Checks whether the shutdown poll can be resolved; `expired` forces a
    /// decision counting silent clients as consenting.
    pub(crate) fn resolve_shutdown_poll(&mut self, expired: bool) {
        let Some(poll) = self.shutdown.current_poll() else {
            return;
        };
        let (yes, no, outstanding) = self.connections.shutdown_poll_state();
        if !expired && outstanding > 0 && no == 0 {
            return;
        }

        let approved = poll.forced() || no == 0;
        debug!(yes, no, outstanding, approved, "shutdown poll resolved");
        self.timers.cancel(TimerKind::Shutdown);

        let status = if approved {
            0
        } else {
            ServiceError::Busy.to_status()
        };
        let frame = encode_status_reply(cmd::TRY_SHUTDOWN, status).freeze();
        self.connections.notify(&frame, Some(poll.requester));

        if approved {
            let reason = if poll.remove() {
                LeaveReason::Removed
            } else {
                LeaveReason::Shutdown
            };
            self.leave_cluster(reason);
        }
        let _ = self.shutdown.finish_poll(approved);
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

fn do_bind(core: &mut ClusterCore, conn: &Arc<ConnectionHandle>, body: &mut Bytes) -> CmdResult {
    let port = read_u32(body)?;
    if port == 0 || port > 255 {
        return Err(ServiceError::InvalidArgument);
    }
    let port = port as u8;
    if port == PORT_MEMBERSHIP {
        // Reserved by the membership layer itself.
        return Err(ServiceError::AddressInUse);
    }
    if conn.bound_port() != 0 {
        return Err(ServiceError::AddressInUse);
    }
    if !core.ports.bind(port, conn.id) {
        return Err(ServiceError::AddressInUse);
    }

    conn.metadata.write().port = port;
    core.registry.lock().us_mut().ports.set(port);
    debug!(port, conn = conn.id.0, "port bound");
    core.demux
        .send_control(&memberd_core::ControlMessage::PortOpened { port }, 0)
        .map_err(|_| ServiceError::NotConnected)?;
    Ok(0)
}

fn do_unbind(core: &mut ClusterCore, conn: &Arc<ConnectionHandle>) -> CmdResult {
    let port = conn.bound_port();
    if port == 0 {
        return Err(ServiceError::NoSuchEntity);
    }
    conn.metadata.write().port = 0;
    core.release_port(port);
    Ok(0)
}

// ---------------------------------------------------------------------------
// Barriers
// ---------------------------------------------------------------------------

fn do_barrier(core: &mut ClusterCore, conn: &Arc<ConnectionHandle>, body: &mut Bytes) -> CmdResult {
    require_member(core)?;
    let request = BarrierRequest::decode(body).map_err(|_| ServiceError::InvalidArgument)?;
    let barriers = Arc::clone(&core.barriers);
    match request.cmd {
        BarrierCmd::Register => barriers.register(conn.id, &request.name, request.flags, request.arg),
        BarrierCmd::Change => barriers.setattr(&request.name, request.flags, request.arg),
        BarrierCmd::Wait => barriers.wait(conn.id, &request.name),
        BarrierCmd::Delete => barriers.delete(&request.name),
    }
}

// ---------------------------------------------------------------------------
// Quorum device
// ---------------------------------------------------------------------------

fn do_register_quorum_device(core: &mut ClusterCore, body: &mut Bytes) -> CmdResult {
    require_member(core)?;
    let votes = read_u32(body)?;
    if votes > 255 {
        return Err(ServiceError::OutOfRange);
    }
    let name = read_short_name(body)?;
    if name.is_empty() || name.len() > memberd_core::MAX_NODE_NAME_LEN {
        return Err(ServiceError::InvalidArgument);
    }

    let mut registry = core.registry.lock();
    if registry.quorum_device().is_some() {
        return Err(ServiceError::Busy);
    }
    if registry.find_by_name(&name).is_some() {
        return Err(ServiceError::Already);
    }
    if !registry.register_quorum_device(&name, votes as u8) {
        return Err(ServiceError::InvalidArgument);
    }
    info!(device = %name, votes, "quorum device registered");
    Ok(0)
}

fn do_unregister_quorum_device(core: &mut ClusterCore) -> CmdResult {
    let mut registry = core.registry.lock();
    let device_alive = match registry.quorum_device() {
        None => return Err(ServiceError::InvalidArgument),
        Some(device) => device.is_member(),
    };
    if device_alive {
        return Err(ServiceError::Busy);
    }
    registry.unregister_quorum_device();
    Ok(0)
}

fn do_poll_quorum_device(core: &mut ClusterCore, body: &mut Bytes) -> CmdResult {
    let alive = read_i32(body)? != 0;
    let changed = {
        let mut registry = core.registry.lock();
        let Some(device) = registry.quorum_device_mut() else {
            return Err(ServiceError::InvalidArgument);
        };
        if alive {
            device.last_hello = Some(Instant::now());
            if device.state == NodeState::Dead {
                device.state = NodeState::Member;
                true
            } else {
                false
            }
        } else if device.state == NodeState::Member {
            device.state = NodeState::Dead;
            true
        } else {
            false
        }
    };
    if changed {
        core.recalculate_quorum(false);
    }
    Ok(0)
}
