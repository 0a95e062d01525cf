//! Cluster-wide named barriers, layered over the ordered multicast.
//!
//! A barrier completes in two phases. Enabling it multicasts WAIT; every
//! node counts WAITs (its own included, since the transport loops
//! multicasts back) and, when the count reaches the expected number of
//! nodes, multicasts COMPLETE and moves to phase 2. When the COMPLETE
//! count reaches the target the barrier is complete and the waiting client
//! gets its reply. Both message types ride the same total order, so every
//! node flips at the same logical point.
//!
//! Locking: the barrier list is a `DashMap`; each record has its own mutex
//! for phase transitions. The reply to the waiting client is delivered
//! under the record's lock.

use std::sync::Arc;

use dashmap::DashMap;
use memberd_core::client::{cmd, encode_status_reply, status, BARRIER_ATTR_AUTODELETE,
    BARRIER_ATTR_MULTISTEP, BARRIER_SETATTR_AUTODELETE, BARRIER_SETATTR_ENABLED,
    BARRIER_SETATTR_MULTISTEP, BARRIER_SETATTR_NODES, BARRIER_SETATTR_TIMEOUT};
use memberd_core::{BarrierOp, ControlMessage, MAX_BARRIER_NAME_LEN};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::connection::{ConnectionId, ConnectionRegistry};
use crate::demux::Demux;
use crate::error::{CmdResult, ServiceError};

/// Lifecycle of one barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Inactive,
    /// A client called wait and is owed a reply.
    Waiting,
    /// Terminal.
    Complete,
}

#[derive(Debug)]
struct BarrierState {
    name: String,
    flags: u32,
    /// 0 means "current member count at completion time".
    expected_nodes: u32,
    got_nodes: u32,
    completed_nodes: u32,
    registered_nodes: u32,
    /// Seconds; 0 disables the timer.
    timeout: u32,
    /// 0 = inactive, 1 = counting WAITs, 2 = counting COMPLETEs.
    phase: u8,
    lifecycle: Lifecycle,
    wait_sent: bool,
    client_complete: bool,
    end_status: i32,
    owner: Option<ConnectionId>,
    /// Completion goes to the core's channel instead of a client.
    internal: bool,
    /// Bumped on every (re)arm so stale timer tasks no-op.
    timer_token: u64,
}

impl BarrierState {
    fn new(name: &str, flags: u32, expected_nodes: u32) -> Self {
        Self {
            name: name.to_string(),
            flags,
            expected_nodes,
            got_nodes: 0,
            completed_nodes: 0,
            registered_nodes: 1,
            timeout: 0,
            phase: 0,
            lifecycle: Lifecycle::Inactive,
            wait_sent: false,
            client_complete: false,
            end_status: 0,
            owner: None,
            internal: false,
            timer_token: 0,
        }
    }

    fn target(&self, current_members: u32) -> u32 {
        if self.expected_nodes != 0 {
            self.expected_nodes
        } else {
            current_members
        }
    }
}

/// The barrier service: registry of named barriers plus their protocol
/// handling.
pub struct BarrierService {
    barriers: DashMap<String, Arc<Mutex<BarrierState>>>,
    demux: Arc<Demux>,
    connections: Arc<ConnectionRegistry>,
    /// Completion channel for internally-waited barriers (the transition
    /// rendezvous).
    internal_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<(String, i32)>>>,
}

impl BarrierService {
    #[must_use]
    pub fn new(demux: Arc<Demux>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            barriers: DashMap::new(),
            demux,
            connections,
            internal_tx: Mutex::new(None),
        }
    }

    /// Installs the channel internal barrier completions are posted to.
    pub fn set_internal_waiter(&self, tx: tokio::sync::mpsc::UnboundedSender<(String, i32)>) {
        *self.internal_tx.lock() = Some(tx);
    }

    fn find(&self, name: &str) -> Option<Arc<Mutex<BarrierState>>> {
        self.barriers.get(name).map(|r| r.value().clone())
    }

    /// Delivers the completion to the owner, exactly once.
    fn deliver_completion(&self, state: &mut BarrierState) {
        state.timer_token += 1; // cancel any armed timer
        if state.client_complete {
            return;
        }
        if state.internal {
            if let Some(tx) = self.internal_tx.lock().as_ref() {
                let _ = tx.send((state.name.clone(), state.end_status));
            }
        } else if let Some(owner) = state.owner {
            let frame = encode_status_reply(cmd::BARRIER, state.end_status).freeze();
            self.connections.notify(&frame, Some(owner));
        }
        state.client_complete = true;
    }

    /// Phase-1 check: all WAITs in means we announce COMPLETE.
    fn check_phase1(&self, name: &str, state: &mut BarrierState, current_members: u32) {
        if state.got_nodes == state.target(current_members) {
            state.phase = 2;
            debug!(barrier = name, "sending COMPLETE");
            let msg = ControlMessage::Barrier {
                op: BarrierOp::Complete,
                name: name.to_string(),
            };
            if self.demux.send_control(&msg, 0).is_err() {
                warn!(barrier = name, "transport closed while completing barrier");
            }
        }
    }

    /// Phase-2 check. Returns true when the record should be autodeleted.
    fn check_phase2(
        &self,
        state: &mut BarrierState,
        current_members: u32,
        forced_status: i32,
    ) -> bool {
        if state.lifecycle != Lifecycle::Complete
            && (forced_status == status::TIMED_OUT
                || state.completed_nodes == state.target(current_members))
        {
            state.end_status = forced_status;
            if state.lifecycle == Lifecycle::Waiting {
                self.deliver_completion(state);
            }
            state.lifecycle = Lifecycle::Complete;
        }
        state.lifecycle == Lifecycle::Complete && state.flags & BARRIER_ATTR_AUTODELETE != 0
    }

    // -- client API -------------------------------------------------------

    /// Registers a barrier (or re-registers an existing one, adopting it).
    pub fn register(
        &self,
        conn: ConnectionId,
        name: &str,
        flags: u32,
        nodes: u32,
    ) -> CmdResult {
        if name.is_empty() || name.len() > MAX_BARRIER_NAME_LEN {
            return Err(ServiceError::InvalidArgument);
        }
        if flags & BARRIER_ATTR_MULTISTEP != 0 {
            return Err(ServiceError::InvalidArgument);
        }

        if let Some(existing) = self.find(name) {
            let mut state = existing.lock();
            if state.expected_nodes != nodes {
                warn!(
                    barrier = name,
                    have = state.expected_nodes,
                    requested = nodes,
                    "barrier registration with conflicting node count"
                );
                return Err(ServiceError::InvalidArgument);
            }
            // May have been registered remotely; adopt the connection.
            state.owner = Some(conn);
            return Ok(0);
        }

        debug!(barrier = name, nodes, flags, "registering barrier");
        let mut state = BarrierState::new(name, flags, nodes);
        state.owner = Some(conn);
        self.barriers
            .insert(name.to_string(), Arc::new(Mutex::new(state)));
        Ok(0)
    }

    /// Registers, arms and waits on a barrier on behalf of the core
    /// itself; completion arrives on the internal channel. Used for the
    /// end-of-transition rendezvous.
    pub fn wait_internal(self: &Arc<Self>, name: &str, expected: u32, timeout_secs: u32) {
        let mut state = BarrierState::new(name, 0, expected);
        state.internal = true;
        state.timeout = timeout_secs;
        state.lifecycle = Lifecycle::Waiting;
        let record = Arc::new(Mutex::new(state));
        self.barriers.insert(name.to_string(), Arc::clone(&record));

        let mut guard = record.lock();
        if self.enable(name, &mut guard, 1).is_err() {
            guard.end_status = status::NOT_CONNECTED;
            self.deliver_completion(&mut guard);
        }
    }

    /// Changes one attribute. Enabling sends the WAIT announcement.
    pub fn setattr(self: &Arc<Self>, name: &str, attr: u32, value: u32) -> CmdResult {
        let Some(record) = self.find(name) else {
            return Err(ServiceError::NoSuchEntity);
        };
        let mut state = record.lock();
        if state.lifecycle == Lifecycle::Complete {
            return Ok(0);
        }

        match attr {
            BARRIER_SETATTR_AUTODELETE => {
                if value != 0 {
                    state.flags |= BARRIER_ATTR_AUTODELETE;
                } else {
                    state.flags &= !BARRIER_ATTR_AUTODELETE;
                }
                Ok(0)
            }
            BARRIER_SETATTR_TIMEOUT => {
                // Only an inactive barrier can change its timeout.
                if state.lifecycle == Lifecycle::Waiting || state.wait_sent {
                    return Err(ServiceError::InvalidArgument);
                }
                state.timeout = value;
                Ok(0)
            }
            BARRIER_SETATTR_MULTISTEP => Err(ServiceError::InvalidArgument),
            BARRIER_SETATTR_NODES => {
                if state.lifecycle == Lifecycle::Waiting || state.wait_sent {
                    return Err(ServiceError::InvalidArgument);
                }
                state.expected_nodes = value;
                Ok(0)
            }
            BARRIER_SETATTR_ENABLED => self.enable(name, &mut state, value),
            _ => Err(ServiceError::InvalidArgument),
        }
    }

    fn enable(self: &Arc<Self>, name: &str, state: &mut BarrierState, value: u32) -> CmdResult {
        // A barrier cannot be disabled again.
        if value == 0 {
            return Err(ServiceError::InvalidArgument);
        }
        if !state.wait_sent {
            state.wait_sent = true;
            state.phase = 1;

            if state.timeout != 0 {
                state.timer_token += 1;
                self.arm_timeout(name.to_string(), state.timeout, state.timer_token);
            }

            debug!(barrier = name, "sending WAIT");
            let msg = ControlMessage::Barrier {
                op: BarrierOp::Wait,
                name: name.to_string(),
            };
            if self.demux.send_control(&msg, 0).is_err() {
                return Err(ServiceError::NotConnected);
            }
            // Our own WAIT comes back through the ordered stream and is
            // counted there, like everyone else's.
        }
        Ok(0)
    }

    /// Begins waiting. The reply is delivered when the barrier completes,
    /// so the immediate result is `WouldBlock`.
    pub fn wait(self: &Arc<Self>, conn: ConnectionId, name: &str) -> CmdResult {
        // Waiting implies enabling.
        let _ = self.setattr(name, BARRIER_SETATTR_ENABLED, 1)?;

        let Some(record) = self.find(name) else {
            return Err(ServiceError::NoSuchEntity);
        };
        let mut state = record.lock();
        state.owner = Some(conn);
        if state.lifecycle == Lifecycle::Complete {
            self.deliver_completion(&mut state);
        } else {
            state.lifecycle = Lifecycle::Waiting;
        }
        Err(ServiceError::WouldBlock)
    }

    /// Deletes a barrier by name.
    pub fn delete(&self, name: &str) -> CmdResult {
        match self.barriers.remove(name) {
            Some(_) => Ok(0),
            None => Err(ServiceError::NoSuchEntity),
        }
    }

    // -- cluster protocol -------------------------------------------------

    /// Handles a BARRIER control message delivered from the cluster.
    ///
    /// `is_participant` is false only before we are a member and outside a
    /// transition; joining nodes must see barrier traffic before their
    /// membership flag flips.
    pub fn process_message(
        &self,
        op: BarrierOp,
        name: &str,
        current_members: u32,
        is_participant: bool,
    ) {
        if !is_participant {
            return;
        }
        let Some(record) = self.find(name) else {
            return;
        };

        let autodelete = {
            let mut state = record.lock();
            debug!(barrier = name, ?op, got = state.got_nodes, "barrier message");
            match op {
                BarrierOp::Wait => {
                    if state.phase == 0 {
                        state.phase = 1;
                    }
                    if state.phase == 1 {
                        state.got_nodes += 1;
                        self.check_phase1(name, &mut state, current_members);
                    } else {
                        warn!(barrier = name, phase = state.phase, "WAIT outside phase 1");
                    }
                    false
                }
                BarrierOp::Complete => {
                    state.completed_nodes += 1;
                    // The first node with all WAITs announces COMPLETE; its
                    // announcement forces everyone else through phase 1.
                    if state.phase == 1 {
                        state.got_nodes = state.target(current_members);
                        self.check_phase1(name, &mut state, current_members);
                    }
                    if state.phase == 2 {
                        self.check_phase2(&mut state, current_members, status::OK)
                    } else {
                        false
                    }
                }
            }
        };

        if autodelete {
            self.barriers.remove(name);
        }
    }

    /// Membership shrank: re-examine every outstanding barrier.
    ///
    /// Dynamic-membership barriers (expected 0) complete successfully once
    /// the registered count matches the new membership; fixed-count
    /// barriers fail, with the same status everywhere.
    pub fn on_membership_change(&self, current_members: u32) {
        for entry in &self.barriers {
            let mut state = entry.value().lock();
            if !state.wait_sent {
                continue;
            }
            let wake_status = if state.expected_nodes == 0 {
                if state.registered_nodes == current_members {
                    Some(status::OK)
                } else {
                    None
                }
            } else {
                Some(status::NO_SUCH_PROCESS)
            };

            if let Some(result) = wake_status {
                if state.lifecycle == Lifecycle::Waiting {
                    state.end_status = result;
                    self.deliver_completion(&mut state);
                }
            }
        }
    }

    /// Releases barriers owned by a departing connection.
    pub fn remove_connection(&self, conn: ConnectionId) {
        let mut orphaned = Vec::new();
        for entry in &self.barriers {
            let mut state = entry.value().lock();
            if state.owner == Some(conn) {
                state.owner = None;
                if !state.wait_sent {
                    orphaned.push(entry.key().clone());
                }
            }
        }
        for name in orphaned {
            self.barriers.remove(&name);
        }
    }

    /// Number of registered barriers (diagnostics).
    #[must_use]
    pub fn count(&self) -> usize {
        self.barriers.len()
    }

    // -- timers -----------------------------------------------------------

    fn arm_timeout(self: &Arc<Self>, name: String, secs: u32, token: u64) {
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(u64::from(secs))).await;
            if let Some(service) = service.upgrade() {
                service.timeout_fired(&name, token);
            }
        });
    }

    fn timeout_fired(&self, name: &str, token: u64) {
        let Some(record) = self.find(name) else {
            return;
        };
        let autodelete = {
            let mut state = record.lock();
            if state.timer_token != token {
                return; // superseded or completed
            }
            debug!(barrier = name, "barrier timed out");
            // Late messages are ignored from here on.
            state.phase = 0;
            self.check_phase2(&mut state, 0, status::TIMED_OUT)
        };
        if autodelete {
            self.barriers.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use memberd_core::client::{ClientHeader, CMDFLAG_REPLY};
    use memberd_core::NodeAddress;

    use super::*;
    use crate::client::connection::{EndpointKind, OutboundMessage};
    use crate::transport::LoopbackHub;

    fn addr(last: u8) -> NodeAddress {
        let mut bytes = vec![2, 0, 10, 0, 0, last];
        bytes.resize(18, 0);
        NodeAddress::new(bytes)
    }

    struct Fixture {
        service: Arc<BarrierService>,
        registry: Arc<ConnectionRegistry>,
        _hub: LoopbackHub,
        transport_rx: tokio::sync::mpsc::UnboundedReceiver<crate::transport::TransportEvent>,
    }

    fn fixture() -> Fixture {
        let hub = LoopbackHub::new();
        let (transport, rx) = hub.join(addr(1));
        let demux = Arc::new(Demux::new(
            Arc::new(transport),
            Arc::new(AtomicU32::new(1)),
        ));
        let registry = Arc::new(ConnectionRegistry::new());
        Fixture {
            service: Arc::new(BarrierService::new(demux, Arc::clone(&registry))),
            registry,
            _hub: hub,
            transport_rx: rx,
        }
    }

    /// Collects barrier ops multicast since the last call.
    fn sent_ops(fx: &mut Fixture) -> Vec<BarrierOp> {
        let mut ops = Vec::new();
        while let Ok(event) = fx.transport_rx.try_recv() {
            if let crate::transport::TransportEvent::Deliver { mut payload, .. } = event {
                let header =
                    memberd_core::MessageHeader::decode(&mut payload, false).unwrap();
                if header.target_port == 0 {
                    if let Ok(ControlMessage::Barrier { op, .. }) =
                        ControlMessage::decode(&mut payload, false)
                    {
                        ops.push(op);
                    }
                }
            }
        }
        ops
    }

    fn reply_status(rx: &mut tokio::sync::mpsc::Receiver<OutboundMessage>) -> Option<i32> {
        match rx.try_recv().ok()? {
            OutboundMessage::Frame(mut frame) => {
                let header = ClientHeader::decode(&mut frame).unwrap();
                assert_eq!(header.command, cmd::BARRIER | CMDFLAG_REPLY);
                Some(i32::from_le_bytes(frame[..4].try_into().unwrap()))
            }
            OutboundMessage::Close => None,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_with_same_count() {
        let fx = fixture();
        let (conn, _rx) = fx.registry.register(EndpointKind::Client, 8);

        assert_eq!(fx.service.register(conn.id, "sync1", 0, 3), Ok(0));
        assert_eq!(fx.service.register(conn.id, "sync1", 0, 3), Ok(0));
        assert_eq!(
            fx.service.register(conn.id, "sync1", 0, 2),
            Err(ServiceError::InvalidArgument)
        );
    }

    #[tokio::test]
    async fn register_rejects_bad_names_and_multistep() {
        let fx = fixture();
        let (conn, _rx) = fx.registry.register(EndpointKind::Client, 8);

        let long = "x".repeat(MAX_BARRIER_NAME_LEN + 1);
        assert_eq!(
            fx.service.register(conn.id, &long, 0, 3),
            Err(ServiceError::InvalidArgument)
        );
        assert_eq!(
            fx.service.register(conn.id, "m", BARRIER_ATTR_MULTISTEP, 3),
            Err(ServiceError::InvalidArgument)
        );
    }

    #[tokio::test]
    async fn wait_returns_wouldblock_and_sends_wait_once() {
        let mut fx = fixture();
        let (conn, _rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 3).unwrap();

        assert_eq!(
            fx.service.wait(conn.id, "sync1"),
            Err(ServiceError::WouldBlock)
        );
        // A second wait does not resend WAIT.
        assert_eq!(
            fx.service.wait(conn.id, "sync1"),
            Err(ServiceError::WouldBlock)
        );
        assert_eq!(sent_ops(&mut fx), vec![BarrierOp::Wait]);
    }

    #[tokio::test]
    async fn three_waits_complete_the_barrier() {
        let mut fx = fixture();
        let (conn, mut conn_rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 3).unwrap();
        let _ = fx.service.wait(conn.id, "sync1");

        // WAITs arrive in total order: ours and two peers'.
        fx.service.process_message(BarrierOp::Wait, "sync1", 3, true);
        fx.service.process_message(BarrierOp::Wait, "sync1", 3, true);
        assert!(reply_status(&mut conn_rx).is_none());
        fx.service.process_message(BarrierOp::Wait, "sync1", 3, true);

        // Third WAIT triggered our COMPLETE.
        let ops = sent_ops(&mut fx);
        assert!(ops.contains(&BarrierOp::Complete));

        // All three COMPLETEs arrive; the client unblocks with status 0.
        fx.service
            .process_message(BarrierOp::Complete, "sync1", 3, true);
        fx.service
            .process_message(BarrierOp::Complete, "sync1", 3, true);
        fx.service
            .process_message(BarrierOp::Complete, "sync1", 3, true);
        assert_eq!(reply_status(&mut conn_rx), Some(status::OK));
    }

    #[tokio::test]
    async fn completes_exactly_once() {
        let mut fx = fixture();
        let (conn, mut conn_rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 2).unwrap();
        let _ = fx.service.wait(conn.id, "sync1");

        for _ in 0..2 {
            fx.service.process_message(BarrierOp::Wait, "sync1", 2, true);
        }
        let completes = sent_ops(&mut fx)
            .into_iter()
            .filter(|op| *op == BarrierOp::Complete)
            .count();
        assert_eq!(completes, 1);

        for _ in 0..2 {
            fx.service
                .process_message(BarrierOp::Complete, "sync1", 2, true);
        }
        assert_eq!(reply_status(&mut conn_rx), Some(status::OK));
        // No duplicate reply.
        assert!(reply_status(&mut conn_rx).is_none());
    }

    #[tokio::test]
    async fn foreign_complete_forces_phase_one_through() {
        // A peer saw all WAITs before we did; its COMPLETE must drag us
        // into phase 2 so the cluster converges.
        let mut fx = fixture();
        let (conn, mut conn_rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 2).unwrap();
        let _ = fx.service.wait(conn.id, "sync1");

        fx.service
            .process_message(BarrierOp::Complete, "sync1", 2, true);
        assert!(sent_ops(&mut fx).contains(&BarrierOp::Complete));

        fx.service
            .process_message(BarrierOp::Complete, "sync1", 2, true);
        assert_eq!(reply_status(&mut conn_rx), Some(status::OK));
    }

    #[tokio::test]
    async fn autodelete_frees_the_record() {
        let fx = fixture();
        let (conn, _rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service
            .register(conn.id, "sync1", BARRIER_ATTR_AUTODELETE, 1)
            .unwrap();
        let _ = fx.service.wait(conn.id, "sync1");

        fx.service.process_message(BarrierOp::Wait, "sync1", 1, true);
        fx.service
            .process_message(BarrierOp::Complete, "sync1", 1, true);
        assert_eq!(fx.service.count(), 0);
    }

    #[tokio::test]
    async fn messages_ignored_when_not_participating() {
        let fx = fixture();
        let (conn, _rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 1).unwrap();
        let _ = fx.service.wait(conn.id, "sync1");

        fx.service.process_message(BarrierOp::Wait, "sync1", 1, false);
        assert_eq!(fx.service.count(), 1);
        // Nothing counted.
        let record = fx.service.find("sync1").unwrap();
        assert_eq!(record.lock().got_nodes, 0);
    }

    #[tokio::test]
    async fn membership_drop_fails_fixed_count_barrier() {
        let fx = fixture();
        let (conn, mut conn_rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 3).unwrap();
        let _ = fx.service.wait(conn.id, "sync1");

        fx.service.on_membership_change(2);
        assert_eq!(reply_status(&mut conn_rx), Some(status::NO_SUCH_PROCESS));
    }

    #[tokio::test]
    async fn membership_drop_completes_dynamic_barrier_at_parity() {
        let fx = fixture();
        let (conn, mut conn_rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "everyone", 0, 0).unwrap();
        let _ = fx.service.wait(conn.id, "everyone");

        // registered_nodes == 1: a shrink to one member completes it.
        fx.service.on_membership_change(1);
        assert_eq!(reply_status(&mut conn_rx), Some(status::OK));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_delivers_timed_out_status() {
        let mut fx = fixture();
        let (conn, mut conn_rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 3).unwrap();
        fx.service
            .setattr("sync1", BARRIER_SETATTR_TIMEOUT, 10)
            .unwrap();
        let _ = fx.service.wait(conn.id, "sync1");
        let _ = sent_ops(&mut fx);

        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(reply_status(&mut conn_rx), Some(status::TIMED_OUT));
    }

    #[tokio::test]
    async fn attribute_rules() {
        let fx = fixture();
        let (conn, _rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 3).unwrap();

        // Inactive: timeout and node count may change.
        assert_eq!(fx.service.setattr("sync1", BARRIER_SETATTR_TIMEOUT, 5), Ok(0));
        assert_eq!(fx.service.setattr("sync1", BARRIER_SETATTR_NODES, 4), Ok(0));
        // Multistep and disabling are refused.
        assert_eq!(
            fx.service.setattr("sync1", BARRIER_SETATTR_MULTISTEP, 1),
            Err(ServiceError::InvalidArgument)
        );
        assert_eq!(
            fx.service.setattr("sync1", BARRIER_SETATTR_ENABLED, 0),
            Err(ServiceError::InvalidArgument)
        );

        // Once waiting, timeout/nodes are frozen.
        let _ = fx.service.wait(conn.id, "sync1");
        assert_eq!(
            fx.service.setattr("sync1", BARRIER_SETATTR_TIMEOUT, 5),
            Err(ServiceError::InvalidArgument)
        );
        assert_eq!(
            fx.service.setattr("sync1", BARRIER_SETATTR_NODES, 2),
            Err(ServiceError::InvalidArgument)
        );

        // Unknown barrier.
        assert_eq!(
            fx.service.setattr("ghost", BARRIER_SETATTR_TIMEOUT, 5),
            Err(ServiceError::NoSuchEntity)
        );
    }

    #[tokio::test]
    async fn disconnect_releases_unwaited_barriers() {
        let fx = fixture();
        let (conn, _rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "idle", 0, 3).unwrap();
        fx.service.register(conn.id, "armed", 0, 3).unwrap();
        let _ = fx.service.wait(conn.id, "armed");

        fx.service.remove_connection(conn.id);
        // The armed barrier survives (other nodes reference it); the idle
        // one is gone.
        assert_eq!(fx.service.count(), 1);
        assert!(fx.service.find("armed").is_some());
    }

    #[tokio::test]
    async fn delete_removes_barrier() {
        let fx = fixture();
        let (conn, _rx) = fx.registry.register(EndpointKind::Client, 8);
        fx.service.register(conn.id, "sync1", 0, 3).unwrap();

        assert_eq!(fx.service.delete("sync1"), Ok(0));
        assert_eq!(fx.service.delete("sync1"), Err(ServiceError::NoSuchEntity));
    }
}
