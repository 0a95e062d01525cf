//! The cluster core runtime.
//!
//! One main task owns the transport events, client command dispatch and all
//! state-machine transitions; handlers run to completion without blocking.
//! Around it: a hello task (periodic HELLO plus missed-HELLO death scan,
//! reporting dead nodes through a lock-protected list and a wake signal),
//! single-shot timers that post typed events back to the main loop, and the
//! per-connection writer tasks owned by the listener.
//!
//! The mutable cluster state lives in this explicit value instead of
//! process-wide globals; the only pieces shared with other tasks sit behind
//! the mutexes listed in the module docs of their owners (node registry,
//! barrier list, dead-node list).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use memberd_core::client::{cmd, encode_confchg, encode_data, encode_event, CMDFLAG_REPLY};
use memberd_core::proto::{Hello, MembershipMessage, TransitionReason};
use memberd_core::quorum::calculate_quorum;
use memberd_core::{
    ControlMessage, EventKind, KillReason, LeaveReason, NodeAddress, NodeState,
    FLAG_BCAST_SELF, HELLO_FLAG_QUORATE, HIGH_PROTECTED_PORT,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::barrier::BarrierService;
use crate::client::codec::ClientFrame;
use crate::client::connection::{ConnectionId, ConnectionRegistry};
use crate::config::{JoinConfig, ADDRESS_LEN};
use crate::demux::{Demux, Inbound, PortTable};
use crate::error::ServiceError;
use crate::failure::DeadlineDetector;
use crate::fsm::{FsmState, MasterPhase, PendingBarrier};
use crate::shutdown::ShutdownController;
use crate::transport::{ConfChange, GroupTransport, TransportEvent};

// ---------------------------------------------------------------------------
// Shared view
// ---------------------------------------------------------------------------

/// Lock-free snapshot of the cluster state for the hello task and the
/// client query path.
#[derive(Debug)]
pub struct SharedView {
    /// Our assigned node id; 0 before the cluster assigns one.
    pub node_id: Arc<AtomicU32>,
    pub generation: AtomicU32,
    pub incarnation: AtomicU64,
    pub members: AtomicU32,
    pub quorate: AtomicBool,
    /// we-are-a-cluster-member: set once the join completes.
    pub is_member: AtomicBool,
    pub in_transition: AtomicBool,
    /// Transport joined and running.
    pub active: AtomicBool,
}

impl SharedView {
    fn new() -> Self {
        Self {
            node_id: Arc::new(AtomicU32::new(0)),
            generation: AtomicU32::new(1),
            incarnation: AtomicU64::new(0),
            members: AtomicU32::new(0),
            quorate: AtomicBool::new(false),
            is_member: AtomicBool::new(false),
            in_transition: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Single-shot timers the state machine arms; each fire is a typed event
/// consumed by the next main-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// End of the startup listen window, or a JOINWAIT give-up deadline.
    JoinWait,
    /// Resend NEWCLUSTER while claiming a cluster.
    NewClusterResend,
    /// End of the NEWCLUSTER window: form the cluster alone.
    NewClusterEnd,
    /// JOINREQ/JOINCONF answer deadline while joining, and the leave-echo
    /// fallback during shutdown.
    Join,
    /// The shared transition deadline (STARTACK/VIEWACK/JOINCONF waits).
    Transition,
    /// Deadline for shutdown-reply votes.
    Shutdown,
}

impl TimerKind {
    fn index(self) -> usize {
        match self {
            TimerKind::JoinWait => 0,
            TimerKind::NewClusterResend => 1,
            TimerKind::NewClusterEnd => 2,
            TimerKind::Join => 3,
            TimerKind::Transition => 4,
            TimerKind::Shutdown => 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerEvent {
    kind: TimerKind,
    token: u64,
}

/// Arms and cancels the typed single-shot timers. A fired event whose token
/// no longer matches was superseded and is dropped.
pub(crate) struct TimerService {
    tx: mpsc::UnboundedSender<TimerEvent>,
    seq: u64,
    current: [u64; 6],
}

impl TimerService {
    fn new(tx: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            tx,
            seq: 0,
            current: [0; 6],
        }
    }

    pub(crate) fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.seq += 1;
        let token = self.seq;
        self.current[kind.index()] = token;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(TimerEvent { kind, token });
        });
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        self.seq += 1;
        self.current[kind.index()] = self.seq;
    }

    fn is_current(&self, event: TimerEvent) -> bool {
        self.current[event.kind.index()] == event.token
    }
}

// ---------------------------------------------------------------------------
// Inter-task plumbing
// ---------------------------------------------------------------------------

/// What the hello task found dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeadNotice {
    Node(u32),
    QuorumDevice,
}

/// Input from the client listener tasks.
#[derive(Debug)]
pub enum ClientInput {
    Frame(ConnectionId, ClientFrame),
    Closed(ConnectionId),
}

/// An outbound data message parked until the cluster is quorate.
pub(crate) struct PendingSend {
    pub payload: Vec<u8>,
    pub source_port: u8,
    pub target_port: u8,
    pub target_node: u32,
    pub flags: u32,
}

/// Cap on parked messages; beyond this senders get EBUSY.
const PENDING_SEND_LIMIT: usize = 128;

// ---------------------------------------------------------------------------
// ClusterCore
// ---------------------------------------------------------------------------

/// The membership daemon's brain: owns every piece of cluster state and
/// runs the single-threaded main loop.
pub struct ClusterCore {
    pub(crate) cfg: JoinConfig,
    pub(crate) shared: Arc<SharedView>,
    pub(crate) registry: Arc<Mutex<crate::registry::NodeRegistry>>,
    pub(crate) demux: Arc<Demux>,
    pub(crate) barriers: Arc<BarrierService>,
    pub(crate) ports: Arc<PortTable>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) shutdown: Arc<ShutdownController>,
    pub(crate) detector: Arc<DeadlineDetector>,
    pub(crate) transport: Arc<dyn GroupTransport>,
    pub(crate) timers: TimerService,

    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    barrier_rx: mpsc::UnboundedReceiver<(String, i32)>,
    input_rx: mpsc::Receiver<ClientInput>,
    input_tx: mpsc::Sender<ClientInput>,
    dead_list: Arc<Mutex<Vec<DeadNotice>>>,
    dead_notify: Arc<Notify>,

    // Transition state machine (main task only).
    pub(crate) state: FsmState,
    pub(crate) master_phase: MasterPhase,
    pub(crate) master_node: Option<u32>,
    pub(crate) joining_node: Option<u32>,
    pub(crate) joining_addr: Option<NodeAddress>,
    pub(crate) generation: u32,
    pub(crate) config_version: u32,
    pub(crate) transition_reason: TransitionReason,
    pub(crate) leave_recalc: bool,
    pub(crate) responses_collected: u32,
    pub(crate) responses_expected: u32,
    pub(crate) agreeing: u32,
    pub(crate) dissenting: u32,
    pub(crate) opinions: HashMap<u32, bool>,
    pub(crate) joinconf_count: u32,
    pub(crate) restarts: u32,
    pub(crate) pending_barrier: Option<PendingBarrier>,
    pub(crate) last_joinreq: Option<(Instant, String)>,
    pub(crate) transition_end: Instant,
    pub(crate) quorum: u32,
    pub(crate) pending_sends: Vec<PendingSend>,
    /// LEAVE sent, waiting for its echo to come back ordered.
    pub(crate) leaving: bool,
    /// Announce TRANSITION once this node reaches MEMBER.
    pub(crate) announce_on_member: bool,
    pub(crate) quit: bool,
}

impl ClusterCore {
    /// Builds a core around a joined transport and its event stream.
    #[must_use]
    pub fn new(
        cfg: JoinConfig,
        transport: Arc<dyn GroupTransport>,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let shared = Arc::new(SharedView::new());
        let demux = Arc::new(Demux::new(
            Arc::clone(&transport),
            Arc::clone(&shared.node_id),
        ));
        let connections = Arc::new(ConnectionRegistry::new());
        let barriers = Arc::new(BarrierService::new(
            Arc::clone(&demux),
            Arc::clone(&connections),
        ));

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (barrier_tx, barrier_rx) = mpsc::unbounded_channel();
        barriers.set_internal_waiter(barrier_tx);
        let (input_tx, input_rx) = mpsc::channel(64);

        Self {
            detector: Arc::new(DeadlineDetector::new(Duration::from_secs(
                cfg.timeouts.deadnode_timeout,
            ))),
            registry: Arc::new(Mutex::new(crate::registry::NodeRegistry::new())),
            shutdown: Arc::new(ShutdownController::new()),
            ports: Arc::new(PortTable::new()),
            timers: TimerService::new(timer_tx),
            shared,
            demux,
            barriers,
            connections,
            transport,
            transport_rx,
            timer_rx,
            barrier_rx,
            input_rx,
            input_tx,
            dead_list: Arc::new(Mutex::new(Vec::new())),
            dead_notify: Arc::new(Notify::new()),
            state: FsmState::Left,
            master_phase: MasterPhase::Start,
            master_node: None,
            joining_node: None,
            joining_addr: None,
            generation: 1,
            config_version: cfg.config_version,
            transition_reason: TransitionReason::Check,
            leave_recalc: false,
            responses_collected: 0,
            responses_expected: 0,
            agreeing: 0,
            dissenting: 0,
            opinions: HashMap::new(),
            joinconf_count: 0,
            restarts: 0,
            pending_barrier: None,
            last_joinreq: None,
            transition_end: Instant::now(),
            quorum: 0,
            pending_sends: Vec::new(),
            leaving: false,
            announce_on_member: false,
            quit: false,
            cfg,
        }
    }

    /// Sender side of the client-input channel, for the listener.
    #[must_use]
    pub fn client_input_sender(&self) -> mpsc::Sender<ClientInput> {
        self.input_tx.clone()
    }

    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.connections)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn shared_view(&self) -> Arc<SharedView> {
        Arc::clone(&self.shared)
    }

    // -- startup ----------------------------------------------------------

    /// Primes the registry from configuration and begins the join
    /// procedure.
    fn startup(&mut self) {
        {
            let mut registry = self.registry.lock();

            for spec in &self.cfg.nodes {
                let addr = spec
                    .address
                    .as_deref()
                    .and_then(|text| crate::config::encode_address(text).ok());
                registry.add_or_update(
                    &spec.name,
                    spec.node_id,
                    spec.votes.min(255) as u8,
                    self.cfg.expected_votes,
                    NodeState::Dead,
                    addr,
                );
            }

            // Adopt (or create) our own entry.
            if let Some(key) = registry.find_by_name(&self.cfg.nodename).map(|n| n.node_id) {
                let interfaces = self.cfg.interfaces.clone();
                let node = registry.get_mut(key).expect("entry just found");
                node.is_us = true;
                node.state = NodeState::Joining;
                node.votes = self.cfg.votes;
                node.expected_votes = self.cfg.expected_votes;
                node.ports.set(0);
                for addr in interfaces {
                    node.add_address(addr);
                }
            } else {
                registry.prime_local(
                    &self.cfg.nodename,
                    self.cfg.node_id,
                    self.cfg.votes,
                    self.cfg.expected_votes,
                    self.cfg.interfaces.clone(),
                    NodeState::Joining,
                );
            }
            self.shared
                .node_id
                .store(registry.us().node_id, Ordering::Release);
        }

        self.shared.active.store(true, Ordering::Release);
        info!(
            cluster = %self.cfg.cluster_name,
            node = %self.cfg.nodename,
            "waiting to join or form a cluster"
        );
        self.begin_join();
        self.spawn_hello_task();
    }

    /// The main loop. Returns when the node has left the cluster.
    pub async fn run(mut self) {
        self.startup();
        let mut shutdown_rx = self.shutdown.shutdown_receiver();

        while !self.quit {
            tokio::select! {
                Some(event) = self.transport_rx.recv() => self.on_transport_event(event),
                Some(timer) = self.timer_rx.recv() => {
                    if self.timers.is_current(timer) {
                        self.on_timer(timer.kind);
                    }
                }
                Some((name, status)) = self.barrier_rx.recv() => {
                    self.on_transition_barrier(&name, status);
                }
                Some(input) = self.input_rx.recv() => self.on_client_input(input),
                _ = self.dead_notify.notified() => self.process_dead_notices(),
                _ = shutdown_rx.changed() => self.begin_leave(),
            }

            // Nodes may have died while a handler held the lists.
            self.process_dead_notices();
        }

        self.teardown();
    }

    fn teardown(&mut self) {
        info!("membership core closing down");
        self.shared.active.store(false, Ordering::Release);
        self.shared.is_member.store(false, Ordering::Release);
        self.transport.leave();
        for handle in self.connections.drain_all() {
            handle.request_close();
        }
    }

    // -- event dispatch ---------------------------------------------------

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Deliver {
                source,
                payload,
                endian_swap,
            } => self.on_deliver(source, payload, endian_swap),
            TransportEvent::ConfChange(change) => self.on_conf_change(change),
        }
    }

    fn on_deliver(&mut self, source: NodeAddress, payload: Bytes, swap: bool) {
        let Some(classified) = self.demux.classify(payload, swap) else {
            warn!("dropping undecodable cluster message");
            return;
        };

        match classified {
            Inbound::NotForUs => {}
            Inbound::Control { header, mut body } => {
                match ControlMessage::decode(&mut body, swap) {
                    Ok(msg) => self.handle_control(header.source_node, &source, msg),
                    Err(e) => warn!(error = %e, "dropping bad control message"),
                }
            }
            Inbound::Membership { header, mut body } => {
                match MembershipMessage::decode(&mut body, swap) {
                    Ok(msg) => {
                        let sender = self
                            .registry
                            .lock()
                            .resolve_sender(header.source_node, &source);
                        self.handle_membership(sender, &source, msg);
                    }
                    Err(e) => warn!(error = %e, "dropping bad membership message"),
                }
            }
            Inbound::Application { header, body } => {
                // Broadcast copies of our own sends only loop back when
                // explicitly asked for.
                let us = self.demux.local_node_id();
                if header.source_node == us
                    && header.is_broadcast()
                    && header.flags & FLAG_BCAST_SELF == 0
                {
                    return;
                }
                if let Some(conn_id) = self.ports.lookup(header.target_port) {
                    let frame = encode_data(
                        cmd::DATA | CMDFLAG_REPLY,
                        header.source_node as i32,
                        u32::from(header.source_port),
                        &body,
                    )
                    .freeze();
                    self.connections.notify(&frame, Some(conn_id));
                }
            }
        }
    }

    // -- control protocol (port 0) ---------------------------------------

    fn handle_control(&mut self, source_node: u32, source: &NodeAddress, msg: ControlMessage) {
        match msg {
            ControlMessage::Ack => {}
            ControlMessage::PortOpened { port } => {
                self.registry.lock().set_port(source_node, port, true);
                self.post_port_event(EventKind::PortOpened, port, source_node);
            }
            ControlMessage::PortClosed { port } => {
                self.registry.lock().set_port(source_node, port, false);
                self.post_port_event(EventKind::PortClosed, port, source_node);
            }
            ControlMessage::PortEnq => {
                let bitmap = *self.registry.lock().us().ports.as_bytes();
                // Broadcast: other new nodes may be just as curious.
                let reply = ControlMessage::PortStatus { bitmap };
                if self.demux.send_control(&reply, 0).is_err() {
                    warn!("transport closed while answering PORTENQ");
                }
            }
            ControlMessage::PortStatus { bitmap } => {
                let us = self.demux.local_node_id();
                if source_node != us {
                    let mut registry = self.registry.lock();
                    if let Some(node) = registry.get_mut(source_node) {
                        node.ports.load(&bitmap);
                    }
                }
            }
            ControlMessage::Barrier { op, name } => {
                let members = self.registry.lock().member_count() as u32;
                let participant = self.shared.is_member.load(Ordering::Acquire)
                    || self.state.in_transition();
                self.barriers
                    .process_message(op, &name, members, participant);
            }
            ControlMessage::Transition(announce) => {
                self.handle_transition_announce(source_node, source, &announce);
            }
            ControlMessage::KillNode {
                reason,
                target_node,
            } => {
                // Compared against our assigned id.
                let us = self.demux.local_node_id();
                if target_node == us && us != 0 {
                    error!(
                        from = source_node,
                        reason,
                        "killed by cluster request, terminating"
                    );
                    self.state = FsmState::Left;
                    self.quit = true;
                    self.shutdown.force();
                } else if let Some(kill) = KillReason::from_wire(reason) {
                    debug!(target = target_node, ?kill, "observed KILLNODE");
                }
            }
            ControlMessage::Leave { reason } => self.handle_leave_msg(source_node, reason),
            ControlMessage::Reconfigure {
                param,
                node_id,
                value,
            } => self.handle_reconfigure(param, node_id, value),
        }
    }

    fn handle_leave_msg(&mut self, source_node: u32, raw_reason: u16) {
        let us = self.demux.local_node_id();
        if source_node == us && us != 0 {
            // Our own LEAVE came back: the cluster has seen it, quit now.
            info!("leave acknowledged by the cluster");
            self.state = FsmState::Left;
            self.quit = true;
            return;
        }

        let reason = LeaveReason::from_wire(raw_reason).unwrap_or(LeaveReason::Shutdown);
        let mut registry = self.registry.lock();
        if let Some(node) = registry.get_mut(source_node) {
            debug!(node = %node.name, %reason, "node announced leave");
            node.leave_reason = Some(reason);
            if node.state == NodeState::Member {
                node.state = NodeState::Leaving;
            }
        }
        drop(registry);
        if reason.allows_quorum_decrease() {
            self.leave_recalc = true;
        }
    }

    fn handle_reconfigure(
        &mut self,
        param: memberd_core::ReconfigureParam,
        node_id: u32,
        value: u32,
    ) {
        use memberd_core::ReconfigureParam;
        match param {
            ReconfigureParam::ExpectedVotes => {
                let mut registry = self.registry.lock();
                if let Some(node) = registry.get_mut(node_id) {
                    node.expected_votes = value;
                }
                registry.cap_expected_votes(value);
                drop(registry);
                self.recalculate_quorum(true);
            }
            ReconfigureParam::NodeVotes => {
                if let Some(node) = self.registry.lock().get_mut(node_id) {
                    node.votes = value.min(255) as u8;
                }
                self.recalculate_quorum(true);
            }
            ReconfigureParam::ConfigVersion => {
                info!(version = value, "configuration version updated by cluster");
                self.config_version = value;
                // A fresh node list arrives with the operator's next
                // database push; the version is what peers validate.
            }
        }
    }

    // -- configuration changes from the transport -------------------------

    fn on_conf_change(&mut self, change: ConfChange) {
        debug!(
            ring_seq = change.ring_seq,
            members = change.members.len(),
            left = change.left.len(),
            joined = change.joined.len(),
            "configuration change"
        );
        self.shared
            .incarnation
            .store(change.ring_seq, Ordering::Release);

        let our_addr = self.transport.local_address();
        if !change.contains(&our_addr) {
            if self.state == FsmState::Left || self.leaving {
                self.quit = true;
                return;
            }
            error!("ejected from the transport membership, terminating");
            self.state = FsmState::Left;
            self.quit = true;
            self.shutdown.force();
            return;
        }

        // Stamp incarnations and collect the ids of leavers.
        let mut dead_ids = Vec::new();
        {
            let mut registry = self.registry.lock();
            for addr in &change.left {
                if let Some(node) = registry.find_by_addr(addr) {
                    dead_ids.push(node.node_id);
                }
            }
            for addr in &change.joined {
                if let Some(id) = registry.find_by_addr(addr).map(|n| n.node_id) {
                    if let Some(node) = registry.get_mut(id) {
                        node.incarnation = change.ring_seq;
                    }
                }
            }
            registry.purge_temp_nodes();
        }

        for id in dead_ids {
            self.node_has_died(id, None);
        }

        // A transport-level newcomer cannot ask to join until it hears us;
        // oblige quickly.
        if !change.joined.is_empty()
            && self.state == FsmState::Member
            && !change
                .joined
                .iter()
                .any(|a| a.eq_ignore_family(&our_addr))
        {
            self.send_hello();
        }

        self.refresh_shared();
        self.notify_confchg(&change);
    }

    // -- dead-node plumbing ----------------------------------------------

    fn process_dead_notices(&mut self) {
        let notices: Vec<DeadNotice> = std::mem::take(&mut *self.dead_list.lock());
        for notice in notices {
            match notice {
                DeadNotice::Node(id) => self.node_has_died(id, Some(LeaveReason::Dead)),
                DeadNotice::QuorumDevice => {
                    let mut changed = false;
                    {
                        let mut registry = self.registry.lock();
                        if let Some(device) = registry.quorum_device_mut() {
                            if device.is_member() {
                                info!(device = %device.name, "quorum device timed out");
                                device.state = NodeState::Dead;
                                changed = true;
                            }
                        }
                    }
                    if changed {
                        self.recalculate_quorum(false);
                    }
                }
            }
        }
    }

    // -- quorum -----------------------------------------------------------

    /// Recomputes quorum and quorate, notifying clients on edge changes.
    pub(crate) fn recalculate_quorum(&mut self, allow_decrease: bool) {
        let tally = self.registry.lock().tally();
        let result = calculate_quorum(tally, 0, self.quorum, allow_decrease, self.cfg.two_node);
        self.quorum = result.quorum;
        self.apply_quorate(result.quorate, result.total_votes);
        self.refresh_shared();
        self.notify_event(EventKind::StateChange, 0, None);
    }

    /// Applies a quorate value computed elsewhere (ENDTRANS carries the
    /// master's numbers).
    pub(crate) fn apply_quorate(&mut self, quorate: bool, total_votes: u32) {
        let was = self.shared.quorate.swap(quorate, Ordering::AcqRel);
        if was && !quorate {
            info!(total_votes, quorum = self.quorum, "quorum lost, blocking activity");
        }
        if !was && quorate {
            info!(total_votes, quorum = self.quorum, "quorum regained, resuming activity");
            self.flush_pending_sends();
        }
    }

    /// Pushes the registry-derived counters into the shared snapshot.
    pub(crate) fn refresh_shared(&self) {
        let registry = self.registry.lock();
        self.shared
            .members
            .store(registry.member_count() as u32, Ordering::Release);
        self.shared
            .generation
            .store(self.generation, Ordering::Release);
        self.shared
            .in_transition
            .store(self.state.in_transition(), Ordering::Release);
    }

    // -- outbound user data ----------------------------------------------

    /// Sends (or parks) a client data message. Ports above the protected
    /// range wait for quorum.
    pub(crate) fn send_user_data(
        &mut self,
        payload: &[u8],
        source_port: u8,
        target_port: u8,
        target_node: u32,
        flags: u32,
    ) -> Result<(), ServiceError> {
        let gated = target_port > HIGH_PROTECTED_PORT
            && (!self.shared.quorate.load(Ordering::Acquire) || self.state.in_transition());
        if gated {
            if self.pending_sends.len() >= PENDING_SEND_LIMIT {
                return Err(ServiceError::Busy);
            }
            debug!(target_port, "parking data message until quorate");
            self.pending_sends.push(PendingSend {
                payload: payload.to_vec(),
                source_port,
                target_port,
                target_node,
                flags,
            });
            return Ok(());
        }
        self.demux
            .send(payload, source_port, target_port, target_node, flags)
            .map_err(|_| ServiceError::NotConnected)
    }

    fn flush_pending_sends(&mut self) {
        let parked = std::mem::take(&mut self.pending_sends);
        for send in parked {
            if self
                .demux
                .send(
                    &send.payload,
                    send.source_port,
                    send.target_port,
                    send.target_node,
                    send.flags,
                )
                .is_err()
            {
                warn!("transport closed while flushing parked messages");
                break;
            }
        }
    }

    // -- client notifications ---------------------------------------------

    /// Pushes an event message to subscribed clients (or one connection).
    pub(crate) fn notify_event(&self, kind: EventKind, arg: u32, target: Option<ConnectionId>) {
        let frame = encode_event(kind.to_wire(), arg).freeze();
        self.connections.notify(&frame, target);
    }

    /// Port events go to the local connection bound to that port.
    fn post_port_event(&self, kind: EventKind, port: u8, node_id: u32) {
        if let Some(conn) = self.ports.lookup(port) {
            self.notify_event(kind, node_id, Some(conn));
        }
    }

    fn notify_confchg(&self, change: &ConfChange) {
        let registry = self.registry.lock();
        let members = registry.member_ids();
        let left: Vec<u32> = change
            .left
            .iter()
            .filter_map(|a| registry.find_by_addr(a).map(|n| n.node_id))
            .collect();
        let joined: Vec<u32> = change
            .joined
            .iter()
            .filter_map(|a| registry.find_by_addr(a).map(|n| n.node_id))
            .collect();
        drop(registry);

        let frame = encode_confchg(&members, &left, &joined).freeze();
        self.connections.notify_confchg(&frame);
    }

    // -- client input -----------------------------------------------------

    fn on_client_input(&mut self, input: ClientInput) {
        match input {
            ClientInput::Frame(conn_id, frame) => {
                if let Some(conn) = self.connections.get(conn_id) {
                    crate::client::commands::process_frame(self, &conn, &frame);
                }
            }
            ClientInput::Closed(conn_id) => self.connection_closed(conn_id),
        }
    }

    /// Disconnect cleanup: port binding and barrier ownership.
    fn connection_closed(&mut self, conn_id: ConnectionId) {
        if let Some(handle) = self.connections.remove(conn_id) {
            let port = handle.bound_port();
            if port != 0 {
                self.release_port(port);
            }
        }
        self.barriers.remove_connection(conn_id);
    }

    /// Unbinds a local port and tells the cluster.
    pub(crate) fn release_port(&mut self, port: u8) {
        self.ports.unbind(port);
        self.registry.lock().us_mut().ports.clear(port);
        if self
            .demux
            .send_control(&ControlMessage::PortClosed { port }, 0)
            .is_err()
        {
            debug!(port, "transport closed during port release");
        }
    }

    // -- HELLO ------------------------------------------------------------

    /// Sends one HELLO (also used outside the hello task when the state
    /// machine wants to be heard immediately).
    pub(crate) fn send_hello(&self) {
        send_hello_from(&self.demux, &self.shared, self.state == FsmState::Master);
    }

    fn spawn_hello_task(&self) {
        let registry = Arc::clone(&self.registry);
        let detector = Arc::clone(&self.detector);
        let demux = Arc::clone(&self.demux);
        let shared = Arc::clone(&self.shared);
        let dead_list = Arc::clone(&self.dead_list);
        let dead_notify = Arc::clone(&self.dead_notify);
        let mut shutdown_rx = self.shutdown.shutdown_receiver();
        let interval = Duration::from_secs(self.cfg.timeouts.hello_timer);
        let quorumdev_poll = Duration::from_millis(self.cfg.timeouts.quorumdev_poll);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("hello task closing down");
                        return;
                    }
                }
                if !shared.active.load(Ordering::Acquire) {
                    return;
                }
                if !shared.is_member.load(Ordering::Acquire) {
                    continue;
                }

                // Scan for silent nodes, but not mid-transition: HELLOs are
                // suppressed there and everyone would look dead.
                if !shared.in_transition.load(Ordering::Acquire) {
                    let now = Instant::now();
                    let mut found = Vec::new();
                    {
                        let registry = registry.lock();
                        for node in registry.iter() {
                            if !node.is_us
                                && node.is_member()
                                && detector.is_suspect(node.node_id, now)
                            {
                                found.push(DeadNotice::Node(node.node_id));
                            }
                        }
                        if let Some(device) = registry.quorum_device() {
                            if device.is_member() {
                                let stale = device
                                    .last_hello
                                    .is_none_or(|t| now.duration_since(t) > quorumdev_poll);
                                if stale {
                                    found.push(DeadNotice::QuorumDevice);
                                }
                            }
                        }
                    }
                    if !found.is_empty() {
                        dead_list.lock().extend(found);
                        dead_notify.notify_one();
                    }
                }

                send_hello_from(&demux, &shared, false);
            }
        });
    }
}

/// Builds and multicasts one HELLO from the shared snapshot.
fn send_hello_from(demux: &Demux, shared: &SharedView, master: bool) {
    let mut flags = 0;
    if shared.quorate.load(Ordering::Acquire) {
        flags |= HELLO_FLAG_QUORATE;
    }
    if master {
        flags |= memberd_core::HELLO_FLAG_MASTER;
    }
    let hello = MembershipMessage::Hello(Hello {
        members: shared.members.load(Ordering::Acquire) as u16,
        flags,
        generation: shared.generation.load(Ordering::Acquire),
    });
    if demux.send_membership(&hello, 0, ADDRESS_LEN).is_err() {
        debug!("transport closed, HELLO not sent");
    }
}
