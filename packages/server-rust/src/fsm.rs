//! The join/leave/death transition state machine.
//!
//! Every membership change is sequenced by a single master: the lowest-id
//! live member, elected on demand. The master collects STARTACKs, pushes
//! its full view (MASTERVIEW) for agreement, confirms a joiner (JOINCONF)
//! when there is one, and finishes with ENDTRANS carrying the new quorum
//! and generation. All participants then rendezvous on a cluster barrier
//! named after the new generation before resuming normal operation.
//!
//! The local node walks STARTING -> (NEWCLUSTER | JOINING) -> ... -> MEMBER
//! at startup; afterwards it bounces between MEMBER, TRANSITION and MASTER
//! as the cluster changes around it.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use memberd_core::proto::{
    transition_barrier_name, EndTransition, Hello, JoinAckType, JoinRequest, MembershipMessage,
    NodeEntry, StartTransition, TransitionReason, VIEW_FIRST, VIEW_LAST,
};
use memberd_core::quorum::calculate_quorum;
use memberd_core::{
    ControlMessage, EventKind, KillReason, LeaveReason, NodeAddress, NodeRef, NodeState,
    ProtocolVersion, TransitionAnnounce, MAX_NODE_ID, MAX_NODE_NAME_LEN, PROTOCOL_MAJOR,
};
use tracing::{debug, error, info, warn};

use crate::config::ADDRESS_LEN;
use crate::core::{ClusterCore, TimerKind};

/// The local node's protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    /// Listening for an existing cluster.
    Starting,
    /// Claiming a new cluster, tie-breaking against other claimants.
    NewCluster,
    /// JOINREQ sent, waiting for a JOINACK.
    Joining,
    /// Told to wait; listening for the next HELLO.
    JoinWait,
    /// JOINACK(OK) received, waiting for the JOINCONF view.
    JoinAck,
    /// Following a master's transition.
    Transition,
    /// ENDTRANS processed, waiting on the completion barrier.
    TransitionComplete,
    /// Normal operation.
    Member,
    /// Mastering a transition.
    Master,
    /// Join refused; terminal.
    Rejected,
    /// Out of the cluster; terminal.
    Left,
}

impl FsmState {
    /// True while a transition is being coordinated around us.
    #[must_use]
    pub fn in_transition(self) -> bool {
        matches!(
            self,
            FsmState::Transition | FsmState::TransitionComplete | FsmState::Master
        )
    }
}

/// Sub-state while this node is the master of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterPhase {
    /// STARTTRANS sent, collecting STARTACKs.
    Start,
    /// MASTERVIEW sent, collecting VIEWACKs.
    Collect,
    /// JOINCONF sent, waiting for the joiner's CONFACK.
    Confirm,
    /// ENDTRANS sent.
    Complete,
}

/// Context parked while the end-of-transition barrier runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingBarrier {
    /// We mastered the transition; quorum is already applied locally.
    MasterEnd { total_votes: u32 },
    /// We followed; the master's numbers to apply on completion.
    ClientEnd { end: EndTransition },
}

impl ClusterCore {
    fn us_id(&self) -> u32 {
        self.shared.node_id.load(Ordering::Acquire)
    }

    fn timeouts(&self) -> crate::config::RuntimeTimeouts {
        self.cfg.timeouts
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Enters STARTING and opens the listen window for HELLO/NEWCLUSTER.
    pub(crate) fn begin_join(&mut self) {
        self.state = FsmState::Starting;
        self.timers.arm(
            TimerKind::JoinWait,
            Duration::from_secs(self.timeouts().joinwait_timeout),
        );
    }

    /// Forms a cluster of one: nobody answered our NEWCLUSTER claims.
    fn form_cluster(&mut self) {
        info!("forming a new cluster");
        self.state = FsmState::Member;
        self.shared.is_member.store(true, Ordering::Release);

        {
            let mut registry = self.registry.lock();
            let us_key = registry.us().node_id;
            let wanted = if self.cfg.node_id != 0 {
                self.cfg.node_id
            } else {
                1
            };
            if us_key == 0 {
                if let Err(e) = registry.assign_node_id(0, wanted) {
                    drop(registry);
                    error!(error = %e, "cannot take configured node id");
                    self.fatal_leave(LeaveReason::Panic);
                    return;
                }
            }
            registry.us_mut().state = NodeState::Member;
            self.shared
                .node_id
                .store(registry.us().node_id, Ordering::Release);
        }

        self.recalculate_quorum(false);
        self.publish_transition_announce();
        self.send_hello();
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub(crate) fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::JoinWait => match self.state {
                FsmState::Starting => {
                    self.state = FsmState::NewCluster;
                    self.send_newcluster();
                    let t = self.timeouts();
                    self.timers.arm(
                        TimerKind::NewClusterEnd,
                        Duration::from_secs(t.newcluster_timeout),
                    );
                    self.timers.arm(
                        TimerKind::NewClusterResend,
                        Duration::from_secs((t.joinwait_timeout / 5).max(1)),
                    );
                }
                FsmState::JoinWait => {
                    error!("been waiting to join for too long, giving up");
                    self.fatal_leave(LeaveReason::Panic);
                }
                _ => {}
            },
            TimerKind::NewClusterResend => {
                if self.state == FsmState::NewCluster {
                    self.send_newcluster();
                    let t = self.timeouts();
                    self.timers.arm(
                        TimerKind::NewClusterResend,
                        Duration::from_secs((t.joinwait_timeout / 5).max(1)),
                    );
                }
            }
            TimerKind::NewClusterEnd => {
                if self.state == FsmState::NewCluster {
                    self.timers.cancel(TimerKind::NewClusterResend);
                    self.form_cluster();
                }
            }
            TimerKind::Join => match self.state {
                FsmState::Joining => {
                    debug!("no JOINACK, falling back to JOINWAIT");
                    self.enter_joinwait();
                }
                FsmState::JoinAck => {
                    debug!("no JOINCONF, falling back to JOINWAIT");
                    self.enter_joinwait();
                }
                _ => {
                    if self.leaving {
                        // LEAVE echo never came back; quit regardless.
                        self.state = FsmState::Left;
                        self.quit = true;
                    }
                }
            },
            TimerKind::Transition => self.transition_timer_expired(),
            TimerKind::Shutdown => self.resolve_shutdown_poll(true),
        }
    }

    fn enter_joinwait(&mut self) {
        self.state = FsmState::JoinWait;
        self.timers.arm(
            TimerKind::JoinWait,
            Duration::from_secs(self.timeouts().joinwait_timeout),
        );
    }

    /// The shared transition timer fired: something is taking too long.
    fn transition_timer_expired(&mut self) {
        debug!(state = ?self.state, "transition timer expired");

        // A joiner is not answering its JOINCONF.
        if self.state == FsmState::Master && self.master_phase == MasterPhase::Confirm {
            let t = self.timeouts();
            self.timers
                .arm(TimerKind::Transition, Duration::from_secs(t.joinconf_timeout));
            self.joinconf_count += 1;
            if self.joinconf_count < t.max_retries {
                debug!("resending JOINCONF");
                self.send_joinconf();
            } else {
                warn!("JOINCONF unanswered, abandoning the joiner");
                if let Some(id) = self.joining_node {
                    self.registry.lock().mark_dead(id, LeaveReason::NoResponse);
                    self.remove_joiner(true);
                    self.start_transition(TransitionReason::RemNode, id);
                }
            }
            return;
        }

        if !self.state.in_transition() {
            return;
        }

        // Alone: nothing to wait for.
        if self.registry.lock().member_count() <= 1 && self.state == FsmState::Master {
            self.end_transition();
            return;
        }

        if self.state == FsmState::Transition || self.state == FsmState::TransitionComplete {
            let Some(master) = self.master_node else {
                // The master died after sending our JOINCONF; we are
                // mid-join with nobody to finish it.
                error!("master died mid-join, leaving the cluster");
                self.fatal_leave(LeaveReason::Inconsistent);
                return;
            };

            let master_alive = self
                .registry
                .lock()
                .get(master)
                .is_some_and(|n| n.is_member());

            if master_alive {
                // Poke it and keep waiting.
                self.send_hello();
                self.timers.arm(
                    TimerKind::Transition,
                    Duration::from_secs(self.timeouts().transition_timeout),
                );
            } else {
                info!("transition master is dead, electing a new one");
                match self.elect_master(0) {
                    Some((_, true)) => {
                        if let Some(node) = self.registry.lock().get_mut(master) {
                            node.leave_reason = Some(LeaveReason::NoResponse);
                        }
                        self.start_transition(TransitionReason::DeadMaster, master);
                    }
                    Some((new_master, false)) => {
                        self.master_node = Some(new_master);
                        self.timers.arm(
                            TimerKind::Transition,
                            Duration::from_secs(self.timeouts().transition_timeout),
                        );
                    }
                    None => self.fatal_leave(LeaveReason::Inconsistent),
                }
            }
            return;
        }

        if self.state == FsmState::Master {
            self.start_transition(TransitionReason::Restart, self.us_id());
        }
    }

    // ------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------

    pub(crate) fn handle_membership(
        &mut self,
        sender: NodeRef,
        source: &NodeAddress,
        msg: MembershipMessage,
    ) {
        // The transport loops our own multicasts back; the membership
        // protocol never consumes them.
        if source.eq_ignore_family(&self.transport.local_address()) {
            return;
        }

        match msg {
            MembershipMessage::JoinReq(req) => self.do_joinreq(source, &req),
            MembershipMessage::JoinAck { ack } => {
                if self.state == FsmState::Joining || self.state == FsmState::JoinWait {
                    self.do_joinack(ack);
                }
            }
            MembershipMessage::JoinConf { flags, nodes } => {
                if self.state == FsmState::JoinAck {
                    self.do_joinconf(flags, &nodes);
                }
            }
            MembershipMessage::ConfAck => {
                if self.state == FsmState::Master && self.master_phase == MasterPhase::Confirm {
                    self.end_transition();
                }
            }
            MembershipMessage::MasterView { flags, nodes } => {
                if self.state == FsmState::Transition {
                    self.do_masterview(flags, &nodes);
                }
            }
            MembershipMessage::ViewAck { agree } => {
                if self.state == FsmState::Master && self.master_phase == MasterPhase::Collect {
                    self.do_viewack(sender, agree);
                }
            }
            MembershipMessage::StartTrans(st) => self.do_starttrans(sender, st),
            MembershipMessage::StartAck { generation } => {
                if self.state == FsmState::Master && generation == self.generation {
                    self.do_startack();
                }
            }
            MembershipMessage::EndTrans(end) => self.do_endtrans(sender, end),
            MembershipMessage::Hello(hello) => self.do_hello_msg(sender, hello),
            MembershipMessage::NewCluster { tiebreak } => self.do_newcluster(tiebreak),
            MembershipMessage::Nominate(st) => {
                if self.state != FsmState::Master {
                    self.do_nominate(st);
                }
            }
            MembershipMessage::NodeDown { reason, node_id } => {
                self.do_nodedown(node_id, reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // Joining (the joiner's side)
    // ------------------------------------------------------------------

    fn do_hello_msg(&mut self, sender: NodeRef, hello: Hello) {
        match self.state {
            FsmState::Starting | FsmState::JoinWait | FsmState::Joining | FsmState::NewCluster => {
                info!("sending membership request");
                self.timers.cancel(TimerKind::NewClusterResend);
                self.timers.cancel(TimerKind::NewClusterEnd);
                self.send_joinreq();
                self.state = FsmState::Joining;
                self.timers.arm(
                    TimerKind::Join,
                    Duration::from_secs(self.timeouts().join_timeout),
                );
            }
            FsmState::Member => {
                let NodeRef::Real(id) = sender else {
                    return;
                };
                let known_alive = {
                    let registry = self.registry.lock();
                    registry.get(id).is_some_and(|n| n.state != NodeState::Dead)
                };

                if known_alive {
                    // A generation mismatch can be an ENDTRANS crossing on
                    // the wire, so allow a grace period after transitions.
                    let grace = Duration::from_secs(self.timeouts().hello_timer);
                    if hello.generation != self.generation
                        && Instant::now() > self.transition_end + grace
                    {
                        info!(
                            from = id,
                            got = hello.generation,
                            expected = self.generation,
                            "bad generation in HELLO, checking cluster"
                        );
                        self.start_transition(TransitionReason::Check, id);
                        return;
                    }
                    let members = self.registry.lock().member_count() as u16;
                    if hello.members != members {
                        info!(
                            from = id,
                            got = hello.members,
                            expected = members,
                            "member count mismatch in HELLO, checking cluster"
                        );
                        self.start_transition(TransitionReason::Check, id);
                        return;
                    }
                    let now = Instant::now();
                    if let Some(node) = self.registry.lock().get_mut(id) {
                        node.last_hello = Some(now);
                    }
                    self.detector.heartbeat(id, now);
                } else if self.shared.quorate.load(Ordering::Acquire) {
                    // A stranger heartbeating into a valid cluster is a
                    // danger to it.
                    self.send_kill(id, KillReason::Rejected);
                }
            }
            _ => {}
        }
    }

    fn send_joinreq(&mut self) {
        let (addresses, name, votes, expected) = {
            let registry = self.registry.lock();
            let us = registry.us();
            (
                us.addresses.clone(),
                us.name.clone(),
                us.votes,
                us.expected_votes,
            )
        };
        let req = MembershipMessage::JoinReq(JoinRequest {
            votes,
            expected_votes: expected,
            node_id: self.cfg.node_id,
            version: ProtocolVersion::current(self.config_version),
            addr_len: ADDRESS_LEN as u32,
            cluster_name: self.cfg.cluster_name.clone(),
            addresses,
            name,
        });
        if self
            .demux
            .send_membership(&req, 0, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while sending JOINREQ");
        }
    }

    fn do_joinack(&mut self, ack: JoinAckType) {
        match ack {
            JoinAckType::Ok => {
                self.state = FsmState::JoinAck;
                self.timers.arm(
                    TimerKind::Join,
                    Duration::from_secs(self.timeouts().join_timeout),
                );
            }
            JoinAckType::Nak => {
                error!("cluster membership rejected");
                self.state = FsmState::Rejected;
                self.registry.lock().us_mut().leave_reason = Some(LeaveReason::Rejected);
                self.quit = true;
                self.shutdown.force();
            }
            JoinAckType::Wait => {
                debug!("master is busy, waiting");
                self.enter_joinwait();
            }
        }
    }

    fn do_joinconf(&mut self, flags: u8, nodes: &[NodeEntry]) {
        self.registry.lock().apply_view(nodes);

        if flags & VIEW_LAST != 0 {
            {
                let mut registry = self.registry.lock();
                registry.us_mut().state = NodeState::Member;
            }
            self.shared.is_member.store(true, Ordering::Release);
            self.state = FsmState::Transition;
            self.announce_on_member = true;
            self.timers.arm(
                TimerKind::Transition,
                Duration::from_secs(self.timeouts().transition_timeout),
            );
            self.refresh_shared();

            if self
                .demux
                .send_membership(&MembershipMessage::ConfAck, 0, ADDRESS_LEN)
                .is_err()
            {
                warn!("transport closed while acknowledging JOINCONF");
            }
        }
    }

    // ------------------------------------------------------------------
    // Join requests (the member side)
    // ------------------------------------------------------------------

    fn do_joinreq(&mut self, source: &NodeAddress, req: &JoinRequest) {
        if self.state != FsmState::Member {
            if self.state == FsmState::Master || self.state == FsmState::Transition {
                self.send_joinack(JoinAckType::Wait, req.node_id);
            }
            return;
        }

        if let Err(reason) = self.validate_joinreq(req) {
            warn!(joiner = %req.name, reason, "rejecting join request");
            self.send_joinack(JoinAckType::Nak, req.node_id);
            return;
        }

        match self.check_duplicate_node(req, source) {
            DuplicateVerdict::Duplicate => {
                warn!(joiner = %req.name, "rejecting duplicate node");
                self.send_joinack(JoinAckType::Nak, req.node_id);
                return;
            }
            DuplicateVerdict::AlreadyJoining => return,
            DuplicateVerdict::Fresh => {}
        }

        // JOINREQs are unsequenced relative to the joiner's retries; drop
        // repeats arriving within a short window.
        let now = Instant::now();
        if let Some((when, name)) = &self.last_joinreq {
            if *name == req.name && now.duration_since(*when) < Duration::from_secs(10) {
                return;
            }
        }
        self.last_joinreq = Some((now, req.name.clone()));

        let node_id = {
            let mut registry = self.registry.lock();
            let id = if req.node_id != 0 {
                req.node_id
            } else {
                registry.highest_node_id() + 1
            };
            let key = registry.add_or_update(
                &req.name,
                id,
                req.votes,
                req.expected_votes,
                NodeState::Joining,
                req.addresses.first().cloned(),
            );
            if let Some(node) = registry.get_mut(key) {
                for addr in &req.addresses {
                    node.add_address(addr.clone());
                }
                node.state = NodeState::Joining;
            }
            key
        };
        info!(joiner = %req.name, node_id, "accepting join request");

        self.send_joinack(JoinAckType::Ok, req.node_id);
        self.joining_node = Some(node_id);
        self.joining_addr = Some(source.clone());
        self.start_transition(TransitionReason::NewNode, node_id);
    }

    fn validate_joinreq(&mut self, req: &JoinRequest) -> Result<(), &'static str> {
        if req.version.major != PROTOCOL_MAJOR {
            return Err("incompatible protocol version");
        }
        if req.name.is_empty() || req.name.len() > MAX_NODE_NAME_LEN {
            return Err("bad node name");
        }
        if req.cluster_name != self.cfg.cluster_name {
            return Err("wrong cluster name");
        }
        if req.version.config != self.config_version {
            return Err("configuration version mismatch");
        }
        if req.addr_len != ADDRESS_LEN as u32 {
            return Err("address length mismatch");
        }
        if req.node_id > MAX_NODE_ID {
            return Err("node id out of range");
        }
        let registry = self.registry.lock();
        if self.cfg.two_node && registry.member_count() >= 2 {
            return Err("two-node limit reached");
        }
        if req.node_id != 0 {
            if let Some(node) = registry.get(req.node_id) {
                if node.state != NodeState::Dead || node.name != req.name {
                    return Err("node ID already in use");
                }
            }
            if let Some(node) = registry.find_by_name(&req.name) {
                if node.state != NodeState::Dead || node.node_id != req.node_id {
                    return Err("node previously had a different id");
                }
            }
        }
        Ok(())
    }

    fn check_duplicate_node(&self, req: &JoinRequest, source: &NodeAddress) -> DuplicateVerdict {
        let registry = self.registry.lock();
        if let Some(node) = registry.find_by_name(&req.name) {
            if node.state == NodeState::Joining {
                return DuplicateVerdict::AlreadyJoining;
            }
            if node.state != NodeState::Dead {
                return DuplicateVerdict::Duplicate;
            }
        }
        if let Some(node) = registry.find_by_addr(source) {
            if node.state == NodeState::Joining {
                return DuplicateVerdict::AlreadyJoining;
            }
            if node.state != NodeState::Dead && node.name != req.name {
                return DuplicateVerdict::Duplicate;
            }
        }
        DuplicateVerdict::Fresh
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Starts (or restarts) a transition with us as master.
    pub(crate) fn start_transition(&mut self, reason: TransitionReason, node_id: u32) {
        debug!(?reason, subject = node_id, "starting transition");
        let mut reason = reason;
        let mut subject = node_id;

        if reason == TransitionReason::Restart || reason == TransitionReason::NewMaster {
            self.agreeing = 0;
            self.dissenting = 0;
            self.responses_collected = 0;
            self.opinions.clear();

            if self.transition_reason == TransitionReason::NewNode {
                if let Some(joiner) = self.joining_node {
                    subject = joiner;
                }
            }
            if reason == TransitionReason::NewMaster {
                reason = self.transition_reason;
                if reason == TransitionReason::NewNode {
                    match self.joining_node {
                        Some(joiner) => subject = joiner,
                        None => reason = TransitionReason::NewMaster,
                    }
                }
            }
        }

        if reason == TransitionReason::Restart {
            self.restarts += 1;
            if self.restarts > self.timeouts().transition_restarts {
                error!("too many transition restarts, leaving the cluster");
                self.fatal_leave(LeaveReason::Inconsistent);
                return;
            }
        } else {
            self.restarts = 0;
        }

        // Only a "real" event replaces the recorded transition reason.
        if !matches!(
            reason,
            TransitionReason::AnotherRemNode
                | TransitionReason::NewMaster
                | TransitionReason::Restart
                | TransitionReason::DeadMaster
        ) {
            self.transition_reason = reason;
        }
        if reason == TransitionReason::DeadMaster {
            self.transition_reason = TransitionReason::RemNode;
        }
        if reason == TransitionReason::NewNode {
            self.joining_node = Some(subject);
        }

        self.state = FsmState::Master;
        self.master_phase = MasterPhase::Start;
        self.responses_collected = 0;
        self.responses_expected = self.registry.lock().member_count().saturating_sub(1) as u32;
        self.refresh_shared();

        if self.responses_expected == 0 {
            debug!("no peers to collect from");
            self.do_startack();
            return;
        }

        self.generation += 1;
        let msg = self.build_starttrans(reason, subject);
        if self
            .demux
            .send_membership(&MembershipMessage::StartTrans(msg), 0, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while starting transition");
        }
        self.timers.arm(
            TimerKind::Transition,
            Duration::from_secs(self.timeouts().transition_timeout),
        );
    }

    fn build_starttrans(&self, reason: TransitionReason, subject: u32) -> StartTransition {
        let registry = self.registry.lock();
        let node = registry.get(subject);
        let (votes, expected, leave_reason, addresses, name) = match node {
            Some(n) => (
                n.votes,
                n.expected_votes,
                n.leave_reason.map_or(0, LeaveReason::to_wire),
                if reason == TransitionReason::NewNode {
                    n.addresses.clone()
                } else {
                    Vec::new()
                },
                if reason == TransitionReason::NewNode {
                    n.name.clone()
                } else {
                    String::new()
                },
            ),
            None => (1, 0, 0, Vec::new(), String::new()),
        };
        StartTransition {
            reason,
            votes,
            leave_reason,
            expected_votes: expected,
            generation: self.generation,
            node_id: subject,
            addresses,
            name,
        }
    }

    fn do_starttrans(&mut self, sender: NodeRef, st: StartTransition) {
        let Some(from) = sender.as_real() else {
            return;
        };
        {
            let registry = self.registry.lock();
            if !registry.get(from).is_some_and(|n| n.is_member()) {
                return;
            }
        }
        if !matches!(
            self.state,
            FsmState::Member | FsmState::Transition | FsmState::Master
        ) {
            debug!(state = ?self.state, "ignoring STARTTRANS");
            return;
        }
        if st.generation < self.generation {
            debug!(
                got = st.generation,
                ours = self.generation,
                "ignoring STARTTRANS with old generation"
            );
            return;
        }
        self.generation = st.generation;
        self.refresh_shared();

        if self.state == FsmState::Master {
            // Two masters: the lowest id wins, except that a mere CHECK
            // always yields to a real event.
            let mut disallow = 0;
            if self.transition_reason != st.reason {
                if self.transition_reason == TransitionReason::Check {
                    disallow = self.us_id();
                }
                if st.reason == TransitionReason::Check {
                    disallow = from;
                }
            }

            match self.elect_master(disallow) {
                Some((winner, true)) => {
                    debug!("remaining master after election");
                    self.timers.cancel(TimerKind::Transition);
                    self.start_transition(TransitionReason::NewMaster, winner);
                    return;
                }
                Some((winner, false)) => {
                    debug!(new_master = winner, "backing down from master");
                    self.master_node = Some(winner);
                    self.state = FsmState::Transition;
                    if self.transition_reason == TransitionReason::NewNode
                        && self.joining_node.is_some()
                    {
                        self.remove_joiner(true);
                    }
                    if from != winner {
                        // The node that spoke is not the rightful master;
                        // tell the winner it has the job.
                        self.send_nominate(&st, winner);
                        return;
                    }
                    // Else fall through and obey the STARTTRANS we got.
                }
                None => {
                    self.fatal_leave(LeaveReason::Inconsistent);
                    return;
                }
            }
        }

        if self.state == FsmState::Member {
            debug!(master = from, "following transition");
            self.master_node = Some(from);
            self.state = FsmState::Transition;
            if st.reason == TransitionReason::NewNode {
                self.adopt_joiner_from(&st);
            }
            self.send_startack();
            self.timers.arm(
                TimerKind::Transition,
                Duration::from_secs(self.timeouts().transition_timeout),
            );
            self.refresh_shared();
            return;
        }

        if self.state == FsmState::Transition {
            let old_joiner = self.joining_node;
            self.master_node = Some(from);

            if st.reason == TransitionReason::NewNode {
                self.adopt_joiner_from(&st);
            }

            // A nominated master may bring a different joiner; the old one
            // was already told to go back and wait.
            if let Some(old) = old_joiner {
                if Some(old) != self.joining_node {
                    let mut registry = self.registry.lock();
                    if registry.get(old).is_some_and(|n| n.state == NodeState::Joining) {
                        registry.mark_dead(old, LeaveReason::Rejected);
                    }
                }
            }

            self.send_startack();
            self.timers.arm(
                TimerKind::Transition,
                Duration::from_secs(self.timeouts().transition_timeout),
            );
        }
    }

    /// Installs the joiner described in a STARTTRANS/NOMINATE message.
    fn adopt_joiner_from(&mut self, st: &StartTransition) {
        self.remove_joiner(false);
        let mut registry = self.registry.lock();
        let key = registry.add_or_update(
            &st.name,
            st.node_id,
            st.votes,
            st.expected_votes,
            NodeState::Joining,
            st.addresses.first().cloned(),
        );
        if let Some(node) = registry.get_mut(key) {
            for addr in &st.addresses {
                node.add_address(addr.clone());
            }
        }
        drop(registry);
        self.joining_node = Some(key);
        self.joining_addr = st.addresses.first().cloned();
    }

    fn do_nominate(&mut self, st: StartTransition) {
        debug!(reason = ?st.reason, "nominated as transition master");
        self.remove_joiner(true);

        let subject = if st.reason == TransitionReason::NewNode {
            self.adopt_joiner_from(&st);
            self.joining_node.unwrap_or_else(|| self.us_id())
        } else {
            self.us_id()
        };
        self.start_transition(st.reason, subject);
    }

    fn do_startack(&mut self) {
        if self.master_phase != MasterPhase::Start {
            debug!("STARTACK outside the collect window");
            return;
        }
        self.responses_collected += 1;
        if self.responses_expected != 0 && self.responses_collected < self.responses_expected {
            return;
        }

        let members = self.registry.lock().member_count();
        if members == 1 {
            if self.transition_reason == TransitionReason::NewNode {
                self.joinconf_count = 0;
                self.timers.arm(
                    TimerKind::Transition,
                    Duration::from_secs(self.timeouts().joinconf_timeout),
                );
                self.send_joinconf();
            } else {
                // A lone node ending a transition: no barrier needed.
                let max_expected = if self.leave_recalc { members as u32 } else { 0 };
                let tally = self.registry.lock().tally();
                let result = calculate_quorum(
                    tally,
                    max_expected,
                    self.quorum,
                    self.leave_recalc,
                    self.cfg.two_node,
                );
                self.quorum = result.quorum;
                self.apply_quorate(result.quorate, result.total_votes);
                self.leave_recalc = false;
                self.joining_addr = None;
                self.state = FsmState::Member;
                self.refresh_shared();
                self.notify_event(EventKind::StateChange, 0, None);
            }
            return;
        }

        self.master_phase = MasterPhase::Collect;
        self.responses_collected = 0;
        self.responses_expected = (members - 1) as u32;
        self.agreeing = 0;
        self.dissenting = 0;
        self.opinions.clear();
        debug!(
            expecting = self.responses_expected,
            "sending MASTERVIEW"
        );

        let entries = self.registry.lock().view_entries();
        let view = MembershipMessage::MasterView {
            flags: VIEW_FIRST | VIEW_LAST,
            nodes: entries,
        };
        if self
            .demux
            .send_membership(&view, 0, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while sending MASTERVIEW");
        }
        self.timers.arm(
            TimerKind::Transition,
            Duration::from_secs(self.timeouts().transition_timeout),
        );
    }

    fn do_masterview(&mut self, flags: u8, nodes: &[NodeEntry]) {
        if flags & VIEW_LAST == 0 {
            warn!("multi-packet MASTERVIEW not supported, dissenting");
        }
        let agree = if flags & VIEW_LAST != 0 {
            let registry = self.registry.lock();
            match registry.check_view(nodes) {
                Some(count) => count == registry.member_count(),
                None => false,
            }
        } else {
            false
        };

        if self
            .demux
            .send_membership(&MembershipMessage::ViewAck { agree }, 0, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while acknowledging MASTERVIEW");
        }
    }

    fn do_viewack(&mut self, sender: NodeRef, agree: bool) {
        let Some(from) = sender.as_real() else {
            return;
        };
        debug!(from, agree, "view acknowledgment");
        self.opinions.insert(from, agree);
        if agree {
            self.agreeing += 1;
        } else {
            self.dissenting += 1;
        }

        self.responses_collected += 1;
        if self.responses_collected < self.responses_expected {
            return;
        }
        self.timers.cancel(TimerKind::Transition);
        info!(
            agree = self.agreeing,
            dissent = self.dissenting,
            "view reconciliation results are in"
        );

        if self.agreeing > self.dissenting {
            // The dissenters' view lost; they must go.
            let dissenters: Vec<u32> = self
                .opinions
                .iter()
                .filter(|(_, agreed)| !**agreed)
                .map(|(id, _)| *id)
                .collect();
            for id in dissenters {
                if let Some(node) = self.registry.lock().get_mut(id) {
                    node.leave_reason = Some(LeaveReason::Inconsistent);
                }
                self.send_kill(id, KillReason::Inconsistent);
            }
        } else {
            // The minority never wins, and that minority is us.
            error!("our cluster view is in a minority, leaving");
            self.agreeing = 0;
            self.dissenting = 0;
            self.fatal_leave(LeaveReason::Inconsistent);
            return;
        }
        self.agreeing = 0;
        self.dissenting = 0;

        if self.transition_reason == TransitionReason::NewNode {
            self.joinconf_count = 0;
            self.timers.arm(
                TimerKind::Transition,
                Duration::from_secs(self.timeouts().joinconf_timeout),
            );
            self.send_joinconf();
            return;
        }

        self.master_phase = MasterPhase::Complete;
        self.end_transition();
    }

    fn send_joinconf(&mut self) {
        if self.joining_node.is_none() {
            warn!("no joiner to confirm, finishing the transition");
            self.end_transition();
            return;
        }
        self.master_phase = MasterPhase::Confirm;
        let target = self.joining_node.unwrap_or(0);
        let entries = self.registry.lock().view_entries();
        let msg = MembershipMessage::JoinConf {
            flags: VIEW_FIRST | VIEW_LAST,
            nodes: entries,
        };
        if self
            .demux
            .send_membership(&msg, target, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while sending JOINCONF");
        }
    }

    /// Master wrap-up: apply quorum, announce ENDTRANS, rendezvous.
    fn end_transition(&mut self) {
        self.timers.cancel(TimerKind::Transition);
        self.confirm_joiner();

        let members = self.registry.lock().member_count();
        let max_expected = if self.leave_recalc { members as u32 } else { 0 };
        let tally = self.registry.lock().tally();
        let result = calculate_quorum(
            tally,
            max_expected,
            self.quorum,
            self.leave_recalc,
            self.cfg.two_node,
        );
        self.quorum = result.quorum;
        self.generation += 1;

        let new_node_id = if self.transition_reason == TransitionReason::NewNode {
            self.joining_node.unwrap_or(0)
        } else {
            0
        };
        let end = EndTransition {
            quorum: self.quorum,
            generation: self.generation,
            total_votes: result.total_votes,
            new_node_id,
        };
        if self
            .demux
            .send_membership(&MembershipMessage::EndTrans(end), 0, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while ending transition");
        }

        self.master_phase = MasterPhase::Complete;
        self.apply_quorate(result.quorate, result.total_votes);
        self.refresh_shared();

        self.pending_barrier = Some(PendingBarrier::MasterEnd {
            total_votes: result.total_votes,
        });
        self.barriers.wait_internal(
            &transition_barrier_name(self.generation),
            members as u32,
            self.timeouts().transition_timeout as u32,
        );
    }

    fn do_endtrans(&mut self, sender: NodeRef, end: EndTransition) {
        if self.state != FsmState::Transition && self.state != FsmState::JoinAck {
            return;
        }
        if let (Some(master), Some(from)) = (self.master_node, sender.as_real()) {
            if master != from {
                warn!(
                    master,
                    from, "ENDTRANS from a node that is not the master"
                );
                return;
            }
        }
        self.timers.cancel(TimerKind::Transition);

        if end.new_node_id != 0 {
            let mut registry = self.registry.lock();
            if registry.us().node_id == 0 {
                if let Err(e) = registry.assign_node_id(0, end.new_node_id) {
                    drop(registry);
                    error!(error = %e, "cannot take assigned node id");
                    self.fatal_leave(LeaveReason::Panic);
                    return;
                }
                self.shared
                    .node_id
                    .store(end.new_node_id, Ordering::Release);
                info!(node_id = end.new_node_id, "node id assigned by the cluster");
            }
        }

        self.state = FsmState::TransitionComplete;
        if end.new_node_id != 0 {
            self.confirm_joiner();
        } else {
            self.remove_joiner(false);
        }
        self.generation = end.generation;
        self.refresh_shared();

        let members = self.registry.lock().member_count();
        self.pending_barrier = Some(PendingBarrier::ClientEnd { end });
        self.barriers.wait_internal(
            &transition_barrier_name(self.generation),
            members as u32,
            self.timeouts().transition_timeout as u32,
        );
    }

    /// The completion barrier resolved (or timed out).
    pub(crate) fn on_transition_barrier(&mut self, name: &str, result: i32) {
        let _ = self.barriers.delete(name);
        let Some(pending) = self.pending_barrier.take() else {
            return;
        };

        if result != 0 {
            warn!(barrier = name, result, "completion barrier failed");
            match pending {
                PendingBarrier::MasterEnd { .. } => {
                    self.remove_joiner(false);
                    self.start_transition(TransitionReason::Restart, self.us_id());
                }
                PendingBarrier::ClientEnd { .. } => {
                    self.state = FsmState::Transition;
                    self.timers.arm(
                        TimerKind::Transition,
                        Duration::from_secs(self.timeouts().transition_timeout),
                    );
                }
            }
            return;
        }

        if let PendingBarrier::ClientEnd { end } = pending {
            self.quorum = end.quorum;
            self.apply_quorate(end.total_votes >= end.quorum, end.total_votes);
        }

        // Common completion path for master and followers.
        self.registry.lock().purge_temp_nodes();
        self.master_node = None;
        self.joining_node = None;
        self.joining_addr = None;
        self.leave_recalc = false;
        self.state = FsmState::Member;
        self.shared.is_member.store(true, Ordering::Release);
        self.transition_end = Instant::now();
        self.restarts = 0;

        // HELLOs were suppressed during the transition; restart the clocks
        // so nobody is culled spuriously.
        let now = Instant::now();
        self.detector.reset_all(now);
        {
            let mut registry = self.registry.lock();
            let us = registry.us().node_id;
            for node in registry.iter_mut() {
                if node.is_member() {
                    node.last_hello = Some(now);
                }
            }
            for node in registry.iter() {
                if node.is_member() && node.node_id != us {
                    self.detector.heartbeat(node.node_id, now);
                }
            }
        }

        self.refresh_shared();
        self.notify_event(EventKind::StateChange, 0, None);

        let members = self.registry.lock().member_count() as u32;
        self.barriers.on_membership_change(members);

        if self.announce_on_member {
            self.announce_on_member = false;
            self.publish_transition_announce();
        }
        info!(
            generation = self.generation,
            members, "transition complete"
        );
    }

    fn confirm_joiner(&mut self) {
        if let Some(id) = self.joining_node {
            let mut registry = self.registry.lock();
            if let Some(node) = registry.get_mut(id) {
                if node.state == NodeState::Joining {
                    info!(node = %node.name, id, "joiner confirmed as member");
                    node.state = NodeState::Member;
                    node.last_hello = Some(Instant::now());
                }
            }
        }
    }

    /// Forgets the current joiner; a brand-new node is removed outright so
    /// transitions do not carry knowledge nobody else has.
    fn remove_joiner(&mut self, tell_wait: bool) {
        let Some(id) = self.joining_node.take() else {
            return;
        };
        self.joining_addr = None;

        if tell_wait {
            self.send_joinack(JoinAckType::Wait, id);
        }

        let mut registry = self.registry.lock();
        let fresh = registry.get(id).is_some_and(|n| n.incarnation == 0);
        if fresh {
            debug!(id, "removing never-confirmed joiner");
            registry.remove(id);
        } else if let Some(node) = registry.get_mut(id) {
            node.state = NodeState::Dead;
        }
    }

    // ------------------------------------------------------------------
    // Deaths
    // ------------------------------------------------------------------

    /// A node is gone (transport eviction, LEAVE drain, or missed HELLOs).
    pub(crate) fn node_has_died(&mut self, node_id: u32, default_reason: Option<LeaveReason>) {
        let (was_member, reason) = {
            let mut registry = self.registry.lock();
            let Some(node) = registry.get(node_id) else {
                return;
            };
            if node.state == NodeState::Dead {
                return;
            }
            let reason = node
                .leave_reason
                .or(default_reason)
                .unwrap_or(LeaveReason::NoResponse);
            (registry.mark_dead(node_id, reason), reason)
        };
        self.detector.remove(node_id);

        if !was_member {
            return;
        }

        let allow_decrease = reason.allows_quorum_decrease();
        if allow_decrease {
            self.leave_recalc = true;
        }
        self.recalculate_quorum(allow_decrease);

        let down = MembershipMessage::NodeDown {
            reason: reason.to_wire(),
            node_id,
        };
        if self
            .demux
            .send_membership(&down, 0, ADDRESS_LEN)
            .is_err()
        {
            debug!("transport closed while announcing node death");
        }

        match self.state {
            FsmState::Member => {
                self.start_transition(TransitionReason::RemNode, node_id);
            }
            FsmState::Transition | FsmState::TransitionComplete => {
                if self.master_node == Some(node_id) {
                    match self.elect_master(0) {
                        Some((_, true)) => {
                            self.timers.cancel(TimerKind::Transition);
                            if let Some(node) = self.registry.lock().get_mut(node_id) {
                                node.leave_reason = Some(LeaveReason::NoResponse);
                            }
                            self.start_transition(TransitionReason::DeadMaster, node_id);
                        }
                        Some((winner, false)) => {
                            // Someone else can be in charge.
                            self.master_node = Some(winner);
                        }
                        None => self.fatal_leave(LeaveReason::Inconsistent),
                    }
                }
            }
            FsmState::Master => {
                self.timers.cancel(TimerKind::Transition);
                self.restarts = 0;
                self.start_transition(TransitionReason::AnotherRemNode, node_id);
            }
            _ => {}
        }
        self.refresh_shared();
    }

    fn do_nodedown(&mut self, node_id: u32, raw_reason: u16) {
        let us = self.us_id();
        if node_id == us && us != 0 {
            error!("removed from the cluster by NODEDOWN");
            self.fatal_leave(
                LeaveReason::from_wire(raw_reason).unwrap_or(LeaveReason::Killed),
            );
            return;
        }
        let reason = LeaveReason::from_wire(raw_reason).unwrap_or(LeaveReason::Dead);
        let mut registry = self.registry.lock();
        if registry.get(node_id).is_some_and(|n| n.state != NodeState::Dead) {
            if let Some(node) = registry.get_mut(node_id) {
                node.leave_reason = Some(reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // New-cluster claims
    // ------------------------------------------------------------------

    fn do_newcluster(&mut self, tiebreak: u32) {
        match self.state {
            FsmState::Starting => {
                // Someone else is claiming; stagger our own ambitions by a
                // name-derived amount.
                let backoff = self.name_hash();
                debug!(backoff, "NEWCLUSTER heard while starting, backing off");
                self.timers.arm(
                    TimerKind::JoinWait,
                    Duration::from_secs(self.timeouts().joinwait_timeout + u64::from(backoff)),
                );
            }
            FsmState::NewCluster => {
                let ours = self.our_tiebreak();
                if tiebreak < ours {
                    debug!(theirs = tiebreak, ours, "lower claimant wins, restarting");
                    self.timers.cancel(TimerKind::NewClusterResend);
                    self.timers.cancel(TimerKind::NewClusterEnd);
                    self.begin_join();
                }
            }
            FsmState::Member => self.send_hello(),
            _ => {}
        }
    }

    fn our_tiebreak(&self) -> u32 {
        self.transport.local_address().low32()
    }

    /// Small stagger derived from the node name.
    fn name_hash(&self) -> u32 {
        let mut value: u32 = 0;
        for b in self.cfg.nodename.bytes() {
            value = value.wrapping_add(u32::from(b));
        }
        (value & 0xF) + 1
    }

    fn send_newcluster(&mut self) {
        if self.state != FsmState::NewCluster {
            return;
        }
        let msg = MembershipMessage::NewCluster {
            tiebreak: self.our_tiebreak(),
        };
        if self
            .demux
            .send_membership(&msg, 0, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while claiming a new cluster");
        }
    }

    // ------------------------------------------------------------------
    // Elections and exits
    // ------------------------------------------------------------------

    /// Lowest live node id wins. Returns the winner and whether it is us.
    fn elect_master(&self, disallow: u32) -> Option<(u32, bool)> {
        let registry = self.registry.lock();
        let winner = registry.lowest_member(disallow)?;
        debug!(winner = %winner.name, "elected master");
        Some((winner.node_id, winner.is_us))
    }

    /// Terminal exit: announce the reason and stop.
    pub(crate) fn fatal_leave(&mut self, reason: LeaveReason) {
        self.registry.lock().us_mut().leave_reason = Some(reason);
        let _ = self.demux.send_control(
            &ControlMessage::Leave {
                reason: reason.to_wire(),
            },
            0,
        );
        self.state = FsmState::Left;
        self.quit = true;
        self.shutdown.force();
    }

    /// Voluntary departure: multicast LEAVE and wait for the echo.
    pub(crate) fn leave_cluster(&mut self, reason: LeaveReason) {
        if self.leaving {
            return;
        }
        info!(%reason, "leaving the cluster");
        self.leaving = true;
        self.registry.lock().us_mut().leave_reason = Some(reason);

        if self
            .demux
            .send_control(
                &ControlMessage::Leave {
                    reason: reason.to_wire(),
                },
                0,
            )
            .is_err()
        {
            self.state = FsmState::Left;
            self.quit = true;
            return;
        }
        // If the echo never arrives (partition at the worst moment), quit
        // anyway after a grace period.
        self.timers.arm(
            TimerKind::Join,
            Duration::from_millis(self.timeouts().shutdown_timeout),
        );
    }

    /// The shutdown controller committed; start the LEAVE handshake.
    pub(crate) fn begin_leave(&mut self) {
        if self.quit || self.leaving {
            return;
        }
        self.leave_cluster(LeaveReason::Shutdown);
    }

    // ------------------------------------------------------------------
    // Announcements and small sends
    // ------------------------------------------------------------------

    /// Answers a join request. Joiners that claimed a node id are
    /// addressed directly; a dynamic joiner (id 0) only sees broadcasts.
    fn send_joinack(&self, ack: JoinAckType, target: u32) {
        if self
            .demux
            .send_membership(&MembershipMessage::JoinAck { ack }, target, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while acknowledging join");
        }
    }

    fn send_startack(&self) {
        let msg = MembershipMessage::StartAck {
            generation: self.generation,
        };
        if self
            .demux
            .send_membership(&msg, 0, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while acknowledging STARTTRANS");
        }
    }

    fn send_nominate(&self, st: &StartTransition, target: u32) {
        let msg = MembershipMessage::Nominate(st.clone());
        if self
            .demux
            .send_membership(&msg, target, ADDRESS_LEN)
            .is_err()
        {
            warn!("transport closed while nominating a master");
        }
    }

    /// Tells a node to die.
    pub(crate) fn send_kill(&self, node_id: u32, reason: KillReason) {
        debug!(target = node_id, ?reason, "sending KILLNODE");
        let msg = ControlMessage::KillNode {
            reason: reason.to_wire(),
            target_node: node_id,
        };
        if self.demux.send_control(&msg, node_id).is_err() {
            warn!("transport closed while sending KILLNODE");
        }
    }

    /// Announces our arrival so peers can sanity-check compatibility.
    fn publish_transition_announce(&mut self) {
        let (high, expected) = {
            let registry = self.registry.lock();
            (registry.highest_node_id(), registry.us().expected_votes)
        };
        let announce = ControlMessage::Transition(TransitionAnnounce {
            cluster_id: self.cfg.cluster_id,
            high_node_id: high,
            expected_votes: expected,
            version: ProtocolVersion::current(self.config_version),
            cluster_name: self.cfg.cluster_name.clone(),
        });
        if self.demux.send_control(&announce, 0).is_err() {
            warn!("transport closed while announcing transition");
        }
    }

    /// Validates a peer's TRANSITION announcement against our identity.
    pub(crate) fn handle_transition_announce(
        &mut self,
        source_node: u32,
        source: &NodeAddress,
        announce: &TransitionAnnounce,
    ) {
        if source.eq_ignore_family(&self.transport.local_address()) {
            return;
        }

        let mut ok = true;
        if announce.cluster_name != self.cfg.cluster_name {
            error!(
                remote = %announce.cluster_name,
                local = %self.cfg.cluster_name,
                "node refused: wrong cluster name"
            );
            ok = false;
        } else if announce.cluster_id != self.cfg.cluster_id {
            error!(
                remote = announce.cluster_id,
                local = self.cfg.cluster_id,
                "node refused: wrong cluster id"
            );
            ok = false;
        } else if announce.version.major != PROTOCOL_MAJOR {
            error!(
                remote = announce.version.major,
                local = PROTOCOL_MAJOR,
                "node refused: wrong protocol version"
            );
            ok = false;
        } else {
            // A newer configuration generation is adopted, not refused.
            if announce.version.config > self.config_version {
                info!(
                    version = announce.version.config,
                    "adopting newer configuration version"
                );
                self.config_version = announce.version.config;
            }
            if announce.version.config != self.config_version {
                error!(
                    remote = announce.version.config,
                    local = self.config_version,
                    "node refused: configuration version mismatch"
                );
                ok = false;
            }
        }

        if !ok {
            if self.shared.quorate.load(Ordering::Acquire) && source_node != 0 {
                self.send_kill(source_node, KillReason::Rejected);
            }
            return;
        }
        self.recalculate_quorum(false);
    }
}

/// Join-request duplicate checking outcome.
enum DuplicateVerdict {
    Fresh,
    AlreadyJoining,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use memberd_core::MessageHeader;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::{encode_address, JoinConfig, NodeSpec, RuntimeTimeouts};
    use crate::core::ClusterCore;
    use crate::transport::{LoopbackHub, TransportEvent};

    fn addr(last: u8) -> NodeAddress {
        encode_address(&format!("10.0.0.{last}")).unwrap()
    }

    fn config(name: &str, node_id: u32, expected: u32) -> JoinConfig {
        JoinConfig {
            cluster_name: "alpha".into(),
            cluster_id: memberd_core::cluster_id_from_name("alpha"),
            nodename: name.into(),
            node_id,
            votes: 1,
            expected_votes: expected,
            two_node: false,
            config_version: 1,
            ip_port: 5405,
            multicast: "239.192.0.1".into(),
            interfaces: vec![addr(node_id as u8)],
            key: Vec::new(),
            nodes: vec![NodeSpec {
                name: name.into(),
                node_id,
                votes: 1,
                address: Some(format!("10.0.0.{node_id}")),
            }],
            timeouts: RuntimeTimeouts::default(),
        }
    }

    /// A core on a hub, plus an observer receiver that sees every
    /// multicast the core sends.
    fn fixture(expected: u32) -> (ClusterCore, mpsc::UnboundedReceiver<TransportEvent>) {
        let hub = LoopbackHub::new();
        let (_observer, observer_rx) = hub.join(addr(99));
        let (transport, transport_rx) = hub.join(addr(1));

        let core = ClusterCore::new(config("node-a", 1, expected), Arc::new(transport), transport_rx);
        core.registry.lock().prime_local(
            "node-a",
            1,
            1,
            expected,
            vec![addr(1)],
            NodeState::Joining,
        );
        core.shared
            .node_id
            .store(1, std::sync::atomic::Ordering::Release);
        (core, observer_rx)
    }

    /// Membership messages multicast since the last call.
    fn sent(observer: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<MembershipMessage> {
        let mut out = Vec::new();
        while let Ok(event) = observer.try_recv() {
            if let TransportEvent::Deliver { mut payload, .. } = event {
                let header = MessageHeader::decode(&mut payload, false).unwrap();
                if header.target_port == memberd_core::PORT_MEMBERSHIP {
                    out.push(MembershipMessage::decode(&mut payload, false).unwrap());
                }
            }
        }
        out
    }

    fn hello(members: u16, generation: u32) -> Hello {
        Hello {
            members,
            flags: HELLO_FLAG_QUORATE,
            generation,
        }
    }
    use memberd_core::HELLO_FLAG_QUORATE;

    fn join_request(name: &str, node_id: u32) -> JoinRequest {
        JoinRequest {
            votes: 1,
            expected_votes: 3,
            node_id,
            version: ProtocolVersion::current(1),
            addr_len: ADDRESS_LEN as u32,
            cluster_name: "alpha".into(),
            addresses: vec![addr(node_id as u8)],
            name: name.into(),
        }
    }

    fn make_member(core: &mut ClusterCore) {
        core.registry.lock().us_mut().state = NodeState::Member;
        core.shared
            .is_member
            .store(true, std::sync::atomic::Ordering::Release);
        core.state = FsmState::Member;
        core.recalculate_quorum(false);
    }

    #[tokio::test]
    async fn begin_join_enters_starting() {
        let (mut core, _observer) = fixture(3);
        core.begin_join();
        assert_eq!(core.state, FsmState::Starting);
    }

    #[tokio::test]
    async fn hello_while_starting_sends_joinreq() {
        let (mut core, mut observer) = fixture(3);
        core.begin_join();

        core.do_hello_msg(NodeRef::Real(2), hello(1, 5));

        assert_eq!(core.state, FsmState::Joining);
        let msgs = sent(&mut observer);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, MembershipMessage::JoinReq(r) if r.name == "node-a")));
    }

    #[tokio::test]
    async fn newcluster_tiebreak_lower_claimant_wins() {
        let (mut core, _observer) = fixture(3);
        core.state = FsmState::NewCluster;

        // A higher claimant does not displace us.
        core.do_newcluster(u32::MAX);
        assert_eq!(core.state, FsmState::NewCluster);

        // A lower one sends us back to listening.
        core.do_newcluster(0);
        assert_eq!(core.state, FsmState::Starting);
    }

    #[tokio::test]
    async fn joinack_variants_steer_the_join() {
        let (mut core, _observer) = fixture(3);
        core.state = FsmState::Joining;
        core.do_joinack(JoinAckType::Wait);
        assert_eq!(core.state, FsmState::JoinWait);

        core.state = FsmState::Joining;
        core.do_joinack(JoinAckType::Ok);
        assert_eq!(core.state, FsmState::JoinAck);

        core.state = FsmState::Joining;
        core.do_joinack(JoinAckType::Nak);
        assert_eq!(core.state, FsmState::Rejected);
        assert!(core.quit);
    }

    #[tokio::test]
    async fn forming_a_cluster_alone_becomes_quorate_member() {
        let (mut core, mut observer) = fixture(1);
        core.state = FsmState::NewCluster;
        core.on_timer(TimerKind::NewClusterEnd);

        assert_eq!(core.state, FsmState::Member);
        assert_eq!(core.registry.lock().us().state, NodeState::Member);
        assert!(core
            .shared
            .quorate
            .load(std::sync::atomic::Ordering::Acquire));
        assert_eq!(core.quorum, 1);

        // The newborn cluster says HELLO.
        let msgs = sent(&mut observer);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, MembershipMessage::Hello(_))));
    }

    #[tokio::test]
    async fn joinreq_with_wrong_cluster_name_gets_nak() {
        let (mut core, mut observer) = fixture(3);
        make_member(&mut core);

        let mut req = join_request("node-b", 2);
        req.cluster_name = "beta".into();
        core.do_joinreq(&addr(2), &req);

        let msgs = sent(&mut observer);
        assert!(msgs.iter().any(|m| matches!(
            m,
            MembershipMessage::JoinAck {
                ack: JoinAckType::Nak
            }
        )));
        assert!(core.joining_node.is_none());
    }

    #[tokio::test]
    async fn joinreq_with_used_node_id_gets_nak() {
        let (mut core, mut observer) = fixture(3);
        make_member(&mut core);
        core.registry
            .lock()
            .add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));

        let req = join_request("node-x", 2);
        core.do_joinreq(&addr(9), &req);

        let msgs = sent(&mut observer);
        assert!(msgs.iter().any(|m| matches!(
            m,
            MembershipMessage::JoinAck {
                ack: JoinAckType::Nak
            }
        )));
    }

    #[tokio::test]
    async fn accepted_joinreq_starts_a_newnode_transition() {
        let (mut core, mut observer) = fixture(3);
        make_member(&mut core);

        let req = join_request("node-b", 2);
        core.do_joinreq(&addr(2), &req);

        assert_eq!(core.joining_node, Some(2));
        assert_eq!(
            core.registry.lock().get(2).unwrap().state,
            NodeState::Joining
        );

        let msgs = sent(&mut observer);
        assert!(msgs.iter().any(|m| matches!(
            m,
            MembershipMessage::JoinAck {
                ack: JoinAckType::Ok
            }
        )));
        // Alone with a joiner, the master confirms immediately.
        assert!(msgs
            .iter()
            .any(|m| matches!(m, MembershipMessage::JoinConf { .. })));
        assert_eq!(core.state, FsmState::Master);
        assert_eq!(core.master_phase, MasterPhase::Confirm);
    }

    #[tokio::test]
    async fn joinreq_while_mastering_gets_wait() {
        let (mut core, mut observer) = fixture(3);
        make_member(&mut core);
        core.state = FsmState::Master;

        core.do_joinreq(&addr(3), &join_request("node-c", 3));

        let msgs = sent(&mut observer);
        assert!(msgs.iter().any(|m| matches!(
            m,
            MembershipMessage::JoinAck {
                ack: JoinAckType::Wait
            }
        )));
    }

    #[tokio::test]
    async fn starttrans_turns_a_member_into_a_follower() {
        let (mut core, mut observer) = fixture(3);
        make_member(&mut core);
        core.registry
            .lock()
            .add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        core.generation = 4;

        let st = StartTransition {
            reason: TransitionReason::Check,
            votes: 1,
            leave_reason: 0,
            expected_votes: 3,
            generation: 5,
            node_id: 2,
            addresses: vec![],
            name: String::new(),
        };
        core.do_starttrans(NodeRef::Real(2), st);

        assert_eq!(core.state, FsmState::Transition);
        assert_eq!(core.master_node, Some(2));
        assert_eq!(core.generation, 5);

        let msgs = sent(&mut observer);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, MembershipMessage::StartAck { generation: 5 })));
    }

    #[tokio::test]
    async fn stale_starttrans_is_ignored() {
        let (mut core, mut observer) = fixture(3);
        make_member(&mut core);
        core.registry
            .lock()
            .add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        core.generation = 9;

        let st = StartTransition {
            reason: TransitionReason::Check,
            votes: 1,
            leave_reason: 0,
            expected_votes: 3,
            generation: 3,
            node_id: 2,
            addresses: vec![],
            name: String::new(),
        };
        core.do_starttrans(NodeRef::Real(2), st);

        assert_eq!(core.state, FsmState::Member);
        assert!(sent(&mut observer).is_empty());
    }

    #[tokio::test]
    async fn hello_generation_mismatch_triggers_check_transition() {
        let (mut core, mut observer) = fixture(3);
        make_member(&mut core);
        core.registry
            .lock()
            .add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        core.generation = 7;
        // Push the grace window into the past.
        core.transition_end = Instant::now() - Duration::from_secs(60);

        core.do_hello_msg(NodeRef::Real(2), hello(2, 3));

        assert_eq!(core.state, FsmState::Master);
        let msgs = sent(&mut observer);
        assert!(msgs.iter().any(|m| matches!(
            m,
            MembershipMessage::StartTrans(st) if st.reason == TransitionReason::Check
        )));
    }

    #[tokio::test]
    async fn member_death_starts_a_remnode_transition() {
        let (mut core, mut observer) = fixture(3);
        make_member(&mut core);
        core.registry
            .lock()
            .add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        core.registry
            .lock()
            .add_or_update("node-c", 3, 1, 3, NodeState::Member, Some(addr(3)));
        core.recalculate_quorum(false);
        assert_eq!(core.quorum, 2);

        core.node_has_died(3, Some(LeaveReason::Dead));

        assert_eq!(
            core.registry.lock().get(3).unwrap().state,
            NodeState::Dead
        );
        assert_eq!(core.state, FsmState::Master);
        // The quorum holds through the death.
        assert_eq!(core.quorum, 2);

        let msgs = sent(&mut observer);
        assert!(msgs.iter().any(|m| matches!(
            m,
            MembershipMessage::StartTrans(st) if st.reason == TransitionReason::RemNode
        )));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, MembershipMessage::NodeDown { node_id: 3, .. })));
    }

    #[tokio::test]
    async fn nodedown_for_us_is_fatal() {
        let (mut core, _observer) = fixture(3);
        make_member(&mut core);

        core.do_nodedown(1, LeaveReason::Killed.to_wire());

        assert_eq!(core.state, FsmState::Left);
        assert!(core.quit);
    }

    #[tokio::test]
    async fn own_messages_are_not_consumed() {
        let (mut core, _observer) = fixture(3);
        core.begin_join();

        // A looped-back HELLO from our own address must not make us join
        // ourselves.
        let our_addr = addr(1);
        core.handle_membership(
            NodeRef::Real(1),
            &our_addr,
            MembershipMessage::Hello(hello(1, 1)),
        );
        assert_eq!(core.state, FsmState::Starting);
    }
}
