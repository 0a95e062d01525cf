//! Node registry: every node we know about, keyed and ordered by node id.
//!
//! The registry also owns the temporary-id table for peers seen at the wire
//! level before acceptance, and the optional quorum-device pseudo-node. It
//! is shared between the main task and the hello task behind a mutex; all
//! operations are synchronous and non-blocking.

use std::collections::BTreeMap;
use std::time::Instant;

use memberd_core::proto::NodeEntry;
use memberd_core::quorum::VoteTally;
use memberd_core::{LeaveReason, NodeAddress, NodeRef, NodeState, PortMap};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry key used for the local node until the cluster assigns its id.
const UNASSIGNED: u32 = 0;

/// Irrecoverable registry faults. An id conflict means the configuration
/// disagrees across the cluster; the caller terminates the process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node id {id} already in use by '{existing}' (new claimant '{claimant}')")]
    IdInUse {
        id: u32,
        existing: String,
        claimant: String,
    },
}

/// One known node.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub node_id: u32,
    pub addresses: Vec<NodeAddress>,
    pub state: NodeState,
    pub votes: u8,
    pub expected_votes: u32,
    pub leave_reason: Option<LeaveReason>,
    pub incarnation: u64,
    pub is_us: bool,
    pub ports: PortMap,
    pub last_hello: Option<Instant>,
}

impl Node {
    fn new(name: &str, node_id: u32, votes: u8, expected_votes: u32, state: NodeState) -> Self {
        Self {
            name: name.to_string(),
            node_id,
            addresses: Vec::new(),
            state,
            votes,
            expected_votes,
            leave_reason: None,
            incarnation: 0,
            is_us: false,
            ports: PortMap::new(),
            last_hello: None,
        }
    }

    #[must_use]
    pub fn is_member(&self) -> bool {
        self.state == NodeState::Member
    }

    /// Members plus nodes still draining a voluntary leave: both count
    /// toward the member total until the view change lands.
    #[must_use]
    pub fn counts_as_member(&self) -> bool {
        self.state == NodeState::Member || self.state == NodeState::Leaving
    }

    /// Registers an address unless an equal one is already present.
    pub fn add_address(&mut self, addr: NodeAddress) {
        if !self.addresses.iter().any(|a| a.eq_ignore_family(&addr)) {
            self.addresses.push(addr);
        }
    }
}

/// The node table plus temporary ids and the quorum device.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<u32, Node>,
    temp: Vec<(u32, NodeAddress)>,
    next_temp: u32,
    quorum_device: Option<Node>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- lookups ----------------------------------------------------------

    #[must_use]
    pub fn get(&self, node_id: u32) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn get_mut(&mut self, node_id: u32) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.values().find(|n| n.name == name)
    }

    #[must_use]
    pub fn find_by_addr(&self, addr: &NodeAddress) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| n.addresses.iter().any(|a| a.eq_ignore_family(addr)))
    }

    /// The local node. Panics only if the registry was never primed, which
    /// would be a startup-order bug.
    #[must_use]
    pub fn us(&self) -> &Node {
        self.nodes
            .values()
            .find(|n| n.is_us)
            .expect("registry not primed with the local node")
    }

    pub fn us_mut(&mut self) -> &mut Node {
        self.nodes
            .values_mut()
            .find(|n| n.is_us)
            .expect("registry not primed with the local node")
    }

    /// Nodes in ascending node-id order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.nodes.values().filter(|n| n.counts_as_member()).count()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn member_ids(&self) -> Vec<u32> {
        self.nodes
            .values()
            .filter(|n| n.is_member())
            .map(|n| n.node_id)
            .collect()
    }

    #[must_use]
    pub fn highest_node_id(&self) -> u32 {
        self.nodes.keys().next_back().copied().unwrap_or(0)
    }

    /// Lowest-id member, skipping `disallow` -- the election rule.
    #[must_use]
    pub fn lowest_member(&self, disallow: u32) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| n.is_member() && n.node_id != disallow && n.node_id != UNASSIGNED)
    }

    // -- mutation ---------------------------------------------------------

    /// Seeds the local node. Called once at startup before the transport
    /// joins.
    pub fn prime_local(
        &mut self,
        name: &str,
        node_id: u32,
        votes: u8,
        expected_votes: u32,
        addresses: Vec<NodeAddress>,
        state: NodeState,
    ) -> u32 {
        let mut node = Node::new(name, node_id, votes, expected_votes, state);
        node.is_us = true;
        node.addresses = addresses;
        node.ports.set(0);
        node.last_hello = Some(Instant::now());
        self.nodes.insert(node_id, node);
        node_id
    }

    /// Creates or updates a node, matching by id first and address second.
    ///
    /// Mutable fields are refreshed; an existing node id is never
    /// clobbered. A dead node re-registering is revived with a bumped
    /// incarnation.
    pub fn add_or_update(
        &mut self,
        name: &str,
        node_id: u32,
        votes: u8,
        expected_votes: u32,
        state: NodeState,
        address: Option<NodeAddress>,
    ) -> u32 {
        let key = if node_id != UNASSIGNED && self.nodes.contains_key(&node_id) {
            Some(node_id)
        } else {
            address
                .as_ref()
                .and_then(|a| self.find_by_addr(a))
                .map(|n| n.node_id)
        };

        if let Some(key) = key {
            let was_member;
            {
                let node = self.nodes.get_mut(&key).expect("key just resolved");
                was_member = node.is_member();
                node.votes = votes;
                if expected_votes != 0 {
                    node.expected_votes = expected_votes;
                }
                if node.state == NodeState::Dead && state == NodeState::Member {
                    info!(node = %node.name, id = key, "node rejoining");
                    node.incarnation += 1;
                    node.leave_reason = None;
                    node.ports.clear_all();
                    node.last_hello = Some(Instant::now());
                }
                if !was_member || state == NodeState::Member {
                    node.state = state;
                }
                if let Some(addr) = address {
                    node.add_address(addr);
                }
            }
            return key;
        }

        debug!(node = name, id = node_id, ?state, "adding node");
        let mut node = Node::new(name, node_id, votes, expected_votes, state);
        if let Some(addr) = address {
            node.add_address(addr);
        }
        node.last_hello = Some(Instant::now());
        self.nodes.insert(node_id, node);
        node_id
    }

    /// Moves a node to its assigned id.
    ///
    /// A stale JOINING entry occupying the id is silently replaced (it was
    /// never accepted). A live entry with a different identity is a fatal
    /// configuration error.
    ///
    /// # Errors
    ///
    /// [`RegistryError::IdInUse`] when a distinct live node already holds
    /// the id.
    pub fn assign_node_id(&mut self, current_key: u32, new_id: u32) -> Result<(), RegistryError> {
        if current_key == new_id || new_id == UNASSIGNED {
            return Ok(());
        }

        if let Some(existing) = self.nodes.get(&new_id) {
            if existing.state == NodeState::Joining {
                warn!(
                    node = %existing.name,
                    id = new_id,
                    "replacing stale joining node"
                );
                self.nodes.remove(&new_id);
            } else {
                let claimant = self
                    .nodes
                    .get(&current_key)
                    .map_or_else(String::new, |n| n.name.clone());
                return Err(RegistryError::IdInUse {
                    id: new_id,
                    existing: self.nodes[&new_id].name.clone(),
                    claimant,
                });
            }
        }

        if let Some(mut node) = self.nodes.remove(&current_key) {
            node.node_id = new_id;
            self.nodes.insert(new_id, node);
        }
        Ok(())
    }

    /// Removes a node record entirely (failed joiner cleanup).
    pub fn remove(&mut self, node_id: u32) -> Option<Node> {
        self.nodes.remove(&node_id)
    }

    /// MEMBER -> DEAD, recording the reason. Returns true if the node was a
    /// member (so quorum must be recomputed).
    pub fn mark_dead(&mut self, node_id: u32, reason: LeaveReason) -> bool {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return false;
        };
        let was_member = node.is_member() || node.state == NodeState::Leaving;
        if node.state != NodeState::Dead {
            info!(node = %node.name, id = node_id, %reason, "removing node from the cluster");
            node.state = NodeState::Dead;
            node.leave_reason = Some(reason);
            node.ports.clear_all();
        }
        was_member
    }

    /// Applies a PORTOPENED/PORTCLOSED/PORTSTATUS update.
    pub fn set_port(&mut self, node_id: u32, port: u8, open: bool) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            if open {
                node.ports.set(port);
            } else {
                node.ports.clear(port);
            }
        }
    }

    // -- vote accounting --------------------------------------------------

    /// Vote totals over the current members, quorum device included.
    #[must_use]
    pub fn tally(&self) -> VoteTally {
        let mut total = 0u32;
        let mut highest_expected = 0u32;
        for node in self.nodes.values().filter(|n| n.is_member()) {
            total += u32::from(node.votes);
            highest_expected = highest_expected.max(node.expected_votes);
        }
        if let Some(device) = &self.quorum_device {
            if device.is_member() {
                total += u32::from(device.votes);
            }
        }
        VoteTally {
            total_votes: total,
            highest_expected,
        }
    }

    /// Caps every member's expected_votes at `value` (RECONFIGURE and
    /// set-expected-votes both do this).
    pub fn cap_expected_votes(&mut self, value: u32) {
        if value == 0 {
            return;
        }
        for node in self.nodes.values_mut() {
            if node.is_member() && node.expected_votes > value {
                node.expected_votes = value;
            }
        }
    }

    // -- quorum device ----------------------------------------------------

    #[must_use]
    pub fn quorum_device(&self) -> Option<&Node> {
        self.quorum_device.as_ref()
    }

    pub fn quorum_device_mut(&mut self) -> Option<&mut Node> {
        self.quorum_device.as_mut()
    }

    /// Registers the quorum device, initially dead until polled alive.
    ///
    /// Returns false if a device already exists or the name collides with a
    /// cluster node.
    pub fn register_quorum_device(&mut self, name: &str, votes: u8) -> bool {
        if self.quorum_device.is_some() || self.find_by_name(name).is_some() {
            return false;
        }
        let mut device = Node::new(name, 0, votes, 0, NodeState::Dead);
        device.last_hello = Some(Instant::now());
        self.quorum_device = Some(device);
        true
    }

    /// Unregisters the device; refused while it is contributing votes.
    pub fn unregister_quorum_device(&mut self) -> bool {
        match &self.quorum_device {
            Some(device) if device.is_member() => false,
            Some(_) => {
                self.quorum_device = None;
                true
            }
            None => false,
        }
    }

    // -- temporary node ids ----------------------------------------------

    /// Temporary id for an address not (yet) belonging to a known node.
    /// The same address always yields the same id until purged.
    pub fn temp_node_for(&mut self, addr: &NodeAddress) -> NodeRef {
        if let Some((id, _)) = self.temp.iter().find(|(_, a)| a.eq_ignore_family(addr)) {
            return NodeRef::Temp(*id);
        }
        self.next_temp += 1;
        let id = self.next_temp;
        self.temp.push((id, addr.clone()));
        NodeRef::Temp(id)
    }

    #[must_use]
    pub fn temp_addr(&self, temp_id: u32) -> Option<&NodeAddress> {
        self.temp
            .iter()
            .find(|(id, _)| *id == temp_id)
            .map(|(_, a)| a)
    }

    /// Resolves an inbound sender: a known node's real id, else a
    /// temporary id.
    pub fn resolve_sender(&mut self, claimed_id: u32, addr: &NodeAddress) -> NodeRef {
        if claimed_id != UNASSIGNED && self.nodes.contains_key(&claimed_id) {
            return NodeRef::Real(claimed_id);
        }
        if let Some(node) = self.find_by_addr(addr) {
            if node.node_id != UNASSIGNED {
                return NodeRef::Real(node.node_id);
            }
        }
        self.temp_node_for(addr)
    }

    /// Drops all temporary ids. Called when the cluster view updates.
    pub fn purge_temp_nodes(&mut self) {
        self.temp.clear();
    }

    // -- packed views -----------------------------------------------------

    /// Packs the MEMBER and DEAD nodes for a JOINCONF/MASTERVIEW message.
    #[must_use]
    pub fn view_entries(&self) -> Vec<NodeEntry> {
        self.nodes
            .values()
            .filter(|n| n.state == NodeState::Member || n.state == NodeState::Dead)
            .map(|n| NodeEntry {
                name: n.name.clone(),
                state: n.state,
                addresses: n.addresses.clone(),
                votes: n.votes,
                expected_votes: n.expected_votes,
                node_id: n.node_id,
            })
            .collect()
    }

    /// Compares the master's packed view against ours; returns the number
    /// of matching MEMBER entries, or None on a mismatch. A local JOINING
    /// state is not held against a master that says DEAD.
    #[must_use]
    pub fn check_view(&self, entries: &[NodeEntry]) -> Option<usize> {
        let mut members = 0;
        for entry in entries {
            let node = self.find_by_name(&entry.name)?;
            if node.votes != entry.votes
                || node.node_id != entry.node_id
                || (node.state != NodeState::Joining && node.state != entry.state)
            {
                warn!(
                    node = %entry.name,
                    ours = ?node.state,
                    theirs = ?entry.state,
                    "cluster view mismatch"
                );
                return None;
            }
            if entry.state == NodeState::Member {
                members += 1;
            }
        }
        Some(members)
    }

    /// Applies a JOINCONF packed view, creating any nodes we lack.
    pub fn apply_view(&mut self, entries: &[NodeEntry]) {
        for entry in entries {
            if self.find_by_name(&entry.name).is_some() {
                continue;
            }
            let key = self.add_or_update(
                &entry.name,
                entry.node_id,
                entry.votes,
                entry.expected_votes,
                entry.state,
                None,
            );
            if let Some(node) = self.nodes.get_mut(&key) {
                for addr in &entry.addresses {
                    node.add_address(addr.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> NodeAddress {
        let mut bytes = vec![2, 0, 10, 0, 0, last];
        bytes.resize(18, 0);
        NodeAddress::new(bytes)
    }

    fn primed() -> NodeRegistry {
        let mut reg = NodeRegistry::new();
        reg.prime_local("node-a", 1, 1, 3, vec![addr(1)], NodeState::Member);
        reg
    }

    #[test]
    fn prime_local_sets_us_and_port0() {
        let reg = primed();
        let us = reg.us();
        assert!(us.is_us);
        assert_eq!(us.node_id, 1);
        assert!(us.ports.get(0));
    }

    #[test]
    fn nodes_iterate_in_id_order() {
        let mut reg = primed();
        reg.add_or_update("node-c", 3, 1, 3, NodeState::Member, Some(addr(3)));
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));

        let ids: Vec<u32> = reg.iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn add_matches_by_address_without_clobbering_id() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Dead, Some(addr(2)));

        // Same address, id 0: must update node 2, not create a new entry.
        let key = reg.add_or_update("node-b", 0, 1, 4, NodeState::Member, Some(addr(2)));
        assert_eq!(key, 2);
        assert_eq!(reg.node_count(), 2);
        assert_eq!(reg.get(2).unwrap().expected_votes, 4);
    }

    #[test]
    fn dead_node_rejoining_bumps_incarnation() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        reg.mark_dead(2, LeaveReason::Dead);

        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        let node = reg.get(2).unwrap();
        assert_eq!(node.state, NodeState::Member);
        assert_eq!(node.incarnation, 1);
        assert_eq!(node.leave_reason, None);
    }

    #[test]
    fn mark_dead_counts_members_and_records_reason() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        assert_eq!(reg.member_count(), 2);

        assert!(reg.mark_dead(2, LeaveReason::NoResponse));
        assert_eq!(reg.member_count(), 1);
        assert_eq!(reg.get(2).unwrap().leave_reason, Some(LeaveReason::NoResponse));

        // Already dead: not a member transition.
        assert!(!reg.mark_dead(2, LeaveReason::Dead));
    }

    #[test]
    fn assign_node_id_moves_entry() {
        let mut reg = NodeRegistry::new();
        reg.prime_local("node-a", 0, 1, 3, vec![addr(1)], NodeState::Joining);

        reg.assign_node_id(0, 4).unwrap();
        assert!(reg.get(0).is_none());
        assert_eq!(reg.us().node_id, 4);
    }

    #[test]
    fn assign_node_id_replaces_stale_joiner() {
        let mut reg = primed();
        reg.add_or_update("ghost", 2, 1, 3, NodeState::Joining, None);
        reg.add_or_update("node-b", 5, 1, 3, NodeState::Member, Some(addr(2)));

        reg.assign_node_id(5, 2).unwrap();
        assert_eq!(reg.get(2).unwrap().name, "node-b");
        assert!(reg.get(5).is_none());
    }

    #[test]
    fn assign_node_id_conflict_is_fatal() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        reg.add_or_update("node-c", 5, 1, 3, NodeState::Member, Some(addr(3)));

        let err = reg.assign_node_id(5, 2).unwrap_err();
        assert_eq!(
            err,
            RegistryError::IdInUse {
                id: 2,
                existing: "node-b".into(),
                claimant: "node-c".into(),
            }
        );
    }

    #[test]
    fn tally_counts_members_only() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        reg.add_or_update("node-c", 3, 1, 3, NodeState::Dead, Some(addr(3)));

        let tally = reg.tally();
        assert_eq!(tally.total_votes, 2);
        assert_eq!(tally.highest_expected, 3);
    }

    #[test]
    fn quorum_device_votes_count_when_alive() {
        let mut reg = primed();
        assert!(reg.register_quorum_device("qdisk", 1));
        assert_eq!(reg.tally().total_votes, 1); // device starts dead

        reg.quorum_device_mut().unwrap().state = NodeState::Member;
        assert_eq!(reg.tally().total_votes, 2);

        // Refused while alive.
        assert!(!reg.unregister_quorum_device());
        reg.quorum_device_mut().unwrap().state = NodeState::Dead;
        assert!(reg.unregister_quorum_device());
    }

    #[test]
    fn quorum_device_name_collision_refused() {
        let mut reg = primed();
        assert!(!reg.register_quorum_device("node-a", 1));
    }

    #[test]
    fn temp_ids_are_stable_per_address() {
        let mut reg = primed();
        let t1 = reg.temp_node_for(&addr(9));
        let t2 = reg.temp_node_for(&addr(9));
        let t3 = reg.temp_node_for(&addr(8));
        assert_eq!(t1, t2);
        assert_ne!(t1, t3);

        reg.purge_temp_nodes();
        let t4 = reg.temp_node_for(&addr(9));
        assert_ne!(t1, t4);
    }

    #[test]
    fn resolve_sender_prefers_real_nodes() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));

        assert_eq!(reg.resolve_sender(2, &addr(2)), NodeRef::Real(2));
        // Claimed id 0 but a known address: still real.
        assert_eq!(reg.resolve_sender(0, &addr(2)), NodeRef::Real(2));
        // Unknown address: temporary.
        assert!(matches!(reg.resolve_sender(0, &addr(9)), NodeRef::Temp(_)));
    }

    #[test]
    fn lowest_member_election_rule() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        reg.add_or_update("node-c", 3, 1, 3, NodeState::Member, Some(addr(3)));

        assert_eq!(reg.lowest_member(0).unwrap().node_id, 1);
        assert_eq!(reg.lowest_member(1).unwrap().node_id, 2);

        reg.mark_dead(1, LeaveReason::Dead);
        assert_eq!(reg.lowest_member(0).unwrap().node_id, 2);
    }

    #[test]
    fn cap_expected_votes_hits_members_only() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 5, NodeState::Member, Some(addr(2)));
        reg.add_or_update("node-c", 3, 1, 5, NodeState::Dead, Some(addr(3)));

        reg.cap_expected_votes(2);
        assert_eq!(reg.get(2).unwrap().expected_votes, 2);
        assert_eq!(reg.get(3).unwrap().expected_votes, 5);
    }

    #[test]
    fn view_entries_include_member_and_dead() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));
        reg.add_or_update("node-c", 3, 1, 3, NodeState::Joining, Some(addr(3)));
        reg.mark_dead(2, LeaveReason::Dead);

        let entries = reg.view_entries();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["node-a", "node-b"]);
    }

    #[test]
    fn check_view_agrees_with_itself() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));

        let entries = reg.view_entries();
        assert_eq!(reg.check_view(&entries), Some(2));
    }

    #[test]
    fn check_view_detects_vote_mismatch() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));

        let mut entries = reg.view_entries();
        entries[1].votes = 3;
        assert_eq!(reg.check_view(&entries), None);
    }

    #[test]
    fn apply_view_creates_missing_nodes() {
        let mut reg = NodeRegistry::new();
        reg.prime_local("node-d", 0, 1, 3, vec![addr(4)], NodeState::Joining);

        let entries = vec![
            NodeEntry {
                name: "node-a".into(),
                state: NodeState::Member,
                addresses: vec![addr(1)],
                votes: 1,
                expected_votes: 3,
                node_id: 1,
            },
            NodeEntry {
                name: "node-b".into(),
                state: NodeState::Dead,
                addresses: vec![addr(2)],
                votes: 1,
                expected_votes: 3,
                node_id: 2,
            },
        ];
        reg.apply_view(&entries);

        assert_eq!(reg.node_count(), 3);
        assert_eq!(reg.get(1).unwrap().state, NodeState::Member);
        assert_eq!(reg.get(2).unwrap().state, NodeState::Dead);
        assert_eq!(reg.member_count(), 1);
    }

    #[test]
    fn set_port_updates_bitmap() {
        let mut reg = primed();
        reg.add_or_update("node-b", 2, 1, 3, NodeState::Member, Some(addr(2)));

        reg.set_port(2, 11, true);
        assert!(reg.get(2).unwrap().ports.get(11));
        reg.set_port(2, 11, false);
        assert!(!reg.get(2).unwrap().ports.get(11));
    }
}
