//! In-process group transport.
//!
//! A hub owns the member list and a single sequencer lock; every multicast
//! fans out to all members under that lock, which is what makes the order
//! total. Tests use the hub to run several membership cores in one process
//! and to simulate crashes with [`LoopbackHub::kill`].
//!
//! SAFE delivery degrades to AGREED here: with every member sharing one
//! address space there is no window where a message is delivered to some
//! members and lost to others.

use std::sync::Arc;

use bytes::Bytes;
use memberd_core::NodeAddress;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ConfChange, ConfChangeKind, DeliveryMode, GroupTransport, TransportError, TransportEvent,
};

struct Member {
    addr: NodeAddress,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

struct HubInner {
    ring_seq: u64,
    members: Vec<Member>,
}

impl HubInner {
    fn member_addrs(&self) -> Vec<NodeAddress> {
        self.members.iter().map(|m| m.addr.clone()).collect()
    }

    fn broadcast(&self, event: &TransportEvent) {
        for member in &self.members {
            // A dropped receiver means that node crashed; nothing to do.
            let _ = member.tx.send(event.clone());
        }
    }

    fn view_change(&mut self, left: Vec<NodeAddress>, joined: Vec<NodeAddress>) {
        self.ring_seq += 1;
        let change = ConfChange {
            kind: ConfChangeKind::Regular,
            members: self.member_addrs(),
            left,
            joined,
            ring_seq: self.ring_seq,
        };
        self.broadcast(&TransportEvent::ConfChange(change));
    }
}

/// The shared sequencer all loopback transports of one "network" hang off.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                ring_seq: 0,
                members: Vec::new(),
            })),
        }
    }

    /// Adds a member and returns its transport handle plus the event stream
    /// the core should consume. The join is announced to every member,
    /// the newcomer included.
    #[must_use]
    pub fn join(
        &self,
        addr: NodeAddress,
    ) -> (LoopbackTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.members.push(Member {
            addr: addr.clone(),
            tx,
        });
        inner.view_change(vec![], vec![addr.clone()]);
        debug!(ring_seq = inner.ring_seq, "loopback member joined");

        (
            LoopbackTransport {
                inner: Arc::clone(&self.inner),
                addr,
            },
            rx,
        )
    }

    /// Simulates an abrupt crash: the member vanishes without a final event
    /// of its own and the survivors see it in the `left` set.
    pub fn kill(&self, addr: &NodeAddress) {
        let mut inner = self.inner.lock();
        let before = inner.members.len();
        inner.members.retain(|m| !m.addr.eq_ignore_family(addr));
        if inner.members.len() != before {
            inner.view_change(vec![addr.clone()], vec![]);
        }
    }

    /// Current ring sequence, for assertions in tests.
    #[must_use]
    pub fn ring_seq(&self) -> u64 {
        self.inner.lock().ring_seq
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's handle onto the hub.
pub struct LoopbackTransport {
    inner: Arc<Mutex<HubInner>>,
    addr: NodeAddress,
}

impl GroupTransport for LoopbackTransport {
    fn multicast(&self, payload: Bytes, _mode: DeliveryMode) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        if !inner.members.iter().any(|m| m.addr.eq_ignore_family(&self.addr)) {
            return Err(TransportError::Closed);
        }
        inner.broadcast(&TransportEvent::Deliver {
            source: self.addr.clone(),
            payload,
            endian_swap: false,
        });
        Ok(())
    }

    fn leave(&self) {
        let mut inner = self.inner.lock();
        let before = inner.members.len();
        inner
            .members
            .retain(|m| !m.addr.eq_ignore_family(&self.addr));
        if inner.members.len() != before {
            inner.view_change(vec![self.addr.clone()], vec![]);
        }
    }

    fn local_address(&self) -> NodeAddress {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> NodeAddress {
        let mut bytes = vec![2, 0];
        bytes.extend_from_slice(&[10, 0, 0, last]);
        bytes.resize(18, 0);
        NodeAddress::new(bytes)
    }

    fn payloads(events: &[TransportEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Deliver { payload, .. } => Some(payload.to_vec()),
                TransportEvent::ConfChange(_) => None,
            })
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn join_announces_view_to_everyone() {
        let hub = LoopbackHub::new();
        let (_ta, mut ra) = hub.join(addr(1));
        let (_tb, mut rb) = hub.join(addr(2));

        let a_events = drain(&mut ra);
        // A sees its own join and then B's join.
        assert_eq!(a_events.len(), 2);
        if let TransportEvent::ConfChange(change) = &a_events[1] {
            assert_eq!(change.members.len(), 2);
            assert_eq!(change.joined, vec![addr(2)]);
            assert_eq!(change.ring_seq, 2);
        } else {
            unreachable!();
        }

        let b_events = drain(&mut rb);
        assert_eq!(b_events.len(), 1);
    }

    #[tokio::test]
    async fn multicast_reaches_all_members_in_identical_order() {
        let hub = LoopbackHub::new();
        let (ta, mut ra) = hub.join(addr(1));
        let (tb, mut rb) = hub.join(addr(2));
        let (_tc, mut rc) = hub.join(addr(3));

        ta.multicast(Bytes::from_static(b"one"), DeliveryMode::Agreed)
            .unwrap();
        tb.multicast(Bytes::from_static(b"two"), DeliveryMode::Safe)
            .unwrap();
        ta.multicast(Bytes::from_static(b"three"), DeliveryMode::Agreed)
            .unwrap();

        let pa = payloads(&drain(&mut ra));
        let pb = payloads(&drain(&mut rb));
        let pc = payloads(&drain(&mut rc));
        assert_eq!(pa, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(pa, pb);
        assert_eq!(pa, pc);
    }

    #[tokio::test]
    async fn sender_receives_its_own_messages() {
        let hub = LoopbackHub::new();
        let (ta, mut ra) = hub.join(addr(1));
        ta.multicast(Bytes::from_static(b"echo"), DeliveryMode::Agreed)
            .unwrap();
        let got = payloads(&drain(&mut ra));
        assert_eq!(got, vec![b"echo".to_vec()]);
    }

    #[tokio::test]
    async fn kill_removes_member_and_notifies_survivors() {
        let hub = LoopbackHub::new();
        let (ta, mut ra) = hub.join(addr(1));
        let (tb, _rb) = hub.join(addr(2));
        drain(&mut ra);

        hub.kill(&addr(2));

        let events = drain(&mut ra);
        assert_eq!(events.len(), 1);
        if let TransportEvent::ConfChange(change) = &events[0] {
            assert_eq!(change.left, vec![addr(2)]);
            assert!(!change.contains(&addr(2)));
            assert!(change.contains(&addr(1)));
        } else {
            unreachable!();
        }

        // The dead member's handle is cut off.
        assert_eq!(
            tb.multicast(Bytes::from_static(b"x"), DeliveryMode::Agreed),
            Err(TransportError::Closed)
        );
        // Survivors keep working.
        ta.multicast(Bytes::from_static(b"y"), DeliveryMode::Agreed)
            .unwrap();
    }

    #[tokio::test]
    async fn leave_is_voluntary_kill() {
        let hub = LoopbackHub::new();
        let (ta, _ra) = hub.join(addr(1));
        let (tb, mut rb) = hub.join(addr(2));
        drain(&mut rb);

        ta.leave();
        let events = drain(&mut rb);
        assert_eq!(events.len(), 1);
        if let TransportEvent::ConfChange(change) = &events[0] {
            assert_eq!(change.left, vec![addr(1)]);
            assert_eq!(change.members.len(), 1);
        } else {
            unreachable!();
        }
    }

    #[tokio::test]
    async fn ring_seq_is_monotone() {
        let hub = LoopbackHub::new();
        assert_eq!(hub.ring_seq(), 0);
        let (_ta, _ra) = hub.join(addr(1));
        assert_eq!(hub.ring_seq(), 1);
        let (_tb, _rb) = hub.join(addr(2));
        assert_eq!(hub.ring_seq(), 2);
        hub.kill(&addr(1));
        assert_eq!(hub.ring_seq(), 3);
    }

    #[tokio::test]
    async fn conf_change_fences_deliveries() {
        // Messages sent before a membership change must be drained before
        // the change event on every receiver's stream.
        let hub = LoopbackHub::new();
        let (ta, _ra) = hub.join(addr(1));
        let (_tb, mut rb) = hub.join(addr(2));
        drain(&mut rb);

        ta.multicast(Bytes::from_static(b"before"), DeliveryMode::Agreed)
            .unwrap();
        hub.kill(&addr(1));

        let events = drain(&mut rb);
        assert!(matches!(events[0], TransportEvent::Deliver { .. }));
        assert!(matches!(events[1], TransportEvent::ConfChange(_)));
    }
}
