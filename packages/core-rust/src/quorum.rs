//! Quorum arithmetic.
//!
//! The formula is the OpenVMS cluster one: quorum is the larger of
//! `(expected + 2) / 2` and `(total + 2) / 2`, never decreasing on its own.
//! Keeping it pure makes the monotonicity property directly testable; the
//! runtime feeds it member votes and applies the result.

/// Inputs to a quorum computation, gathered from the current member set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTally {
    /// Sum of votes of all MEMBER nodes, plus the quorum device if present
    /// and alive.
    pub total_votes: u32,
    /// Highest expected_votes across MEMBER nodes.
    pub highest_expected: u32,
}

/// Outcome of a quorum computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumResult {
    pub quorum: u32,
    pub total_votes: u32,
    pub quorate: bool,
}

/// Computes the new quorum value.
///
/// `max_expected` overrides the tallied expected votes when non-zero (used
/// by set-expected-votes). `previous` is the quorum currently in force;
/// unless `allow_decrease` is set the result never drops below it. Two-node
/// mode forces quorum to 1 regardless.
#[must_use]
pub fn calculate_quorum(
    tally: VoteTally,
    max_expected: u32,
    previous: u32,
    allow_decrease: bool,
    two_node: bool,
) -> QuorumResult {
    let expected = if max_expected > 0 {
        max_expected
    } else {
        tally.highest_expected
    };

    let q1 = (expected + 2) / 2;
    let q2 = (tally.total_votes + 2) / 2;
    let mut quorum = q1.max(q2);

    if !allow_decrease {
        quorum = quorum.max(previous);
    }

    if two_node {
        quorum = 1;
    }

    QuorumResult {
        quorum,
        total_votes: tally.total_votes,
        quorate: tally.total_votes >= quorum,
    }
}

/// Validity check applied before an operator-driven votes/expected change:
/// the resulting quorum must still be reachable and meaningful.
#[must_use]
pub fn sane_quorum(quorum: u32, total_votes: u32) -> bool {
    quorum >= total_votes / 2 && quorum <= total_votes
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quorum_of(total: u32, expected: u32) -> QuorumResult {
        calculate_quorum(
            VoteTally {
                total_votes: total,
                highest_expected: expected,
            },
            0,
            0,
            true,
            false,
        )
    }

    #[test]
    fn three_nodes_one_vote_each() {
        let r = quorum_of(3, 3);
        assert_eq!(r.quorum, 2);
        assert!(r.quorate);
    }

    #[test]
    fn three_node_cluster_with_one_dead() {
        // Two members left, expected still 3: quorum stays at 2 and the
        // cluster remains quorate.
        let r = quorum_of(2, 3);
        assert_eq!(r.quorum, 2);
        assert!(r.quorate);
    }

    #[test]
    fn lone_survivor_of_three_is_inquorate() {
        let r = quorum_of(1, 3);
        assert_eq!(r.quorum, 2);
        assert!(!r.quorate);
    }

    #[test]
    fn two_node_mode_forces_quorum_one() {
        let r = calculate_quorum(
            VoteTally {
                total_votes: 2,
                highest_expected: 1,
            },
            0,
            0,
            false,
            true,
        );
        assert_eq!(r.quorum, 1);
        assert!(r.quorate);

        // One node dies; the survivor is still quorate.
        let r = calculate_quorum(
            VoteTally {
                total_votes: 1,
                highest_expected: 1,
            },
            0,
            r.quorum,
            false,
            true,
        );
        assert_eq!(r.quorum, 1);
        assert!(r.quorate);
    }

    #[test]
    fn quorum_never_decreases_without_permission() {
        let first = quorum_of(5, 5);
        assert_eq!(first.quorum, 3);

        // Members leave, expected tracked down; without allow_decrease the
        // quorum is clamped to its previous value.
        let clamped = calculate_quorum(
            VoteTally {
                total_votes: 2,
                highest_expected: 2,
            },
            0,
            first.quorum,
            false,
            false,
        );
        assert_eq!(clamped.quorum, 3);
        assert!(!clamped.quorate);

        let lowered = calculate_quorum(
            VoteTally {
                total_votes: 2,
                highest_expected: 2,
            },
            0,
            first.quorum,
            true,
            false,
        );
        assert_eq!(lowered.quorum, 2);
        assert!(lowered.quorate);
    }

    #[test]
    fn max_expected_overrides_tally() {
        let r = calculate_quorum(
            VoteTally {
                total_votes: 3,
                highest_expected: 3,
            },
            5,
            0,
            true,
            false,
        );
        assert_eq!(r.quorum, 3);
    }

    #[test]
    fn device_votes_counted_by_caller() {
        // The tally already includes the quorum device; a 2-node cluster
        // with a 1-vote device behaves like a 3-vote cluster.
        let r = quorum_of(3, 3);
        assert_eq!(r.quorum, 2);
    }

    #[test]
    fn sane_quorum_bounds() {
        assert!(sane_quorum(2, 3));
        assert!(!sane_quorum(1, 6));
        assert!(!sane_quorum(7, 6));
    }

    proptest! {
        // Adding a member's vote can never lower the computed quorum.
        #[test]
        fn quorum_monotone_in_total_votes(total in 1u32..200, expected in 1u32..200) {
            let base = quorum_of(total, expected);
            let more = quorum_of(total + 1, expected);
            prop_assert!(more.quorum >= base.quorum);
        }

        // With the clamp in force the quorum is monotone across any
        // sequence of recomputations.
        #[test]
        fn clamp_prevents_decrease(
            totals in proptest::collection::vec(1u32..100, 1..20),
            expected in 1u32..100,
        ) {
            let mut previous = 0;
            for t in totals {
                let r = calculate_quorum(
                    VoteTally { total_votes: t, highest_expected: expected },
                    0,
                    previous,
                    false,
                    false,
                );
                prop_assert!(r.quorum >= previous);
                previous = r.quorum;
            }
        }

        // Quorate always means at least half of the expected votes are
        // present (the split-brain guarantee), except in two-node mode.
        #[test]
        fn quorate_majority(total in 1u32..200, expected in 1u32..200) {
            let r = quorum_of(total, expected);
            if r.quorate {
                prop_assert!(2 * total + 2 >= expected);
            }
        }
    }
}
