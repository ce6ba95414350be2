//! # Transition Classifier
//!
//! Pure edge detection for one claim record: given the previous snapshot
//! (if any) and the current observation, name what happened and decide which
//! deferred mutation, if any, it calls for. No I/O, no shared state.
//!
//! Ownership transitions are authoritative. Link transitions are reported
//! for audit only; a link change never creates or removes a guard by itself.

use crate::config::ReassignmentPolicy;
use crate::model::{GuardId, Link, OwnerId, PartitionKey};
use crate::snapshot::Snapshot;

/// What the scanner read from a claim record this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub owner: Option<OwnerId>,
    pub link: Option<Link>,
}

impl Observation {
    pub fn guard(&self) -> Option<GuardId> {
        self.link.and_then(|link| link.guard)
    }
}

/// A named edge in a record's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First sighting while loaded, in a consistent state.
    FirstSeen {
        owner: Option<OwnerId>,
        guard: Option<GuardId>,
    },
    /// First sighting of an owned record with no guard linked. Usually means
    /// a creation was lost (crash, unload mid-flush).
    FirstSeenUnlinked { owner: OwnerId },
    Claimed { owner: OwnerId },
    Unclaimed { previous_owner: OwnerId },
    Reassigned { from: OwnerId, to: OwnerId },
    Linked { guard: GuardId },
    Unlinked { previous: GuardId },
    Relinked { from: GuardId, to: GuardId },
    /// The record vanished from a partition that stayed loaded.
    Removed {
        owner: Option<OwnerId>,
        guard: Option<GuardId>,
    },
}

impl Transition {
    /// Stable event name used in structured logs.
    pub fn name(&self) -> &'static str {
        match self {
            Transition::FirstSeen { .. } => "claim_first_seen",
            Transition::FirstSeenUnlinked { .. } => "claim_first_seen_unlinked",
            Transition::Claimed { .. } => "claim",
            Transition::Unclaimed { .. } => "unclaim",
            Transition::Reassigned { .. } => "reassign",
            Transition::Linked { .. } => "link",
            Transition::Unlinked { .. } => "unlink",
            Transition::Relinked { .. } => "relink",
            Transition::Removed { .. } => "removed",
        }
    }
}

/// Deferred mutation the transition calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    None,
    /// Create a guard for `owner` unless one is already live.
    Create { owner: OwnerId },
    /// Destroy `guard` (if any) and optionally clear the record's link.
    Remove {
        guard: Option<GuardId>,
        clear_link: bool,
    },
    /// Replace `old_guard` with a fresh guard for `owner`.
    Relink {
        old_guard: Option<GuardId>,
        owner: OwnerId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub transitions: Vec<Transition>,
    pub directive: Directive,
    /// New snapshot to store, when anything changed.
    pub snapshot: Option<Snapshot>,
}

/// Classify an observation of a record that is present in its partition.
/// A previous snapshot taken in another partition belongs to an earlier
/// holder of the identity and is ignored.
pub fn classify(
    previous: Option<&Snapshot>,
    observed: Observation,
    partition: PartitionKey,
    policy: ReassignmentPolicy,
) -> Classification {
    let guard = observed.guard();
    let current = Snapshot {
        owner: observed.owner,
        guard,
        partition,
    };

    let Some(prev) = previous.filter(|prev| prev.partition == partition) else {
        let (transition, directive) = match (observed.owner, guard) {
            (Some(owner), None) => (
                Transition::FirstSeenUnlinked { owner },
                Directive::Create { owner },
            ),
            (owner, guard) => (Transition::FirstSeen { owner, guard }, Directive::None),
        };
        return Classification {
            transitions: vec![transition],
            directive,
            snapshot: Some(current),
        };
    };

    let mut transitions = Vec::new();
    let mut directive = Directive::None;

    if prev.owner != observed.owner {
        match (prev.owner, observed.owner) {
            (None, Some(owner)) => {
                transitions.push(Transition::Claimed { owner });
                if guard.is_none() {
                    directive = Directive::Create { owner };
                }
            }
            (Some(previous_owner), None) => {
                transitions.push(Transition::Unclaimed { previous_owner });
                let stale = guard.or(prev.guard);
                directive = Directive::Remove {
                    guard: stale,
                    clear_link: observed.link.is_some() || stale.is_some(),
                };
            }
            (Some(from), Some(to)) => {
                transitions.push(Transition::Reassigned { from, to });
                if policy == ReassignmentPolicy::Recreate {
                    directive = Directive::Relink {
                        old_guard: guard.or(prev.guard),
                        owner: to,
                    };
                }
            }
            (None, None) => unreachable!("owners compared unequal"),
        }
    }

    if prev.guard != guard {
        transitions.push(match (prev.guard, guard) {
            (None, Some(guard)) => Transition::Linked { guard },
            (Some(previous), None) => Transition::Unlinked { previous },
            (Some(from), Some(to)) => Transition::Relinked { from, to },
            (None, None) => unreachable!("guards compared unequal"),
        });
    }

    let snapshot = (current != *prev).then_some(current);
    Classification {
        transitions,
        directive,
        snapshot,
    }
}

/// Classify a record that was present on the previous pass and is gone now.
/// The caller deletes the snapshot.
pub fn classify_removal(last: &Snapshot) -> Classification {
    Classification {
        transitions: vec![Transition::Removed {
            owner: last.owner,
            guard: last.guard,
        }],
        directive: match last.guard {
            Some(guard) => Directive::Remove {
                guard: Some(guard),
                clear_link: false,
            },
            None => Directive::None,
        },
        snapshot: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: PartitionKey = PartitionKey(1);

    fn obs(owner: Option<OwnerId>, guard: Option<GuardId>) -> Observation {
        Observation {
            owner,
            link: guard.map(|g| Link {
                owner,
                guard: Some(g),
            }),
        }
    }

    fn snap(owner: Option<OwnerId>, guard: Option<GuardId>) -> Snapshot {
        Snapshot {
            owner,
            guard,
            partition: P,
        }
    }

    fn keep(prev: Option<&Snapshot>, observed: Observation) -> Classification {
        classify(prev, observed, P, ReassignmentPolicy::Keep)
    }

    #[test]
    fn first_sighting_of_unclaimed_record_is_quiet() {
        let c = keep(None, obs(None, None));
        assert_eq!(c.directive, Directive::None);
        assert_eq!(c.snapshot, Some(snap(None, None)));
        assert!(matches!(c.transitions[..], [Transition::FirstSeen { .. }]));
    }

    #[test]
    fn first_sighting_of_owned_unlinked_record_is_degraded_and_creates() {
        let owner = OwnerId::random();
        let c = keep(None, obs(Some(owner), None));
        assert_eq!(c.directive, Directive::Create { owner });
        assert_eq!(c.transitions, vec![Transition::FirstSeenUnlinked { owner }]);
    }

    #[test]
    fn first_sighting_of_owned_linked_record_trusts_the_link() {
        let owner = OwnerId::random();
        let guard = GuardId::random();
        let c = keep(None, obs(Some(owner), Some(guard)));
        assert_eq!(c.directive, Directive::None);
        assert_eq!(c.snapshot, Some(snap(Some(owner), Some(guard))));
    }

    #[test]
    fn claim_without_guard_requests_creation() {
        let owner = OwnerId::random();
        let prev = snap(None, None);
        let c = keep(Some(&prev), obs(Some(owner), None));
        assert_eq!(c.transitions, vec![Transition::Claimed { owner }]);
        assert_eq!(c.directive, Directive::Create { owner });
        assert_eq!(c.snapshot, Some(snap(Some(owner), None)));
    }

    #[test]
    fn claim_with_guard_already_linked_does_nothing() {
        let owner = OwnerId::random();
        let guard = GuardId::random();
        let prev = snap(None, Some(guard));
        let c = keep(Some(&prev), obs(Some(owner), Some(guard)));
        assert_eq!(c.directive, Directive::None);
    }

    #[test]
    fn unclaim_removes_linked_guard_and_clears_link() {
        let owner = OwnerId::random();
        let guard = GuardId::random();
        let prev = snap(Some(owner), Some(guard));
        let c = keep(Some(&prev), obs(None, Some(guard)));
        assert_eq!(
            c.transitions,
            vec![Transition::Unclaimed {
                previous_owner: owner
            }]
        );
        assert_eq!(
            c.directive,
            Directive::Remove {
                guard: Some(guard),
                clear_link: true
            }
        );
    }

    #[test]
    fn unclaim_falls_back_to_snapshot_guard_when_link_already_gone() {
        let owner = OwnerId::random();
        let guard = GuardId::random();
        let prev = snap(Some(owner), Some(guard));
        let c = keep(Some(&prev), obs(None, None));
        assert_eq!(
            c.directive,
            Directive::Remove {
                guard: Some(guard),
                clear_link: true
            }
        );
        assert!(c
            .transitions
            .contains(&Transition::Unlinked { previous: guard }));
    }

    #[test]
    fn reassignment_keeps_guard_under_keep_policy() {
        let (a, b) = (OwnerId::random(), OwnerId::random());
        let guard = GuardId::random();
        let prev = snap(Some(a), Some(guard));
        let c = keep(Some(&prev), obs(Some(b), Some(guard)));
        assert_eq!(c.transitions, vec![Transition::Reassigned { from: a, to: b }]);
        assert_eq!(c.directive, Directive::None);
        assert_eq!(c.snapshot, Some(snap(Some(b), Some(guard))));
    }

    #[test]
    fn reassignment_relinks_under_recreate_policy() {
        let (a, b) = (OwnerId::random(), OwnerId::random());
        let guard = GuardId::random();
        let prev = snap(Some(a), Some(guard));
        let c = classify(
            Some(&prev),
            obs(Some(b), Some(guard)),
            P,
            ReassignmentPolicy::Recreate,
        );
        assert_eq!(
            c.directive,
            Directive::Relink {
                old_guard: Some(guard),
                owner: b
            }
        );
    }

    #[test]
    fn link_changes_are_reported_but_not_acted_on() {
        let owner = OwnerId::random();
        let (g1, g2) = (GuardId::random(), GuardId::random());

        let c = keep(Some(&snap(Some(owner), None)), obs(Some(owner), Some(g1)));
        assert_eq!(c.transitions, vec![Transition::Linked { guard: g1 }]);
        assert_eq!(c.directive, Directive::None);

        let c = keep(Some(&snap(Some(owner), Some(g1))), obs(Some(owner), Some(g2)));
        assert_eq!(c.transitions, vec![Transition::Relinked { from: g1, to: g2 }]);
        assert_eq!(c.directive, Directive::None);

        let c = keep(Some(&snap(Some(owner), Some(g1))), obs(Some(owner), None));
        assert_eq!(c.transitions, vec![Transition::Unlinked { previous: g1 }]);
        assert_eq!(c.directive, Directive::None);
    }

    #[test]
    fn unchanged_record_produces_nothing() {
        let owner = OwnerId::random();
        let guard = GuardId::random();
        let prev = snap(Some(owner), Some(guard));
        let c = keep(Some(&prev), obs(Some(owner), Some(guard)));
        assert!(c.transitions.is_empty());
        assert_eq!(c.directive, Directive::None);
        assert_eq!(c.snapshot, None);
    }

    #[test]
    fn snapshot_from_another_partition_counts_as_first_sighting() {
        let (a, b) = (OwnerId::random(), OwnerId::random());
        let (g1, g2) = (GuardId::random(), GuardId::random());
        let elsewhere = Snapshot {
            owner: Some(a),
            guard: Some(g1),
            partition: PartitionKey(9),
        };
        let c = classify(
            Some(&elsewhere),
            obs(Some(b), Some(g2)),
            P,
            ReassignmentPolicy::Recreate,
        );
        assert_eq!(
            c.transitions,
            vec![Transition::FirstSeen {
                owner: Some(b),
                guard: Some(g2)
            }]
        );
        assert_eq!(c.directive, Directive::None);
        assert_eq!(c.snapshot, Some(snap(Some(b), Some(g2))));
    }

    #[test]
    fn removal_requests_guard_removal_regardless_of_owner() {
        let guard = GuardId::random();
        let c = classify_removal(&snap(None, Some(guard)));
        assert_eq!(
            c.directive,
            Directive::Remove {
                guard: Some(guard),
                clear_link: false
            }
        );

        let c = classify_removal(&snap(Some(OwnerId::random()), None));
        assert_eq!(c.directive, Directive::None);
    }
}
