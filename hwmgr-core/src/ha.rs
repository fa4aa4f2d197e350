//! Active/backup role resolution.
//!
//! For a group, scan every known node across the cluster. One node
//! desiring ACTIVE and one desiring PASSIVE pair up; each gets its desired
//! role and the other as partner. Competing claimants are settled
//! deterministically: the lowest `(location_index, node_index)` keeps the
//! claim, the rest are demoted to NONE and left unpaired.

use smallvec::SmallVec;
use tracing::{info, warn};

use crate::ids::{LocationIndex, NodeIndex, NodeRole};

/// One node considered during resolution.
#[derive(Debug, Clone, Copy)]
pub struct HaCandidate {
    pub location: LocationIndex,
    pub node: NodeIndex,
    pub desired: NodeRole,
    pub current: NodeRole,
}

/// What the engine must apply after a resolution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaEffect {
    /// Set the node's resolved role and partner; publish a role update.
    Assign {
        node: NodeIndex,
        role: NodeRole,
        partner: Option<NodeIndex>,
    },
    /// A conflicting claimant lost the tie-break.
    Demote { node: NodeIndex },
}

pub type HaEffects = SmallVec<[HaEffect; 4]>;

/// Resolve one group. Candidates may be in any order; the outcome is a
/// pure function of the set.
#[must_use]
pub fn resolve_group(candidates: &[HaCandidate]) -> HaEffects {
    let mut effects = HaEffects::new();

    let mut actives: SmallVec<[&HaCandidate; 2]> = candidates
        .iter()
        .filter(|c| c.desired == NodeRole::Active)
        .collect();
    let mut passives: SmallVec<[&HaCandidate; 2]> = candidates
        .iter()
        .filter(|c| c.desired == NodeRole::Passive)
        .collect();

    actives.sort_by_key(|c| (c.location, c.node));
    passives.sort_by_key(|c| (c.location, c.node));

    for loser in actives.iter().skip(1) {
        warn!(node = %loser.node, "competing ACTIVE claim; demoting");
        effects.push(HaEffect::Demote { node: loser.node });
    }
    for loser in passives.iter().skip(1) {
        warn!(node = %loser.node, "competing PASSIVE claim; demoting");
        effects.push(HaEffect::Demote { node: loser.node });
    }

    let (active, passive) = (actives.first(), passives.first());
    if let (Some(active), Some(passive)) = (active, passive) {
        // Pair only when the assignment actually changes something, so a
        // re-run after a replay does not re-publish settled roles.
        if active.current != NodeRole::Active || passive.current != NodeRole::Passive {
            info!(active = %active.node, passive = %passive.node, "pairing active/backup");
            effects.push(HaEffect::Assign {
                node: active.node,
                role: NodeRole::Active,
                partner: Some(passive.node),
            });
            effects.push(HaEffect::Assign {
                node: passive.node,
                role: NodeRole::Passive,
                partner: Some(active.node),
            });
        }
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(loc: u32, node: u32, desired: NodeRole) -> HaCandidate {
        HaCandidate {
            location: LocationIndex(loc),
            node: NodeIndex(node),
            desired,
            current: NodeRole::None,
        }
    }

    #[test]
    fn one_active_one_passive_pair_up() {
        let effects = resolve_group(&[
            cand(1, 100, NodeRole::Active),
            cand(2, 101, NodeRole::Passive),
        ]);
        assert_eq!(
            effects.as_slice(),
            &[
                HaEffect::Assign {
                    node: NodeIndex(100),
                    role: NodeRole::Active,
                    partner: Some(NodeIndex(101)),
                },
                HaEffect::Assign {
                    node: NodeIndex(101),
                    role: NodeRole::Passive,
                    partner: Some(NodeIndex(100)),
                },
            ]
        );
    }

    #[test]
    fn lone_candidate_stays_unresolved() {
        let effects = resolve_group(&[cand(1, 100, NodeRole::Active)]);
        assert!(effects.is_empty());
    }

    #[test]
    fn tie_break_is_lexicographic() {
        let effects = resolve_group(&[
            cand(2, 50, NodeRole::Active),
            cand(1, 200, NodeRole::Active),
            cand(3, 60, NodeRole::Passive),
        ]);
        // Location 1 wins the claim despite its higher node index.
        assert!(effects.contains(&HaEffect::Demote { node: NodeIndex(50) }));
        assert!(effects.contains(&HaEffect::Assign {
            node: NodeIndex(200),
            role: NodeRole::Active,
            partner: Some(NodeIndex(60)),
        }));
    }

    #[test]
    fn settled_pair_is_not_republished() {
        let mut a = cand(1, 100, NodeRole::Active);
        let mut p = cand(2, 101, NodeRole::Passive);
        a.current = NodeRole::Active;
        p.current = NodeRole::Passive;
        assert!(resolve_group(&[a, p]).is_empty());
    }

    #[test]
    fn resolution_is_order_independent() {
        let forward = resolve_group(&[
            cand(1, 100, NodeRole::Active),
            cand(2, 101, NodeRole::Passive),
        ]);
        let reverse = resolve_group(&[
            cand(2, 101, NodeRole::Passive),
            cand(1, 100, NodeRole::Active),
        ]);
        assert_eq!(forward, reverse);
    }
}
