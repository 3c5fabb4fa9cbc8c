//! Family resolution: deciding which nodes should be treated as operated by
//! the same entity, and so avoided in the same circuit.
//!
//! Three independent signals feed into this, all union'd together (see the
//! crate-level docs): address proximity, *mutual* declared family, and an
//! operator- or controller-declared family set that overrides the other two.

use std::net::IpAddr;
use std::rc::Rc;

use crate::doc::Consensus;
use crate::node::Node;

/// Configures how aggressively two relays' addresses are treated as
/// "the same family" by proximity alone.
///
/// Adapted from `tor-netdir`'s subnet-based family heuristic: two relays
/// with IPv4 addresses in the same `/subnets_family_v4` are presumed
/// related, likewise for IPv6 and `/subnets_family_v6`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubnetConfig {
    /// Prefix length, in bits, for considering two IPv4 addresses related.
    ///
    /// `0` treats every IPv4 address as related; values above 32 disable the
    /// IPv4 check entirely.
    subnets_family_v4: u8,
    /// Prefix length, in bits, for considering two IPv6 addresses related.
    ///
    /// `0` treats every IPv6 address as related; values above 128 disable
    /// the IPv6 check entirely.
    subnets_family_v6: u8,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self::new(16, 32)
    }
}

impl SubnetConfig {
    /// Construct a subnet configuration from a pair of bit-prefix lengths.
    pub fn new(subnets_family_v4: u8, subnets_family_v6: u8) -> Self {
        SubnetConfig {
            subnets_family_v4,
            subnets_family_v6,
        }
    }

    /// Return true if `a` and `b` fall in the same subnet under this config.
    pub fn addrs_in_same_subnet(&self, a: &IpAddr, b: &IpAddr) -> bool {
        match (a, b) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let bits = self.subnets_family_v4;
                if bits > 32 {
                    return false;
                }
                if bits == 0 {
                    return true;
                }
                let a = u32::from_be_bytes(a.octets());
                let b = u32::from_be_bytes(b.octets());
                (a >> (32 - bits)) == (b >> (32 - bits))
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let bits = self.subnets_family_v6;
                if bits > 128 {
                    return false;
                }
                if bits == 0 {
                    return true;
                }
                let a = u128::from_be_bytes(a.octets());
                let b = u128::from_be_bytes(b.octets());
                (a >> (128 - bits)) == (b >> (128 - bits))
            }
            _ => false,
        }
    }

    /// Return true if any address of `a` shares a subnet with any address of `b`.
    pub fn any_addrs_in_same_subnet(&self, a: &Node, b: &Node) -> bool {
        a.all_orports().iter().any(|aa| {
            b.all_orports()
                .iter()
                .any(|bb| self.addrs_in_same_subnet(&aa.ip(), &bb.ip()))
        })
    }
}

/// Return true if `a` and `b` declare each other as family.
///
/// A relay's own declaration isn't trusted unless it's reciprocated: this is
/// the "mutual declared family" rule. A node is always considered to be in
/// its own family.
///
/// A declaration naming the other party by `$hex` identity is always
/// honored. A declaration naming it by bare nickname only counts if
/// `consensus` binds that nickname to the other party's identity ("Named");
/// an unauthenticated nickname collision between two unrelated relays must
/// not be enough to group them.
pub fn mutually_declared_family(a: &Node, b: &Node, consensus: Option<&Consensus>) -> bool {
    if a.identity() == b.identity() {
        return true;
    }
    let declares = |x: &Node, y: &Node| -> bool {
        let y_id_hex = format!("${}", y.identity());
        x.declared_family().iter().any(|tok| {
            if tok == &y_id_hex {
                return true;
            }
            consensus
                .map(|c| c.binding_for(tok) == Some(y.identity()))
                .unwrap_or(false)
        })
    };
    declares(a, b) && declares(b, a)
}

/// Return true if `a` and `b` should be treated as the same family, given
/// address proximity, mutual declaration, and any operator- or
/// controller-declared override sets.
///
/// `declared_sets` overrides the other two signals: if both identities
/// appear together in any one set, they're family regardless of what their
/// descriptors say (and conversely, membership in disjoint sets does not by
/// itself *rule out* family by the other signals).
pub fn in_same_family(
    a: &Node,
    b: &Node,
    subnet_config: &SubnetConfig,
    declared_sets: &[Vec<Rc<Node>>],
    consensus: Option<&Consensus>,
) -> bool {
    if a.identity() == b.identity() {
        return true;
    }
    if mutually_declared_family(a, b, consensus) {
        return true;
    }
    if subnet_config.any_addrs_in_same_subnet(a, b) {
        return true;
    }
    declared_sets.iter().any(|set| {
        let has_a = set.iter().any(|n| n.identity() == a.identity());
        let has_b = set.iter().any(|n| n.identity() == b.identity());
        has_a && has_b
    })
}

/// An operator- or controller-declared family set: a group of nodes to be
/// treated as mutually related regardless of what their own descriptors say.
///
/// Built incrementally via [`FamilySets::add_node_and_family`] as each
/// node's family is resolved, so that a chain of declarations (A declares B,
/// B declares C) ends up in one set rather than two overlapping ones.
#[derive(Debug, Default)]
pub struct FamilySets {
    sets: Vec<Vec<Rc<Node>>>,
}

impl FamilySets {
    /// Construct an empty collection of declared family sets.
    pub fn new() -> Self {
        FamilySets { sets: Vec::new() }
    }

    /// Current declared sets, for use with [`in_same_family`].
    pub fn sets(&self) -> &[Vec<Rc<Node>>] {
        &self.sets
    }

    /// Add `node` to the family set built from its own declared-family list
    /// plus `candidates`, merging with any existing set that already
    /// contains one of these nodes.
    ///
    /// `candidates` is the pool of currently known nodes to search for
    /// matches; this function only adds nodes that mutually declare family
    /// with `node` (or that are already grouped with one that does).
    pub fn add_node_and_family(
        &mut self,
        node: &Rc<Node>,
        candidates: &[Rc<Node>],
        consensus: Option<&Consensus>,
    ) {
        let mut group: Vec<Rc<Node>> = vec![Rc::clone(node)];
        for cand in candidates {
            if cand.identity() != node.identity() && mutually_declared_family(node, cand, consensus) {
                group.push(Rc::clone(cand));
            }
        }
        if group.len() == 1 {
            return;
        }

        let group_ids: Vec<_> = group.iter().map(|n| n.identity()).collect();
        let mut merged_into: Option<usize> = None;
        for (i, set) in self.sets.iter_mut().enumerate() {
            if set
                .iter()
                .any(|n| group_ids.contains(&n.identity()))
            {
                for g in &group {
                    if !set.iter().any(|n| n.identity() == g.identity()) {
                        set.push(Rc::clone(g));
                    }
                }
                merged_into = Some(i);
                break;
            }
        }
        if merged_into.is_none() {
            self.sets.push(group);
        }
    }
}
