//! A debug-only cross-validator for the nodelist's invariants.
//!
//! Nothing here runs in release builds: [`check`] exists to catch
//! reconciler bugs in tests and debug binaries, the same role
//! `debug_assert!` plays elsewhere in this crate, just with assertions
//! broad enough to need their own module.

use std::collections::HashSet;

use crate::doc::{Consensus, Flavor};
use crate::nodelist::NodeList;
use crate::traits::MicrodescCache;

/// One violation of an invariant found by [`check`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Violation {
    /// A node's cached sequence index doesn't match its actual position.
    #[error("node {0} has index {1} but isn't at that position in the sequence")]
    BadIndex(String, usize),
    /// A node has an `rs` that doesn't belong to the current consensus.
    #[error("node {0} has a stale rs not present in the current consensus")]
    StaleRs(String),
    /// A node is missing an `md` that the microdesc cache has for its `rs`.
    #[error("node {0} should have md {1:x?} attached but doesn't")]
    MissingMd(String, [u8; 32]),
    /// A microdescriptor's refcount doesn't match the number of nodes
    /// actually holding it.
    #[error("md {0:x?} reports held_by_nodes = {1} but {2} node(s) hold it")]
    BadMdRefcount([u8; 32], u32, u32),
    /// A node has neither `ri` nor `rs` (invariant 1).
    #[error("node {0} is unbacked (no ri, no rs)")]
    Unbacked(String),
}

/// Cross-validate `nodes` against `consensus` and, if the consensus is
/// microdesc-flavored, `cache`.
///
/// Returns every violation found; an empty vector means the nodelist is
/// internally consistent.
pub fn check(nodes: &NodeList, consensus: Option<&Consensus>, cache: &dyn MicrodescCache) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (i, node) in nodes.iter().enumerate() {
        if node.idx().map(usize::from) != Some(i) {
            violations.push(Violation::BadIndex(format!("{}", node.identity()), i));
        }
        if node.ri().is_none() && node.rs().is_none() {
            violations.push(Violation::Unbacked(format!("{}", node.identity())));
        }
    }

    if let Some(consensus) = consensus {
        let known: HashSet<_> = consensus.routerstatuses.iter().map(|rs| rs.identity).collect();
        for node in nodes.iter() {
            if let Some(rs) = node.rs() {
                if !known.contains(&rs.identity) {
                    violations.push(Violation::StaleRs(format!("{}", node.identity())));
                }
            }
            if consensus.flavor == Flavor::Microdesc {
                if let Some(rs) = node.rs() {
                    if node.md().is_none() {
                        if cache.lookup_by_digest(&rs.descriptor_digest).is_some() {
                            violations.push(Violation::MissingMd(
                                format!("{}", node.identity()),
                                rs.descriptor_digest,
                            ));
                        }
                    }
                }
            }
        }
    }

    let mut holders: std::collections::HashMap<[u8; 32], u32> = std::collections::HashMap::new();
    let mut reported: std::collections::HashMap<[u8; 32], u32> = std::collections::HashMap::new();
    for node in nodes.iter() {
        if let Some(md) = node.md() {
            *holders.entry(md.digest).or_insert(0) += 1;
            reported.insert(md.digest, md.held_by_nodes());
        }
    }
    for (digest, actual) in holders {
        let claimed = reported.get(&digest).copied().unwrap_or(0);
        if claimed != actual {
            violations.push(Violation::BadMdRefcount(digest, claimed, actual));
        }
    }

    violations
}
