//! The identity index: a hash map from RSA identity digest to [`Node`],
//! paired with an append-and-swap-remove sequence for cache-friendly,
//! allocation-free iteration.
//!
//! The sequence/index split mirrors `tor-netdir`'s `RouterStatusIdx`
//! newtype-over-a-slice pattern, but here the index lives *inside* the
//! `Node` itself (see `Node::set_idx`) rather than being handed back to the
//! caller, since the reconciler needs O(1) removal by identity, not by
//! position.

use std::collections::HashMap;
use std::rc::Rc;

use tor_llcrypto::pk::rsa::RsaIdentity;

use crate::node::{Node, NodeIdx};

/// The nodelist: the single owner of every live [`Node`].
///
/// Single-threaded and cooperative (see the crate-level concurrency notes):
/// no method here suspends, and re-entrant mutation is not supported.
#[derive(Debug, Default)]
pub struct NodeList {
    /// Map from identity digest to the node's position in `seq`.
    by_id: HashMap<RsaIdentity, NodeIdx>,
    /// Every live node, in an order that's stable except across removals.
    seq: Vec<Rc<Node>>,
}

impl NodeList {
    /// Construct an empty nodelist.
    pub fn new() -> Self {
        NodeList {
            by_id: HashMap::new(),
            seq: Vec::new(),
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    /// True if there are no live nodes.
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Look up a node by identity digest.
    pub fn get(&self, id: &RsaIdentity) -> Option<Rc<Node>> {
        let idx = *self.by_id.get(id)?;
        Some(Rc::clone(&self.seq[usize::from(idx)]))
    }

    /// Look up a node by identity digest, creating a fresh, empty one if
    /// none exists yet.
    ///
    /// New nodes enter with `country` unset and every flag clear, per the
    /// identity index's documented contract.
    pub(crate) fn get_or_create(&mut self, id: RsaIdentity) -> Rc<Node> {
        if let Some(node) = self.get(&id) {
            return node;
        }
        let node = Rc::new(Node::new(id));
        let idx = NodeIdx::from(self.seq.len());
        self.seq.push(Rc::clone(&node));
        node.set_idx(Some(idx));
        self.by_id.insert(id, idx);
        node
    }

    /// Remove `node` from the nodelist.
    ///
    /// Swaps the last element of the sequence into the vacated slot so that
    /// removal costs O(1); the displaced element's cached index is rewritten
    /// to match. Panics if `node` is not currently present, since every
    /// caller is expected to have just observed it via `get` or iteration.
    pub(crate) fn drop_node(&mut self, node: &Rc<Node>) {
        let idx = node
            .idx()
            .expect("drop_node called on a node that isn't in the nodelist");
        self.by_id.remove(&node.identity());
        let removed = self.seq.swap_remove(usize::from(idx));
        debug_assert!(Rc::ptr_eq(&removed, node));
        node.set_idx(None);
        if let Some(moved) = self.seq.get(usize::from(idx)) {
            moved.set_idx(Some(idx));
            self.by_id.insert(moved.identity(), idx);
        }
    }

    /// Iterate over every live node, in sequence order.
    ///
    /// Safe to mutate a node's cached flags while iterating; inserting or
    /// removing nodes during iteration is not supported (the single-threaded
    /// cooperative model never requires it: all reconciliation is done
    /// up-front, and iteration is only ever used by read-only consumers).
    pub fn iter(&self) -> impl Iterator<Item = &Rc<Node>> {
        self.seq.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(b: u8) -> RsaIdentity {
        RsaIdentity::from([b; 20])
    }

    #[test]
    fn create_get_drop() {
        let mut nl = NodeList::new();
        assert!(nl.get(&id(1)).is_none());

        let n1 = nl.get_or_create(id(1));
        let n2 = nl.get_or_create(id(2));
        let n3 = nl.get_or_create(id(3));
        assert_eq!(nl.len(), 3);

        // get_or_create is idempotent for an existing identity.
        assert!(Rc::ptr_eq(&nl.get_or_create(id(1)), &n1));

        // Removing the middle node swaps the last one into its place.
        nl.drop_node(&n2);
        assert_eq!(nl.len(), 2);
        assert!(nl.get(&id(2)).is_none());
        assert!(Rc::ptr_eq(&nl.get(&id(3)).unwrap(), &n3));
        assert_eq!(usize::from(n3.idx().unwrap()), 0);

        nl.drop_node(&n1);
        nl.drop_node(&n3);
        assert!(nl.is_empty());
    }

    #[test]
    #[should_panic(expected = "drop_node called on a node that isn't in the nodelist")]
    fn drop_twice_panics() {
        let mut nl = NodeList::new();
        let n1 = nl.get_or_create(id(1));
        nl.drop_node(&n1);
        nl.drop_node(&n1);
    }
}
