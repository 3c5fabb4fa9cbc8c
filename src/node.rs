//! The `Node`: a unified handle fusing a relay's descriptor, consensus entry,
//! and microdescriptor.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::SystemTime;

use derive_more::{From, Into};
use tor_llcrypto::pk::rsa::RsaIdentity;

use crate::doc::{Microdesc, RelayFlags, RouterInfo, RouterStatus};

/// Index of a [`Node`] within [`crate::NodeList`]'s sequence.
///
/// A newtype rather than a bare `usize` so that a node index can never be
/// confused with some other count or slice index; see `tor-netdir`'s
/// `RouterStatusIdx` for the pattern this follows.
#[derive(Debug, From, Into, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) struct NodeIdx(usize);

/// Sentinel stored in a detached node's index field.
pub(crate) const DETACHED: i64 = -1;

/// The in-memory unification of a relay's `ri`, `rs`, and `md`.
///
/// A `Node` is created lazily by the reconciler when the first of `ri` or
/// `rs` for its identity arrives, and is destroyed once reconciliation
/// leaves it with neither (see the crate-level lifecycle notes). The same
/// identity always maps to the same `Node` for as long as it's alive:
/// nodes are never silently replaced.
#[derive(Debug)]
pub struct Node {
    /// The RSA identity digest that is this node's primary key. Immutable
    /// after insertion.
    identity: RsaIdentity,
    /// The node's self-published descriptor, if we have one.
    ri: RefCell<Option<Arc<RouterInfo>>>,
    /// The node's entry in the current consensus, if any.
    rs: RefCell<Option<Arc<RouterStatus>>>,
    /// The node's microdescriptor, if any.
    md: RefCell<Option<Arc<Microdesc>>>,
    /// This node's position in the nodelist's sequence; `-1` when detached.
    nodelist_idx: Cell<i64>,
    /// Cached GeoIP country for this node's primary address, or `None` if
    /// not yet computed.
    country: Cell<Option<tor_geoip::CountryCode>>,
    /// Flags mirrored from `rs` when this node is not an authority.
    pub(crate) flags: Cell<RelayFlags>,
    /// Whether this node prefers being contacted over IPv6.
    pub(crate) ipv6_preferred: Cell<bool>,
    /// Whether this node's exit policy is known to reject everything.
    ///
    /// Recomputed from `ri`/`md` each time a consensus is applied, since the
    /// consensus itself carries no exit-policy summary; see
    /// `reconcile::rejects_all_per_descriptor`.
    pub(crate) rejects_all: Cell<bool>,
    /// Time of last successful reachability probe over IPv4, if any.
    pub(crate) last_reachable: Cell<Option<SystemTime>>,
    /// Time of last successful reachability probe over IPv6, if any.
    pub(crate) last_reachable6: Cell<Option<SystemTime>>,
    /// One-shot bit rate-limiting nickname-ambiguity warnings.
    name_lookup_warned: Cell<bool>,
}

impl Node {
    /// Construct a brand new, unattached node for `identity`.
    ///
    /// New nodes start with country unknown and every flag clear, as
    /// described in the identity index's `get_or_create` contract.
    pub(crate) fn new(identity: RsaIdentity) -> Self {
        Node {
            identity,
            ri: RefCell::new(None),
            rs: RefCell::new(None),
            md: RefCell::new(None),
            nodelist_idx: Cell::new(DETACHED),
            country: Cell::new(None),
            flags: Cell::new(RelayFlags::empty()),
            ipv6_preferred: Cell::new(false),
            rejects_all: Cell::new(false),
            last_reachable: Cell::new(None),
            last_reachable6: Cell::new(None),
            name_lookup_warned: Cell::new(false),
        }
    }

    /// This node's RSA identity digest.
    pub fn identity(&self) -> RsaIdentity {
        self.identity
    }

    /// This node's position within the nodelist's sequence, or `None` if detached.
    pub(crate) fn idx(&self) -> Option<NodeIdx> {
        let raw = self.nodelist_idx.get();
        (raw >= 0).then_some(NodeIdx(raw as usize))
    }

    /// Set this node's position within the nodelist's sequence.
    pub(crate) fn set_idx(&self, idx: Option<NodeIdx>) {
        self.nodelist_idx
            .set(idx.map_or(DETACHED, |i| usize::from(i) as i64));
    }

    /// Return true if this node currently has neither `ri` nor `rs`.
    ///
    /// Such a node violates invariant 1 and must be dropped by the
    /// reconciler before control returns to any other code.
    pub(crate) fn is_unbacked(&self) -> bool {
        self.ri.borrow().is_none() && self.rs.borrow().is_none()
    }

    /// This node's current router descriptor, if any.
    pub fn ri(&self) -> Option<Arc<RouterInfo>> {
        self.ri.borrow().clone()
    }

    /// This node's current consensus entry, if any.
    pub fn rs(&self) -> Option<Arc<RouterStatus>> {
        self.rs.borrow().clone()
    }

    /// This node's current microdescriptor, if any.
    pub fn md(&self) -> Option<Arc<Microdesc>> {
        self.md.borrow().clone()
    }

    /// Attach `ri`, returning whatever descriptor was previously attached.
    pub(crate) fn set_ri(&self, ri: Option<Arc<RouterInfo>>) -> Option<Arc<RouterInfo>> {
        self.ri.replace(ri)
    }

    /// Attach `rs`, returning whatever routerstatus was previously attached.
    pub(crate) fn set_rs(&self, rs: Option<Arc<RouterStatus>>) -> Option<Arc<RouterStatus>> {
        self.rs.replace(rs)
    }

    /// Attach `md`, returning whatever microdescriptor was previously attached.
    pub(crate) fn set_md(&self, md: Option<Arc<Microdesc>>) -> Option<Arc<Microdesc>> {
        self.md.replace(md)
    }

    /// Clear all cached, consensus-derived state.
    ///
    /// Used when the consensus implicitly demotes a general-purpose relay
    /// that still has a descriptor but no routerstatus.
    pub(crate) fn clear_mirrored_flags(&self) {
        self.flags.set(RelayFlags::empty());
        self.ipv6_preferred.set(false);
        self.rejects_all.set(false);
    }

    /// Return this node's cached country code, if computed.
    pub fn country(&self) -> Option<tor_geoip::CountryCode> {
        self.country.get()
    }

    /// Set this node's cached country code.
    pub(crate) fn set_country(&self, country: Option<tor_geoip::CountryCode>) {
        self.country.set(country);
    }

    /// Forget this node's cached country and reachability state.
    ///
    /// Called when a node's address changes, since geolocation and
    /// reachability history are tied to the old address.
    pub(crate) fn invalidate_address_derived_state(&self) {
        self.country.set(None);
        self.last_reachable.set(None);
        self.last_reachable6.set(None);
    }

    /// Return true if we've already warned about an ambiguous nickname
    /// lookup for this node, and mark it warned if not.
    pub(crate) fn warn_name_lookup_once(&self) -> bool {
        let already = self.name_lookup_warned.replace(true);
        !already
    }

    /// Record a successful reachability probe over IPv4 or IPv6 at `when`.
    pub(crate) fn set_reachable(&self, via_ipv6: bool, when: SystemTime) {
        if via_ipv6 {
            self.last_reachable6.set(Some(when));
        } else {
            self.last_reachable.set(Some(when));
        }
    }

    /// Time of the last successful reachability probe over IPv4, if any.
    pub fn last_reachable(&self) -> Option<SystemTime> {
        self.last_reachable.get()
    }

    /// Time of the last successful reachability probe over IPv6, if any.
    pub fn last_reachable6(&self) -> Option<SystemTime> {
        self.last_reachable6.get()
    }
}
