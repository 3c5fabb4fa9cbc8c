//! The reconciler: the only code allowed to mutate a [`NodeList`] after
//! construction.
//!
//! Three kinds of updates arrive here, in any order and interleaving, from
//! the directory client: a fresh `ri`, a fresh `md`, or an entirely new
//! consensus. Each entry point restores every invariant listed in the
//! crate docs before returning -- nothing else in this crate is allowed to
//! observe an intermediate state (see the crate-level concurrency notes).

use std::rc::Rc;
use std::sync::Arc;

use tor_llcrypto::pk::rsa::RsaIdentity;

use crate::doc::{Consensus, Flavor, Microdesc, RouterInfo, RouterPurpose};
use crate::node::Node;
use crate::nodelist::NodeList;
use crate::traits::{AddressPreferences, AuthorityMode, GeoIp, MicrodescCache};

/// Owns the nodelist and applies directory updates to it.
///
/// `is_authority` gates the one behavioral difference directory authorities
/// have from ordinary clients and relays: authorities derive a node's
/// mirrored flags from their own judgment on first sight of its `ri`,
/// rather than waiting for (and blindly trusting) a consensus.
pub struct Reconciler {
    nodes: NodeList,
    consensus: Option<Arc<Consensus>>,
    is_authority: AuthorityMode,
    addr_prefs: AddressPreferences,
}

impl Reconciler {
    /// Construct a reconciler with an empty nodelist.
    pub fn new(is_authority: AuthorityMode, addr_prefs: AddressPreferences) -> Self {
        Reconciler {
            nodes: NodeList::new(),
            consensus: None,
            is_authority,
            addr_prefs,
        }
    }

    /// The nodelist this reconciler maintains.
    pub fn nodes(&self) -> &NodeList {
        &self.nodes
    }

    /// The most recently installed consensus, if any.
    pub fn consensus(&self) -> Option<&Arc<Consensus>> {
        self.consensus.as_ref()
    }

    /// Attach a freshly parsed router descriptor.
    ///
    /// Returns the node it was attached to, and the descriptor it replaced
    /// (if any) so the router list can dispose of it.
    pub fn set_routerinfo(&mut self, ri: Arc<RouterInfo>, geoip: &dyn GeoIp) -> (Rc<Node>, Option<Arc<RouterInfo>>) {
        let node = self.nodes.get_or_create(ri.identity);
        let old_ri = node.ri();

        let addr_changed = old_ri
            .as_ref()
            .map(|old| old.or_addr != ri.or_addr || old.or_addr6 != ri.or_addr6)
            .unwrap_or(false);
        if addr_changed {
            node.invalidate_address_derived_state();
        }

        let is_first_ri = old_ri.is_none();
        let replaced = node.set_ri(Some(Arc::clone(&ri)));

        if node.country().is_none() {
            recompute_country(&node, geoip);
        }

        if self.is_authority.0 && is_first_ri {
            node.flags.set(crate::doc::RelayFlags::VALID | crate::doc::RelayFlags::RUNNING);
        }

        (node, replaced)
    }

    /// Attach a freshly fetched microdescriptor to the node that references it.
    ///
    /// No-op if no routerstatus in the latest microdesc-flavored consensus
    /// names this digest.
    pub fn add_microdesc(&mut self, md: Arc<Microdesc>) -> Option<Rc<Node>> {
        let consensus = self.consensus.as_ref()?;
        if consensus.flavor != Flavor::Microdesc {
            return None;
        }
        let rs = consensus
            .routerstatuses
            .iter()
            .find(|rs| rs.descriptor_digest == md.digest)?;
        let node = self.nodes.get(&rs.identity)?;
        detach_md(&node);
        attach_md(&node, md);
        Some(node)
    }

    /// Detach `ri` from its node. If the node now has neither `ri` nor `rs`,
    /// it is dropped from the nodelist.
    pub fn remove_routerinfo(&mut self, ri: &Arc<RouterInfo>) {
        let Some(node) = self.nodes.get(&ri.identity) else {
            return;
        };
        if node.ri().as_ref().map(|cur| Arc::ptr_eq(cur, ri)).unwrap_or(false) {
            node.set_ri(None);
        }
        if node.is_unbacked() {
            self.nodes.drop_node(&node);
        }
    }

    /// Detach `md` from `id`'s node, iff it is exactly the instance currently attached.
    pub fn remove_microdesc(&mut self, id: RsaIdentity, md: &Arc<Microdesc>) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.md().as_ref().map(|cur| Arc::ptr_eq(cur, md)).unwrap_or(false) {
            detach_md(&node);
        }
    }

    /// Replace the active consensus, reconciling every node against it.
    ///
    /// Implements the four-step algorithm from the crate docs: null out
    /// every `rs`, attach fresh ones (re-resolving `md` where the flavor and
    /// digest call for it), purge nodes left with neither `ri` nor `rs`, and
    /// demote general-purpose nodes the consensus implicitly dropped.
    pub fn set_consensus(&mut self, consensus: Arc<Consensus>, cache: &dyn MicrodescCache, geoip: &dyn GeoIp) {
        // Step 1: null out rs on every existing node.
        for node in self.nodes.iter() {
            node.set_rs(None);
        }

        // Step 2: attach the new consensus's routerstatuses.
        for rs in &consensus.routerstatuses {
            let node = self.nodes.get_or_create(rs.identity);
            node.set_rs(Some(Arc::clone(rs)));

            if consensus.flavor == Flavor::Microdesc {
                let stale = node
                    .md()
                    .map(|md| md.digest != rs.descriptor_digest)
                    .unwrap_or(false);
                if stale {
                    detach_md(&node);
                }
                if node.md().is_none() {
                    if let Some(md) = cache.lookup_by_digest(&rs.descriptor_digest) {
                        attach_md(&node, md);
                    }
                }
            }

            recompute_country(&node, geoip);

            if !self.is_authority.0 {
                node.flags.set(rs.flags);
                let has_ipv6 = node.rs().and_then(|rs| rs.or_addr6).is_some()
                    || node.md().and_then(|md| md.or_addr6).is_some();
                node.ipv6_preferred
                    .set(self.addr_prefs.prefer_ipv6_orport && has_ipv6);
                node.rejects_all.set(rejects_all_per_descriptor(&node));
            }
        }

        self.consensus = Some(consensus);

        // Step 3: purge.
        self.purge();

        // Step 4: demote surviving general-purpose nodes with ri but no rs.
        if !self.is_authority.0 {
            let survivors: Vec<_> = self.nodes.iter().cloned().collect();
            for node in survivors {
                let demote = node.rs().is_none()
                    && node
                        .ri()
                        .map(|ri| ri.purpose == RouterPurpose::General)
                        .unwrap_or(false);
                if demote {
                    node.clear_mirrored_flags();
                }
            }
        }
    }

    /// Detach any `md` left without a backing `rs`, then drop any node left
    /// with neither `ri` nor `rs`. Idempotent.
    pub fn purge(&mut self) {
        let snapshot: Vec<_> = self.nodes.iter().cloned().collect();
        for node in &snapshot {
            if node.md().is_some() && node.rs().is_none() {
                detach_md(node);
            }
        }
        for node in &snapshot {
            if node.is_unbacked() {
                self.nodes.drop_node(node);
            }
        }
    }

    /// Drop every node and forget the current consensus.
    pub fn free_all(&mut self) {
        self.nodes = NodeList::new();
        self.consensus = None;
    }

    /// Record a reachability probe result for `id`'s node, if it is live.
    ///
    /// A no-op if `id` has no node right now: reachability probes can race
    /// with a node's removal, and there is nothing left to record it on.
    pub fn router_set_status(&mut self, id: RsaIdentity, via_ipv6: bool, when: std::time::SystemTime) {
        if let Some(node) = self.nodes.get(&id) {
            node.set_reachable(via_ipv6, when);
        }
    }
}

/// Attach `md` to `node`, incrementing its refcount.
fn attach_md(node: &Node, md: Arc<Microdesc>) {
    md.incref();
    node.set_md(Some(md));
}

/// Detach whatever `md` is attached to `node`, decrementing its refcount.
fn detach_md(node: &Node) {
    if let Some(old) = node.set_md(None) {
        old.decref();
    }
}

/// Recompute the cached "rejects every port" verdict from whatever
/// descriptor data the node currently has.
///
/// The consensus carries no exit-policy summary of its own, so this mirrors
/// the same `ri`/`md` precedence [`Node::exit_policy_rejects_all`] falls
/// back to, caching the result at consensus-application time rather than
/// recomputing the full policy scan on every call.
fn rejects_all_per_descriptor(node: &Node) -> bool {
    if let Some(ri) = node.ri() {
        return !ri.exit_policy.allows_some_port();
    }
    if let Some(md) = node.md() {
        if let Some(policy) = &md.exit_policy {
            return !policy.allows_some_port();
        }
    }
    true
}

/// Recompute and cache a node's GeoIP country from its primary address.
fn recompute_country(node: &Node, geoip: &dyn GeoIp) {
    let country = node
        .prim_orport()
        .and_then(|addr| geoip.country_for(std::net::IpAddr::V4(*addr.ip())));
    node.set_country(country);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc::{Flavor, NamingInfo, RelayFlags, RelayWeight, RouterStatus};
    use crate::params::NetParams;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tor_llcrypto::pk::curve25519;
    use tor_netdoc::types::policy::PortPolicy;

    struct NoGeo;
    impl GeoIp for NoGeo {
        fn country_for(&self, _addr: std::net::IpAddr) -> Option<tor_geoip::CountryCode> {
            None
        }
    }

    struct EmptyCache;
    impl MicrodescCache for EmptyCache {
        fn lookup_by_digest(&self, _digest: &crate::doc::DocDigest) -> Option<Arc<Microdesc>> {
            None
        }
    }

    fn ri(id: u8, addr: Ipv4Addr, nick: &str) -> Arc<RouterInfo> {
        Arc::new(RouterInfo {
            identity: RsaIdentity::from([id; 20]),
            nickname: nick.into(),
            or_addr: SocketAddrV4::new(addr, 9001),
            or_addr6: None,
            dir_port: None,
            declared_family: Vec::new(),
            exit_policy: Arc::new(PortPolicy::new_reject_all()),
            platform: None,
            protocols: String::new(),
            signing_key: None,
            onion_key: None,
            purpose: RouterPurpose::General,
            allow_single_hop_exits: false,
            supports_tunnelled_dir_requests: false,
        })
    }

    fn rs(id: u8, flags: RelayFlags, digest: [u8; 32]) -> Arc<RouterStatus> {
        Arc::new(RouterStatus {
            identity: RsaIdentity::from([id; 20]),
            descriptor_digest: digest,
            nickname: "x".into(),
            or_addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9001),
            or_addr6: None,
            dir_port: None,
            flags,
            supports_ed25519_link_handshake: false,
            weight: RelayWeight::Unmeasured(0),
        })
    }

    fn consensus(flavor: Flavor, routerstatuses: Vec<Arc<RouterStatus>>) -> Arc<Consensus> {
        Arc::new(Consensus {
            flavor,
            routerstatuses,
            params: NetParams::default(),
            bandwidth_weights: NetParams::default(),
            naming: NamingInfo::default(),
        })
    }

    #[test]
    fn create_via_ri() {
        let mut r = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        let (node, old) = r.set_routerinfo(ri(1, Ipv4Addr::new(10, 0, 0, 1), "Alpha"), &NoGeo);
        assert!(old.is_none());
        assert_eq!(node.nickname().as_deref(), Some("Alpha"));
        assert_eq!(
            node.prim_orport(),
            Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9001))
        );
        assert!(node.ed25519_id().is_none());
        assert!(r.nodes().get(&RsaIdentity::from([1; 20])).is_some());
    }

    #[test]
    fn routerinfo_roundtrip_leaves_nodelist_empty() {
        let mut r = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        let descriptor = ri(1, Ipv4Addr::new(10, 0, 0, 1), "Alpha");
        r.set_routerinfo(Arc::clone(&descriptor), &NoGeo);
        r.remove_routerinfo(&descriptor);
        assert!(r.nodes().is_empty());
    }

    #[test]
    fn consensus_attach_preserves_ri() {
        let mut r = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        r.set_routerinfo(ri(1, Ipv4Addr::new(10, 0, 0, 1), "Alpha"), &NoGeo);
        let status = rs(
            1,
            RelayFlags::RUNNING | RelayFlags::FAST | RelayFlags::EXIT,
            [1; 32],
        );
        r.set_consensus(consensus(Flavor::Ns, vec![status]), &EmptyCache, &NoGeo);

        let node = r.nodes().get(&RsaIdentity::from([1; 20])).unwrap();
        assert!(node.flags.get().contains(RelayFlags::RUNNING));
        assert!(node.flags.get().contains(RelayFlags::FAST));
        assert!(node.flags.get().contains(RelayFlags::EXIT));
        assert!(node.rs().is_some());
        assert!(node.ri().is_some());
    }

    #[test]
    fn microdesc_attach_and_replace() {
        struct OneShotCache(std::cell::RefCell<Option<Arc<Microdesc>>>);
        impl MicrodescCache for OneShotCache {
            fn lookup_by_digest(&self, digest: &crate::doc::DocDigest) -> Option<Arc<Microdesc>> {
                let cur = self.0.borrow();
                cur.as_ref()
                    .filter(|md| &md.digest == digest)
                    .cloned()
            }
        }

        let mut r = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        let key = curve25519::PublicKey::from(*b"0123456789abcdef0123456789abcdef");
        let md1 = Arc::new(Microdesc::new([2; 32], key, None));
        let cache = OneShotCache(std::cell::RefCell::new(Some(Arc::clone(&md1))));

        let status = rs(2, RelayFlags::empty(), [2; 32]);
        r.set_consensus(consensus(Flavor::Microdesc, vec![status]), &cache, &NoGeo);

        let node = r.nodes().get(&RsaIdentity::from([2; 20])).unwrap();
        assert_eq!(node.md().unwrap().digest, [2; 32]);
        assert_eq!(md1.held_by_nodes(), 1);

        let md2 = Arc::new(Microdesc::new([3; 32], key, None));
        *cache.0.borrow_mut() = Some(Arc::clone(&md2));
        let status2 = rs(2, RelayFlags::empty(), [3; 32]);
        r.set_consensus(consensus(Flavor::Microdesc, vec![status2]), &cache, &NoGeo);

        assert_eq!(md1.held_by_nodes(), 0);
        assert_eq!(md2.held_by_nodes(), 1);
        assert_eq!(node.md().unwrap().digest, [3; 32]);
    }

    #[test]
    fn purge_drops_md_only_node() {
        struct OneShotCache(Arc<Microdesc>);
        impl MicrodescCache for OneShotCache {
            fn lookup_by_digest(&self, digest: &crate::doc::DocDigest) -> Option<Arc<Microdesc>> {
                (self.0.digest == *digest).then(|| Arc::clone(&self.0))
            }
        }

        let mut r = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        let key = curve25519::PublicKey::from(*b"0123456789abcdef0123456789abcdef");
        let md = Arc::new(Microdesc::new([9; 32], key, None));
        let cache = OneShotCache(Arc::clone(&md));

        let status = rs(3, RelayFlags::empty(), [9; 32]);
        r.set_consensus(
            consensus(Flavor::Microdesc, vec![status]),
            &cache,
            &NoGeo,
        );
        assert!(r.nodes().get(&RsaIdentity::from([3; 20])).is_some());
        assert_eq!(md.held_by_nodes(), 1);

        // Next consensus no longer mentions node 3: it should be purged.
        r.set_consensus(consensus(Flavor::Microdesc, vec![]), &cache, &NoGeo);
        assert!(r.nodes().get(&RsaIdentity::from([3; 20])).is_none());
        assert_eq!(md.held_by_nodes(), 0);
    }

    #[test]
    fn rejects_all_is_cached_from_descriptor_on_consensus_apply() {
        let mut r = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        let mut descriptor = ri(1, Ipv4Addr::new(10, 0, 0, 1), "Alpha");
        Arc::get_mut(&mut descriptor).unwrap().exit_policy =
            Arc::new("accept 1-65535".parse().unwrap());
        r.set_routerinfo(Arc::clone(&descriptor), &NoGeo);

        let status = rs(1, RelayFlags::RUNNING, [1; 32]);
        r.set_consensus(consensus(Flavor::Ns, vec![status]), &EmptyCache, &NoGeo);

        let node = r.nodes().get(&RsaIdentity::from([1; 20])).unwrap();
        assert!(!node.exit_policy_rejects_all());

        // A node whose descriptor rejects everything gets the cache flipped
        // back on the next consensus application.
        let reject_all = ri(2, Ipv4Addr::new(10, 0, 0, 2), "Beta");
        r.set_routerinfo(Arc::clone(&reject_all), &NoGeo);
        let status2 = rs(2, RelayFlags::RUNNING, [2; 32]);
        r.set_consensus(
            consensus(Flavor::Ns, vec![rs(1, RelayFlags::RUNNING, [1; 32]), status2]),
            &EmptyCache,
            &NoGeo,
        );
        let node2 = r.nodes().get(&RsaIdentity::from([2; 20])).unwrap();
        assert!(node2.exit_policy_rejects_all());
    }

    #[test]
    fn address_change_invalidates_country_and_reachability() {
        let mut r = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        let (node, _) = r.set_routerinfo(ri(1, Ipv4Addr::new(10, 0, 0, 1), "Alpha"), &NoGeo);
        node.set_country(Some("US".parse::<tor_geoip::CountryCode>().unwrap()));

        r.set_routerinfo(ri(1, Ipv4Addr::new(10, 0, 0, 2), "Alpha"), &NoGeo);
        assert!(node.country().is_none());
    }
}
