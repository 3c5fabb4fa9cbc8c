//! The directory-readiness estimator.
//!
//! Turns "how many relays do we actually have descriptors for" into a
//! single yes/no gate (`have_min_dir_info`) the bootstrap state machine and
//! circuit builder both watch, by walking the consensus and computing
//! bandwidth-weighted presence fractions over the guard, middle, and exit
//! positions.
//!
//! Recomputation is lazy and idempotent: [`DirInfoStatus::router_dir_info_changed`]
//! marks the result stale, and [`DirInfoStatus::router_have_minimum_dir_info`]
//! only walks the consensus again if the dirty bit is set.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::doc::{Consensus, Flavor, RelayFlags};
use crate::node::Node;
use crate::nodelist::NodeList;
use crate::params::{self, NetParams};
use crate::traits::{Controller, ReadinessDeps};
use crate::weight::{WeightRole, WeightSet};

/// Which consensus path shape we currently believe we can build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConsensusPath {
    /// Not yet determined (no consensus, or readiness has since been lost).
    #[default]
    Unknown,
    /// We have usable exits: ordinary three-hop circuits are possible.
    Exit,
    /// No usable exits: only internal (onion-service-style) circuits are possible.
    Internal,
}

/// Everything the estimator needs to recompute readiness, gathered in one
/// place so [`DirInfoStatus::router_have_minimum_dir_info`] takes a single
/// argument.
// Built fresh by the caller on every call, with every field always supplied;
// unlike the document/record types in `doc`, there's no benefit to hiding
// future fields behind a constructor here.
#[allow(clippy::exhaustive_structs)]
pub struct ReadinessContext<'a> {
    /// The live nodelist.
    pub nodes: &'a NodeList,
    /// The current consensus, if any.
    pub consensus: Option<&'a Consensus>,
    /// External capability queries (bootstrap delay, guard status, ...).
    pub deps: &'a dyn ReadinessDeps,
    /// Controller event sink.
    pub controller: &'a dyn Controller,
    /// The operator's `EntryNodes` set, if configured.
    pub entry_nodes: Option<&'a [Rc<Node>]>,
    /// The operator's `ExitNodes` set, if configured.
    pub exit_nodes: Option<&'a [Rc<Node>]>,
    /// `options.PathsNeededToBuildCircuits`, if the operator set one
    /// (0.0-1.0). `None` means "use the consensus parameter".
    pub paths_needed_to_build_circuits: Option<f64>,
}

/// The lazily recomputed readiness state: a boolean gate, the path shape,
/// and a human-readable status string.
#[derive(Debug)]
#[non_exhaustive]
pub struct DirInfoStatus {
    dirty: Cell<bool>,
    have_min_dir_info: Cell<bool>,
    have_consensus_path: Cell<ConsensusPath>,
    status: RefCell<String>,
}

impl Default for DirInfoStatus {
    fn default() -> Self {
        DirInfoStatus {
            dirty: Cell::new(true),
            have_min_dir_info: Cell::new(false),
            have_consensus_path: Cell::new(ConsensusPath::Unknown),
            status: RefCell::new("We have no usable consensus.".to_string()),
        }
    }
}

impl DirInfoStatus {
    /// Construct a fresh estimator: not ready, no consensus path, dirty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the cached result stale. Called on every observable change to
    /// the nodelist or consensus.
    pub fn router_dir_info_changed(&self) {
        self.dirty.set(true);
    }

    /// The consensus path shape as of the last recomputation.
    pub fn router_have_consensus_path(&self) -> ConsensusPath {
        self.have_consensus_path.get()
    }

    /// The human-readable status string as of the last recomputation.
    pub fn get_dir_info_status_string(&self) -> String {
        self.status.borrow().clone()
    }

    /// Return whether we currently have enough directory information to
    /// build circuits, recomputing only if [`Self::router_dir_info_changed`]
    /// has been called since the last recomputation.
    pub fn router_have_minimum_dir_info(&self, ctx: &ReadinessContext<'_>) -> bool {
        if !self.dirty.get() {
            return self.have_min_dir_info.get();
        }
        self.dirty.set(false);

        let ready = self.recompute(ctx);
        let was_ready = self.have_min_dir_info.replace(ready);

        if ready && !was_ready {
            ctx.controller.bootstrap_conn_or();
        } else if !ready && was_ready {
            self.have_consensus_path.set(ConsensusPath::Unknown);
            ctx.controller.not_enough_dir_info();
        }

        ready
    }

    /// The ten-step algorithm from the crate docs.
    fn recompute(&self, ctx: &ReadinessContext<'_>) -> bool {
        // Step 1: bootstrap layer deliberately delaying.
        if let Some(reason) = ctx.deps.bootstrap_delay_reason() {
            *self.status.borrow_mut() = reason;
            return false;
        }

        // Step 2: reasonably live consensus required.
        let Some(consensus) = ctx.consensus else {
            *self.status.borrow_mut() = "We have no usable consensus.".to_string();
            return false;
        };
        if !ctx.deps.have_reasonably_live_consensus(consensus.flavor) {
            *self.status.borrow_mut() = "The consensus we have is too old.".to_string();
            return false;
        }

        // Step 3: entry guards need descriptors for their primary guards.
        if let Some(reason) = ctx.deps.guards_missing_descriptors_reason() {
            *self.status.borrow_mut() = reason;
            return false;
        }

        // Step 4: bucket the consensus into mid/guards/exits.
        let usable: Vec<_> = consensus
            .routerstatuses
            .iter()
            .filter(|rs| ctx.deps.client_would_use_router(rs))
            .collect();

        let guards: Vec<_> = match ctx.entry_nodes {
            Some(set) => usable
                .iter()
                .filter(|rs| set.iter().any(|n| n.identity() == rs.identity))
                .copied()
                .collect(),
            None => usable
                .iter()
                .filter(|rs| rs.flags.contains(RelayFlags::GUARD))
                .copied()
                .collect(),
        };
        let exits: Vec<_> = usable
            .iter()
            .filter(|rs| rs.flags.contains(RelayFlags::EXIT))
            .copied()
            .collect();

        // Step 5: consensus path shape.
        let path = if exits.is_empty() {
            ConsensusPath::Internal
        } else {
            ConsensusPath::Exit
        };
        if path == ConsensusPath::Internal && self.have_consensus_path.get() != ConsensusPath::Internal {
            tracing::info!("No exits in the consensus; we can only build internal circuits.");
        }
        self.have_consensus_path.set(path);

        // Step 6: bandwidth-weighted presence fractions.
        let weights = WeightSet::from_consensus(&consensus.routerstatuses, &consensus.bandwidth_weights);
        let f_guard = fraction_present(ctx.nodes, consensus.flavor, &guards, &weights, WeightRole::Guard);
        let f_mid = fraction_present(ctx.nodes, consensus.flavor, &usable, &weights, WeightRole::Middle);
        let mut f_exit = fraction_present(ctx.nodes, consensus.flavor, &exits, &weights, WeightRole::Exit);

        // Step 7: ExitNodes restriction.
        if let Some(exit_set) = ctx.exit_nodes {
            let flagged: Vec<_> = exits
                .iter()
                .filter(|rs| exit_set.iter().any(|n| n.identity() == rs.identity))
                .copied()
                .collect();
            let f_myexit = if !flagged.is_empty() {
                fraction_present(ctx.nodes, consensus.flavor, &flagged, &weights, WeightRole::Exit)
            } else {
                let permissive: Vec<_> = usable
                    .iter()
                    .filter(|rs| exit_set.iter().any(|n| n.identity() == rs.identity))
                    .filter(|rs| {
                        ctx.nodes
                            .get(&rs.identity)
                            .map(|n| !n.exit_policy_rejects_all())
                            .unwrap_or(false)
                    })
                    .copied()
                    .collect();
                fraction_present(ctx.nodes, consensus.flavor, &permissive, &weights, WeightRole::Unweighted)
            };
            f_exit = f_exit.min(f_myexit);
        }

        // Step 8: internal-only consensus forces f_exit to 1.
        if path == ConsensusPath::Internal {
            f_exit = 1.0;
        }

        // Step 9/10: combine and compare to threshold.
        let f_path = f_guard * f_mid * f_exit;
        let threshold = ctx.paths_needed_to_build_circuits.unwrap_or_else(|| {
            consensus.params.get(
                params::PARAM_MIN_PATHS_FOR_CIRCS_PCT,
                params::DEFAULT_MIN_PATHS_FOR_CIRCS_PCT,
                params::MIN_MIN_PATHS_FOR_CIRCS_PCT,
                params::MAX_MIN_PATHS_FOR_CIRCS_PCT,
            ) as f64
                / 100.0
        });

        *self.status.borrow_mut() = format!(
            "{:.0}% of guards bw, {:.0}% of midpoint bw, {:.0}% of exit bw = {:.0}% of path bw",
            f_guard * 100.0,
            f_mid * 100.0,
            f_exit * 100.0,
            f_path * 100.0,
        );

        f_path >= threshold
    }
}

/// Sum of `weights.weight_rs_for_role(rs, role)` over `bucket`, restricted
/// to routerstatuses whose descriptor (or microdescriptor, depending on
/// `flavor`) we actually have, divided by the sum over all of `bucket`.
///
/// Returns `1.0` for an empty bucket: an empty role is vacuously fully present.
fn fraction_present(
    nodes: &NodeList,
    flavor: Flavor,
    bucket: &[&std::sync::Arc<crate::doc::RouterStatus>],
    weights: &WeightSet,
    role: WeightRole,
) -> f64 {
    if bucket.is_empty() {
        return 1.0;
    }
    let mut have = 0u64;
    let mut total = 0u64;
    for rs in bucket.iter().copied() {
        let w = weights.weight_rs_for_role(rs, role);
        total += w;
        let has_descriptor = nodes
            .get(&rs.identity)
            .map(|n| match flavor {
                Flavor::Ns => n.ri().is_some(),
                Flavor::Microdesc => n.md().is_some(),
            })
            .unwrap_or(false);
        if has_descriptor {
            have += w;
        }
    }
    if total == 0 {
        1.0
    } else {
        have as f64 / total as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc::{NamingInfo, RelayWeight, RouterStatus};
    use crate::reconcile::Reconciler;
    use crate::traits::{AddressPreferences, AuthorityMode};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;
    use tor_llcrypto::pk::rsa::RsaIdentity;

    struct AlwaysReady;
    impl ReadinessDeps for AlwaysReady {
        fn bootstrap_delay_reason(&self) -> Option<String> {
            None
        }
        fn guards_missing_descriptors_reason(&self) -> Option<String> {
            None
        }
        fn have_reasonably_live_consensus(&self, _flavor: Flavor) -> bool {
            true
        }
        fn client_would_use_router(&self, _rs: &RouterStatus) -> bool {
            true
        }
    }

    struct NoGeo;
    impl crate::traits::GeoIp for NoGeo {
        fn country_for(&self, _addr: std::net::IpAddr) -> Option<tor_geoip::CountryCode> {
            None
        }
    }

    struct EmptyCache;
    impl crate::traits::MicrodescCache for EmptyCache {
        fn lookup_by_digest(&self, _digest: &crate::doc::DocDigest) -> Option<Arc<crate::doc::Microdesc>> {
            None
        }
    }

    struct RecordingController {
        bootstrap_events: Cell<u32>,
        lost_events: Cell<u32>,
    }
    impl Controller for RecordingController {
        fn bootstrap_conn_or(&self) {
            self.bootstrap_events.set(self.bootstrap_events.get() + 1);
        }
        fn not_enough_dir_info(&self) {
            self.lost_events.set(self.lost_events.get() + 1);
        }
    }

    fn rs(id: u8, flags: RelayFlags, weight: u32) -> Arc<RouterStatus> {
        Arc::new(RouterStatus {
            identity: RsaIdentity::from([id; 20]),
            descriptor_digest: [id; 32],
            nickname: format!("r{id}"),
            or_addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, id), 9001),
            or_addr6: None,
            dir_port: None,
            flags,
            supports_ed25519_link_handshake: false,
            weight: RelayWeight::Measured(weight),
        })
    }

    fn flat_weight_params() -> NetParams {
        NetParams::from_pairs([
            ("Wgg", 10000), ("Wmg", 0), ("Weg", 0), ("Wbg", 0),
            ("Wgm", 0), ("Wmm", 10000), ("Wem", 0), ("Wbm", 0),
            ("Wgd", 0), ("Wmd", 0), ("Wed", 0), ("Wbd", 0),
            ("Wge", 0), ("Wme", 0), ("Wee", 10000), ("Wbe", 0),
            ("Wmb", 0), ("Wgb", 0), ("Web", 0), ("Wdb", 0),
        ])
    }

    #[test]
    fn no_consensus_is_not_ready() {
        let estimator = DirInfoStatus::new();
        let nodes = NodeList::new();
        let deps = AlwaysReady;
        let controller = RecordingController { bootstrap_events: Cell::new(0), lost_events: Cell::new(0) };
        let ctx = ReadinessContext {
            nodes: &nodes,
            consensus: None,
            deps: &deps,
            controller: &controller,
            entry_nodes: None,
            exit_nodes: None,
            paths_needed_to_build_circuits: None,
        };
        assert!(!estimator.router_have_minimum_dir_info(&ctx));
        assert_eq!(estimator.get_dir_info_status_string(), "We have no usable consensus.");
    }

    #[test]
    fn idempotent_without_dirty_bit() {
        let estimator = DirInfoStatus::new();
        let nodes = NodeList::new();
        let deps = AlwaysReady;
        let controller = RecordingController { bootstrap_events: Cell::new(0), lost_events: Cell::new(0) };
        let ctx = ReadinessContext {
            nodes: &nodes,
            consensus: None,
            deps: &deps,
            controller: &controller,
            entry_nodes: None,
            exit_nodes: None,
            paths_needed_to_build_circuits: None,
        };
        estimator.router_have_minimum_dir_info(&ctx);
        assert!(!estimator.dirty.get());
        // Calling again without router_dir_info_changed() must not panic or
        // re-walk a (possibly now-dangling) consensus reference.
        assert!(!estimator.router_have_minimum_dir_info(&ctx));
    }

    #[test]
    fn partial_presence_yields_fractional_status() {
        use float_eq::assert_float_eq;

        let mut reconciler = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        let statuses: Vec<_> = (1..=4u8)
            .map(|i| rs(i, RelayFlags::EXIT | RelayFlags::RUNNING | RelayFlags::VALID, 1000))
            .collect();
        let consensus = Arc::new(Consensus {
            flavor: Flavor::Ns,
            routerstatuses: statuses,
            params: NetParams::default(),
            bandwidth_weights: flat_weight_params(),
            naming: NamingInfo::default(),
        });
        reconciler.set_consensus(Arc::clone(&consensus), &EmptyCache, &NoGeo);

        // Only give the first relay a descriptor: 1/4 of the exit bandwidth present.
        let descriptor = Arc::new(crate::doc::RouterInfo {
            identity: RsaIdentity::from([1; 20]),
            nickname: "r1".into(),
            or_addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9001),
            or_addr6: None,
            dir_port: None,
            declared_family: Vec::new(),
            exit_policy: Arc::new(tor_netdoc::types::policy::PortPolicy::new_reject_all()),
            platform: None,
            protocols: String::new(),
            signing_key: None,
            onion_key: None,
            purpose: crate::doc::RouterPurpose::General,
            allow_single_hop_exits: false,
            supports_tunnelled_dir_requests: false,
        });
        reconciler.set_routerinfo(descriptor, &NoGeo);

        let weights = WeightSet::from_consensus(&consensus.routerstatuses, &consensus.bandwidth_weights);
        let exits: Vec<_> = consensus.routerstatuses.iter().collect();
        let f_exit = fraction_present(reconciler.nodes(), Flavor::Ns, &exits, &weights, WeightRole::Exit);
        assert_float_eq!(f_exit, 0.25, abs <= 1e-9);
    }

    #[test]
    fn full_presence_is_ready_and_fires_bootstrap_event() {
        let mut reconciler = Reconciler::new(AuthorityMode(false), AddressPreferences::default());
        let mut statuses = Vec::new();
        for i in 1..=10u8 {
            let flags = if i <= 6 {
                RelayFlags::GUARD | RelayFlags::RUNNING | RelayFlags::VALID
            } else if i <= 8 {
                RelayFlags::EXIT | RelayFlags::RUNNING | RelayFlags::VALID
            } else {
                RelayFlags::RUNNING | RelayFlags::VALID
            };
            statuses.push(rs(i, flags, 1000));
        }
        let consensus = Arc::new(Consensus {
            flavor: Flavor::Ns,
            routerstatuses: statuses.clone(),
            params: NetParams::default(),
            bandwidth_weights: flat_weight_params(),
            naming: NamingInfo::default(),
        });
        reconciler.set_consensus(Arc::clone(&consensus), &EmptyCache, &NoGeo);

        // Give every node a `ri` so presence fractions are all 1.0.
        for i in 1..=10u8 {
            let descriptor = Arc::new(crate::doc::RouterInfo {
                identity: RsaIdentity::from([i; 20]),
                nickname: format!("r{i}"),
                or_addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 9001),
                or_addr6: None,
                dir_port: None,
                declared_family: Vec::new(),
                exit_policy: Arc::new(tor_netdoc::types::policy::PortPolicy::new_reject_all()),
                platform: None,
                protocols: String::new(),
                signing_key: None,
                onion_key: None,
                purpose: crate::doc::RouterPurpose::General,
                allow_single_hop_exits: false,
                supports_tunnelled_dir_requests: false,
            });
            reconciler.set_routerinfo(descriptor, &NoGeo);
        }

        let estimator = DirInfoStatus::new();
        let deps = AlwaysReady;
        let controller = RecordingController { bootstrap_events: Cell::new(0), lost_events: Cell::new(0) };
        let ctx = ReadinessContext {
            nodes: reconciler.nodes(),
            consensus: reconciler.consensus().map(|c| c.as_ref()),
            deps: &deps,
            controller: &controller,
            entry_nodes: None,
            exit_nodes: None,
            paths_needed_to_build_circuits: None,
        };
        assert!(estimator.router_have_minimum_dir_info(&ctx));
        assert_eq!(estimator.router_have_consensus_path(), ConsensusPath::Exit);
        assert_eq!(controller.bootstrap_events.get(), 1);
    }
}
