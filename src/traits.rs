//! Capability interfaces for the external collaborators the reconciler and
//! readiness estimator depend on, but do not own.
//!
//! None of these are implemented in this crate: a directory client, a
//! microdescriptor cache, and a GeoIP database already exist elsewhere in
//! the surrounding program, and are handed to us as trait objects so this
//! crate stays ignorant of how descriptors are parsed, fetched, or stored on
//! disk (see the crate-level scope notes).

use std::net::IpAddr;
use std::sync::Arc;

use crate::doc::{DocDigest, Microdesc};

/// Looks up microdescriptors by digest.
///
/// Grounded on the nodelist's need, during both `add_microdesc` and
/// `set_consensus`, to resolve a routerstatus's `descriptor_digest` to the
/// microdescriptor payload it names.
pub trait MicrodescCache {
    /// Return the microdescriptor with the given digest, if the cache has it.
    fn lookup_by_digest(&self, digest: &DocDigest) -> Option<Arc<Microdesc>>;
}

/// Resolves an IP address to the country that announces it.
pub trait GeoIp {
    /// Return the country code announcing `addr`, if known.
    fn country_for(&self, addr: IpAddr) -> Option<tor_geoip::CountryCode>;
}

/// Firewall- and configuration-derived address preferences.
///
/// Mirrors the `Firewall/Config` capability interface: whether this client
/// uses IPv6 at all, and whether it prefers IPv6 connections -- over either
/// a relay's OR port or its (legacy) directory port -- when both families
/// are reachable.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddressPreferences {
    /// Whether this client will ever originate an IPv6 connection.
    pub use_ipv6: bool,
    /// Whether an IPv6 OR address is preferred over IPv4 when both are usable.
    pub prefer_ipv6_orport: bool,
    /// Whether an IPv6 directory address is preferred over IPv4 when both
    /// are usable. Carried for parity with the Firewall/Config capability
    /// this struct otherwise mirrors; no algorithm in this crate currently
    /// consults it, since legacy v2-directory dirports are not part of
    /// circuit building.
    pub prefer_ipv6_dirport: bool,
}

/// Queries the readiness estimator needs that only the bootstrap and guard
/// subsystems can answer.
///
/// Mirrors the `Guards` and bootstrap-layer capability interfaces: whether
/// directory fetches are being deliberately throttled, whether the entry
/// guard subsystem still needs descriptors for its primary guards, and
/// whether a "reasonably live" consensus of a given flavor exists at all
/// (parsing and validity-period checks on the consensus are out of scope
/// for this crate; see the crate-level scope notes).
pub trait ReadinessDeps {
    /// If directory fetches are being deliberately delayed, the reason why.
    fn bootstrap_delay_reason(&self) -> Option<String>;

    /// If the entry-guard subsystem still lacks descriptors for its primary
    /// guards, the reason why.
    fn guards_missing_descriptors_reason(&self) -> Option<String>;

    /// Whether a reasonably live consensus of `flavor` currently exists.
    fn have_reasonably_live_consensus(&self, flavor: crate::doc::Flavor) -> bool;

    /// Whether the client would actually make use of `rs` (e.g. it isn't
    /// excluded by a routerset or policy the nodelist doesn't itself know
    /// about).
    fn client_would_use_router(&self, rs: &crate::doc::RouterStatus) -> bool;
}

/// Receives the controller events the readiness estimator emits on
/// `have_min_dir_info` transitions.
pub trait Controller {
    /// Emitted on a false-to-true transition: we just became ready to build circuits.
    fn bootstrap_conn_or(&self);
    /// Emitted on a true-to-false transition: we just lost readiness.
    fn not_enough_dir_info(&self);
}

/// Whether the reconciler is running inside a directory authority.
///
/// Authorities trust their own judgment about a relay's flags on a node's
/// first `ri` rather than waiting for a consensus (see
/// [`crate::reconcile::Reconciler::set_routerinfo`]); ordinary clients and
/// relays never set this.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AuthorityMode(pub bool);
