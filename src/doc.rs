//! The three independently sourced views of a relay that the nodelist unifies.
//!
//! Parsing router descriptors, consensus documents, and microdescriptors is
//! out of scope for this crate (see the crate-level docs): the types here are
//! the already-parsed, already-validated documents as handed to us by the
//! directory client and the microdescriptor cache. The nodelist holds
//! non-owning references to them (realized here as `Arc` clones, the
//! idiomatic stand-in for "shared, externally owned" data in safe Rust); see
//! [`crate::reconcile`] for how those references are attached and detached.

use std::net::{SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use tor_llcrypto::pk::{curve25519, ed25519::Ed25519Identity, rsa::RsaIdentity};
use tor_netdoc::types::policy::PortPolicy;

/// A 32-byte digest identifying a router descriptor or microdescriptor.
pub type DocDigest = [u8; 32];

bitflags::bitflags! {
    /// The flags that a consensus can attach to a single routerstatus entry.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct RelayFlags: u16 {
        /// The authorities consider this relay valid.
        const VALID = 1 << 0;
        /// The relay was running when the consensus was voted on.
        const RUNNING = 1 << 1;
        /// The relay is "fast" enough to use for everyday purposes.
        const FAST = 1 << 2;
        /// The relay is "stable" enough to use for long-lived circuits.
        const STABLE = 1 << 3;
        /// The relay is a possible entry guard.
        const GUARD = 1 << 4;
        /// The relay is usable as an exit.
        const EXIT = 1 << 5;
        /// The relay is a known-bad exit; do not use it to exit even if [`EXIT`](Self::EXIT) is set.
        const BAD_EXIT = 1 << 6;
        /// The relay is usable as a hidden-service directory.
        const HS_DIR = 1 << 7;
        /// The relay is usable as a directory cache (v2 directory protocol).
        const V2_DIR = 1 << 8;
    }
}

/// What purpose a relay's descriptor declares for itself.
///
/// Only `General` relays participate in ordinary circuit building; other
/// purposes (bridges, controller-managed test relays) are tracked by other
/// subsystems and never demoted by consensus absence (see
/// [`crate::reconcile`]).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
#[non_exhaustive]
pub enum RouterPurpose {
    /// An ordinary relay, usable in circuits.
    #[default]
    General,
    /// A bridge relay.
    Bridge,
    /// A relay under test, or otherwise not meant for general use.
    Controller,
}

/// A relay's self-signed descriptor.
///
/// Carried by the router list; the nodelist only ever sees an `Arc` clone.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RouterInfo {
    /// The RSA identity digest of the relay that published this descriptor.
    pub identity: RsaIdentity,
    /// The nickname this relay has chosen for itself.
    pub nickname: String,
    /// The relay's primary (IPv4) OR address and port.
    pub or_addr: SocketAddrV4,
    /// The relay's IPv6 OR address and port, if any.
    pub or_addr6: Option<SocketAddrV6>,
    /// A directory port, if this relay serves the legacy (v1/v2) directory protocol.
    pub dir_port: Option<u16>,
    /// Nickname or `$hex` tokens for relays this relay's operator declares as family.
    pub declared_family: Vec<String>,
    /// The relay's exit policy.
    pub exit_policy: Arc<PortPolicy>,
    /// Free-text platform/version string, used only for diagnostics.
    pub platform: Option<String>,
    /// The relay's self-declared protocol versions (`Link=3-5 LinkAuth=1,3 ...`).
    pub protocols: String,
    /// The Ed25519 signing key bound to this descriptor by its certificate, if any.
    ///
    /// An all-zero key is a malformed descriptor, not a real key; see
    /// [`crate::accessors::ed25519_id`].
    pub signing_key: Option<Ed25519Identity>,
    /// The relay's Curve25519 onion key.
    pub onion_key: Option<curve25519::PublicKey>,
    /// What this descriptor is for.
    pub purpose: RouterPurpose,
    /// Whether the relay allows single-hop exits (a historical misfeature).
    pub allow_single_hop_exits: bool,
    /// Whether the relay accepts `BEGIN_DIR` cells tunnelled over its ORPort.
    pub supports_tunnelled_dir_requests: bool,
}

/// One entry in a consensus document, describing a single relay.
///
/// Owned by the [`Consensus`] that contains it; the nodelist holds `Arc`
/// clones so that a consensus swap can be detected by simply replacing the
/// reference (see invariant 5 in the crate docs).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RouterStatus {
    /// The RSA identity digest of the described relay.
    pub identity: RsaIdentity,
    /// The digest of the descriptor (or microdescriptor) this entry refers to.
    pub descriptor_digest: DocDigest,
    /// The nickname the authorities recorded for this relay.
    pub nickname: String,
    /// The relay's primary (IPv4) OR address and port.
    pub or_addr: SocketAddrV4,
    /// The relay's IPv6 OR address and port, if voted on.
    pub or_addr6: Option<SocketAddrV6>,
    /// A directory port, if the relay serves the legacy directory protocol.
    pub dir_port: Option<u16>,
    /// The flags the authorities assigned to this relay.
    pub flags: RelayFlags,
    /// Whether this relay is known to support the v3 Ed25519 link handshake.
    pub supports_ed25519_link_handshake: bool,
    /// This relay's share of the network's measured (or self-reported) bandwidth.
    pub weight: RelayWeight,
}

/// A relay's bandwidth, as carried in a consensus, distinguishing
/// authority-measured values from relay-reported ones.
///
/// Measured values are always preferred over self-reported ones when both
/// are available anywhere in a consensus; see [`crate::weight`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum RelayWeight {
    /// A bandwidth value voted on by the bandwidth authorities.
    Measured(u32),
    /// A bandwidth value self-reported by the relay, unverified.
    Unmeasured(u32),
}

impl RelayWeight {
    /// Return true if this weight came from the bandwidth authorities.
    pub fn is_measured(&self) -> bool {
        matches!(self, RelayWeight::Measured(_))
    }

    /// Return true if this weight is nonzero.
    pub fn is_nonzero(&self) -> bool {
        match self {
            RelayWeight::Measured(v) | RelayWeight::Unmeasured(v) => *v != 0,
        }
    }
}

/// A compact, bandwidth-saving summary of a relay, referenced by digest from
/// a microdesc-flavored consensus.
///
/// Shared via an explicit reference count (see [`Microdesc::held_by_nodes`])
/// maintained solely by the nodelist's reconciler.
#[derive(Debug)]
#[non_exhaustive]
pub struct Microdesc {
    /// The digest identifying this microdescriptor.
    pub digest: DocDigest,
    /// The relay's Curve25519 onion key.
    pub onion_key: curve25519::PublicKey,
    /// The relay's Ed25519 identity key, if it published one.
    pub ed25519_identity: Option<Ed25519Identity>,
    /// The relay's IPv6 OR address and port, if any.
    pub or_addr6: Option<SocketAddrV6>,
    /// A short summary of the relay's exit policy (the ports it accepts or rejects).
    pub exit_policy: Option<Arc<PortPolicy>>,
    /// Nickname or `$hex` tokens for relays this relay's operator declares as family.
    pub family: Vec<String>,
    /// How many live [`crate::Node`]s currently have this microdescriptor attached.
    ///
    /// Maintained exclusively by [`crate::reconcile`]; the microdescriptor
    /// cache may reclaim an entry once this reaches zero.
    held_by_nodes: std::cell::Cell<u32>,
}

impl Microdesc {
    /// Construct a fresh, unattached microdescriptor.
    pub fn new(
        digest: DocDigest,
        onion_key: curve25519::PublicKey,
        ed25519_identity: Option<Ed25519Identity>,
    ) -> Self {
        Microdesc {
            digest,
            onion_key,
            ed25519_identity,
            or_addr6: None,
            exit_policy: None,
            family: Vec::new(),
            held_by_nodes: std::cell::Cell::new(0),
        }
    }

    /// Return the current number of nodes holding this microdescriptor.
    pub fn held_by_nodes(&self) -> u32 {
        self.held_by_nodes.get()
    }

    /// Increment the held-by-nodes refcount. Called only on attach.
    pub(crate) fn incref(&self) {
        self.held_by_nodes.set(self.held_by_nodes.get() + 1);
    }

    /// Decrement the held-by-nodes refcount. Called only on detach.
    ///
    /// Does nothing (rather than underflowing) if the count is already zero,
    /// which would indicate a bug in the reconciler.
    pub(crate) fn decref(&self) {
        let n = self.held_by_nodes.get();
        debug_assert!(n > 0, "decref on a microdesc with no holders");
        self.held_by_nodes.set(n.saturating_sub(1));
    }
}

/// Which consensus variant is in use.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, strum::Display)]
#[non_exhaustive]
pub enum Flavor {
    /// The full networkstatus consensus, referencing full router descriptors.
    Ns,
    /// The compact consensus, referencing microdescriptors by digest.
    Microdesc,
}

/// A signed document describing the network state at a point in time.
#[derive(Debug)]
#[non_exhaustive]
pub struct Consensus {
    /// Which variant this consensus is.
    pub flavor: Flavor,
    /// One entry per relay the authorities know about.
    pub routerstatuses: Vec<Arc<RouterStatus>>,
    /// Network parameters voted on by the directory authorities.
    pub params: crate::params::NetParams,
    /// Bandwidth-weighting parameters (`Wgg`, `Wmm`, ... in the consensus).
    pub bandwidth_weights: crate::params::NetParams,
    /// Whether a majority of authorities say a given nickname is bound to a
    /// given identity ("Named"), or claimed by a relay not in the consensus
    /// under that name ("Unnamed").
    pub naming: NamingInfo,
}

/// The nickname-binding half of a consensus document.
///
/// Kept separate from the routerstatus list because it is consulted purely
/// textually, by [`crate::accessors::lookup_by_token`], and does not
/// participate in reconciliation.
#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct NamingInfo {
    /// Nicknames bound ("Named") to a specific identity by a consensus majority.
    pub named: std::collections::HashMap<String, RsaIdentity>,
    /// Nicknames claimed by some relay not listed under that name ("Unnamed").
    pub unnamed: std::collections::HashSet<String>,
}

impl Consensus {
    /// Look up the identity that a bare nickname is bound to, if any.
    pub fn binding_for(&self, nickname: &str) -> Option<RsaIdentity> {
        self.naming.named.get(nickname).copied()
    }

    /// Return true if the consensus lists `nickname` as claimed-but-unbound.
    pub fn nickname_is_unnamed(&self, nickname: &str) -> bool {
        self.naming.unnamed.contains(nickname)
    }
}
