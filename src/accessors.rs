//! The uniform read API: accessors that hide which of `ri`/`rs`/`md` backs a
//! given attribute of a [`Node`].
//!
//! Every function here is a pure function of the node's current state. When
//! more than one source can furnish an attribute, callers get a single fixed
//! precedence (documented per accessor) rather than having to know which
//! sub-record to consult -- that's the whole point of the `Node` union (see
//! the module docs on [`crate::node`]).

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::rc::Rc;

use tor_llcrypto::pk::{curve25519, ed25519::Ed25519Identity, rsa::RsaIdentity};

use crate::doc::{Consensus, RelayFlags};
use crate::err::Error;
use crate::node::Node;
use crate::nodelist::NodeList;

/// Maximum length, in bytes, of a formatted verbose nickname.
///
/// `$` + 40 hex digits + `=` or `~` + a generously long nickname.
pub const MAX_VERBOSE_NICKNAME_LEN: usize = 1 + 40 + 1 + 19;

impl Node {
    /// This node's nickname, if either source provides one.
    ///
    /// Prefers the consensus's nickname, since that's the one other clients
    /// will recognize when asked to name this relay.
    pub fn nickname(&self) -> Option<String> {
        self.rs()
            .map(|rs| rs.nickname.clone())
            .or_else(|| self.ri().map(|ri| ri.nickname.clone()))
    }

    /// This node's RSA identity digest.
    ///
    /// Always available: it's the node's primary key.
    pub fn rsa_id_digest(&self) -> RsaIdentity {
        self.identity()
    }

    /// This node's Ed25519 identity key, if any source provides a nonzero one.
    ///
    /// Prefers `ri`'s signing-key certificate over `md`'s key. An all-zero
    /// key is the result of a malformed descriptor rather than a real
    /// identity, so it's treated as absent.
    pub fn ed25519_id(&self) -> Option<Ed25519Identity> {
        let nonzero = |k: &Ed25519Identity| !k.as_bytes().iter().all(|b| *b == 0);
        self.ri()
            .and_then(|ri| ri.signing_key)
            .filter(nonzero)
            .or_else(|| self.md().and_then(|md| md.ed25519_identity).filter(nonzero))
    }

    /// Whether this node is usable as a (legacy, v2) directory cache.
    pub fn is_dir(&self) -> bool {
        if let Some(rs) = self.rs() {
            rs.flags.contains(RelayFlags::V2_DIR)
        } else if let Some(ri) = self.ri() {
            ri.supports_tunnelled_dir_requests
        } else {
            false
        }
    }

    /// Whether we have enough of a descriptor to build a circuit through this node.
    ///
    /// True if we have a full `ri`, or both an `rs` and the `md` it refers to.
    pub fn has_descriptor(&self) -> bool {
        self.ri().is_some() || (self.rs().is_some() && self.md().is_some())
    }

    /// Whether this node's exit policy is known to reject every port.
    ///
    /// Absence of information is treated as rejection -- a node we can't
    /// evaluate is not safe to use as an exit.
    pub fn exit_policy_rejects_all(&self) -> bool {
        if self.rejects_all.get() {
            return true;
        }
        if let Some(ri) = self.ri() {
            return !ri.exit_policy.allows_some_port();
        }
        if let Some(md) = self.md() {
            if let Some(policy) = &md.exit_policy {
                return !policy.allows_some_port();
            }
        }
        true
    }

    /// This node's primary (IPv4) OR address and port, if any source provides one.
    ///
    /// `md` never carries an IPv4 address.
    pub fn prim_orport(&self) -> Option<SocketAddrV4> {
        self.ri()
            .map(|ri| ri.or_addr)
            .or_else(|| self.rs().map(|rs| rs.or_addr))
    }

    /// This node's preferred IPv6 OR address and port, if any source provides
    /// a valid one.
    ///
    /// Checked in `ri`, then `rs`, then `md` order, validating at each step
    /// (an address with an unspecified/zero host is treated as absent).
    pub fn pref_ipv6_orport(&self) -> Option<SocketAddrV6> {
        fn valid(a: &SocketAddrV6) -> bool {
            !a.ip().is_unspecified()
        }
        self.ri()
            .and_then(|ri| ri.or_addr6)
            .filter(valid)
            .or_else(|| self.rs().and_then(|rs| rs.or_addr6).filter(valid))
            .or_else(|| self.md().and_then(|md| md.or_addr6).filter(valid))
    }

    /// The OR address we should actually connect to, honoring IPv6 preference.
    ///
    /// Returns the IPv6 address when `use_ipv6` is true and either this node
    /// prefers IPv6 or has no IPv4 address at all; otherwise returns IPv4.
    pub fn pref_orport(&self, use_ipv6: bool) -> Option<SocketAddr> {
        let v4 = self.prim_orport().map(SocketAddr::V4);
        let v6 = self.pref_ipv6_orport().map(SocketAddr::V6);
        if use_ipv6 && (self.ipv6_preferred.get() || v4.is_none()) {
            v6.or(v4)
        } else {
            v4.or(v6)
        }
    }

    /// Every OR address/port this node can be reached at: up to one IPv4
    /// entry followed by up to one IPv6 entry, in the same source order as
    /// the single-address accessors.
    pub fn all_orports(&self) -> Vec<SocketAddr> {
        let mut out = Vec::with_capacity(2);
        if let Some(v4) = self.prim_orport() {
            out.push(SocketAddr::V4(v4));
        }
        if let Some(v6) = self.pref_ipv6_orport() {
            out.push(SocketAddr::V6(v6));
        }
        out
    }

    /// The family tokens this node's operator declared, if any source provides them.
    pub fn declared_family(&self) -> Vec<String> {
        if let Some(ri) = self.ri() {
            if !ri.declared_family.is_empty() {
                return ri.declared_family.clone();
            }
        }
        if let Some(md) = self.md() {
            return md.family.clone();
        }
        Vec::new()
    }

    /// Whether this node advertises support for the v3 Ed25519 link handshake.
    ///
    /// Requires an Ed25519 identity; then either `ri`'s protocol list must
    /// advertise `LinkAuth>=3`, or the consensus must have flagged it.
    pub fn supports_ed25519_link_auth(&self) -> bool {
        if self.ed25519_id().is_none() {
            return false;
        }
        let ri_says_so = self
            .ri()
            .map(|ri| protocol_list_has_linkauth3(&ri.protocols))
            .unwrap_or(false);
        let rs_says_so = self
            .rs()
            .map(|rs| rs.supports_ed25519_link_handshake)
            .unwrap_or(false);
        ri_says_so || rs_says_so
    }

    /// This node's Curve25519 onion key, if any source provides one.
    pub fn onion_key(&self) -> Option<curve25519::PublicKey> {
        self.ri()
            .and_then(|ri| ri.onion_key)
            .or_else(|| self.md().map(|md| md.onion_key))
    }

    /// Render this node's identity (and, if known, nickname) in the
    /// `$hex`, `$hex~nickname`, or `$hex=nickname` verbose-nickname format.
    ///
    /// Uses `=` when `named` is true (the consensus binds this nickname to
    /// this identity), and `~` otherwise. The result is always within
    /// [`MAX_VERBOSE_NICKNAME_LEN`] bytes.
    pub fn verbose_nickname(&self, named: bool) -> String {
        let mut s = format!("{}", self.identity());
        if let Some(nick) = self.nickname() {
            let sep = if named { '=' } else { '~' };
            s.push(sep);
            s.push_str(&nick);
        }
        s.truncate(MAX_VERBOSE_NICKNAME_LEN);
        s
    }
}

/// Return true if a Tor protocol-versions string (e.g. `"LinkAuth=1,3
/// Link=3-5"`) advertises `LinkAuth` version 3 or higher.
fn protocol_list_has_linkauth3(protocols: &str) -> bool {
    for entry in protocols.split_whitespace() {
        let Some((name, versions)) = entry.split_once('=') else {
            continue;
        };
        if name != "LinkAuth" {
            continue;
        }
        for range in versions.split(',') {
            let hi = range.split('-').next_back().unwrap_or(range);
            if hi.parse::<u32>().map(|v| v >= 3).unwrap_or(false) {
                return true;
            }
        }
    }
    false
}

/// A token naming a node, as parsed by [`parse_token`]: one of the four
/// forms a user or config file can write.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NodeToken {
    /// A bare nickname: `Alice`.
    Nickname(String),
    /// `$hex`: select by identity alone.
    Hex(RsaIdentity),
    /// `$hex=nickname`: identity, plus a required consensus binding.
    HexNamed(RsaIdentity, String),
    /// `$hex~nickname`: identity, plus a required (but unverified) nickname match.
    HexUnverified(RsaIdentity, String),
}

/// Parse one of the four node-reference forms described in the crate docs:
/// `name`, `$hex`, `$hex=name`, `$hex~name`.
///
/// # Errors
///
/// Returns [`Error::BadHexId`] if `s` is empty, or starts with `$` but the
/// hex portion isn't a well-formed 20-byte identity.
pub fn parse_token(s: &str) -> Result<NodeToken, Error> {
    let Some(rest) = s.strip_prefix('$') else {
        if s.is_empty() {
            return Err(Error::BadHexId(s.to_string()));
        }
        return Ok(NodeToken::Nickname(s.to_string()));
    };
    let (hex, name) = if let Some((h, n)) = rest.split_once('=') {
        (h, Some((n, true)))
    } else if let Some((h, n)) = rest.split_once('~') {
        (h, Some((n, false)))
    } else {
        (rest, None)
    };
    let id = RsaIdentity::from_hex(hex).ok_or_else(|| Error::BadHexId(s.to_string()))?;
    Ok(match name {
        None => NodeToken::Hex(id),
        Some((n, true)) => NodeToken::HexNamed(id, n.to_string()),
        Some((n, false)) => NodeToken::HexUnverified(id, n.to_string()),
    })
}

/// Look up a node by a bare (non-`$hex`) nickname.
///
/// Tries the consensus's "Named" binding first; if the consensus instead
/// lists the name as "Unnamed", the lookup fails outright (some other relay
/// claims this name without authority backing). Otherwise falls back to a
/// case-insensitive linear scan of every live node, warning once and
/// returning the first match if more than one node shares the name.
pub fn get_by_nickname(nodes: &NodeList, consensus: Option<&Consensus>, name: &str) -> Option<Rc<Node>> {
    if let Some(consensus) = consensus {
        if let Some(id) = consensus.binding_for(name) {
            return nodes.get(&id);
        }
        if consensus.nickname_is_unnamed(name) {
            return None;
        }
    }
    let mut found: Option<Rc<Node>> = None;
    for node in nodes.iter() {
        if node.nickname().is_some_and(|n| n.eq_ignore_ascii_case(name)) {
            match &found {
                None => found = Some(Rc::clone(node)),
                Some(_) => {
                    node.warn_name_lookup_once();
                    break;
                }
            }
        }
    }
    found
}

/// Look up a node by one of the four [`parse_token`] forms.
///
/// `$hex=name` additionally requires the consensus to bind `name` to that
/// identity; `$hex~name` only requires the node's own nickname to match.
///
/// # Errors
///
/// Returns [`Error::BadHexId`] if `token` doesn't parse as any of the four
/// forms; a well-formed token that simply names no current node is `Ok(None)`,
/// not an error.
pub fn get_by_hex_id(
    nodes: &NodeList,
    consensus: Option<&Consensus>,
    token: &str,
) -> Result<Option<Rc<Node>>, Error> {
    Ok(match parse_token(token)? {
        NodeToken::Nickname(name) => get_by_nickname(nodes, consensus, &name),
        NodeToken::Hex(id) => nodes.get(&id),
        NodeToken::HexNamed(id, name) => {
            let bound = consensus.and_then(|c| c.binding_for(&name)) == Some(id);
            bound.then(|| nodes.get(&id)).flatten()
        }
        NodeToken::HexUnverified(id, name) => {
            let node = nodes.get(&id);
            node.filter(|node| node.nickname().is_some_and(|n| n.eq_ignore_ascii_case(&name)))
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc::{RelayWeight, RouterStatus};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;

    fn rs(id: RsaIdentity, nick: &str) -> Arc<RouterStatus> {
        Arc::new(RouterStatus {
            identity: id,
            descriptor_digest: [0; 32],
            nickname: nick.into(),
            or_addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9001),
            or_addr6: None,
            dir_port: None,
            flags: RelayFlags::empty(),
            supports_ed25519_link_handshake: false,
            weight: RelayWeight::Unmeasured(0),
        })
    }

    #[test]
    fn nickname_prefers_rs() {
        let n = Node::new(RsaIdentity::from([1; 20]));
        n.set_rs(Some(rs(n.identity(), "FromConsensus")));
        assert_eq!(n.nickname().as_deref(), Some("FromConsensus"));
    }

    #[test]
    fn verbose_nickname_forms() {
        let n = Node::new(RsaIdentity::from([0xAB; 20]));
        assert!(n.verbose_nickname(false).starts_with('$'));
        n.set_rs(Some(rs(n.identity(), "Relay1")));
        let vn = n.verbose_nickname(true);
        assert!(vn.ends_with("=Relay1"));
        let vn = n.verbose_nickname(false);
        assert!(vn.ends_with("~Relay1"));
    }

    #[test]
    fn token_parsing() {
        let hex = "0".repeat(40);
        assert_eq!(
            parse_token("Alice").unwrap(),
            NodeToken::Nickname("Alice".into())
        );
        assert_eq!(
            parse_token(&format!("${hex}")).unwrap(),
            NodeToken::Hex(RsaIdentity::from([0; 20]))
        );
        assert_eq!(
            parse_token(&format!("${hex}=Alice")).unwrap(),
            NodeToken::HexNamed(RsaIdentity::from([0; 20]), "Alice".into())
        );
        assert_eq!(
            parse_token(&format!("${hex}~Alice")).unwrap(),
            NodeToken::HexUnverified(RsaIdentity::from([0; 20]), "Alice".into())
        );
        assert!(matches!(
            parse_token("$notvalidhex"),
            Err(Error::BadHexId(s)) if s == "$notvalidhex"
        ));
        assert!(matches!(parse_token(""), Err(Error::BadHexId(s)) if s.is_empty()));
    }

    #[test]
    fn token_parsing_with_realistic_identity() {
        let bytes = hex_literal::hex!("0011223344556677889900112233445566778899");
        let id = RsaIdentity::from(bytes);
        let token = format!("${id}=Carol");
        assert_eq!(parse_token(&token).unwrap(), NodeToken::HexNamed(id, "Carol".into()));
    }

    #[test]
    fn token_lookup_by_nickname_and_hex() {
        let mut nodes = NodeList::new();
        let id = RsaIdentity::from([7; 20]);
        let node = nodes.get_or_create(id);
        node.set_rs(Some(rs(id, "Alice")));

        assert!(Rc::ptr_eq(&get_by_nickname(&nodes, None, "alice").unwrap(), &node));
        assert!(get_by_nickname(&nodes, None, "nobody").is_none());

        let hex = format!("{id}");
        assert!(Rc::ptr_eq(
            &get_by_hex_id(&nodes, None, &format!("${hex}")).unwrap().unwrap(),
            &node
        ));
        assert!(Rc::ptr_eq(
            &get_by_hex_id(&nodes, None, &format!("${hex}~Alice")).unwrap().unwrap(),
            &node
        ));
        assert!(get_by_hex_id(&nodes, None, &format!("${hex}~Bob")).unwrap().is_none());
        assert!(get_by_hex_id(&nodes, None, "$notvalidhex").is_err());
    }

    #[test]
    fn linkauth_detection() {
        assert!(protocol_list_has_linkauth3("Link=3-5 LinkAuth=1,3"));
        assert!(protocol_list_has_linkauth3("LinkAuth=3-4"));
        assert!(!protocol_list_has_linkauth3("LinkAuth=1,2"));
        assert!(!protocol_list_has_linkauth3("Link=3-5"));
    }
}
