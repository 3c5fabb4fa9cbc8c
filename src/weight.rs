//! Bandwidth-weighted fractions, used by the readiness estimator to turn
//! "how many usable relays do we have" into "how much of the network's
//! guard/middle/exit capacity do those relays represent".
//!
//! The math here follows the consensus bandwidth-weighting scheme (the
//! `Wgg`, `Wmm`, `Wee`, ... parameters), adapted from `tor-netdir`'s relay
//! selection weights to compute an aggregate fraction instead of picking a
//! single relay.

use crate::doc::{RelayFlags, RelayWeight as DocRelayWeight, RouterStatus};
use crate::params::NetParams;
use bitflags::bitflags;

/// Which bandwidth role a fraction is being computed for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum WeightRole {
    /// Acting as an entry guard.
    Guard,
    /// Acting as a middle relay.
    Middle,
    /// Acting as an exit.
    Exit,
    /// No role-specific weighting; every relay counts equally.
    Unweighted,
}

/// How to derive a relay's base bandwidth from its consensus weight.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BandwidthFn {
    /// No usable weights anywhere: treat every relay as weight 1.
    Uniform,
    /// No measured weights anywhere: count unmeasured weights as-is.
    IncludeUnmeasured,
    /// Measured weights exist: only count those, ignoring unmeasured relays.
    MeasuredOnly,
}

impl BandwidthFn {
    /// Pick the right function to apply, given every relay weight the
    /// consensus carries.
    fn pick<'a, I>(mut weights: I) -> BandwidthFn
    where
        I: Clone + Iterator<Item = &'a DocRelayWeight>,
    {
        let has_measured = weights.clone().any(|w| w.is_measured());
        let has_nonzero = weights.clone().any(|w| w.is_nonzero());
        let has_nonzero_measured = weights.any(|w| w.is_measured() && w.is_nonzero());

        if !has_nonzero {
            BandwidthFn::Uniform
        } else if !has_measured {
            BandwidthFn::IncludeUnmeasured
        } else if has_nonzero_measured {
            BandwidthFn::MeasuredOnly
        } else {
            BandwidthFn::Uniform
        }
    }

    /// Apply this function to one relay's consensus weight.
    fn apply(&self, w: &DocRelayWeight) -> u32 {
        use BandwidthFn::*;
        use DocRelayWeight::*;
        match (self, w) {
            (Uniform, _) => 1,
            (IncludeUnmeasured, Unmeasured(u)) => *u,
            (IncludeUnmeasured, Measured(m)) => *m,
            (MeasuredOnly, Unmeasured(_)) => 0,
            (MeasuredOnly, Measured(m)) => *m,
        }
    }
}

/// Per-role weighting factors for one kind of relay (combination of Guard,
/// Exit and V2Dir flags).
#[derive(Clone, Debug, Copy, Default)]
struct RoleWeights {
    as_guard: u32,
    as_middle: u32,
    as_exit: u32,
    as_dir: u32,
}

impl std::ops::Mul<u32> for RoleWeights {
    type Output = Self;
    fn mul(self, rhs: u32) -> Self {
        RoleWeights {
            as_guard: self.as_guard * rhs,
            as_middle: self.as_middle * rhs,
            as_exit: self.as_exit * rhs,
            as_dir: self.as_dir * rhs,
        }
    }
}

impl std::ops::Div<u32> for RoleWeights {
    type Output = Self;
    fn div(self, rhs: u32) -> Self {
        RoleWeights {
            as_guard: self.as_guard / rhs,
            as_middle: self.as_middle / rhs,
            as_exit: self.as_exit / rhs,
            as_dir: self.as_dir / rhs,
        }
    }
}

impl RoleWeights {
    fn max_weight(&self) -> u32 {
        [self.as_guard, self.as_middle, self.as_exit, self.as_dir]
            .into_iter()
            .max()
            .unwrap_or(0)
    }

    fn for_role(&self, role: WeightRole) -> u32 {
        match role {
            WeightRole::Guard => self.as_guard,
            WeightRole::Middle => self.as_middle,
            WeightRole::Exit => self.as_exit,
            WeightRole::Unweighted => 1,
        }
    }
}

bitflags! {
    /// Which scarce-capability flags a relay has, for weight-table lookup.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct WeightKind: u8 {
        const GUARD = 1 << 0;
        const EXIT = 1 << 1;
        const DIR = 1 << 2;
    }
}

impl WeightKind {
    fn for_rs(rs: &RouterStatus) -> Self {
        let mut r = WeightKind::empty();
        if rs.flags.contains(RelayFlags::GUARD) {
            r |= WeightKind::GUARD;
        }
        if rs.flags.contains(RelayFlags::EXIT) && !rs.flags.contains(RelayFlags::BAD_EXIT) {
            r |= WeightKind::EXIT;
        }
        if rs.flags.contains(RelayFlags::V2_DIR) {
            r |= WeightKind::DIR;
        }
        r
    }

    fn idx(self) -> usize {
        self.bits() as usize
    }
}

/// A computed set of per-kind, per-role weighting factors, derived from one
/// consensus's bandwidth-weight parameters.
///
/// Once built, [`WeightSet::weight_rs_for_role`] gives the 64-bit weight to
/// use for a single routerstatus for a given role; summing those over a set
/// of usable relays and dividing by the sum over the whole consensus gives
/// the `f_guard`/`f_mid`/`f_exit` fractions the readiness estimator needs.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct WeightSet {
    bandwidth_fn: BandwidthFn,
    /// Right-shift applied to each weighted product, to keep the sum under `u64::MAX`.
    shift: u8,
    w: [RoleWeights; 8],
}

impl WeightSet {
    /// Compute the weight to use for `rs` for `role`.
    ///
    /// This does not check whether `rs` is actually eligible for `role` --
    /// callers are expected to have already filtered by flags.
    pub fn weight_rs_for_role(&self, rs: &RouterStatus, role: WeightRole) -> u64 {
        self.weight_bw_for_role(WeightKind::for_rs(rs), &rs.weight, role)
    }

    fn weight_bw_for_role(&self, kind: WeightKind, relay_weight: &DocRelayWeight, role: WeightRole) -> u64 {
        let ws = &self.w[kind.idx()];
        let router_bw = self.bandwidth_fn.apply(relay_weight);
        let router_weight = u64::from(router_bw) * u64::from(ws.for_role(role));
        router_weight >> self.shift
    }

    /// Build a `WeightSet` from a consensus's routerstatuses and its
    /// bandwidth-weight parameters (the `Wgg`, `Wee`, ... values).
    pub fn from_consensus(routerstatuses: &[std::sync::Arc<RouterStatus>], bandwidth_weights: &NetParams) -> Self {
        let bandwidth_fn = BandwidthFn::pick(routerstatuses.iter().map(|rs| &rs.weight));
        let weight_scale = bandwidth_weights
            .get_raw(crate::params::PARAM_BW_WEIGHT_SCALE)
            .unwrap_or(crate::params::DEFAULT_BW_WEIGHT_SCALE) as u32;
        let total_bw: u64 = routerstatuses
            .iter()
            .map(|rs| u64::from(bandwidth_fn.apply(&rs.weight)))
            .sum();
        Self::from_parts(bandwidth_fn, total_bw, weight_scale, bandwidth_weights)
    }

    fn from_parts(bandwidth_fn: BandwidthFn, total_bw: u64, weight_scale: u32, p: &NetParams) -> Self {
        fn single(p: &NetParams, g: &str, m: &str, e: &str, d: &str) -> RoleWeights {
            RoleWeights {
                as_guard: w_param(p, g),
                as_middle: w_param(p, m),
                as_exit: w_param(p, e),
                as_dir: w_param(p, d),
            }
        }

        let weight_scale = weight_scale.max(1);

        let w_none = single(p, "Wgm", "Wmm", "Wem", "Wbm");
        let w_guard = single(p, "Wgg", "Wmg", "Weg", "Wbg");
        let w_exit = single(p, "---", "Wme", "Wee", "Wbe");
        let w_both = single(p, "Wgd", "Wmd", "Wed", "Wbd");

        let w = [
            w_none,
            w_guard,
            w_exit,
            w_both,
            (w_none * w_param(p, "Wmb")) / weight_scale,
            (w_guard * w_param(p, "Wgb")) / weight_scale,
            (w_exit * w_param(p, "Web")) / weight_scale,
            (w_both * w_param(p, "Wdb")) / weight_scale,
        ];

        let w_max = w.iter().map(RoleWeights::max_weight).max().unwrap_or(0);
        let shift = calculate_shift(total_bw, u64::from(w_max)) as u8;

        WeightSet {
            bandwidth_fn,
            shift,
            w,
        }
    }
}

/// Value to use for a missing weight parameter.
const DFLT_WEIGHT: i32 = 1;

/// Read weight parameter `kwd` from `p`, clamped to a non-negative `u32`.
/// `"---"` (a parameter the consensus never assigns) is always 0.
fn w_param(p: &NetParams, kwd: &str) -> u32 {
    if kwd == "---" {
        0
    } else {
        clamp_to_pos(p.get_raw(kwd).unwrap_or(DFLT_WEIGHT))
    }
}

/// Clamp a possibly-negative consensus value to `u32`.
fn clamp_to_pos(inp: i32) -> u32 {
    if inp < 0 {
        0
    } else {
        inp as u32
    }
}

/// Compute a shift such that `(a * b) >> shift` fits in 64 bits.
fn calculate_shift(a: u64, b: u64) -> u32 {
    let bits_for_product = log2_upper(a) + log2_upper(b);
    bits_for_product.saturating_sub(64)
}

/// An upper bound on log2(n); overestimates at powers of two.
fn log2_upper(n: u64) -> u32 {
    64 - n.leading_zeros()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::NetParams;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tor_llcrypto::pk::rsa::RsaIdentity;

    #[test]
    fn clamp_and_log() {
        assert_eq!(clamp_to_pos(32), 32);
        assert_eq!(clamp_to_pos(-1), 0);
        assert_eq!(log2_upper(u64::MAX), 64);
        assert_eq!(log2_upper(0), 0);
        assert_eq!(log2_upper(1), 1);
    }

    #[test]
    fn shift_keeps_product_in_range() {
        assert_eq!(calculate_shift(1 << 20, 1 << 20), 0);
        let shift = calculate_shift(1 << 50, 1 << 20);
        assert!(((1u64 << 50) >> shift).checked_mul(1 << 20).is_some());
    }

    fn rs(id: u8, flags: RelayFlags, weight: DocRelayWeight) -> std::sync::Arc<RouterStatus> {
        std::sync::Arc::new(RouterStatus {
            identity: RsaIdentity::from([id; 20]),
            descriptor_digest: [0; 32],
            nickname: "x".into(),
            or_addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9001),
            or_addr6: None,
            dir_port: None,
            flags,
            supports_ed25519_link_handshake: false,
            weight,
        })
    }

    #[test]
    fn weightset_basic() {
        let params = NetParams::from_pairs([
            ("Wbd", 0), ("Wbe", 0), ("Wbg", 4096), ("Wbm", 10000),
            ("Wdb", 10000), ("Web", 10000), ("Wed", 10000), ("Wee", 10000),
            ("Weg", 10000), ("Wem", 10000), ("Wgb", 10000), ("Wgd", 0),
            ("Wgg", 5904), ("Wgm", 5904), ("Wmb", 10000), ("Wmd", 0),
            ("Wme", 0), ("Wmg", 4096), ("Wmm", 10000),
        ]);
        let ws = WeightSet::from_parts(BandwidthFn::MeasuredOnly, 1_000_000_000, 10000, &params);
        assert_eq!(ws.bandwidth_fn, BandwidthFn::MeasuredOnly);
        assert_eq!(ws.shift, 0);

        let relay = rs(1, RelayFlags::GUARD | RelayFlags::V2_DIR, DocRelayWeight::Measured(7777));
        assert_eq!(ws.weight_rs_for_role(&relay, WeightRole::Guard), 7777 * 5904);
        assert_eq!(ws.weight_rs_for_role(&relay, WeightRole::Middle), 7777 * 4096);
        assert_eq!(ws.weight_rs_for_role(&relay, WeightRole::Unweighted), 7777);
    }

    #[test]
    fn pick_bandwidth_fn_cases() {
        let all_zero = [DocRelayWeight::Unmeasured(0), DocRelayWeight::Measured(0)];
        assert_eq!(BandwidthFn::pick(all_zero.iter()), BandwidthFn::Uniform);

        let unmeasured_only = [DocRelayWeight::Unmeasured(9), DocRelayWeight::Unmeasured(4)];
        assert_eq!(
            BandwidthFn::pick(unmeasured_only.iter()),
            BandwidthFn::IncludeUnmeasured
        );

        let mixed = [DocRelayWeight::Unmeasured(9), DocRelayWeight::Measured(4)];
        assert_eq!(BandwidthFn::pick(mixed.iter()), BandwidthFn::MeasuredOnly);
    }
}
