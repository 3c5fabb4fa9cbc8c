//! A usable view of Tor network parameters.
//!
//! The consensus carries a `params` line of `key=value` integers voted on by
//! the directory authorities, used to tune numerous aspects of client
//! behavior. This module gives callers a single typed way to read one --
//! [`NetParams::get`] -- clamping out-of-range values the way the rest of
//! the client is expected to (see `tor-netdir`'s `declare_net_parameters!`
//! macro, which this is a deliberately smaller cousin of: we don't need a
//! whole typed parameter table, just the handful the readiness estimator
//! and weight calculations consult).

use std::collections::HashMap;

/// A set of consensus (or bandwidth-weight) parameters, as `key=value` pairs.
#[derive(Debug, Clone, Default)]
pub struct NetParams(HashMap<String, i32>);

impl NetParams {
    /// Construct a `NetParams` from an iterator of key/value pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, i32)>,
        K: Into<String>,
    {
        NetParams(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Return the raw value for `name`, if the consensus set one.
    pub fn get_raw(&self, name: &str) -> Option<i32> {
        self.0.get(name).copied()
    }

    /// Return the value for `name`, falling back to `default` if absent, and
    /// clamping the result to `[lo, hi]`.
    ///
    /// This mirrors the `NetworkStatus::get_param` capability described in
    /// the crate's external-interfaces section: out-of-range consensus
    /// values are clamped rather than rejected, since a single malicious or
    /// buggy authority should not be able to push a client out-of-bounds.
    pub fn get(&self, name: &str, default: i32, lo: i32, hi: i32) -> i32 {
        debug_assert!(lo <= hi);
        self.0
            .get(name)
            .copied()
            .unwrap_or(default)
            .clamp(lo.min(hi), hi.max(lo))
    }
}

/// The default bound on how old a consensus can be and still be "reasonably
/// live", in seconds.
pub const DEFAULT_REASONABLY_LIVE_SECS: i32 = 24 * 60 * 60;

/// Name of the consensus parameter giving the percentage of estimated path
/// bandwidth needed before we'll say we have enough directory information.
pub const PARAM_MIN_PATHS_FOR_CIRCS_PCT: &str = "min_paths_for_circs_pct";

/// Default value for [`PARAM_MIN_PATHS_FOR_CIRCS_PCT`], as a percentage.
pub const DEFAULT_MIN_PATHS_FOR_CIRCS_PCT: i32 = 60;

/// Lower bound on [`PARAM_MIN_PATHS_FOR_CIRCS_PCT`], as a percentage.
pub const MIN_MIN_PATHS_FOR_CIRCS_PCT: i32 = 25;

/// Upper bound on [`PARAM_MIN_PATHS_FOR_CIRCS_PCT`], as a percentage.
pub const MAX_MIN_PATHS_FOR_CIRCS_PCT: i32 = 95;

/// Name of the consensus parameter giving the overall bandwidth-weight scale.
pub const PARAM_BW_WEIGHT_SCALE: &str = "bwweightscale";

/// Default value for [`PARAM_BW_WEIGHT_SCALE`].
pub const DEFAULT_BW_WEIGHT_SCALE: i32 = 10_000;
