#![cfg_attr(docsrs, feature(doc_auto_cfg))]
// @@ begin lint list maintained by maint/add_warning @@
#![cfg_attr(not(ci_arti_stable), allow(renamed_and_removed_lints))]
#![cfg_attr(not(ci_arti_nightly), allow(unknown_lints))]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::result_large_err)]
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->
//!
//! # tor-nodelist
//!
//! The in-memory directory of known Tor relays, and the directory-readiness
//! estimator that decides whether a client has learned enough of the
//! network to build circuits.
//!
//! This crate owns exactly two responsibilities:
//!
//! * [`NodeList`]/[`Node`]: fusing a relay's router descriptor (`ri`),
//!   consensus entry (`rs`), and microdescriptor (`md`) into a single
//!   [`Node`] handle, kept in sync as those three documents arrive, are
//!   replaced, and expire (see [`Reconciler`]).
//! * [`ReadinessContext`]: deciding, from the current nodelist and consensus
//!   alone, whether the client has enough descriptors for a diverse-enough
//!   set of guard/middle/exit relays to be worth trying to build a circuit.
//!
//! Parsing router descriptors, consensus documents, and microdescriptors is
//! out of scope: callers hand this crate already-parsed documents (as
//! `Arc`s) through [`Reconciler`], and the handful of external subsystems
//! this crate still needs to ask questions of (a microdescriptor cache, a
//! GeoIP database, the entry-guard and bootstrap layers, and the
//! controller's event sink) are modeled as the trait objects in [`traits`].

mod accessors;
mod consistency;
pub mod doc;
mod err;
mod family;
mod node;
mod nodelist;
pub mod params;
mod readiness;
mod reconcile;
pub mod traits;
mod weight;

pub use accessors::{
    get_by_hex_id, get_by_nickname, parse_token, NodeToken, MAX_VERBOSE_NICKNAME_LEN,
};
pub use consistency::{check as check_consistency, Violation};
pub use err::{Error, Result};
pub use family::{in_same_family, mutually_declared_family, FamilySets, SubnetConfig};
pub use node::Node;
pub use nodelist::NodeList;
pub use readiness::{ConsensusPath, DirInfoStatus, ReadinessContext};
pub use reconcile::Reconciler;
pub use weight::{WeightRole, WeightSet};
