//! Declare error type for tor-nodelist

use thiserror::Error;
use tor_error::Bug;

/// An error returned by the nodelist code.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// We don't have enough directory information to build circuits.
    #[error("not enough directory information to build circuits")]
    NotEnoughInfo,

    /// A caller asked for a node by hex identity, and the token didn't parse.
    #[error("could not parse hex identity token {0:?}")]
    BadHexId(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Bug(#[from] Bug),
}

/// A Result using the Error type from the tor-nodelist crate.
pub type Result<T> = std::result::Result<T, Error>;
