//! Error taxonomy for the loading pipeline.

use thiserror::Error;

/// A raw lookup key that could not be normalized into a [`Key`].
///
/// Normalization failures reject only the `load` call that supplied the bad
/// key; they never fail a batch, and nothing is cached under a sentinel.
///
/// [`Key`]: crate::Key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("null is not a valid lookup key")]
    Null,

    #[error("empty string is not a valid lookup key")]
    Empty,

    /// Covers fractional and non-finite numbers as well as integers outside
    /// the identifier range.
    #[error("numeric key {0} is not a representable integer identifier")]
    NonIntegral(String),

    #[error("{0} values cannot be used as lookup keys")]
    Unsupported(&'static str),
}

/// A batch result row could not be attributed to any owning key.
///
/// This means the fetch function violated its foreign-key contract (a row
/// without the tag column the loader groups by). It is a programming error:
/// the whole batch fails rather than returning a partial grouping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row {index} of a batch result carries no recognizable owner key")]
pub struct GroupingFault {
    /// Position of the offending row in the flat batch result.
    pub index: usize,
}

/// Failure of a single `load` call.
#[derive(Debug, Clone, Error)]
pub enum LoadError<E> {
    /// The supplied key failed normalization. Only the offending call is
    /// rejected.
    #[error("invalid lookup key: {0}")]
    Key(#[from] KeyError),

    /// The downstream batch fetch failed. Every waiter of the affected batch
    /// receives a clone of the same failure; there is no automatic retry and
    /// no partial attribution to individual keys.
    #[error("batch fetch failed: {0}")]
    Fetch(E),

    /// The fetch function returned a row the grouper could not attribute.
    #[error(transparent)]
    Grouping(#[from] GroupingFault),
}
