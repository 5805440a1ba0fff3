pub mod cache;
pub mod dfa;
pub mod error;
pub mod index;
pub mod prelude;
pub mod primitives;
pub mod vocabulary;

use std::sync::Arc;

pub use error::Error;
pub use error::Result;

use index::LazyIndex;
use vocabulary::Vocabulary;

/// Builds a lazy token-level index for `regex`, or returns the live handle
/// already built for the same `(regex, vocabulary)` pair.
///
/// The returned handle is usable immediately: the index is computed by
/// background workers and queries block only for the specific state they need.
pub fn build(regex: &str, vocabulary: &Vocabulary) -> Result<Arc<LazyIndex>> {
    cache::cache().get_or_build(regex, vocabulary)
}
