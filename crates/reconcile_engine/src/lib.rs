//! Reconciles SEARCH/REPLACE edit fragments against an original file.
//!
//! Fragments may arrive while the model is still streaming. [`Reconciler`]
//! confirms fragments once they can no longer change and previews the last
//! one, so an editor can show the file converging on its final state.

mod diagnostics;
mod error;
mod fragment;
mod matcher;
mod reconciler;

pub use diagnostics::{closest_region, describe_mismatch, ClosestRegion};
pub use error::{FragmentParseError, ReconcileError};
pub use fragment::{parse_fragments, EditFragment};
pub use matcher::{
    block_anchor_match, exact_match, find_match, line_trimmed_match, MatchStrategy, Matcher,
    CASCADE,
};
pub use reconciler::{
    reconcile, FragmentMatch, ProvisionalEdit, ReconcileUpdate, Reconciler, Reconciliation,
};

/// Parses `diff` and applies every fragment to `original`.
pub fn apply_diff(original: &str, diff: &str) -> Result<Reconciliation, ReconcileError> {
    let fragments = parse_fragments(diff)?;
    reconcile(original, &fragments, true)
}
