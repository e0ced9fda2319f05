//! Decides whether a freshly derived candidate corroborates an existing
//! pending contribution or starts a new one.
//!
//! Two stages: the store's spatial prefilter bounds the candidate set, then
//! the curve-distance metric is computed in-process per survivor. At most
//! one match comes back: the closest candidate under the threshold, ties
//! broken by earliest creation so replays converge on the same row.

use ordered_float::OrderedFloat;

use crate::curve_distance::curve_distance;
use crate::geometry::RouteGeometry;
use crate::store::{ConsensusStore, Contribution, StoreError};

/// A prefilter survivor with its computed curve distance.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub contribution: Contribution,
    pub distance: f64,
}

/// Picks the winning candidate among scored survivors, or none when no
/// distance clears the threshold.
pub fn select_best(
    candidates: Vec<ScoredCandidate>,
    match_threshold_m: f64,
) -> Option<ScoredCandidate> {
    candidates
        .into_iter()
        .filter(|c| c.distance < match_threshold_m)
        .min_by_key(|c| {
            (
                OrderedFloat(c.distance),
                c.contribution.created_at,
                c.contribution.id,
            )
        })
}

/// Runs the full match: spatial prefilter against the store, curve distance
/// per candidate, then threshold selection.
pub async fn find_match<S: ConsensusStore>(
    store: &S,
    geometry: &RouteGeometry,
    match_radius_m: f64,
    match_threshold_m: f64,
) -> Result<Option<ScoredCandidate>, StoreError> {
    let nearby = store
        .pending_within(&geometry.envelope, match_radius_m)
        .await?;

    let scored = nearby
        .into_iter()
        .map(|contribution| ScoredCandidate {
            distance: curve_distance(&geometry.points, &contribution.points),
            contribution,
        })
        .collect();

    Ok(select_best(scored, match_threshold_m))
}
