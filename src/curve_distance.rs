//! Symmetric curve distance between two polylines.
//!
//! For every vertex of one polyline take its minimum haversine distance to
//! any vertex of the other, keep the maximum of those minima, and do the
//! same in the opposite direction; the metric is the larger of the two
//! directed values (a discrete Hausdorff-style measure). Two traces of the
//! same physical route score near zero regardless of sampling offsets,
//! while a single diverging detour pushes the score up.
//!
//! O(n*m) per pair; n and m are bounded by the per-trace sample cap applied
//! during normalization, and candidate sets are bounded by the spatial
//! prefilter, so no index structure is needed here.

use crate::geometry::{PathPoint, haversine_distance};

/// Largest minimum-distance from any vertex of `from` to the vertices of
/// `onto`, in metres.
fn directed_max_min(from: &[PathPoint], onto: &[PathPoint]) -> f64 {
    if from.is_empty() || onto.is_empty() {
        return f64::INFINITY;
    }

    from.iter()
        .map(|p| {
            onto.iter()
                .map(|q| haversine_distance(p, q))
                .fold(f64::INFINITY, f64::min)
        })
        .fold(0.0, f64::max)
}

/// Symmetric curve distance in metres. Empty inputs are infinitely far
/// apart, which naturally fails any match threshold.
pub fn curve_distance(a: &[PathPoint], b: &[PathPoint]) -> f64 {
    directed_max_min(a, b).max(directed_max_min(b, a))
}
