//! Periodic collapse of near-duplicate pending candidates.
//!
//! Traces that arrive out of order, or that were matched against different
//! candidates by racing batches, can leave several pending contributions
//! describing the same physical route. This pass pairs pending candidates
//! under a coarse envelope prefilter, scores survivors with the curve
//! metric under a threshold tighter than the live matcher's, and folds the
//! newer candidate of each surviving pair into the older one. Creation
//! order stands in for row order; the ids are uuids and carry no ordering.
//!
//! A candidate merged during the pass takes no further part in pairing, so
//! chains never collapse transitively in a single run.

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rstar::{AABB, RTree, RTreeObject};
use tracing::{info, warn};
use uuid::Uuid;

use crate::consensus::{ConsensusConfig, promote_contribution};
use crate::curve_distance::curve_distance;
use crate::geometry::meters_to_degrees;
use crate::store::{CasOutcome, ConsensusStore, Contribution, StoreError};

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Coarse envelope prefilter, metres. Pairs further apart than this are
    /// never scored.
    pub prefilter_radius_m: f64,
    /// Curve-distance ceiling for a merge, metres. Tighter than the live
    /// match threshold since this pass runs without a fresh trace to back
    /// the decision.
    pub merge_threshold_m: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            prefilter_radius_m: 300.0,
            merge_threshold_m: 150.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePair {
    /// The newer contribution, to be folded away.
    pub source: Uuid,
    /// The older contribution that absorbs it.
    pub target: Uuid,
}

#[derive(Debug, Default, Clone)]
pub struct MergeStats {
    pub pending_examined: u64,
    pub pairs_planned: u64,
    pub merged: u64,
    pub promoted: u64,
    pub skipped_conflicts: u64,
    pub unit_errors: u64,
}

impl std::fmt::Display for MergeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pending examined, {} pairs planned, {} merged, {} promoted, \
             {} conflicts, {} errors",
            self.pending_examined,
            self.pairs_planned,
            self.merged,
            self.promoted,
            self.skipped_conflicts,
            self.unit_errors
        )
    }
}

struct EnvelopeEntry {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for EnvelopeEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Plans the pass over a snapshot of pending contributions. Pure; the
/// caller applies the plan with conditional updates and survives the
/// snapshot being stale.
pub fn plan_merges(pending: &[Contribution], config: &MergeConfig) -> Vec<MergePair> {
    if pending.len() < 2 {
        return Vec::new();
    }

    // Rank every candidate by creation; the older of any pair absorbs.
    let mut order: Vec<usize> = (0..pending.len()).collect();
    order.sort_by(|&a, &b| {
        pending[a]
            .created_at
            .cmp(&pending[b].created_at)
            .then(pending[a].id.cmp(&pending[b].id))
    });
    let mut rank_of = vec![0usize; pending.len()];
    for (rank, &index) in order.iter().enumerate() {
        rank_of[index] = rank;
    }

    let tree = RTree::bulk_load(
        pending
            .iter()
            .enumerate()
            .map(|(index, c)| EnvelopeEntry {
                index,
                aabb: AABB::from_corners(
                    [c.envelope.min_lon, c.envelope.min_lat],
                    [c.envelope.max_lon, c.envelope.max_lat],
                ),
            })
            .collect(),
    );

    // Coarse pass: R-tree box search padded to the prefilter radius, then
    // the exact envelope gap.
    let mut prefiltered: Vec<(usize, usize)> = Vec::new();
    for (rank, &index) in order.iter().enumerate() {
        let candidate = &pending[index];
        let pad = meters_to_degrees(
            config.prefilter_radius_m,
            candidate.envelope.center().latitude,
        );
        let search = AABB::from_corners(
            [
                candidate.envelope.min_lon - pad,
                candidate.envelope.min_lat - pad,
            ],
            [
                candidate.envelope.max_lon + pad,
                candidate.envelope.max_lat + pad,
            ],
        );
        for hit in tree.locate_in_envelope_intersecting(&search) {
            let other_rank = rank_of[hit.index];
            if other_rank <= rank {
                continue;
            }
            let other = &pending[hit.index];
            if candidate.envelope.separation_from(&other.envelope) > config.prefilter_radius_m {
                continue;
            }
            prefiltered.push((rank, other_rank));
        }
    }
    prefiltered.sort_unstable();
    prefiltered.dedup();

    // Expensive pass: curve distance per surviving pair.
    let close_enough: Vec<(usize, usize)> = prefiltered
        .par_iter()
        .copied()
        .filter(|&(a, b)| {
            curve_distance(&pending[order[a]].points, &pending[order[b]].points)
                < config.merge_threshold_m
        })
        .collect();

    // Greedy assembly in creation order; a candidate merged away here is
    // excluded from every later pair.
    let mut merged_away: AHashSet<usize> = AHashSet::new();
    let mut plan = Vec::new();
    for (older, newer) in close_enough {
        if merged_away.contains(&older) || merged_away.contains(&newer) {
            continue;
        }
        plan.push(MergePair {
            source: pending[order[newer]].id,
            target: pending[order[older]].id,
        });
        merged_away.insert(newer);
    }

    plan
}

enum MergeApplied {
    Merged { promoted: bool },
    Skipped,
}

/// Applies one planned pair with fresh reads, since the snapshot behind the
/// plan may have gone stale: ingestion may have promoted the target, or a
/// concurrent pass may have claimed either row.
async fn apply_merge<S: ConsensusStore>(
    store: &S,
    consensus: &ConsensusConfig,
    pair: MergePair,
    now: DateTime<Utc>,
) -> Result<MergeApplied, StoreError> {
    let Some(target) = store.contribution(pair.target).await? else {
        return Ok(MergeApplied::Skipped);
    };
    if !target.status.is_pending() {
        return Ok(MergeApplied::Skipped);
    }

    if !store.mark_merged(pair.source, pair.target).await? {
        return Ok(MergeApplied::Skipped);
    }

    let mut expected = target.verification_count;
    for retry in [false, true] {
        match store.increment_verification(pair.target, expected).await? {
            CasOutcome::Applied { new_count } => {
                let promoted = if new_count >= consensus.promotion_threshold {
                    promote_contribution(store, consensus, &target, now).await?;
                    true
                } else {
                    false
                };
                return Ok(MergeApplied::Merged { promoted });
            }
            CasOutcome::Conflict if !retry => match store.contribution(pair.target).await? {
                Some(fresh) if fresh.status.is_pending() => {
                    expected = fresh.verification_count;
                }
                _ => {
                    // Source already carries its merged marker; the target
                    // simply absorbed no count. Safe, just undercounted.
                    warn!(
                        source = %pair.source,
                        target = %pair.target,
                        "merge target left pending state mid-merge"
                    );
                    return Ok(MergeApplied::Merged { promoted: false });
                }
            },
            CasOutcome::Conflict => {
                warn!(
                    source = %pair.source,
                    target = %pair.target,
                    "merge count increment lost twice, leaving for next pass"
                );
                return Ok(MergeApplied::Merged { promoted: false });
            }
        }
    }

    unreachable!("two-attempt loop always returns")
}

/// One full resolver pass. Every pair is its own unit: failures are
/// counted, logged and skipped, and the pass keeps going.
pub async fn run_merge_pass<S: ConsensusStore>(
    store: &S,
    consensus: &ConsensusConfig,
    config: &MergeConfig,
    now: DateTime<Utc>,
) -> Result<MergeStats, StoreError> {
    let pending = store.all_pending().await?;
    let plan = plan_merges(&pending, config);

    let mut stats = MergeStats {
        pending_examined: pending.len() as u64,
        pairs_planned: plan.len() as u64,
        ..Default::default()
    };

    for pair in plan {
        match apply_merge(store, consensus, pair, now).await {
            Ok(MergeApplied::Merged { promoted }) => {
                stats.merged += 1;
                if promoted {
                    stats.promoted += 1;
                }
            }
            Ok(MergeApplied::Skipped) => stats.skipped_conflicts += 1,
            Err(e) => {
                warn!(
                    source = %pair.source,
                    target = %pair.target,
                    "merge pair failed: {e}"
                );
                stats.unit_errors += 1;
            }
        }
    }

    info!("merge pass: {stats}");

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PathPoint;
    use crate::store::NewContribution;
    use crate::store::memory::MemoryStore;
    use crate::stop_inference::{InferredStop, StopRole};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 5, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn points(offset_lon: f64) -> Vec<PathPoint> {
        (0..12)
            .map(|i| PathPoint::new(-1.29 + i as f64 * 0.002, 36.82 + offset_lon))
            .collect()
    }

    fn candidate(device: &str, offset_lon: f64, created_secs: i64) -> NewContribution {
        let points = points(offset_lon);
        let first = points[0];
        let last = *points.last().unwrap();
        NewContribution {
            id: Uuid::new_v4(),
            device_id: device.to_string(),
            route_type: 1700,
            route_name: None,
            route_number: None,
            origin_name: None,
            destination_name: None,
            stops: vec![
                InferredStop {
                    latitude: first.latitude,
                    longitude: first.longitude,
                    name: None,
                    role: StopRole::Origin,
                    sequence: 0,
                },
                InferredStop {
                    latitude: last.latitude,
                    longitude: last.longitude,
                    name: None,
                    role: StopRole::Destination,
                    sequence: 1,
                },
            ],
            points,
            raw_samples: Vec::new(),
            fare: None,
            notes: None,
            created_at: at(created_secs),
        }
    }

    async fn seed(store: &MemoryStore, new: &NewContribution) {
        store.insert_contribution(new.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn near_duplicates_merge_newer_into_older() {
        let store = MemoryStore::new();
        let older = candidate("device-a", 0.0, 0);
        // ~110 metres east, inside the 150 m merge threshold.
        let newer = candidate("device-b", 0.001, 300);
        seed(&store, &older).await;
        seed(&store, &newer).await;

        let stats = run_merge_pass(
            &store,
            &ConsensusConfig::default(),
            &MergeConfig::default(),
            at(900),
        )
        .await
        .unwrap();

        assert_eq!(stats.merged, 1);
        assert_eq!(stats.promoted, 0);

        let (source_status, merge_target) = store.status_of(newer.id).unwrap();
        assert_eq!(source_status, "merged");
        assert_eq!(merge_target, Some(older.id));

        let (target_status, _) = store.status_of(older.id).unwrap();
        assert_eq!(target_status, "pending");
        assert_eq!(store.count_of(older.id), Some(2));
    }

    #[tokio::test]
    async fn prefilter_short_circuits_before_scoring() {
        // The pair would pass the distance threshold (500 m) but sits
        // beyond the coarse prefilter (300 m), so it is never scored.
        let store = MemoryStore::new();
        // Two straight tracks ~440 metres apart in envelope space.
        let a = candidate("device-a", 0.0, 0);
        let b = candidate("device-b", 0.004, 60);
        seed(&store, &a).await;
        seed(&store, &b).await;

        let config = MergeConfig {
            prefilter_radius_m: 300.0,
            merge_threshold_m: 500.0,
        };
        let stats = run_merge_pass(&store, &ConsensusConfig::default(), &config, at(900))
            .await
            .unwrap();

        assert_eq!(stats.pairs_planned, 0);
        assert_eq!(stats.merged, 0);
        assert_eq!(store.status_of(a.id).unwrap().0, "pending");
        assert_eq!(store.status_of(b.id).unwrap().0, "pending");
    }

    #[tokio::test]
    async fn distant_duplicates_are_not_merged_by_default_config() {
        let store = MemoryStore::new();
        let a = candidate("device-a", 0.0, 0);
        // ~550 metres away: outside both the prefilter and the threshold.
        let b = candidate("device-b", 0.005, 60);
        seed(&store, &a).await;
        seed(&store, &b).await;

        let stats = run_merge_pass(
            &store,
            &ConsensusConfig::default(),
            &MergeConfig::default(),
            at(900),
        )
        .await
        .unwrap();

        assert_eq!(stats.merged, 0);
    }

    #[tokio::test]
    async fn merged_candidate_is_excluded_from_further_pairing() {
        let store = MemoryStore::new();
        let oldest = candidate("device-a", 0.0, 0);
        let middle = candidate("device-b", 0.0002, 60);
        let newest = candidate("device-c", 0.0004, 120);
        seed(&store, &oldest).await;
        seed(&store, &middle).await;
        seed(&store, &newest).await;

        let stats = run_merge_pass(
            &store,
            &ConsensusConfig::default(),
            &MergeConfig::default(),
            at(900),
        )
        .await
        .unwrap();

        assert_eq!(stats.merged, 2);

        // Both newer candidates folded into the oldest; neither points at
        // the other, so no chain formed through a merged row.
        let (middle_status, middle_target) = store.status_of(middle.id).unwrap();
        assert_eq!(middle_status, "merged");
        assert_eq!(middle_target, Some(oldest.id));

        let (newest_status, newest_target) = store.status_of(newest.id).unwrap();
        assert_eq!(newest_status, "merged");
        assert_eq!(newest_target, Some(oldest.id));

        // Two absorbed duplicates took the target to the promotion
        // threshold.
        assert_eq!(store.status_of(oldest.id).unwrap().0, "verified");
        assert_eq!(stats.promoted, 1);
        assert_eq!(store.routes().len(), 1);
    }

    #[test]
    fn plan_needs_at_least_two_pending() {
        let no_pending: Vec<Contribution> = Vec::new();
        assert!(plan_merges(&no_pending, &MergeConfig::default()).is_empty());
    }
}
