//! Lifecycle of a route contribution: pending on first sight, corroborated
//! by later matching traces, promoted to an official route at the
//! verification threshold.
//!
//! Each trace is one independent unit of work. Every mutation the unit
//! performs is an atomic conditional update against the store, so units can
//! run concurrently with each other and with the merge resolver; a unit
//! that loses a compare-and-set race retries once with fresh state and is
//! otherwise dropped, to be retried safely in a later batch.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::geometry::build_geometry;
use crate::matching::find_match;
use crate::stop_inference::infer_stops;
use crate::store::{
    CasOutcome, ConsensusStore, Contribution, NewContribution, NewRoute, NewStop, StoreError,
};
use crate::trace::{RawTrace, TraceRejection, normalize_samples, route_type_tag};

/// Tuning knobs for the live pipeline. Defaults match the deployed
/// thresholds; workers override individual values from flags.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Verification count at which a pending candidate becomes official.
    pub promotion_threshold: i32,
    /// Reputation granted per verification event.
    pub verification_reputation: i32,
    /// Spatial prefilter radius for live matching, metres.
    pub match_radius_m: f64,
    /// Curve-distance ceiling for a live match, metres.
    pub match_threshold_m: f64,
    /// Mean window speed below which a vehicle counts as dwelling, m/s.
    pub low_speed_floor_ms: f64,
    /// Minimum window span for a dwell when timestamps exist, seconds.
    pub min_dwell_secs: i64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: 3,
            verification_reputation: 50,
            match_radius_m: 500.0,
            match_threshold_m: 200.0,
            low_speed_floor_ms: 1.5,
            min_dwell_secs: 30,
        }
    }
}

/// What happened to one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOutcome {
    DroppedBanned,
    DroppedTooShort,
    DroppedBadGeometry,
    Created {
        contribution: Uuid,
    },
    Corroborated {
        contribution: Uuid,
        new_count: i32,
        promoted: bool,
    },
    /// Lost the compare-and-set race twice; the trace is dropped and safe
    /// to retry in a later run.
    SkippedConflict {
        contribution: Uuid,
    },
}

/// Per-run counters, the only way unit failures surface to operators.
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub processed: u64,
    pub dropped_banned: u64,
    pub dropped_too_short: u64,
    pub dropped_bad_geometry: u64,
    pub created: u64,
    pub corroborated: u64,
    pub promoted: u64,
    pub conflicts_skipped: u64,
    pub unit_errors: u64,
}

impl RunStats {
    pub fn absorb(&mut self, outcome: &TraceOutcome) {
        self.processed += 1;
        match outcome {
            TraceOutcome::DroppedBanned => self.dropped_banned += 1,
            TraceOutcome::DroppedTooShort => self.dropped_too_short += 1,
            TraceOutcome::DroppedBadGeometry => self.dropped_bad_geometry += 1,
            TraceOutcome::Created { .. } => self.created += 1,
            TraceOutcome::Corroborated { promoted, .. } => {
                self.corroborated += 1;
                if *promoted {
                    self.promoted += 1;
                }
            }
            TraceOutcome::SkippedConflict { .. } => self.conflicts_skipped += 1,
        }
    }

    pub fn note_unit_error(&mut self) {
        self.processed += 1;
        self.unit_errors += 1;
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} traces: {} created, {} corroborated, {} promoted, \
             {} short, {} bad geometry, {} banned, {} conflicts, {} errors",
            self.processed,
            self.created,
            self.corroborated,
            self.promoted,
            self.dropped_too_short,
            self.dropped_bad_geometry,
            self.dropped_banned,
            self.conflicts_skipped,
            self.unit_errors
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted { route: Uuid },
    /// The idempotency guard tripped: promotion already happened (or is
    /// owned by a concurrent unit). Success, not an error.
    AlreadyApplied,
}

/// Processes one trace end to end. Store errors abort only this unit;
/// the caller counts them and moves on.
pub async fn process_trace<S: ConsensusStore>(
    store: &S,
    config: &ConsensusConfig,
    trace: RawTrace,
    now: DateTime<Utc>,
) -> Result<TraceOutcome, StoreError> {
    let contributor = store.contributor_seen(&trace.device_id, now).await?;
    if contributor.banned {
        return Ok(TraceOutcome::DroppedBanned);
    }

    let samples = match normalize_samples(&trace.samples) {
        Ok(samples) => samples,
        Err(TraceRejection::TooShort(_)) => return Ok(TraceOutcome::DroppedTooShort),
    };

    let geometry = match build_geometry(&samples) {
        Ok(geometry) => geometry,
        Err(e) => {
            warn!(device = %trace.device_id, "dropping trace: {e}");
            return Ok(TraceOutcome::DroppedBadGeometry);
        }
    };

    let mut stops = infer_stops(&samples, config.low_speed_floor_ms, config.min_dwell_secs);
    if let Some(origin) = stops.first_mut() {
        origin.name = trace.metadata.origin_name.clone();
    }
    if let Some(destination) = stops.last_mut() {
        destination.name = trace.metadata.destination_name.clone();
    }

    let matched = find_match(
        store,
        &geometry,
        config.match_radius_m,
        config.match_threshold_m,
    )
    .await?;

    match matched {
        Some(found) => {
            corroborate(store, config, &trace.device_id, found.contribution, now).await
        }
        None => {
            let id = Uuid::new_v4();
            store
                .insert_contribution(NewContribution {
                    id,
                    device_id: trace.device_id.clone(),
                    route_type: route_type_tag(trace.metadata.route_type.as_deref()),
                    route_name: trace.metadata.route_name.clone(),
                    route_number: trace.metadata.route_number.clone(),
                    origin_name: trace.metadata.origin_name.clone(),
                    destination_name: trace.metadata.destination_name.clone(),
                    stops,
                    points: geometry.points,
                    raw_samples: samples,
                    fare: trace.metadata.fare,
                    notes: trace.metadata.notes.clone(),
                    created_at: now,
                })
                .await?;
            Ok(TraceOutcome::Created { contribution: id })
        }
    }
}

/// Applies one corroborating trace to a matched pending candidate:
/// compare-and-set count increment (one retry on conflict), a reputation
/// award for the corroborating device, and the promotion check.
async fn corroborate<S: ConsensusStore>(
    store: &S,
    config: &ConsensusConfig,
    corroborating_device: &str,
    candidate: Contribution,
    now: DateTime<Utc>,
) -> Result<TraceOutcome, StoreError> {
    let mut target = candidate;
    let mut expected = target.verification_count;

    for retry in [false, true] {
        match store.increment_verification(target.id, expected).await? {
            CasOutcome::Applied { new_count } => {
                store
                    .adjust_reputation(corroborating_device, config.verification_reputation)
                    .await?;

                let promoted = if new_count >= config.promotion_threshold {
                    promote_contribution(store, config, &target, now).await?;
                    true
                } else {
                    false
                };

                return Ok(TraceOutcome::Corroborated {
                    contribution: target.id,
                    new_count,
                    promoted,
                });
            }
            CasOutcome::Conflict if !retry => {
                match store.contribution(target.id).await? {
                    Some(fresh) if fresh.status.is_pending() => {
                        expected = fresh.verification_count;
                        target = fresh;
                    }
                    // Verified or merged since we matched it; nothing left
                    // to corroborate here.
                    _ => {
                        return Ok(TraceOutcome::SkippedConflict {
                            contribution: target.id,
                        });
                    }
                }
            }
            CasOutcome::Conflict => {
                warn!(
                    contribution = %target.id,
                    device = %corroborating_device,
                    "corroboration lost the count race twice, dropping unit"
                );
                return Ok(TraceOutcome::SkippedConflict {
                    contribution: target.id,
                });
            }
        }
    }

    unreachable!("two-attempt loop always returns")
}

/// Promotes a contribution that reached the verification threshold.
///
/// The `pending -> verified` transition elects a single winner; the
/// route-exists probe keeps re-delivered promotions from creating a second
/// Route. The owner's reputation and verified-contribution credit ride in
/// the same guarded path, so they are granted exactly once.
pub async fn promote_contribution<S: ConsensusStore>(
    store: &S,
    config: &ConsensusConfig,
    contribution: &Contribution,
    now: DateTime<Utc>,
) -> Result<PromotionOutcome, StoreError> {
    let won_transition = store.mark_verified(contribution.id, now).await?;
    if !won_transition {
        return Ok(PromotionOutcome::AlreadyApplied);
    }

    if store.route_exists_for(contribution.id).await? {
        return Ok(PromotionOutcome::AlreadyApplied);
    }

    let route_id = Uuid::new_v4();
    let name = contribution.route_name.clone().or_else(|| {
        match (&contribution.origin_name, &contribution.destination_name) {
            (Some(origin), Some(destination)) => Some(format!("{origin} - {destination}")),
            _ => None,
        }
    });

    let stops: Vec<NewStop> = contribution
        .stops
        .iter()
        .enumerate()
        .map(|(position, stop)| NewStop {
            id: Uuid::new_v4(),
            route_id,
            position: position as i32,
            name: stop.name.clone(),
            latitude: stop.latitude,
            longitude: stop.longitude,
            role: stop.role.to_i16(),
        })
        .collect();

    store
        .create_route_with_stops(
            NewRoute {
                id: route_id,
                source_contribution: contribution.id,
                route_type: contribution.route_type,
                name,
                points: contribution.points.clone(),
                created_at: now,
            },
            stops,
        )
        .await?;

    store
        .grant_verification_credit(&contribution.device_id, config.verification_reputation)
        .await?;

    info!(
        contribution = %contribution.id,
        route = %route_id,
        device = %contribution.device_id,
        "promoted contribution to official route"
    );

    Ok(PromotionOutcome::Promoted { route: route_id })
}
