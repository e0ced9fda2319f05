//! Persistence gateway for the consensus pipeline.
//!
//! Everything the pipeline knows about durable state goes through
//! [`ConsensusStore`]: contributor bookkeeping, candidate insertion, the
//! spatial proximity query behind the matcher's prefilter, and the atomic
//! conditional updates that make concurrent ingestion and merge passes safe
//! without any in-process locking. The production implementation is
//! [`postgres::PgConsensusStore`]; tests run against an in-memory
//! implementation with identical conditional-update semantics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::geometry::{Envelope, PathPoint};
use crate::models::Contributor;
use crate::stop_inference::InferredStop;
use crate::trace::TraceSample;

pub mod postgres;

#[cfg(test)]
pub mod memory;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("corrupt row for contribution {id}: {detail}")]
    Corrupt { id: Uuid, detail: String },
}

/// Lifecycle state of a route contribution.
///
/// `Merged` carries its target so a merged record without one cannot be
/// represented. Transitions out of `Verified`, `Merged` and `Rejected` do
/// not exist; the store enforces this by updating rows conditionally on
/// `status = 'pending'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Pending,
    Verified,
    Merged { target: Uuid },
    Rejected,
}

impl ContributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionStatus::Pending => "pending",
            ContributionStatus::Verified => "verified",
            ContributionStatus::Merged { .. } => "merged",
            ContributionStatus::Rejected => "rejected",
        }
    }

    pub fn from_columns(
        id: Uuid,
        status: &str,
        merged_into: Option<Uuid>,
    ) -> Result<Self, StoreError> {
        match (status, merged_into) {
            ("pending", _) => Ok(ContributionStatus::Pending),
            ("verified", _) => Ok(ContributionStatus::Verified),
            ("rejected", _) => Ok(ContributionStatus::Rejected),
            ("merged", Some(target)) => Ok(ContributionStatus::Merged { target }),
            ("merged", None) => Err(StoreError::Corrupt {
                id,
                detail: "merged contribution without a merge target".to_string(),
            }),
            (other, _) => Err(StoreError::Corrupt {
                id,
                detail: format!("unknown status '{other}'"),
            }),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ContributionStatus::Pending)
    }
}

/// A candidate route as the pipeline reads it back from the store.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub id: Uuid,
    pub device_id: String,
    pub route_type: i16,
    pub route_name: Option<String>,
    pub origin_name: Option<String>,
    pub destination_name: Option<String>,
    pub points: Vec<PathPoint>,
    pub envelope: Envelope,
    pub stops: Vec<InferredStop>,
    pub status: ContributionStatus,
    pub verification_count: i32,
    pub upvotes: i32,
    pub downvotes: i32,
    pub created_at: DateTime<Utc>,
}

/// A freshly derived candidate, ready for insertion with `pending` status
/// and a verification count of 1.
#[derive(Debug, Clone)]
pub struct NewContribution {
    pub id: Uuid,
    pub device_id: String,
    pub route_type: i16,
    pub route_name: Option<String>,
    pub route_number: Option<String>,
    pub origin_name: Option<String>,
    pub destination_name: Option<String>,
    pub stops: Vec<InferredStop>,
    pub points: Vec<PathPoint>,
    pub raw_samples: Vec<TraceSample>,
    pub fare: Option<f64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRoute {
    pub id: Uuid,
    pub source_contribution: Uuid,
    pub route_type: i16,
    pub name: Option<String>,
    pub points: Vec<PathPoint>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStop {
    pub id: Uuid,
    pub route_id: Uuid,
    pub position: i32,
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub role: i16,
}

/// Result of a compare-and-set update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { new_count: i32 },
    /// The row moved under us: status or count no longer matched.
    Conflict,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SummaryCounts {
    pub pending: i64,
    pub verified: i64,
    pub merged: i64,
    pub rejected: i64,
    pub distinct_contributors: i64,
    pub mean_verification_count: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateRank {
    pub id: Uuid,
    pub route_name: Option<String>,
    pub origin_name: Option<String>,
    pub destination_name: Option<String>,
    pub verification_count: i32,
    pub net_votes: i32,
}

/// The persistence gateway contract.
///
/// Every mutation that participates in the consensus protocol is an atomic
/// conditional update; callers learn via the return value whether their
/// update applied, and retry with fresh state or drop the unit.
#[allow(async_fn_in_trait)]
pub trait ConsensusStore {
    /// Creates the contributor on first contact, otherwise bumps the
    /// total-contribution counter and last-seen timestamp. Returns the row
    /// after the update so callers can observe the ban flag.
    async fn contributor_seen(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Contributor, StoreError>;

    async fn insert_contribution(&self, new: NewContribution) -> Result<(), StoreError>;

    async fn contribution(&self, id: Uuid) -> Result<Option<Contribution>, StoreError>;

    /// Pending contributions whose geometry lies within `radius_m` of the
    /// given envelope. The matcher's spatial prefilter.
    async fn pending_within(
        &self,
        envelope: &Envelope,
        radius_m: f64,
    ) -> Result<Vec<Contribution>, StoreError>;

    /// Every pending contribution, for the merge resolver's batch pass.
    async fn all_pending(&self) -> Result<Vec<Contribution>, StoreError>;

    /// `verification_count += 1` iff the row is still pending and the count
    /// is still `expected`.
    async fn increment_verification(
        &self,
        id: Uuid,
        expected: i32,
    ) -> Result<CasOutcome, StoreError>;

    /// `pending -> verified`; returns false when the row was no longer
    /// pending.
    async fn mark_verified(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// `pending -> merged(target)`; returns false when the row was no
    /// longer pending.
    async fn mark_merged(&self, id: Uuid, target: Uuid) -> Result<bool, StoreError>;

    /// Idempotency probe guarding promotion against re-delivery.
    async fn route_exists_for(&self, contribution_id: Uuid) -> Result<bool, StoreError>;

    async fn create_route_with_stops(
        &self,
        route: NewRoute,
        stops: Vec<NewStop>,
    ) -> Result<(), StoreError>;

    /// Reputation adjustment alone, for corroborating devices whose trace
    /// confirmed somebody else's candidate.
    async fn adjust_reputation(
        &self,
        device_id: &str,
        delta: i32,
    ) -> Result<(), StoreError>;

    /// Awards reputation and one verified-contribution credit to a promoted
    /// contribution's owner. Callers gate this behind the promotion
    /// transition and [`ConsensusStore::route_exists_for`] so it runs
    /// exactly once per promoted contribution.
    async fn grant_verification_credit(
        &self,
        device_id: &str,
        reputation_delta: i32,
    ) -> Result<(), StoreError>;

    async fn summary(&self) -> Result<SummaryCounts, StoreError>;

    async fn top_candidates(&self, limit: i64) -> Result<Vec<CandidateRank>, StoreError>;

    async fn top_contributors(&self, limit: i64) -> Result<Vec<Contributor>, StoreError>;
}
