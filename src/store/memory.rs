//! In-memory [`ConsensusStore`] used by the consensus and merge tests.
//!
//! Mirrors the conditional-update semantics of the postgres store: every
//! status or count mutation checks the current row state under one lock
//! acquisition, so CAS conflicts and idempotency guards behave the same as
//! in production.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::geometry::Envelope;
use crate::models::Contributor;
use crate::store::{
    CandidateRank, CasOutcome, ConsensusStore, Contribution, ContributionStatus, NewContribution,
    NewRoute, NewStop, StoreError, SummaryCounts,
};

struct MemContribution {
    new: NewContribution,
    status: String,
    merged_into: Option<Uuid>,
    verification_count: i32,
    upvotes: i32,
    downvotes: i32,
    verified_at: Option<DateTime<Utc>>,
}

impl MemContribution {
    fn to_domain(&self) -> Contribution {
        let envelope = Envelope::from_points(&self.new.points)
            .expect("memory store only holds nonempty polylines");
        let status =
            ContributionStatus::from_columns(self.new.id, &self.status, self.merged_into)
                .expect("memory store only writes known statuses");
        Contribution {
            id: self.new.id,
            device_id: self.new.device_id.clone(),
            route_type: self.new.route_type,
            route_name: self.new.route_name.clone(),
            origin_name: self.new.origin_name.clone(),
            destination_name: self.new.destination_name.clone(),
            points: self.new.points.clone(),
            envelope,
            stops: self.new.stops.clone(),
            status,
            verification_count: self.verification_count,
            upvotes: self.upvotes,
            downvotes: self.downvotes,
            created_at: self.new.created_at,
        }
    }
}

#[derive(Default)]
struct Inner {
    contributors: HashMap<String, Contributor>,
    contributions: HashMap<Uuid, MemContribution>,
    routes: Vec<NewRoute>,
    stops: Vec<NewStop>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contributor(&self, device: &str) -> Option<Contributor> {
        self.inner.lock().unwrap().contributors.get(device).cloned()
    }

    pub fn routes(&self) -> Vec<NewRoute> {
        self.inner.lock().unwrap().routes.clone()
    }

    pub fn stops_for(&self, route_id: Uuid) -> Vec<NewStop> {
        self.inner
            .lock()
            .unwrap()
            .stops
            .iter()
            .filter(|s| s.route_id == route_id)
            .cloned()
            .collect()
    }

    pub fn status_of(&self, id: Uuid) -> Option<(String, Option<Uuid>)> {
        self.inner
            .lock()
            .unwrap()
            .contributions
            .get(&id)
            .map(|c| (c.status.clone(), c.merged_into))
    }

    pub fn verified_at_of(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .contributions
            .get(&id)
            .and_then(|c| c.verified_at)
    }

    pub fn count_of(&self, id: Uuid) -> Option<i32> {
        self.inner
            .lock()
            .unwrap()
            .contributions
            .get(&id)
            .map(|c| c.verification_count)
    }

    pub fn set_votes(&self, id: Uuid, upvotes: i32, downvotes: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.contributions.get_mut(&id) {
            c.upvotes = upvotes;
            c.downvotes = downvotes;
        }
    }

    pub fn ban(&self, device: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.contributors.get_mut(device) {
            c.banned = true;
        }
    }
}

impl ConsensusStore for MemoryStore {
    async fn contributor_seen(
        &self,
        device: &str,
        at: DateTime<Utc>,
    ) -> Result<Contributor, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .contributors
            .entry(device.to_string())
            .and_modify(|c| {
                c.total_contributions += 1;
                c.last_seen = at;
            })
            .or_insert_with(|| Contributor {
                device_id: device.to_string(),
                reputation: 0,
                total_contributions: 1,
                verified_contributions: 0,
                banned: false,
                first_seen: at,
                last_seen: at,
            });
        Ok(row.clone())
    }

    async fn insert_contribution(&self, new: NewContribution) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.contributions.insert(
            new.id,
            MemContribution {
                new,
                status: "pending".to_string(),
                merged_into: None,
                verification_count: 1,
                upvotes: 0,
                downvotes: 0,
                verified_at: None,
            },
        );
        Ok(())
    }

    async fn contribution(&self, id: Uuid) -> Result<Option<Contribution>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.contributions.get(&id).map(MemContribution::to_domain))
    }

    async fn pending_within(
        &self,
        envelope: &Envelope,
        radius_m: f64,
    ) -> Result<Vec<Contribution>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<Contribution> = inner
            .contributions
            .values()
            .filter(|c| c.status == "pending")
            .map(MemContribution::to_domain)
            .filter(|c| c.envelope.separation_from(envelope) <= radius_m)
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn all_pending(&self) -> Result<Vec<Contribution>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<Contribution> = inner
            .contributions
            .values()
            .filter(|c| c.status == "pending")
            .map(MemContribution::to_domain)
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn increment_verification(
        &self,
        id: Uuid,
        expected: i32,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.contributions.get_mut(&id) {
            Some(c) if c.status == "pending" && c.verification_count == expected => {
                c.verification_count += 1;
                Ok(CasOutcome::Applied {
                    new_count: c.verification_count,
                })
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn mark_verified(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.contributions.get_mut(&id) {
            Some(c) if c.status == "pending" => {
                c.status = "verified".to_string();
                c.verified_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_merged(&self, id: Uuid, target: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.contributions.get_mut(&id) {
            Some(c) if c.status == "pending" => {
                c.status = "merged".to_string();
                c.merged_into = Some(target);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn route_exists_for(&self, contribution_id: Uuid) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .routes
            .iter()
            .any(|r| r.source_contribution == contribution_id))
    }

    async fn create_route_with_stops(
        &self,
        route: NewRoute,
        mut stops: Vec<NewStop>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.push(route);
        inner.stops.append(&mut stops);
        Ok(())
    }

    async fn adjust_reputation(&self, device: &str, delta: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.contributors.get_mut(device) {
            c.reputation += delta;
        }
        Ok(())
    }

    async fn grant_verification_credit(
        &self,
        device: &str,
        reputation_delta: i32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.contributors.get_mut(device) {
            c.reputation += reputation_delta;
            c.verified_contributions += 1;
        }
        Ok(())
    }

    async fn summary(&self) -> Result<SummaryCounts, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut counts = SummaryCounts::default();
        let mut total_verifications = 0i64;
        for c in inner.contributions.values() {
            match c.status.as_str() {
                "pending" => counts.pending += 1,
                "verified" => counts.verified += 1,
                "merged" => counts.merged += 1,
                "rejected" => counts.rejected += 1,
                _ => {}
            }
            total_verifications += i64::from(c.verification_count);
        }
        let total = inner.contributions.len() as i64;
        counts.distinct_contributors = inner
            .contributions
            .values()
            .map(|c| c.new.device_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len() as i64;
        counts.mean_verification_count = if total == 0 {
            0.0
        } else {
            total_verifications as f64 / total as f64
        };
        Ok(counts)
    }

    async fn top_candidates(&self, limit: i64) -> Result<Vec<CandidateRank>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut ranks: Vec<CandidateRank> = inner
            .contributions
            .values()
            .filter(|c| c.status == "pending")
            .map(|c| CandidateRank {
                id: c.new.id,
                route_name: c.new.route_name.clone(),
                origin_name: c.new.origin_name.clone(),
                destination_name: c.new.destination_name.clone(),
                verification_count: c.verification_count,
                net_votes: c.upvotes - c.downvotes,
            })
            .collect();
        ranks.sort_by(|a, b| {
            b.verification_count
                .cmp(&a.verification_count)
                .then(b.net_votes.cmp(&a.net_votes))
                .then(a.id.cmp(&b.id))
        });
        ranks.truncate(limit as usize);
        Ok(ranks)
    }

    async fn top_contributors(&self, limit: i64) -> Result<Vec<Contributor>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Contributor> = inner
            .contributors
            .values()
            .filter(|c| !c.banned)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.reputation
                .cmp(&a.reputation)
                .then(a.device_id.cmp(&b.device_id))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }
}
