// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Float8};
use diesel_async::AsyncConnection;
use diesel_async::RunQueryDsl;
use diesel_async::scoped_futures::ScopedFutureExt;
use std::sync::Arc;
use uuid::Uuid;

use crate::geometry::Envelope;
use crate::models::{Contributor, RouteContributionRow, RouteRow, StopRow};
use crate::postgres_tools::AcaciaPostgresPool;
use crate::store::{
    CandidateRank, CasOutcome, ConsensusStore, Contribution, NewContribution, NewRoute, NewStop,
    StoreError, SummaryCounts,
};

/// Production store: PostgreSQL with PostGIS for the spatial prefilter.
///
/// All conditional updates are expressed as `UPDATE .. WHERE status =
/// 'pending' ..` so the row's status column is the single point of mutual
/// exclusion between concurrent ingest batches and merge passes.
#[derive(Clone)]
pub struct PgConsensusStore {
    pool: Arc<AcaciaPostgresPool>,
}

impl PgConsensusStore {
    pub fn new(pool: Arc<AcaciaPostgresPool>) -> Self {
        Self { pool }
    }
}

#[derive(QueryableByName)]
struct SummaryRow {
    #[diesel(sql_type = BigInt)]
    pending: i64,
    #[diesel(sql_type = BigInt)]
    verified: i64,
    #[diesel(sql_type = BigInt)]
    merged: i64,
    #[diesel(sql_type = BigInt)]
    rejected: i64,
    #[diesel(sql_type = BigInt)]
    distinct_contributors: i64,
    #[diesel(sql_type = Double)]
    mean_verification_count: f64,
}

fn rows_to_domain(rows: Vec<RouteContributionRow>) -> Result<Vec<Contribution>, StoreError> {
    rows.into_iter()
        .map(RouteContributionRow::into_domain)
        .collect()
}

impl ConsensusStore for PgConsensusStore {
    async fn contributor_seen(
        &self,
        device: &str,
        at: DateTime<Utc>,
    ) -> Result<Contributor, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::contributors::dsl as contributor_columns;
        use crate::schema::crowdsource::contributors::dsl::contributors;

        let fresh = Contributor {
            device_id: device.to_string(),
            reputation: 0,
            total_contributions: 1,
            verified_contributions: 0,
            banned: false,
            first_seen: at,
            last_seen: at,
        };

        let row = diesel::insert_into(contributors)
            .values(&fresh)
            .on_conflict(contributor_columns::device_id)
            .do_update()
            .set((
                contributor_columns::total_contributions
                    .eq(contributor_columns::total_contributions + 1),
                contributor_columns::last_seen.eq(at),
            ))
            .returning(Contributor::as_returning())
            .get_result(conn)
            .await?;

        Ok(row)
    }

    async fn insert_contribution(&self, new: NewContribution) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::route_contributions::dsl::route_contributions;

        let row = RouteContributionRow::from_new(&new)?;

        diesel::insert_into(route_contributions)
            .values(&row)
            .execute(conn)
            .await?;

        Ok(())
    }

    async fn contribution(&self, lookup: Uuid) -> Result<Option<Contribution>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::route_contributions::dsl as rc_columns;
        use crate::schema::crowdsource::route_contributions::dsl::route_contributions;

        let row: Option<RouteContributionRow> = route_contributions
            .filter(rc_columns::id.eq(lookup))
            .select(RouteContributionRow::as_select())
            .first(conn)
            .await
            .optional()?;

        row.map(RouteContributionRow::into_domain).transpose()
    }

    async fn pending_within(
        &self,
        envelope: &Envelope,
        radius_m: f64,
    ) -> Result<Vec<Contribution>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        // Geography cast so the radius is metres, as in the rest of the
        // spatial query surface.
        let rows: Vec<RouteContributionRow> = diesel::sql_query(
            "SELECT * FROM crowdsource.route_contributions \
             WHERE status = 'pending' \
             AND ST_DWithin(polyline::geography, \
                 ST_MakeEnvelope($1, $2, $3, $4, 4326)::geography, $5)",
        )
        .bind::<Float8, _>(envelope.min_lon)
        .bind::<Float8, _>(envelope.min_lat)
        .bind::<Float8, _>(envelope.max_lon)
        .bind::<Float8, _>(envelope.max_lat)
        .bind::<Float8, _>(radius_m)
        .load::<RouteContributionRow>(conn)
        .await?;

        rows_to_domain(rows)
    }

    async fn all_pending(&self) -> Result<Vec<Contribution>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::route_contributions::dsl as rc_columns;
        use crate::schema::crowdsource::route_contributions::dsl::route_contributions;

        let rows: Vec<RouteContributionRow> = route_contributions
            .filter(rc_columns::status.eq("pending"))
            .order(rc_columns::created_at.asc())
            .select(RouteContributionRow::as_select())
            .load(conn)
            .await?;

        rows_to_domain(rows)
    }

    async fn increment_verification(
        &self,
        target: Uuid,
        expected: i32,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::route_contributions::dsl as rc_columns;
        use crate::schema::crowdsource::route_contributions::dsl::route_contributions;

        let updated: Option<i32> = diesel::update(
            route_contributions.filter(
                rc_columns::id
                    .eq(target)
                    .and(rc_columns::status.eq("pending"))
                    .and(rc_columns::verification_count.eq(expected)),
            ),
        )
        .set(rc_columns::verification_count.eq(expected + 1))
        .returning(rc_columns::verification_count)
        .get_result(conn)
        .await
        .optional()?;

        Ok(match updated {
            Some(new_count) => CasOutcome::Applied { new_count },
            None => CasOutcome::Conflict,
        })
    }

    async fn mark_verified(&self, target: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::route_contributions::dsl as rc_columns;
        use crate::schema::crowdsource::route_contributions::dsl::route_contributions;

        let updated = diesel::update(
            route_contributions.filter(
                rc_columns::id
                    .eq(target)
                    .and(rc_columns::status.eq("pending")),
            ),
        )
        .set((
            rc_columns::status.eq("verified"),
            rc_columns::verified_at.eq(Some(at)),
        ))
        .execute(conn)
        .await?;

        Ok(updated > 0)
    }

    async fn mark_merged(&self, source: Uuid, target: Uuid) -> Result<bool, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::route_contributions::dsl as rc_columns;
        use crate::schema::crowdsource::route_contributions::dsl::route_contributions;

        let updated = diesel::update(
            route_contributions.filter(
                rc_columns::id
                    .eq(source)
                    .and(rc_columns::status.eq("pending")),
            ),
        )
        .set((
            rc_columns::status.eq("merged"),
            rc_columns::merged_into.eq(Some(target)),
        ))
        .execute(conn)
        .await?;

        Ok(updated > 0)
    }

    async fn route_exists_for(&self, contribution_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::routes::dsl as route_columns;
        use crate::schema::crowdsource::routes::dsl::routes;

        let found: bool = diesel::select(diesel::dsl::exists(
            routes.filter(route_columns::source_contribution.eq(contribution_id)),
        ))
        .get_result(conn)
        .await?;

        Ok(found)
    }

    async fn create_route_with_stops(
        &self,
        route: NewRoute,
        stops_to_insert: Vec<NewStop>,
    ) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        let route_row = RouteRow::from_new(&route);
        let stop_rows: Vec<StopRow> = stops_to_insert.iter().map(StopRow::from_new).collect();

        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                use crate::schema::crowdsource::routes::dsl::routes;
                use crate::schema::crowdsource::stops::dsl::stops;

                diesel::insert_into(routes)
                    .values(&route_row)
                    .execute(conn)
                    .await?;

                diesel::insert_into(stops)
                    .values(&stop_rows)
                    .execute(conn)
                    .await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await?;

        Ok(())
    }

    async fn adjust_reputation(&self, device: &str, delta: i32) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::contributors::dsl as contributor_columns;
        use crate::schema::crowdsource::contributors::dsl::contributors;

        diesel::update(contributors.filter(contributor_columns::device_id.eq(device)))
            .set(contributor_columns::reputation.eq(contributor_columns::reputation + delta))
            .execute(conn)
            .await?;

        Ok(())
    }

    async fn grant_verification_credit(
        &self,
        device: &str,
        reputation_delta: i32,
    ) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::contributors::dsl as contributor_columns;
        use crate::schema::crowdsource::contributors::dsl::contributors;

        diesel::update(contributors.filter(contributor_columns::device_id.eq(device)))
            .set((
                contributor_columns::reputation
                    .eq(contributor_columns::reputation + reputation_delta),
                contributor_columns::verified_contributions
                    .eq(contributor_columns::verified_contributions + 1),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

    async fn summary(&self) -> Result<SummaryCounts, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        let row: SummaryRow = diesel::sql_query(
            "SELECT \
               count(*) FILTER (WHERE status = 'pending')  AS pending, \
               count(*) FILTER (WHERE status = 'verified') AS verified, \
               count(*) FILTER (WHERE status = 'merged')   AS merged, \
               count(*) FILTER (WHERE status = 'rejected') AS rejected, \
               count(DISTINCT device_id) AS distinct_contributors, \
               coalesce(avg(verification_count), 0)::float8 AS mean_verification_count \
             FROM crowdsource.route_contributions",
        )
        .get_result(conn)
        .await?;

        Ok(SummaryCounts {
            pending: row.pending,
            verified: row.verified,
            merged: row.merged,
            rejected: row.rejected,
            distinct_contributors: row.distinct_contributors,
            mean_verification_count: row.mean_verification_count,
        })
    }

    async fn top_candidates(&self, limit: i64) -> Result<Vec<CandidateRank>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::route_contributions::dsl as rc_columns;
        use crate::schema::crowdsource::route_contributions::dsl::route_contributions;

        let rows: Vec<RouteContributionRow> = route_contributions
            .filter(rc_columns::status.eq("pending"))
            .order((
                rc_columns::verification_count.desc(),
                (rc_columns::upvotes - rc_columns::downvotes).desc(),
                rc_columns::created_at.asc(),
            ))
            .limit(limit)
            .select(RouteContributionRow::as_select())
            .load(conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| CandidateRank {
                id: row.id,
                route_name: row.route_name,
                origin_name: row.origin_name,
                destination_name: row.destination_name,
                verification_count: row.verification_count,
                net_votes: row.upvotes - row.downvotes,
            })
            .collect())
    }

    async fn top_contributors(&self, limit: i64) -> Result<Vec<Contributor>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let conn = &mut conn;

        use crate::schema::crowdsource::contributors::dsl as contributor_columns;
        use crate::schema::crowdsource::contributors::dsl::contributors;

        let rows: Vec<Contributor> = contributors
            .filter(contributor_columns::banned.eq(false))
            .order(contributor_columns::reputation.desc())
            .limit(limit)
            .select(Contributor::as_select())
            .load(conn)
            .await?;

        Ok(rows)
    }
}
