// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use uuid::Uuid;

use crate::geometry::{Envelope, PathPoint};
use crate::stop_inference::InferredStop;
use crate::store::{Contribution, ContributionStatus, NewContribution, NewRoute, NewStop, StoreError};

#[derive(Queryable, Selectable, Insertable, QueryableByName, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::crowdsource::contributors)]
pub struct Contributor {
    pub device_id: String,
    pub reputation: i32,
    pub total_contributions: i32,
    pub verified_contributions: i32,
    pub banned: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, QueryableByName, Debug, Clone)]
#[diesel(table_name = crate::schema::crowdsource::route_contributions)]
pub struct RouteContributionRow {
    pub id: Uuid,
    pub device_id: String,
    pub route_type: i16,
    pub route_name: Option<String>,
    pub route_number: Option<String>,
    pub origin_name: Option<String>,
    pub destination_name: Option<String>,
    pub stop_list: serde_json::Value,
    pub polyline: postgis_diesel::types::LineString<postgis_diesel::types::Point>,
    pub raw_samples: serde_json::Value,
    pub fare: Option<f64>,
    pub notes: Option<String>,
    pub status: String,
    pub verification_count: i32,
    pub merged_into: Option<Uuid>,
    pub upvotes: i32,
    pub downvotes: i32,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::crowdsource::routes)]
pub struct RouteRow {
    pub id: Uuid,
    pub source_contribution: Uuid,
    pub route_type: i16,
    pub name: Option<String>,
    pub polyline: postgis_diesel::types::LineString<postgis_diesel::types::Point>,
    pub created_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::crowdsource::stops)]
pub struct StopRow {
    pub id: Uuid,
    pub route_id: Uuid,
    pub position: i32,
    pub name: Option<String>,
    pub point: postgis_diesel::types::Point,
    pub role: i16,
}

pub fn points_to_linestring(
    points: &[PathPoint],
) -> postgis_diesel::types::LineString<postgis_diesel::types::Point> {
    postgis_diesel::types::LineString {
        points: points
            .iter()
            .map(|p| postgis_diesel::types::Point {
                x: p.longitude,
                y: p.latitude,
                srid: Some(crate::WGS_84_SRID),
            })
            .collect(),
        srid: Some(crate::WGS_84_SRID),
    }
}

pub fn linestring_to_points(
    linestring: &postgis_diesel::types::LineString<postgis_diesel::types::Point>,
) -> Vec<PathPoint> {
    linestring
        .points
        .iter()
        .map(|p| PathPoint::new(p.y, p.x))
        .collect()
}

impl RouteContributionRow {
    pub fn from_new(new: &NewContribution) -> Result<Self, StoreError> {
        let stop_list = serde_json::to_value(&new.stops).map_err(|e| StoreError::Corrupt {
            id: new.id,
            detail: format!("unserializable stop list: {e}"),
        })?;
        let raw_samples =
            serde_json::to_value(&new.raw_samples).map_err(|e| StoreError::Corrupt {
                id: new.id,
                detail: format!("unserializable raw samples: {e}"),
            })?;

        Ok(RouteContributionRow {
            id: new.id,
            device_id: new.device_id.clone(),
            route_type: new.route_type,
            route_name: new.route_name.clone(),
            route_number: new.route_number.clone(),
            origin_name: new.origin_name.clone(),
            destination_name: new.destination_name.clone(),
            stop_list,
            polyline: points_to_linestring(&new.points),
            raw_samples,
            fare: new.fare,
            notes: new.notes.clone(),
            status: "pending".to_string(),
            verification_count: 1,
            merged_into: None,
            upvotes: 0,
            downvotes: 0,
            created_at: new.created_at,
            verified_at: None,
        })
    }

    pub fn into_domain(self) -> Result<Contribution, StoreError> {
        let status = ContributionStatus::from_columns(self.id, &self.status, self.merged_into)?;
        let stops: Vec<InferredStop> =
            serde_json::from_value(self.stop_list).map_err(|e| StoreError::Corrupt {
                id: self.id,
                detail: format!("undecodable stop list: {e}"),
            })?;
        let points = linestring_to_points(&self.polyline);
        let envelope = Envelope::from_points(&points).ok_or_else(|| StoreError::Corrupt {
            id: self.id,
            detail: "empty polyline".to_string(),
        })?;

        Ok(Contribution {
            id: self.id,
            device_id: self.device_id,
            route_type: self.route_type,
            route_name: self.route_name,
            origin_name: self.origin_name,
            destination_name: self.destination_name,
            points,
            envelope,
            stops,
            status,
            verification_count: self.verification_count,
            upvotes: self.upvotes,
            downvotes: self.downvotes,
            created_at: self.created_at,
        })
    }
}

impl RouteRow {
    pub fn from_new(new: &NewRoute) -> Self {
        RouteRow {
            id: new.id,
            source_contribution: new.source_contribution,
            route_type: new.route_type,
            name: new.name.clone(),
            polyline: points_to_linestring(&new.points),
            created_at: new.created_at,
        }
    }
}

impl StopRow {
    pub fn from_new(new: &NewStop) -> Self {
        StopRow {
            id: new.id,
            route_id: new.route_id,
            position: new.position,
            name: new.name.clone(),
            point: postgis_diesel::types::Point {
                x: new.longitude,
                y: new.latitude,
                srid: Some(crate::WGS_84_SRID),
            },
            role: new.role,
        }
    }
}
