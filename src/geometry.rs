//! Polyline and bounding-envelope construction for submitted traces.

use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trace::TraceSample;

#[derive(Error, Debug)]
pub enum GeometryError {
    #[error("invalid geometry: only {0} usable coordinates")]
    InvalidGeometry(usize),
}

/// A single vertex of a route polyline, WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl PathPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Great-circle distance between two vertices in metres.
#[inline]
pub fn haversine_distance(p1: &PathPoint, p2: &PathPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine.distance(point1, point2)
}

/// Total polyline length in metres.
pub fn polyline_length(points: &[PathPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Approximate degrees of latitude/longitude spanned by `meters` at `latitude`.
/// Used to pad R-tree search boxes before the exact metric distance check.
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    // One degree of latitude is ~111.32 km; longitude shrinks with cos(lat).
    // Using the longitude figure for both axes over-pads, which is safe for
    // a prefilter box.
    let meters_per_degree = 111_320.0 * latitude.to_radians().cos().max(0.01);
    meters / meters_per_degree
}

/// Axis-aligned bounding box of a polyline, WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Envelope {
    pub fn from_points(points: &[PathPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lon = f64::MAX;
        let mut max_lon = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lon = min_lon.min(p.longitude);
            max_lon = max_lon.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        })
    }

    pub fn center(&self) -> PathPoint {
        PathPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    /// Metric gap between two envelopes: zero when the boxes overlap,
    /// otherwise the haversine distance between the closest box edges.
    pub fn separation_from(&self, other: &Envelope) -> f64 {
        let lat = nearest_in_range(
            other.min_lat,
            other.max_lat,
            self.min_lat,
            self.max_lat,
        );
        let lon = nearest_in_range(
            other.min_lon,
            other.max_lon,
            self.min_lon,
            self.max_lon,
        );
        haversine_distance(
            &PathPoint::new(lat.0, lon.0),
            &PathPoint::new(lat.1, lon.1),
        )
    }
}

// Closest pair of coordinates between two 1-d ranges, one from each.
fn nearest_in_range(a_min: f64, a_max: f64, b_min: f64, b_max: f64) -> (f64, f64) {
    if a_max < b_min {
        (b_min, a_max)
    } else if b_max < a_min {
        (b_max, a_min)
    } else {
        // Overlapping ranges contribute no separation on this axis.
        let shared = a_min.max(b_min);
        (shared, shared)
    }
}

/// Polyline plus its precomputed envelope, the spatial shape of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteGeometry {
    pub points: Vec<PathPoint>,
    pub envelope: Envelope,
}

/// Reduce a normalized sample sequence to its coordinate polyline.
///
/// Samples without a finite in-range coordinate are dropped. Fewer than two
/// surviving coordinates is `InvalidGeometry`; callers treat that as a
/// dropped trace, not a fatal error.
pub fn build_geometry(samples: &[TraceSample]) -> Result<RouteGeometry, GeometryError> {
    let points: Vec<PathPoint> = samples
        .iter()
        .map(|s| PathPoint::new(s.latitude, s.longitude))
        .filter(PathPoint::is_valid)
        .collect();

    if points.len() < 2 {
        return Err(GeometryError::InvalidGeometry(points.len()));
    }

    let envelope = Envelope::from_points(&points).expect("nonempty polyline has an envelope");

    Ok(RouteGeometry { points, envelope })
}
