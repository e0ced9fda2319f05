//! Raw contributor traces and their normalization into an ordered,
//! bounded sample sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Traces with fewer usable samples than this are dropped before any
/// derivation happens.
pub const MIN_TRACE_SAMPLES: usize = 10;

/// Upper bound on samples per trace. Keeps the O(n*m) curve-distance step
/// bounded; longer recordings are uniformly thinned to this cap.
pub const MAX_TRACE_SAMPLES: usize = 2000;

#[derive(Error, Debug)]
pub enum TraceRejection {
    #[error("trace too short: {0} usable samples")]
    TooShort(usize),
}

/// One recorded fix: position, optional instantaneous speed (m/s),
/// optional timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceSample {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TraceSample {
    pub fn has_valid_position(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Free-form metadata riders attach to a recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    pub route_type: Option<String>,
    pub route_name: Option<String>,
    pub route_number: Option<String>,
    pub origin_name: Option<String>,
    pub destination_name: Option<String>,
    pub fare: Option<f64>,
    pub notes: Option<String>,
}

/// A trip recording as pulled from the contributor feed, before any
/// normalization.
#[derive(Debug, Clone)]
pub struct RawTrace {
    pub device_id: String,
    pub samples: Vec<TraceSample>,
    pub metadata: TraceMetadata,
}

/// Maps a contributor-supplied mode tag onto the stored route_type code.
/// Codes follow the GTFS extended convention the rest of the catalog uses.
pub fn route_type_tag(tag: Option<&str>) -> i16 {
    match tag.map(|t| t.trim().to_ascii_lowercase()).as_deref() {
        Some("minibus") | Some("matatu") | Some("danfo") | Some("trotro") => 1700,
        Some("shared_ride") | Some("shared-ride") | Some("shared_taxi") | Some("shared-taxi") => {
            1501
        }
        Some("bus") => 3,
        Some("ferry") => 4,
        _ => 1700,
    }
}

/// Normalizes a raw sample list: drops fixes without a usable position,
/// orders by timestamp where timestamps exist, and thins oversized traces
/// down to [`MAX_TRACE_SAMPLES`].
///
/// Returns [`TraceRejection::TooShort`] when fewer than
/// [`MIN_TRACE_SAMPLES`] fixes survive. Short traces are a normal condition
/// of the feed, not an error; callers count and drop them.
pub fn normalize_samples(samples: &[TraceSample]) -> Result<Vec<TraceSample>, TraceRejection> {
    let mut usable: Vec<TraceSample> = samples
        .iter()
        .copied()
        .filter(TraceSample::has_valid_position)
        .collect();

    // Recordings carry timestamps on every fix or on none of them. A fully
    // timestamped trace is reordered by time; anything else keeps its
    // recorded order.
    if usable.iter().all(|s| s.timestamp.is_some()) {
        usable.sort_by_key(|s| s.timestamp);
    }

    if usable.len() < MIN_TRACE_SAMPLES {
        return Err(TraceRejection::TooShort(usable.len()));
    }

    if usable.len() > MAX_TRACE_SAMPLES {
        let step = usable.len() as f64 / MAX_TRACE_SAMPLES as f64;
        let mut thinned: Vec<TraceSample> = (0..MAX_TRACE_SAMPLES)
            .map(|i| usable[(i as f64 * step) as usize])
            .collect();
        // The final fix is the destination; never thin it away.
        *thinned.last_mut().expect("cap is nonzero") =
            *usable.last().expect("len checked above");
        usable = thinned;
    }

    Ok(usable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fix(lat: f64, lon: f64, ts_offset_secs: Option<i64>) -> TraceSample {
        TraceSample {
            latitude: lat,
            longitude: lon,
            speed: None,
            timestamp: ts_offset_secs
                .map(|s| Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(s)),
        }
    }

    #[test]
    fn short_trace_is_rejected() {
        let samples: Vec<TraceSample> = (0..9).map(|i| fix(-1.29 + i as f64 * 0.001, 36.82, None)).collect();
        assert!(matches!(
            normalize_samples(&samples),
            Err(TraceRejection::TooShort(9))
        ));
    }

    #[test]
    fn invalid_positions_count_against_minimum() {
        let mut samples: Vec<TraceSample> =
            (0..10).map(|i| fix(-1.29 + i as f64 * 0.001, 36.82, None)).collect();
        samples[4].latitude = f64::NAN;
        assert!(matches!(
            normalize_samples(&samples),
            Err(TraceRejection::TooShort(9))
        ));
    }

    #[test]
    fn out_of_order_timestamps_are_sorted() {
        let mut samples: Vec<TraceSample> =
            (0..12).map(|i| fix(-1.29 + i as f64 * 0.001, 36.82, Some(i * 10))).collect();
        samples.swap(3, 7);
        let normalized = normalize_samples(&samples).unwrap();
        for pair in normalized.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn oversized_trace_is_thinned_and_keeps_endpoints() {
        let samples: Vec<TraceSample> = (0..(MAX_TRACE_SAMPLES + 500))
            .map(|i| fix(-1.29 + i as f64 * 0.00001, 36.82, Some(i as i64)))
            .collect();
        let normalized = normalize_samples(&samples).unwrap();
        assert_eq!(normalized.len(), MAX_TRACE_SAMPLES);
        assert_eq!(normalized[0], samples[0]);
        assert_eq!(normalized.last(), samples.last());
    }

    #[test]
    fn mode_tags_map_to_stable_codes() {
        assert_eq!(route_type_tag(Some("matatu")), 1700);
        assert_eq!(route_type_tag(Some("Shared-Ride")), 1501);
        assert_eq!(route_type_tag(Some("bus")), 3);
        assert_eq!(route_type_tag(None), 1700);
    }
}
