//! Derives an ordered stop list from a normalized trace.
//!
//! The first and last fixes always become the origin and destination. An
//! intermediate stop is declared where a 3-sample window shows the vehicle
//! dwelling: mean window speed under the low-speed floor and, when the
//! window endpoints carry timestamps, a window span over the dwell minimum.
//! Traces without timestamps fall back to the speed-only test. That fallback
//! can misread a fast-but-brief halt as a stop; it is kept as documented
//! behaviour of the upstream data rather than corrected here.

use serde::{Deserialize, Serialize};

use crate::geometry::{PathPoint, haversine_distance};
use crate::trace::TraceSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopRole {
    Origin,
    Intermediate,
    Destination,
}

impl StopRole {
    pub fn to_i16(self) -> i16 {
        match self {
            StopRole::Origin => 0,
            StopRole::Intermediate => 1,
            StopRole::Destination => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredStop {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
    pub role: StopRole,
    /// Position of the stop in trace order, origin = 0.
    pub sequence: u32,
}

/// Mean speed (m/s) observed over a 3-sample window.
///
/// Recorded instantaneous speeds win; without any, speeds are derived from
/// consecutive fixes when both carry timestamps. `None` when the window
/// offers no speed evidence at all.
fn window_mean_speed(window: &[TraceSample]) -> Option<f64> {
    let recorded: Vec<f64> = window.iter().filter_map(|s| s.speed).collect();
    if !recorded.is_empty() {
        return Some(recorded.iter().sum::<f64>() / recorded.len() as f64);
    }

    let mut derived = Vec::new();
    for pair in window.windows(2) {
        if let (Some(t0), Some(t1)) = (pair[0].timestamp, pair[1].timestamp) {
            let secs = (t1 - t0).num_milliseconds() as f64 / 1000.0;
            if secs > 0.0 {
                let meters = haversine_distance(
                    &PathPoint::new(pair[0].latitude, pair[0].longitude),
                    &PathPoint::new(pair[1].latitude, pair[1].longitude),
                );
                derived.push(meters / secs);
            }
        }
    }
    if derived.is_empty() {
        None
    } else {
        Some(derived.iter().sum::<f64>() / derived.len() as f64)
    }
}

/// Window span in seconds, when both endpoints are timestamped.
fn window_dwell_secs(window: &[TraceSample]) -> Option<i64> {
    match (window.first()?.timestamp, window.last()?.timestamp) {
        (Some(start), Some(end)) => Some((end - start).num_seconds()),
        _ => None,
    }
}

/// Infers the ordered stop list for a normalized trace.
///
/// `low_speed_floor_ms` and `min_dwell_secs` are the detection thresholds
/// (defaults live in [`crate::consensus::ConsensusConfig`]). The caller
/// guarantees at least [`crate::trace::MIN_TRACE_SAMPLES`] samples.
pub fn infer_stops(
    samples: &[TraceSample],
    low_speed_floor_ms: f64,
    min_dwell_secs: i64,
) -> Vec<InferredStop> {
    let first = &samples[0];
    let last = &samples[samples.len() - 1];

    let mut stops = vec![InferredStop {
        latitude: first.latitude,
        longitude: first.longitude,
        name: None,
        role: StopRole::Origin,
        sequence: 0,
    }];

    let mut sequence = 1u32;
    let mut last_marked: Option<usize> = None;

    for center in 1..samples.len() - 1 {
        // Adjacent fixes never both become stops.
        if last_marked == Some(center - 1) {
            continue;
        }

        let window = &samples[center - 1..=center + 1];
        let Some(mean_speed) = window_mean_speed(window) else {
            continue;
        };
        if mean_speed >= low_speed_floor_ms {
            continue;
        }
        if let Some(dwell) = window_dwell_secs(window) {
            if dwell <= min_dwell_secs {
                continue;
            }
        }

        let sample = &samples[center];
        stops.push(InferredStop {
            latitude: sample.latitude,
            longitude: sample.longitude,
            name: None,
            role: StopRole::Intermediate,
            sequence,
        });
        sequence += 1;
        last_marked = Some(center);
    }

    stops.push(InferredStop {
        latitude: last.latitude,
        longitude: last.longitude,
        name: None,
        role: StopRole::Destination,
        sequence,
    });

    stops
}
