//! Client for the external contributor feed.
//!
//! The feed serves pages of raw trip recordings uploaded from rider
//! devices. Workers pull everything since a cutoff (default: the last 24
//! hours) and hand each recording to the pipeline; the feed service itself
//! handles upload auth, deduplication and privacy filtering before traces
//! ever reach us.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::trace::{RawTrace, TraceMetadata, TraceSample};

/// Hard ceiling on pages per pull, in case the feed misbehaves and keeps
/// returning a next page.
const MAX_PAGES: u32 = 500;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid feed url: {0}")]
    Url(#[from] url::ParseError),
    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Deserialize, Debug, Clone)]
pub struct FeedSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct FeedMetadata {
    #[serde(default)]
    pub route_type: Option<String>,
    #[serde(default)]
    pub route_name: Option<String>,
    #[serde(default)]
    pub route_number: Option<String>,
    #[serde(default)]
    pub origin_name: Option<String>,
    #[serde(default)]
    pub destination_name: Option<String>,
    #[serde(default)]
    pub fare: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FeedTrace {
    pub device_id: String,
    pub samples: Vec<FeedSample>,
    #[serde(default)]
    pub metadata: FeedMetadata,
}

#[derive(Deserialize, Debug)]
pub struct FeedPage {
    pub traces: Vec<FeedTrace>,
    #[serde(default)]
    pub next_page: Option<u32>,
}

impl FeedTrace {
    pub fn into_raw(self) -> RawTrace {
        RawTrace {
            device_id: self.device_id,
            samples: self
                .samples
                .into_iter()
                .map(|s| TraceSample {
                    latitude: s.latitude,
                    longitude: s.longitude,
                    speed: s.speed,
                    timestamp: s.timestamp,
                })
                .collect(),
            metadata: TraceMetadata {
                route_type: self.metadata.route_type,
                route_name: self.metadata.route_name,
                route_number: self.metadata.route_number,
                origin_name: self.metadata.origin_name,
                destination_name: self.metadata.destination_name,
                fare: self.metadata.fare,
                notes: self.metadata.notes,
            },
        }
    }
}

pub struct FeedClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl FeedClient {
    pub fn new(base_url: Url, token: Option<String>) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("acacia-backend")
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Reads `CONTRIBUTOR_FEED_URL` (required) and
    /// `CONTRIBUTOR_FEED_TOKEN` (optional bearer token).
    pub fn from_env() -> Result<Self, FeedError> {
        let base = std::env::var("CONTRIBUTOR_FEED_URL")
            .map_err(|_| FeedError::MissingEnv("CONTRIBUTOR_FEED_URL"))?;
        let token = std::env::var("CONTRIBUTOR_FEED_TOKEN").ok();
        Self::new(Url::parse(&base)?, token)
    }

    /// Pulls every trace recorded since the cutoff, walking the feed's
    /// pagination to the end.
    pub async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<RawTrace>, FeedError> {
        let endpoint = self.base_url.join("traces")?;
        let mut collected: Vec<RawTrace> = Vec::new();
        let mut page = 1u32;
        let mut pages_fetched = 0u32;

        loop {
            let mut request = self.http.get(endpoint.clone()).query(&[
                ("since", since.to_rfc3339()),
                ("page", page.to_string()),
            ]);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let body: FeedPage = request
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            collected.extend(body.traces.into_iter().map(FeedTrace::into_raw));
            pages_fetched += 1;

            match body.next_page {
                Some(next) if pages_fetched < MAX_PAGES => page = next,
                _ => break,
            }
        }

        info!("fetched {} traces since {}", collected.len(), since);

        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_feed_page() {
        let body = r#"{
            "traces": [
                {
                    "device_id": "8d2f",
                    "samples": [
                        {"latitude": -1.29, "longitude": 36.82, "speed": 7.2,
                         "timestamp": "2025-06-01T08:00:00Z"},
                        {"latitude": -1.30, "longitude": 36.83}
                    ],
                    "metadata": {"route_type": "matatu", "route_name": "46",
                                 "fare": 80.0}
                }
            ],
            "next_page": 2
        }"#;

        let page: FeedPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.next_page, Some(2));
        assert_eq!(page.traces.len(), 1);

        let raw = page.traces.into_iter().next().unwrap().into_raw();
        assert_eq!(raw.device_id, "8d2f");
        assert_eq!(raw.samples.len(), 2);
        assert_eq!(raw.samples[0].speed, Some(7.2));
        assert!(raw.samples[1].timestamp.is_none());
        assert_eq!(raw.metadata.fare, Some(80.0));
    }

    #[test]
    fn missing_metadata_defaults_to_empty() {
        let body = r#"{"traces": [{"device_id": "a", "samples": []}]}"#;
        let page: FeedPage = serde_json::from_str(body).unwrap();
        let raw = page.traces.into_iter().next().unwrap().into_raw();
        assert!(raw.metadata.route_type.is_none());
        assert!(page.next_page.is_none());
    }
}
