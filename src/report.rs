//! Read-only summary projection over the consensus state.
//!
//! Operators use this to watch the catalog converge; nothing here feeds
//! back into the consensus protocol.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::Contributor;
use crate::store::{CandidateRank, ConsensusStore, StoreError, SummaryCounts};

#[derive(Debug, Serialize)]
pub struct NetworkReport {
    pub generated_at: DateTime<Utc>,
    pub counts: SummaryCounts,
    pub top_candidates: Vec<CandidateRank>,
    pub top_contributors: Vec<Contributor>,
}

pub async fn build_report<S: ConsensusStore>(
    store: &S,
    top: i64,
    now: DateTime<Utc>,
) -> Result<NetworkReport, StoreError> {
    Ok(NetworkReport {
        generated_at: now,
        counts: store.summary().await?,
        top_candidates: store.top_candidates(top).await?,
        top_contributors: store.top_contributors(top).await?,
    })
}

pub fn render_text(report: &NetworkReport) -> String {
    let mut out = String::new();

    out.push_str(&format!("Network summary at {}\n", report.generated_at));
    out.push_str(&format!(
        "  contributions: {} pending / {} verified / {} merged / {} rejected\n",
        report.counts.pending,
        report.counts.verified,
        report.counts.merged,
        report.counts.rejected
    ));
    out.push_str(&format!(
        "  {} distinct contributors, mean verification count {:.2}\n",
        report.counts.distinct_contributors, report.counts.mean_verification_count
    ));

    out.push_str("\nTop candidates (by verifications, then net votes):\n");
    for (rank, candidate) in report.top_candidates.iter().enumerate() {
        let label = candidate
            .route_name
            .clone()
            .or_else(|| {
                match (&candidate.origin_name, &candidate.destination_name) {
                    (Some(origin), Some(destination)) => {
                        Some(format!("{origin} - {destination}"))
                    }
                    _ => None,
                }
            })
            .unwrap_or_else(|| candidate.id.to_string());
        out.push_str(&format!(
            "  {:>2}. {label}  ({} verifications, net votes {:+})\n",
            rank + 1,
            candidate.verification_count,
            candidate.net_votes
        ));
    }

    out.push_str("\nTop contributors (by reputation):\n");
    for (rank, contributor) in report.top_contributors.iter().enumerate() {
        out.push_str(&format!(
            "  {:>2}. {}  (reputation {}, {} contributions, {} verified)\n",
            rank + 1,
            contributor.device_id,
            contributor.reputation,
            contributor.total_contributions,
            contributor.verified_contributions
        ));
    }

    out
}
