//! Content-derived fingerprint of a tenant's data and the mismatch detector
//! comparing it with the cloud's.
//!
//! The fingerprint only covers counts and sums that survive a round trip
//! through any store: record counts, id sums, non-empty name counts and
//! integer-truncated weight and amount totals. Timestamps are excluded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::StoreAggregates;

/// SHA-256 (hex) over the canonical rendering of `aggregates`
pub fn local_fingerprint(aggregates: &StoreAggregates) -> String {
    let mut hasher = Sha256::new();
    for (kind, count) in &aggregates.counts {
        hasher.update(format!("{}={count};", kind.envelope_key()));
    }
    hasher.update(format!(
        "ids={};named={};weight={};amount={}",
        aggregates.id_sum, aggregates.named_count, aggregates.weight_sum, aggregates.amount_sum
    ));
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchReport {
    pub mismatched: bool,
    pub local_hash: String,
    /// `None` when the cloud could not produce a fingerprint
    pub cloud_hash: Option<String>,
    /// A mismatch was found but fell inside the post-upload window
    pub suppressed: bool,
}

/// Decides whether local and cloud data have diverged.
///
/// Right after an upload the cloud may still be applying the pushed records, so
/// a mismatch seen within `suppression` of `last_upload_time` is not reported.
/// A zero window disables suppression.
#[derive(Debug, Clone, Copy)]
pub struct MismatchDetector {
    suppression: Duration,
}

impl MismatchDetector {
    pub const fn new(suppression: Duration) -> Self {
        Self { suppression }
    }

    pub fn evaluate(
        &self,
        aggregates: &StoreAggregates,
        cloud_hash: Option<String>,
        last_upload_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> MismatchReport {
        let local_hash = local_fingerprint(aggregates);
        let differs = cloud_hash.as_deref().map_or_else(
            || !aggregates.is_empty(),
            |cloud| !cloud.trim().eq_ignore_ascii_case(&local_hash),
        );
        let suppressed = differs && self.within_window(last_upload_time, now);

        MismatchReport {
            mismatched: differs && !suppressed,
            local_hash,
            cloud_hash,
            suppressed,
        }
    }

    fn within_window(&self, last_upload_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if self.suppression.is_zero() {
            return false;
        }
        let Some(last_upload) = last_upload_time else {
            return false;
        };
        let Ok(window) = chrono::Duration::from_std(self.suppression) else {
            return false;
        };
        now >= last_upload && now - last_upload < window
    }
}
