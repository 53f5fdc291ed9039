use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::JobPosting;

/// Dedup key for a posting: its id, else its source URL, else a generated
/// timestamp key (which never collides, so such postings are never duplicates).
pub fn dedup_key(job: &JobPosting, now: DateTime<Utc>) -> String {
    non_blank(job.id.as_deref())
        .or_else(|| non_blank(job.url.as_deref()))
        .map(str::to_string)
        .unwrap_or_else(|| {
            let nonce = Uuid::new_v4().simple().to_string();
            format!("ts_{}_{}", now.timestamp_millis(), &nonce[..8])
        })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
