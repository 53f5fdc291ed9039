use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{ApplicationStatus, ApplyPayload};

/// One job posting waiting in the local apply queue.
///
/// Persisted as part of the JSON array under `maa_apply_queue_v1`; field names
/// must stay backward compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Dedup key, unique within the queue.
    pub job_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub notes: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn apply_payload(&self) -> ApplyPayload {
        ApplyPayload {
            job_id: self.job_id.clone(),
            job_title: self.title.clone(),
            company: self.company.clone(),
            location: self.location.clone(),
            job_url: self.source_url.clone(),
            notes: self.notes.clone(),
            status: ApplicationStatus::Applied,
        }
    }
}
