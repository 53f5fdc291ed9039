use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A job posting as returned by `GET /jobs/search`.
///
/// Only the fields the apply queue needs are typed. The upstream schema is not
/// stable, so the few aliases seen in practice are accepted and everything
/// else is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    #[serde(
        default,
        alias = "job_id",
        alias = "jobId",
        deserialize_with = "string_or_number"
    )]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "apply_url", alias = "job_url")]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Ids come back as strings from some sources and integers from others.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// `GET /jobs/search` answers with either a bare array or a wrapper object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SearchResponse {
    List(Vec<JobPosting>),
    Wrapped {
        #[serde(default)]
        jobs: Vec<JobPosting>,
        #[serde(default)]
        total: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub jobs: Vec<JobPosting>,
    pub total: usize,
}

impl From<SearchResponse> for SearchResults {
    fn from(response: SearchResponse) -> Self {
        match response {
            SearchResponse::List(jobs) => SearchResults {
                total: jobs.len(),
                jobs,
            },
            SearchResponse::Wrapped { jobs, total } => SearchResults {
                total: total.map(|t| t as usize).unwrap_or(jobs.len()),
                jobs,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationStatus {
    Draft,
    Applied,
    Interview,
    Offer,
    Rejected,
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplicationStatus::Draft => "Draft",
            ApplicationStatus::Applied => "Applied",
            ApplicationStatus::Interview => "Interview",
            ApplicationStatus::Offer => "Offer",
            ApplicationStatus::Rejected => "Rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(ApplicationStatus::Draft),
            "applied" => Ok(ApplicationStatus::Applied),
            "interview" => Ok(ApplicationStatus::Interview),
            "offer" => Ok(ApplicationStatus::Offer),
            "rejected" => Ok(ApplicationStatus::Rejected),
            other => Err(format!(
                "unknown status '{other}' (expected Draft, Applied, Interview, Offer or Rejected)"
            )),
        }
    }
}

/// Body of `POST /jobs/apply`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyPayload {
    pub job_id: String,
    pub job_title: String,
    pub company: String,
    pub location: String,
    pub job_url: String,
    pub notes: String,
    pub status: ApplicationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_posting_accepts_alias_fields_and_numeric_id() {
        let posting: JobPosting = serde_json::from_value(json!({
            "job_id": 42,
            "title": "Engineer",
            "apply_url": "https://jobs.example/42",
            "match_score": 0.9
        }))
        .unwrap();

        assert_eq!(posting.id.as_deref(), Some("42"));
        assert_eq!(posting.url.as_deref(), Some("https://jobs.example/42"));
        assert!(posting.company.is_none());
    }

    #[test]
    fn test_search_response_accepts_both_shapes() {
        let bare: SearchResponse = serde_json::from_value(json!([{"id": "1"}, {"id": "2"}])).unwrap();
        let bare = SearchResults::from(bare);
        assert_eq!(bare.total, 2);

        let wrapped: SearchResponse =
            serde_json::from_value(json!({"jobs": [{"id": "1"}], "total": 57, "page": 1})).unwrap();
        let wrapped = SearchResults::from(wrapped);
        assert_eq!(wrapped.jobs.len(), 1);
        assert_eq!(wrapped.total, 57);
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!("interview".parse::<ApplicationStatus>().unwrap(), ApplicationStatus::Interview);
        assert_eq!("Offer".parse::<ApplicationStatus>().unwrap(), ApplicationStatus::Offer);
        assert!("hired".parse::<ApplicationStatus>().is_err());
        assert_eq!(serde_json::to_value(ApplicationStatus::Applied).unwrap(), json!("Applied"));
    }
}
