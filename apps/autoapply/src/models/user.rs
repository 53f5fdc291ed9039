use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Profile returned by `GET /api/auth/me`.
///
/// Kept opaque: the session replaces it wholesale on every refresh and never
/// edits individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(pub Value);

impl UserProfile {
    pub fn full_name(&self) -> Option<&str> {
        self.0.get("full_name").and_then(|v| v.as_str())
    }

    pub fn email(&self) -> Option<&str> {
        self.0.get("email").and_then(|v| v.as_str())
    }
}
