//! Identities, tiers and usage statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access classification carried inside credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Password-authenticated; never metered.
    Full,
    /// Self-registered by email; gated by the daily quota.
    Academic,
}

impl Tier {
    pub fn is_quota_bound(self) -> bool {
        matches!(self, Tier::Academic)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Full => "full",
            Tier::Academic => "academic",
        }
    }
}

/// A registered identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

/// Usage summary for one identity.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub used_today: u64,
    pub remaining_today: u64,
    pub daily_limit: u32,
    pub total_all_time: u64,
}

/// Canonical form of an identity: trimmed and lowercased.
pub fn normalize_identity(raw: &str) -> String {
    raw.trim().to_lowercase()
}
