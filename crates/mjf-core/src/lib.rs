//! Core domain model for the Manfred job fetcher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mjf-core";

/// Opaque build hash the upstream embeds in detail URLs.
///
/// An empty value is a valid state meaning "refresh before first use".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildToken {
    pub value: String,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl BuildToken {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(value: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            fetched_at: Some(fetched_at),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }
}

/// One entry of the active-offers list, as handed from the upstream client to the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferSummary {
    pub offer_id: String,
    pub slug: String,
    pub title: String,
    pub company: String,
    pub company_logo_url: Option<String>,
    pub salary_from: Option<i64>,
    pub salary_to: Option<i64>,
    pub remote_percentage: Option<i64>,
    pub location: Option<String>,
    pub raw: JsonValue,
}

/// Persisted offer row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: String,
    pub slug: String,
    pub title: String,
    pub company: String,
    pub company_logo_url: Option<String>,
    pub salary_from: Option<i64>,
    pub salary_to: Option<i64>,
    pub remote_percentage: Option<i64>,
    pub location: Option<String>,
    pub is_active: bool,
    pub detail_fetched: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub raw_list_payload: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillCategory {
    Must,
    Nice,
    Extra,
}

impl SkillCategory {
    pub const ALL: [SkillCategory; 3] = [SkillCategory::Must, SkillCategory::Nice, SkillCategory::Extra];

    pub fn as_str(self) -> &'static str {
        match self {
            SkillCategory::Must => "must",
            SkillCategory::Nice => "nice",
            SkillCategory::Extra => "extra",
        }
    }
}

impl fmt::Display for SkillCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored or received enum label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for SkillCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "must" => Ok(SkillCategory::Must),
            "nice" => Ok(SkillCategory::Nice),
            "extra" => Ok(SkillCategory::Extra),
            other => Err(UnknownVariant {
                kind: "skill category",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub category: SkillCategory,
    pub name: String,
    pub level: Option<i64>,
    pub icon: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub name: String,
    pub level: Option<String>,
}

/// Requirements parsed from a successful detail fetch. Replaces the stored set wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OfferDetail {
    pub skills: Vec<Skill>,
    pub languages: Vec<Language>,
}

impl OfferDetail {
    pub fn skills_in(&self, category: SkillCategory) -> impl Iterator<Item = &Skill> {
        self.skills.iter().filter(move |s| s.category == category)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    List,
    Detail,
    Landing,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::List => "list",
            EndpointKind::Detail => "detail",
            EndpointKind::Landing => "landing",
        }
    }
}

impl FromStr for EndpointKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list" => Ok(EndpointKind::List),
            "detail" => Ok(EndpointKind::Detail),
            "landing" => Ok(EndpointKind::Landing),
            other => Err(UnknownVariant {
                kind: "endpoint kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Success,
    HttpError,
    TokenStale,
    Exhausted,
}

impl FetchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchOutcome::Success => "success",
            FetchOutcome::HttpError => "http_error",
            FetchOutcome::TokenStale => "token_stale",
            FetchOutcome::Exhausted => "exhausted",
        }
    }
}

impl FromStr for FetchOutcome {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(FetchOutcome::Success),
            "http_error" => Ok(FetchOutcome::HttpError),
            "token_stale" => Ok(FetchOutcome::TokenStale),
            "exhausted" => Ok(FetchOutcome::Exhausted),
            other => Err(UnknownVariant {
                kind: "fetch outcome",
                value: other.to_string(),
            }),
        }
    }
}

/// Append-only audit row for one upstream request (including its retries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLogEntry {
    pub timestamp: DateTime<Utc>,
    pub endpoint_kind: EndpointKind,
    pub target: String,
    pub outcome: FetchOutcome,
    pub attempts: u32,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Failed,
    Retired,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 4] = [
        NotificationStatus::Pending,
        NotificationStatus::Delivered,
        NotificationStatus::Failed,
        NotificationStatus::Retired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Retired => "retired",
        }
    }

    /// Delivered and retired records are never sent again.
    pub fn blocks_sending(self) -> bool {
        matches!(self, NotificationStatus::Delivered | NotificationStatus::Retired)
    }
}

impl FromStr for NotificationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "delivered" => Ok(NotificationStatus::Delivered),
            "failed" => Ok(NotificationStatus::Failed),
            "retired" => Ok(NotificationStatus::Retired),
            other => Err(UnknownVariant {
                kind: "notification status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub offer_id: String,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub message_id: Option<String>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub created: usize,
    pub updated: usize,
    pub deactivated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub retired: usize,
}

/// Outcome of one fetch → details → notify → reconcile cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub upsert: UpsertSummary,
    pub details_fetched: usize,
    pub details_failed: usize,
    pub notified: usize,
    pub notify_failed: usize,
    pub reconcile: ReconcileSummary,
    pub cancelled: bool,
}
