//! Core domain model for onionwatch: address lifecycle, check outcomes and findings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "onionwatch-core";

/// Liveness state of a known address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressStatus {
    Alive,
    Dead,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressStatus::Alive => "alive",
            AddressStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown address status {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for AddressStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alive" => Ok(AddressStatus::Alive),
            "dead" => Ok(AddressStatus::Dead),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// One row of the address store.
///
/// `status == Alive` always implies `last_seen == Some(_)`, equal to the
/// timestamp of the most recent successful check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub status: AddressStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl AddressRecord {
    /// A freshly discovered address. New addresses are never presumed alive.
    pub fn unverified(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            status: AddressStatus::Dead,
            last_seen: None,
            last_checked: None,
        }
    }

    pub fn apply_check(&mut self, outcome: &CheckOutcome) {
        self.last_checked = Some(outcome.checked_at);
        match outcome.result {
            CheckResult::Alive { .. } => {
                self.status = AddressStatus::Alive;
                self.last_seen = Some(outcome.checked_at);
            }
            CheckResult::Dead(_) => {
                self.status = AddressStatus::Dead;
            }
        }
    }

    /// Whether the record is eligible for a liveness check given the cooldown cutoff.
    pub fn is_due(&self, cutoff: DateTime<Utc>) -> bool {
        match self.last_checked {
            None => true,
            Some(checked) => checked < cutoff,
        }
    }

    /// Whether the retention sweeper should purge this record.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        if self.status != AddressStatus::Dead {
            return false;
        }
        match self.last_seen {
            None => true,
            Some(seen) => seen < cutoff,
        }
    }
}

/// Why a liveness check classified an address as dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeadReason {
    Timeout,
    Unreachable(String),
    ProxyUnavailable(String),
}

impl DeadReason {
    pub fn is_proxy_failure(&self) -> bool {
        matches!(self, DeadReason::ProxyUnavailable(_))
    }
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadReason::Timeout => f.write_str("timed out"),
            DeadReason::Unreachable(detail) => write!(f, "unreachable: {detail}"),
            DeadReason::ProxyUnavailable(detail) => write!(f, "proxy unavailable: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckResult {
    Alive { http_status: u16 },
    Dead(DeadReason),
}

/// Result of a single liveness check, as handed from a worker to the store writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub address: String,
    pub checked_at: DateTime<Utc>,
    pub result: CheckResult,
}

impl CheckOutcome {
    pub fn alive(address: impl Into<String>, checked_at: DateTime<Utc>, http_status: u16) -> Self {
        Self {
            address: address.into(),
            checked_at,
            result: CheckResult::Alive { http_status },
        }
    }

    pub fn dead(address: impl Into<String>, checked_at: DateTime<Utc>, reason: DeadReason) -> Self {
        Self {
            address: address.into(),
            checked_at,
            result: CheckResult::Dead(reason),
        }
    }

    pub fn status(&self) -> AddressStatus {
        match self.result {
            CheckResult::Alive { .. } => AddressStatus::Alive,
            CheckResult::Dead(_) => AddressStatus::Dead,
        }
    }

    pub fn is_proxy_failure(&self) -> bool {
        matches!(&self.result, CheckResult::Dead(reason) if reason.is_proxy_failure())
    }
}

/// Evidence that a page matched one or more configured signal terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredFinding {
    pub address: String,
    pub title: String,
    pub matched_keywords: Vec<String>,
    pub context_snippet: String,
    pub first_matched_at: DateTime<Utc>,
    pub last_matched_at: DateTime<Utc>,
}

impl FilteredFinding {
    /// Fold a newer match for the same address into this one.
    ///
    /// Title and snippet take the newer values, matched terms are the union
    /// (existing order first), and `first_matched_at` is kept.
    pub fn merge(mut self, newer: FilteredFinding) -> FilteredFinding {
        for term in newer.matched_keywords {
            if !self
                .matched_keywords
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(&term))
            {
                self.matched_keywords.push(term);
            }
        }
        self.title = newer.title;
        self.context_snippet = newer.context_snippet;
        self.first_matched_at = self.first_matched_at.min(newer.first_matched_at);
        self.last_matched_at = self.last_matched_at.max(newer.last_matched_at);
        self
    }
}

/// Which configured list a signal term came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Keyword,
    ScamPattern,
}

/// Operator-provided document: listing sources plus the terms to look for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub scam_patterns: Vec<String>,
}

impl SignalConfig {
    /// Keywords first, then scam patterns, blank entries skipped.
    pub fn terms(&self) -> impl Iterator<Item = (SignalKind, &str)> + '_ {
        let keywords = self.keywords.iter().map(|k| (SignalKind::Keyword, k.as_str()));
        let scams = self
            .scam_patterns
            .iter()
            .map(|p| (SignalKind::ScamPattern, p.as_str()));
        keywords
            .chain(scams)
            .map(|(kind, term)| (kind, term.trim()))
            .filter(|(_, term)| !term.is_empty())
    }

    pub fn has_terms(&self) -> bool {
        self.terms().next().is_some()
    }
}
