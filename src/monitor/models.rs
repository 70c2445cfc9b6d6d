use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

/// Opaque identity of a monitored target. The engine never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    Pending,
    Online,
    Offline,
}

impl FromStr for TargetStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TargetStatus::Pending),
            "ONLINE" => Ok(TargetStatus::Online),
            "OFFLINE" => Ok(TargetStatus::Offline),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetStatus::Pending => "PENDING",
            TargetStatus::Online => "ONLINE",
            TargetStatus::Offline => "OFFLINE",
        };
        f.write_str(s)
    }
}

/// A remote HTTP endpoint under periodic observation, as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredTarget {
    pub id: TargetId,
    pub name: String,
    pub url: String,
    pub method: String,
    pub interval: Duration,
    pub status: TargetStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

impl MonitoredTarget {
    /// Builds a freshly created target: `GET`, status `PENDING`, never checked.
    pub fn new(id: impl Into<TargetId>, url: impl Into<String>, interval: Duration) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            url: url.into(),
            method: "GET".to_string(),
            interval,
            status: TargetStatus::Pending,
            last_checked: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_status(mut self, status: TargetStatus) -> Self {
        self.status = status;
        self
    }

    /// True when the fields the probe depends on are identical.
    pub(crate) fn same_definition(&self, other: &MonitoredTarget) -> bool {
        self.name == other.name
            && self.url == other.url
            && self.method == other.method
            && self.interval == other.interval
    }
}

/// Status code recorded when no HTTP response was received.
pub const TRANSPORT_FAILURE_STATUS_CODE: u16 = 500;

/// Outcome of a single probe. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub target_id: TargetId,
    pub status_code: u16,
    pub latency: Duration,
    pub classification: TargetStatus,
    /// Transport error description, if the request never produced a response.
    pub error: Option<String>,
}

impl CheckResult {
    pub fn online(target_id: TargetId, status_code: u16, latency: Duration) -> Self {
        Self {
            target_id,
            status_code,
            latency,
            classification: TargetStatus::Online,
            error: None,
        }
    }

    pub fn offline(target_id: TargetId, status_code: u16, latency: Duration) -> Self {
        Self {
            target_id,
            status_code,
            latency,
            classification: TargetStatus::Offline,
            error: None,
        }
    }

    pub fn transport_failure(target_id: TargetId, latency: Duration, error: String) -> Self {
        Self {
            target_id,
            status_code: TRANSPORT_FAILURE_STATUS_CODE,
            latency,
            classification: TargetStatus::Offline,
            error: Some(error),
        }
    }
}

/// Append-only check log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckLogRecord {
    pub target_id: TargetId,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl CheckLogRecord {
    pub fn from_result(result: &CheckResult, created_at: DateTime<Utc>) -> Self {
        Self {
            target_id: result.target_id.clone(),
            status_code: result.status_code,
            response_time_ms: u64::try_from(result.latency.as_millis()).unwrap_or(u64::MAX),
            created_at,
        }
    }
}

/// A change of derived health between two consecutive checks of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub event_id: Uuid,
    pub target_id: TargetId,
    pub name: String,
    pub url: String,
    pub old_status: TargetStatus,
    pub new_status: TargetStatus,
    pub timestamp: DateTime<Utc>,
}

impl TransitionEvent {
    /// Returns `None` when the statuses are equal; an event only exists for a real change.
    pub fn between(
        target: &MonitoredTarget,
        old_status: TargetStatus,
        new_status: TargetStatus,
        timestamp: DateTime<Utc>,
    ) -> Option<Self> {
        if old_status == new_status {
            return None;
        }
        Some(Self {
            event_id: Uuid::new_v4(),
            target_id: target.id.clone(),
            name: target.name.clone(),
            url: target.url.clone(),
            old_status,
            new_status,
            timestamp,
        })
    }

    /// The first classification of a target that has never been checked.
    pub fn is_initial(&self) -> bool {
        self.old_status == TargetStatus::Pending
    }

    pub fn message(&self) -> String {
        format!(
            "Endpoint '{}' ({}) changed from {} to {}.",
            self.name, self.url, self.old_status, self.new_status
        )
    }
}
