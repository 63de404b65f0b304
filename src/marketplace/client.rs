//! Core marketplace client types and trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crowd-work marketplace client - every call is a single request/response
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Publish one task; returns the external task id
    async fn create_task(&self, request: &TaskRequest) -> Result<String, MarketplaceError>;

    /// List every task the requester account owns (all pages)
    async fn list_tasks(&self) -> Result<Vec<TaskSummary>, MarketplaceError>;

    /// List every assignment submitted against one task (all pages)
    async fn list_assignments_for_task(&self, task_id: &str) -> Result<Vec<Assignment>, MarketplaceError>;

    /// Create a qualification type; returns its id
    async fn create_qualification_type(&self, name: &str, description: &str) -> Result<String, MarketplaceError>;

    /// Grant a qualification (value 1) to a worker
    async fn assign_qualification(
        &self,
        qualification_id: &str,
        worker_id: &str,
        notify_worker: bool,
    ) -> Result<(), MarketplaceError>;

    /// Human-readable backend name for logs
    fn name(&self) -> &str;
}

/// A task-creation request. Carries only the opaque pair hash (inside
/// `question`), never document identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskRequest {
    pub title: String,
    pub description: String,
    pub keywords: String,
    /// US dollars, e.g. "2.48"
    pub reward: String,
    pub max_assignments: u32,
    pub lifetime_in_seconds: u64,
    pub assignment_duration_in_seconds: u64,
    pub auto_approval_delay_in_seconds: u64,
    /// Rendered task layout
    pub question: String,
    pub qualification_requirements: Vec<QualificationRequirement>,
}

/// Comparators understood by the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    LessThan,
    LessThanOrEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
    EqualTo,
    NotEqualTo,
    Exists,
    DoesNotExist,
    In,
    NotIn,
}

/// What a worker who fails a requirement is prevented from doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    /// Task is hidden from search results entirely
    DiscoverPreviewAndAccept,
    /// Task is visible but cannot be previewed or accepted
    PreviewAndAccept,
    /// Task can be previewed but not accepted
    Accept,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Locale {
    pub country: String,
}

/// One eligibility constraint: (qualification, comparator, values, scope)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QualificationRequirement {
    pub qualification_type_id: String,
    pub comparator: Comparator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integer_values: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locale_values: Vec<Locale>,
    pub actions_guarded: Visibility,
}

impl QualificationRequirement {
    /// Worker must not hold the qualification
    pub fn does_not_exist(qualification_type_id: impl Into<String>, actions_guarded: Visibility) -> Self {
        Self {
            qualification_type_id: qualification_type_id.into(),
            comparator: Comparator::DoesNotExist,
            integer_values: Vec::new(),
            locale_values: Vec::new(),
            actions_guarded,
        }
    }

    /// Worker's qualification value must be at least `value`
    pub fn at_least(qualification_type_id: impl Into<String>, value: i64, actions_guarded: Visibility) -> Self {
        Self {
            qualification_type_id: qualification_type_id.into(),
            comparator: Comparator::GreaterThanOrEqualTo,
            integer_values: vec![value],
            locale_values: Vec::new(),
            actions_guarded,
        }
    }

    /// Worker's locale must be one of `countries`
    pub fn locale_in(
        qualification_type_id: impl Into<String>,
        countries: &[String],
        actions_guarded: Visibility,
    ) -> Self {
        Self {
            qualification_type_id: qualification_type_id.into(),
            comparator: Comparator::In,
            integer_values: Vec::new(),
            locale_values: countries.iter().map(|c| Locale { country: c.clone() }).collect(),
            actions_guarded,
        }
    }
}

/// Marketplace-side task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Assignable,
    Unassignable,
    Reviewable,
    Reviewing,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub max_assignments: u32,
    pub expiration: DateTime<Utc>,
    #[serde(default)]
    pub assignments_pending: u32,
    #[serde(default)]
    pub assignments_available: u32,
    #[serde(default)]
    pub assignments_completed: u32,
}

impl TaskSummary {
    /// The task will never receive another assignment: its lifetime is over
    /// and nobody is still working on it.
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        let expired = self.expiration <= now || self.status == TaskStatus::Disposed;
        expired && self.assignments_pending == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentStatus {
    Submitted,
    Approved,
    Rejected,
}

impl AssignmentStatus {
    /// Only submitted or approved work counts toward coverage
    pub fn is_creditable(&self) -> bool {
        matches!(self, AssignmentStatus::Submitted | AssignmentStatus::Approved)
    }
}

/// One worker's submission against a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Assignment {
    pub assignment_id: String,
    pub worker_id: String,
    pub task_id: String,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub submit_time: Option<DateTime<Utc>>,
}

/// Marketplace client errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MarketplaceError {
    /// The request never reached the server
    #[error("Marketplace unreachable: {0}")]
    Unreachable(String),

    /// The request may or may not have been applied
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Missing API key: set {var}")]
    MissingApiKey { var: String },
}

impl MarketplaceError {
    /// Whether repeating the call later can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            MarketplaceError::Unreachable(_) => true,
            MarketplaceError::Timeout(_) => true,
            MarketplaceError::RateLimited { .. } => true,
            MarketplaceError::Api { status, .. } => *status >= 500,
            MarketplaceError::InvalidResponse(_) => false,
            MarketplaceError::MissingApiKey { .. } => false,
        }
    }

    /// Whether the server certainly did not apply the request, so a
    /// non-idempotent call can be sent again without risking a duplicate.
    pub fn is_safe_to_resend(&self) -> bool {
        matches!(
            self,
            MarketplaceError::Unreachable(_) | MarketplaceError::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn summary(expiration: DateTime<Utc>, pending: u32, status: TaskStatus) -> TaskSummary {
        TaskSummary {
            task_id: "T1".to_string(),
            status,
            max_assignments: 3,
            expiration,
            assignments_pending: pending,
            assignments_available: 0,
            assignments_completed: 1,
        }
    }

    #[test]
    fn test_requirement_serializes_in_marketplace_shape() {
        let req = QualificationRequirement::does_not_exist("QUAL2", Visibility::DiscoverPreviewAndAccept);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["QualificationTypeId"], "QUAL2");
        assert_eq!(json["Comparator"], "DoesNotExist");
        assert_eq!(json["ActionsGuarded"], "DiscoverPreviewAndAccept");
        assert!(json.get("IntegerValues").is_none());
    }

    #[test]
    fn test_locale_requirement() {
        let req = QualificationRequirement::locale_in(
            "00000000000000000071",
            &["US".to_string(), "CA".to_string()],
            Visibility::PreviewAndAccept,
        );
        assert_eq!(req.comparator, Comparator::In);
        assert_eq!(req.locale_values.len(), 2);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["LocaleValues"][1]["Country"], "CA");
    }

    #[test]
    fn test_task_not_exhausted_before_expiration() {
        let now = Utc::now();
        let s = summary(now + Duration::hours(1), 0, TaskStatus::Assignable);
        assert!(!s.is_exhausted(now));
    }

    #[test]
    fn test_task_exhausted_after_expiration() {
        let now = Utc::now();
        let s = summary(now - Duration::hours(1), 0, TaskStatus::Reviewable);
        assert!(s.is_exhausted(now));
    }

    #[test]
    fn test_task_with_pending_work_not_exhausted() {
        let now = Utc::now();
        let s = summary(now - Duration::hours(1), 1, TaskStatus::Unassignable);
        assert!(!s.is_exhausted(now));
    }

    #[test]
    fn test_assignment_status_creditable() {
        assert!(AssignmentStatus::Submitted.is_creditable());
        assert!(AssignmentStatus::Approved.is_creditable());
        assert!(!AssignmentStatus::Rejected.is_creditable());
    }

    #[test]
    fn test_error_classification() {
        assert!(MarketplaceError::Unreachable("refused".into()).is_safe_to_resend());
        assert!(MarketplaceError::Timeout("30s".into()).is_transient());
        assert!(!MarketplaceError::Timeout("30s".into()).is_safe_to_resend());
        assert!(
            MarketplaceError::Api {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !MarketplaceError::Api {
                status: 400,
                message: "bad template".into()
            }
            .is_transient()
        );
        assert!(!MarketplaceError::InvalidResponse("bad".into()).is_transient());
    }
}
