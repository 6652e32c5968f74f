use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::operation::Operation;

/// Lifecycle state of a processing job.
///
/// Transitions are enforced by conditional UPDATEs in `db::jobs`; the
/// database row is the arbiter, this enum only names the states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    #[serde(rename = "canceled")]
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "canceled",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions except deletion by the
    /// sweeper.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// An image processing job, one row per submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: JobStatus,
    pub original_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub processed_key: String,
    pub original_name: String,
    pub content_type: String,
    pub file_size: i64,
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        owner_id: Uuid,
        original_key: String,
        original_name: String,
        content_type: String,
        file_size: i64,
        operations: Vec<Operation>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            status: JobStatus::Pending,
            original_key,
            processed_key: String::new(),
            original_name,
            content_type,
            file_size,
            operations,
            error: String::new(),
            progress: 0,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            delete_at: None,
        }
    }
}

/// Paginated job listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::operation::default_operations;

    fn sample_job() -> Job {
        Job::new(
            Uuid::nil(),
            "users/00000000-0000-0000-0000-000000000000/original/x/cat.jpg".into(),
            "cat.jpg".into(),
            "image/jpeg".into(),
            1024,
            default_operations(),
        )
    }

    #[test]
    fn new_jobs_start_pending_with_zero_progress() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.processed_key.is_empty());
        assert!(job.delete_at.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn status_strings_round_trip_through_the_database_encoding() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_db(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_db("exploded"), None);
    }

    #[test]
    fn cancelled_uses_the_single_l_wire_spelling() {
        let encoded = serde_json::to_string(&JobStatus::Cancelled).expect("serialize");
        assert_eq!(encoded, r#""canceled""#);
    }

    #[test]
    fn empty_fields_are_omitted_from_json() {
        let encoded = serde_json::to_value(sample_job()).expect("serialize");
        let obj = encoded.as_object().expect("object");
        assert!(!obj.contains_key("processed_key"));
        assert!(!obj.contains_key("error"));
        assert!(!obj.contains_key("worker_id"));
        assert!(!obj.contains_key("delete_at"));
        assert_eq!(obj["status"], "pending");
    }
}
