//! Build jobs, their lifecycle statuses and results.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use url::Url;
use uuid::Uuid;

use crate::{Error, JobId, Result, WorkerId};

/// Highest priority a job may be admitted with.
pub const MAX_PRIORITY: u32 = 1000;

/// Milliseconds of arrival time one priority step outweighs (about 11.5 days).
///
/// `MAX_PRIORITY * PRIORITY_WEIGHT_MS` plus a current epoch in milliseconds stays
/// well inside the integer range an `f64` represents exactly.
pub const PRIORITY_WEIGHT_MS: i64 = 1_000_000_000;

static GIT_SHA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{4,40}$").expect("valid regex"));

static SCP_REMOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[^\s]+$").expect("valid regex"));

/// How the image should be built. Opaque to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStrategy {
    Dockerfile,
    Buildpack,
    #[default]
    Auto,
}

/// Build configuration carried with a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    pub strategy: BuildStrategy,
    /// Path to the Dockerfile, relative to the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Buildpack reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildpack: Option<String>,
    /// Build context path.
    pub context: String,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    /// Multi-stage target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A normalized job-creation request, as produced by the admission layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub project_id: Uuid,
    pub git_repo: String,
    pub git_sha: String,
    #[serde(default)]
    pub git_branch: String,
    pub build_config: BuildConfig,
    #[serde(default)]
    pub callback_url: Option<Url>,
    /// 0 is normal FIFO order, anything higher is expedited.
    #[serde(default)]
    pub priority: u32,
}

impl NewJob {
    /// Reject malformed descriptions before anything touches the store.
    pub fn validate(&self) -> Result<()> {
        if !is_git_remote(&self.git_repo) {
            return Err(Error::Validation(format!(
                "git_repo is not a git remote: {:?}",
                self.git_repo
            )));
        }
        if !GIT_SHA_RE.is_match(&self.git_sha) {
            return Err(Error::Validation(format!(
                "git_sha must be 4-40 hex characters: {:?}",
                self.git_sha
            )));
        }
        if self.build_config.context.trim().is_empty() {
            return Err(Error::Validation("build_config.context is empty".to_string()));
        }
        match self.build_config.strategy {
            BuildStrategy::Dockerfile if self.build_config.dockerfile.is_none() => {
                return Err(Error::Validation(
                    "dockerfile strategy requires build_config.dockerfile".to_string(),
                ));
            }
            BuildStrategy::Buildpack if self.build_config.buildpack.is_none() => {
                return Err(Error::Validation(
                    "buildpack strategy requires build_config.buildpack".to_string(),
                ));
            }
            _ => {}
        }
        if self.priority > MAX_PRIORITY {
            return Err(Error::Validation(format!(
                "priority {} exceeds maximum {}",
                self.priority, MAX_PRIORITY
            )));
        }
        Ok(())
    }

    /// Give the request an identity and admission time.
    pub fn admit(self, id: JobId, created_at: DateTime<Utc>) -> Job {
        Job {
            id,
            release_id: self.release_id,
            service_id: self.service_id,
            project_id: self.project_id,
            git_repo: self.git_repo,
            git_sha: self.git_sha,
            git_branch: self.git_branch,
            build_config: self.build_config,
            callback_url: self.callback_url,
            created_at,
            priority: self.priority,
        }
    }
}

fn is_git_remote(repo: &str) -> bool {
    if SCP_REMOTE_RE.is_match(repo) {
        return true;
    }
    match Url::parse(repo) {
        Ok(url) => {
            matches!(url.scheme(), "https" | "http" | "ssh" | "git" | "file")
                && (url.scheme() == "file" || url.host_str().is_some())
        }
        Err(_) => false,
    }
}

/// An admitted unit of dispatchable build work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub project_id: Uuid,
    pub git_repo: String,
    pub git_sha: String,
    pub git_branch: String,
    pub build_config: BuildConfig,
    pub callback_url: Option<Url>,
    pub created_at: DateTime<Utc>,
    pub priority: u32,
}

impl Job {
    /// Sort key in the priority structure: lower claims first.
    pub fn priority_score(&self) -> f64 {
        let arrival = self.created_at.timestamp_millis();
        (arrival - i64::from(self.priority) * PRIORITY_WEIGHT_MS) as f64
    }

    /// Abbreviated commit for log fields.
    pub fn short_sha(&self) -> &str {
        let end = self.git_sha.len().min(8);
        &self.git_sha[..end]
    }

    /// The request that would admit this job again.
    pub fn to_request(&self) -> NewJob {
        NewJob {
            release_id: self.release_id,
            service_id: self.service_id,
            project_id: self.project_id,
            git_repo: self.git_repo.clone(),
            git_sha: self.git_sha.clone(),
            git_branch: self.git_branch.clone(),
            build_config: self.build_config.clone(),
            callback_url: self.callback_url.clone(),
            priority: self.priority,
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Building,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Building,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Building => "building",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Building => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 2,
        }
    }

    /// Statuses only move forward. Rewriting the current status is allowed;
    /// moving between two different terminal statuses is not.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        *self == next || next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "building" => Ok(JobStatus::Building),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

/// A job together with its tracked lifecycle fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: Job,
    pub status: JobStatus,
    pub worker_id: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of a build, written once by the worker that ran it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub job_id: JobId,
    pub release_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub image_uri: String,
    #[serde(default)]
    pub image_digest: String,
    #[serde(default)]
    pub image_size_mb: f64,
    /// Software bill of materials.
    #[serde(default)]
    pub sbom: String,
    #[serde(default)]
    pub sbom_format: String,
    /// Detached image signature.
    #[serde(default)]
    pub image_signature: String,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub logs_url: String,
}

impl BuildResult {
    /// A failed result for a job that never produced one of its own.
    pub fn failure(job: &Job, message: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            job_id: job.id,
            release_id: job.release_id,
            success: false,
            duration_secs,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_request() -> NewJob {
        NewJob {
            release_id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            git_repo: "https://github.com/acme/api.git".to_string(),
            git_sha: "abc1234".to_string(),
            git_branch: "main".to_string(),
            build_config: BuildConfig {
                strategy: BuildStrategy::Dockerfile,
                dockerfile: Some("Dockerfile".to_string()),
                context: ".".to_string(),
                ..Default::default()
            },
            callback_url: None,
            priority: 0,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(make_request().validate().is_ok());
    }

    #[test]
    fn test_scp_style_remote_is_accepted() {
        let mut req = make_request();
        req.git_repo = "git@github.com:acme/api.git".to_string();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_sha() {
        let mut req = make_request();
        req.git_sha = "not-a-sha".to_string();
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_rejects_bad_repo() {
        let mut req = make_request();
        req.git_repo = "just some words".to_string();
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_dockerfile_strategy_requires_path() {
        let mut req = make_request();
        req.build_config.dockerfile = None;
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_rejects_priority_above_max() {
        let mut req = make_request();
        req.priority = MAX_PRIORITY + 1;
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_higher_priority_scores_lower_despite_later_arrival() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = early + chrono::Duration::days(5);

        let mut low = make_request();
        low.priority = 5;
        let mut high = make_request();
        high.priority = 10;

        let low = low.admit(JobId::new(), early);
        let high = high.admit(JobId::new(), late);
        assert!(high.priority_score() < low.priority_score());
    }

    #[test]
    fn test_equal_priority_scores_by_arrival() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1);

        let mut req = make_request();
        req.priority = 3;
        let first = req.clone().admit(JobId::new(), early);
        let second = req.admit(JobId::new(), late);
        assert!(first.priority_score() < second.priority_score());
    }

    #[test]
    fn test_status_transitions_only_move_forward() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Building));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Building.can_transition_to(JobStatus::Building));
        assert!(JobStatus::Building.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Building.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Building));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
