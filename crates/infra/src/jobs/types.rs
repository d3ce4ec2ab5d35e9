//! Core job types.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coursegen_core::{CourseId, DomainError, UserId};

/// Opaque key/value document used for job payloads and results.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Time-ordered (UUIDv7) so ids sort roughly by creation.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s.trim())
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Job kind, used to route a job to its handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobKind {
    /// Generate a complete course from a markdown source.
    CourseGeneration,
    /// Assemble the video for one lesson.
    VideoProcessing,
    /// Text-to-speech for a block of text.
    AudioGeneration,
    /// Time-coded subtitles for an audio track.
    SubtitleGeneration,
    /// Any other kind registered by a collaborator.
    Custom(String),
}

impl JobKind {
    /// The built-in kinds with a short human description.
    pub fn catalog() -> [(JobKind, &'static str); 4] {
        [
            (JobKind::CourseGeneration, "Generate complete course from markdown"),
            (JobKind::VideoProcessing, "Process video components"),
            (JobKind::AudioGeneration, "Generate audio from text"),
            (JobKind::SubtitleGeneration, "Generate subtitles from audio"),
        ]
    }

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom(kind.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobKind::CourseGeneration => "course_generation",
            JobKind::VideoProcessing => "video_processing",
            JobKind::AudioGeneration => "audio_generation",
            JobKind::SubtitleGeneration => "subtitle_generation",
            JobKind::Custom(kind) => kind,
        }
    }

    /// A kind is usable when it has a non-blank name.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            JobKind::Custom(kind) if kind.trim().is_empty() => {
                Err(DomainError::validation("job type must not be blank"))
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    /// Accepts both `audio_generation` and `audio-generation` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("job type must not be blank"));
        }
        let kind = match trimmed.replace('-', "_").as_str() {
            "course_generation" => JobKind::CourseGeneration,
            "video_processing" => JobKind::VideoProcessing,
            "audio_generation" => JobKind::AudioGeneration,
            "subtitle_generation" => JobKind::SubtitleGeneration,
            _ => JobKind::Custom(trimmed.to_string()),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for JobKind {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobKind> for String {
    fn from(value: JobKind) -> Self {
        value.as_str().to_string()
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted, waiting for a worker
    Pending,
    /// Claimed by a worker, handler executing
    Running,
    /// Handler returned successfully
    Completed,
    /// Handler failed or no handler was registered
    Failed,
    /// Cancelled by the owner or an administrator
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
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

    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

/// Job priority. Higher priorities are dispatched first when the engine runs
/// with priority ordering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric level as exposed by the public API (1 = low .. 4 = critical).
    pub fn level(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    pub fn from_level(level: i64) -> Result<Self, DomainError> {
        match level {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(DomainError::validation(format!(
                "invalid priority value {other} (must be 1-4)"
            ))),
        }
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Owning user
    pub user_id: UserId,
    /// Job kind for routing
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    /// 0-100, written by the executing handler
    pub progress: u8,
    pub priority: Priority,
    /// Input document, interpreted only by the handler
    pub payload: JsonMap,
    /// Output document, set at most once while running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Course this job belongs to or produced, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_id: Option<CourseId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    ///
    /// A string `course_id` field in the payload links the job to that course.
    pub fn new(kind: JobKind, user_id: UserId, payload: JsonMap, priority: Priority) -> Self {
        let now = Utc::now();
        let course_id = payload
            .get("course_id")
            .and_then(|v| v.as_str())
            .and_then(|s| CourseId::new(s).ok());

        Self {
            id: JobId::new(),
            user_id,
            kind,
            status: JobStatus::Pending,
            progress: 0,
            priority,
            payload,
            result: None,
            error: None,
            course_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }

    /// Wall-clock time between start and completion, when both are known.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Identity of whoever is asking to see or act on a job.
///
/// The engine does not authorize calls itself; collaborator layers use this to
/// apply the owner-or-administrator rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub is_admin: bool,
}

impl Principal {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    pub fn can_access(&self, job: &Job) -> bool {
        self.is_admin || job.is_owned_by(&self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn payload(value: serde_json::Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn new_job_is_pending_with_zero_progress() {
        let job = Job::new(
            JobKind::AudioGeneration,
            user("user-1"),
            payload(json!({"text": "hi"})),
            Priority::Normal,
        );

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(job.started_at.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn course_id_is_taken_from_payload() {
        let job = Job::new(
            JobKind::VideoProcessing,
            user("u"),
            payload(json!({"course_id": "c-42", "lesson_id": "l-1"})),
            Priority::High,
        );
        assert_eq!(job.course_id.as_ref().map(|c| c.as_str()), Some("c-42"));
    }

    #[test]
    fn kind_parsing_accepts_both_spellings() {
        assert_eq!(
            "audio-generation".parse::<JobKind>().unwrap(),
            JobKind::AudioGeneration
        );
        assert_eq!(
            "course_generation".parse::<JobKind>().unwrap(),
            JobKind::CourseGeneration
        );
        assert_eq!(
            "thumbnail".parse::<JobKind>().unwrap(),
            JobKind::custom("thumbnail")
        );
        assert!("  ".parse::<JobKind>().is_err());
    }

    #[test]
    fn blank_custom_kind_fails_validation() {
        assert!(JobKind::custom(" ").validate().is_err());
        assert!(JobKind::custom("thumbnail").validate().is_ok());
        assert!(JobKind::VideoProcessing.validate().is_ok());
    }

    #[test]
    fn terminal_and_cancellable_statuses() {
        for status in JobStatus::ALL {
            assert_eq!(status.is_cancellable(), !status.is_terminal());
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn priority_levels_are_validated() {
        assert_eq!(Priority::from_level(1).unwrap(), Priority::Low);
        assert_eq!(Priority::from_level(4).unwrap(), Priority::Critical);
        assert!(Priority::from_level(0).is_err());
        assert!(Priority::from_level(5).is_err());
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn job_serializes_type_field() {
        let job = Job::new(
            JobKind::SubtitleGeneration,
            user("u"),
            JsonMap::new(),
            Priority::Low,
        );
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "subtitle_generation");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["priority"], "low");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn principals_see_own_jobs_and_admins_see_all() {
        let job = Job::new(JobKind::AudioGeneration, user("alice"), JsonMap::new(), Priority::Normal);

        assert!(Principal::user(user("alice")).can_access(&job));
        assert!(!Principal::user(user("bob")).can_access(&job));
        assert!(Principal::admin(user("root")).can_access(&job));
    }
}
