//! Bean domain types: the serializable task descriptor that travels through the queue.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a bean, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeanId(pub Ulid);

impl BeanId {
    /// Create a new unique bean ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a bean ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for BeanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BeanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a bean.
///
/// The `Request*` variants are transient: they mark a bean that has crossed the
/// command channel but has not yet been acted on by its process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// No status recorded; treated as a dead bean by clean-up.
    None,
    /// Waiting in the submission queue.
    #[default]
    Submitted,
    /// Dequeued, process being built.
    Preparing,
    /// Process body executing.
    Running,
    RequestPause,
    Paused,
    RequestResume,
    /// Running again after a pause.
    Resumed,
    RequestTerminate,
    Terminated,
    Complete,
    Failed,
}

impl Status {
    /// Terminal statuses never change again.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Terminated | Status::Complete | Status::Failed | Status::None
        )
    }

    /// The process body is (or should be) making progress.
    pub fn is_running(self) -> bool {
        matches!(self, Status::Running | Status::Resumed)
    }

    pub fn is_paused(self) -> bool {
        self == Status::Paused
    }

    /// Transient request states set by the command channel.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Status::RequestPause | Status::RequestResume | Status::RequestTerminate
        )
    }

    /// The bean has left the submission queue and begun its lifecycle.
    pub fn is_started(self) -> bool {
        !matches!(self, Status::Submitted | Status::None)
    }

    /// Get a simple status string for display.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::None => "NONE",
            Status::Submitted => "SUBMITTED",
            Status::Preparing => "PREPARING",
            Status::Running => "RUNNING",
            Status::RequestPause => "REQUEST_PAUSE",
            Status::Paused => "PAUSED",
            Status::RequestResume => "REQUEST_RESUME",
            Status::Resumed => "RESUMED",
            Status::RequestTerminate => "REQUEST_TERMINATE",
            Status::Terminated => "TERMINATED",
            Status::Complete => "COMPLETE",
            Status::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown bean status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Status::None,
            "SUBMITTED" => Status::Submitted,
            "PREPARING" => Status::Preparing,
            "RUNNING" => Status::Running,
            "REQUEST_PAUSE" => Status::RequestPause,
            "PAUSED" => Status::Paused,
            "REQUEST_RESUME" => Status::RequestResume,
            "RESUMED" => Status::Resumed,
            "REQUEST_TERMINATE" => Status::RequestTerminate,
            "TERMINATED" => Status::Terminated,
            "COMPLETE" => Status::Complete,
            "FAILED" => Status::Failed,
            _ => return Err(ParseStatusError(s.to_string())),
        };
        Ok(status)
    }
}

/// A bean describes one task submitted to a queue.
///
/// Beans are value objects: every component works on its own copy and
/// republishes the copy when something changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bean {
    /// Unique identifier, stable for the task's lifetime.
    pub id: BeanId,
    /// Human-readable name.
    pub name: String,
    /// Type of bean (used for routing to process factories).
    pub bean_type: String,
    /// Current status.
    pub status: Status,
    /// Status before the last transition.
    pub previous_status: Status,
    /// Percent complete, 0 to 100.
    #[serde(default)]
    pub percent_complete: f64,
    /// Human-readable message, usually the failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the bean was submitted.
    pub submission_time: DateTime<Utc>,
    /// When the process started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the bean reached a final status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Submitting user, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Task parameters as JSON.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Bean {
    /// Create a new submitted bean.
    pub fn new(name: impl Into<String>, bean_type: impl Into<String>) -> Self {
        Self {
            id: BeanId::new(),
            name: name.into(),
            bean_type: bean_type.into(),
            status: Status::Submitted,
            previous_status: Status::None,
            percent_complete: 0.0,
            message: None,
            submission_time: Utc::now(),
            start_time: None,
            end_time: None,
            user_name: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Set the payload for this bean.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the submitting user.
    pub fn with_user(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    /// Override the submission time.
    pub fn with_submission_time(mut self, submission_time: DateTime<Utc>) -> Self {
        self.submission_time = submission_time;
        self
    }

    /// Move to a new status, remembering the previous one.
    ///
    /// Returns `false` and leaves the bean untouched once it is final.
    pub fn set_status(&mut self, status: Status) -> bool {
        if self.status.is_final() {
            return false;
        }
        if self.status != status {
            self.previous_status = self.status;
            self.status = status;
        }
        if status.is_final() {
            self.end_time = Some(Utc::now());
        }
        true
    }

    /// Mark the bean failed with a message.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if !self.set_status(Status::Failed) {
            return false;
        }
        self.message = Some(message.into());
        true
    }

    /// Age of the bean measured from its submission time.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.submission_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_status_is_sticky() {
        let mut bean = Bean::new("scan", "echo");
        assert!(bean.set_status(Status::Running));
        assert!(bean.set_status(Status::Complete));
        assert!(bean.end_time.is_some());

        assert!(!bean.set_status(Status::Running));
        assert!(!bean.fail("late"));
        assert_eq!(bean.status, Status::Complete);
        assert_eq!(bean.previous_status, Status::Running);
        assert!(bean.message.is_none());
    }

    #[test]
    fn status_names_parse_back() {
        for status in [Status::Submitted, Status::RequestPause, Status::Terminated] {
            assert_eq!(status.as_str().parse::<Status>(), Ok(status));
        }
        assert!("BOGUS".parse::<Status>().is_err());
    }

    #[test]
    fn status_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&Status::RequestTerminate).unwrap();
        assert_eq!(json, "\"REQUEST_TERMINATE\"");
    }

    #[test]
    fn status_classification() {
        assert!(Status::Failed.is_final());
        assert!(Status::None.is_final());
        assert!(Status::Resumed.is_running());
        assert!(Status::RequestPause.is_request());
        assert!(!Status::Submitted.is_started());
        assert!(Status::Preparing.is_started());
    }
}
