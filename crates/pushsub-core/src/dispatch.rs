//! Delivery job dispatch seam.
//!
//! The lifecycle hands `(priority, kind, subscriber_id)` triples to a
//! [`Dispatcher`]; running the delivery and reporting the outcome back is the
//! dispatcher's business.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Queue priority of a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    High,
}

impl Priority {
    /// Numeric rank stored by queue backends; higher runs first.
    pub const fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::High => 10,
        }
    }

    /// Inverse of [`Priority::rank`]; anything above low counts as high.
    pub const fn from_rank(rank: i64) -> Self {
        if rank > Self::Low.rank() {
            Self::High
        } else {
            Self::Low
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "low" => Ok(Self::Low),
            other => Err(DispatchError::Rejected(format!(
                "unknown priority {other:?} (expected high or low)"
            ))),
        }
    }
}

/// Kind of job handed to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// POST pending content to the subscriber's callback.
    Deliver,
}

impl JobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deliver => "deliver",
        }
    }
}

impl FromStr for JobKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deliver" => Ok(Self::Deliver),
            other => Err(DispatchError::Rejected(format!("unknown job kind {other:?}"))),
        }
    }
}

/// Dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Job rejected: {0}")]
    Rejected(String),

    /// The queue backend could not take the job right now.
    #[error("Dispatcher unavailable: {0}")]
    Unavailable(String),
}

/// Accepts delivery jobs for asynchronous, at-least-once execution.
///
/// Higher priority jobs run first; there is no ordering guarantee between
/// subscribers at the same priority.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn enqueue(
        &self,
        priority: Priority,
        kind: JobKind,
        subscriber_id: &str,
    ) -> Result<(), DispatchError>;
}

/// A job captured by [`RecordingDispatcher`].
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedJob {
    pub priority: Priority,
    pub kind: JobKind,
    pub subscriber_id: String,
}

/// Dispatcher that only records what it was given.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    jobs: std::sync::Mutex<Vec<RecordedJob>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<RecordedJob> {
        self.jobs
            .lock()
            .map(|mut jobs| std::mem::take(&mut *jobs))
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn enqueue(
        &self,
        priority: Priority,
        kind: JobKind,
        subscriber_id: &str,
    ) -> Result<(), DispatchError> {
        self.jobs
            .lock()
            .map_err(|_| DispatchError::Rejected("recorder poisoned".into()))?
            .push(RecordedJob {
                priority,
                kind,
                subscriber_id: subscriber_id.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.rank() > Priority::Low.rank());
        assert_eq!(Priority::from_rank(Priority::High.rank()), Priority::High);
        assert_eq!(Priority::from_rank(Priority::Low.rank()), Priority::Low);
        assert!(Priority::High > Priority::Low);
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!(" HIGH ".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn job_kind_round_trips_through_str() {
        assert_eq!(JobKind::Deliver.as_str().parse::<JobKind>().unwrap(), JobKind::Deliver);
        assert!("fetch".parse::<JobKind>().is_err());
    }

    #[tokio::test]
    async fn recording_dispatcher_captures_in_order() {
        let dispatcher = RecordingDispatcher::new();
        dispatcher.enqueue(Priority::High, JobKind::Deliver, "a").await.unwrap();
        dispatcher.enqueue(Priority::Low, JobKind::Deliver, "b").await.unwrap();

        let jobs = dispatcher.take();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].subscriber_id, "a");
        assert_eq!(jobs[1].priority, Priority::Low);
        assert!(dispatcher.take().is_empty());
    }
}
