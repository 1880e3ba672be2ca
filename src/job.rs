use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MIN_JID_LEN: usize = 8;

/// A unit of work as it travels between producers, queues and consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    #[serde(rename = "jobtype")]
    pub job_type: String,
    /// `None` means the producer never supplied an argument list, which is
    /// rejected. An explicit empty list is fine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub created_at: String,
    /// Stamped by the broker when the job lands in a ready queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<String>,
    /// Scheduled execution time; absent or empty means immediate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_for: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Job {
    /// A job with a fresh jid on the default queue and no argument list.
    /// Call [`Job::with_args`] before pushing.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            jid: random_jid(),
            job_type: job_type.into(),
            args: None,
            queue: default_queue(),
            priority: DEFAULT_PRIORITY,
            created_at: format_time(Utc::now()),
            enqueued_at: None,
            at: None,
            retry: None,
            reserve_for: None,
            custom: HashMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_jid(mut self, jid: impl Into<String>) -> Self {
        self.jid = jid.into();
        self
    }

    /// Schedule the job for `at`.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(format_time(at));
        self
    }

    /// Checks the fields a producer is responsible for. Queue names are
    /// checked separately, on every queue access.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.jid.len() < MIN_JID_LEN {
            return Err(ValidationError::JobId {
                jid: self.jid.clone(),
                min: MIN_JID_LEN,
            });
        }
        if self.job_type.is_empty() {
            return Err(ValidationError::JobType);
        }
        if self.args.is_none() {
            return Err(ValidationError::MissingArgs);
        }
        Ok(())
    }

    /// The parsed scheduled time, `None` when the job is immediate.
    pub fn scheduled_at(&self) -> Result<Option<DateTime<Utc>>, ValidationError> {
        match self.at.as_deref() {
            None | Some("") => Ok(None),
            Some(value) => parse_time(value).map(Some),
        }
    }
}

pub fn random_jid() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ValidationError::ScheduledAt {
            value: value.to_string(),
            reason: e.to_string(),
        })
}
