use thiserror::Error;

/// A job or queue name rejected before any state was touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("jobs must have a jid of at least {min} characters, got {jid:?}")]
    JobId { jid: String, min: usize },

    #[error("jobs must have a jobtype")]
    JobType,

    #[error("jobs must have an args array, even if empty")]
    MissingArgs,

    #[error("invalid queue name {0:?}, must match [A-Za-z0-9_.-]+")]
    QueueName(String),

    #[error("invalid scheduled time {value:?}: {reason}")]
    ScheduledAt { value: String, reason: String },
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("must fetch from at least one queue")]
    EmptyQueueList,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{op}: {source}")]
    Context {
        op: &'static str,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("invalid job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store is closed")]
    StoreClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Prefix this error with the name of the operation that produced it.
    pub fn context(self, op: &'static str) -> Self {
        BrokerError::Context {
            op,
            source: Box::new(self),
        }
    }

    /// The innermost error, with every `Context` layer removed.
    pub fn root(&self) -> &BrokerError {
        match self {
            BrokerError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True if the caller's cancellation token caused this error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), BrokerError::Cancelled)
    }

    /// True if the request was rejected by validation.
    pub fn is_validation(&self) -> bool {
        matches!(self.root(), BrokerError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefixes_message() {
        let err = BrokerError::from(ValidationError::JobType).context("push");
        assert_eq!(err.to_string(), "push: jobs must have a jobtype");
        assert!(err.is_validation());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn nested_context_keeps_every_prefix() {
        let err = BrokerError::from(ValidationError::QueueName("a@b".to_string()))
            .context("enqueue")
            .context("push");
        let msg = err.to_string();
        assert!(msg.starts_with("push: enqueue: "), "{msg}");
        assert!(msg.contains("a@b"));
    }

    #[test]
    fn cancellation_is_found_through_context() {
        let err = BrokerError::Cancelled.context("bpop").context("fetch");
        assert!(err.is_cancelled());
        assert!(matches!(err.root(), BrokerError::Cancelled));
    }
}
