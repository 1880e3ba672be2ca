use serde::Serialize;

use crate::error::{BrokerError, Result};

/// Responses the command layer renders from core results, encoded in the
/// line-oriented wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Number(i64),
    /// `None` is "no data", distinct from an empty payload.
    Bulk(Option<Vec<u8>>),
    Error { code: String, reason: String },
}

impl Reply {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Reply::Bulk(Some(serde_json::to_vec(value)?)))
    }

    pub fn error(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Reply::Error {
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn from_error(err: &BrokerError) -> Self {
        let code = if err.is_cancelled() { "CANCELLED" } else { "ERR" };
        Reply::error(code, err.to_string())
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Ok => b"+OK\r\n".to_vec(),
            Reply::Number(n) => format!(":{n}\r\n").into_bytes(),
            Reply::Bulk(None) => b"$-1\r\n".to_vec(),
            Reply::Bulk(Some(data)) => {
                let mut out = format!("${}\r\n", data.len()).into_bytes();
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
                out
            }
            Reply::Error { code, reason } => format!("-{code} {reason}\r\n").into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn encoded(reply: Reply) -> String {
        String::from_utf8(reply.encode()).unwrap()
    }

    #[test]
    fn encodes_every_variant() {
        assert_eq!(encoded(Reply::Ok), "+OK\r\n");
        assert_eq!(encoded(Reply::Number(123)), ":123\r\n");
        assert_eq!(encoded(Reply::Bulk(None)), "$-1\r\n");
        assert_eq!(encoded(Reply::Bulk(Some(Vec::new()))), "$0\r\n\r\n");
        assert_eq!(
            encoded(Reply::Bulk(Some(b"{some:jobjson}".to_vec()))),
            "$14\r\n{some:jobjson}\r\n"
        );
        assert_eq!(
            encoded(Reply::error("ERR", "permission denied")),
            "-ERR permission denied\r\n"
        );
    }

    #[test]
    fn maps_broker_errors() {
        let err = BrokerError::from(ValidationError::JobType).context("push");
        assert_eq!(
            Reply::from_error(&err),
            Reply::error("ERR", "push: jobs must have a jobtype")
        );

        let err = BrokerError::Cancelled.context("fetch");
        assert!(matches!(
            Reply::from_error(&err),
            Reply::Error { code, .. } if code == "CANCELLED"
        ));
    }

    #[test]
    fn json_is_a_bulk_reply() {
        let reply = Reply::json(&serde_json::json!({"state": "quiet"})).unwrap();
        assert_eq!(encoded(reply), "$17\r\n{\"state\":\"quiet\"}\r\n");
    }
}
