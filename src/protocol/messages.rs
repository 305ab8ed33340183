//! Line-delimited JSON-RPC request/response/notification types for
//! Stratum V1, adapted from the teacher's `StratumRequest`/
//! `StratumResponse`/`StratumError` shapes (`stratum/protocol.rs`) to
//! the method set and numeric error codes this crate's submit path
//! uses (`crate::error::SubmitError::code`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StratumResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: StratumError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        s
    }
}

/// `[code, message, data]` per the Stratum V1 convention.
#[derive(Debug, Clone, Serialize)]
#[serde(into = "(i32, String, Option<Value>)")]
pub struct StratumError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl From<StratumError> for (i32, String, Option<Value>) {
    fn from(e: StratumError) -> Self {
        (e.code, e.message, e.data)
    }
}

impl StratumError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn from_submit_error(e: crate::error::SubmitError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// A server-initiated notification — `id` is always `null` per spec.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Option<()>,
    pub method: &'static str,
    pub params: Value,
}

impl Notification {
    pub fn new(method: &'static str, params: Value) -> Self {
        Self {
            id: None,
            method,
            params,
        }
    }

    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        s
    }
}

pub fn mining_notify(job: &crate::job::Job) -> Notification {
    let merkle_branch: Vec<String> = job.merkle_branch.iter().map(hex::encode).collect();
    Notification::new(
        "mining.notify",
        serde_json::json!([
            job.id,
            job.prev_hash,
            job.coinbase1,
            job.coinbase2,
            merkle_branch,
            job.version,
            job.nbits,
            job.ntime,
            job.clean_jobs,
        ]),
    )
}

pub fn mining_set_difficulty(difficulty: u64) -> Notification {
    Notification::new("mining.set_difficulty", serde_json::json!([difficulty]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_serializes_as_a_triple() {
        let e = StratumError::new(23, "share difficulty too low");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v, serde_json::json!([23, "share difficulty too low", null]));
    }

    #[test]
    fn success_response_serializes_null_error() {
        let resp = StratumResponse::success(Value::from(1), Value::Bool(true));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["error"], Value::Null);
        assert!(v.get("result").is_some());
    }

    #[test]
    fn notification_id_is_always_null() {
        let n = Notification::new("mining.set_difficulty", serde_json::json!([1024]));
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["id"], Value::Null);
    }
}
