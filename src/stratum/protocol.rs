/// Stratum wire protocol
///
/// Line-delimited JSON, one object per line. Requests carry `{method,
/// params, id}`, responses `{result, error, id}`; errors travel as a
/// `[code, message]` pair in the error slot.

use serde::Deserialize;
use serde_json::{json, Value};

/// Incoming frame. `method` is validated by the server loop; anything that
/// is not a `mining.*` / `client.*` string is a protocol violation.
#[derive(Debug, Deserialize)]
pub struct RequestFrame {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RequestFrame {
    pub fn params_array(&self) -> Vec<Value> {
        match &self.params {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StratumError {
    pub code: i32,
    pub message: &'static str,
}

pub const OTHER_UNKNOWN: StratumError = StratumError { code: 20, message: "Other/Unknown" };
pub const JOB_NOT_FOUND: StratumError = StratumError { code: 21, message: "Job not found" };
pub const DUPLICATE_SHARE: StratumError = StratumError { code: 22, message: "Duplicate share" };
pub const LOW_DIFFICULTY_SHARE: StratumError =
    StratumError { code: 23, message: "Low difficulty share" };
pub const UNAUTHORIZED_WORKER: StratumError =
    StratumError { code: 24, message: "Unauthorized worker" };
pub const NOT_SUBSCRIBED: StratumError = StratumError { code: 25, message: "Not subscribed" };

pub fn request_line(method: &str, params: Value) -> String {
    let mut line =
        json!({ "method": method, "params": params, "id": Value::Null }).to_string();
    line.push('\n');
    line
}

pub fn success_line(result: Value, id: Value) -> String {
    let mut line = json!({ "result": result, "error": Value::Null, "id": id }).to_string();
    line.push('\n');
    line
}

pub fn failure_line(error: StratumError, id: Value) -> String {
    let mut line =
        json!({ "result": Value::Null, "error": [error.code, error.message], "id": id })
            .to_string();
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_single_lines() {
        let req = request_line("mining.set_difficulty", json!([8.0]));
        assert!(req.ends_with('\n'));
        assert_eq!(req.matches('\n').count(), 1);
        let parsed: Value = serde_json::from_str(req.trim()).unwrap();
        assert_eq!(parsed["method"], "mining.set_difficulty");
        assert!(parsed["id"].is_null());
    }

    #[test]
    fn failure_carries_code_and_message() {
        let line = failure_line(DUPLICATE_SHARE, json!(7));
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["error"][0], 22);
        assert_eq!(parsed["error"][1], "Duplicate share");
        assert_eq!(parsed["id"], 7);
        assert!(parsed["result"].is_null());
    }

    #[test]
    fn request_frame_tolerates_missing_fields() {
        let frame: RequestFrame = serde_json::from_str(r#"{"method":"mining.subscribe"}"#).unwrap();
        assert_eq!(frame.method, Some(Value::String("mining.subscribe".into())));
        assert!(frame.id.is_null());
        assert!(frame.params_array().is_empty());

        let frame: RequestFrame =
            serde_json::from_str(r#"{"id":1,"method":"mining.submit","params":["a","b"]}"#)
                .unwrap();
        assert_eq!(frame.params_array().len(), 2);
    }
}
