//! Line-delimited JSON-RPC messages as spoken between miners and the pool.
//!
//! The server only cares about the envelope here; method-specific payloads
//! stay as `serde_json::Value` so per-coin job bodies pass through opaquely.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub enum Message {
    StandardRequest(StandardRequest),
    Notification(Notification),
    Response(Response),
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct StandardRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Response {
    pub id: u64,
    pub result: Value,
    pub error: Option<RpcError>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl Message {
    pub fn notify(params: Value) -> Self {
        Message::Notification(Notification {
            method: "mining.notify".to_string(),
            params,
        })
    }

    pub fn set_difficulty(difficulty: u64) -> Self {
        Message::Notification(Notification {
            method: "mining.set_difficulty".to_string(),
            params: json!([difficulty]),
        })
    }

    pub fn ok_response(id: u64, result: Value) -> Self {
        Message::Response(Response {
            id,
            result,
            error: None,
        })
    }

    pub fn err_response(id: u64, code: i32, message: &str) -> Self {
        Message::Response(Response {
            id,
            result: Value::Null,
            error: Some(RpcError {
                code,
                message: message.to_string(),
            }),
        })
    }
}

impl From<StandardRequest> for Message {
    fn from(sr: StandardRequest) -> Self {
        Message::StandardRequest(sr)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

// Stratum error codes reported to miners on a rejected submit.
pub const ERR_JOB_NOT_FOUND: i32 = 21;
pub const ERR_UNKNOWN_METHOD: i32 = -3;
pub const ERR_UNAUTHORIZED: i32 = 24;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_request() {
        let line = r#"{"id":1,"method":"mining.subscribe","params":["miner/1.0"]}"#;
        match serde_json::from_str::<Message>(line).unwrap() {
            Message::StandardRequest(req) => {
                assert_eq!(req.id, 1);
                assert_eq!(req.method, "mining.subscribe");
                assert_eq!(req.params[0], "miner/1.0");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = Message::notify(json!(["job-1", true]));
        let line = serde_json::to_string(&msg).unwrap();
        assert!(!line.contains("\"id\""));
        match serde_json::from_str::<Message>(&line).unwrap() {
            Message::Notification(n) => assert_eq!(n.method, "mining.notify"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let msg = Message::err_response(9, ERR_JOB_NOT_FOUND, "Job not found (=stale)");
        let line = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<Message>(&line).unwrap() {
            Message::Response(r) => {
                assert_eq!(r.id, 9);
                assert_eq!(r.error.unwrap().code, ERR_JOB_NOT_FOUND);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
