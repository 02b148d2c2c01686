//! Wire protocol for the control socket.
//!
//! Every message is a JSON object. A request names a command and
//! carries a command-specific payload as raw JSON; responses are
//! `success` or `error` with an optional message and data blob.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::container::Limits;

#[derive(Serialize, Deserialize, Debug)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Response {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn success_with_data(data: Value) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Payload of `run`. The trailing fields are filled in by the daemon
/// before the record crosses the bring-up pipe; clients leave them
/// empty.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub image: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, rename = "requestedIP")]
    pub requested_ip: String,
    #[serde(default)]
    pub init_commands: Vec<String>,

    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub mount_point: PathBuf,
    #[serde(default)]
    pub peer_name: String,
    #[serde(default)]
    pub ip_address: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartRequest {
    #[serde(rename = "containerID")]
    pub container_id: String,
    #[serde(default)]
    pub attach: bool,
    #[serde(default)]
    pub tty: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StopRequest {
    #[serde(default, rename = "containerID")]
    pub container_id: String,
    #[serde(default)]
    pub all: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RemoveRequest {
    #[serde(default, rename = "containerID")]
    pub container_id: String,
    #[serde(default)]
    pub all: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdjustRequest {
    #[serde(rename = "containerID")]
    pub container_id: String,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecRequest {
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub tty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_request_from_client_json() {
        let payload = serde_json::json!({
            "image": "alpine",
            "tag": "latest",
            "command": "/bin/sh",
            "args": [],
            "limits": {"cpus": 1, "memoryBytes": 104857600, "pidsMax": 100},
        });
        let req: RunRequest = serde_json::from_value(payload).unwrap();
        assert_eq!(req.image, "alpine");
        assert_eq!(req.limits.memory_bytes, 104857600);
        assert_eq!(req.limits.pids_max, 100);
        assert!(req.name.is_empty());
        assert!(req.requested_ip.is_empty());
        assert!(req.init_commands.is_empty());
    }

    #[test]
    fn test_requested_ip_field_name() {
        let req: RunRequest =
            serde_json::from_value(serde_json::json!({"image": "alpine", "requestedIP": "10.20.0.9"}))
                .unwrap();
        assert_eq!(req.requested_ip, "10.20.0.9");
    }

    #[test]
    fn test_request_envelope_round_trip() {
        let request = Request {
            command: "stop".to_string(),
            payload: serde_json::json!({"containerID": "abc123"}),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.command, "stop");

        let stop: StopRequest = serde_json::from_value(decoded.payload).unwrap();
        assert_eq!(stop.container_id, "abc123");
        assert!(!stop.all);
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let encoded = serde_json::to_string(&Response::success("ok")).unwrap();
        assert_eq!(encoded, r#"{"status":"success","message":"ok"}"#);

        let encoded =
            serde_json::to_string(&Response::success_with_data(serde_json::json!([]))).unwrap();
        assert_eq!(encoded, r#"{"status":"success","data":[]}"#);
    }

    #[test]
    fn test_exec_request_decode() {
        let req: ExecRequest = serde_json::from_value(serde_json::json!({
            "containerID": "abc",
            "command": ["/bin/echo", "hello"],
            "tty": false,
        }))
        .unwrap();
        assert_eq!(req.command, vec!["/bin/echo", "hello"]);
        assert!(!req.tty);
    }
}
