//! Client side of the control socket.
//!
//! One JSON object per line in each direction:
//! `{"cmd":"status"|"sync"|"stop"}` → `{"ok":bool,"data"?:…,"error"?:…}`.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one request to the daemon socket and read one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    Ok(serde_json::from_str(line.trim_end())?)
}

/// Query status, retrying briefly while a just-started daemon binds.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");
    let mut attempts = 0;
    loop {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                attempts += 1;
                if attempts >= 5 {
                    return Err(err);
                }
                sleep(Duration::from_millis(100));
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

/// Ask the daemon to poll and merge now. Returns the merge summary, or
/// `null` when an iteration was already running.
pub fn request_sync(home: &Path) -> Result<Value, DaemonError> {
    let response = send_request(home, &DaemonRequest::new("sync"))?;
    response_into_data(response)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn missing_socket_means_not_running() {
        let home = TempDir::new().expect("home");
        let err = send_request(home.path(), &DaemonRequest::new("status")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = response_into_data(DaemonResponse::error("boom")).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(ref msg) if msg == "boom"));
        let data = response_into_data(DaemonResponse::ok(json!({"a": 1}))).unwrap();
        assert_eq!(data["a"], json!(1));
    }

    #[test]
    fn request_encodes_as_single_field() {
        let json = serde_json::to_string(&DaemonRequest::new("sync")).unwrap();
        assert_eq!(json, r#"{"cmd":"sync"}"#);
    }
}
