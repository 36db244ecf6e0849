use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use clusterlink_core::Response;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// Reserved kind for requests addressed to the agent itself.
pub const AGENT_KIND: &str = "agent";

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub kind: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl RequestFrame {
    pub fn new(kind: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

/// JSON newline-delimited response. Pushed frames carry no `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseFrame {
    pub fn new(id: Option<u64>, response: Response) -> Self {
        Self { id, response }
    }

    pub fn into_result(self) -> Result<Value, DaemonError> {
        self.response.into_result().map_err(DaemonError::Protocol)
    }
}

fn connect(home: &Path) -> Result<UnixStream, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    UnixStream::connect(&socket).map_err(|err| {
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
    })
}

fn write_request(
    stream: &mut UnixStream,
    home: &Path,
    request: &RequestFrame,
) -> Result<(), DaemonError> {
    let socket = socket_path(home);
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))
}

/// Send one request to the agent socket and return its reply.
pub fn send_request(home: &Path, request: &RequestFrame) -> Result<ResponseFrame, DaemonError> {
    let mut stream = connect(home)?;
    write_request(&mut stream, home, request)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket_path(home), e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "agent closed connection before responding".to_string(),
        ));
    }

    Ok(serde_json::from_str(line.trim_end())?)
}

/// `send_request` for a (kind, action) pair, unwrapping the envelope.
pub fn request(
    home: &Path,
    kind: &str,
    action: &str,
    payload: Value,
) -> Result<Value, DaemonError> {
    send_request(home, &RequestFrame::new(kind, action, payload))?.into_result()
}

/// Send a request and hand every frame the agent writes back to `on_frame`
/// until it returns `false` or the agent closes the connection.
pub fn stream<F>(home: &Path, request: &RequestFrame, mut on_frame: F) -> Result<(), DaemonError>
where
    F: FnMut(&ResponseFrame) -> bool,
{
    let mut stream = connect(home)?;
    write_request(&mut stream, home, request)?;

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line.map_err(|e| io_err(socket_path(home), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: ResponseFrame = serde_json::from_str(&line)?;
        if !on_frame(&frame) {
            break;
        }
    }
    Ok(())
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = RequestFrame::new(AGENT_KIND, "status", Value::Null);

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response.into_result(),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("agent status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    request(home, AGENT_KIND, "stop", Value::Null).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_omits_empty_fields() {
        let frame = RequestFrame::new("pod", "list", Value::Null);
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "kind": "pod", "action": "list" })
        );
        let parsed: RequestFrame =
            serde_json::from_str(r#"{"id":4,"kind":"node","action":"get","payload":{"name":"n1"}}"#)
                .unwrap();
        assert_eq!(parsed.id, Some(4));
        assert_eq!(parsed.payload["name"], "n1");
    }

    #[test]
    fn response_frame_flattens_envelope() {
        let frame = ResponseFrame::new(Some(9), Response::error("nope"));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "id": 9, "status": "error", "errorMessage": "nope", "payload": null })
        );
        let err = frame.into_result().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = tempfile::TempDir::new().expect("home");
        let err = request_stop(home.path()).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }
}
