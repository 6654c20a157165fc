//! Wire codec for the line-delimited JSON control channel.
//!
//! Outbound commands are single JSON objects terminated by `\r\n`. Inbound
//! lines are classified purely by shape: an object carrying an integer `id`
//! plus `result` or `error` is a [`Response`], an object with
//! `"method": "props"` and an object of params is a [`Notification`], and
//! anything else is [`Message::Malformed`].

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::Error;
use crate::types::Method;

type Result<T> = std::result::Result<T, Error>;

/// Terminator appended to every encoded command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Lines longer than this are discarded without being parsed.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub(crate) id: u32,
    pub(crate) method: String,
    pub(crate) params: Vec<Value>,
}

impl Command {
    /// Build a command for a known method. The ID is assigned on dispatch.
    pub fn new(method: Method, params: Vec<Value>) -> Self {
        Self::raw(method.as_ref(), params)
    }

    /// Build a command for an arbitrary method name.
    pub fn raw(method: &str, params: Vec<Value>) -> Self {
        Command {
            id: 0,
            method: method.to_string(),
            params,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The typed method, if the name is one this engine knows.
    pub fn known_method(&self) -> Option<Method> {
        self.method.parse().ok()
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub(crate) fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A reply correlated to a request by its ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u32,
    pub outcome: std::result::Result<Vec<Value>, ErrorObject>,
}

impl Response {
    pub fn ok(id: u32, result: Vec<Value>) -> Self {
        Response {
            id,
            outcome: Ok(result),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The success payload, or `None` for an error response.
    pub fn result(&self) -> Option<&[Value]> {
        self.outcome.as_deref().ok()
    }

    /// Turn an error object into [`Error::Protocol`].
    pub fn into_result(self) -> Result<Vec<Value>> {
        self.outcome
            .map_err(|e| Error::protocol(e.code, &e.message))
    }
}

/// An unsolicited partial state patch pushed by the device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Notification {
    pub params: Map<String, Value>,
}

/// A decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Response),
    Notification(Notification),
    Malformed { line: String, reason: String },
}

/// Encode a command as one terminated line.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use yeelight_lan_rs::codec::{Command, encode};
/// use yeelight_lan_rs::Method;
///
/// let cmd = Command::new(Method::SetPower, vec![json!("on"), json!("smooth"), json!(500)]);
/// let line = encode(&cmd).unwrap();
/// assert_eq!(line, "{\"id\":0,\"method\":\"set_power\",\"params\":[\"on\",\"smooth\",500]}\r\n");
/// ```
pub fn encode(command: &Command) -> Result<String> {
    let mut line = serde_json::to_string(command).map_err(Error::JsonDump)?;
    line.push_str(LINE_TERMINATOR);
    Ok(line)
}

/// Classify one inbound line. Never fails; unparseable input is
/// [`Message::Malformed`].
pub fn decode(line: &str) -> Message {
    let trimmed = line.trim();
    let malformed = |reason: &str| Message::Malformed {
        line: trimmed.to_string(),
        reason: reason.to_string(),
    };

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => return malformed(&e.to_string()),
    };
    let Value::Object(mut obj) = value else {
        return malformed("not a json object");
    };

    if let Some(id) = obj.get("id") {
        let Some(id) = id.as_u64().and_then(|v| u32::try_from(v).ok()) else {
            return malformed("id is not an unsigned 32-bit integer");
        };
        if let Some(result) = obj.remove("result") {
            return match result {
                Value::Array(values) => Message::Response(Response::ok(id, values)),
                _ => malformed("result is not an array"),
            };
        }
        if let Some(error) = obj.remove("error") {
            return match serde_json::from_value::<ErrorObject>(error) {
                Ok(error) => Message::Response(Response {
                    id,
                    outcome: Err(error),
                }),
                Err(e) => malformed(&format!("bad error object: {e}")),
            };
        }
        return malformed("response without result or error");
    }

    let params = obj.remove("params");
    match (obj.get("method").and_then(Value::as_str), params) {
        (Some("props"), Some(Value::Object(params))) => {
            Message::Notification(Notification { params })
        }
        (Some("props"), _) => malformed("props params is not an object"),
        (Some(_), _) => malformed("unknown notification method"),
        (None, _) => malformed("neither a response nor a notification"),
    }
}

/// Reassembles complete lines from a byte stream read in arbitrary chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete, non-empty line without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > MAX_LINE_LEN {
                    warn!("Dropping {} bytes of an oversized line", self.buf.len());
                    self.buf.clear();
                    self.discarding = true;
                }
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if std::mem::take(&mut self.discarding) || line.is_empty() {
                continue;
            }
            return Some(String::from_utf8_lossy(&line).into_owned());
        }
    }

    /// Bytes buffered for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
