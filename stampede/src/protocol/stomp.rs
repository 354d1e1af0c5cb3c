//! STOMP frames as literal strings.
//!
//! Nothing is escaped or validated: headers are written as given and the frame
//! is terminated with a NUL byte. Only `content-length` is computed.
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// `CONNECT` with `accept-version` and `heart-beat` (`"tx,rx"` in ms).
    pub fn connect(accept_version: &str, heart_beat: &str) -> Self {
        Self::new("CONNECT")
            .header("accept-version", accept_version)
            .header("heart-beat", heart_beat)
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
    }

    pub fn send(destination: &str) -> Self {
        Self::new("SEND").header("destination", destination)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// JSON body with `content-type: application/json`.
    pub fn json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_string(body)?;
        Ok(self.header("content-type", "application/json").body(body))
    }
}

/// `COMMAND\nkey:value\n...\n\nbody\0`, with `content-length` (in bytes)
/// after the other headers when there is a body.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.command)?;
        for (key, value) in &self.headers {
            writeln!(f, "{key}:{value}")?;
        }
        if !self.body.is_empty() {
            writeln!(f, "content-length:{}", self.body.len())?;
        }
        write!(f, "\n{}\0", self.body)
    }
}

impl From<Frame> for String {
    fn from(frame: Frame) -> Self {
        frame.to_string()
    }
}
