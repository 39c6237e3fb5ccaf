use std::fmt;

use serde::{Deserialize, Serialize};

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    /// The request frame could not be decoded.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const SERVICE_NOT_FOUND: &str = "SERVICE_NOT_FOUND";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    /// The method argument did not decode into the declared type.
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    /// Default code for errors returned by a method implementation.
    pub const APPLICATION: &str = "APPLICATION";
    pub const INTERNAL: &str = "INTERNAL";
    /// The server is shutting down and no longer dispatches calls.
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

/// Structured RPC-level error carried back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorShape {}

// ── Frames ───────────────────────────────────────────────────────────────────

/// An inbound call. `seq` is chosen by the client and echoed in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub seq: u64,
    pub service: String,
    pub method: String,
    pub body: Vec<u8>,
}

impl RequestFrame {
    pub fn new(
        seq: u64,
        service: impl Into<String>,
        method: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            seq,
            service: service.into(),
            method: method.into(),
            body,
        }
    }
}

/// The reply to a [`RequestFrame`]. Exactly one of `body`/`error` is
/// meaningful: `body` is empty whenever `error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub seq: u64,
    pub body: Vec<u8>,
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(seq: u64, body: Vec<u8>) -> Self {
        Self {
            seq,
            body,
            error: None,
        }
    }

    pub fn err(seq: u64, error: ErrorShape) -> Self {
        Self {
            seq,
            body: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_frame_has_empty_body() {
        let frame = ResponseFrame::err(
            7,
            ErrorShape::new(error_codes::SERVICE_NOT_FOUND, "can't find service Nope"),
        );
        assert!(!frame.is_ok());
        assert!(frame.body.is_empty());
        assert_eq!(frame.seq, 7);
    }

    #[test]
    fn error_shape_display() {
        let err = ErrorShape::new(error_codes::INTERNAL, "boom");
        assert_eq!(err.to_string(), "INTERNAL: boom");
    }
}
