//! Cross-process error taxonomy.
//!
//! Edge errors travel as the `response.error` string and are reconstructed by
//! the control side; the wire form is `"<kind>: <message>"`. Anything that
//! fails to parse comes back as [`ErrorKind::Internal`] so a peer running a
//! newer taxonomy never breaks an older one.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error classes understood on both sides of a gateway stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed MAC, IP outside pool, unknown gateway node, bad payload.
    InvalidArgument,
    /// Lease resolution produced no entry.
    NotFound,
    /// The entity already exists and the operation is not idempotent.
    AlreadyExists,
    /// Pool exhausted or similar unmet precondition.
    PreconditionFailed,
    /// No active stream, or the reservation file could not be rewritten.
    Unavailable,
    /// Request/response or DNS timeout.
    DeadlineExceeded,
    /// Caller cancelled.
    Cancelled,
    /// Any other failure.
    Internal,
}

impl ErrorKind {
    /// The kebab-case name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::NotFound => "not-found",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::PreconditionFailed => "precondition-failed",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::DeadlineExceeded => "deadline-exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "invalid-argument" => ErrorKind::InvalidArgument,
            "not-found" => ErrorKind::NotFound,
            "already-exists" => ErrorKind::AlreadyExists,
            "precondition-failed" => ErrorKind::PreconditionFailed,
            "unavailable" => ErrorKind::Unavailable,
            "deadline-exceeded" => ErrorKind::DeadlineExceeded,
            "cancelled" => ErrorKind::Cancelled,
            "internal" => ErrorKind::Internal,
            _ => return Err(()),
        })
    }
}

/// A typed operational error that survives a trip over the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct FabricError {
    /// Error class, stable across versions.
    pub kind: ErrorKind,
    /// Human-readable context.
    pub message: String,
}

impl FabricError {
    /// An error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A new `invalid-argument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// A new `not-found` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// A new `already-exists` error.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    /// A new `precondition-failed` error.
    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    /// A new `unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// A new `deadline-exceeded` error.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    /// A new `cancelled` error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// A new `internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Serialise for the `response.error` field.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    /// Reconstruct from a `response.error` string.
    pub fn from_wire(raw: &str) -> Self {
        if let Some((kind, message)) = raw.split_once(": ")
            && let Ok(kind) = kind.parse::<ErrorKind>()
        {
            return Self::new(kind, message);
        }
        Self::internal(raw)
    }
}

impl From<std::io::Error> for FabricError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let err = FabricError::precondition_failed("address pool exhausted");
        let wire = err.to_wire();
        assert_eq!(wire, "precondition-failed: address pool exhausted");
        assert_eq!(FabricError::from_wire(&wire), err);
    }

    #[test]
    fn wire_round_trip_all_kinds() {
        for kind in [
            ErrorKind::InvalidArgument,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::PreconditionFailed,
            ErrorKind::Unavailable,
            ErrorKind::DeadlineExceeded,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ] {
            let err = FabricError::new(kind, "boom");
            assert_eq!(FabricError::from_wire(&err.to_wire()).kind, kind);
        }
    }

    #[test]
    fn unknown_kind_becomes_internal() {
        let err = FabricError::from_wire("flux-capacitor: undercharged");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.message, "flux-capacitor: undercharged");
    }

    #[test]
    fn freeform_message_becomes_internal() {
        let err = FabricError::from_wire("something awful happened");
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn message_with_colon_survives() {
        let err = FabricError::unavailable("dialing ws://gw:1537: connection refused");
        let back = FabricError::from_wire(&err.to_wire());
        assert_eq!(back, err);
    }
}
