//! Error and condition types.
//!
//! Reassembly distinguishes three kinds of trouble:
//!
//! - [`Condition`]: reported, non-fatal. Out-of-order parts, malformed field
//!   headers and limit hits all land here; the session keeps going.
//! - [`ReassemblyError`]: fatal to one session. The ledger purges the session
//!   and the caller is told why; other sessions are untouched.
//! - [`BoundaryError`] / [`ConfigError`] / [`SinkError`]: setup and
//!   collaborator failures.

use crate::piece::{PartId, SessionId};

/// Errors produced while parsing a multipart boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryError {
    /// Missing boundary parameter in Content-Type header.
    Missing,
    /// Invalid boundary format.
    Invalid { detail: &'static str },
}

impl std::fmt::Display for BoundaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing boundary in multipart Content-Type"),
            Self::Invalid { detail } => write!(f, "invalid multipart boundary: {detail}"),
        }
    }
}

impl std::error::Error for BoundaryError {}

/// A recoverable situation reported alongside a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// A piece arrived ahead of the next expected part and was buffered.
    UnexpectedPart { expected: PartId, got: PartId },
    /// A field header could not be interpreted; the body still flows.
    MalformedHeader { detail: String },
    /// A field header grew past the configured limit; the field is dropped.
    HeaderTooLarge { size: usize, max: usize },
    /// The upload carries more fields than allowed; extra fields are dropped.
    TooManyFields { count: usize, max: usize },
    /// A field body grew past the configured limit and was cut off.
    FieldTooLarge { size: usize, max: usize },
    /// A candidate boundary tail arrived while another one was still pending.
    DoubleMeaning { part: PartId },
    /// A piece flagged as a section start did not begin with the delimiter.
    MisalignedPiece { part: PartId },
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedPart { expected, got } => {
                write!(f, "unexpected part {got}, expected {expected}")
            }
            Self::MalformedHeader { detail } => write!(f, "malformed field header: {detail}"),
            Self::HeaderTooLarge { size, max } => {
                write!(f, "field header too large: {size} bytes exceeds limit of {max}")
            }
            Self::TooManyFields { count, max } => {
                write!(f, "too many fields: {count} exceeds limit of {max}")
            }
            Self::FieldTooLarge { size, max } => {
                write!(f, "field too large: {size} bytes exceeds limit of {max}")
            }
            Self::DoubleMeaning { part } => {
                write!(f, "part {part} opens a boundary candidate while another is pending")
            }
            Self::MisalignedPiece { part } => {
                write!(f, "part {part} is flagged as a section start but lacks the delimiter")
            }
        }
    }
}

/// Errors that abort a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Too many out-of-order pieces are parked for one session.
    BufferOverflow {
        session: SessionId,
        len: usize,
        max: usize,
    },
    /// A piece was registered with a boundary other than the session's.
    BoundaryMismatch { session: SessionId },
}

impl ReassemblyError {
    /// The session this error aborted.
    #[must_use]
    pub fn session(&self) -> SessionId {
        match self {
            Self::BufferOverflow { session, .. } | Self::BoundaryMismatch { session } => *session,
        }
    }
}

impl std::fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferOverflow { session, len, max } => write!(
                f,
                "session {session}: {len} buffered pieces exceeds limit of {max}"
            ),
            Self::BoundaryMismatch { session } => {
                write!(f, "session {session}: boundary differs from the one it was opened with")
            }
        }
    }
}

impl std::error::Error for ReassemblyError {}

/// Errors loading a configuration document.
#[derive(Debug)]
pub enum ConfigError {
    /// The document is not valid JSON for the config shape.
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "invalid reassembly config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
        }
    }
}

/// Failure reported by an envelope sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    detail: String,
}

impl SinkError {
    /// Create a sink error with a description.
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    /// The failure description.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "envelope sink failed: {}", self.detail)
    }
}

impl std::error::Error for SinkError {}

/// Errors from the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    /// The session was aborted by the ledger.
    Reassembly(ReassemblyError),
    /// The sink refused an envelope.
    Sink(SinkError),
}

impl std::fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reassembly(e) => write!(f, "{e}"),
            Self::Sink(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ApplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reassembly(e) => Some(e),
            Self::Sink(e) => Some(e),
        }
    }
}

impl From<ReassemblyError> for ApplicationError {
    fn from(err: ReassemblyError) -> Self {
        Self::Reassembly(err)
    }
}

impl From<SinkError> for ApplicationError {
    fn from(err: SinkError) -> Self {
        Self::Sink(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_display() {
        let c = Condition::UnexpectedPart {
            expected: 3,
            got: 5,
        };
        assert_eq!(c.to_string(), "unexpected part 5, expected 3");

        let c = Condition::FieldTooLarge { size: 11, max: 10 };
        assert_eq!(
            c.to_string(),
            "field too large: 11 bytes exceeds limit of 10"
        );
    }

    #[test]
    fn test_reassembly_error_reports_session() {
        let err = ReassemblyError::BufferOverflow {
            session: SessionId::new(7),
            len: 5,
            max: 4,
        };
        assert_eq!(err.session(), SessionId::new(7));
        assert!(err.to_string().contains("exceeds limit of 4"));
    }
}
