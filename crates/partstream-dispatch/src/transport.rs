//! The outbound side: where reassembled fields go.

use std::future::Future;

use partstream_core::OutputEnvelope;

/// Delivers envelopes to the downstream service.
///
/// Envelopes of one session are delivered one at a time and in order; the
/// next call starts only after the previous future resolved. Envelopes of
/// different sessions may be delivered concurrently.
pub trait Transport: Send + Sync + 'static {
    /// Deliver one envelope.
    fn deliver(
        &self,
        envelope: OutputEnvelope,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Failure reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    detail: String,
}

impl TransportError {
    /// Create a transport error with a description.
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

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport failed: {}", self.detail)
    }
}

impl std::error::Error for TransportError {}
