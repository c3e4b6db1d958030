//! Output envelopes handed to the transport collaborator.

use serde::Serialize;

use crate::piece::{PartId, SessionId};

/// Shape of the outbound call an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EnvelopeKind {
    /// The whole field travels in this one envelope.
    Unary,
    /// One slice of a streamed field.
    StreamChunk,
}

/// What the transport does before delivering the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum PreAction {
    /// Nothing to open.
    #[default]
    None,
    /// Open the session's first outbound stream.
    ///
    /// Given once per session, not once per delimiter; later fields open
    /// with [`PreAction::Open`] or [`PreAction::StopLast`] wherever the
    /// chunks were cut.
    Start,
    /// Open a new outbound stream.
    Open,
    /// Append to the open stream.
    Continue,
    /// Close the previous stream, then open a new one.
    StopLast,
}

/// What the transport does after delivering the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum PostAction {
    #[default]
    None,
    /// More envelopes for this stream follow.
    Continue,
    /// Close this stream; another field follows.
    Close,
    /// Close this stream early; the rest of the field was dropped.
    Stop,
    /// Close this stream and the session.
    Finish,
}

impl PostAction {
    /// Returns true if the stream is closed after this envelope.
    #[must_use]
    pub fn closes_stream(self) -> bool {
        matches!(self, Self::Close | Self::Stop | Self::Finish)
    }
}

/// Identifies one outbound stream: the session and the part that opened the
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamKey {
    pub session: SessionId,
    pub part: PartId,
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session, self.part)
    }
}

/// One unit of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputEnvelope {
    pub kind: EnvelopeKind,
    pub stream_key: StreamKey,
    pub form_name: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub pre_action: PreAction,
    pub post_action: PostAction,
    pub body: Vec<u8>,
}

impl OutputEnvelope {
    /// Returns true if the envelope carries file data.
    #[must_use]
    pub fn is_file(&self) -> bool {
        !self.file_name.is_empty()
    }

    /// The body as UTF-8, if valid.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Returns true if this envelope opens a new outbound stream.
    #[must_use]
    pub fn opens_stream(&self) -> bool {
        matches!(
            self.pre_action,
            PreAction::Start | PreAction::Open | PreAction::StopLast
        )
    }
}
