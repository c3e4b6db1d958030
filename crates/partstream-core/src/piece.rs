//! Pieces: the unit the scanner produces and the ledger consumes.

use serde::{Deserialize, Serialize};

/// Per-session sequence number of a piece.
pub type PartId = u64;

/// Opaque identifier of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw session id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Whether a piece starts a new section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BeginState {
    /// The piece continues the current section.
    #[default]
    No,
    /// The piece body starts with the delimiter.
    Yes,
    /// Undecided. The scanner never produces this; the ledger handles it
    /// like [`BeginState::No`].
    Maybe,
}

/// How a piece's section ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EndState {
    /// The section continues in a later chunk.
    #[default]
    No,
    /// The piece is followed by a confirmed `CRLF ++ delimiter`.
    Yes,
    /// The chunk tail after this piece may be the start of a delimiter; a
    /// [`SubPiece`] with those bytes follows.
    Maybe,
}

/// A chunk-derived piece of section data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceUnit {
    pub session: SessionId,
    pub part: PartId,
    pub begin: BeginState,
    pub end: EndState,
    pub body: Vec<u8>,
    /// Set on the final piece of a connection that closed early.
    pub unblock: bool,
}

impl PieceUnit {
    /// Create a piece.
    #[must_use]
    pub fn new(
        session: SessionId,
        part: PartId,
        begin: BeginState,
        end: EndState,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            session,
            part,
            begin,
            end,
            body: body.into(),
            unblock: false,
        }
    }

    /// An empty piece that tells the ledger the connection is gone.
    #[must_use]
    pub fn unblock(session: SessionId, part: PartId) -> Self {
        Self {
            unblock: true,
            ..Self::new(session, part, BeginState::No, EndState::No, Vec::new())
        }
    }
}

/// Candidate delimiter bytes cut from the end of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubPiece {
    pub session: SessionId,
    pub part: PartId,
    pub body: Vec<u8>,
}

impl SubPiece {
    /// Create a sub piece.
    #[must_use]
    pub fn new(session: SessionId, part: PartId, body: impl Into<Vec<u8>>) -> Self {
        Self {
            session,
            part,
            body: body.into(),
        }
    }
}

/// Anything the ledger can register.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataPiece {
    Unit(PieceUnit),
    Sub(SubPiece),
}

impl DataPiece {
    /// The owning session.
    #[must_use]
    pub fn session(&self) -> SessionId {
        match self {
            Self::Unit(u) => u.session,
            Self::Sub(s) => s.session,
        }
    }

    /// The piece's sequence number.
    #[must_use]
    pub fn part(&self) -> PartId {
        match self {
            Self::Unit(u) => u.part,
            Self::Sub(s) => s.part,
        }
    }

    /// The raw bytes carried by the piece.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        match self {
            Self::Unit(u) => &u.body,
            Self::Sub(s) => &s.body,
        }
    }

    /// Returns true for the connection-closed marker.
    #[must_use]
    pub fn is_unblock(&self) -> bool {
        matches!(self, Self::Unit(u) if u.unblock)
    }
}

impl From<PieceUnit> for DataPiece {
    fn from(unit: PieceUnit) -> Self {
        Self::Unit(unit)
    }
}

impl From<SubPiece> for DataPiece {
    fn from(sub: SubPiece) -> Self {
        Self::Sub(sub)
    }
}
