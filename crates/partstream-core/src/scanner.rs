//! Chunk scanner.
//!
//! Splits one raw chunk into pieces without looking at any other chunk:
//!
//! - every `CRLF ++ delimiter` inside the chunk ends the piece before it
//!   (`End=Yes`) and starts a new one (`Begin=Yes`); the CRLF is dropped;
//! - if the chunk's last line is a proper prefix of the marker, those bytes
//!   are cut off into a [`SubPiece`] and the piece before them gets
//!   `End=Maybe`.
//!
//! A delimiter at offset 0 is not counted: whether it is preceded by a CRLF
//! is only known to the ledger, which keeps the previous chunk's tail.

use memchr::memmem;

use crate::boundary::{Boundary, CRLF};
use crate::piece::{BeginState, DataPiece, EndState, PartId, PieceUnit, SessionId, SubPiece};

/// Stateless splitter for one boundary.
#[derive(Debug, Clone, Copy)]
pub struct ChunkScanner<'a> {
    boundary: &'a Boundary,
}

impl<'a> ChunkScanner<'a> {
    /// Create a scanner for `boundary`.
    #[must_use]
    pub fn new(boundary: &'a Boundary) -> Self {
        Self { boundary }
    }

    /// Offsets of every delimiter in `chunk` that sits at the start of a line.
    #[must_use]
    pub fn occurrences(&self, chunk: &[u8]) -> Vec<usize> {
        memmem::find_iter(chunk, self.boundary.delimiter())
            .filter(|&i| i >= CRLF.len() && &chunk[i - CRLF.len()..i] == CRLF)
            .collect()
    }

    /// Offset where a partial marker starts in the chunk's last line, if any.
    ///
    /// Only bytes at or after `from` are considered.
    #[must_use]
    pub fn partial_tail(&self, chunk: &[u8], from: usize) -> Option<usize> {
        let marker = self.boundary.marker();
        let window_start = chunk
            .len()
            .saturating_sub(marker.len() - 1)
            .max(from);
        if window_start >= chunk.len() {
            return None;
        }
        let r = window_start + memchr::memrchr(b'\r', &chunk[window_start..])?;
        marker.starts_with(&chunk[r..]).then_some(r)
    }

    /// Split `chunk` into pieces numbered from `first_part`.
    #[must_use]
    pub fn scan(&self, session: SessionId, first_part: PartId, chunk: &[u8]) -> Vec<DataPiece> {
        let starts = self.occurrences(chunk);
        let mut pieces = Vec::with_capacity(starts.len() + 2);
        let mut part = first_part;
        let mut cursor = 0;
        let mut begin = BeginState::No;

        for &i in &starts {
            let body = &chunk[cursor..i - CRLF.len()];
            pieces.push(PieceUnit::new(session, part, begin, EndState::Yes, body).into());
            part += 1;
            cursor = i;
            begin = BeginState::Yes;
        }

        let tail_from = if begin == BeginState::Yes {
            cursor + self.boundary.delimiter().len()
        } else {
            cursor
        };
        match self.partial_tail(chunk, tail_from) {
            Some(r) => {
                pieces.push(
                    PieceUnit::new(session, part, begin, EndState::Maybe, &chunk[cursor..r]).into(),
                );
                pieces.push(SubPiece::new(session, part + 1, &chunk[r..]).into());
            }
            None => {
                pieces.push(PieceUnit::new(session, part, begin, EndState::No, &chunk[cursor..]).into());
            }
        }

        pieces
    }
}

/// Concatenate piece bodies, restoring the CRLF dropped before each section
/// start. The result equals the chunk the pieces were scanned from.
#[must_use]
pub fn join_pieces(pieces: &[DataPiece]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pieces.iter().map(|p| p.body().len() + 2).sum());
    for (idx, piece) in pieces.iter().enumerate() {
        if idx > 0 && matches!(piece, DataPiece::Unit(u) if u.begin == BeginState::Yes) {
            out.extend_from_slice(CRLF);
        }
        out.extend_from_slice(piece.body());
    }
    out
}
