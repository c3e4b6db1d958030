//! Chunk-level reassembly of `multipart/form-data` uploads.
//!
//! Uploads arrive as raw chunks that may cut a delimiter, a field header or a
//! field body anywhere. This crate turns them back into per-field output:
//!
//! - [`ChunkScanner`] splits one chunk into [`DataPiece`]s without looking
//!   at any other chunk
//! - [`Disposition`] accumulates a field header across pieces
//! - [`Store`] keeps per-session branch state, buffers out-of-order pieces,
//!   resolves delimiters that straddle chunks and counts pieces to completion
//! - [`Application`] drives the above and forwards [`OutputEnvelope`]s to an
//!   [`EnvelopeSink`] in delivery order
//!
//! # Design Principles
//!
//! - Sessions never share locks beyond a short map lookup
//! - Pieces of one session are applied strictly in part order
//! - Malformed input is reported as a [`Condition`], never a panic
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use partstream_core::{Application, Boundary, SessionId, Store};
//! use partstream_core::testing::CollectingSink;
//!
//! let boundary = Boundary::from_content_type("multipart/form-data; boundary=B")?;
//! let app = Application::new(Arc::new(Store::default()), CollectingSink::new());
//! let session = SessionId::new(1);
//! app.handle_chunk(session, b"--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nhe", &boundary)?;
//! app.handle_chunk(session, b"llo\r\n--B--", &boundary)?;
//! ```

#![forbid(unsafe_code)]

pub mod app;
pub mod boundary;
pub mod config;
pub mod counter;
pub mod envelope;
pub mod error;
pub mod header;
pub mod ledger;
pub mod logging;
pub mod piece;
pub mod scanner;
pub mod testing;

pub use app::{Application, EnvelopeSink, Handled};
pub use boundary::{Boundary, MAX_BOUNDARY_LEN, parse_boundary};
pub use config::ReassemblyConfig;
pub use counter::{CompletionCounter, Order};
pub use envelope::{EnvelopeKind, OutputEnvelope, PostAction, PreAction, StreamKey};
pub use error::{
    ApplicationError, BoundaryError, Condition, ConfigError, ReassemblyError, SinkError,
};
pub use header::{Accumulated, Disposition, HeaderStatus, accumulate};
pub use ledger::{
    BranchKey, BranchKind, DiscardReason, Outcome, Registration, SessionSnapshot, Store,
};
pub use logging::{LogConfig, LogLevel, LoggingError, init_logging};
pub use piece::{BeginState, DataPiece, EndState, PartId, PieceUnit, SessionId, SubPiece};
pub use scanner::{ChunkScanner, join_pieces};
