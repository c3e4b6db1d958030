//! Streaming reassembly of chunked `multipart/form-data` uploads.
//!
//! A proxy that sees an upload as a series of raw chunks can use partstream
//! to emit each form field as soon as its bytes are known, without buffering
//! the whole request and without ever rejoining chunks:
//!
//! - **Chunk-local scanning**: each chunk is split on its own; delimiters
//!   cut across chunks are resolved later
//! - **Out-of-order tolerant**: pieces that arrive early are buffered and
//!   drained once the gap closes
//! - **Per-field streams**: output is a sequence of envelopes tagged with
//!   Start/Open/Continue/Stop/Finish actions
//! - **Async dispatch**: one tokio task per session delivers envelopes to a
//!   [`Transport`] in order (feature `dispatch`, on by default)
//!
//! # Quick Start
//!
//! ```ignore
//! use partstream::prelude::*;
//!
//! struct Forward;
//!
//! impl Transport for Forward {
//!     async fn deliver(&self, envelope: OutputEnvelope) -> Result<(), TransportError> {
//!         println!("{} {:?}", envelope.stream_key, envelope.post_action);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging(&LogConfig::new().level(LogLevel::Debug))?;
//!     let dispatcher = Dispatcher::new(Forward, DispatchConfig::new());
//!     let boundary = Boundary::from_content_type("multipart/form-data; boundary=B")?;
//!     let handle = dispatcher.open(SessionId::new(1), boundary)?;
//!     handle.send_chunk(b"--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nhi\r\n--B--".to_vec()).await?;
//!     handle.finish().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Crate Structure
//!
//! - [`partstream_core`]: Scanner, header accumulator, ledger and the
//!   synchronous [`Application`]
//! - [`partstream_dispatch`]: Per-session tokio tasks and the [`Transport`]
//!   seam

#![forbid(unsafe_code)]

pub use partstream_core as core;
#[cfg(feature = "dispatch")]
pub use partstream_dispatch as dispatch;

pub use partstream_core::{
    Application, ApplicationError, BeginState, Boundary, BoundaryError, BranchKey, BranchKind,
    ChunkScanner, CompletionCounter, Condition, ConfigError, DataPiece, DiscardReason,
    Disposition, EndState, EnvelopeKind, EnvelopeSink, Handled, LogConfig, LogLevel,
    LoggingError, Order, OutputEnvelope, Outcome, PartId, PieceUnit, PostAction, PreAction,
    ReassemblyConfig, ReassemblyError, Registration, SessionId, SessionSnapshot, SinkError, Store,
    StreamKey, SubPiece, init_logging, parse_boundary,
};

#[cfg(feature = "dispatch")]
pub use partstream_dispatch::{
    DispatchConfig, DispatchError, Dispatcher, SessionHandle, SessionReport, Transport,
    TransportError,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        Application, ApplicationError, Boundary, Condition, EnvelopeSink, Handled, LogConfig,
        LogLevel, OutputEnvelope, PostAction, PreAction, ReassemblyConfig, SessionId, SinkError,
        Store, StreamKey, init_logging,
    };
    #[cfg(feature = "dispatch")]
    pub use crate::{DispatchConfig, Dispatcher, SessionHandle, Transport, TransportError};
    pub use serde::Serialize;
}

/// Testing utilities module.
pub mod testing {
    pub use partstream_core::testing::{
        CollectingSink, FormBuilder, FormField, ReassembledField, chunked, reassemble, split_at,
    };
}
