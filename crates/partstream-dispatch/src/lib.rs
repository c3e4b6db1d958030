//! Async session dispatch for partstream.
//!
//! Wraps the synchronous reassembly engine in one tokio task per session:
//!
//! - [`Dispatcher`] owns the shared [`Store`](partstream_core::Store) and
//!   spawns session tasks
//! - [`SessionHandle`] is what a connection's read loop holds: it queues raw
//!   chunks and, on EOF, waits for the session to drain
//! - [`Transport`] is the downstream collaborator that receives envelopes
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(MyTransport::connect().await?, DispatchConfig::new());
//! let handle = dispatcher.open(SessionId::new(1), Boundary::from_content_type(ct)?)?;
//! while let Some(chunk) = socket.next_chunk().await? {
//!     handle.send_chunk(chunk).await?;
//! }
//! let report = handle.finish().await?;
//! ```

#![forbid(unsafe_code)]

mod dispatcher;
mod transport;

pub use dispatcher::{
    DEFAULT_CHANNEL_CAPACITY, DispatchConfig, DispatchError, Dispatcher, SessionHandle,
    SessionReport,
};
pub use transport::{Transport, TransportError};
