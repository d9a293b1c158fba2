//! Error types and async-id correlation.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Correlation token returned by deferred operations.
///
/// A deferred call (anything posted to a dispatcher rather than awaited)
/// returns an `AsyncId`; if the operation later fails, the error callback
/// carries the same id so the embedder can match failures to calls.
pub type AsyncId = u32;

static NEXT_ASYNC_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next async-id. Process-wide, wrapping on overflow.
pub fn gen_async_id() -> AsyncId {
    NEXT_ASYNC_ID.fetch_add(1, Ordering::Relaxed)
}

/// Errors surfaced by the connection pool and the layers above it.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The target connection is not established or its queue is closed.
    #[error("connection not ready")]
    ConnNotReady,

    /// A frame header declared a payload larger than the configured limit.
    #[error("oversized message: {size} bytes (max: {max})")]
    OversizedMsg { size: usize, max: usize },

    /// The peer id is not registered.
    #[error("peer does not exist")]
    PeerNotExist,

    /// The peer id is already registered.
    #[error("peer already exists")]
    PeerAlreadyExists,

    /// The peer has no address set yet.
    #[error("peer not ready (no address)")]
    PeerNotReady,

    /// The system randomness source failed.
    #[error("failed to read from the random source")]
    RandSource,

    /// No client connection is known for the address.
    #[error("no client connection for {0}")]
    ClientNotExist(SocketAddr),

    /// An outbound connection attempt timed out.
    #[error("connection timeout to {addr}")]
    ConnectTimeout { addr: SocketAddr },

    /// An address cannot be carried in the wire encoding.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A payload could not be decoded into the expected message type.
    #[error("decode error: {0}")]
    Decode(&'static str),

    /// The pool or network has been stopped.
    #[error("shut down")]
    Shutdown,
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
