//! Transport Traits
//!
//! Core trait and error definitions shared by every carrier.
//!
//! Three traits describe the two connection roles:
//! - [`Connection`]: lifecycle common to both roles (address, activity, close)
//! - [`Client`]: drives one outbound connection and accepts `request` calls
//! - [`Server`]: binds an acceptor and owns every accepted connection
//!
//! # Lifecycle
//!
//! ```text
//!   new ──connect/bind──▶ active ──peer gone──▶ inactive
//!    │                      │                      │
//!    └───────── close ──────┴──────── close ───────┴──▶ stopped (terminal)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::{BoxError, WriteListener};
use crate::protocol::ProtocolError;

// =============================================================================
// Identity
// =============================================================================

/// Unique identifier for one connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new random 64-bit connection id
    #[must_use]
    pub fn new() -> Self {
        use rand::Rng;
        let bytes: [u8; 8] = rand::thread_rng().gen();
        Self(format!("conn-{}", hex::encode(bytes)))
    }

    /// Borrow the textual form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and addresses of one connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: ConnectionId,
    /// Local bound address
    pub local_addr: Option<SocketAddr>,
    /// Remote peer address (`None` for unconnected datagram sockets)
    pub peer_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    /// Create info with a fresh id
    #[must_use]
    pub fn new(local_addr: Option<SocketAddr>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::new(),
            local_addr,
            peer_addr,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connect did not complete within the configured timeout
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target address
        addr: SocketAddr,
        /// Configured timeout
        timeout: Duration,
    },

    /// Bind did not complete within the configured timeout
    #[error("bind on {addr} timed out after {timeout:?}")]
    BindTimeout {
        /// Requested address
        addr: SocketAddr,
        /// Configured timeout
        timeout: Duration,
    },

    /// Connection attempt failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The underlying resource reported inactive
    #[error("connection lost")]
    ConnectionLost,

    /// Connection was closed locally
    #[error("connection closed")]
    ConnectionClosed,

    /// A write did not succeed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Carrier unit could not be turned into messages or back
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Protocol resolution or payload error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Frame checksum mismatch
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// Frame length exceeds the configured maximum
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Peer answered an HTTP exchange with a non-success status
    #[error("http status {0}")]
    HttpStatus(u16),

    /// IO error from the underlying socket
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Reconnect replay buffer is at capacity
    #[error("replay buffer full ({capacity} messages)")]
    ReplayBufferFull {
        /// Configured capacity
        capacity: usize,
    },

    /// Application handler returned an error
    #[error("handler error: {0}")]
    Handler(BoxError),
}

impl TransportError {
    /// Whether the error is one of the timeout variants
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. } | Self::BindTimeout { .. })
    }
}

/// Why a `request` was not accepted for write
///
/// The rejected message is handed back so the caller can retry or buffer it.
#[derive(Debug, Error)]
pub enum SendError<M> {
    /// No live connection
    #[error("connection is not active")]
    Inactive(M),

    /// Reconnect replay buffer is full
    #[error("replay buffer is full")]
    BufferFull(M),
}

impl<M> SendError<M> {
    /// Recover the rejected message
    pub fn into_inner(self) -> M {
        match self {
            Self::Inactive(m) | Self::BufferFull(m) => m,
        }
    }
}

/// Outcome of an accepted `request`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Handed to the live connection's outbound queue
    Queued,
    /// Held in a replay buffer until the next activation
    Buffered,
}

// =============================================================================
// Connection Traits
// =============================================================================

/// Lifecycle shared by clients and servers
#[async_trait]
pub trait Connection: Send + Sync {
    /// Locally bound address once connected or bound
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Whether the underlying I/O resource is live
    fn is_active(&self) -> bool;

    /// Whether `close` has been called
    fn is_stopped(&self) -> bool;

    /// Release every owned resource
    ///
    /// Idempotent and infallible. Waits for connection tasks to finish.
    async fn close(&self);
}

/// Outbound connection
#[async_trait]
pub trait Client<M: Send + 'static>: Connection {
    /// Connect to `addr`, resolving once connected, failed, or timed out
    ///
    /// Connecting while already active is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectTimeout`] on timeout and
    /// [`TransportError::InvalidState`] once the client is stopped.
    async fn connect(&self, addr: SocketAddr) -> Result<(), TransportError>;

    /// Remote address of the live connection
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Hand a message to the outbound queue without waiting for the write
    ///
    /// # Errors
    ///
    /// Returns the message inside [`SendError`] when it was not accepted.
    fn request(&self, message: M) -> Result<RequestStatus, SendError<M>>;

    /// Like [`request`](Self::request), notifying `listener` once the write
    /// completes or fails
    ///
    /// # Errors
    ///
    /// Returns the message inside [`SendError`] when it was not accepted; the
    /// listener is dropped without being called in that case.
    fn request_with_listener(
        &self,
        message: M,
        listener: WriteListener<M>,
    ) -> Result<RequestStatus, SendError<M>>;
}

/// Inbound acceptor
#[async_trait]
pub trait Server: Connection {
    /// Bind to `addr` and start accepting
    ///
    /// Returns the actual bound address, which resolves ephemeral ports.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindTimeout`] on timeout and
    /// [`TransportError::Io`] when the bind itself fails.
    async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError>;
}
