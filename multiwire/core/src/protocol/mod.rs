//! Protocol Model
//!
//! Application messages are plain Rust types that implement [`Protocol`]:
//! a stable numeric id plus a binary read/write contract over a payload
//! cursor. The same types travel over every carrier.
//!
//! # Wire Header
//!
//! ```text
//! +--------------------+-----------------------------------------+
//! | Protocol ID (4)    | Payload (variable)                      |
//! | big-endian u32     | written by Protocol::write              |
//! +--------------------+-----------------------------------------+
//! ```
//!
//! `read` and `write` only ever see the payload cursor. The id is handled
//! by [`ProtocolCodec`].
//!
//! # Degenerate Variants
//!
//! Both `read` and `write` default to no-ops, so a request-only message
//! (inbound only) implements just `read` and a response-only message
//! (outbound only) implements just `write`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use multiwire_core::protocol::{
//!     Protocol, ProtocolError, ProtocolReader, ProtocolType, ProtocolWriter,
//! };
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Protocol for Chat {
//!     fn protocol_id(&self) -> u32 {
//!         Self::ID
//!     }
//!
//!     fn read(&mut self, reader: &mut ProtocolReader) -> Result<(), ProtocolError> {
//!         self.text = reader.read_string()?;
//!         Ok(())
//!     }
//!
//!     fn write(&self, writer: &mut ProtocolWriter) {
//!         writer.write_string(&self.text);
//!     }
//! }
//!
//! impl ProtocolType for Chat {
//!     const ID: u32 = 7;
//!     const MIN_INTERVAL: Duration = Duration::from_millis(100);
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod registry;

use std::any::Any;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub use buffer::{ProtocolReader, ProtocolWriter};
pub use codec::{ProtocolCodec, HEADER_LEN};
pub use registry::{ProtocolEntry, ProtocolFactory, ProtocolRegistry};

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while resolving, reading or writing protocol messages
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// No type is registered under this id
    #[error("unknown protocol id {id}")]
    UnknownProtocol {
        /// The id found on the wire
        id: u32,
    },

    /// Registration collided with an existing id
    #[error("protocol id {id} is already registered")]
    DuplicateProtocol {
        /// The contested id
        id: u32,
    },

    /// A read ran past the end of the payload
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow {
        /// Bytes the read required
        needed: usize,
        /// Bytes left in the cursor
        remaining: usize,
    },

    /// Packet is shorter than the protocol id header
    #[error("packet of {len} bytes is too short for the protocol header")]
    MissingHeader {
        /// Packet length
        len: usize,
    },

    /// A string field was not valid UTF-8
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Payload (de)compression failed
    #[error("payload compression failed: {0}")]
    Compression(String),
}

// =============================================================================
// Protocol Traits
// =============================================================================

/// Upcast helper so boxed protocols can be downcast to their concrete type
pub trait AsAny: Any {
    /// Borrow as `&dyn Any`
    fn as_any(&self) -> &dyn Any;

    /// Convert a box into `Box<dyn Any>`
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A binary application message identified by a stable integer id
///
/// Instances are constructed fresh for every inbound message by the
/// [`ProtocolRegistry`], hydrated by `read`, and consumed once by the
/// handler.
pub trait Protocol: AsAny + Send + fmt::Debug {
    /// Stable type id written in the wire header
    fn protocol_id(&self) -> u32;

    /// Hydrate fields from the inbound payload
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the payload is truncated or malformed.
    fn read(&mut self, reader: &mut ProtocolReader) -> Result<(), ProtocolError> {
        let _ = reader;
        Ok(())
    }

    /// Serialize fields into the outbound payload
    fn write(&self, writer: &mut ProtocolWriter) {
        let _ = writer;
    }
}

impl dyn Protocol {
    /// Check whether the message is of concrete type `T`
    #[must_use]
    pub fn is<T: Protocol>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Borrow the message as its concrete type
    #[must_use]
    pub fn downcast_ref<T: Protocol>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Take ownership of the message as its concrete type
    #[must_use]
    pub fn downcast<T: Protocol>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}

/// A protocol type that declares its id and throttle interval statically
///
/// Used by [`ProtocolRegistry::register_type`] in place of scanning for
/// annotated types.
pub trait ProtocolType: Protocol + Default {
    /// Stable protocol id
    const ID: u32;

    /// Minimum interval between two accepted messages of this type
    ///
    /// `Duration::ZERO` disables the per-type throttle.
    const MIN_INTERVAL: Duration = Duration::ZERO;
}

/// Anything the handler pipeline can dispatch and rate limit
///
/// Implemented by `Box<dyn Protocol>` for stream carriers and by carrier
/// envelopes such as [`UdpEnvelope`](crate::transport::transfer::UdpEnvelope).
pub trait Dispatch: Send + fmt::Debug + 'static {
    /// Protocol id used for per-type throttling
    fn protocol_id(&self) -> u32;
}

impl Dispatch for Box<dyn Protocol> {
    fn protocol_id(&self) -> u32 {
        Protocol::protocol_id(&**self)
    }
}
