//! Protocol Handler Pipeline
//!
//! [`ProtocolHandler`] is the capability surface applications implement.
//! Carriers drive it through [`Pipeline`], which decodes inbound units,
//! applies the rate limiter gates and routes each message to exactly one
//! callback.
//!
//! # Execution Model
//!
//! Every callback for a given connection runs on that connection's own task,
//! one at a time. State touched only from callbacks needs no extra locking.
//! Decorators (reconnect, session cleanup) add work before or after
//! delegating but always on the same task they were invoked on.
//!
//! ```text
//!  inbound unit ──▶ transfer.decode ──▶ global gate ──▶ per-type gate ──▶ handle
//!                        │                  │                │
//!                        ▼                  ▼                ▼
//!                 handle_exception  global_rate_limit  rate_limit_reject
//!                                        _reject
//! ```

pub mod context;
pub mod dispatch;

pub use context::{ChannelContext, Outbound, WriteFailure, WriteListener};
pub use dispatch::Pipeline;

use crate::transport::idle::IdleEvent;
use crate::transport::traits::TransportError;

/// Boxed application error
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of the normal `handle` callback
pub type HandlerResult = Result<(), BoxError>;

/// Lifecycle callbacks for one connection
///
/// Only `handle` is required. Every other callback defaults to a no-op.
pub trait ProtocolHandler<M>: Send + Sync + 'static {
    /// A message passed both rate limiter gates
    ///
    /// # Errors
    ///
    /// An error is routed to [`handle_exception`](Self::handle_exception);
    /// the connection stays open.
    fn handle(&self, ctx: &ChannelContext<M>, message: M) -> HandlerResult;

    /// The connection became active
    fn channel_active(&self, _ctx: &ChannelContext<M>) {}

    /// The connection became inactive
    fn channel_inactive(&self, _ctx: &ChannelContext<M>) {}

    /// Decode, handler or I/O failure on this connection
    fn handle_exception(&self, ctx: &ChannelContext<M>, cause: &TransportError) {
        tracing::warn!(conn_id = %ctx.id(), error = %cause, "Unhandled channel exception");
    }

    /// Message dropped by its type's minimum interval
    fn rate_limit_reject(&self, _ctx: &ChannelContext<M>, _message: M) {}

    /// Message dropped by the global token bucket
    fn global_rate_limit_reject(&self, _ctx: &ChannelContext<M>) {}

    /// Nothing read for the configured read-idle duration
    fn read_idle(&self, _ctx: &ChannelContext<M>) {}

    /// Nothing written for the configured write-idle duration
    fn write_idle(&self, _ctx: &ChannelContext<M>) {}

    /// Nothing read or written for the configured all-idle duration
    fn read_write_idle(&self, _ctx: &ChannelContext<M>) {}
}

/// Route an idle event to its callback
pub(crate) fn fire_idle<M: 'static>(
    handler: &dyn ProtocolHandler<M>,
    ctx: &ChannelContext<M>,
    event: IdleEvent,
) {
    match event {
        IdleEvent::ReadIdle => handler.read_idle(ctx),
        IdleEvent::WriteIdle => handler.write_idle(ctx),
        IdleEvent::ReadWriteIdle => handler.read_write_idle(ctx),
    }
}
