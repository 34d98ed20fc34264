//! Session Registry
//!
//! Per-connection application state. A session is built lazily on the first
//! [`SessionRegistry::get`] for a connection, is never shared between
//! connections, and goes away with the connection once
//! [`SessionCleanupHandler`] sees it turn inactive.
//!
//! # Example
//!
//! ```ignore
//! let sessions = Arc::new(SessionRegistry::new(|info: &ConnectionInfo| {
//!     PlayerState::new(info.peer_addr)
//! }));
//! let handler = SessionCleanupHandler::new(Arc::clone(&sessions), Arc::new(GameHandler));
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;

use crate::pipeline::{ChannelContext, HandlerResult, ProtocolHandler};
use crate::transport::traits::{ConnectionId, ConnectionInfo, TransportError};

type Builder<S> = Box<dyn Fn(&ConnectionInfo) -> S + Send + Sync>;

/// Sessions keyed by connection
pub struct SessionRegistry<S> {
    sessions: DashMap<ConnectionId, Arc<S>>,
    builder: Builder<S>,
}

impl<S> fmt::Debug for SessionRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> SessionRegistry<S> {
    /// Registry that builds missing sessions with `builder`
    pub fn new<F>(builder: F) -> Self
    where
        F: Fn(&ConnectionInfo) -> S + Send + Sync + 'static,
    {
        Self {
            sessions: DashMap::new(),
            builder: Box::new(builder),
        }
    }

    /// Session for `connection`, built on first use
    ///
    /// The builder runs at most once per connection. It runs under the map
    /// shard's lock, so it must not call back into this registry.
    pub fn get(&self, connection: &ConnectionInfo) -> Arc<S> {
        let entry = self
            .sessions
            .entry(connection.id.clone())
            .or_insert_with(|| {
                tracing::debug!(conn_id = %connection.id, "Building session");
                Arc::new((self.builder)(connection))
            });
        Arc::clone(entry.value())
    }

    /// Session for `id` without building one
    pub fn get_existing(&self, id: &ConnectionId) -> Option<Arc<S>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Detach and return the session for `id`
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<S>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            tracing::debug!(conn_id = %id, "Session removed");
        }
        removed
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no connection holds a session
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Handler decorator that drops a connection's session once it goes inactive
pub struct SessionCleanupHandler<M, S> {
    sessions: Arc<SessionRegistry<S>>,
    delegate: Arc<dyn ProtocolHandler<M>>,
    _message: PhantomData<fn(M)>,
}

impl<M, S> SessionCleanupHandler<M, S> {
    /// Wrap `delegate`, cleaning up entries of `sessions`
    pub fn new(sessions: Arc<SessionRegistry<S>>, delegate: Arc<dyn ProtocolHandler<M>>) -> Self {
        Self {
            sessions,
            delegate,
            _message: PhantomData,
        }
    }
}

impl<M, S> ProtocolHandler<M> for SessionCleanupHandler<M, S>
where
    M: Send + 'static,
    S: Send + Sync + 'static,
{
    fn handle(&self, ctx: &ChannelContext<M>, message: M) -> HandlerResult {
        self.delegate.handle(ctx, message)
    }

    fn channel_active(&self, ctx: &ChannelContext<M>) {
        self.delegate.channel_active(ctx);
    }

    fn channel_inactive(&self, ctx: &ChannelContext<M>) {
        self.delegate.channel_inactive(ctx);
        self.sessions.remove(ctx.id());
    }

    fn handle_exception(&self, ctx: &ChannelContext<M>, cause: &TransportError) {
        self.delegate.handle_exception(ctx, cause);
    }

    fn rate_limit_reject(&self, ctx: &ChannelContext<M>, message: M) {
        self.delegate.rate_limit_reject(ctx, message);
    }

    fn global_rate_limit_reject(&self, ctx: &ChannelContext<M>) {
        self.delegate.global_rate_limit_reject(ctx);
    }

    fn read_idle(&self, ctx: &ChannelContext<M>) {
        self.delegate.read_idle(ctx);
    }

    fn write_idle(&self, ctx: &ChannelContext<M>) {
        self.delegate.write_idle(ctx);
    }

    fn read_write_idle(&self, ctx: &ChannelContext<M>) {
        self.delegate.read_write_idle(ctx);
    }
}
