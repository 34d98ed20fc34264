//! Inbound routing from carrier units to handler callbacks.

use std::fmt;
use std::sync::Arc;

use super::{fire_idle, ChannelContext, ProtocolHandler};
use crate::protocol::Dispatch;
use crate::transport::idle::IdleEvent;
use crate::transport::rate_limit::{RateLimitResult, TransportRateLimiter};
use crate::transport::traits::TransportError;
use crate::transport::transfer::TransportProtocolTransfer;

/// Transfer, rate limiter and handler for one carrier
///
/// Shared by every connection a carrier owns; all per-connection state lives
/// in the [`ChannelContext`].
pub struct Pipeline<T: TransportProtocolTransfer> {
    transfer: Arc<T>,
    handler: Arc<dyn ProtocolHandler<T::Message>>,
    limiter: Arc<TransportRateLimiter>,
}

impl<T: TransportProtocolTransfer> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            transfer: Arc::clone(&self.transfer),
            handler: Arc::clone(&self.handler),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<T: TransportProtocolTransfer> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<T: TransportProtocolTransfer> Pipeline<T> {
    /// Assemble a pipeline
    pub fn new(
        transfer: Arc<T>,
        handler: Arc<dyn ProtocolHandler<T::Message>>,
        limiter: Arc<TransportRateLimiter>,
    ) -> Self {
        Self {
            transfer,
            handler,
            limiter,
        }
    }

    /// The carrier transfer
    pub fn transfer(&self) -> &Arc<T> {
        &self.transfer
    }

    /// The application handler
    pub fn handler(&self) -> &Arc<dyn ProtocolHandler<T::Message>> {
        &self.handler
    }

    /// The shared rate limiter
    pub fn limiter(&self) -> &Arc<TransportRateLimiter> {
        &self.limiter
    }

    /// Connection became live
    pub fn fire_active(&self, ctx: &ChannelContext<T::Message>) {
        tracing::debug!(conn_id = %ctx.id(), peer = ?ctx.peer_addr(), "Channel active");
        self.handler.channel_active(ctx);
    }

    /// Connection went away; releases transfer state for it
    pub fn fire_inactive(&self, ctx: &ChannelContext<T::Message>) {
        tracing::debug!(conn_id = %ctx.id(), "Channel inactive");
        self.handler.channel_inactive(ctx);
        self.transfer.release(ctx.info());
    }

    /// Decode one carrier unit and route every resulting message
    ///
    /// A decode failure discards the whole unit.
    pub fn fire_read(&self, ctx: &ChannelContext<T::Message>, unit: T::Inbound) {
        match self.transfer.decode(ctx.info(), unit) {
            Ok(messages) => {
                for message in messages {
                    self.dispatch(ctx, message);
                }
            }
            Err(e) => {
                tracing::debug!(conn_id = %ctx.id(), error = %e, "Discarding undecodable unit");
                self.handler.handle_exception(ctx, &e);
            }
        }
    }

    /// Route one decoded message through both rate limiter gates
    pub fn dispatch(&self, ctx: &ChannelContext<T::Message>, message: T::Message) {
        let protocol_id = message.protocol_id();
        match self.limiter.check(protocol_id) {
            RateLimitResult::Allowed => {
                if let Err(e) = self.handler.handle(ctx, message) {
                    self.handler
                        .handle_exception(ctx, &TransportError::Handler(e));
                }
            }
            RateLimitResult::GlobalRejected => {
                tracing::trace!(conn_id = %ctx.id(), protocol_id, "Global rate limit rejected message");
                self.handler.global_rate_limit_reject(ctx);
            }
            RateLimitResult::ProtocolRejected { interval } => {
                tracing::trace!(
                    conn_id = %ctx.id(),
                    protocol_id,
                    interval_ms = interval.as_millis() as u64,
                    "Protocol interval rejected message"
                );
                self.handler.rate_limit_reject(ctx, message);
            }
        }
    }

    /// Report a failure that happened outside decode
    pub fn fire_exception(&self, ctx: &ChannelContext<T::Message>, cause: &TransportError) {
        self.handler.handle_exception(ctx, cause);
    }

    /// Route an idle event
    pub fn fire_idle(&self, ctx: &ChannelContext<T::Message>, event: IdleEvent) {
        tracing::trace!(conn_id = %ctx.id(), ?event, "Idle event");
        fire_idle(self.handler.as_ref(), ctx, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Protocol, ProtocolRegistry, ProtocolType};
    use crate::transport::traits::ConnectionInfo;
    use crate::transport::transfer::SocketTransfer;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Tick;

    impl Protocol for Tick {
        fn protocol_id(&self) -> u32 {
            Self::ID
        }
    }

    impl ProtocolType for Tick {
        const ID: u32 = 61;
        const MIN_INTERVAL: Duration = Duration::from_secs(60);
    }

    #[derive(Debug, Default)]
    struct Note;

    impl Protocol for Note {
        fn protocol_id(&self) -> u32 {
            Self::ID
        }
    }

    impl ProtocolType for Note {
        const ID: u32 = 62;
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        fail_handle: bool,
    }

    impl Recorder {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl ProtocolHandler<Box<dyn Protocol>> for Recorder {
        fn handle(
            &self,
            _ctx: &ChannelContext<Box<dyn Protocol>>,
            message: Box<dyn Protocol>,
        ) -> crate::pipeline::HandlerResult {
            self.push(format!("handle:{}", message.protocol_id()));
            if self.fail_handle {
                return Err("boom".into());
            }
            Ok(())
        }

        fn channel_active(&self, _ctx: &ChannelContext<Box<dyn Protocol>>) {
            self.push("active");
        }

        fn channel_inactive(&self, _ctx: &ChannelContext<Box<dyn Protocol>>) {
            self.push("inactive");
        }

        fn handle_exception(&self, _ctx: &ChannelContext<Box<dyn Protocol>>, cause: &TransportError) {
            self.push(format!("exception:{}", cause));
        }

        fn rate_limit_reject(
            &self,
            _ctx: &ChannelContext<Box<dyn Protocol>>,
            message: Box<dyn Protocol>,
        ) {
            self.push(format!("reject:{}", message.protocol_id()));
        }

        fn global_rate_limit_reject(&self, _ctx: &ChannelContext<Box<dyn Protocol>>) {
            self.push("global_reject");
        }

        fn read_idle(&self, _ctx: &ChannelContext<Box<dyn Protocol>>) {
            self.push("read_idle");
        }
    }

    fn registry() -> Arc<ProtocolRegistry> {
        ProtocolRegistry::new()
            .with_type::<Tick>()
            .unwrap()
            .with_type::<Note>()
            .unwrap()
            .into_shared()
    }

    fn pipeline(
        recorder: Arc<Recorder>,
        global_rate: i64,
    ) -> (Pipeline<SocketTransfer>, ChannelContext<Box<dyn Protocol>>) {
        let registry = registry();
        let limiter = Arc::new(TransportRateLimiter::new(global_rate, &registry));
        let pipeline = Pipeline::new(
            Arc::new(SocketTransfer::new(registry)),
            recorder as Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
            limiter,
        );
        let (ctx, _rx) = ChannelContext::new(ConnectionInfo::new(None, None));
        (pipeline, ctx)
    }

    fn packet(id: u32) -> Bytes {
        Bytes::copy_from_slice(&id.to_be_bytes())
    }

    // =========================================================================
    // Routing
    // =========================================================================

    #[test]
    fn test_lifecycle_callbacks() {
        let recorder = Arc::new(Recorder::default());
        let (pipeline, ctx) = pipeline(recorder.clone(), 0);

        pipeline.fire_active(&ctx);
        pipeline.fire_read(&ctx, packet(Note::ID));
        pipeline.fire_inactive(&ctx);

        assert_eq!(recorder.events(), vec!["active", "handle:62", "inactive"]);
    }

    #[test]
    fn test_min_interval_rejects_second_message() {
        let recorder = Arc::new(Recorder::default());
        let (pipeline, ctx) = pipeline(recorder.clone(), 0);

        pipeline.fire_read(&ctx, packet(Tick::ID));
        pipeline.fire_read(&ctx, packet(Tick::ID));
        pipeline.fire_read(&ctx, packet(Note::ID));

        assert_eq!(
            recorder.events(),
            vec!["handle:61", "reject:61", "handle:62"]
        );
    }

    #[test]
    fn test_global_limit_reject() {
        let recorder = Arc::new(Recorder::default());
        let (pipeline, ctx) = pipeline(recorder.clone(), 2);

        for _ in 0..3 {
            pipeline.fire_read(&ctx, packet(Note::ID));
        }

        assert_eq!(
            recorder.events(),
            vec!["handle:62", "handle:62", "global_reject"]
        );
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[test]
    fn test_unknown_protocol_goes_to_exception() {
        let recorder = Arc::new(Recorder::default());
        let (pipeline, ctx) = pipeline(recorder.clone(), 0);

        pipeline.fire_read(&ctx, packet(999));

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("exception:unknown protocol id 999"));
    }

    #[test]
    fn test_handler_error_goes_to_exception() {
        let recorder = Arc::new(Recorder {
            fail_handle: true,
            ..Recorder::default()
        });
        let (pipeline, ctx) = pipeline(recorder.clone(), 0);

        pipeline.fire_read(&ctx, packet(Note::ID));

        assert_eq!(
            recorder.events(),
            vec!["handle:62", "exception:handler error: boom"]
        );
    }

    #[test]
    fn test_idle_routing() {
        let recorder = Arc::new(Recorder::default());
        let (pipeline, ctx) = pipeline(recorder.clone(), 0);

        pipeline.fire_idle(&ctx, IdleEvent::ReadIdle);
        pipeline.fire_idle(&ctx, IdleEvent::WriteIdle);

        assert_eq!(recorder.events(), vec!["read_idle"]);
    }
}
