//! Per-connection handle passed to every handler callback.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::transport::traits::{ConnectionId, ConnectionInfo, SendError, TransportError};

/// Completion callback for one outbound write
pub type WriteListener<M> = Box<dyn FnOnce(Result<(), WriteFailure<M>>) + Send>;

/// A write that was accepted but did not reach the socket
#[derive(Debug)]
pub struct WriteFailure<M> {
    /// The message that failed, handed back for retry
    pub message: M,
    /// Why the write failed
    pub error: TransportError,
}

/// One queued outbound message
pub struct Outbound<M> {
    message: M,
    listener: Option<WriteListener<M>>,
}

impl<M> Outbound<M> {
    /// Borrow the queued message
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Report a successful write
    pub fn complete(self) {
        if let Some(listener) = self.listener {
            listener(Ok(()));
        }
    }

    /// Report a failed write
    pub fn fail(self, error: TransportError) {
        match self.listener {
            Some(listener) => listener(Err(WriteFailure {
                message: self.message,
                error,
            })),
            None => {
                tracing::debug!(error = %error, "Dropping unacknowledged outbound message");
            }
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Outbound<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("message", &self.message)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

struct ChannelShared<M> {
    info: ConnectionInfo,
    outbound: mpsc::UnboundedSender<Outbound<M>>,
    active: AtomicBool,
    close: Notify,
}

/// Handle to one live connection
///
/// Cheap to clone. `send` enqueues onto the connection's ordered outbound
/// queue and never blocks.
pub struct ChannelContext<M> {
    shared: Arc<ChannelShared<M>>,
}

impl<M> Clone for ChannelContext<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for ChannelContext<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("info", &self.shared.info)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<M> ChannelContext<M> {
    /// Identity and addresses
    #[must_use]
    pub fn info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.shared.info.id
    }

    /// Remote address
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.info.peer_addr
    }

    /// Local address
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.info.local_addr
    }

    /// Whether the connection is live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.shared.active.store(active, Ordering::SeqCst);
    }
}

impl<M: Send + 'static> ChannelContext<M> {
    /// Create a context and the receiving end of its outbound queue
    ///
    /// The context starts inactive; the carrier marks it active right
    /// before firing `channel_active`.
    #[must_use]
    pub fn new(info: ConnectionInfo) -> (Self, mpsc::UnboundedReceiver<Outbound<M>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            shared: Arc::new(ChannelShared {
                info,
                outbound,
                active: AtomicBool::new(false),
                close: Notify::new(),
            }),
        };
        (ctx, rx)
    }

    /// Queue a message for write
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Inactive`] with the message when the connection
    /// is not live.
    pub fn send(&self, message: M) -> Result<(), SendError<M>> {
        self.enqueue(Outbound {
            message,
            listener: None,
        })
    }

    /// Queue a message and get notified when its write completes
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Inactive`] with the message when the connection
    /// is not live. The listener is not called in that case.
    pub fn send_with_listener(
        &self,
        message: M,
        listener: WriteListener<M>,
    ) -> Result<(), SendError<M>> {
        self.enqueue(Outbound {
            message,
            listener: Some(listener),
        })
    }

    fn enqueue(&self, outbound: Outbound<M>) -> Result<(), SendError<M>> {
        if !self.is_active() {
            return Err(SendError::Inactive(outbound.message));
        }
        self.shared
            .outbound
            .send(outbound)
            .map_err(|e| SendError::Inactive(e.0.message))
    }

    /// Ask the carrier to close this connection
    pub fn close(&self) {
        self.shared.close.notify_one();
    }

    /// Resolves once `close` has been requested
    pub(crate) async fn close_requested(&self) {
        self.shared.close.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn context() -> (ChannelContext<u32>, mpsc::UnboundedReceiver<Outbound<u32>>) {
        ChannelContext::new(ConnectionInfo::new(None, None))
    }

    #[test]
    fn test_send_requires_active() {
        let (ctx, mut rx) = context();
        assert!(matches!(ctx.send(1), Err(SendError::Inactive(1))));

        ctx.set_active(true);
        ctx.send(2).unwrap();
        assert_eq!(*rx.try_recv().unwrap().message(), 2);
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (ctx, rx) = context();
        ctx.set_active(true);
        drop(rx);
        assert!(matches!(ctx.send(3), Err(SendError::Inactive(3))));
    }

    #[test]
    fn test_listener_receives_failed_message() {
        let (ctx, mut rx) = context();
        ctx.set_active(true);

        let failed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&failed);
        ctx.send_with_listener(
            7,
            Box::new(move |result| {
                if let Err(failure) = result {
                    *sink.lock() = Some(failure.message);
                }
            }),
        )
        .unwrap();

        rx.try_recv()
            .unwrap()
            .fail(TransportError::ConnectionLost);
        assert_eq!(*failed.lock(), Some(7));
    }

    #[test]
    fn test_listener_on_success() {
        let (ctx, mut rx) = context();
        ctx.set_active(true);

        let ok = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ok);
        ctx.send_with_listener(
            1,
            Box::new(move |result| flag.store(result.is_ok(), Ordering::SeqCst)),
        )
        .unwrap();

        rx.try_recv().unwrap().complete();
        assert!(ok.load(Ordering::SeqCst));
    }

    #[test]
    fn test_debug_shows_identity_and_activity() {
        let (ctx, _rx) = context();
        let debug = format!("{ctx:?}");
        assert!(debug.contains("ChannelContext"), "{debug}");
        assert!(debug.contains("active: false"), "{debug}");

        ctx.set_active(true);
        assert!(format!("{ctx:?}").contains("active: true"));
    }

    #[test]
    fn test_default_exception_callback_is_noop() {
        use crate::pipeline::{HandlerResult, ProtocolHandler};

        struct Quiet;

        impl ProtocolHandler<u32> for Quiet {
            fn handle(&self, _ctx: &ChannelContext<u32>, _message: u32) -> HandlerResult {
                Ok(())
            }
        }

        let (ctx, mut rx) = context();
        ctx.set_active(true);
        Quiet.handle_exception(&ctx, &TransportError::ConnectionLost);
        assert!(ctx.is_active());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_before_wait_is_not_lost() {
        let (ctx, _rx) = context();
        ctx.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), ctx.close_requested())
            .await
            .expect("close request should be remembered");
    }
}
