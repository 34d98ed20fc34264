//! Stream connection driver shared by [`TcpClient`](super::TcpClient) and
//! [`TcpServer`](super::TcpServer).
//!
//! Each connection runs two tasks:
//!
//! ```text
//!            ┌──────────── connection task ────────────┐
//!  socket ──▶│ FrameDecoder ─▶ Pipeline::fire_read      │
//!            │ idle tick    ─▶ Pipeline::fire_idle      │
//!            │ close()      ─▶ shutdown                 │
//!            └───────────────▲─────────────────────────┘
//!                            │ write faults
//!            ┌───────────────┴── writer task ───────────┐
//!  ctx.send ▶│ transfer.encode ─▶ frame ─▶ write_all    │──▶ socket
//!            └──────────────────────────────────────────┘
//! ```
//!
//! Every handler callback runs on the connection task. The writer only
//! reports faults back to it.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::pipeline::{ChannelContext, Outbound, Pipeline};
use crate::transport::frame::{encode_frame_into, FrameDecoder};
use crate::transport::idle::{IdleTimer, IdleTracker};
use crate::transport::traits::{ConnectionInfo, TransportError};
use crate::transport::transfer::TransportProtocolTransfer;
use crate::transport::ChannelSettings;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Transfers that speak packet bytes on a byte stream
pub trait StreamTransfer: TransportProtocolTransfer<Inbound = Bytes, Outbound = Bytes> {}

impl<T> StreamTransfer for T where T: TransportProtocolTransfer<Inbound = Bytes, Outbound = Bytes> {}

enum WriteFault {
    /// Report and keep going
    Recoverable(TransportError),
    /// The socket is unusable
    Fatal(TransportError),
}

/// A connected stream whose tasks have not started yet
pub(crate) struct PendingStream<T: StreamTransfer> {
    ctx: ChannelContext<T::Message>,
    outbound: mpsc::UnboundedReceiver<Outbound<T::Message>>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    pipeline: Pipeline<T>,
    settings: ChannelSettings,
}

impl<T: StreamTransfer> PendingStream<T> {
    pub(crate) fn new(
        stream: TcpStream,
        pipeline: Pipeline<T>,
        settings: ChannelSettings,
    ) -> Result<Self, TransportError> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let info = ConnectionInfo::new(stream.local_addr().ok(), Some(stream.peer_addr()?));
        let (ctx, outbound) = ChannelContext::new(info);
        let (reader, writer) = stream.into_split();

        Ok(Self {
            ctx,
            outbound,
            reader,
            writer,
            pipeline,
            settings,
        })
    }

    pub(crate) fn ctx(&self) -> &ChannelContext<T::Message> {
        &self.ctx
    }

    /// Mark the connection active and start its tasks
    ///
    /// `on_exit` runs on the connection task after `channel_inactive`.
    pub(crate) fn spawn<F>(self, on_exit: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ctx.set_active(true);
        tokio::spawn(async move {
            self.run().await;
            on_exit();
        })
    }

    async fn run(self) {
        let Self {
            ctx,
            outbound,
            mut reader,
            writer,
            pipeline,
            settings,
        } = self;

        let tracker = IdleTracker::shared();
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound,
            ctx.info().clone(),
            Arc::clone(pipeline.transfer()),
            settings.max_frame_size,
            Arc::clone(&tracker),
            fault_tx,
            stop_rx,
        ));

        pipeline.fire_active(&ctx);

        let mut decoder = FrameDecoder::with_max_frame_size(settings.max_frame_size);
        let mut idle = IdleTimer::new(settings.idle, Arc::clone(&tracker));
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                () = ctx.close_requested() => {
                    tracing::debug!(conn_id = %ctx.id(), "Close requested");
                    break;
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!(conn_id = %ctx.id(), "Connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        tracker.record_read();
                        decoder.push(&buf[..n]);
                        if !drain_frames(&mut decoder, &pipeline, &ctx) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(conn_id = %ctx.id(), error = %e, "Read error");
                        pipeline.fire_exception(&ctx, &TransportError::Io(e));
                        break;
                    }
                },
                Some(fault) = fault_rx.recv() => match fault {
                    WriteFault::Recoverable(e) => pipeline.fire_exception(&ctx, &e),
                    WriteFault::Fatal(e) => {
                        pipeline.fire_exception(&ctx, &e);
                        break;
                    }
                },
                events = idle.due() => {
                    for event in events {
                        pipeline.fire_idle(&ctx, event);
                    }
                }
            }
        }

        ctx.set_active(false);
        let _ = stop_tx.send(());
        match writer_task.await {
            Ok(mut leftover) => {
                leftover.close();
                while let Ok(outbound) = leftover.try_recv() {
                    outbound.fail(TransportError::ConnectionClosed);
                }
            }
            Err(e) => tracing::warn!(conn_id = %ctx.id(), error = %e, "Writer task failed"),
        }

        // Faults raised while the writer wound down
        while let Ok(fault) = fault_rx.try_recv() {
            let (WriteFault::Recoverable(e) | WriteFault::Fatal(e)) = fault;
            pipeline.fire_exception(&ctx, &e);
        }

        pipeline.fire_inactive(&ctx);
    }
}

/// Dispatch every complete frame; `false` means the stream must close
fn drain_frames<T: StreamTransfer>(
    decoder: &mut FrameDecoder,
    pipeline: &Pipeline<T>,
    ctx: &ChannelContext<T::Message>,
) -> bool {
    loop {
        match decoder.decode() {
            Ok(Some(packet)) => pipeline.fire_read(ctx, packet),
            Ok(None) => return true,
            Err(e @ TransportError::FrameTooLarge { .. }) => {
                tracing::warn!(conn_id = %ctx.id(), error = %e, "Oversized frame, closing");
                pipeline.fire_exception(ctx, &e);
                return false;
            }
            Err(e) => {
                tracing::warn!(conn_id = %ctx.id(), error = %e, "Skipping corrupt frame");
                pipeline.fire_exception(ctx, &e);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_loop<T: StreamTransfer>(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound<T::Message>>,
    info: ConnectionInfo,
    transfer: Arc<T>,
    max_frame_size: usize,
    tracker: Arc<IdleTracker>,
    faults: mpsc::UnboundedSender<WriteFault>,
    mut stop: oneshot::Receiver<()>,
) -> mpsc::UnboundedReceiver<Outbound<T::Message>> {
    let mut buf = Vec::new();

    loop {
        // Queued messages win over stop so a graceful close flushes them
        let outbound = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
            _ = &mut stop => break,
        };

        buf.clear();
        let framed = transfer
            .encode(&info, outbound.message())
            .and_then(|units| {
                units
                    .iter()
                    .try_for_each(|unit| encode_frame_into(unit, max_frame_size, &mut buf))
            });
        if let Err(e) = framed {
            tracing::warn!(conn_id = %info.id, error = %e, "Dropping unencodable message");
            outbound.fail(TransportError::SendFailed(e.to_string()));
            let _ = faults.send(WriteFault::Recoverable(e));
            continue;
        }
        if buf.is_empty() {
            outbound.complete();
            continue;
        }

        match half.write_all(&buf).await {
            Ok(()) => {
                tracker.record_write();
                outbound.complete();
            }
            Err(e) => {
                tracing::debug!(conn_id = %info.id, error = %e, "Write error");
                outbound.fail(TransportError::SendFailed(e.to_string()));
                let _ = faults.send(WriteFault::Fatal(TransportError::Io(e)));
                break;
            }
        }
    }

    let _ = half.shutdown().await;
    rx
}
