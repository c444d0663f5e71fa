// Stream bridge: pipes a swarm byte source into an HTTP body, pulled at the sink's pace.

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_stream::Stream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, warn};

use super::connection::{ByteWindow, Connection, ConnectionRegistry, ConnectionState};
use super::session::SessionLease;
use crate::error::GatewayError;

/// A registered connection streaming one byte window.
///
/// The body only reads when polled, so the source is never drained faster than the
/// client accepts bytes. The source itself is owned by the [`Connection`], so a
/// sweep can destroy it without the body being polled. Dropping the bridge (client
/// went away) destroys the source and deregisters the connection on the spot.
pub struct StreamBridge {
    conn: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    primed: Option<Bytes>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    remaining: u64,
    done: bool,
}

impl StreamBridge {
    /// Register a connection, open the window and pull the first chunk.
    ///
    /// Errors here happen before any byte reached the client, so callers can still
    /// answer with an error status.
    pub async fn open(
        registry: Arc<ConnectionRegistry>,
        lease: SessionLease,
        window: ByteWindow,
        read_chunk: usize,
    ) -> Result<Self, GatewayError> {
        let session = Arc::clone(lease.session());
        let conn = registry.open(lease, window);
        let cancelled = Box::pin(conn.cancel_token().clone().cancelled_owned());
        let mut bridge = Self {
            conn,
            registry,
            primed: None,
            cancelled,
            remaining: window.len(),
            done: false,
        };

        let source = match session
            .handle()
            .open_byte_stream(session.file(), window.start, window.end)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                warn!("connection {} failed to open source: {:#}", bridge.conn.id(), e);
                return Err(GatewayError::Internal(format!(
                    "failed to open byte stream: {:#}",
                    e
                )));
            }
        };
        bridge.conn.attach_source(ReaderStream::with_capacity(
            source.take(window.len()),
            read_chunk,
        ));

        match poll_fn(|cx| bridge.poll_source(cx)).await {
            Some(Ok(chunk)) => bridge.primed = Some(chunk),
            Some(Err(e)) => {
                return Err(GatewayError::Internal(format!("byte source failed: {}", e)));
            }
            None => {}
        }
        Ok(bridge)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn poll_source(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.cancelled.as_mut().poll(cx).is_ready() {
            debug!("connection {} cancelled", self.conn.id());
            self.finish(ConnectionState::Aborted);
            return Poll::Ready(None);
        }

        match ready!(self.conn.poll_source(cx)) {
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                self.remaining = self.remaining.saturating_sub(len);
                self.conn.record_sent(len);
                Poll::Ready(Some(Ok(chunk)))
            }
            None if self.remaining == 0 => {
                self.finish(ConnectionState::Closed);
                Poll::Ready(None)
            }
            None if self.conn.cancel_token().is_cancelled() => {
                // Source released by a sweep or shutdown.
                debug!("connection {} source released", self.conn.id());
                self.finish(ConnectionState::Aborted);
                Poll::Ready(None)
            }
            None => {
                let err = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("byte source ended {} bytes early", self.remaining),
                );
                warn!("connection {} {}", self.conn.id(), err);
                self.finish(ConnectionState::Aborted);
                Poll::Ready(Some(Err(err)))
            }
            Some(Err(e)) if self.conn.cancel_token().is_cancelled() => {
                // Teardown we asked for, not a failure.
                debug!("connection {} source closed early: {}", self.conn.id(), e);
                self.finish(ConnectionState::Aborted);
                Poll::Ready(None)
            }
            Some(Err(e)) => {
                warn!("connection {} source error: {}", self.conn.id(), e);
                self.finish(ConnectionState::Aborted);
                Poll::Ready(Some(Err(e)))
            }
        }
    }

    fn finish(&mut self, state: ConnectionState) {
        if self.done {
            return;
        }
        self.done = true;
        self.primed = None;
        self.conn.mark_source_closed();
        self.registry.close(&self.conn, state);
    }
}

impl Stream for StreamBridge {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(chunk) = self.primed.take() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        self.poll_source(cx)
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.conn.mark_sink_closed();
        if self.remaining == 0 && self.primed.is_none() {
            self.finish(ConnectionState::Closed);
        } else {
            debug!(
                "connection {} dropped with {} bytes unsent",
                self.conn.id(),
                self.remaining
            );
            self.finish(ConnectionState::Aborted);
        }
    }
}
