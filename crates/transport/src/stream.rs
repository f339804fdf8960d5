use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::debug;

use crate::connection::ConnectionMeta;
use crate::session::ChannelState;

/// One logical duplex channel over a [`Connection`](crate::Connection).
///
/// Dropping a stream closes it.
pub struct Stream {
    channel: Arc<ChannelState>,
    meta: Arc<ConnectionMeta>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("remote_peer", &self.meta.remote_peer)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub(crate) const fn new(channel: Arc<ChannelState>, meta: Arc<ConnectionMeta>) -> Self {
        Self {
            channel,
            meta,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Channel id assigned by this side of the connection.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.channel.local_id()
    }

    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.meta.remote_peer
    }

    #[must_use]
    pub fn local_addr(&self) -> &Multiaddr {
        &self.meta.local_addr
    }

    #[must_use]
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.meta.remote_addr
    }

    #[must_use]
    pub fn local_socket_addr(&self) -> SocketAddr {
        self.meta.local_socket_addr
    }

    #[must_use]
    pub fn remote_socket_addr(&self) -> SocketAddr {
        self.meta.remote_socket_addr
    }

    /// Sends end-of-stream. Reading remains possible.
    pub fn close_write(&mut self) -> io::Result<()> {
        self.channel.close_write()
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.channel.close()
    }

    /// Closes the stream. There is no read-only half-close, so this closes both
    /// directions.
    pub fn close_read(&mut self) -> io::Result<()> {
        self.channel.close()
    }

    pub fn reset(&mut self) -> io::Result<()> {
        self.channel.close()
    }

    /// Pending and future reads fail with [`io::ErrorKind::TimedOut`] once
    /// `deadline` passes. `None` clears the deadline.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|at| Box::pin(sleep_until(at)));
    }

    /// Like [`Self::set_read_deadline`], for writes waiting on flow-control credit.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|at| Box::pin(sleep_until(at)));
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    deadline
        .as_mut()
        .is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready())
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "stream deadline exceeded")
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }

        this.channel.poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }

        this.channel.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Data is handed to the session writer as soon as it is accepted.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.channel.close_write())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.channel.close() {
            debug!(id=%self.id(), %err, "Failed to close dropped stream");
        }
    }
}
