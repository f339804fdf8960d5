use core::mem;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::ReadBuf;

use super::{violation, Packet, Shared};
use crate::config::MAX_DATA_PAYLOAD;

/// Both halves of one multiplexed channel, shared between its stream handle
/// and the session's demultiplexer.
pub(crate) struct ChannelState {
    local_id: u32,
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
}

struct Inner {
    remote_id: u32,
    remote_max_packet: usize,
    /// Bytes we may still send.
    remote_window: usize,
    /// Bytes the remote may still send.
    local_window: usize,
    /// Bytes read since credit was last granted back.
    consumed: usize,
    buffer: VecDeque<Bytes>,
    remote_eof: bool,
    received_close: bool,
    sent_eof: bool,
    sent_close: bool,
    /// The session is gone.
    dead: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Inner {
    fn take_wakers(&mut self) -> impl Iterator<Item = Waker> {
        self.read_waker.take().into_iter().chain(self.write_waker.take())
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection closed")
}

impl ChannelState {
    pub(super) fn new(
        local_id: u32,
        remote_id: u32,
        remote_window: u32,
        remote_max_packet: u32,
        shared: Arc<Shared>,
    ) -> Arc<Self> {
        let local_window = shared.config.window_size as usize;

        Arc::new(Self {
            local_id,
            shared,
            inner: Mutex::new(Inner {
                remote_id,
                remote_max_packet: (remote_max_packet as usize).clamp(1, MAX_DATA_PAYLOAD),
                remote_window: remote_window as usize,
                local_window,
                consumed: 0,
                buffer: VecDeque::new(),
                remote_eof: false,
                received_close: false,
                sent_eof: false,
                sent_close: false,
                dead: false,
                read_waker: None,
                write_waker: None,
            }),
        })
    }

    pub(crate) const fn local_id(&self) -> u32 {
        self.local_id
    }

    pub(crate) fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut inner = self.inner.lock();

        if let Some(chunk) = inner.buffer.front_mut() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk.split_to(n));
            if chunk.is_empty() {
                let _chunk = inner.buffer.pop_front();
            }

            inner.consumed += n;
            let threshold = self.shared.config.window_size as usize / 2;
            if inner.consumed >= threshold && !(inner.remote_eof || inner.sent_close || inner.dead) {
                let bytes = mem::take(&mut inner.consumed);
                inner.local_window += bytes;
                let _sent = self.shared.send(Packet::ChannelWindowAdjust {
                    recipient: inner.remote_id,
                    bytes: u32::try_from(bytes).unwrap_or(u32::MAX),
                });
            }

            return Poll::Ready(Ok(()));
        }

        if inner.remote_eof || inner.received_close {
            return Poll::Ready(Ok(()));
        }
        if inner.sent_close {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream closed",
            )));
        }
        if inner.dead {
            return Poll::Ready(Err(closed_error()));
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Sends as much of `data` as the remote's window and packet size allow.
    pub(crate) fn poll_write(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock();

        if inner.dead {
            return Poll::Ready(Err(closed_error()));
        }
        if inner.sent_eof || inner.sent_close {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed for writing",
            )));
        }
        if inner.received_close {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed by remote",
            )));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if inner.remote_window == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = data
            .len()
            .min(inner.remote_window)
            .min(inner.remote_max_packet);

        let packet = Packet::ChannelData {
            recipient: inner.remote_id,
            data: data[..n].to_vec(),
        };
        if let Err(err) = self.shared.send(packet) {
            return Poll::Ready(Err(err.into()));
        }

        inner.remote_window -= n;
        Poll::Ready(Ok(n))
    }

    /// Signals end of data. The inbound half stays readable.
    pub(crate) fn close_write(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.sent_eof || inner.sent_close || inner.dead {
            return Ok(());
        }

        inner.sent_eof = true;
        self.shared
            .send(Packet::ChannelEof {
                recipient: inner.remote_id,
            })
            .map_err(Into::into)
    }

    /// Closes both directions. Idempotent.
    pub(crate) fn close(&self) -> io::Result<()> {
        let (release, result) = {
            let mut inner = self.inner.lock();
            if inner.sent_close || inner.dead {
                return Ok(());
            }

            inner.sent_close = true;
            inner.buffer.clear();
            inner.take_wakers().for_each(Waker::wake);

            let result = self.shared.send(Packet::ChannelClose {
                recipient: inner.remote_id,
            });
            (inner.received_close, result)
        };

        if release {
            self.shared.remove(self.local_id);
        }

        result.map_err(Into::into)
    }

    pub(super) fn grant(&self, bytes: u32) -> io::Result<()> {
        let mut inner = self.inner.lock();

        let window = inner.remote_window + bytes as usize;
        if window > u32::MAX as usize {
            return Err(violation(format!(
                "window of channel {} grew past the protocol limit",
                self.local_id
            )));
        }

        inner.remote_window = window;
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }

        Ok(())
    }

    pub(super) fn receive(&self, data: Vec<u8>) -> io::Result<()> {
        let mut inner = self.inner.lock();

        if data.len() > inner.local_window {
            return Err(violation(format!(
                "channel {} received {} bytes with {} bytes of window left",
                self.local_id,
                data.len(),
                inner.local_window
            )));
        }
        if data.len() > self.shared.config.max_packet as usize {
            return Err(violation(format!(
                "channel {} received an oversized packet of {} bytes",
                self.local_id,
                data.len()
            )));
        }
        if inner.remote_eof {
            return Err(violation(format!(
                "channel {} received data after end of stream",
                self.local_id
            )));
        }

        inner.local_window -= data.len();

        if inner.sent_close || data.is_empty() {
            return Ok(());
        }

        inner.buffer.push_back(Bytes::from(data));
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }

        Ok(())
    }

    pub(super) fn remote_eof(&self) {
        let mut inner = self.inner.lock();
        inner.remote_eof = true;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
    }

    /// Answers the remote's close with our own, unless already sent, and
    /// releases the channel id.
    pub(super) fn remote_close(&self) {
        let reply = {
            let mut inner = self.inner.lock();
            inner.received_close = true;
            inner.take_wakers().for_each(Waker::wake);

            let reply = !(inner.sent_close || inner.dead);
            inner.sent_close |= reply;
            reply.then_some(inner.remote_id)
        };

        if let Some(recipient) = reply {
            let _sent = self.shared.send(Packet::ChannelClose { recipient });
        }

        self.shared.remove(self.local_id);
    }

    pub(super) fn send_failure(&self) {
        let recipient = self.inner.lock().remote_id;
        let _sent = self.shared.send(Packet::ChannelFailure { recipient });
    }

    /// Fails every pending and future operation.
    pub(super) fn kill(&self) {
        let mut inner = self.inner.lock();
        inner.dead = true;
        inner.take_wakers().for_each(Waker::wake);
    }
}
