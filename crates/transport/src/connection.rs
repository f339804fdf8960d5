//! Capable connections: one secured, multiplexed link to a single peer.

use core::cmp::max;
use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicU8, Ordering};
use core::time::Duration;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use libp2p_identity::{PeerId, PublicKey};
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::addr::to_multiaddr;
use crate::error::{Error, Result};
use crate::handshake::{Algorithms, Secured};
use crate::session::{GlobalRequest, NewChannel, OpenFailureReason, Session};
use crate::stream::Stream;
use crate::transport::Transport;
use crate::ws::ByteConn;

/// Channel type carrying streams.
pub const TUNNEL_CHANNEL: &str = "direct-tcpip";

/// Connection-scoped request used for liveness checks.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnectionState {
    Established,
    Closing,
    Closed,
}

const ESTABLISHED: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Immutable facts about a connection, shared with its streams.
#[derive(Debug)]
pub struct ConnectionMeta {
    pub local_peer: PeerId,
    pub remote_peer: PeerId,
    pub remote_key: PublicKey,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
    pub local_socket_addr: SocketAddr,
    pub remote_socket_addr: SocketAddr,
}

/// A cheaply clonable handle to a capable connection.
///
/// The connection is torn down by [`Connection::close`], when the byte stream
/// underneath fails, or when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Transport,
    session: Session,
    meta: Arc<ConnectionMeta>,
    streams: AsyncMutex<mpsc::Receiver<Stream>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    closing: AsyncMutex<()>,
    shutdown: CancellationToken,
    state: AtomicU8,
    connect_time: SystemTime,
    last_seen: Arc<Mutex<SystemTime>>,
    algorithms: Algorithms,
    remote_banner: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local_peer", &self.inner.meta.local_peer)
            .field("remote_peer", &self.inner.meta.remote_peer)
            .field("remote_addr", &self.inner.meta.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Starts multiplexing over a secured byte stream.
    pub(crate) fn new(transport: Transport, conn: Arc<dyn ByteConn>, secured: Secured) -> Self {
        let Secured {
            noise,
            reader,
            writer,
            remote_key,
            algorithms,
            remote_banner,
        } = secured;

        let local_socket_addr = conn.local_addr();
        let remote_socket_addr = conn.remote_addr();

        let meta = Arc::new(ConnectionMeta {
            local_peer: transport.local_peer(),
            remote_peer: remote_key.to_peer_id(),
            remote_key,
            local_addr: to_multiaddr(local_socket_addr),
            remote_addr: to_multiaddr(remote_socket_addr),
            local_socket_addr,
            remote_socket_addr,
        });

        let mux = transport.config().mux.clone();
        let (streams_tx, streams) = mpsc::channel(mux.stream_queue);
        let (session, incoming) = Session::new(conn, noise, reader, writer, mux);
        let shutdown = session.shutdown_token();

        let connect_time = SystemTime::now();
        let last_seen = Arc::new(Mutex::new(connect_time));

        let loops = vec![
            tokio::spawn(inbound_loop(
                incoming.channels,
                streams_tx,
                Arc::clone(&meta),
                shutdown.clone(),
            )),
            tokio::spawn(control_loop(
                incoming.requests,
                Arc::clone(&last_seen),
                shutdown.clone(),
            )),
        ];

        debug!(remote_peer=%meta.remote_peer, remote_addr=%meta.remote_addr, %algorithms, "Connection established");

        Self {
            inner: Arc::new(Inner {
                transport,
                session,
                meta,
                streams: AsyncMutex::new(streams),
                loops: Mutex::new(loops),
                closing: AsyncMutex::new(()),
                shutdown,
                state: AtomicU8::new(ESTABLISHED),
                connect_time,
                last_seen,
                algorithms,
                remote_banner,
            }),
        }
    }

    /// Opens a new outbound stream and waits for the remote to accept it.
    pub async fn open_stream(&self) -> Result<Stream> {
        if self.state() != ConnectionState::Established {
            return Err(Error::ConnectionClosed);
        }

        let channel = self
            .inner
            .session
            .open_channel(TUNNEL_CHANNEL, Vec::new())
            .await?;

        Ok(Stream::new(channel, Arc::clone(&self.inner.meta)))
    }

    /// Waits for the next stream opened by the remote.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let shutdown = &self.inner.shutdown;

        let mut streams = select! {
            biased;
            () = shutdown.cancelled() => return Err(Error::ConnectionClosed),
            streams = self.inner.streams.lock() => streams,
        };

        select! {
            biased;
            () = shutdown.cancelled() => Err(Error::ConnectionClosed),
            stream = streams.recv() => stream.ok_or(Error::ConnectionClosed),
        }
    }

    /// Sends a connection-scoped request, see [`KEEPALIVE_REQUEST`].
    ///
    /// Returns the reply payload if `want_reply` is set and the remote
    /// accepted the request.
    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        self.inner.session.request(name, want_reply, payload).await
    }

    /// Checks that the remote is alive, updating [`Self::last_seen`] on success.
    pub async fn keepalive(&self) -> Result<()> {
        let _payload = self.send_request(KEEPALIVE_REQUEST, true, Vec::new()).await?;
        touch(&self.inner.last_seen);
        Ok(())
    }

    /// Closes every stream and the underlying byte stream, then joins all
    /// background tasks.
    ///
    /// Concurrent callers return once the first one has finished tearing down.
    /// Only the first call observes an error.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let _closing = inner.closing.lock().await;

        if inner.state.load(Ordering::Acquire) == CLOSED {
            return Ok(());
        }
        inner.state.store(CLOSING, Ordering::Release);

        let result = inner.session.close().await;

        let loops = mem::take(&mut *inner.loops.lock());
        for handle in loops {
            if let Err(err) = handle.await {
                warn!(%err, "Connection task failed");
            }
        }

        inner.state.store(CLOSED, Ordering::Release);

        debug!(remote_peer=%inner.meta.remote_peer, "Connection closed");

        result.map_err(Error::Io)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::Acquire) {
            ESTABLISHED if self.inner.session.is_terminated() => ConnectionState::Closed,
            ESTABLISHED => ConnectionState::Established,
            CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Established
    }

    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.inner.meta.local_peer
    }

    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.inner.meta.remote_peer
    }

    #[must_use]
    pub fn remote_public_key(&self) -> &PublicKey {
        &self.inner.meta.remote_key
    }

    #[must_use]
    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.inner.meta.local_addr
    }

    #[must_use]
    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.inner.meta.remote_addr
    }

    #[must_use]
    pub fn local_socket_addr(&self) -> SocketAddr {
        self.inner.meta.local_socket_addr
    }

    #[must_use]
    pub fn remote_socket_addr(&self) -> SocketAddr {
        self.inner.meta.remote_socket_addr
    }

    #[must_use]
    pub fn meta(&self) -> &Arc<ConnectionMeta> {
        &self.inner.meta
    }

    #[must_use]
    pub fn connect_time(&self) -> SystemTime {
        self.inner.connect_time
    }

    /// Last time the remote proved to be alive through a keepalive.
    #[must_use]
    pub fn last_seen(&self) -> SystemTime {
        *self.inner.last_seen.lock()
    }

    #[must_use]
    pub fn algorithms(&self) -> Algorithms {
        self.inner.algorithms
    }

    #[must_use]
    pub fn remote_banner(&self) -> &str {
        &self.inner.remote_banner
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }
}

/// Advances `last_seen` to now, and always strictly forward.
fn touch(last_seen: &Mutex<SystemTime>) {
    let mut last_seen = last_seen.lock();
    *last_seen = max(SystemTime::now(), *last_seen + Duration::from_nanos(1));
}

/// Accepts tunnel channels and queues them as streams.
async fn inbound_loop(
    mut offers: mpsc::Receiver<NewChannel>,
    streams: mpsc::Sender<Stream>,
    meta: Arc<ConnectionMeta>,
    shutdown: CancellationToken,
) {
    loop {
        let offer = select! {
            biased;
            () = shutdown.cancelled() => break,
            offer = offers.recv() => offer,
        };
        let Some(offer) = offer else {
            break;
        };

        if offer.kind() != TUNNEL_CHANNEL {
            let description = format!("unknown channel type {:?}", offer.kind());
            debug!(remote_peer=%meta.remote_peer, %description, "Rejecting channel");
            if offer
                .reject(OpenFailureReason::UnknownChannelType, description)
                .is_err()
            {
                break;
            }
            continue;
        }

        let channel = match offer.accept() {
            Ok(channel) => channel,
            Err(err) => {
                debug!(%err, "Failed to accept channel");
                break;
            }
        };

        let stream = Stream::new(channel, Arc::clone(&meta));

        // Dropping the stream on shutdown closes the channel.
        select! {
            biased;
            () = shutdown.cancelled() => break,
            result = streams.send(stream) => if result.is_err() {
                break;
            },
        }
    }
}

/// Answers connection-scoped requests.
async fn control_loop(
    mut requests: mpsc::Receiver<GlobalRequest>,
    last_seen: Arc<Mutex<SystemTime>>,
    shutdown: CancellationToken,
) {
    loop {
        let request = select! {
            biased;
            () = shutdown.cancelled() => break,
            request = requests.recv() => request,
        };
        let Some(request) = request else {
            break;
        };

        let accepted = request.name() == KEEPALIVE_REQUEST;
        if accepted {
            touch(&last_seen);
        } else {
            debug!(name=%request.name(), "Rejecting unknown request");
        }

        if request.reply(accepted).is_err() {
            break;
        }
    }
}
