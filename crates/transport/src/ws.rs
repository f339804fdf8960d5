//! Frame adapter: a WebSocket message stream presented as an ordered byte stream.

use core::fmt;
use core::future;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async_with_config, client_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::addr::DialTarget;
use crate::config::WebSocketConfig;
use crate::error::HandshakeError;

/// WebSocket subprotocol negotiated by both ends of the upgrade.
pub const SUBPROTOCOL: &str = "/wssh/1.0";

/// Reliable, ordered, bidirectional byte stream the secure channel runs over.
///
/// Reads and writes may proceed concurrently; concurrent reads (or writes) are
/// serialized by the implementation.
#[async_trait]
pub trait ByteConn: Send + Sync + 'static {
    /// Returns `Ok(0)` at end of stream.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Ends the stream and releases the transport underneath it. Only the first
    /// call observes an error.
    async fn close(&self) -> io::Result<()>;

    /// Takes effect immediately, including for a read already in progress.
    fn set_read_deadline(&self, deadline: Option<Instant>);

    async fn set_write_deadline(&self, deadline: Option<Instant>);

    async fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline).await;
    }

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;
}

pub struct WsConn<S> {
    reader: Mutex<Reader<S>>,
    writer: Mutex<Writer<S>>,
    read_deadline: watch::Sender<Option<Instant>>,
    closed: CancellationToken,
    close_started: AtomicBool,
    graceful_close_timeout: Duration,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

// Both halves are taken back on close to shut the socket down.
struct Reader<S> {
    stream: Option<SplitStream<WebSocketStream<S>>>,
    current: Bytes,
    eof: bool,
}

struct Writer<S> {
    sink: Option<SplitSink<WebSocketStream<S>, Message>>,
    deadline: Option<Instant>,
}

impl<S> fmt::Debug for WsConn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConn")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S> WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    #[must_use]
    pub fn new(
        ws: WebSocketStream<S>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        graceful_close_timeout: Duration,
    ) -> Self {
        let (sink, stream) = ws.split();
        let (read_deadline, _) = watch::channel(None);

        Self {
            reader: Mutex::new(Reader {
                stream: Some(stream),
                current: Bytes::new(),
                eof: false,
            }),
            writer: Mutex::new(Writer {
                sink: Some(sink),
                deadline: None,
            }),
            read_deadline,
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
            graceful_close_timeout,
            local_addr,
            remote_addr,
        }
    }

    /// Waits for the next data-carrying message. `None` is end of stream.
    async fn next_message(
        &self,
        stream: &mut SplitStream<WebSocketStream<S>>,
    ) -> io::Result<Option<Bytes>> {
        let mut deadline = self.read_deadline.subscribe();

        loop {
            let current = *deadline.borrow_and_update();
            let expired = async move {
                match current {
                    Some(at) => sleep_until(at).await,
                    None => future::pending().await,
                }
            };

            let message = select! {
                biased;
                () = self.closed.cancelled() => return Err(not_connected()),
                _ = deadline.changed() => continue,
                () = expired => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"));
                }
                message = stream.next() => message,
            };

            match message {
                None => return Ok(None),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_bytes())))
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        None => Ok(None),
                        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Status) => {
                            Ok(None)
                        }
                        Some(frame) => Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            format!("websocket closed with {}: {}", frame.code, frame.reason),
                        )),
                    };
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    trace!(remote_addr=%self.remote_addr, "Skipping control message");
                }
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(err)) => return Err(io::Error::other(err)),
            }
        }
    }

    /// Reassembles the websocket and shuts down the byte stream underneath.
    async fn shutdown_socket(&self) {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;

        let (Some(stream), Some(sink)) = (reader.stream.take(), writer.sink.take()) else {
            return;
        };
        let Ok(mut ws) = stream.reunite(sink) else {
            debug!(remote_addr=%self.remote_addr, "Websocket halves do not match");
            return;
        };

        if let Err(err) = ws.get_mut().shutdown().await {
            debug!(remote_addr=%self.remote_addr, %err, "Failed to shut down socket");
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

#[async_trait]
impl<S> ByteConn for WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut reader = self.reader.lock().await;
        let reader = &mut *reader;

        loop {
            if reader.current.has_remaining() {
                let n = buf.len().min(reader.current.remaining());
                reader.current.copy_to_slice(&mut buf[..n]);
                return Ok(n);
            }

            if reader.eof {
                return Ok(0);
            }

            let Some(stream) = reader.stream.as_mut() else {
                return Err(not_connected());
            };

            match self.next_message(stream).await? {
                Some(data) => reader.current = data,
                None => reader.eof = true,
            }
        }
    }

    /// Sends `buf` as exactly one binary message.
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(not_connected());
        }

        let mut writer = self.writer.lock().await;
        let writer = &mut *writer;
        let Some(sink) = writer.sink.as_mut() else {
            return Err(not_connected());
        };

        // A write stuck on a full socket must not hold up close.
        let send = async {
            select! {
                biased;
                () = self.closed.cancelled() => Err(not_connected()),
                result = sink.send(Message::Binary(buf.to_vec())) => result.map_err(io::Error::other),
            }
        };

        match writer.deadline {
            Some(at) => timeout_at(at, send).await.map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")
            })??,
            None => send.await?,
        }

        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let graceful = timeout(self.graceful_close_timeout, async {
            let mut writer = self.writer.lock().await;
            let Some(sink) = writer.sink.as_mut() else {
                return Ok(());
            };
            sink.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "closed".into(),
            })))
            .await?;
            sink.close().await
        })
        .await;

        self.closed.cancel();

        if timeout(self.graceful_close_timeout, self.shutdown_socket())
            .await
            .is_err()
        {
            debug!(remote_addr=%self.remote_addr, "Timed out shutting down socket");
        }

        match graceful {
            Ok(Ok(())) => Ok(()),
            Ok(Err(
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(tungstenite::error::ProtocolError::SendAfterClosing),
            )) => {
                debug!(remote_addr=%self.remote_addr, "Remote closed the websocket first");
                Ok(())
            }
            Ok(Err(err)) => Err(io::Error::other(err)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "graceful close timed out",
            )),
        }
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        // No read lock here, so that a blocked read can be interrupted.
        let _previous = self.read_deadline.send_replace(deadline);
    }

    async fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.writer.lock().await.deadline = deadline;
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Opens a TCP connection to `target` and performs the client upgrade.
pub(crate) async fn connect(
    target: &DialTarget,
    config: &WebSocketConfig,
) -> Result<WsConn<TcpStream>, HandshakeError> {
    let upgrade = async {
        let tcp = TcpStream::connect(target.authority()).await?;
        tcp.set_nodelay(true)?;
        let local_addr = tcp.local_addr()?;
        let remote_addr = tcp.peer_addr()?;

        let mut request = target.url(&config.path).into_client_request()?;
        let _previous = request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (ws, response) = client_async_with_config(request, tcp, None).await?;

        let selected = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok());
        if selected != Some(SUBPROTOCOL) {
            return Err(HandshakeError::Subprotocol(selected.map(str::to_owned)));
        }

        debug!(%local_addr, %remote_addr, "WebSocket client upgrade complete");

        Ok(WsConn::new(
            ws,
            local_addr,
            remote_addr,
            config.graceful_close_timeout,
        ))
    };

    timeout(config.handshake_timeout, upgrade)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Performs the server side of the upgrade on an accepted socket.
pub(crate) async fn accept(
    tcp: TcpStream,
    config: &WebSocketConfig,
) -> Result<WsConn<TcpStream>, HandshakeError> {
    tcp.set_nodelay(true)?;
    let local_addr = tcp.local_addr()?;
    let remote_addr = tcp.peer_addr()?;

    let path = config.path.clone();
    let callback = move |request: &Request, mut response: Response| {
        if request.uri().path() != path {
            let mut error = ErrorResponse::new(Some("not found".to_owned()));
            *error.status_mut() = StatusCode::NOT_FOUND;
            return Err(error);
        }

        let offered = request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|protocol| protocol.trim() == SUBPROTOCOL);

        if offered {
            let _previous = response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        }

        Ok(response)
    };

    let ws = timeout(
        config.handshake_timeout,
        accept_hdr_async_with_config(tcp, callback, None),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)??;

    debug!(%local_addr, %remote_addr, "WebSocket server upgrade complete");

    Ok(WsConn::new(
        ws,
        local_addr,
        remote_addr,
        config.graceful_close_timeout,
    ))
}
