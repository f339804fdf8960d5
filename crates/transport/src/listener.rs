use core::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::addr::to_multiaddr;
use crate::config::WebSocketConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::gater::Direction;
use crate::handshake::Role;
use crate::transport::Transport;
use crate::ws::{self, ByteConn, WsConn};

/// Accepts inbound WebSocket connections and promotes them to [`Connection`]s.
pub struct Listener {
    transport: Transport,
    local_addr: SocketAddr,
    multiaddr: Multiaddr,
    incoming: AsyncMutex<mpsc::Receiver<WsConn<TcpStream>>>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("multiaddr", &self.multiaddr)
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Listener {
    pub(crate) async fn bind(transport: Transport, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let multiaddr = to_multiaddr(local_addr);

        let config = transport.config().websocket.clone();
        let (incoming_tx, incoming) = mpsc::channel(config.incoming_queue);
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(serve(listener, config, incoming_tx, shutdown.clone()));

        info!(%multiaddr, "Listening for WebSocket connections");

        Ok(Self {
            transport,
            local_addr,
            multiaddr,
            incoming: AsyncMutex::new(incoming),
            shutdown,
            server: Mutex::new(Some(server)),
        })
    }

    /// Waits for the next inbound connection and runs the responder handshake.
    ///
    /// Connections refused by the gater are closed and skipped. Closing the
    /// listener abandons a handshake in progress.
    pub async fn accept(&self) -> Result<Connection> {
        loop {
            let conn: Arc<dyn ByteConn> = Arc::new(self.next_incoming().await?);
            let remote = to_multiaddr(conn.remote_addr());

            if let Some(gater) = self.transport.gater() {
                if !gater.intercept_accept(&self.multiaddr, &remote) {
                    debug!(%remote, "Inbound connection gated");
                    if let Err(err) = conn.close().await {
                        debug!(%remote, %err, "Failed to close gated connection");
                    }
                    continue;
                }
            }

            let connection = select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!(%remote, "Listener closed during handshake");
                    if let Err(err) = conn.close().await {
                        debug!(%remote, %err, "Failed to close abandoned connection");
                    }
                    return Err(Error::ListenerClosed);
                }
                connection = self.transport.upgrade(Arc::clone(&conn), Role::Responder) => connection?,
            };

            self.transport
                .check_secured(&connection, Direction::Inbound)
                .await?;

            return Ok(connection);
        }
    }

    /// Takes the next upgraded WebSocket. The queue is only locked while
    /// waiting, so concurrent accepts handshake independently.
    async fn next_incoming(&self) -> Result<WsConn<TcpStream>> {
        let mut incoming = select! {
            biased;
            () = self.shutdown.cancelled() => return Err(Error::ListenerClosed),
            incoming = self.incoming.lock() => incoming,
        };

        select! {
            biased;
            () = self.shutdown.cancelled() => Err(Error::ListenerClosed),
            conn = incoming.recv() => conn.ok_or(Error::ListenerClosed),
        }
    }

    /// Stops accepting and joins every task the listener started. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let server = self.server.lock().take();
        if let Some(server) = server {
            if let Err(err) = server.await {
                warn!(%err, "Listener task failed");
            }
            debug!(multiaddr=%self.multiaddr, "Listener closed");
        }

        // Upgraded connections nobody accepted.
        if let Ok(mut incoming) = self.incoming.try_lock() {
            while let Ok(conn) = incoming.try_recv() {
                if let Err(err) = conn.close().await {
                    debug!(%err, "Failed to close pending connection");
                }
            }
        }
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub const fn multiaddr(&self) -> &Multiaddr {
        &self.multiaddr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(
    listener: TcpListener,
    config: WebSocketConfig,
    incoming: mpsc::Sender<WsConn<TcpStream>>,
    shutdown: CancellationToken,
) {
    let config = Arc::new(config);
    let mut upgrades = JoinSet::new();

    loop {
        select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(result) = upgrades.join_next(), if !upgrades.is_empty() => {
                if let Err(err) = result {
                    warn!(%err, "Upgrade task failed");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((tcp, remote_addr)) => {
                    let _handle = upgrades.spawn(upgrade(
                        tcp,
                        remote_addr,
                        Arc::clone(&config),
                        incoming.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(%err, "Failed to accept TCP connection"),
            },
        }
    }

    upgrades.shutdown().await;
}

async fn upgrade(
    tcp: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<WebSocketConfig>,
    incoming: mpsc::Sender<WsConn<TcpStream>>,
    shutdown: CancellationToken,
) {
    let conn = select! {
        biased;
        () = shutdown.cancelled() => return,
        result = ws::accept(tcp, &config) => match result {
            Ok(conn) => conn,
            Err(err) => {
                debug!(%remote_addr, %err, "WebSocket upgrade failed");
                return;
            }
        },
    };

    let permit = select! {
        biased;
        () = shutdown.cancelled() => None,
        permit = incoming.reserve() => permit.ok(),
    };

    match permit {
        Some(permit) => permit.send(conn),
        None => {
            if let Err(err) = conn.close().await {
                debug!(%remote_addr, %err, "Failed to close connection of closed listener");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use libp2p_identity::Keypair;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::addr::dial_target;

    #[tokio::test]
    async fn test_close_abandons_handshake_in_progress() -> eyre::Result<()> {
        let transport = Transport::new(Keypair::generate_ed25519())?;
        let listener = Arc::new(transport.listen(&"/ip4/127.0.0.1/tcp/0/ws".parse()?).await?);

        // Completes the WebSocket upgrade, then never starts the handshake.
        let target = dial_target(listener.multiaddr())?;
        let silent = ws::connect(&target, &transport.config().websocket).await?;

        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };

        sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        listener.close().await;

        let accepted = timeout(Duration::from_secs(2), waiter).await??;
        assert!(matches!(accepted, Err(Error::ListenerClosed)));

        // The abandoned side was closed, so the silent peer reaches end of stream.
        timeout(Duration::from_secs(2), async {
            let mut buf = [0u8; 1024];
            while silent.read(&mut buf).await? != 0 {}
            Ok::<_, std::io::Error>(())
        })
        .await??;
        Ok(())
    }
}
