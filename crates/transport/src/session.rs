//! Channel multiplexing over an established secure channel.
//!
//! A session owns two tasks: the reader demultiplexes inbound packets onto
//! channels and queues, the writer encrypts and sends outbound packets in the
//! order they were queued. Either task failing terminates the whole session.

use core::mem;
use core::time::Duration;
use std::collections::hash_map::{Entry, HashMap};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use snow::StatelessTransportState;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::MuxConfig;
use crate::error::{ChannelOpenError, Error};
use crate::handshake::{RecordReader, RecordWriter, MAX_RECORD_PLAINTEXT};
use crate::ws::ByteConn;

mod channel;
mod codec;
mod packet;

pub(crate) use channel::ChannelState;
use codec::{PacketReader, PacketWriter};
pub use packet::OpenFailureReason;
pub(crate) use packet::Packet;

/// How long `close` waits for queued packets to reach the wire.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct Session {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Inbound work the session hands to its owner.
pub(crate) struct Incoming {
    pub channels: mpsc::Receiver<NewChannel>,
    pub requests: mpsc::Receiver<GlobalRequest>,
}

pub(crate) struct Shared {
    outbound: mpsc::UnboundedSender<Packet>,
    channels: Mutex<Channels>,
    pending_replies: Mutex<VecDeque<oneshot::Sender<Option<Vec<u8>>>>>,
    shutdown: CancellationToken,
    conn: Arc<dyn ByteConn>,
    config: MuxConfig,
}

#[derive(Default)]
struct Channels {
    next_id: u32,
    slots: HashMap<u32, Slot>,
}

type OpenReply = Result<Arc<ChannelState>, ChannelOpenError>;

enum Slot {
    Opening(oneshot::Sender<OpenReply>),
    Open(Arc<ChannelState>),
}

impl Channels {
    fn next_free_id(&self) -> u32 {
        let mut id = self.next_id;
        while self.slots.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        id
    }

    fn insert(&mut self, id: u32, slot: Slot) {
        self.next_id = id.wrapping_add(1);
        let _previous = self.slots.insert(id, slot);
    }
}

impl Session {
    pub(crate) fn new(
        conn: Arc<dyn ByteConn>,
        noise: StatelessTransportState,
        reader: RecordReader,
        writer: RecordWriter,
        config: MuxConfig,
    ) -> (Self, Incoming) {
        let noise = Arc::new(noise);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (channels_tx, channels) = mpsc::channel(config.offer_queue);
        let (requests_tx, requests) = mpsc::channel(config.request_queue);

        let shared = Arc::new(Shared {
            outbound,
            channels: Mutex::default(),
            pending_replies: Mutex::default(),
            shutdown: CancellationToken::new(),
            conn,
            config,
        });

        let reader = spawn(read_loop(
            Arc::clone(&shared),
            PacketReader::new(reader, Arc::clone(&noise)),
            channels_tx,
            requests_tx,
        ));
        let writer = spawn(write_loop(
            Arc::clone(&shared),
            PacketWriter::new(writer, noise),
            outbound_rx,
        ));

        let session = Self {
            shared,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        };

        (session, Incoming { channels, requests })
    }

    /// Cancelled once the session has terminated, for whatever reason.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Opens a channel of `kind` and waits for the remote to confirm it.
    pub(crate) async fn open_channel(
        &self,
        kind: &str,
        extra: Vec<u8>,
    ) -> Result<Arc<ChannelState>, Error> {
        let shared = &self.shared;
        let (tx, rx) = oneshot::channel();

        let mut open = Packet::ChannelOpen {
            kind: kind.to_owned(),
            sender: 0,
            window: shared.config.window_size,
            max_packet: shared.config.max_packet,
            extra,
        };
        ensure_fits(&open)?;

        let id = {
            let mut channels = shared.channels.lock();
            if shared.shutdown.is_cancelled() {
                return Err(Error::ConnectionClosed);
            }
            let id = channels.next_free_id();
            channels.insert(id, Slot::Opening(tx));
            id
        };

        if let Packet::ChannelOpen { sender, .. } = &mut open {
            *sender = id;
        }
        if let Err(err) = shared.send(open) {
            let _slot = shared.channels.lock().slots.remove(&id);
            return Err(err);
        }

        select! {
            biased;
            reply = rx => match reply {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Err(Error::ConnectionClosed),
            },
            () = shared.shutdown.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// Sends a connection-scoped request.
    ///
    /// With `want_reply`, waits for the remote's answer: `Some(payload)` on
    /// success, [`Error::RequestRejected`] on failure. Otherwise returns `None`
    /// as soon as the request is queued.
    pub(crate) async fn request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let shared = &self.shared;
        let packet = Packet::GlobalRequest {
            name: name.to_owned(),
            want_reply,
            payload,
        };
        ensure_fits(&packet)?;

        if !want_reply {
            shared.send(packet)?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        {
            // Replies are matched in order, so queue the waiter together with the send.
            let mut pending = shared.pending_replies.lock();
            shared.send(packet)?;
            pending.push_back(tx);
        }

        select! {
            biased;
            reply = rx => match reply {
                Ok(Some(payload)) => Ok(Some(payload)),
                Ok(None) => Err(Error::RequestRejected(name.to_owned())),
                Err(_) => Err(Error::ConnectionClosed),
            },
            () = shared.shutdown.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// Terminates the session, flushes what was already queued, closes the
    /// byte stream and joins both tasks.
    pub(crate) async fn close(&self) -> io::Result<()> {
        self.shared.terminate();

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            match timeout(DRAIN_TIMEOUT, &mut writer).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "Session writer task failed"),
                Err(_) => {
                    debug!("Timed out flushing outbound packets");
                    writer.abort();
                }
            }
        }

        let result = self.shared.conn.close().await;

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(err) = reader.await {
                warn!(%err, "Session reader task failed");
            }
        }

        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn send(&self, packet: Packet) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        self.outbound
            .send(packet)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Releases everything waiting on the session. Idempotent.
    fn terminate(&self) {
        self.shutdown.cancel();

        let slots = mem::take(&mut self.channels.lock().slots);
        for slot in slots.into_values() {
            // Dropping an opening slot wakes its waiter with `ConnectionClosed`.
            if let Slot::Open(channel) = slot {
                channel.kill();
            }
        }

        self.pending_replies.lock().clear();
    }

    fn remove(&self, id: u32) {
        let mut channels = self.channels.lock();
        if let Entry::Occupied(entry) = channels.slots.entry(id) {
            if matches!(entry.get(), Slot::Open(_)) {
                let _slot = entry.remove();
            }
        }
    }

    fn channel(&self, id: u32) -> io::Result<Arc<ChannelState>> {
        match self.channels.lock().slots.get(&id) {
            Some(Slot::Open(channel)) => Ok(Arc::clone(channel)),
            _ => Err(violation(format!("packet for unknown channel {id}"))),
        }
    }

    fn take_opening(&self, id: u32) -> io::Result<oneshot::Sender<OpenReply>> {
        let mut channels = self.channels.lock();
        match channels.slots.entry(id) {
            Entry::Occupied(entry) if matches!(entry.get(), Slot::Opening(_)) => {
                match entry.remove() {
                    Slot::Opening(waiter) => Ok(waiter),
                    Slot::Open(_) => Err(violation(format!("channel {id} is already open"))),
                }
            }
            _ => Err(violation(format!("open reply for unknown channel {id}"))),
        }
    }

    fn complete_request(&self, reply: Option<Vec<u8>>) -> io::Result<()> {
        let waiter = self
            .pending_replies
            .lock()
            .pop_front()
            .ok_or_else(|| violation("request reply without a pending request".to_owned()))?;

        // The requester may have given up waiting.
        let _ignored = waiter.send(reply);
        Ok(())
    }

    async fn dispatch(
        self: &Arc<Self>,
        packet: Packet,
        channels: &mpsc::Sender<NewChannel>,
        requests: &mpsc::Sender<GlobalRequest>,
    ) -> io::Result<()> {
        match packet {
            Packet::GlobalRequest {
                name,
                want_reply,
                payload: _,
            } => {
                let request = GlobalRequest {
                    name,
                    want_reply,
                    shared: Arc::clone(self),
                };

                select! {
                    biased;
                    () = self.shutdown.cancelled() => {}
                    result = requests.send(request) => {
                        if let Err(SendError(request)) = result {
                            let _ignored = request.reply(false);
                        }
                    }
                }
            }
            Packet::RequestSuccess { payload } => self.complete_request(Some(payload))?,
            Packet::RequestFailure => self.complete_request(None)?,
            Packet::ChannelOpen {
                kind,
                sender,
                window,
                max_packet,
                extra: _,
            } => {
                let offer = NewChannel {
                    kind,
                    remote_id: sender,
                    window,
                    max_packet,
                    shared: Arc::clone(self),
                };

                match channels.try_send(offer) {
                    Ok(()) => {}
                    Err(TrySendError::Full(offer)) => {
                        debug!(kind=%offer.kind, "Channel offer queue is full, rejecting");
                        let _ignored = offer.reject(
                            OpenFailureReason::ResourceShortage,
                            "too many pending channel offers",
                        );
                    }
                    Err(TrySendError::Closed(offer)) => {
                        let _ignored = offer.reject(
                            OpenFailureReason::AdministrativelyProhibited,
                            "not accepting channels",
                        );
                    }
                }
            }
            Packet::ChannelOpenConfirm {
                recipient,
                sender,
                window,
                max_packet,
            } => {
                let waiter = self.take_opening(recipient)?;
                let channel =
                    ChannelState::new(recipient, sender, window, max_packet, Arc::clone(self));

                {
                    let mut channels = self.channels.lock();
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    channels.insert(recipient, Slot::Open(Arc::clone(&channel)));
                }

                if let Err(Ok(channel)) = waiter.send(Ok(channel)) {
                    // The opener went away before the confirmation arrived.
                    let _ignored = channel.close();
                }
            }
            Packet::ChannelOpenFailure {
                recipient,
                reason,
                description,
            } => {
                let waiter = self.take_opening(recipient)?;
                let _ignored = waiter.send(Err(ChannelOpenError {
                    reason,
                    description,
                }));
            }
            Packet::ChannelWindowAdjust { recipient, bytes } => {
                self.channel(recipient)?.grant(bytes)?;
            }
            Packet::ChannelData { recipient, data } => {
                self.channel(recipient)?.receive(data)?;
            }
            Packet::ChannelEof { recipient } => self.channel(recipient)?.remote_eof(),
            Packet::ChannelClose { recipient } => self.channel(recipient)?.remote_close(),
            Packet::ChannelRequest {
                recipient,
                name,
                want_reply,
                payload: _,
            } => {
                let channel = self.channel(recipient)?;
                trace!(channel=%recipient, %name, "Discarding channel request");
                if want_reply {
                    channel.send_failure();
                }
            }
            Packet::ChannelSuccess { recipient } | Packet::ChannelFailure { recipient } => {
                trace!(channel=%recipient, "Ignoring unsolicited channel request reply");
            }
        }

        Ok(())
    }
}

/// Fails packets the writer could never put into a single record, so that one
/// oversized caller payload does not terminate the whole session.
fn ensure_fits(packet: &Packet) -> Result<(), Error> {
    let size = borsh::object_length(packet)?;
    if size > MAX_RECORD_PLAINTEXT {
        return Err(Error::PayloadTooLarge {
            size,
            max: MAX_RECORD_PLAINTEXT,
        });
    }
    Ok(())
}

fn violation(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: PacketReader,
    channels: mpsc::Sender<NewChannel>,
    requests: mpsc::Sender<GlobalRequest>,
) {
    loop {
        let packet = select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            packet = reader.next() => packet,
        };

        match packet {
            Ok(Some(packet)) => {
                if let Err(err) = shared.dispatch(packet, &channels, &requests).await {
                    warn!(%err, "Protocol violation, terminating session");
                    break;
                }
            }
            Ok(None) => {
                debug!("Remote closed the connection");
                break;
            }
            Err(err) => {
                debug!(%err, "Failed to read packet, terminating session");
                break;
            }
        }
    }

    shared.terminate();
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: PacketWriter,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
) {
    loop {
        let packet = select! {
            biased;
            packet = outbound.recv() => packet,
            () = shared.shutdown.cancelled() => None,
        };

        let Some(packet) = packet else {
            break;
        };

        if let Err(err) = writer.send(&packet).await {
            debug!(%err, "Failed to write packet, terminating session");
            shared.terminate();
            return;
        }
    }

    while let Ok(packet) = outbound.try_recv() {
        if let Err(err) = writer.send(&packet).await {
            debug!(%err, "Failed to flush packet on shutdown");
            break;
        }
    }
}

/// A channel offered by the remote, awaiting a decision.
pub(crate) struct NewChannel {
    kind: String,
    remote_id: u32,
    window: u32,
    max_packet: u32,
    shared: Arc<Shared>,
}

impl NewChannel {
    pub(crate) fn kind(&self) -> &str {
        &self.kind
    }

    pub(crate) fn accept(self) -> Result<Arc<ChannelState>, Error> {
        let shared = self.shared;
        let mut channels = shared.channels.lock();
        if shared.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let id = channels.next_free_id();
        let channel = ChannelState::new(
            id,
            self.remote_id,
            self.window,
            self.max_packet,
            Arc::clone(&shared),
        );
        channels.insert(id, Slot::Open(Arc::clone(&channel)));

        shared.send(Packet::ChannelOpenConfirm {
            recipient: self.remote_id,
            sender: id,
            window: shared.config.window_size,
            max_packet: shared.config.max_packet,
        })?;

        Ok(channel)
    }

    pub(crate) fn reject(
        self,
        reason: OpenFailureReason,
        description: impl Into<String>,
    ) -> Result<(), Error> {
        self.shared.send(Packet::ChannelOpenFailure {
            recipient: self.remote_id,
            reason,
            description: description.into(),
        })
    }
}

/// A connection-scoped request from the remote.
pub(crate) struct GlobalRequest {
    name: String,
    want_reply: bool,
    shared: Arc<Shared>,
}

impl GlobalRequest {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Answers the request. Does nothing if the remote did not ask for a reply.
    pub(crate) fn reply(self, accepted: bool) -> Result<(), Error> {
        if !self.want_reply {
            return Ok(());
        }

        let packet = if accepted {
            Packet::RequestSuccess {
                payload: Vec::new(),
            }
        } else {
            Packet::RequestFailure
        };

        self.shared.send(packet)
    }
}
