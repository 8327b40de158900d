/// Per-peer state machine
///
/// One task per peer owns the socket and all of its buffers. The
/// lifecycle runs Handshake -> Run -> Shutdown: version/verack exchange
/// with a 15 second deadline, then framed message dispatch with a one
/// second bookkeeping tick. An idle peer is pinged after 30 seconds and
/// dropped after 40; a getaddr refreshes the address book every ten
/// minutes.
///
/// Sends are correlated by promise id: the writer half resolves each
/// send's oneshot when the bytes hit the socket, and tear-down drops the
/// channel so every outstanding promise resolves to failure.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address_book::{now_seconds, AddressBook, PeerAddress};
use crate::block_oracle::BlockOracle;
use crate::constants::{chain_params, PROTOCOL_VERSION, USER_AGENT};
use crate::filter_db::{chain_filter_header, FilterOracle};
use crate::header_oracle::HeaderOracle;
use crate::messages::{
    Inventory, InventoryKind, Message, NetAddress, TimestampedAddress, VersionMessage,
};
use crate::types::{
    sha256d, AddressId, BlockHash, FilterFlavor, Hash, Height, Network, Position, Service,
};
use crate::wire::{read_frame, Frame, WireError};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const DISCONNECT_INTERVAL: Duration = Duration::from_secs(40);
const DOWNLOAD_ADDRESSES_INTERVAL: Duration = Duration::from_secs(600);
const HANDSHAKE_LIMIT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PeerState {
    Handshake,
    Run,
    Shutdown,
}

/// Requests the manager distributes to a peer
#[derive(Clone, Debug)]
pub enum PeerCommand {
    GetHeaders {
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    GetCfHeaders {
        flavor: FilterFlavor,
        start_height: u32,
        stop: BlockHash,
    },
    GetCfilters {
        flavor: FilterFlavor,
        start_height: u32,
        stop: BlockHash,
    },
    GetData(Vec<Inventory>),
}

/// Notifications a peer sends its manager
#[derive(Clone, Debug)]
pub enum PeerEvent {
    HandshakeComplete {
        peer_id: u64,
        services: BTreeSet<Service>,
        start_height: Height,
    },
    Disconnected {
        peer_id: u64,
    },
}

/// Shared handles every peer needs
#[derive(Clone)]
pub struct PeerContext {
    pub headers: Arc<HeaderOracle>,
    pub filters: Arc<FilterOracle>,
    pub blocks: Arc<BlockOracle>,
    pub address_book: Arc<AddressBook>,
}

/// Manager-side handle to a running peer task
pub struct PeerHandle {
    pub id: u64,
    pub address_id: AddressId,
    commands: mpsc::Sender<PeerCommand>,
    stop_tx: watch::Sender<bool>,
    done: Shared<BoxFuture<'static, ()>>,
    join: tokio::task::JoinHandle<()>,
}

impl PeerHandle {
    pub fn send_command(&self, command: PeerCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    /// Request cooperative shutdown; the returned future resolves when
    /// the task has finished. Await it with a timeout and call
    /// `force_abort` if the peer does not wind down in time.
    pub fn shutdown(&self) -> Shared<BoxFuture<'static, ()>> {
        let _ = self.stop_tx.send(true);
        self.done.clone()
    }

    pub fn force_abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Convert a stored address into a dialable socket address
pub fn socket_address(address: &PeerAddress) -> Option<SocketAddr> {
    let ip = match address.network {
        Network::Ipv4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&address.bytes);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        Network::Ipv6 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&address.bytes);
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, address.port))
}

/// Spawn a peer over a fresh TCP connection
pub fn spawn_peer(
    id: u64,
    address: PeerAddress,
    context: PeerContext,
    events: mpsc::Sender<PeerEvent>,
) -> PeerHandle {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let address_id = address.id();

    let join = tokio::spawn(async move {
        let endpoint = socket_address(&address);
        let result = match endpoint {
            Some(endpoint) => {
                trace!(peer = id, endpoint = %endpoint, "connecting");
                match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint)).await {
                    Ok(Ok(stream)) => {
                        let task = PeerTask::new(id, address, context, events.clone(), command_rx, stop_rx);
                        task.run(stream).await
                    }
                    Ok(Err(e)) => {
                        debug!(peer = id, error = %e, "connect failed");
                        Err(())
                    }
                    Err(_) => {
                        debug!(peer = id, "connect timed out");
                        Err(())
                    }
                }
            }
            None => {
                warn!(peer = id, "unsupported transport for outbound connection");
                Err(())
            }
        };
        let _ = result;
        let _ = events.send(PeerEvent::Disconnected { peer_id: id }).await;
        let _ = done_tx.send(());
    });

    let done: Shared<BoxFuture<'static, ()>> = async move {
        let _ = done_rx.await;
    }
    .boxed()
    .shared();

    PeerHandle {
        id,
        address_id,
        commands: command_tx,
        stop_tx,
        done,
        join,
    }
}

/// Spawn a peer over an existing duplex stream (tests drive the remote
/// end directly)
pub fn spawn_peer_on_stream<S>(
    id: u64,
    address: PeerAddress,
    context: PeerContext,
    events: mpsc::Sender<PeerEvent>,
    stream: S,
) -> PeerHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(64);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let address_id = address.id();

    let join = tokio::spawn(async move {
        let task = PeerTask::new(id, address, context, events.clone(), command_rx, stop_rx);
        let _ = task.run(stream).await;
        let _ = events.send(PeerEvent::Disconnected { peer_id: id }).await;
        let _ = done_tx.send(());
    });

    let done: Shared<BoxFuture<'static, ()>> = async move {
        let _ = done_rx.await;
    }
    .boxed()
    .shared();

    PeerHandle {
        id,
        address_id,
        commands: command_tx,
        stop_tx,
        done,
        join,
    }
}

type SendRequest = (Vec<u8>, oneshot::Sender<bool>);

struct PeerTask {
    id: u64,
    address: PeerAddress,
    context: PeerContext,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
    stop: watch::Receiver<bool>,
    magic: [u8; 4],
    state: PeerState,
    outgoing_handshake: bool,
    incoming_handshake: bool,
    version_nonce: u64,
    remote_services: BTreeSet<Service>,
    remote_start_height: Height,
    last_activity: Instant,
    last_address_download: Instant,
    started: Instant,
    /// Outstanding ping nonces and when they were sent
    pings: HashMap<u64, Instant>,
    /// Set when the peer broke the protocol; such peers do not get a
    /// lastConnected refresh on the way out
    protocol_violation: bool,
    send_tx: Option<mpsc::Sender<SendRequest>>,
}

impl PeerTask {
    fn new(
        id: u64,
        address: PeerAddress,
        context: PeerContext,
        events: mpsc::Sender<PeerEvent>,
        commands: mpsc::Receiver<PeerCommand>,
        stop: watch::Receiver<bool>,
    ) -> PeerTask {
        let chain = context.headers.chain();
        let now = Instant::now();
        PeerTask {
            id,
            address,
            context,
            events,
            commands,
            stop,
            magic: chain_params(chain).magic,
            state: PeerState::Handshake,
            outgoing_handshake: false,
            incoming_handshake: false,
            version_nonce: rand::random(),
            remote_services: BTreeSet::new(),
            remote_start_height: 0,
            last_activity: now,
            last_address_download: now,
            started: now,
            pings: HashMap::new(),
            protocol_violation: false,
            send_tx: None,
        }
    }

    async fn run<S>(mut self, stream: S) -> Result<(), ()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);

        let (send_tx, send_rx) = mpsc::channel::<SendRequest>(64);
        self.send_tx = Some(send_tx);
        let writer_task = tokio::spawn(write_loop(writer, send_rx));

        // Frames arrive through their own task: a read in progress is
        // never cancelled by the tick or command arms below, so a
        // partially-consumed frame cannot desync the stream.
        let (frame_tx, mut frames) = mpsc::channel::<Result<Frame, WireError>>(16);
        let reader_task = tokio::spawn(read_loop(reader, self.magic, frame_tx));

        self.send_version().await;

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stop = self.stop.clone();

        while self.state != PeerState::Shutdown {
            tokio::select! {
                frame = frames.recv() => {
                    match frame {
                        Some(Ok(frame)) => {
                            self.last_activity = Instant::now();
                            self.handle_frame(frame).await;
                        }
                        Some(Err(e)) if e.is_fatal() => {
                            debug!(peer = self.id, error = %e, "connection error");
                            if matches!(e, WireError::BadMagic(_) | WireError::OversizedPayload(_)) {
                                self.protocol_violation = true;
                            }
                            self.state = PeerState::Shutdown;
                        }
                        Some(Err(e)) => {
                            // Checksum and framing noise costs one frame
                            warn!(peer = self.id, error = %e, "dropping frame");
                        }
                        None => self.state = PeerState::Shutdown,
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => self.state = PeerState::Shutdown,
                    }
                }
                _ = stop.changed() => {
                    debug!(peer = self.id, "shutdown requested");
                    self.state = PeerState::Shutdown;
                }
            }
        }

        // Tear down: the send channel drop resolves outstanding promises
        // to failure, then the writer half closes the socket.
        reader_task.abort();
        self.send_tx = None;
        let _ = writer_task.await;

        if self.incoming_handshake && self.outgoing_handshake && !self.protocol_violation {
            self.update_address_activity().await;
        }
        info!(peer = self.id, address = %self.address.display(), "disconnected");
        Ok(())
    }

    // --- outbound ---

    /// Queue a frame; the returned promise resolves when the bytes are
    /// written, or to false when the peer is torn down first
    fn send_message(&self, message: &Message) -> oneshot::Receiver<bool> {
        let (promise_tx, promise_rx) = oneshot::channel();
        let frame = Frame::new(message.command(), message.encode());
        let bytes = frame.encode(self.magic);
        if let Some(send_tx) = &self.send_tx {
            if let Err(e) = send_tx.try_send((bytes, promise_tx)) {
                trace!(peer = self.id, error = %e, "outbound queue rejected frame");
            }
        }
        promise_rx
    }

    async fn send_version(&mut self) {
        let receiver = match self.address.network {
            Network::Ipv4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.address.bytes);
                NetAddress::from_ipv4(0, octets, self.address.port)
            }
            _ => {
                let mut bytes = [0u8; 16];
                if self.address.bytes.len() == 16 {
                    bytes.copy_from_slice(&self.address.bytes);
                }
                NetAddress::from_ipv6(0, bytes, self.address.port)
            }
        };
        let local_services: BTreeSet<Service> = BTreeSet::new();
        let version = Message::Version(VersionMessage {
            version: PROTOCOL_VERSION as i32,
            services: Service::mask(&local_services),
            timestamp: now_seconds(),
            receiver,
            sender: NetAddress::from_ipv4(0, [127, 0, 0, 1], 0),
            nonce: self.version_nonce,
            user_agent: USER_AGENT.to_string(),
            start_height: self.context.headers.best_chain().height as i32,
            relay: true,
        });
        let _ = self.send_message(&version);
    }

    async fn request_headers(&mut self) {
        let headers = self.context.headers.clone();
        let locator = match tokio::task::spawn_blocking(move || headers.recent_hashes()).await {
            Ok(Ok(locator)) => locator,
            _ => Vec::new(),
        };
        let message = Message::GetHeaders {
            version: PROTOCOL_VERSION,
            locator,
            stop: Hash::ZERO,
        };
        let _ = self.send_message(&message);
    }

    async fn request_addresses(&mut self) {
        self.last_address_download = Instant::now();
        let _ = self.send_message(&Message::GetAddr);
    }

    // --- timers ---

    async fn tick(&mut self) {
        match self.state {
            PeerState::Handshake => {
                if self.started.elapsed() >= HANDSHAKE_LIMIT {
                    debug!(peer = self.id, "handshake timed out");
                    self.state = PeerState::Shutdown;
                }
            }
            PeerState::Run => {
                let idle = self.last_activity.elapsed();
                if idle >= DISCONNECT_INTERVAL {
                    debug!(peer = self.id, "peer idle past limit");
                    self.state = PeerState::Shutdown;
                    return;
                }
                if idle >= PING_INTERVAL && self.pings.is_empty() {
                    let nonce: u64 = rand::random();
                    self.pings.insert(nonce, Instant::now());
                    let _ = self.send_message(&Message::Ping(nonce));
                }
                if self.last_address_download.elapsed() >= DOWNLOAD_ADDRESSES_INTERVAL {
                    self.request_addresses().await;
                }
            }
            PeerState::Shutdown => {}
        }
    }

    // --- inbound ---

    async fn handle_frame(&mut self, frame: Frame) {
        let command = frame.command_str();
        let message = match Message::decode(&command, &frame.payload) {
            Ok(message) => message,
            Err(WireError::UnknownCommand(cmd)) => {
                warn!(peer = self.id, command = %cmd, "ignoring unknown command");
                return;
            }
            Err(e) => {
                if command == "version" {
                    // A peer that cannot even introduce itself is done
                    debug!(peer = self.id, error = %e, "malformed version message");
                    self.protocol_violation = true;
                    self.state = PeerState::Shutdown;
                } else {
                    warn!(peer = self.id, command = %command, error = %e, "dropping malformed message");
                }
                return;
            }
        };

        match message {
            Message::Version(version) => self.handle_version(version).await,
            Message::Verack => {
                self.outgoing_handshake = true;
                self.check_handshake().await;
            }
            Message::Ping(nonce) => {
                let _ = self.send_message(&Message::Pong(nonce));
            }
            Message::Pong(nonce) => {
                if self.pings.remove(&nonce).is_none() {
                    trace!(peer = self.id, nonce, "unsolicited pong");
                }
            }
            Message::Addr(entries) => self.handle_addresses(entries).await,
            Message::Headers(raw) => self.handle_headers(raw).await,
            Message::CfHeaders {
                filter_type,
                stop,
                previous,
                hashes,
            } => self.handle_cfheaders(filter_type, stop, previous, hashes).await,
            Message::Cfilter {
                filter_type,
                block,
                filter,
            } => self.handle_cfilter(filter_type, block, filter).await,
            Message::Inv(items) => self.handle_inv(items),
            Message::Block(raw) => self.handle_block(raw).await,
            Message::NotFound(items) => {
                debug!(peer = self.id, count = items.len(), "peer reported missing data");
            }
            Message::GetAddr
            | Message::GetHeaders { .. }
            | Message::GetData(_)
            | Message::GetCfHeaders { .. }
            | Message::GetCfilters { .. }
            | Message::GetCfCheckpt { .. }
            | Message::CfCheckpt { .. }
            | Message::Mempool
            | Message::FilterLoad { .. }
            | Message::FilterAdd(_)
            | Message::FilterClear
            | Message::SendHeaders => {
                trace!(peer = self.id, command = %command, "ignoring serving-side request");
            }
        }
    }

    async fn handle_version(&mut self, version: VersionMessage) {
        if version.nonce == self.version_nonce {
            info!(peer = self.id, "connected to self, disconnecting");
            self.state = PeerState::Shutdown;
            return;
        }
        self.remote_services = Service::from_mask(version.services);
        self.remote_start_height = Height::from(version.start_height);
        self.incoming_handshake = true;
        let _ = self.send_message(&Message::Verack);
        self.check_handshake().await;
    }

    async fn check_handshake(&mut self) {
        if !(self.incoming_handshake && self.outgoing_handshake) {
            return;
        }
        if self.state != PeerState::Handshake {
            return;
        }
        self.state = PeerState::Run;
        self.update_address_activity().await;

        info!(
            peer = self.id,
            chain = %self.context.headers.chain(),
            address = %self.address.display(),
            services = ?self.remote_services,
            "connected to peer"
        );

        let _ = self
            .events
            .send(PeerEvent::HandshakeComplete {
                peer_id: self.id,
                services: self.remote_services.clone(),
                start_height: self.remote_start_height,
            })
            .await;

        self.request_headers().await;
        self.request_addresses().await;
    }

    /// Refresh this peer's address book record. The store write runs on
    /// the blocking pool; the task waits so the record lands before the
    /// next frame is processed.
    async fn update_address_activity(&mut self) {
        self.address.set_last_connected(now_seconds());
        self.address.set_services(self.remote_services.clone());

        let book = self.context.address_book.clone();
        let address = self.address.clone();
        match tokio::task::spawn_blocking(move || book.add_or_update(&address)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer = self.id, error = %e, "failed to update peer address record");
            }
            Err(e) => warn!(peer = self.id, error = %e, "address update task failed"),
        }
    }

    async fn handle_addresses(&mut self, entries: Vec<TimestampedAddress>) {
        let chain = self.context.headers.chain();
        let protocol = chain_params(chain).p2p_protocol;
        let mut imported = Vec::new();
        for entry in entries {
            let (network, bytes) = entry.address.network_and_bytes();
            let services = Service::from_mask(entry.address.services);
            match PeerAddress::new(
                protocol,
                network,
                bytes,
                entry.address.port,
                chain,
                0,
                services,
            ) {
                Ok(address) => imported.push(address),
                Err(e) => trace!(peer = self.id, error = %e, "skipping gossiped address"),
            }
        }

        let book = self.context.address_book.clone();
        match tokio::task::spawn_blocking(move || book.import(imported)).await {
            Ok(Ok(count)) if count > 0 => {
                debug!(peer = self.id, count, "imported gossiped addresses");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(peer = self.id, error = %e, "address import failed"),
            Err(e) => warn!(peer = self.id, error = %e, "address import task failed"),
        }
    }

    async fn handle_headers(&mut self, raw: Vec<Vec<u8>>) {
        let count = raw.len();
        let headers = self.context.headers.clone();
        match tokio::task::spawn_blocking(move || headers.add_wire_headers(&raw)).await {
            Ok(Ok(outcome)) if outcome.rejected > 0 => {
                // Consensus-invalid data: drop the peer, keep the batch's
                // valid remainder
                info!(
                    peer = self.id,
                    rejected = outcome.rejected,
                    "peer sent invalid headers, disconnecting"
                );
                self.state = PeerState::Shutdown;
            }
            Ok(Ok(outcome)) => {
                trace!(peer = self.id, received = count, accepted = outcome.accepted, "processed headers");
            }
            Ok(Err(e)) => {
                warn!(peer = self.id, error = %e, "header processing failed");
            }
            Err(e) => warn!(peer = self.id, error = %e, "header task failed"),
        }
    }

    fn flavor_for_wire(&self, filter_type: u8) -> Option<FilterFlavor> {
        self.context
            .filters
            .flavors()
            .iter()
            .copied()
            .find(|flavor| flavor.wire_byte() == filter_type)
    }

    async fn handle_cfheaders(
        &mut self,
        filter_type: u8,
        stop: BlockHash,
        previous: Hash,
        hashes: Vec<Hash>,
    ) {
        let flavor = match self.flavor_for_wire(filter_type) {
            Some(flavor) => flavor,
            None => {
                trace!(peer = self.id, filter_type, "unsupported filter type");
                return;
            }
        };
        if hashes.is_empty() {
            return;
        }

        let headers = self.context.headers.clone();
        let filters = self.context.filters.clone();
        let peer = self.id;
        let task = tokio::task::spawn_blocking(move || {
            let stop_header = match headers.load_header(&stop) {
                Ok(Some(header)) => header,
                _ => {
                    debug!(peer, stop = %stop.short(), "cfheaders for unknown block");
                    return;
                }
            };

            let first_height = stop_header.height - (hashes.len() as Height - 1);
            if first_height < 0 {
                debug!(peer, "cfheaders batch reaches below genesis");
                return;
            }

            // Rebuild the chained headers from previous + hashes; this is
            // the verification and the stored material in one pass
            let mut rows = Vec::with_capacity(hashes.len());
            let mut running = previous;
            let mut height = first_height;
            for filter_hash in &hashes {
                let block = match headers.best_hash(height) {
                    Ok(Some(hash)) => hash,
                    _ => {
                        debug!(peer, height, "cfheaders past best chain");
                        return;
                    }
                };
                running = chain_filter_header(filter_hash, &running);
                rows.push((Position::new(height, block), *filter_hash, running));
                height += 1;
            }

            if let Err(e) = filters.store_filter_headers(flavor, &rows) {
                warn!(peer, error = %e, "failed to store filter headers");
            }
        });
        if let Err(e) = task.await {
            warn!(peer = self.id, error = %e, "cfheaders task failed");
        }
    }

    async fn handle_cfilter(&mut self, filter_type: u8, block: BlockHash, filter: Vec<u8>) {
        let flavor = match self.flavor_for_wire(filter_type) {
            Some(flavor) => flavor,
            None => return,
        };

        let headers = self.context.headers.clone();
        let filters = self.context.filters.clone();
        let peer = self.id;
        let task = tokio::task::spawn_blocking(move || {
            let header = match headers.load_header(&block) {
                Ok(Some(header)) => header,
                _ => {
                    debug!(peer, block = %block.short(), "cfilter for unknown block");
                    return;
                }
            };
            let position = Position::new(header.height, block);
            if let Err(e) = filters.store_filters(flavor, &[(position, filter)]) {
                warn!(peer, error = %e, "failed to store filter");
            }
        });
        if let Err(e) = task.await {
            warn!(peer = self.id, error = %e, "cfilter task failed");
        }
    }

    fn handle_inv(&mut self, items: Vec<Inventory>) {
        let blocks: Vec<Inventory> = items
            .into_iter()
            .filter(|item| matches!(item.kind, InventoryKind::Block))
            .collect();
        if blocks.is_empty() {
            return;
        }
        trace!(peer = self.id, count = blocks.len(), "requesting announced blocks");
        let _ = self.send_message(&Message::GetData(blocks));
    }

    async fn handle_block(&mut self, raw: Vec<u8>) {
        if raw.len() < 80 {
            warn!(peer = self.id, size = raw.len(), "runt block payload");
            return;
        }
        let hash = sha256d(&raw[..80]);
        let blocks = self.context.blocks.clone();
        match tokio::task::spawn_blocking(move || blocks.submit(&hash, &raw)).await {
            Ok(Ok(())) => trace!(peer = self.id, block = %hash.short(), "stored block"),
            Ok(Err(e)) => {
                warn!(peer = self.id, block = %hash.short(), error = %e, "failed to store block");
            }
            Err(e) => warn!(peer = self.id, error = %e, "block store task failed"),
        }
    }

    // --- manager requests ---

    async fn handle_command(&mut self, command: PeerCommand) {
        let message = match command {
            PeerCommand::GetHeaders { locator, stop } => Message::GetHeaders {
                version: PROTOCOL_VERSION,
                locator,
                stop,
            },
            PeerCommand::GetCfHeaders {
                flavor,
                start_height,
                stop,
            } => Message::GetCfHeaders {
                filter_type: flavor.wire_byte(),
                start_height,
                stop,
            },
            PeerCommand::GetCfilters {
                flavor,
                start_height,
                stop,
            } => Message::GetCfilters {
                filter_type: flavor.wire_byte(),
                start_height,
                stop,
            },
            PeerCommand::GetData(items) => Message::GetData(items),
        };
        let _ = self.send_message(&message);
    }
}

/// Reader half: frames (and frame errors) flow to the state machine
/// through a channel. Ends on a fatal error or when the receiver drops.
async fn read_loop<R>(
    mut reader: ReadHalf<R>,
    magic: [u8; 4],
    frames: mpsc::Sender<Result<Frame, WireError>>,
) where
    R: AsyncRead,
{
    loop {
        let result = read_frame(&mut reader, magic).await;
        let fatal = result.as_ref().err().map(WireError::is_fatal).unwrap_or(false);
        if frames.send(result).await.is_err() || fatal {
            break;
        }
    }
}

/// Writer half: drains the outbound queue, resolving each send promise.
/// Ends when the queue closes or a write fails.
async fn write_loop<W>(mut writer: WriteHalf<W>, mut queue: mpsc::Receiver<SendRequest>)
where
    W: AsyncWrite,
{
    while let Some((bytes, promise)) = queue.recv().await {
        let ok = writer.write_all(&bytes).await.is_ok() && writer.flush().await.is_ok();
        let _ = promise.send(ok);
        if !ok {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_book::tests::TABLES as PEER_TABLES;
    use crate::blockstore::{BlockStore, TABLE_BLOCK_INDEX};
    use crate::database::TABLE_CONFIG;
    use crate::header_db::{tests::TABLES as HEADER_TABLES, HeaderDb};
    use crate::reorg::reorg_channel;
    use crate::store::{Store, TableKind, TableSpec};
    use crate::types::{BlockStoragePolicy, ChainKind, Protocol};
    use crate::wire::write_frame;
    use tempfile::TempDir;

    fn all_tables() -> Vec<TableSpec> {
        let mut tables = vec![
            TableSpec::new(TABLE_CONFIG, TableKind::IntegerKey),
            TableSpec::new(TABLE_BLOCK_INDEX, TableKind::Plain),
        ];
        tables.extend_from_slice(HEADER_TABLES);
        tables.extend_from_slice(crate::filter_db::tests::TABLES);
        tables.extend_from_slice(PEER_TABLES);
        tables
    }

    fn test_context(dir: &TempDir) -> PeerContext {
        let tables = all_tables();
        let store = Arc::new(Store::open(&dir.path().join("kv"), &tables).unwrap());
        let (reorg_tx, _reorg_rx) = reorg_channel(16);
        let headers = Arc::new(HeaderOracle::new(Arc::new(
            HeaderDb::open(store.clone(), ChainKind::UnitTest, reorg_tx).unwrap(),
        )));
        let filters = Arc::new(
            FilterOracle::open(
                store.clone(),
                ChainKind::UnitTest,
                vec![FilterFlavor::BasicBip158],
            )
            .unwrap(),
        );
        let blocks = Arc::new(BlockOracle::new(
            Arc::new(
                BlockStore::open(
                    store.clone(),
                    &dir.path().join("blocks"),
                    4096,
                    BlockStoragePolicy::All,
                )
                .unwrap(),
            ),
            crate::block_oracle::DEFAULT_CACHE_LIMIT,
        ));
        let address_book = Arc::new(AddressBook::open(store).unwrap());
        PeerContext {
            headers,
            filters,
            blocks,
            address_book,
        }
    }

    fn loopback_address() -> PeerAddress {
        PeerAddress::new(
            Protocol::Bitcoin,
            Network::Ipv4,
            vec![127, 0, 0, 1],
            18444,
            ChainKind::UnitTest,
            0,
            BTreeSet::new(),
        )
        .unwrap()
    }

    fn remote_version(nonce: u64) -> Message {
        Message::Version(VersionMessage {
            version: PROTOCOL_VERSION as i32,
            services: Service::CompactFilters.bit() | Service::Network.bit(),
            timestamp: now_seconds(),
            receiver: NetAddress::from_ipv4(0, [127, 0, 0, 1], 0),
            sender: NetAddress::from_ipv4(0, [127, 0, 0, 1], 18444),
            nonce,
            user_agent: "/other:1.0/".to_string(),
            start_height: 0,
            relay: true,
        })
    }

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[tokio::test]
    async fn test_handshake_completes_and_requests_follow() {
        let dir = TempDir::new().unwrap();
        let context = test_context(&dir);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (local, remote) = tokio::io::duplex(64 * 1024);

        let handle =
            spawn_peer_on_stream(1, loopback_address(), context, event_tx, local);

        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        // Peer opens with its version message
        let frame = read_frame(&mut remote_read, MAGIC).await.unwrap();
        assert_eq!(frame.command_str(), "version");
        let our_version = Message::decode("version", &frame.payload).unwrap();
        let remote_nonce = match our_version {
            Message::Version(v) => v.nonce.wrapping_add(1),
            _ => unreachable!(),
        };

        // Respond with version + verack
        write_frame(
            &mut remote_write,
            MAGIC,
            "version",
            &remote_version(remote_nonce).encode(),
        )
        .await
        .unwrap();
        write_frame(&mut remote_write, MAGIC, "verack", &[]).await.unwrap();

        // Handshake event arrives with advertised services
        let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            PeerEvent::HandshakeComplete { peer_id, services, .. } => {
                assert_eq!(peer_id, 1);
                assert!(services.contains(&Service::CompactFilters));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Peer acks our version and immediately asks for headers and
        // addresses
        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame = read_frame(&mut remote_read, MAGIC).await.unwrap();
            seen.push(frame.command_str());
        }
        assert!(seen.contains(&"verack".to_string()));
        assert!(seen.contains(&"getheaders".to_string()));
        assert!(seen.contains(&"getaddr".to_string()));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let dir = TempDir::new().unwrap();
        let context = test_context(&dir);
        let (event_tx, mut _event_rx) = mpsc::channel(16);
        let (local, remote) = tokio::io::duplex(64 * 1024);

        let handle =
            spawn_peer_on_stream(2, loopback_address(), context, event_tx, local);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        // Complete the handshake
        let frame = read_frame(&mut remote_read, MAGIC).await.unwrap();
        assert_eq!(frame.command_str(), "version");
        write_frame(&mut remote_write, MAGIC, "version", &remote_version(7).encode())
            .await
            .unwrap();
        write_frame(&mut remote_write, MAGIC, "verack", &[]).await.unwrap();

        // Drain verack/getheaders/getaddr
        for _ in 0..3 {
            read_frame(&mut remote_read, MAGIC).await.unwrap();
        }

        write_frame(&mut remote_write, MAGIC, "ping", &Message::Ping(99).encode())
            .await
            .unwrap();
        let frame = tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(&mut remote_read, MAGIC),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(frame.command_str(), "pong");
        assert_eq!(Message::decode("pong", &frame.payload).unwrap(), Message::Pong(99));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_connection_detected() {
        let dir = TempDir::new().unwrap();
        let context = test_context(&dir);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (local, remote) = tokio::io::duplex(64 * 1024);

        let _handle =
            spawn_peer_on_stream(3, loopback_address(), context, event_tx, local);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        // Echo the peer's own nonce back
        let frame = read_frame(&mut remote_read, MAGIC).await.unwrap();
        let nonce = match Message::decode("version", &frame.payload).unwrap() {
            Message::Version(v) => v.nonce,
            _ => unreachable!(),
        };
        write_frame(
            &mut remote_write,
            MAGIC,
            "version",
            &remote_version(nonce).encode(),
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PeerEvent::Disconnected { peer_id: 3 }));
    }

    #[tokio::test]
    async fn test_shutdown_future_is_shared() {
        let dir = TempDir::new().unwrap();
        let context = test_context(&dir);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (local, _remote) = tokio::io::duplex(64 * 1024);

        let handle =
            spawn_peer_on_stream(4, loopback_address(), context, event_tx, local);

        let first = handle.shutdown();
        let second = handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), async {
            first.await;
            second.await;
        })
        .await
        .unwrap();
        assert!(handle.is_finished());
    }
}
