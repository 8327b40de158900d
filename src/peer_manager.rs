/// Peer lifecycle management
///
/// Keeps the peer set at its target size. Candidates are chosen in
/// order: the configured seed node (when set, valid, and not already
/// connected), then the address book filtered by preferred services,
/// then a resolved DNS seed, then the address book with no service
/// filter. Peers that reach Shutdown are reaped on the next tick.
///
/// An empty seed string leaves the manager in listen-only mode: no
/// outbound connections are attempted. An unparseable seed string only
/// disables the seed-node rung of the ladder.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::address_book::PeerAddress;
use crate::constants::chain_params;
use crate::peer::{spawn_peer, PeerCommand, PeerContext, PeerEvent, PeerHandle};
use crate::types::{AddressId, BlockStoragePolicy, ChainKind, Network, Service};

const TICK: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct PeerManagerConfig {
    pub chain: ChainKind,
    pub target_peer_count: usize,
    /// Dotted-quad seed node; empty disables outbound dialing
    pub seed_node: String,
}

/// Parse the configured seed string. `Ok(None)` means listen-only;
/// `Err(())` means the string was present but unusable.
fn parse_seed(seed: &str) -> Result<Option<Ipv4Addr>, ()> {
    if seed.is_empty() {
        return Ok(None);
    }
    seed.parse::<Ipv4Addr>().map(Some).map_err(|_| ())
}

/// A light client insists on compact-filter service unless it keeps all
/// blocks itself
fn preferred_services(policy: BlockStoragePolicy) -> BTreeSet<Service> {
    if policy == BlockStoragePolicy::All {
        BTreeSet::new()
    } else {
        [Service::CompactFilters].into_iter().collect()
    }
}

pub struct PeerManager {
    context: PeerContext,
    chain: ChainKind,
    target: usize,
    default_peer: Option<PeerAddress>,
    dial_outbound: bool,
    preferred: BTreeSet<Service>,
    next_id: u64,
    peers: HashMap<u64, PeerHandle>,
    active: HashMap<AddressId, usize>,
    connected: HashSet<AddressId>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    requests_tx: mpsc::Sender<PeerCommand>,
    requests_rx: mpsc::Receiver<PeerCommand>,
}

impl PeerManager {
    pub fn new(context: PeerContext, config: PeerManagerConfig) -> PeerManager {
        let params = chain_params(config.chain);
        let (events_tx, events_rx) = mpsc::channel(256);

        let (default_peer, dial_outbound) = match parse_seed(&config.seed_node) {
            Ok(Some(ip)) => {
                let address = PeerAddress::new(
                    params.p2p_protocol,
                    Network::Ipv4,
                    ip.octets().to_vec(),
                    params.default_port,
                    config.chain,
                    0,
                    BTreeSet::new(),
                );
                match address {
                    Ok(address) => {
                        // Known seed goes straight into the address book
                        if let Err(e) = context.address_book.add_or_update(&address) {
                            warn!(error = %e, "failed to record seed node");
                        }
                        (Some(address), true)
                    }
                    Err(e) => {
                        warn!(error = %e, "invalid seed node address");
                        (None, true)
                    }
                }
            }
            Ok(None) => {
                info!(chain = %config.chain, "no seed node configured, outbound dialing disabled");
                (None, false)
            }
            Err(()) => {
                warn!(seed = %config.seed_node, "unparseable seed node, ignoring");
                (None, true)
            }
        };

        let preferred = preferred_services(context.blocks.policy());
        let (requests_tx, requests_rx) = mpsc::channel(256);

        PeerManager {
            context,
            chain: config.chain,
            target: config.target_peer_count,
            default_peer,
            dial_outbound,
            preferred,
            next_id: 0,
            peers: HashMap::new(),
            active: HashMap::new(),
            connected: HashSet::new(),
            events_tx,
            events_rx,
            requests_tx,
            requests_rx,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Handle for enqueueing requests once the manager loop owns self
    pub fn request_sender(&self) -> mpsc::Sender<PeerCommand> {
        self.requests_tx.clone()
    }

    /// Distribute a request to every connected peer's inbox
    pub fn broadcast(&self, command: PeerCommand) {
        for handle in self.peers.values() {
            if !handle.send_command(command.clone()) {
                trace!(peer = handle.id, "peer inbox full, request dropped");
            }
        }
    }

    /// Main loop: reap dead peers, top the set up to the target, and
    /// process peer events, until the stop signal fires.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap();
                    self.maintain().await;
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
                request = self.requests_rx.recv() => {
                    if let Some(request) = request {
                        self.broadcast(request);
                    }
                }
                _ = stop.changed() => {
                    break;
                }
            }
        }

        self.shutdown_all().await;
    }

    fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::HandshakeComplete {
                peer_id,
                services,
                start_height,
            } => {
                debug!(peer = peer_id, ?services, start_height, "peer handshake complete");
            }
            PeerEvent::Disconnected { peer_id } => {
                self.remove_peer(peer_id);
            }
        }
    }

    fn remove_peer(&mut self, peer_id: u64) {
        if let Some(handle) = self.peers.remove(&peer_id) {
            let address_id = handle.address_id;
            if let Some(count) = self.active.get_mut(&address_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.active.remove(&address_id);
                }
            }
            self.connected.remove(&address_id);
            debug!(peer = peer_id, "reaped peer");
        }
    }

    fn reap(&mut self) {
        let finished: Vec<u64> = self
            .peers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.remove_peer(id);
        }
    }

    async fn maintain(&mut self) {
        if !self.dial_outbound {
            return;
        }
        if self.peers.len() >= self.target {
            return;
        }

        trace!(
            current = self.peers.len(),
            target = self.target,
            "fewer peers than desired"
        );

        if let Some(address) = self.next_candidate().await {
            self.add_peer(address);
        }
    }

    fn is_not_connected(&self, address: &PeerAddress) -> bool {
        !self.connected.contains(&address.id())
    }

    /// The candidate ladder: seed node, preferred services, DNS seed,
    /// then anything in the book
    async fn next_candidate(&mut self) -> Option<PeerAddress> {
        if let Some(default) = self.default_peer.clone() {
            if self.is_not_connected(&default) {
                debug!(address = %default.display(), "dialing seed node");
                return Some(default);
            }
        }

        let networks: BTreeSet<Network> = [Network::Ipv4, Network::Ipv6].into_iter().collect();
        let protocol = chain_params(self.chain).p2p_protocol;

        match self
            .context
            .address_book
            .find(self.chain, protocol, &networks, &self.preferred)
        {
            Ok(Some(address)) if self.is_not_connected(&address) => {
                debug!(address = %address.display(), "dialing preferred peer");
                return Some(address);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "address book lookup failed"),
        }

        if let Some(address) = self.resolve_dns_seed().await {
            if self.is_not_connected(&address) {
                debug!(address = %address.display(), "dialing DNS-seeded peer");
                return Some(address);
            }
        }

        match self
            .context
            .address_book
            .find(self.chain, protocol, &networks, &BTreeSet::new())
        {
            Ok(Some(address)) if self.is_not_connected(&address) => {
                debug!(address = %address.display(), "dialing fallback peer");
                Some(address)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "address book lookup failed");
                None
            }
        }
    }

    /// Resolve one randomly-chosen DNS seed and record every returned
    /// address; the first non-active one becomes the candidate
    async fn resolve_dns_seed(&mut self) -> Option<PeerAddress> {
        let params = chain_params(self.chain);
        let seed = params.dns_seeds.choose(&mut rand::thread_rng())?;
        debug!(seed = %seed, "resolving DNS seed");

        let lookup = format!("{}:{}", seed, params.default_port);
        let resolved = match tokio::net::lookup_host(lookup).await {
            Ok(resolved) => resolved,
            Err(e) => {
                // DNS failure costs this tick only
                warn!(seed = %seed, error = %e, "DNS seed resolution failed");
                return None;
            }
        };

        let mut candidate = None;
        for endpoint in resolved {
            let (network, bytes) = match endpoint.ip() {
                IpAddr::V4(ip) => (Network::Ipv4, ip.octets().to_vec()),
                IpAddr::V6(ip) => (Network::Ipv6, ip.octets().to_vec()),
            };
            let address = match PeerAddress::new(
                params.p2p_protocol,
                network,
                bytes,
                endpoint.port(),
                self.chain,
                0,
                BTreeSet::new(),
            ) {
                Ok(address) => address,
                Err(_) => continue,
            };

            if let Err(e) = self.context.address_book.add_or_update(&address) {
                warn!(error = %e, "failed to record resolved address");
            }
            if candidate.is_none() && !self.active.contains_key(&address.id()) {
                candidate = Some(address);
            }
        }
        candidate
    }

    fn add_peer(&mut self, address: PeerAddress) {
        let address_id = address.id();
        let count = self.active.entry(address_id).or_insert(0);
        if *count > 0 {
            return;
        }

        self.next_id += 1;
        let id = self.next_id;
        let handle = spawn_peer(id, address, self.context.clone(), self.events_tx.clone());
        self.peers.insert(id, handle);
        *count += 1;
        self.connected.insert(address_id);
    }

    async fn shutdown_all(&mut self) {
        info!(chain = %self.chain, peers = self.peers.len(), "shutting down peer set");
        let handles: Vec<PeerHandle> = self.peers.drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            let done = handle.shutdown();
            if tokio::time::timeout(SHUTDOWN_GRACE, done).await.is_err() {
                // Cooperative wind-down took too long
                handle.force_abort();
            }
        }
        self.active.clear();
        self.connected.clear();
    }
}
