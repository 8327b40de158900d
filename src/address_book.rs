/// Persistent peer address catalog
///
/// The primary record lives in the `peers` table keyed by a deterministic
/// id. Secondary indices by chain, protocol, service, network, and
/// last-connected time are duplicate-sorted tables whose values are peer
/// ids; in-memory mirrors of every index are rebuilt at startup and kept
/// in lockstep with the tables inside each write transaction.
///
/// The id is a pure function of (version, protocol, network, bytes, port,
/// chain): the serialization is hashed with the last-connected time and
/// service list blanked, so connectivity updates never change identity.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::store::{int_key, Direction, PutFlags, Store, StoreError};
pub use crate::types::now_seconds;
use crate::types::{sha256d, AddressId, ChainKind, Network, Protocol, Service};

pub const TABLE_PEERS: &str = "peers";
pub const TABLE_PEER_BY_CHAIN: &str = "peer_by_chain";
pub const TABLE_PEER_BY_PROTOCOL: &str = "peer_by_protocol";
pub const TABLE_PEER_BY_SERVICE: &str = "peer_by_service";
pub const TABLE_PEER_BY_NETWORK: &str = "peer_by_network";
pub const TABLE_PEER_BY_LAST_CONNECTED: &str = "peer_by_last_connected";

const RECORD_VERSION: u32 = 1;

#[derive(Debug)]
pub enum AddressBookError {
    /// Address byte length does not match the claimed network
    InvalidAddress(String),
    Storage(StoreError),
    Encoding(String),
}

impl fmt::Display for AddressBookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressBookError::InvalidAddress(msg) => write!(f, "invalid peer address: {}", msg),
            AddressBookError::Storage(e) => write!(f, "address book storage error: {}", e),
            AddressBookError::Encoding(msg) => write!(f, "address record encoding error: {}", msg),
        }
    }
}

impl std::error::Error for AddressBookError {}

impl From<StoreError> for AddressBookError {
    fn from(e: StoreError) -> Self {
        AddressBookError::Storage(e)
    }
}

/// One known peer endpoint
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PeerAddress {
    pub version: u32,
    pub protocol: Protocol,
    pub network: Network,
    pub bytes: Vec<u8>,
    pub port: u16,
    pub chain: ChainKind,
    /// Seconds since epoch; 0 means never connected
    pub last_connected: i64,
    pub services: BTreeSet<Service>,
    /// Pre-update snapshot, reconstructed in memory, never persisted
    #[serde(skip)]
    pub previous_services: BTreeSet<Service>,
    #[serde(skip)]
    pub previous_last_connected: i64,
}

impl PeerAddress {
    pub fn new(
        protocol: Protocol,
        network: Network,
        bytes: Vec<u8>,
        port: u16,
        chain: ChainKind,
        last_connected: i64,
        services: BTreeSet<Service>,
    ) -> Result<PeerAddress, AddressBookError> {
        if bytes.len() != network.address_len() {
            return Err(AddressBookError::InvalidAddress(format!(
                "{} bytes for network {:?}",
                bytes.len(),
                network
            )));
        }

        Ok(PeerAddress {
            version: RECORD_VERSION,
            protocol,
            network,
            bytes,
            port,
            chain,
            last_connected,
            previous_services: services.clone(),
            services,
            previous_last_connected: last_connected,
        })
    }

    /// Deterministic identity: hash of the normalized serialization with
    /// time and services blanked
    pub fn id(&self) -> AddressId {
        let normalized = PeerAddress {
            version: self.version,
            protocol: self.protocol,
            network: self.network,
            bytes: self.bytes.clone(),
            port: self.port,
            chain: self.chain,
            last_connected: 0,
            services: BTreeSet::new(),
            previous_services: BTreeSet::new(),
            previous_last_connected: 0,
        };
        let serialized =
            bincode::serialize(&normalized).expect("address serialization cannot fail");
        sha256d(&serialized)
    }

    /// Human-readable endpoint for log lines
    pub fn display(&self) -> String {
        let host = match self.network {
            Network::Ipv4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.bytes);
                format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
            }
            Network::Ipv6 | Network::Cjdns => {
                let mut groups = Vec::with_capacity(8);
                for chunk in self.bytes.chunks(2) {
                    groups.push(format!("{:x}", u16::from_be_bytes([chunk[0], chunk[1]])));
                }
                format!("[{}]", groups.join(":"))
            }
            Network::Onion2 | Network::Onion3 => {
                format!("{}.onion", String::from_utf8_lossy(&self.bytes))
            }
            Network::Eep => format!("{}.i2p", hex::encode(&self.bytes)),
        };
        format!("{}:{}", host, self.port)
    }

    /// Record a new service set, snapshotting the old one
    pub fn set_services(&mut self, services: BTreeSet<Service>) {
        self.previous_services = std::mem::replace(&mut self.services, services);
    }

    /// Record a new connection time, snapshotting the old one
    pub fn set_last_connected(&mut self, time: i64) {
        self.previous_last_connected = self.last_connected;
        self.last_connected = time;
    }

    fn to_record(&self) -> Result<Vec<u8>, AddressBookError> {
        bincode::serialize(self).map_err(|e| AddressBookError::Encoding(e.to_string()))
    }

    fn from_record(raw: &[u8]) -> Result<PeerAddress, AddressBookError> {
        let mut address: PeerAddress =
            bincode::deserialize(raw).map_err(|e| AddressBookError::Encoding(e.to_string()))?;
        // Loaded records start with previous == current
        address.previous_services = address.services.clone();
        address.previous_last_connected = address.last_connected;
        Ok(address)
    }
}

#[derive(Default)]
struct Indices {
    chains: HashMap<u32, HashSet<AddressId>>,
    protocols: HashMap<u32, HashSet<AddressId>>,
    services: HashMap<u32, HashSet<AddressId>>,
    networks: HashMap<u32, HashSet<AddressId>>,
    connected: HashMap<AddressId, i64>,
}

pub struct AddressBook {
    store: Arc<Store>,
    indices: Mutex<Indices>,
}

impl AddressBook {
    /// Open the address book, rebuilding every in-memory index from its
    /// table under a single read transaction.
    pub fn open(store: Arc<Store>) -> Result<AddressBook, AddressBookError> {
        let mut indices = Indices::default();
        {
            let read = store.begin_read();

            read.iterate(TABLE_PEER_BY_CHAIN, Direction::Forward, |key, value| {
                if let (Ok(bucket), Some(id)) = (key.try_into().map(u64::from_be_bytes), AddressId::from_slice(value)) {
                    indices.chains.entry(bucket as u32).or_default().insert(id);
                }
                true
            })?;
            read.iterate(TABLE_PEER_BY_PROTOCOL, Direction::Forward, |key, value| {
                if let (Ok(bucket), Some(id)) = (key.try_into().map(u64::from_be_bytes), AddressId::from_slice(value)) {
                    indices.protocols.entry(bucket as u32).or_default().insert(id);
                }
                true
            })?;
            read.iterate(TABLE_PEER_BY_SERVICE, Direction::Forward, |key, value| {
                if let (Ok(bucket), Some(id)) = (key.try_into().map(u64::from_be_bytes), AddressId::from_slice(value)) {
                    indices.services.entry(bucket as u32).or_default().insert(id);
                }
                true
            })?;
            read.iterate(TABLE_PEER_BY_NETWORK, Direction::Forward, |key, value| {
                if let (Ok(bucket), Some(id)) = (key.try_into().map(u64::from_be_bytes), AddressId::from_slice(value)) {
                    indices.networks.entry(bucket as u32).or_default().insert(id);
                }
                true
            })?;
            read.iterate(
                TABLE_PEER_BY_LAST_CONNECTED,
                Direction::Forward,
                |key, value| {
                    if let (Ok(time), Some(id)) = (key.try_into().map(u64::from_be_bytes), AddressId::from_slice(value)) {
                        indices.connected.insert(id, time as i64);
                    }
                    true
                },
            )?;
        }

        Ok(AddressBook {
            store,
            indices: Mutex::new(indices),
        })
    }

    /// Insert or refresh a record, maintaining every secondary index in
    /// one write transaction
    pub fn add_or_update(&self, address: &PeerAddress) -> Result<(), AddressBookError> {
        self.insert_all(std::slice::from_ref(address))
    }

    /// Bulk-add addresses that are not yet known; existing ids are left
    /// untouched
    pub fn import(&self, addresses: Vec<PeerAddress>) -> Result<usize, AddressBookError> {
        let read = self.store.begin_read();
        let mut fresh = Vec::new();
        for address in addresses {
            if !read.exists(TABLE_PEERS, address.id().as_bytes())? {
                fresh.push(address);
            }
        }
        drop(read);

        let count = fresh.len();
        if count > 0 {
            self.insert_all(&fresh)?;
        }
        Ok(count)
    }

    fn insert_all(&self, addresses: &[PeerAddress]) -> Result<(), AddressBookError> {
        let mut txn = self.store.begin_write();
        let mut obsolete_by_peer: Vec<(AddressId, Vec<Service>)> = Vec::new();

        for address in addresses {
            let id = address.id();
            let id_bytes = id.as_bytes();

            // Service bits present before the update but absent now
            let obsolete: Vec<Service> = address
                .previous_services
                .difference(&address.services)
                .copied()
                .collect();

            txn.put(TABLE_PEERS, id_bytes, &address.to_record()?, PutFlags::default())?;
            txn.put(
                TABLE_PEER_BY_CHAIN,
                &int_key(u64::from(address.chain.id())),
                id_bytes,
                PutFlags::default(),
            )?;
            txn.put(
                TABLE_PEER_BY_PROTOCOL,
                &int_key(u64::from(address.protocol.id())),
                id_bytes,
                PutFlags::default(),
            )?;
            txn.put(
                TABLE_PEER_BY_NETWORK,
                &int_key(u64::from(address.network.id())),
                id_bytes,
                PutFlags::default(),
            )?;

            for service in &address.services {
                txn.put(
                    TABLE_PEER_BY_SERVICE,
                    &int_key(u64::from(service.id())),
                    id_bytes,
                    PutFlags::default(),
                )?;
            }
            for service in &obsolete {
                txn.delete_pair(
                    TABLE_PEER_BY_SERVICE,
                    &int_key(u64::from(service.id())),
                    id_bytes,
                )?;
            }

            txn.put(
                TABLE_PEER_BY_LAST_CONNECTED,
                &int_key(address.last_connected.max(0) as u64),
                id_bytes,
                PutFlags::default(),
            )?;
            if address.previous_last_connected != address.last_connected {
                txn.delete_pair(
                    TABLE_PEER_BY_LAST_CONNECTED,
                    &int_key(address.previous_last_connected.max(0) as u64),
                    id_bytes,
                )?;
            }

            obsolete_by_peer.push((id, obsolete));
        }

        if let Err(e) = txn.commit() {
            warn!(error = %e, "address book commit failed");
            return Err(e.into());
        }

        // Mirrors move only after the storage commit succeeds
        let mut indices = self
            .indices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (address, (id, obsolete)) in addresses.iter().zip(obsolete_by_peer) {
            indices.chains.entry(address.chain.id()).or_default().insert(id);
            indices
                .protocols
                .entry(address.protocol.id())
                .or_default()
                .insert(id);
            indices
                .networks
                .entry(address.network.id())
                .or_default()
                .insert(id);
            for service in &address.services {
                indices.services.entry(service.id()).or_default().insert(id);
            }
            for service in obsolete {
                if let Some(set) = indices.services.get_mut(&service.id()) {
                    set.remove(&id);
                }
            }
            indices.connected.insert(id, address.last_connected);
        }

        Ok(())
    }

    /// Load the primary record for an id
    pub fn get(&self, id: &AddressId) -> Result<Option<PeerAddress>, AddressBookError> {
        let read = self.store.begin_read();
        match read.get(TABLE_PEERS, id.as_bytes())? {
            Some(raw) => Ok(Some(PeerAddress::from_record(&raw)?)),
            None => Ok(None),
        }
    }

    /// Pick one candidate matching the constraints, weighted toward
    /// recently-connected peers: weight 10 within the last hour, 5 within
    /// the last day, 1 otherwise.
    pub fn find(
        &self,
        chain: ChainKind,
        protocol: Protocol,
        on_networks: &BTreeSet<Network>,
        with_services: &BTreeSet<Service>,
    ) -> Result<Option<PeerAddress>, AddressBookError> {
        let chosen = {
            let indices = self
                .indices
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let chain_set = match indices.chains.get(&chain.id()) {
                Some(set) if !set.is_empty() => set,
                _ => return Ok(None),
            };
            let protocol_set = match indices.protocols.get(&protocol.id()) {
                Some(set) if !set.is_empty() => set,
                _ => return Ok(None),
            };

            let mut candidates: HashSet<AddressId> = HashSet::new();
            for network in on_networks {
                if let Some(network_set) = indices.networks.get(&network.id()) {
                    for id in network_set {
                        if chain_set.contains(id) && protocol_set.contains(id) {
                            candidates.insert(*id);
                        }
                    }
                }
            }

            if candidates.is_empty() {
                trace!("no peers available for specified chain/protocol");
                return Ok(None);
            }

            let qualified: Vec<AddressId> = candidates
                .into_iter()
                .filter(|id| {
                    with_services.iter().all(|service| {
                        indices
                            .services
                            .get(&service.id())
                            .map(|set| set.contains(id))
                            .unwrap_or(false)
                    })
                })
                .collect();

            if qualified.is_empty() {
                trace!("no peers available with specified services");
                return Ok(None);
            }

            trace!(candidates = qualified.len(), "choosing peer candidate");

            let now = now_seconds();
            let mut weighted: Vec<AddressId> = Vec::new();
            for id in &qualified {
                let weight = match indices.connected.get(id) {
                    Some(&last) if last > 0 && now - last <= 3600 => 10,
                    Some(&last) if last > 0 && now - last <= 86_400 => 5,
                    _ => 1,
                };
                for _ in 0..weight {
                    weighted.push(*id);
                }
            }

            weighted.choose(&mut rand::thread_rng()).copied()
        };

        match chosen {
            Some(id) => self.get(&id),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{TableKind, TableSpec};
    use tempfile::TempDir;

    pub const TABLES: &[TableSpec] = &[
        TableSpec::new(TABLE_PEERS, TableKind::Plain),
        TableSpec::new(TABLE_PEER_BY_CHAIN, TableKind::IntegerKeyDupSort),
        TableSpec::new(TABLE_PEER_BY_PROTOCOL, TableKind::IntegerKeyDupSort),
        TableSpec::new(TABLE_PEER_BY_SERVICE, TableKind::IntegerKeyDupSort),
        TableSpec::new(TABLE_PEER_BY_NETWORK, TableKind::IntegerKeyDupSort),
        TableSpec::new(TABLE_PEER_BY_LAST_CONNECTED, TableKind::IntegerKeyDupSort),
    ];

    fn open_book(dir: &TempDir) -> (Arc<Store>, AddressBook) {
        let store = Arc::new(Store::open(dir.path(), TABLES).unwrap());
        let book = AddressBook::open(store.clone()).unwrap();
        (store, book)
    }

    fn test_address(octet: u8, services: &[Service], last_connected: i64) -> PeerAddress {
        PeerAddress::new(
            Protocol::Bitcoin,
            Network::Ipv4,
            vec![10, 0, 0, octet],
            8333,
            ChainKind::UnitTest,
            last_connected,
            services.iter().copied().collect(),
        )
        .unwrap()
    }

    fn all_networks() -> BTreeSet<Network> {
        [Network::Ipv4, Network::Ipv6].into_iter().collect()
    }

    #[test]
    fn test_id_ignores_time_and_services() {
        let a = test_address(1, &[Service::Network], 1000);
        let b = test_address(1, &[Service::CompactFilters, Service::Bloom], 99999);
        assert_eq!(a.id(), b.id());

        let c = test_address(2, &[Service::Network], 1000);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_invalid_byte_length_rejected() {
        let result = PeerAddress::new(
            Protocol::Bitcoin,
            Network::Ipv4,
            vec![1, 2, 3],
            8333,
            ChainKind::UnitTest,
            0,
            BTreeSet::new(),
        );
        assert!(matches!(result, Err(AddressBookError::InvalidAddress(_))));
    }

    #[test]
    fn test_display_forms() {
        let v4 = test_address(7, &[], 0);
        assert_eq!(v4.display(), "10.0.0.7:8333");

        let v6 = PeerAddress::new(
            Protocol::Bitcoin,
            Network::Ipv6,
            vec![0; 16],
            18333,
            ChainKind::UnitTest,
            0,
            BTreeSet::new(),
        )
        .unwrap();
        assert!(v6.display().starts_with('['));
        assert!(v6.display().ends_with(":18333"));
    }

    #[test]
    fn test_add_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let (_store, book) = open_book(&dir);

        let address = test_address(1, &[Service::Network, Service::CompactFilters], 500);
        book.add_or_update(&address).unwrap();

        let loaded = book.get(&address.id()).unwrap().unwrap();
        assert_eq!(loaded.bytes, address.bytes);
        assert_eq!(loaded.services, address.services);
        assert_eq!(loaded.last_connected, 500);
        // previous reconstructed from current on load
        assert_eq!(loaded.previous_last_connected, 500);
    }

    #[test]
    fn test_find_respects_service_filter() {
        let dir = TempDir::new().unwrap();
        let (_store, book) = open_book(&dir);

        book.add_or_update(&test_address(1, &[Service::Network], 0))
            .unwrap();
        book.add_or_update(&test_address(
            2,
            &[Service::Network, Service::CompactFilters],
            0,
        ))
        .unwrap();

        let wanted: BTreeSet<Service> = [Service::CompactFilters].into_iter().collect();
        for _ in 0..20 {
            let found = book
                .find(ChainKind::UnitTest, Protocol::Bitcoin, &all_networks(), &wanted)
                .unwrap()
                .unwrap();
            assert_eq!(found.bytes, vec![10, 0, 0, 2]);
        }
    }

    #[test]
    fn test_find_no_candidates() {
        let dir = TempDir::new().unwrap();
        let (_store, book) = open_book(&dir);

        assert!(book
            .find(
                ChainKind::UnitTest,
                Protocol::Bitcoin,
                &all_networks(),
                &BTreeSet::new()
            )
            .unwrap()
            .is_none());

        book.add_or_update(&test_address(1, &[], 0)).unwrap();
        // Wrong chain
        assert!(book
            .find(
                ChainKind::Bitcoin,
                Protocol::Bitcoin,
                &all_networks(),
                &BTreeSet::new()
            )
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_service_transition_removes_obsolete_bits() {
        let dir = TempDir::new().unwrap();
        let (store, book) = open_book(&dir);

        let mut address = test_address(1, &[Service::Bloom, Service::Network], 0);
        book.add_or_update(&address).unwrap();

        address.set_services([Service::Network].into_iter().collect());
        book.add_or_update(&address).unwrap();

        // Bloom index no longer lists this peer
        let read = store.begin_read();
        let bloom = read
            .get_dup(TABLE_PEER_BY_SERVICE, &int_key(u64::from(Service::Bloom.id())))
            .unwrap();
        assert!(bloom.is_empty());
        let network = read
            .get_dup(TABLE_PEER_BY_SERVICE, &int_key(u64::from(Service::Network.id())))
            .unwrap();
        assert_eq!(network.len(), 1);
    }

    #[test]
    fn test_last_connected_transition_moves_bucket() {
        let dir = TempDir::new().unwrap();
        let (store, book) = open_book(&dir);

        let mut address = test_address(1, &[], 100);
        book.add_or_update(&address).unwrap();

        address.set_last_connected(200);
        book.add_or_update(&address).unwrap();

        let read = store.begin_read();
        assert!(read
            .get_dup(TABLE_PEER_BY_LAST_CONNECTED, &int_key(100))
            .unwrap()
            .is_empty());
        assert_eq!(
            read.get_dup(TABLE_PEER_BY_LAST_CONNECTED, &int_key(200))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_import_skips_known_ids() {
        let dir = TempDir::new().unwrap();
        let (_store, book) = open_book(&dir);

        let known = test_address(1, &[], 100);
        book.add_or_update(&known).unwrap();

        let mut rewritten = known.clone();
        rewritten.last_connected = 0;
        let added = book
            .import(vec![rewritten, test_address(2, &[], 0)])
            .unwrap();
        assert_eq!(added, 1);

        // Existing record untouched
        let loaded = book.get(&known.id()).unwrap().unwrap();
        assert_eq!(loaded.last_connected, 100);
    }

    #[test]
    fn test_indices_rebuilt_on_reopen() {
        let dir = TempDir::new().unwrap();
        let address = test_address(1, &[Service::CompactFilters], now_seconds());
        {
            let (_store, book) = open_book(&dir);
            book.add_or_update(&address).unwrap();
        }

        let (_store, book) = open_book(&dir);
        let wanted: BTreeSet<Service> = [Service::CompactFilters].into_iter().collect();
        let found = book
            .find(ChainKind::UnitTest, Protocol::Bitcoin, &all_networks(), &wanted)
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), address.id());
    }

    #[test]
    fn test_weighted_sampling_bias() {
        let dir = TempDir::new().unwrap();
        let (_store, book) = open_book(&dir);

        let now = now_seconds();
        // 100 stale peers (weight 1 each) plus one fresh peer (weight 10)
        for octet in 0..100u8 {
            let mut address = PeerAddress::new(
                Protocol::Bitcoin,
                Network::Ipv4,
                vec![10, 0, 1, octet],
                8333,
                ChainKind::UnitTest,
                now - 48 * 3600,
                [Service::CompactFilters].into_iter().collect(),
            )
            .unwrap();
            address.previous_last_connected = address.last_connected;
            book.add_or_update(&address).unwrap();
        }
        let fresh = PeerAddress::new(
            Protocol::Bitcoin,
            Network::Ipv4,
            vec![10, 0, 2, 1],
            8333,
            ChainKind::UnitTest,
            now,
            [Service::CompactFilters].into_iter().collect(),
        )
        .unwrap();
        book.add_or_update(&fresh).unwrap();

        let wanted: BTreeSet<Service> = [Service::CompactFilters].into_iter().collect();
        let fresh_id = fresh.id();
        let mut hits = 0usize;
        let trials = 10_000usize;
        for _ in 0..trials {
            let found = book
                .find(ChainKind::UnitTest, Protocol::Bitcoin, &all_networks(), &wanted)
                .unwrap()
                .unwrap();
            if found.id() == fresh_id {
                hits += 1;
            }
        }

        // Expected rate 10/110 = 9.1%; accept 7% - 12%
        let rate = hits as f64 / trials as f64;
        assert!(rate > 0.07, "fresh peer rate too low: {}", rate);
        assert!(rate < 0.12, "fresh peer rate too high: {}", rate);
    }
}
