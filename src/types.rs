/// Core chain types shared by every subsystem
///
/// Hashes are stored in internal byte order (the order produced by the
/// hash function). Display formatting reverses the bytes, matching the
/// convention used by block explorers.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chainwork::Work;

/// 32-byte digest in internal byte order
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

pub type BlockHash = Hash;
pub type FilterHash = Hash;
pub type FilterHeader = Hash;
pub type TxId = Hash;
pub type AddressId = Hash;

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_slice(bytes: &[u8]) -> Option<Hash> {
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Some(Hash(out))
    }

    /// Parse from display hex (big-endian), reversing into internal order
    pub fn from_display_hex(hex_str: &str) -> Option<Hash> {
        let mut bytes = hex::decode(hex_str).ok()?;
        bytes.reverse();
        Hash::from_slice(&bytes)
    }

    /// Parse from internal-order hex (no reversal)
    pub fn from_internal_hex(hex_str: &str) -> Option<Hash> {
        Hash::from_slice(&hex::decode(hex_str).ok()?)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Truncated display form for log lines
    pub fn short(&self) -> String {
        let full = format!("{:x}", self);
        full[..16].to_string()
    }
}

impl fmt::LowerHex for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({:x})", self)
    }
}

/// Seconds since the Unix epoch per the node clock
pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Double SHA-256
pub fn sha256d(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash(out)
}

/// Block height. -1 denotes "no position".
pub type Height = i64;

pub const NO_POSITION: Height = -1;

/// (height, block hash) pair
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Position {
    pub height: Height,
    pub hash: BlockHash,
}

impl Position {
    pub fn new(height: Height, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// The blank position used before any data exists
    pub fn blank() -> Self {
        Self {
            height: NO_POSITION,
            hash: Hash::ZERO,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.height == NO_POSITION
    }

    /// Fixed-width serialization: height (8 bytes BE) then hash
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(self.hash.as_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Position> {
        if bytes.len() != 40 {
            return None;
        }
        let mut height_bytes = [0u8; 8];
        height_bytes.copy_from_slice(&bytes[..8]);
        let hash = Hash::from_slice(&bytes[8..])?;
        Some(Position {
            height: i64::from_be_bytes(height_bytes),
            hash,
        })
    }
}

/// Whether a header is part of the connected graph
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum HeaderStatus {
    Normal,
    Disconnected,
    CheckpointBanned,
}

/// How a header relates to the active checkpoint, if any
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum CheckpointRelation {
    Unknown,
    Matches,
    Sibling,
    Descendent,
}

/// A block header plus the chain metadata maintained by the header oracle
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev: BlockHash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub n_bits: u32,
    pub nonce: u32,
    /// Hash of the serialized header (derived, never trusted from the wire)
    pub hash: BlockHash,
    /// Work proven by this header alone
    pub pow: Work,
    pub height: Height,
    /// Cumulative work from genesis through this header
    pub work: Work,
    /// Cumulative work through the parent
    pub parent_work: Work,
    pub status: HeaderStatus,
    pub checkpoint: CheckpointRelation,
}

impl BlockHeader {
    /// Parse an 80-byte wire header. Metadata fields start blank and are
    /// filled in when the header connects to a parent.
    pub fn from_wire(bytes: &[u8]) -> Option<BlockHeader> {
        if bytes.len() != 80 {
            return None;
        }
        let version = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let prev = Hash::from_slice(&bytes[4..36])?;
        let merkle_root = Hash::from_slice(&bytes[36..68])?;
        let timestamp = u32::from_le_bytes([bytes[68], bytes[69], bytes[70], bytes[71]]);
        let n_bits = u32::from_le_bytes([bytes[72], bytes[73], bytes[74], bytes[75]]);
        let nonce = u32::from_le_bytes([bytes[76], bytes[77], bytes[78], bytes[79]]);
        let hash = sha256d(bytes);
        let pow = Work::from_bits(n_bits);

        Some(BlockHeader {
            version,
            prev,
            merkle_root,
            timestamp,
            n_bits,
            nonce,
            hash,
            pow,
            height: NO_POSITION,
            work: Work::zero(),
            parent_work: Work::zero(),
            status: HeaderStatus::Normal,
            checkpoint: CheckpointRelation::Unknown,
        })
    }

    /// Re-serialize the 80-byte wire form
    pub fn to_wire(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.n_bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn position(&self) -> Position {
        Position::new(self.height, self.hash)
    }

    pub fn is_disconnected(&self) -> bool {
        self.status == HeaderStatus::Disconnected
    }

    pub fn is_banned(&self) -> bool {
        self.status == HeaderStatus::CheckpointBanned
            || self.checkpoint == CheckpointRelation::Sibling
    }

    /// Inherit position, cumulative work and state from a connected parent
    pub fn inherit(&mut self, parent: &BlockHeader) {
        self.height = parent.height + 1;
        self.parent_work = parent.work;
        self.work = parent.work.add(&self.pow);

        self.status = match parent.status {
            HeaderStatus::CheckpointBanned => HeaderStatus::CheckpointBanned,
            _ => HeaderStatus::Normal,
        };

        if parent.checkpoint != CheckpointRelation::Unknown {
            self.checkpoint = CheckpointRelation::Descendent;
            if parent.checkpoint == CheckpointRelation::Sibling {
                self.status = HeaderStatus::CheckpointBanned;
            }
        }
    }

    /// Classify this header against the active checkpoint
    pub fn compare_to_checkpoint(&mut self, checkpoint: &Position) {
        if checkpoint.is_blank() {
            return;
        }

        if self.height == checkpoint.height {
            if self.hash == checkpoint.hash {
                self.checkpoint = CheckpointRelation::Matches;
            } else {
                self.checkpoint = CheckpointRelation::Sibling;
                self.status = HeaderStatus::CheckpointBanned;
            }
        } else if self.height > checkpoint.height
            && self.checkpoint == CheckpointRelation::Unknown
        {
            self.checkpoint = CheckpointRelation::Descendent;
        }
    }

    /// Clear checkpoint-derived state, restoring a connectable header
    pub fn clear_checkpoint_state(&mut self) {
        self.checkpoint = CheckpointRelation::Unknown;
        if self.status == HeaderStatus::CheckpointBanned {
            self.status = HeaderStatus::Normal;
        }
    }
}

/// Supported chains
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ChainKind {
    Bitcoin,
    BitcoinTestnet3,
    BitcoinCash,
    BitcoinCashTestnet3,
    UnitTest,
}

impl ChainKind {
    pub fn id(&self) -> u32 {
        match self {
            ChainKind::Bitcoin => 0,
            ChainKind::BitcoinTestnet3 => 1,
            ChainKind::BitcoinCash => 2,
            ChainKind::BitcoinCashTestnet3 => 3,
            ChainKind::UnitTest => 99,
        }
    }

    pub fn from_id(id: u32) -> Option<ChainKind> {
        match id {
            0 => Some(ChainKind::Bitcoin),
            1 => Some(ChainKind::BitcoinTestnet3),
            2 => Some(ChainKind::BitcoinCash),
            3 => Some(ChainKind::BitcoinCashTestnet3),
            99 => Some(ChainKind::UnitTest),
            _ => None,
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainKind::Bitcoin => "bitcoin",
            ChainKind::BitcoinTestnet3 => "bitcoin-testnet3",
            ChainKind::BitcoinCash => "bitcoincash",
            ChainKind::BitcoinCashTestnet3 => "bitcoincash-testnet3",
            ChainKind::UnitTest => "unittest",
        };
        write!(f, "{}", name)
    }
}

/// Filter parameterizations understood by the filter oracle
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum FilterFlavor {
    BasicBip158,
    BasicBch,
    Extended,
}

impl FilterFlavor {
    pub fn id(&self) -> u32 {
        match self {
            FilterFlavor::BasicBip158 => 0,
            FilterFlavor::BasicBch => 1,
            FilterFlavor::Extended => 88,
        }
    }

    pub fn from_id(id: u32) -> Option<FilterFlavor> {
        match id {
            0 => Some(FilterFlavor::BasicBip158),
            1 => Some(FilterFlavor::BasicBch),
            88 => Some(FilterFlavor::Extended),
            _ => None,
        }
    }

    /// Golomb-Rice parameters (bits per element, false positive denominator)
    pub fn params(&self) -> (u8, u32) {
        match self {
            FilterFlavor::BasicBip158 => (19, 784_931),
            FilterFlavor::BasicBch => (19, 784_931),
            FilterFlavor::Extended => (19, 784_931),
        }
    }

    /// Wire identifier used in cfilter/cfheaders messages
    pub fn wire_byte(&self) -> u8 {
        match self {
            FilterFlavor::BasicBip158 => 0,
            FilterFlavor::BasicBch => 0,
            FilterFlavor::Extended => 88,
        }
    }
}

impl fmt::Display for FilterFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterFlavor::BasicBip158 => "basic",
            FilterFlavor::BasicBch => "basic-bch",
            FilterFlavor::Extended => "extended",
        };
        write!(f, "{}", name)
    }
}

/// P2P protocol family spoken by a peer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Protocol {
    Bitcoin,
    Ethereum,
}

impl Protocol {
    pub fn id(&self) -> u32 {
        match self {
            Protocol::Bitcoin => 0,
            Protocol::Ethereum => 1,
        }
    }

    pub fn from_id(id: u32) -> Option<Protocol> {
        match id {
            0 => Some(Protocol::Bitcoin),
            1 => Some(Protocol::Ethereum),
            _ => None,
        }
    }
}

/// Transport network of a peer address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Network {
    Ipv4,
    Ipv6,
    Onion2,
    Onion3,
    Eep,
    Cjdns,
}

impl Network {
    pub fn id(&self) -> u32 {
        match self {
            Network::Ipv4 => 0,
            Network::Ipv6 => 1,
            Network::Onion2 => 2,
            Network::Onion3 => 3,
            Network::Eep => 4,
            Network::Cjdns => 5,
        }
    }

    pub fn from_id(id: u32) -> Option<Network> {
        match id {
            0 => Some(Network::Ipv4),
            1 => Some(Network::Ipv6),
            2 => Some(Network::Onion2),
            3 => Some(Network::Onion3),
            4 => Some(Network::Eep),
            5 => Some(Network::Cjdns),
            _ => None,
        }
    }

    /// Required address payload length in bytes
    pub fn address_len(&self) -> usize {
        match self {
            Network::Ipv4 => 4,
            Network::Ipv6 | Network::Cjdns => 16,
            Network::Onion2 => 10,
            Network::Onion3 => 56,
            Network::Eep => 32,
        }
    }
}

/// Advertised peer capabilities
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Service {
    Network,
    GetUtxo,
    Bloom,
    Witness,
    Xthin,
    CompactFilters,
    NetworkLimited,
}

impl Service {
    pub fn id(&self) -> u32 {
        match self {
            Service::Network => 0,
            Service::GetUtxo => 1,
            Service::Bloom => 2,
            Service::Witness => 3,
            Service::Xthin => 4,
            Service::CompactFilters => 5,
            Service::NetworkLimited => 6,
        }
    }

    pub fn from_id(id: u32) -> Option<Service> {
        match id {
            0 => Some(Service::Network),
            1 => Some(Service::GetUtxo),
            2 => Some(Service::Bloom),
            3 => Some(Service::Witness),
            4 => Some(Service::Xthin),
            5 => Some(Service::CompactFilters),
            6 => Some(Service::NetworkLimited),
            _ => None,
        }
    }

    /// Wire service-bit position
    pub fn bit(&self) -> u64 {
        match self {
            Service::Network => 1 << 0,
            Service::GetUtxo => 1 << 1,
            Service::Bloom => 1 << 2,
            Service::Witness => 1 << 3,
            Service::Xthin => 1 << 4,
            Service::CompactFilters => 1 << 6,
            Service::NetworkLimited => 1 << 10,
        }
    }

    pub fn mask(services: &std::collections::BTreeSet<Service>) -> u64 {
        services.iter().fold(0u64, |acc, s| acc | s.bit())
    }

    pub fn from_mask(mask: u64) -> std::collections::BTreeSet<Service> {
        let all = [
            Service::Network,
            Service::GetUtxo,
            Service::Bloom,
            Service::Witness,
            Service::Xthin,
            Service::CompactFilters,
            Service::NetworkLimited,
        ];
        all.iter()
            .filter(|s| mask & s.bit() != 0)
            .copied()
            .collect()
    }
}

/// How much block body data this node retains
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BlockStoragePolicy {
    None,
    Cache,
    All,
}

impl BlockStoragePolicy {
    pub fn id(&self) -> u32 {
        match self {
            BlockStoragePolicy::None => 0,
            BlockStoragePolicy::Cache => 1,
            BlockStoragePolicy::All => 2,
        }
    }

    pub fn from_id(id: u32) -> Option<BlockStoragePolicy> {
        match id {
            0 => Some(BlockStoragePolicy::None),
            1 => Some(BlockStoragePolicy::Cache),
            2 => Some(BlockStoragePolicy::All),
            _ => None,
        }
    }
}

/// (transaction id, output index)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

impl OutPoint {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(self.txid.as_bytes());
        out.extend_from_slice(&self.vout.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_display_reverses_bytes() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hash = Hash(bytes);
        let display = format!("{:x}", hash);
        assert!(display.starts_with("01"));
        assert!(display.ends_with("ab"));
    }

    #[test]
    fn test_hash_display_hex_round_trip() {
        let display = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = Hash::from_display_hex(display).unwrap();
        assert_eq!(format!("{:x}", hash), display);
        // Internal form matches the reversed byte order
        assert_eq!(
            hex::encode(hash.as_bytes()),
            "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
        );
    }

    #[test]
    fn test_position_serialize_round_trip() {
        let pos = Position::new(12345, Hash([7u8; 32]));
        let bytes = pos.serialize();
        assert_eq!(bytes.len(), 40);
        assert_eq!(Position::deserialize(&bytes).unwrap(), pos);
        assert!(Position::deserialize(&bytes[..39]).is_none());
    }

    #[test]
    fn test_header_wire_round_trip() {
        let mut raw = [0u8; 80];
        raw[0] = 1; // version 1
        raw[4] = 0xaa;
        raw[72..76].copy_from_slice(&0x1d00ffffu32.to_le_bytes());
        let header = BlockHeader::from_wire(&raw).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.n_bits, 0x1d00ffff);
        assert_eq!(header.to_wire(), raw);
        assert_eq!(header.hash, sha256d(&raw));
    }

    #[test]
    fn test_header_inherit() {
        let mut raw = [0u8; 80];
        raw[72..76].copy_from_slice(&0x207fffffu32.to_le_bytes());
        let mut parent = BlockHeader::from_wire(&raw).unwrap();
        parent.height = 10;
        parent.work = Work::from_bits(0x207fffff);

        raw[76] = 1; // different nonce
        let mut child = BlockHeader::from_wire(&raw).unwrap();
        child.inherit(&parent);

        assert_eq!(child.height, 11);
        assert_eq!(child.parent_work, parent.work);
        assert!(child.work > parent.work);
        assert_eq!(child.status, HeaderStatus::Normal);
    }

    #[test]
    fn test_checkpoint_sibling_bans() {
        let mut raw = [0u8; 80];
        raw[72..76].copy_from_slice(&0x207fffffu32.to_le_bytes());
        let mut header = BlockHeader::from_wire(&raw).unwrap();
        header.height = 5;

        let checkpoint = Position::new(5, Hash([9u8; 32]));
        header.compare_to_checkpoint(&checkpoint);
        assert_eq!(header.checkpoint, CheckpointRelation::Sibling);
        assert_eq!(header.status, HeaderStatus::CheckpointBanned);

        header.clear_checkpoint_state();
        assert_eq!(header.checkpoint, CheckpointRelation::Unknown);
        assert_eq!(header.status, HeaderStatus::Normal);
    }

    #[test]
    fn test_service_mask_round_trip() {
        let mut services = std::collections::BTreeSet::new();
        services.insert(Service::Network);
        services.insert(Service::CompactFilters);
        let mask = Service::mask(&services);
        assert_eq!(mask, (1 << 0) | (1 << 6));
        assert_eq!(Service::from_mask(mask), services);
    }
}
