/// Wire message catalog
///
/// One variant per protocol command, each with its payload codec. The
/// frame layer (wire.rs) carries these as opaque payloads; this module
/// maps command tokens to typed messages and back.

use std::io::Cursor;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::types::{BlockHash, FilterHash, FilterHeader, Hash, Network};
use crate::wire::{read_bytes, read_compact_size, write_compact_size, WireError};

/// Network-format peer address as carried in version/addr payloads
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NetAddress {
    pub services: u64,
    /// IPv6 or v4-mapped IPv6
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_ipv4(services: u64, octets: [u8; 4], port: u16) -> NetAddress {
        let mut ip = [0u8; 16];
        ip[10] = 0xff;
        ip[11] = 0xff;
        ip[12..].copy_from_slice(&octets);
        NetAddress { services, ip, port }
    }

    pub fn from_ipv6(services: u64, ip: [u8; 16], port: u16) -> NetAddress {
        NetAddress { services, ip, port }
    }

    /// Split a v4-mapped address back into its network and raw bytes
    pub fn network_and_bytes(&self) -> (Network, Vec<u8>) {
        let is_v4_mapped =
            self.ip[..10].iter().all(|&b| b == 0) && self.ip[10] == 0xff && self.ip[11] == 0xff;
        if is_v4_mapped {
            (Network::Ipv4, self.ip[12..].to_vec())
        } else {
            (Network::Ipv6, self.ip.to_vec())
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.ip);
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> Result<NetAddress, WireError> {
        let services = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| truncated())?;
        let ip_bytes = read_bytes(cursor, 16)?;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&ip_bytes);
        let port = cursor.read_u16::<BigEndian>().map_err(|_| truncated())?;
        Ok(NetAddress { services, ip, port })
    }
}

/// A timestamped address entry in an addr message
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimestampedAddress {
    pub time: u32,
    pub address: NetAddress,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InventoryKind {
    Tx,
    Block,
    FilteredBlock,
    CompactBlock,
    Other(u32),
}

impl InventoryKind {
    pub fn to_u32(self) -> u32 {
        match self {
            InventoryKind::Tx => 1,
            InventoryKind::Block => 2,
            InventoryKind::FilteredBlock => 3,
            InventoryKind::CompactBlock => 4,
            InventoryKind::Other(v) => v,
        }
    }

    pub fn from_u32(value: u32) -> InventoryKind {
        match value {
            1 => InventoryKind::Tx,
            2 => InventoryKind::Block,
            3 => InventoryKind::FilteredBlock,
            4 => InventoryKind::CompactBlock,
            other => InventoryKind::Other(other),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Inventory {
    pub kind: InventoryKind,
    pub hash: Hash,
}

/// version payload
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

fn truncated() -> WireError {
    WireError::Malformed("truncated field".to_string())
}

fn read_hash(cursor: &mut Cursor<&[u8]>) -> Result<Hash, WireError> {
    let bytes = read_bytes(cursor, 32)?;
    Hash::from_slice(&bytes).ok_or_else(truncated)
}

/// Every message the core speaks
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<TimestampedAddress>),
    GetHeaders {
        version: u32,
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    Headers(Vec<Vec<u8>>),
    GetData(Vec<Inventory>),
    Block(Vec<u8>),
    GetCfHeaders {
        filter_type: u8,
        start_height: u32,
        stop: BlockHash,
    },
    CfHeaders {
        filter_type: u8,
        stop: BlockHash,
        previous: FilterHeader,
        hashes: Vec<FilterHash>,
    },
    GetCfilters {
        filter_type: u8,
        start_height: u32,
        stop: BlockHash,
    },
    Cfilter {
        filter_type: u8,
        block: BlockHash,
        filter: Vec<u8>,
    },
    GetCfCheckpt {
        filter_type: u8,
        stop: BlockHash,
    },
    CfCheckpt {
        filter_type: u8,
        stop: BlockHash,
        headers: Vec<FilterHeader>,
    },
    Inv(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    Mempool,
    FilterLoad {
        filter: Vec<u8>,
        hash_funcs: u32,
        tweak: u32,
        flags: u8,
    },
    FilterAdd(Vec<u8>),
    FilterClear,
    SendHeaders,
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::GetCfHeaders { .. } => "getcfheaders",
            Message::CfHeaders { .. } => "cfheaders",
            Message::GetCfilters { .. } => "getcfilters",
            Message::Cfilter { .. } => "cfilter",
            Message::GetCfCheckpt { .. } => "getcfcheckpt",
            Message::CfCheckpt { .. } => "cfcheckpt",
            Message::Inv(_) => "inv",
            Message::NotFound(_) => "notfound",
            Message::Mempool => "mempool",
            Message::FilterLoad { .. } => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::SendHeaders => "sendheaders",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Version(v) => {
                out.extend_from_slice(&v.version.to_le_bytes());
                out.extend_from_slice(&v.services.to_le_bytes());
                out.extend_from_slice(&v.timestamp.to_le_bytes());
                v.receiver.encode(&mut out);
                v.sender.encode(&mut out);
                out.extend_from_slice(&v.nonce.to_le_bytes());
                write_compact_size(&mut out, v.user_agent.len() as u64);
                out.extend_from_slice(v.user_agent.as_bytes());
                out.extend_from_slice(&v.start_height.to_le_bytes());
                out.push(u8::from(v.relay));
            }
            Message::Verack
            | Message::GetAddr
            | Message::Mempool
            | Message::FilterClear
            | Message::SendHeaders => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                out.extend_from_slice(&nonce.to_le_bytes());
            }
            Message::Addr(entries) => {
                write_compact_size(&mut out, entries.len() as u64);
                for entry in entries {
                    out.extend_from_slice(&entry.time.to_le_bytes());
                    entry.address.encode(&mut out);
                }
            }
            Message::GetHeaders {
                version,
                locator,
                stop,
            } => {
                out.extend_from_slice(&version.to_le_bytes());
                write_compact_size(&mut out, locator.len() as u64);
                for hash in locator {
                    out.extend_from_slice(hash.as_bytes());
                }
                out.extend_from_slice(stop.as_bytes());
            }
            Message::Headers(headers) => {
                write_compact_size(&mut out, headers.len() as u64);
                for raw in headers {
                    out.extend_from_slice(raw);
                    // trailing tx count, always zero in a headers message
                    write_compact_size(&mut out, 0);
                }
            }
            Message::GetData(items) | Message::Inv(items) | Message::NotFound(items) => {
                write_compact_size(&mut out, items.len() as u64);
                for item in items {
                    out.extend_from_slice(&item.kind.to_u32().to_le_bytes());
                    out.extend_from_slice(item.hash.as_bytes());
                }
            }
            Message::Block(raw) => {
                out.extend_from_slice(raw);
            }
            Message::GetCfHeaders {
                filter_type,
                start_height,
                stop,
            }
            | Message::GetCfilters {
                filter_type,
                start_height,
                stop,
            } => {
                out.push(*filter_type);
                out.extend_from_slice(&start_height.to_le_bytes());
                out.extend_from_slice(stop.as_bytes());
            }
            Message::CfHeaders {
                filter_type,
                stop,
                previous,
                hashes,
            } => {
                out.push(*filter_type);
                out.extend_from_slice(stop.as_bytes());
                out.extend_from_slice(previous.as_bytes());
                write_compact_size(&mut out, hashes.len() as u64);
                for hash in hashes {
                    out.extend_from_slice(hash.as_bytes());
                }
            }
            Message::Cfilter {
                filter_type,
                block,
                filter,
            } => {
                out.push(*filter_type);
                out.extend_from_slice(block.as_bytes());
                write_compact_size(&mut out, filter.len() as u64);
                out.extend_from_slice(filter);
            }
            Message::GetCfCheckpt { filter_type, stop } => {
                out.push(*filter_type);
                out.extend_from_slice(stop.as_bytes());
            }
            Message::CfCheckpt {
                filter_type,
                stop,
                headers,
            } => {
                out.push(*filter_type);
                out.extend_from_slice(stop.as_bytes());
                write_compact_size(&mut out, headers.len() as u64);
                for header in headers {
                    out.extend_from_slice(header.as_bytes());
                }
            }
            Message::FilterLoad {
                filter,
                hash_funcs,
                tweak,
                flags,
            } => {
                write_compact_size(&mut out, filter.len() as u64);
                out.extend_from_slice(filter);
                out.extend_from_slice(&hash_funcs.to_le_bytes());
                out.extend_from_slice(&tweak.to_le_bytes());
                out.push(*flags);
            }
            Message::FilterAdd(data) => {
                write_compact_size(&mut out, data.len() as u64);
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Decode a payload for the given command token
    pub fn decode(command: &str, payload: &[u8]) -> Result<Message, WireError> {
        let mut cursor = Cursor::new(payload);
        let message = match command {
            "version" => {
                let version = cursor.read_i32::<LittleEndian>().map_err(|_| truncated())?;
                let services = cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?;
                let timestamp = cursor.read_i64::<LittleEndian>().map_err(|_| truncated())?;
                let receiver = NetAddress::decode(&mut cursor)?;
                let sender = NetAddress::decode(&mut cursor)?;
                let nonce = cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?;
                let agent_len = read_compact_size(&mut cursor)?;
                if agent_len > 256 {
                    return Err(WireError::Malformed("oversized user agent".to_string()));
                }
                let agent_bytes = read_bytes(&mut cursor, agent_len as usize)?;
                let user_agent = String::from_utf8_lossy(&agent_bytes).to_string();
                let start_height = cursor.read_i32::<LittleEndian>().map_err(|_| truncated())?;
                // relay is absent in old protocol versions
                let relay = cursor.read_u8().map(|b| b != 0).unwrap_or(true);
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    receiver,
                    sender,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            "verack" => Message::Verack,
            "ping" => Message::Ping(cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?),
            "pong" => Message::Pong(cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?),
            "getaddr" => Message::GetAddr,
            "addr" => {
                let count = read_compact_size(&mut cursor)?;
                if count > 1000 {
                    return Err(WireError::Malformed("oversized addr list".to_string()));
                }
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let time = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
                    let address = NetAddress::decode(&mut cursor)?;
                    entries.push(TimestampedAddress { time, address });
                }
                Message::Addr(entries)
            }
            "getheaders" => {
                let version = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
                let count = read_compact_size(&mut cursor)?;
                if count > 2000 {
                    return Err(WireError::Malformed("oversized locator".to_string()));
                }
                let mut locator = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    locator.push(read_hash(&mut cursor)?);
                }
                let stop = read_hash(&mut cursor)?;
                Message::GetHeaders {
                    version,
                    locator,
                    stop,
                }
            }
            "headers" => {
                let count = read_compact_size(&mut cursor)?;
                if count > 2000 {
                    return Err(WireError::Malformed("oversized headers batch".to_string()));
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    headers.push(read_bytes(&mut cursor, 80)?);
                    // skip the trailing tx count
                    read_compact_size(&mut cursor)?;
                }
                Message::Headers(headers)
            }
            "getdata" | "inv" | "notfound" => {
                let count = read_compact_size(&mut cursor)?;
                if count > 50_000 {
                    return Err(WireError::Malformed("oversized inventory".to_string()));
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let kind = InventoryKind::from_u32(
                        cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?,
                    );
                    let hash = read_hash(&mut cursor)?;
                    items.push(Inventory { kind, hash });
                }
                match command {
                    "getdata" => Message::GetData(items),
                    "inv" => Message::Inv(items),
                    _ => Message::NotFound(items),
                }
            }
            "block" => Message::Block(payload.to_vec()),
            "getcfheaders" | "getcfilters" => {
                let filter_type = cursor.read_u8().map_err(|_| truncated())?;
                let start_height = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
                let stop = read_hash(&mut cursor)?;
                if command == "getcfheaders" {
                    Message::GetCfHeaders {
                        filter_type,
                        start_height,
                        stop,
                    }
                } else {
                    Message::GetCfilters {
                        filter_type,
                        start_height,
                        stop,
                    }
                }
            }
            "cfheaders" => {
                let filter_type = cursor.read_u8().map_err(|_| truncated())?;
                let stop = read_hash(&mut cursor)?;
                let previous = read_hash(&mut cursor)?;
                let count = read_compact_size(&mut cursor)?;
                if count > 2000 {
                    return Err(WireError::Malformed("oversized cfheaders".to_string()));
                }
                let mut hashes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    hashes.push(read_hash(&mut cursor)?);
                }
                Message::CfHeaders {
                    filter_type,
                    stop,
                    previous,
                    hashes,
                }
            }
            "cfilter" => {
                let filter_type = cursor.read_u8().map_err(|_| truncated())?;
                let block = read_hash(&mut cursor)?;
                let len = read_compact_size(&mut cursor)?;
                if len as usize > payload.len() {
                    return Err(truncated());
                }
                let filter = read_bytes(&mut cursor, len as usize)?;
                Message::Cfilter {
                    filter_type,
                    block,
                    filter,
                }
            }
            "getcfcheckpt" => {
                let filter_type = cursor.read_u8().map_err(|_| truncated())?;
                let stop = read_hash(&mut cursor)?;
                Message::GetCfCheckpt { filter_type, stop }
            }
            "cfcheckpt" => {
                let filter_type = cursor.read_u8().map_err(|_| truncated())?;
                let stop = read_hash(&mut cursor)?;
                let count = read_compact_size(&mut cursor)?;
                if count > 100_000 {
                    return Err(WireError::Malformed("oversized cfcheckpt".to_string()));
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    headers.push(read_hash(&mut cursor)?);
                }
                Message::CfCheckpt {
                    filter_type,
                    stop,
                    headers,
                }
            }
            "mempool" => Message::Mempool,
            "filterload" => {
                let len = read_compact_size(&mut cursor)?;
                if len > 36_000 {
                    return Err(WireError::Malformed("oversized bloom filter".to_string()));
                }
                let filter = read_bytes(&mut cursor, len as usize)?;
                let hash_funcs = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
                let tweak = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
                let flags = cursor.read_u8().map_err(|_| truncated())?;
                Message::FilterLoad {
                    filter,
                    hash_funcs,
                    tweak,
                    flags,
                }
            }
            "filteradd" => {
                let len = read_compact_size(&mut cursor)?;
                if len > 520 {
                    return Err(WireError::Malformed("oversized filter element".to_string()));
                }
                Message::FilterAdd(read_bytes(&mut cursor, len as usize)?)
            }
            "filterclear" => Message::FilterClear,
            "sendheaders" => Message::SendHeaders,
            other => return Err(WireError::UnknownCommand(other.to_string())),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let payload = message.encode();
        let decoded = Message::decode(message.command(), &payload).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_version_round_trip() {
        round_trip(Message::Version(VersionMessage {
            version: 70015,
            services: 1 | (1 << 6),
            timestamp: 1_600_000_000,
            receiver: NetAddress::from_ipv4(0, [127, 0, 0, 1], 8333),
            sender: NetAddress::from_ipv4(1, [10, 0, 0, 2], 18444),
            nonce: 0xdead_beef_cafe_babe,
            user_agent: "/rustylight:0.1.0/".to_string(),
            start_height: 650_000,
            relay: true,
        }));
    }

    #[test]
    fn test_empty_payload_messages() {
        for message in [
            Message::Verack,
            Message::GetAddr,
            Message::Mempool,
            Message::FilterClear,
            Message::SendHeaders,
        ] {
            assert!(message.encode().is_empty());
            round_trip(message);
        }
    }

    #[test]
    fn test_ping_pong_round_trip() {
        round_trip(Message::Ping(42));
        round_trip(Message::Pong(42));
    }

    #[test]
    fn test_addr_round_trip() {
        round_trip(Message::Addr(vec![
            TimestampedAddress {
                time: 1_600_000_000,
                address: NetAddress::from_ipv4(1, [1, 2, 3, 4], 8333),
            },
            TimestampedAddress {
                time: 1_600_000_100,
                address: NetAddress::from_ipv6(1 << 6, [0xfe; 16], 18333),
            },
        ]));
    }

    #[test]
    fn test_getheaders_round_trip() {
        round_trip(Message::GetHeaders {
            version: 70015,
            locator: vec![Hash([1u8; 32]), Hash([2u8; 32])],
            stop: Hash::ZERO,
        });
    }

    #[test]
    fn test_headers_round_trip() {
        round_trip(Message::Headers(vec![vec![0u8; 80], vec![1u8; 80]]));
    }

    #[test]
    fn test_inventory_round_trip() {
        let items = vec![
            Inventory {
                kind: InventoryKind::Block,
                hash: Hash([3u8; 32]),
            },
            Inventory {
                kind: InventoryKind::Tx,
                hash: Hash([4u8; 32]),
            },
        ];
        round_trip(Message::Inv(items.clone()));
        round_trip(Message::GetData(items.clone()));
        round_trip(Message::NotFound(items));
    }

    #[test]
    fn test_cfilter_round_trip() {
        round_trip(Message::Cfilter {
            filter_type: 0,
            block: Hash([5u8; 32]),
            filter: hex::decode("017fa880").unwrap(),
        });
    }

    #[test]
    fn test_cfheaders_round_trip() {
        round_trip(Message::CfHeaders {
            filter_type: 0,
            stop: Hash([6u8; 32]),
            previous: Hash([7u8; 32]),
            hashes: vec![Hash([8u8; 32]), Hash([9u8; 32])],
        });
    }

    #[test]
    fn test_cf_request_round_trips() {
        round_trip(Message::GetCfHeaders {
            filter_type: 0,
            start_height: 100,
            stop: Hash([1u8; 32]),
        });
        round_trip(Message::GetCfilters {
            filter_type: 0,
            start_height: 200,
            stop: Hash([2u8; 32]),
        });
        round_trip(Message::GetCfCheckpt {
            filter_type: 0,
            stop: Hash([3u8; 32]),
        });
        round_trip(Message::CfCheckpt {
            filter_type: 0,
            stop: Hash([3u8; 32]),
            headers: vec![Hash([4u8; 32])],
        });
    }

    #[test]
    fn test_bloom_messages_round_trip() {
        round_trip(Message::FilterLoad {
            filter: vec![0xff; 16],
            hash_funcs: 11,
            tweak: 99,
            flags: 1,
        });
        round_trip(Message::FilterAdd(vec![0xaa; 20]));
    }

    #[test]
    fn test_block_round_trip() {
        round_trip(Message::Block(vec![0x42; 300]));
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            Message::decode("frobnicate", &[]),
            Err(WireError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_truncated_version_rejected() {
        let payload = Message::Ping(1).encode();
        assert!(Message::decode("version", &payload).is_err());
    }

    #[test]
    fn test_v4_mapped_detection() {
        let v4 = NetAddress::from_ipv4(0, [8, 8, 8, 8], 53);
        let (network, bytes) = v4.network_and_bytes();
        assert_eq!(network, Network::Ipv4);
        assert_eq!(bytes, vec![8, 8, 8, 8]);

        let v6 = NetAddress::from_ipv6(0, [0xab; 16], 53);
        let (network, bytes) = v6.network_and_bytes();
        assert_eq!(network, Network::Ipv6);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_oversized_addr_list_rejected() {
        let mut payload = Vec::new();
        write_compact_size(&mut payload, 1001);
        assert!(Message::decode("addr", &payload).is_err());
    }
}
