/// Per-chain network parameters and genesis constants
///
/// Hash constants are written in internal byte order unless the name says
/// otherwise. Filter constants pair (genesis filter header, genesis filter
/// bytes) and must reproduce from re-encoding the genesis block; a test in
/// the filter store validates this.

use crate::chainwork::Work;
use crate::types::{
    BlockHeader, ChainKind, FilterFlavor, Hash, Height, HeaderStatus, Protocol,
};

/// Wire protocol version advertised in version messages
pub const PROTOCOL_VERSION: u32 = 70015;

/// User agent advertised in version messages
pub const USER_AGENT: &str = "/rustylight:0.1.0/";

pub struct ChainParams {
    pub chain: ChainKind,
    /// First four bytes of every frame
    pub magic: [u8; 4],
    pub default_port: u16,
    pub p2p_protocol: Protocol,
    pub dns_seeds: &'static [&'static str],
    /// 80-byte genesis header, wire serialization
    pub genesis_header_hex: &'static str,
    /// Genesis block hash, internal order
    pub genesis_hash_hex: &'static str,
    pub default_filter_flavor: FilterFlavor,
    /// Known-good pin applied at startup when configured
    pub checkpoint: Option<(Height, &'static str)>,
}

const BITCOIN_GENESIS_HEADER: &str = "010000000000000000000000000000000000000000000000000000000000000000000000\
     3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

const TESTNET3_GENESIS_HEADER: &str = "010000000000000000000000000000000000000000000000000000000000000000000000\
     3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff001d1aa4ae18";

const UNITTEST_GENESIS_HEADER: &str = "010000000000000000000000000000000000000000000000000000000000000000000000\
     3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff7f2002000000";

static BITCOIN_PARAMS: ChainParams = ChainParams {
    chain: ChainKind::Bitcoin,
    magic: [0xf9, 0xbe, 0xb4, 0xd9],
    default_port: 8333,
    p2p_protocol: Protocol::Bitcoin,
    dns_seeds: &[
        "seed.bitcoin.sipa.be",
        "dnsseed.bluematt.me",
        "dnsseed.bitcoin.dashjr.org",
        "seed.bitcoinstats.com",
        "seed.btc.petertodd.org",
    ],
    genesis_header_hex: BITCOIN_GENESIS_HEADER,
    genesis_hash_hex: "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000",
    default_filter_flavor: FilterFlavor::BasicBip158,
    checkpoint: None,
};

static TESTNET3_PARAMS: ChainParams = ChainParams {
    chain: ChainKind::BitcoinTestnet3,
    magic: [0x0b, 0x11, 0x09, 0x07],
    default_port: 18333,
    p2p_protocol: Protocol::Bitcoin,
    dns_seeds: &[
        "testnet-seed.bitcoin.jonasschnelli.ch",
        "seed.tbtc.petertodd.org",
        "testnet-seed.bluematt.me",
    ],
    genesis_header_hex: TESTNET3_GENESIS_HEADER,
    genesis_hash_hex: "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000",
    default_filter_flavor: FilterFlavor::BasicBip158,
    checkpoint: None,
};

static BCH_PARAMS: ChainParams = ChainParams {
    chain: ChainKind::BitcoinCash,
    magic: [0xe3, 0xe1, 0xf3, 0xe8],
    default_port: 8333,
    p2p_protocol: Protocol::Bitcoin,
    dns_seeds: &[
        "seed.bchd.cash",
        "seed.bch.loping.net",
        "dnsseed.electroncash.de",
    ],
    genesis_header_hex: BITCOIN_GENESIS_HEADER,
    genesis_hash_hex: "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000",
    default_filter_flavor: FilterFlavor::BasicBch,
    checkpoint: Some((
        609_136,
        "b1c55b4f69aa2e3209c91ae413c355c65aacfa07b28bb4000000000000000000",
    )),
};

static BCH_TESTNET3_PARAMS: ChainParams = ChainParams {
    chain: ChainKind::BitcoinCashTestnet3,
    magic: [0xf4, 0xe5, 0xf3, 0xf4],
    default_port: 18333,
    p2p_protocol: Protocol::Bitcoin,
    dns_seeds: &["testnet-seed.bchd.cash", "seed.tbch.loping.net"],
    genesis_header_hex: TESTNET3_GENESIS_HEADER,
    genesis_hash_hex: "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000",
    default_filter_flavor: FilterFlavor::BasicBch,
    checkpoint: Some((
        1_341_712,
        "5ba3af2992073940ed9e5a9d9eef9194bbfba905d92b202eea44fcff00000000",
    )),
};

static UNITTEST_PARAMS: ChainParams = ChainParams {
    chain: ChainKind::UnitTest,
    magic: [0xfa, 0xbf, 0xb5, 0xda],
    default_port: 18444,
    p2p_protocol: Protocol::Bitcoin,
    dns_seeds: &[],
    genesis_header_hex: UNITTEST_GENESIS_HEADER,
    genesis_hash_hex: "06226e46111a0b59caaf126043eb5bbf28c34f3a5e332a1fc7b2b73cf188910f",
    default_filter_flavor: FilterFlavor::BasicBip158,
    checkpoint: None,
};

pub fn chain_params(chain: ChainKind) -> &'static ChainParams {
    match chain {
        ChainKind::Bitcoin => &BITCOIN_PARAMS,
        ChainKind::BitcoinTestnet3 => &TESTNET3_PARAMS,
        ChainKind::BitcoinCash => &BCH_PARAMS,
        ChainKind::BitcoinCashTestnet3 => &BCH_TESTNET3_PARAMS,
        ChainKind::UnitTest => &UNITTEST_PARAMS,
    }
}

pub fn genesis_hash(chain: ChainKind) -> Hash {
    Hash::from_internal_hex(chain_params(chain).genesis_hash_hex)
        .expect("chain table carries a valid genesis hash")
}

/// Known-good checkpoint shipped for this chain, applied at node start
pub fn builtin_checkpoint(chain: ChainKind) -> Option<(Height, Hash)> {
    chain_params(chain).checkpoint.map(|(height, hex)| {
        let hash = Hash::from_internal_hex(hex)
            .expect("chain table carries a valid checkpoint hash");
        (height, hash)
    })
}

/// The genesis header with full metadata: height 0, cumulative work equal
/// to its own proof, Normal status.
pub fn genesis_header(chain: ChainKind) -> BlockHeader {
    let raw = genesis_header_bytes(chain);
    let mut header = BlockHeader::from_wire(&raw).expect("genesis header constant is 80 bytes");
    header.height = 0;
    header.work = header.pow;
    header.parent_work = Work::zero();
    header.status = HeaderStatus::Normal;
    header
}

pub fn genesis_header_bytes(chain: ChainKind) -> Vec<u8> {
    let compact: String = chain_params(chain)
        .genesis_header_hex
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    hex::decode(compact).expect("genesis header constant is valid hex")
}

/// Output script of the genesis coinbase, the sole element of the genesis
/// basic filter. Identical across the bitcoin-family chains supported here.
pub const GENESIS_OUTPUT_SCRIPT_HEX: &str = "4104678afdb0fe5548271967f1a67130b7105cd6a828e039\
     09a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac";

pub fn genesis_output_script() -> Vec<u8> {
    let compact: String = GENESIS_OUTPUT_SCRIPT_HEX
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    hex::decode(compact).expect("genesis script constant is valid hex")
}

/// Element set for the genesis filter of a given flavor. The extended
/// flavor covers a superset: the output script plus the coinbase txid.
pub fn genesis_filter_elements(chain: ChainKind, flavor: FilterFlavor) -> Vec<Vec<u8>> {
    let script = genesis_output_script();
    match flavor {
        FilterFlavor::BasicBip158 | FilterFlavor::BasicBch => vec![script],
        FilterFlavor::Extended => {
            let coinbase_txid = genesis_header(chain).merkle_root;
            vec![script, coinbase_txid.as_bytes().to_vec()]
        }
    }
}

/// Hard-coded (filter header, filter bytes) hex pairs, internal order.
/// Only the default flavors of the production chains are pinned; other
/// (chain, flavor) combinations are derived by re-encoding at seed time.
pub fn genesis_filter(chain: ChainKind, flavor: FilterFlavor) -> Option<(&'static str, &'static str)> {
    match (chain, flavor) {
        (ChainKind::Bitcoin, FilterFlavor::BasicBip158)
        | (ChainKind::BitcoinCash, FilterFlavor::BasicBch) => Some((
            "9f3c30f0c37fb977cf3e1a3173c631e8ff119ad3088b6f5b2bced0802139c202",
            "017fa880",
        )),
        (ChainKind::BitcoinTestnet3, FilterFlavor::BasicBip158)
        | (ChainKind::BitcoinCashTestnet3, FilterFlavor::BasicBch) => Some((
            "50b781aed7b7129012a6d20e2d040027937f3affaee573779908ebb779455821",
            "019dfca8",
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sha256d;

    #[test]
    fn test_genesis_header_hashes() {
        for chain in [
            ChainKind::Bitcoin,
            ChainKind::BitcoinTestnet3,
            ChainKind::BitcoinCash,
            ChainKind::BitcoinCashTestnet3,
            ChainKind::UnitTest,
        ] {
            let header = genesis_header(chain);
            assert_eq!(
                header.hash,
                genesis_hash(chain),
                "genesis hash mismatch for {}",
                chain
            );
            assert_eq!(header.height, 0);
            assert!(header.work > Work::zero());
        }
    }

    #[test]
    fn test_mainnet_genesis_display_hash() {
        assert_eq!(
            format!("{:x}", genesis_hash(ChainKind::Bitcoin)),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_genesis_header_bytes_len() {
        assert_eq!(genesis_header_bytes(ChainKind::Bitcoin).len(), 80);
        assert_eq!(genesis_header_bytes(ChainKind::UnitTest).len(), 80);
    }

    #[test]
    fn test_genesis_filter_header_chains_from_filter() {
        // header = sha256d(filter_hash || previous), previous = zero at genesis
        let (header_hex, filter_hex) =
            genesis_filter(ChainKind::Bitcoin, FilterFlavor::BasicBip158).unwrap();
        let filter = hex::decode(filter_hex).unwrap();
        let filter_hash = sha256d(&filter);

        let mut preimage = Vec::with_capacity(64);
        preimage.extend_from_slice(filter_hash.as_bytes());
        preimage.extend_from_slice(&[0u8; 32]);
        let header = sha256d(&preimage);

        assert_eq!(hex::encode(header.as_bytes()), header_hex);
    }

    #[test]
    fn test_testnet_genesis_filter_header_chains_from_filter() {
        let (header_hex, filter_hex) =
            genesis_filter(ChainKind::BitcoinTestnet3, FilterFlavor::BasicBip158).unwrap();
        let filter = hex::decode(filter_hex).unwrap();
        let filter_hash = sha256d(&filter);

        let mut preimage = Vec::with_capacity(64);
        preimage.extend_from_slice(filter_hash.as_bytes());
        preimage.extend_from_slice(&[0u8; 32]);
        let header = sha256d(&preimage);

        assert_eq!(hex::encode(header.as_bytes()), header_hex);
    }

    #[test]
    fn test_builtin_checkpoints_parse() {
        assert!(builtin_checkpoint(ChainKind::Bitcoin).is_none());
        assert!(builtin_checkpoint(ChainKind::UnitTest).is_none());

        let (height, hash) = builtin_checkpoint(ChainKind::BitcoinCash).unwrap();
        assert_eq!(height, 609_136);
        assert!(!hash.is_zero());

        let (height, hash) = builtin_checkpoint(ChainKind::BitcoinCashTestnet3).unwrap();
        assert_eq!(height, 1_341_712);
        assert!(!hash.is_zero());
    }

    #[test]
    fn test_magic_values_are_distinct() {
        let magics = [
            chain_params(ChainKind::Bitcoin).magic,
            chain_params(ChainKind::BitcoinTestnet3).magic,
            chain_params(ChainKind::BitcoinCash).magic,
            chain_params(ChainKind::BitcoinCashTestnet3).magic,
            chain_params(ChainKind::UnitTest).magic,
        ];
        for i in 0..magics.len() {
            for j in i + 1..magics.len() {
                assert_ne!(magics[i], magics[j]);
            }
        }
    }
}
