/// Golomb-coded set filters
///
/// A compact probabilistic set of byte strings keyed to a block. Elements
/// are hashed with SipHash-2-4 (keyed by the first 16 bytes of the block
/// hash), mapped into [0, N*M) with a 128-bit multiply-shift, sorted, and
/// the successive deltas are Golomb-Rice coded with parameter P.
///
/// Serialized form: compact-size(N) followed by the bit-packed payload.

use std::fmt;
use std::hash::Hasher;
use std::io::Cursor;

use siphasher::sip::SipHasher24;

use crate::types::{sha256d, BlockHash, FilterHash, FilterHeader};
use crate::wire::{read_compact_size, write_compact_size};

#[derive(Debug, PartialEq, Eq)]
pub enum GcsError {
    /// Truncated or otherwise undecodable bitstream
    MalformedFilter,
}

impl fmt::Display for GcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcsError::MalformedFilter => write!(f, "malformed filter"),
        }
    }
}

impl std::error::Error for GcsError {}

/// MSB-first bit packer
pub struct BitWriter {
    out: Vec<u8>,
    accum: u8,
    filled: usize,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter {
            out: Vec::new(),
            accum: 0,
            filled: 0,
        }
    }

    pub fn write(&mut self, nbits: usize, value: u64) {
        for i in (0..nbits).rev() {
            let bit = ((value >> i) & 1) as u8;
            self.accum = (self.accum << 1) | bit;
            self.filled += 1;
            if self.filled == 8 {
                self.out.push(self.accum);
                self.accum = 0;
                self.filled = 0;
            }
        }
    }

    /// Pad the final partial byte with zero bits
    pub fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.accum <<= 8 - self.filled;
            self.out.push(self.accum);
        }
        self.out
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// MSB-first bit reader
pub struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader { data, bit: 0 }
    }

    pub fn read_bit(&mut self) -> Result<bool, GcsError> {
        if self.bit >= self.data.len() * 8 {
            return Err(GcsError::MalformedFilter);
        }
        let byte = self.data[self.bit / 8];
        let bit = (byte >> (7 - self.bit % 8)) & 1;
        self.bit += 1;
        Ok(bit == 1)
    }

    pub fn read(&mut self, nbits: usize) -> Result<u64, GcsError> {
        let mut out = 0u64;
        for _ in 0..nbits {
            out = (out << 1) | u64::from(self.read_bit()?);
        }
        Ok(out)
    }
}

/// Filter key: the first 16 bytes of the block hash
pub fn block_hash_to_filter_key(block: &BlockHash) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&block.as_bytes()[..16]);
    key
}

/// SipHash-2-4 the item and map it into [0, range) with a 128-bit
/// multiply-shift
pub fn hash_to_range(key: &[u8; 16], range: u64, item: &[u8]) -> u64 {
    let k0 = u64::from_le_bytes(key[..8].try_into().unwrap());
    let k1 = u64::from_le_bytes(key[8..].try_into().unwrap());
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(item);
    let hash = hasher.finish();
    ((u128::from(hash) * u128::from(range)) >> 64) as u64
}

/// Hash every element into the filter range and sort the results
pub fn hashed_set_construct(key: &[u8; 16], n: u32, m: u32, items: &[Vec<u8>]) -> Vec<u64> {
    let range = u64::from(n) * u64::from(m);
    let mut out: Vec<u64> = items
        .iter()
        .map(|item| hash_to_range(key, range, item))
        .collect();
    out.sort_unstable();
    out
}

/// Golomb-Rice code the deltas of a sorted value set
pub fn golomb_encode(p: u8, sorted_values: &[u64]) -> Vec<u8> {
    let mut writer = BitWriter::new();
    let mut last = 0u64;
    for &value in sorted_values {
        let delta = value - last;
        last = value;

        // Quotient in unary: q one-bits then a zero
        let quotient = delta >> p;
        for _ in 0..quotient {
            writer.write(1, 1);
        }
        writer.write(1, 0);

        // P bits of remainder
        writer.write(p as usize, delta & ((1u64 << p) - 1));
    }
    writer.finish()
}

/// Reverse golomb_encode, returning the sorted value multiset
pub fn golomb_decode(p: u8, n: u32, payload: &[u8]) -> Result<Vec<u64>, GcsError> {
    let mut reader = BitReader::new(payload);
    let mut out = Vec::with_capacity(n as usize);
    let mut last = 0u64;
    for _ in 0..n {
        let mut quotient = 0u64;
        while reader.read_bit()? {
            quotient += 1;
        }
        let remainder = reader.read(p as usize)?;
        let delta = (quotient << p) | remainder;
        last += delta;
        out.push(last);
    }
    Ok(out)
}

/// SHA-256d of the serialized filter
pub fn filter_hash(filter_bytes: &[u8]) -> FilterHash {
    sha256d(filter_bytes)
}

/// Chained filter header: SHA-256d(filter hash || previous header)
pub fn filter_header(filter_bytes: &[u8], previous: &FilterHeader) -> FilterHeader {
    filter_header_from_hash(&filter_hash(filter_bytes), previous)
}

pub fn filter_header_from_hash(hash: &FilterHash, previous: &FilterHeader) -> FilterHeader {
    let mut preimage = Vec::with_capacity(64);
    preimage.extend_from_slice(hash.as_bytes());
    preimage.extend_from_slice(previous.as_bytes());
    sha256d(&preimage)
}

/// An encoded filter plus its parameters
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Gcs {
    p: u8,
    m: u32,
    key: [u8; 16],
    n: u32,
    /// Bit-packed payload, without the leading element count
    compressed: Vec<u8>,
}

impl Gcs {
    /// Build a filter over an element set. Duplicate elements count once.
    pub fn from_elements(p: u8, m: u32, key: [u8; 16], elements: &[Vec<u8>]) -> Gcs {
        let mut unique: Vec<Vec<u8>> = elements.to_vec();
        unique.sort();
        unique.dedup();

        let n = unique.len() as u32;
        let hashed = hashed_set_construct(&key, n, m, &unique);
        let compressed = golomb_encode(p, &hashed);

        Gcs {
            p,
            m,
            key,
            n,
            compressed,
        }
    }

    /// Reconstruct from an already-encoded payload (element count known)
    pub fn from_compressed(p: u8, m: u32, key: [u8; 16], n: u32, compressed: Vec<u8>) -> Gcs {
        Gcs {
            p,
            m,
            key,
            n,
            compressed,
        }
    }

    /// Parse the serialized form: compact-size(N) then payload
    pub fn from_serialized(p: u8, m: u32, key: [u8; 16], bytes: &[u8]) -> Result<Gcs, GcsError> {
        let mut cursor = Cursor::new(bytes);
        let n = read_compact_size(&mut cursor).map_err(|_| GcsError::MalformedFilter)?;
        if n > u64::from(u32::MAX) {
            return Err(GcsError::MalformedFilter);
        }
        let compressed = bytes[cursor.position() as usize..].to_vec();
        Ok(Gcs {
            p,
            m,
            key,
            n: n as u32,
            compressed,
        })
    }

    pub fn element_count(&self) -> u32 {
        self.n
    }

    /// Serialized form: compact-size(N) then the bit-packed payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.compressed.len());
        write_compact_size(&mut out, u64::from(self.n));
        out.extend_from_slice(&self.compressed);
        out
    }

    pub fn hash(&self) -> FilterHash {
        filter_hash(&self.encode())
    }

    pub fn header(&self, previous: &FilterHeader) -> FilterHeader {
        filter_header(&self.encode(), previous)
    }

    /// The sorted multiset of range values in this filter
    pub fn decode(&self) -> Result<Vec<u64>, GcsError> {
        golomb_decode(self.p, self.n, &self.compressed)
    }

    /// Probabilistic membership test for one target
    pub fn matches(&self, target: &[u8]) -> Result<bool, GcsError> {
        self.match_any(std::slice::from_ref(&target.to_vec()))
    }

    /// Probabilistic membership test for any of the targets
    pub fn match_any(&self, targets: &[Vec<u8>]) -> Result<bool, GcsError> {
        if self.n == 0 || targets.is_empty() {
            return Ok(false);
        }
        let decoded = self.decode()?;
        let range = u64::from(self.n) * u64::from(self.m);
        for target in targets {
            let mapped = hash_to_range(&self.key, range, target);
            if decoded.binary_search(&mapped).is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{genesis_filter, genesis_hash, genesis_output_script};
    use crate::types::{ChainKind, FilterFlavor, Hash};

    const P: u8 = 19;
    const M: u32 = 784_931;

    #[test]
    fn test_bit_writer_reader_round_trip() {
        let mut writer = BitWriter::new();
        writer.write(3, 0b101);
        writer.write(19, 0x7ffff);
        writer.write(1, 0);
        writer.write(13, 0x1234);
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(3).unwrap(), 0b101);
        assert_eq!(reader.read(19).unwrap(), 0x7ffff);
        assert_eq!(reader.read(1).unwrap(), 0);
        assert_eq!(reader.read(13).unwrap(), 0x1234);
    }

    #[test]
    fn test_bit_reader_eof() {
        let bytes = [0xffu8];
        let mut reader = BitReader::new(&bytes);
        assert!(reader.read(8).is_ok());
        assert_eq!(reader.read_bit(), Err(GcsError::MalformedFilter));
    }

    #[test]
    fn test_golomb_round_trip() {
        let values = vec![0u64, 1, 2, 500_000, 500_001, 1 << 40];
        let encoded = golomb_encode(P, &values);
        let decoded = golomb_decode(P, values.len() as u32, &encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_golomb_truncated_stream() {
        let values = vec![100u64, 200, 300];
        let encoded = golomb_encode(P, &values);
        let truncated = &encoded[..encoded.len() - 1];
        assert_eq!(
            golomb_decode(P, values.len() as u32, truncated),
            Err(GcsError::MalformedFilter)
        );
    }

    #[test]
    fn test_filter_round_trip_and_matches() {
        let key = block_hash_to_filter_key(&Hash::ZERO);
        let elements = vec![
            hex::decode("deadbeef").unwrap(),
            hex::decode("feedface").unwrap(),
            hex::decode("0102030405").unwrap(),
        ];

        let gcs = Gcs::from_elements(P, M, key, &elements);
        assert_eq!(gcs.element_count(), 3);

        let decoded = gcs.decode().unwrap();
        assert_eq!(
            decoded,
            hashed_set_construct(&key, 3, M, &{
                let mut sorted = elements.clone();
                sorted.sort();
                sorted
            })
        );

        for element in &elements {
            assert!(gcs.matches(element).unwrap());
        }
        assert!(!gcs.matches(&hex::decode("cafebabe").unwrap()).unwrap());
        assert!(gcs.match_any(&elements).unwrap());
        assert!(!gcs
            .match_any(&[hex::decode("cafebabe").unwrap()])
            .unwrap());
    }

    #[test]
    fn test_serialization_round_trip() {
        let key = block_hash_to_filter_key(&Hash([3u8; 32]));
        let elements = vec![vec![1u8; 32], vec![2u8; 32], vec![3u8; 32]];
        let gcs = Gcs::from_elements(P, M, key, &elements);

        let serialized = gcs.encode();
        let parsed = Gcs::from_serialized(P, M, key, &serialized).unwrap();
        assert_eq!(parsed, gcs);
        assert_eq!(parsed.hash(), gcs.hash());
    }

    #[test]
    fn test_duplicate_elements_count_once() {
        let key = block_hash_to_filter_key(&Hash([5u8; 32]));
        let gcs = Gcs::from_elements(P, M, key, &[vec![1, 2, 3], vec![1, 2, 3]]);
        assert_eq!(gcs.element_count(), 1);
    }

    #[test]
    fn test_mainnet_genesis_filter_reproduces() {
        let key = block_hash_to_filter_key(&genesis_hash(ChainKind::Bitcoin));
        let gcs = Gcs::from_elements(P, M, key, &[genesis_output_script()]);

        let (_, expected_filter) =
            genesis_filter(ChainKind::Bitcoin, FilterFlavor::BasicBip158).unwrap();
        assert_eq!(hex::encode(gcs.encode()), expected_filter);

        let (expected_header, _) =
            genesis_filter(ChainKind::Bitcoin, FilterFlavor::BasicBip158).unwrap();
        let header = gcs.header(&Hash::ZERO);
        assert_eq!(hex::encode(header.as_bytes()), expected_header);
    }

    #[test]
    fn test_testnet_genesis_filter_reproduces() {
        let key = block_hash_to_filter_key(&genesis_hash(ChainKind::BitcoinTestnet3));
        let gcs = Gcs::from_elements(P, M, key, &[genesis_output_script()]);

        let (expected_header, expected_filter) =
            genesis_filter(ChainKind::BitcoinTestnet3, FilterFlavor::BasicBip158).unwrap();
        assert_eq!(hex::encode(gcs.encode()), expected_filter);
        assert_eq!(
            hex::encode(gcs.header(&Hash::ZERO).as_bytes()),
            expected_header
        );
    }

    #[test]
    fn test_filter_header_chains() {
        let filter = hex::decode("017fa880").unwrap();
        let hash = filter_hash(&filter);
        let header0 = filter_header(&filter, &Hash::ZERO);
        assert_eq!(header0, filter_header_from_hash(&hash, &Hash::ZERO));

        // Chaining a second filter changes the header
        let header1 = filter_header(&filter, &header0);
        assert_ne!(header0, header1);
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let key = block_hash_to_filter_key(&Hash::ZERO);
        let gcs = Gcs::from_elements(P, M, key, &[]);
        assert_eq!(gcs.element_count(), 0);
        assert!(!gcs.matches(b"anything").unwrap());
    }
}
