/// Binary message framing
///
/// Frame layout: magic (4, chain-specific) | command (12, null-padded
/// ASCII) | payload length (4, LE) | checksum (4, first bytes of
/// SHA-256d(payload)) | payload.
///
/// Bad magic and oversized payloads are fatal for a connection. A bad
/// checksum or unknown command only costs the one frame.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::sha256d;

pub const COMMAND_SIZE: usize = 12;
pub const FRAME_HEADER_SIZE: usize = 24;

/// Frames advertising more than this are a protocol violation
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug)]
pub enum WireError {
    BadMagic([u8; 4]),
    BadChecksum,
    UnknownCommand(String),
    OversizedPayload(usize),
    Malformed(String),
    Io(std::io::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::BadMagic(magic) => write!(f, "bad magic: {}", hex::encode(magic)),
            WireError::BadChecksum => write!(f, "payload checksum mismatch"),
            WireError::UnknownCommand(cmd) => write!(f, "unknown command: {}", cmd),
            WireError::OversizedPayload(size) => write!(f, "oversized payload: {} bytes", size),
            WireError::Malformed(msg) => write!(f, "malformed message: {}", msg),
            WireError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}

/// Fatal errors tear the connection down; the rest drop one frame
impl WireError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::BadMagic(_) | WireError::OversizedPayload(_) | WireError::Io(_)
        )
    }
}

/// First four bytes of SHA-256d over the payload
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest.0[0], digest.0[1], digest.0[2], digest.0[3]]
}

/// Append a compact-size varint
pub fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Read a compact-size varint from the cursor
pub fn read_compact_size(cursor: &mut Cursor<&[u8]>) -> Result<u64, WireError> {
    let tag = ReadBytesExt::read_u8(cursor)
        .map_err(|_| WireError::Malformed("truncated varint".to_string()))?;
    let value = match tag {
        0xfd => ReadBytesExt::read_u16::<LittleEndian>(cursor)
            .map_err(|_| WireError::Malformed("truncated varint".to_string()))? as u64,
        0xfe => ReadBytesExt::read_u32::<LittleEndian>(cursor)
            .map_err(|_| WireError::Malformed("truncated varint".to_string()))? as u64,
        0xff => ReadBytesExt::read_u64::<LittleEndian>(cursor)
            .map_err(|_| WireError::Malformed("truncated varint".to_string()))?,
        other => other as u64,
    };
    Ok(value)
}

/// Read exactly `len` bytes from the cursor
pub fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, WireError> {
    let mut out = vec![0u8; len];
    Read::read_exact(cursor, &mut out)
        .map_err(|_| WireError::Malformed("truncated field".to_string()))?;
    Ok(out)
}

/// One decoded frame: command plus raw payload
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Frame {
    pub command: [u8; COMMAND_SIZE],
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: &str, payload: Vec<u8>) -> Frame {
        let mut cmd = [0u8; COMMAND_SIZE];
        let bytes = command.as_bytes();
        cmd[..bytes.len().min(COMMAND_SIZE)]
            .copy_from_slice(&bytes[..bytes.len().min(COMMAND_SIZE)]);
        Frame {
            command: cmd,
            payload,
        }
    }

    /// Command with null padding stripped
    pub fn command_str(&self) -> String {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_SIZE);
        String::from_utf8_lossy(&self.command[..end]).to_string()
    }

    /// Full wire serialization including header
    pub fn encode(&self, magic: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&magic);
        out.extend_from_slice(&self.command);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&checksum(&self.payload));
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a complete frame from a byte slice, validating magic and
    /// checksum. Returns the frame and the number of bytes consumed.
    pub fn decode(magic: [u8; 4], bytes: &[u8]) -> Result<(Frame, usize), WireError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(WireError::Malformed("truncated frame header".to_string()));
        }
        if bytes[..4] != magic {
            let mut found = [0u8; 4];
            found.copy_from_slice(&bytes[..4]);
            return Err(WireError::BadMagic(found));
        }

        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&bytes[4..16]);
        let length = u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(WireError::OversizedPayload(length));
        }
        if bytes.len() < FRAME_HEADER_SIZE + length {
            return Err(WireError::Malformed("truncated frame body".to_string()));
        }

        let payload = bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length].to_vec();
        let mut expected = [0u8; 4];
        expected.copy_from_slice(&bytes[20..24]);
        if checksum(&payload) != expected {
            return Err(WireError::BadChecksum);
        }

        Ok((
            Frame { command, payload },
            FRAME_HEADER_SIZE + length,
        ))
    }
}

/// Read one frame from the socket, validating magic, size, and checksum
pub async fn read_frame<R>(reader: &mut R, magic: [u8; 4]) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    if header[..4] != magic {
        let mut found = [0u8; 4];
        found.copy_from_slice(&header[..4]);
        return Err(WireError::BadMagic(found));
    }

    let mut command = [0u8; COMMAND_SIZE];
    command.copy_from_slice(&header[4..16]);
    let length = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(WireError::OversizedPayload(length));
    }
    let mut expected = [0u8; 4];
    expected.copy_from_slice(&header[20..24]);

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    if checksum(&payload) != expected {
        return Err(WireError::BadChecksum);
    }

    Ok(Frame { command, payload })
}

/// Write one framed message to the socket
pub async fn write_frame<W>(
    writer: &mut W,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::new(command, payload.to_vec());
    writer.write_all(&frame.encode(magic)).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[test]
    fn test_compact_size_round_trip() {
        for value in [
            0u64,
            1,
            0xfc,
            0xfd,
            0xffff,
            0x10000,
            0xffff_ffff,
            0x1_0000_0000,
            u64::MAX,
        ] {
            let mut out = Vec::new();
            write_compact_size(&mut out, value);
            let mut cursor = Cursor::new(out.as_slice());
            assert_eq!(read_compact_size(&mut cursor).unwrap(), value);
            assert_eq!(cursor.position() as usize, out.len());
        }
    }

    #[test]
    fn test_compact_size_widths() {
        let mut out = Vec::new();
        write_compact_size(&mut out, 0xfc);
        assert_eq!(out.len(), 1);

        out.clear();
        write_compact_size(&mut out, 0xfd);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], 0xfd);

        out.clear();
        write_compact_size(&mut out, 0x10000);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], 0xfe);

        out.clear();
        write_compact_size(&mut out, 0x1_0000_0000);
        assert_eq!(out.len(), 9);
        assert_eq!(out[0], 0xff);
    }

    #[test]
    fn test_truncated_compact_size() {
        let bytes = [0xfdu8, 0x01];
        let mut cursor = Cursor::new(&bytes[..]);
        assert!(read_compact_size(&mut cursor).is_err());
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::new("ping", vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let encoded = frame.encode(MAGIC);
        let (decoded, consumed) = Frame::decode(MAGIC, &encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
        assert_eq!(decoded.command_str(), "ping");
    }

    #[test]
    fn test_frame_empty_payload() {
        let frame = Frame::new("verack", Vec::new());
        let encoded = frame.encode(MAGIC);
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        let (decoded, _) = Frame::decode(MAGIC, &encoded).unwrap();
        assert_eq!(decoded.command_str(), "verack");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_bad_magic_detected() {
        let frame = Frame::new("ping", vec![0; 8]);
        let encoded = frame.encode(MAGIC);
        let err = Frame::decode([0xde, 0xad, 0xbe, 0xef], &encoded).unwrap_err();
        assert!(matches!(err, WireError::BadMagic(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bad_checksum_detected() {
        let frame = Frame::new("ping", vec![0; 8]);
        let mut encoded = frame.encode(MAGIC);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let err = Frame::decode(MAGIC, &encoded).unwrap_err();
        assert!(matches!(err, WireError::BadChecksum));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_oversized_payload_detected() {
        let mut encoded = Frame::new("block", Vec::new()).encode(MAGIC);
        encoded[16..20].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes());
        let err = Frame::decode(MAGIC, &encoded).unwrap_err();
        assert!(matches!(err, WireError::OversizedPayload(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_async_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, MAGIC, "headers", &[0x00])
            .await
            .unwrap();
        let frame = read_frame(&mut server, MAGIC).await.unwrap();
        assert_eq!(frame.command_str(), "headers");
        assert_eq!(frame.payload, vec![0x00]);
    }

    #[tokio::test]
    async fn test_async_bad_magic() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, [1, 2, 3, 4], "ping", &[])
            .await
            .unwrap();
        let err = read_frame(&mut server, MAGIC).await.unwrap_err();
        assert!(matches!(err, WireError::BadMagic(_)));
    }
}
