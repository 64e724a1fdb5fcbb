//! Length-prefixed, checksummed frames.
//!
//! Layout: `u32 LE body length | rmp-serde body | u32 LE crc32(body)`.
//! Used both for the persistent event log and for the TCP wire protocol.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HubError, StorageError};

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Frame decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Frame checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Frame truncated")]
    Truncated,
}

impl From<FrameError> for StorageError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => StorageError::Io(e),
            FrameError::Encode(e) => StorageError::Serialization(e.to_string()),
            other => StorageError::Corruption(other.to_string()),
        }
    }
}

impl From<FrameError> for HubError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => HubError::Io(e),
            other => HubError::Transport(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, FrameError>;

/// Encode a value into a complete frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(value)?;
    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

fn decode_body<T: DeserializeOwned>(body: &[u8], checksum: [u8; 4]) -> Result<T> {
    let expected = u32::from_le_bytes(checksum);
    let got = crc32fast::hash(body);
    if expected != got {
        return Err(FrameError::ChecksumMismatch { expected, got });
    }
    Ok(rmp_serde::from_slice(body)?)
}

fn check_len(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    Ok(())
}

/// Write one frame to a blocking writer.
pub fn write<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<usize> {
    let frame = encode(value)?;
    writer.write_all(&frame)?;
    Ok(frame.len())
}

/// Read one frame from a blocking reader.
///
/// Returns `Ok(None)` on a clean end of input (no bytes of a new frame).
/// A frame cut off part way is [`FrameError::Truncated`].
pub fn read<R: Read, T: DeserializeOwned>(reader: &mut R, max: usize) -> Result<Option<(T, usize)>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    check_len(len, max)?;

    let mut body = vec![0u8; len];
    let mut checksum = [0u8; 4];
    reader.read_exact(&mut body).map_err(truncated)?;
    reader.read_exact(&mut checksum).map_err(truncated)?;

    let value = decode_body(&body, checksum)?;
    Ok(Some((value, len + 8)))
}

/// Write one frame to an async writer and flush it.
pub async fn write_async<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from an async reader. `Ok(None)` on clean end of stream.
pub async fn read_async<R, T>(reader: &mut R, max: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    check_len(len, max)?;

    let mut body = vec![0u8; len];
    let mut checksum = [0u8; 4];
    reader.read_exact(&mut body).await.map_err(truncated)?;
    reader.read_exact(&mut checksum).await.map_err(truncated)?;

    decode_body(&body, checksum).map(Some)
}

fn truncated(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(e)
    }
}
