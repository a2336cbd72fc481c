//! Block file
//!
//! Append-only block storage shared by the doc store, the index and headers.
//!
//! ## Block Format
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────────┐
//! │ Kind (1) │ Len (4)  │ CRC (4)  │ Payload (Len bytes) │
//! └──────────┴──────────┴──────────┴─────────────────────┘
//! ```
//! A block id is the byte offset of the block's frame.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::error::{CinderError, Result};
use crate::types::BlockId;

/// Frame size: Kind (1) + Len (4) + CRC (4) = 9 bytes
pub const BLOCK_HEADER_SIZE: u64 = 9;

/// Largest payload a single block may carry
pub const MAX_BLOCK_PAYLOAD: usize = u32::MAX as usize;

/// What a block holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    /// A document record (key + body)
    Doc = 1,
    /// A serialized key tree root
    KeyRoot = 2,
    /// A serialized sequence tree root
    SeqRoot = 3,
    /// A database header
    Header = 4,
}

impl BlockKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(BlockKind::Doc),
            2 => Some(BlockKind::KeyRoot),
            3 => Some(BlockKind::SeqRoot),
            4 => Some(BlockKind::Header),
            _ => None,
        }
    }
}

/// Byte-level storage for one generation.
///
/// Implementations are opaque block stores: they frame and checksum
/// payloads but never interpret them.
pub trait BlockFile: Send + Sync {
    /// Append a block, returning its id
    fn append(&self, kind: BlockKind, payload: &[u8]) -> Result<BlockId>;

    /// Read and verify the block at `bid`
    fn read(&self, bid: BlockId) -> Result<(BlockKind, Vec<u8>)>;

    /// Ids of every header block, oldest first
    fn header_ids(&self) -> Vec<BlockId>;

    /// Make all appended blocks durable
    fn sync(&self) -> Result<()>;

    /// Current size in bytes
    fn size(&self) -> u64;

    /// Backing file, if any
    fn path(&self) -> Option<&Path>;

    /// Append a header block
    fn write_header(&self, bytes: &[u8]) -> Result<BlockId> {
        self.append(BlockKind::Header, bytes)
    }

    /// Read a header block
    fn read_header(&self, bid: BlockId) -> Result<Vec<u8>> {
        match self.read(bid)? {
            (BlockKind::Header, payload) => Ok(payload),
            (kind, _) => Err(CinderError::CorruptHeader(format!(
                "block {} is a {:?} block, not a header",
                bid, kind
            ))),
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

fn encode_frame(kind: BlockKind, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_BLOCK_PAYLOAD {
        return Err(CinderError::InvalidArgument(format!(
            "block payload of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(BLOCK_HEADER_SIZE as usize + payload.len());
    frame.push(kind as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn decode_frame_header(bid: BlockId, header: &[u8; BLOCK_HEADER_SIZE as usize]) -> Result<(BlockKind, usize, u32)> {
    let kind = BlockKind::from_u8(header[0])
        .ok_or_else(|| CinderError::Storage(format!("unknown block kind {} at {}", header[0], bid)))?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let crc = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
    Ok((kind, len, crc))
}

fn verify_payload(bid: BlockId, payload: &[u8], crc: u32) -> Result<()> {
    if crc32fast::hash(payload) != crc {
        return Err(CinderError::Storage(format!(
            "checksum mismatch in block {}",
            bid
        )));
    }
    Ok(())
}

// =============================================================================
// File Backend
// =============================================================================

struct FileInner {
    file: File,
    len: u64,
    headers: Vec<BlockId>,
}

/// Append-only block file on disk
pub struct FileBlockFile {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

impl FileBlockFile {
    /// Open or create a block file.
    ///
    /// The file is scanned front to back; the first torn or corrupt frame
    /// marks the end of valid data and everything after it is truncated.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let (valid_len, headers) = Self::scan(&file, file_len)?;
        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "truncating torn tail of block file"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileInner {
                file,
                len: valid_len,
                headers,
            }),
        })
    }

    /// Walk every frame, returning the end of valid data and the header ids
    fn scan(file: &File, file_len: u64) -> Result<(u64, Vec<BlockId>)> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;

        let mut offset = 0u64;
        let mut headers = Vec::new();
        let mut frame_header = [0u8; BLOCK_HEADER_SIZE as usize];

        while offset + BLOCK_HEADER_SIZE <= file_len {
            reader.read_exact(&mut frame_header)?;
            let (kind, len, crc) = match decode_frame_header(offset, &frame_header) {
                Ok(parsed) => parsed,
                Err(_) => break,
            };
            if offset + BLOCK_HEADER_SIZE + len as u64 > file_len {
                break;
            }
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload)?;
            if verify_payload(offset, &payload, crc).is_err() {
                break;
            }
            if kind == BlockKind::Header {
                headers.push(offset);
            }
            offset += BLOCK_HEADER_SIZE + len as u64;
        }

        Ok((offset, headers))
    }

    /// Path of the backing file
    pub fn file_path(&self) -> &Path {
        &self.path
    }
}

impl BlockFile for FileBlockFile {
    fn append(&self, kind: BlockKind, payload: &[u8]) -> Result<BlockId> {
        let frame = encode_frame(kind, payload)?;
        let mut inner = self.inner.lock();
        let bid = inner.len;
        inner.file.seek(SeekFrom::Start(bid))?;
        inner.file.write_all(&frame)?;
        inner.len += frame.len() as u64;
        if kind == BlockKind::Header {
            inner.headers.push(bid);
        }
        Ok(bid)
    }

    fn read(&self, bid: BlockId) -> Result<(BlockKind, Vec<u8>)> {
        let mut inner = self.inner.lock();
        if bid + BLOCK_HEADER_SIZE > inner.len {
            return Err(CinderError::Storage(format!(
                "block {} is past the end of {}",
                bid,
                self.path.display()
            )));
        }
        inner.file.seek(SeekFrom::Start(bid))?;
        let mut frame_header = [0u8; BLOCK_HEADER_SIZE as usize];
        inner.file.read_exact(&mut frame_header)?;
        let (kind, len, crc) = decode_frame_header(bid, &frame_header)?;
        let mut payload = vec![0u8; len];
        inner.file.read_exact(&mut payload)?;
        verify_payload(bid, &payload, crc)?;
        Ok((kind, payload))
    }

    fn header_ids(&self) -> Vec<BlockId> {
        self.inner.lock().headers.clone()
    }

    fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.inner.lock().len
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

#[derive(Default)]
struct MemInner {
    data: Vec<u8>,
    headers: Vec<BlockId>,
}

/// In-memory block file (tests and ephemeral databases)
#[derive(Default)]
pub struct MemBlockFile {
    inner: RwLock<MemInner>,
}

impl MemBlockFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite bytes in place (used to simulate corruption in tests)
    pub fn corrupt(&self, offset: u64, bytes: &[u8]) {
        let mut inner = self.inner.write();
        let start = offset as usize;
        let end = (start + bytes.len()).min(inner.data.len());
        if start < end {
            let n = end - start;
            inner.data[start..end].copy_from_slice(&bytes[..n]);
        }
    }
}

impl BlockFile for MemBlockFile {
    fn append(&self, kind: BlockKind, payload: &[u8]) -> Result<BlockId> {
        let frame = encode_frame(kind, payload)?;
        let mut inner = self.inner.write();
        let bid = inner.data.len() as u64;
        inner.data.extend_from_slice(&frame);
        if kind == BlockKind::Header {
            inner.headers.push(bid);
        }
        Ok(bid)
    }

    fn read(&self, bid: BlockId) -> Result<(BlockKind, Vec<u8>)> {
        let inner = self.inner.read();
        let start = bid as usize;
        let body_start = start + BLOCK_HEADER_SIZE as usize;
        if body_start > inner.data.len() {
            return Err(CinderError::Storage(format!(
                "block {} is past the end of the buffer",
                bid
            )));
        }
        let mut frame_header = [0u8; BLOCK_HEADER_SIZE as usize];
        frame_header.copy_from_slice(&inner.data[start..body_start]);
        let (kind, len, crc) = decode_frame_header(bid, &frame_header)?;
        let end = body_start + len;
        if end > inner.data.len() {
            return Err(CinderError::Storage(format!("block {} is truncated", bid)));
        }
        let payload = inner.data[body_start..end].to_vec();
        verify_payload(bid, &payload, crc)?;
        Ok((kind, payload))
    }

    fn header_ids(&self) -> Vec<BlockId> {
        self.inner.read().headers.clone()
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.inner.read().data.len() as u64
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}
