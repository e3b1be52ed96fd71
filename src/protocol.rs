//! Wire protocol for the warpsink framed transport
//!
//! All multi-byte integers are little-endian; booleans are one byte.
//! Every command starts with a one-byte magic. Decoders take an explicit
//! `end` bound and advance a cursor; encoders advance the cursor and fail
//! only when the destination buffer is too small.

use anyhow::{bail, Result};

use crate::checkpoint::Checkpoint;

/// Version this receiver speaks natively.
pub const PROTOCOL_VERSION: i32 = 12;
/// Oldest version we can downgrade to.
pub const MIN_SUPPORTED_VERSION: i32 = 10;
/// Footer frames (payload checksums) exist at and above this version.
pub const CHECKSUM_VERSION: i32 = 10;
/// Checkpoints carry partial-block progress at and above this version.
pub const CHECKPOINT_OFFSET_VERSION: i32 = 11;

/// Enough buffer for any single command header. Also the unit DONE (and
/// settings, in the file-chunks handshake) are padded to by senders.
pub const MIN_BUF_LENGTH: usize = 256;

pub const MAX_TRANSFER_ID_LENGTH: usize = 64;
pub const MAX_FILENAME_LENGTH: usize = 224;

// Decode bounds, counted from the start of the command (magic included).
pub const MAX_VERSION_LEN: usize = 1 + 5; // magic + varint(i32)
pub const MAX_SETTINGS_LEN: usize = 1 + MAX_TRANSFER_ID_LENGTH + 4 + 4 + 1;
pub const MAX_DONE_LEN: usize = 1 + 1 + 8 + 8;
pub const MAX_SIZE_LEN: usize = 1 + 8;
pub const MAX_FOOTER_LEN: usize = 1 + 4;
pub const MAX_ABORT_LEN: usize = 1 + 4 + 1 + 8;
pub const MAX_CHUNKS_CMD_LEN: usize = 1 + 8;
/// Upper bound on a whole FILE command header: magic, status, length
/// field, then the encoded block details. Kept at or above
/// MIN_BUF_LENGTH so the leftover copy-down rule always leaves room for
/// a full minimum read at the tail of the buffer.
pub const MAX_HEADER_LEN: usize = 1 + 1 + 2 + (2 + MAX_FILENAME_LENGTH + 8 * 4 + 1);

// Command magics (numeric values are wire-stable)
pub mod cmd {
    pub const DONE: u8 = 1;
    pub const FILE: u8 = 2;
    pub const SETTINGS: u8 = 3;
    pub const SIZE: u8 = 4;
    pub const FOOTER: u8 = 5;
    pub const CHUNKS: u8 = 6;
    pub const ACK: u8 = 7;
    pub const WAIT: u8 = 8;
    pub const ERR: u8 = 9;
    pub const ABORT: u8 = 10;
}

/// Closed error taxonomy. Numeric values appear in ABORT frames and in
/// sender status bytes, so they are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    Ok = 0,
    ConnError = 1,
    SocketReadError = 2,
    SocketWriteError = 3,
    ProtocolError = 4,
    VersionMismatch = 5,
    VersionIncompatible = 6,
    IdMismatch = 7,
    ChecksumMismatch = 8,
    FileWriteError = 9,
    MemoryAllocationError = 10,
    Aborted = 11,
}

impl ErrorKind {
    /// Decode a status byte received off the wire. Unknown values map to
    /// ProtocolError rather than failing the whole command.
    pub fn from_wire(b: u8) -> ErrorKind {
        match b {
            0 => ErrorKind::Ok,
            1 => ErrorKind::ConnError,
            2 => ErrorKind::SocketReadError,
            3 => ErrorKind::SocketWriteError,
            4 => ErrorKind::ProtocolError,
            5 => ErrorKind::VersionMismatch,
            6 => ErrorKind::VersionIncompatible,
            7 => ErrorKind::IdMismatch,
            8 => ErrorKind::ChecksumMismatch,
            9 => ErrorKind::FileWriteError,
            10 => ErrorKind::MemoryAllocationError,
            11 => ErrorKind::Aborted,
            _ => ErrorKind::ProtocolError,
        }
    }
}

/// Sender-announced session parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub transfer_id: String,
    pub read_timeout_millis: i32,
    pub write_timeout_millis: i32,
    pub enable_checksum: bool,
    pub block_mode_disabled: bool,
    pub send_file_chunks: bool,
}

const SETTINGS_FLAG_CHECKSUM: u8 = 0x01;
const SETTINGS_FLAG_BLOCK_MODE_DISABLED: u8 = 0x02;
const SETTINGS_FLAG_SEND_FILE_CHUNKS: u8 = 0x04;

/// Block spans the entire logical file.
pub const BLOCK_FLAG_WHOLE_FILE: u8 = 0x01;

/// Per-block header: which file, where in it, and how much.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDetails {
    pub file_name: String,
    pub seq_id: i64,
    pub file_size: i64,
    pub offset: i64,
    pub data_size: i64,
    pub flags: u8,
}

/// Half-open byte range `[start, end)` already present on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

/// Resumption record for one logical file: the ranges a previous session
/// already committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChunksInfo {
    pub seq_id: i64,
    pub file_name: String,
    pub file_size: i64,
    pub chunks: Vec<Interval>,
}

fn put_bytes(buf: &mut [u8], off: &mut usize, src: &[u8]) -> Result<()> {
    let end = *off + src.len();
    if end > buf.len() {
        bail!("encode overflow: need {} bytes at offset {}", src.len(), *off);
    }
    buf[*off..end].copy_from_slice(src);
    *off = end;
    Ok(())
}

fn put_u8(buf: &mut [u8], off: &mut usize, v: u8) -> Result<()> {
    put_bytes(buf, off, &[v])
}

fn put_u16(buf: &mut [u8], off: &mut usize, v: u16) -> Result<()> {
    put_bytes(buf, off, &v.to_le_bytes())
}

fn put_i16(buf: &mut [u8], off: &mut usize, v: i16) -> Result<()> {
    put_bytes(buf, off, &v.to_le_bytes())
}

fn put_i32(buf: &mut [u8], off: &mut usize, v: i32) -> Result<()> {
    put_bytes(buf, off, &v.to_le_bytes())
}

fn put_i64(buf: &mut [u8], off: &mut usize, v: i64) -> Result<()> {
    put_bytes(buf, off, &v.to_le_bytes())
}

fn get_slice<'a>(buf: &'a [u8], off: &mut usize, end: usize, n: usize) -> Result<&'a [u8]> {
    let stop = *off + n;
    if stop > end || stop > buf.len() {
        bail!("decode underrun: need {} bytes at offset {}", n, *off);
    }
    let s = &buf[*off..stop];
    *off = stop;
    Ok(s)
}

fn get_u8(buf: &[u8], off: &mut usize, end: usize) -> Result<u8> {
    Ok(get_slice(buf, off, end, 1)?[0])
}

fn get_u16(buf: &[u8], off: &mut usize, end: usize) -> Result<u16> {
    let s = get_slice(buf, off, end, 2)?;
    Ok(u16::from_le_bytes([s[0], s[1]]))
}

fn get_i16(buf: &[u8], off: &mut usize, end: usize) -> Result<i16> {
    let s = get_slice(buf, off, end, 2)?;
    Ok(i16::from_le_bytes([s[0], s[1]]))
}

fn get_i32(buf: &[u8], off: &mut usize, end: usize) -> Result<i32> {
    let s = get_slice(buf, off, end, 4)?;
    Ok(i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn get_i64(buf: &[u8], off: &mut usize, end: usize) -> Result<i64> {
    let s = get_slice(buf, off, end, 8)?;
    Ok(i64::from_le_bytes([
        s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
    ]))
}

/// Unsigned LEB128.
pub fn encode_varint(buf: &mut [u8], off: &mut usize, mut v: u64) -> Result<()> {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        put_u8(buf, off, byte)?;
        if v == 0 {
            return Ok(());
        }
    }
}

pub fn decode_varint(buf: &[u8], off: &mut usize, end: usize) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = get_u8(buf, off, end)?;
        if shift >= 63 && byte > 1 {
            bail!("varint overflows 64 bits");
        }
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

pub fn encode_version(buf: &mut [u8], off: &mut usize, version: i32) -> Result<()> {
    if version < 0 {
        bail!("negative protocol version {}", version);
    }
    encode_varint(buf, off, version as u64)
}

pub fn decode_version(buf: &[u8], off: &mut usize, end: usize) -> Result<i32> {
    let v = decode_varint(buf, off, end)?;
    if v > i32::MAX as u64 {
        bail!("protocol version {} out of range", v);
    }
    Ok(v as i32)
}

/// Highest version both sides can speak, or 0 if there is none.
pub fn negotiate_protocol(sender_version: i32, receiver_version: i32) -> i32 {
    let common = sender_version.min(receiver_version);
    if common < MIN_SUPPORTED_VERSION {
        return 0;
    }
    common
}

pub fn encode_settings(buf: &mut [u8], off: &mut usize, settings: &Settings) -> Result<()> {
    let id = settings.transfer_id.as_bytes();
    if id.len() > MAX_TRANSFER_ID_LENGTH {
        bail!("transfer id too long: {} bytes", id.len());
    }
    put_u8(buf, off, id.len() as u8)?;
    put_bytes(buf, off, id)?;
    put_i32(buf, off, settings.read_timeout_millis)?;
    put_i32(buf, off, settings.write_timeout_millis)?;
    let mut flags = 0u8;
    if settings.enable_checksum {
        flags |= SETTINGS_FLAG_CHECKSUM;
    }
    if settings.block_mode_disabled {
        flags |= SETTINGS_FLAG_BLOCK_MODE_DISABLED;
    }
    if settings.send_file_chunks {
        flags |= SETTINGS_FLAG_SEND_FILE_CHUNKS;
    }
    put_u8(buf, off, flags)
}

pub fn decode_settings(buf: &[u8], off: &mut usize, end: usize) -> Result<Settings> {
    let id_len = get_u8(buf, off, end)? as usize;
    if id_len > MAX_TRANSFER_ID_LENGTH {
        bail!("transfer id length {} exceeds limit", id_len);
    }
    let id = get_slice(buf, off, end, id_len)?;
    let transfer_id = std::str::from_utf8(id)?.to_string();
    let read_timeout_millis = get_i32(buf, off, end)?;
    let write_timeout_millis = get_i32(buf, off, end)?;
    let flags = get_u8(buf, off, end)?;
    Ok(Settings {
        transfer_id,
        read_timeout_millis,
        write_timeout_millis,
        enable_checksum: flags & SETTINGS_FLAG_CHECKSUM != 0,
        block_mode_disabled: flags & SETTINGS_FLAG_BLOCK_MODE_DISABLED != 0,
        send_file_chunks: flags & SETTINGS_FLAG_SEND_FILE_CHUNKS != 0,
    })
}

pub fn encode_header(buf: &mut [u8], off: &mut usize, details: &BlockDetails) -> Result<()> {
    let name = details.file_name.as_bytes();
    if name.len() > MAX_FILENAME_LENGTH {
        bail!("file name too long: {} bytes", name.len());
    }
    put_i16(buf, off, name.len() as i16)?;
    put_bytes(buf, off, name)?;
    put_i64(buf, off, details.seq_id)?;
    put_i64(buf, off, details.file_size)?;
    put_i64(buf, off, details.offset)?;
    put_i64(buf, off, details.data_size)?;
    put_u8(buf, off, details.flags)
}

pub fn decode_header(buf: &[u8], off: &mut usize, end: usize) -> Result<BlockDetails> {
    let name_len = get_i16(buf, off, end)?;
    if name_len < 0 || name_len as usize > MAX_FILENAME_LENGTH {
        bail!("bad file name length {}", name_len);
    }
    let name = get_slice(buf, off, end, name_len as usize)?;
    let file_name = std::str::from_utf8(name)?.to_string();
    let seq_id = get_i64(buf, off, end)?;
    let file_size = get_i64(buf, off, end)?;
    let offset = get_i64(buf, off, end)?;
    let data_size = get_i64(buf, off, end)?;
    let flags = get_u8(buf, off, end)?;
    if offset < 0 || data_size < 0 || file_size < 0 {
        bail!("negative field in block header");
    }
    Ok(BlockDetails {
        file_name,
        seq_id,
        file_size,
        offset,
        data_size,
        flags,
    })
}

/// Status byte plus the sender's block/byte totals. The magic is consumed
/// by the command dispatcher before either side of this pair runs.
pub fn encode_done(
    buf: &mut [u8],
    off: &mut usize,
    status: ErrorKind,
    num_blocks: i64,
    total_bytes: i64,
) -> Result<()> {
    put_u8(buf, off, status as u8)?;
    put_i64(buf, off, num_blocks)?;
    put_i64(buf, off, total_bytes)
}

/// Decodes the totals only; the caller has already consumed the status.
pub fn decode_done(buf: &[u8], off: &mut usize, end: usize) -> Result<(i64, i64)> {
    let num_blocks = get_i64(buf, off, end)?;
    let total_bytes = get_i64(buf, off, end)?;
    Ok((num_blocks, total_bytes))
}

pub fn encode_size(buf: &mut [u8], off: &mut usize, total_bytes: i64) -> Result<()> {
    put_i64(buf, off, total_bytes)
}

pub fn decode_size(buf: &[u8], off: &mut usize, end: usize) -> Result<i64> {
    get_i64(buf, off, end)
}

pub fn encode_footer(buf: &mut [u8], off: &mut usize, checksum: i32) -> Result<()> {
    put_i32(buf, off, checksum)
}

pub fn decode_footer(buf: &[u8], off: &mut usize, end: usize) -> Result<i32> {
    get_i32(buf, off, end)
}

pub fn encode_abort(
    buf: &mut [u8],
    off: &mut usize,
    version: i32,
    err: ErrorKind,
    num_files: i64,
) -> Result<()> {
    put_i32(buf, off, version)?;
    put_u8(buf, off, err as u8)?;
    put_i64(buf, off, num_files)
}

pub fn decode_abort(buf: &[u8], off: &mut usize, end: usize) -> Result<(i32, ErrorKind, i64)> {
    let version = get_i32(buf, off, end)?;
    let err = ErrorKind::from_wire(get_u8(buf, off, end)?);
    let num_files = get_i64(buf, off, end)?;
    Ok((version, err, num_files))
}

pub fn encode_chunks_cmd(buf: &mut [u8], off: &mut usize, num_entries: i64) -> Result<()> {
    put_i64(buf, off, num_entries)
}

pub fn decode_chunks_cmd(buf: &[u8], off: &mut usize, end: usize) -> Result<i64> {
    get_i64(buf, off, end)
}

fn file_chunks_info_len(info: &FileChunksInfo) -> usize {
    2 + info.file_name.len() + 8 + 8 + 4 + 16 * info.chunks.len()
}

pub fn encode_file_chunks_info(
    buf: &mut [u8],
    off: &mut usize,
    info: &FileChunksInfo,
) -> Result<()> {
    let name = info.file_name.as_bytes();
    if name.len() > MAX_FILENAME_LENGTH {
        bail!("file name too long: {} bytes", name.len());
    }
    put_i16(buf, off, name.len() as i16)?;
    put_bytes(buf, off, name)?;
    put_i64(buf, off, info.seq_id)?;
    put_i64(buf, off, info.file_size)?;
    put_i32(buf, off, info.chunks.len() as i32)?;
    for c in &info.chunks {
        put_i64(buf, off, c.start)?;
        put_i64(buf, off, c.end)?;
    }
    Ok(())
}

/// Packs as many entries as fit, starting at `start_index`. Returns the
/// number encoded; the cursor stops after the last full entry.
pub fn encode_file_chunks_info_list(
    buf: &mut [u8],
    off: &mut usize,
    start_index: usize,
    infos: &[FileChunksInfo],
) -> usize {
    let mut encoded = 0;
    for info in &infos[start_index..] {
        if *off + file_chunks_info_len(info) > buf.len() {
            break;
        }
        if encode_file_chunks_info(buf, off, info).is_err() {
            break;
        }
        encoded += 1;
    }
    encoded
}

pub fn decode_file_chunks_info(buf: &[u8], off: &mut usize, end: usize) -> Result<FileChunksInfo> {
    let name_len = get_i16(buf, off, end)?;
    if name_len < 0 || name_len as usize > MAX_FILENAME_LENGTH {
        bail!("bad file name length {}", name_len);
    }
    let name = get_slice(buf, off, end, name_len as usize)?;
    let file_name = std::str::from_utf8(name)?.to_string();
    let seq_id = get_i64(buf, off, end)?;
    let file_size = get_i64(buf, off, end)?;
    let num_chunks = get_i32(buf, off, end)?;
    if num_chunks < 0 {
        bail!("negative chunk count {}", num_chunks);
    }
    let mut chunks = Vec::with_capacity(num_chunks as usize);
    for _ in 0..num_chunks {
        let start = get_i64(buf, off, end)?;
        let stop = get_i64(buf, off, end)?;
        chunks.push(Interval { start, end: stop });
    }
    Ok(FileChunksInfo {
        seq_id,
        file_name,
        file_size,
        chunks,
    })
}

pub fn decode_file_chunks_info_list(
    buf: &[u8],
    off: &mut usize,
    end: usize,
) -> Result<Vec<FileChunksInfo>> {
    let mut out = Vec::new();
    while *off < end {
        out.push(decode_file_chunks_info(buf, off, end)?);
    }
    Ok(out)
}

fn checkpoint_len(version: i32) -> usize {
    if version >= CHECKPOINT_OFFSET_VERSION {
        2 + 8 + 24
    } else {
        2 + 8
    }
}

/// Size of the fixed record a worker sends as its local checkpoint on
/// reconnect: a one-element checkpoint list.
pub fn max_local_checkpoint_len(version: i32) -> usize {
    2 + checkpoint_len(version)
}

pub fn encode_checkpoints(
    version: i32,
    buf: &mut [u8],
    off: &mut usize,
    checkpoints: &[Checkpoint],
) -> Result<()> {
    put_i16(buf, off, checkpoints.len() as i16)?;
    for cp in checkpoints {
        put_u16(buf, off, cp.port)?;
        put_i64(buf, off, cp.num_blocks)?;
        if version >= CHECKPOINT_OFFSET_VERSION {
            put_i64(buf, off, cp.last_block_seq_id)?;
            put_i64(buf, off, cp.last_block_offset)?;
            put_i64(buf, off, cp.last_block_bytes_written)?;
        }
    }
    Ok(())
}

pub fn decode_checkpoints(
    version: i32,
    buf: &[u8],
    off: &mut usize,
    end: usize,
) -> Result<Vec<Checkpoint>> {
    let count = get_i16(buf, off, end)?;
    if count < 0 {
        bail!("negative checkpoint count {}", count);
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let port = get_u16(buf, off, end)?;
        let num_blocks = get_i64(buf, off, end)?;
        let mut cp = Checkpoint::new(port);
        cp.num_blocks = num_blocks;
        if version >= CHECKPOINT_OFFSET_VERSION {
            cp.last_block_seq_id = get_i64(buf, off, end)?;
            cp.last_block_offset = get_i64(buf, off, end)?;
            cp.last_block_bytes_written = get_i64(buf, off, end)?;
        }
        out.push(cp);
    }
    Ok(out)
}
