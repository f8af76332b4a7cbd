//! Wire protocol framing and payload codecs
//!
//! Every message is a fixed 20-byte header followed by the payload:
//!
//! ```text
//! magic(4) = f9 be b4 d9 || command(12, ASCII, NUL-padded) || payload_size u32 LE
//! ```
//!
//! Commands: `getaddr`, `addr`, `getblocks`, `inv`, `getdata`, `block`,
//! `tx`. Inventory entries are `type_id u32 LE || hash(32)` with type 1
//! for transactions and 2 for blocks.

use crate::codec::{Malformed, Reader, Result};
use crate::types::Hash256;
use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];
pub const COMMAND_SIZE: usize = 12;
pub const HEADER_SIZE: usize = 20;

/// Upper bound on a single payload; anything larger is hostile.
pub const MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

pub const CMD_GETADDR: &str = "getaddr";
pub const CMD_ADDR: &str = "addr";
pub const CMD_GETBLOCKS: &str = "getblocks";
pub const CMD_INV: &str = "inv";
pub const CMD_GETDATA: &str = "getdata";
pub const CMD_BLOCK: &str = "block";
pub const CMD_TX: &str = "tx";

pub const INV_TX: u32 = 1;
pub const INV_BLOCK: u32 = 2;

/// Entry of an `inv` or `getdata` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    pub type_id: u32,
    pub hash: Hash256,
}

/// `getblocks` payload: locator hashes from most recent to oldest, plus
/// the hash to stop at (zero for "up to your tip").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMsg {
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

/// Frames a payload under `command`.
pub fn encode_frame(command: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&MAGIC);
    let mut cmd = [0u8; COMMAND_SIZE];
    let bytes = command.as_bytes();
    let n = bytes.len().min(COMMAND_SIZE);
    cmd[..n].copy_from_slice(&bytes[..n]);
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parses a frame header into command and payload size.
pub fn decode_frame_header(buf: &[u8; HEADER_SIZE]) -> Result<(String, u32)> {
    if buf[0..4] != MAGIC {
        return Err(Malformed("frame magic"));
    }
    let cmd_bytes = &buf[4..4 + COMMAND_SIZE];
    let end = cmd_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(COMMAND_SIZE);
    let command = std::str::from_utf8(&cmd_bytes[..end])
        .map_err(|_| Malformed("frame command"))?
        .to_string();
    let size = u32::from_le_bytes(buf[16..20].try_into().expect("4 bytes"));
    if size > MAX_PAYLOAD {
        return Err(Malformed("frame payload size"));
    }
    Ok((command, size))
}

pub fn encode_addrs(addrs: &[String]) -> Vec<u8> {
    let mut out = (addrs.len() as u32).to_le_bytes().to_vec();
    for addr in addrs {
        out.extend_from_slice(&(addr.len() as u32).to_le_bytes());
        out.extend_from_slice(addr.as_bytes());
    }
    out
}

pub fn decode_addrs(buf: &[u8]) -> Result<Vec<String>> {
    let mut r = Reader::new(buf);
    let count = r.u32_le("addr count")?;
    if count as usize > buf.len() {
        return Err(Malformed("addr count"));
    }
    let mut addrs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = r.u32_le("addr length")? as usize;
        let bytes = r.take(len, "addr bytes")?;
        addrs.push(
            std::str::from_utf8(bytes)
                .map_err(|_| Malformed("addr utf8"))?
                .to_string(),
        );
    }
    r.finish("addr trailing bytes")?;
    Ok(addrs)
}

pub fn encode_get_blocks(msg: &GetBlocksMsg) -> Vec<u8> {
    let mut out = (msg.locator.len() as u32).to_le_bytes().to_vec();
    for hash in &msg.locator {
        out.extend_from_slice(hash.as_bytes());
    }
    out.extend_from_slice(msg.stop.as_bytes());
    out
}

pub fn decode_get_blocks(buf: &[u8]) -> Result<GetBlocksMsg> {
    let mut r = Reader::new(buf);
    let count = r.u32_le("getblocks count")?;
    if count as u64 * 32 > buf.len() as u64 {
        return Err(Malformed("getblocks count"));
    }
    let mut locator = Vec::with_capacity(count as usize);
    for _ in 0..count {
        locator.push(r.hash256("getblocks locator hash")?);
    }
    let stop = r.hash256("getblocks stop hash")?;
    r.finish("getblocks trailing bytes")?;
    Ok(GetBlocksMsg { locator, stop })
}

pub fn encode_inventories(invs: &[Inventory]) -> Vec<u8> {
    let mut out = (invs.len() as u32).to_le_bytes().to_vec();
    for inv in invs {
        out.extend_from_slice(&inv.type_id.to_le_bytes());
        out.extend_from_slice(inv.hash.as_bytes());
    }
    out
}

pub fn decode_inventories(buf: &[u8]) -> Result<Vec<Inventory>> {
    let mut r = Reader::new(buf);
    let count = r.u32_le("inv count")?;
    if count as u64 * 36 > buf.len() as u64 {
        return Err(Malformed("inv count"));
    }
    let mut invs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_id = r.u32_le("inv type")?;
        let hash = r.hash256("inv hash")?;
        invs.push(Inventory { type_id, hash });
    }
    r.finish("inv trailing bytes")?;
    Ok(invs)
}

/// Writes one framed message to the stream.
pub async fn write_message(
    stream: &mut TcpStream,
    command: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    stream
        .write_all(&encode_frame(command, payload))
        .await
        .with_context(|| format!("failed to send {}", command))?;
    stream.flush().await?;
    Ok(())
}

/// Reads one framed message. Returns the command and payload.
pub async fn read_message(stream: &mut TcpStream) -> anyhow::Result<(String, Vec<u8>)> {
    let mut header = [0u8; HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .await
        .context("failed to read frame header")?;
    let (command, size) = decode_frame_header(&header)?;
    let mut payload = vec![0u8; size as usize];
    stream
        .read_exact(&mut payload)
        .await
        .with_context(|| format!("failed to read {} payload", command))?;
    Ok((command, payload))
}
