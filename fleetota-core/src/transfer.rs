//! Block-wise transfer of firmware images
//!
//! A file is cut into blocks of `2^(4+szx)` bytes (16 to 1024). Each block
//! carries a compact option `num << 4 | more << 3 | szx`:
//! - `num`: zero-based block index
//! - `more`: further blocks follow
//! - `szx`: size exponent, 7 is reserved
//!
//! The server side is [`read_block`] / [`serve`], the client side is
//! [`assemble`] driving any [`BlockSource`]. Small files skip block mode
//! entirely when the client asked for no block option.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use tracing::debug;

use crate::error::TransferError;

pub const MAX_SZX: u8 = 6;
/// 1024-byte blocks
pub const DEFAULT_SZX: u8 = 6;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;
/// Block numbers are limited to 20 bits
pub const MAX_BLOCK_NUM: u32 = (1 << 20) - 1;

/// Block size in bytes for a size exponent
pub fn block_size(szx: u8) -> Result<usize, TransferError> {
    if szx > MAX_SZX {
        return Err(TransferError::InvalidSzx(szx));
    }
    Ok(1usize << (4 + szx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockOption {
    pub fn new(num: u32, more: bool, szx: u8) -> Result<Self, TransferError> {
        if szx > MAX_SZX {
            return Err(TransferError::InvalidSzx(szx));
        }
        if num > MAX_BLOCK_NUM {
            return Err(TransferError::BlockOutOfRange(num));
        }
        Ok(Self { num, more, szx })
    }

    pub fn encode(&self) -> u32 {
        (self.num << 4) | ((self.more as u32) << 3) | self.szx as u32
    }

    pub fn decode(value: u32) -> Result<Self, TransferError> {
        let szx = (value & 0x7) as u8;
        let more = value & 0x8 != 0;
        Self::new(value >> 4, more, szx)
    }

    pub fn block_size(&self) -> usize {
        1usize << (4 + self.szx)
    }

    /// Byte offset of this block in the file
    pub fn offset(&self) -> u64 {
        self.num as u64 * self.block_size() as u64
    }
}

/// One block read from a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub option: BlockOption,
    pub payload: Vec<u8>,
    pub total_size: u64,
}

/// Server answer to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Served {
    /// Whole file in one message (fast path)
    Whole(Vec<u8>),
    Block(Block),
}

/// Reads block `num` of `path` at size exponent `szx`.
///
/// Past EOF the payload is empty and `more` is false.
pub async fn read_block(path: &Path, num: u32, szx: u8) -> Result<Block, TransferError> {
    let size = block_size(szx)?;
    let mut file = tokio::fs::File::open(path).await?;
    let total_size = file.metadata().await?.len();

    let offset = num as u64 * size as u64;
    let mut payload = Vec::new();
    if offset < total_size {
        file.seek(SeekFrom::Start(offset)).await?;
        file.take(size as u64).read_to_end(&mut payload).await?;
    }
    let more = (num as u64 + 1) * (size as u64) < total_size;

    Ok(Block { option: BlockOption::new(num, more, szx)?, payload, total_size })
}

/// Answers a client request for `path`.
///
/// - No option and the file fits in `max_message_size`: whole file.
/// - No option and a larger file: block 0 at `preferred_szx`.
/// - Explicit option: that block, with `szx` reduced to `preferred_szx` if
///   the client asked for bigger blocks (`num` is rescaled so the offset is
///   unchanged).
pub async fn serve(
    path: &Path,
    requested: Option<BlockOption>,
    preferred_szx: u8,
    max_message_size: usize,
) -> Result<Served, TransferError> {
    if preferred_szx > MAX_SZX {
        return Err(TransferError::InvalidSzx(preferred_szx));
    }

    match requested {
        None => {
            let total_size = tokio::fs::metadata(path).await?.len();
            if total_size <= max_message_size as u64 {
                let payload = tokio::fs::read(path).await?;
                return Ok(Served::Whole(payload));
            }
            Ok(Served::Block(read_block(path, 0, preferred_szx).await?))
        }
        Some(opt) => {
            let (num, szx) = if opt.szx > preferred_szx {
                let shift = opt.szx - preferred_szx;
                let num = opt
                    .num
                    .checked_shl(shift as u32)
                    .filter(|n| *n <= MAX_BLOCK_NUM)
                    .ok_or(TransferError::BlockOutOfRange(opt.num))?;
                (num, preferred_szx)
            } else {
                (opt.num, opt.szx)
            };
            Ok(Served::Block(read_block(path, num, szx).await?))
        }
    }
}

/// Anything that answers block requests (HTTP client, local file...)
#[async_trait]
pub trait BlockSource: Send {
    async fn fetch(&mut self, request: Option<BlockOption>) -> Result<Served, TransferError>;
}

/// Pulls a whole file from `source` into `sink` and returns its length.
///
/// With `proposed_szx` the first request asks for block 0 at that size,
/// otherwise no option is sent and the server may use the fast path. The
/// `szx` of the first block response is kept for the whole transfer.
pub async fn assemble<S, W>(
    source: &mut S,
    proposed_szx: Option<u8>,
    sink: &mut W,
) -> Result<u64, TransferError>
where
    S: BlockSource + ?Sized,
    W: AsyncWrite + Unpin + Send,
{
    let first_request = match proposed_szx {
        Some(szx) => Some(BlockOption::new(0, false, szx)?),
        None => None,
    };

    let first = match source.fetch(first_request).await? {
        Served::Whole(payload) => {
            sink.write_all(&payload).await?;
            sink.flush().await?;
            return Ok(payload.len() as u64);
        }
        Served::Block(block) => block,
    };

    if first.option.num != 0 {
        return Err(TransferError::Protocol(format!(
            "first block has num {} (expected 0)",
            first.option.num
        )));
    }
    if let Some(proposed) = proposed_szx {
        if first.option.szx > proposed {
            return Err(TransferError::Protocol(format!(
                "server raised szx from {proposed} to {}",
                first.option.szx
            )));
        }
    }

    let szx = first.option.szx;
    let expected_len = block_size(szx)?;
    debug!(szx, total_size = first.total_size, "block transfer started");

    let mut written = 0u64;
    let mut block = first;
    loop {
        if block.option.more && block.payload.len() != expected_len {
            return Err(TransferError::Protocol(format!(
                "block {} is {} bytes but more blocks follow",
                block.option.num,
                block.payload.len()
            )));
        }
        sink.write_all(&block.payload).await?;
        written += block.payload.len() as u64;

        if !block.option.more {
            break;
        }

        let next_num = block.option.num + 1;
        let request = BlockOption::new(next_num, false, szx)?;
        block = match source.fetch(Some(request)).await? {
            Served::Block(b) => b,
            Served::Whole(_) => {
                return Err(TransferError::Protocol(
                    "whole-file response in the middle of a block transfer".into(),
                ))
            }
        };

        if block.option.num != next_num {
            return Err(TransferError::Protocol(format!(
                "expected block {next_num}, got {}",
                block.option.num
            )));
        }
        if block.option.szx != szx {
            return Err(TransferError::Protocol(format!(
                "szx changed mid-transfer ({szx} -> {})",
                block.option.szx
            )));
        }
    }

    sink.flush().await?;
    debug!(bytes = written, "block transfer complete");
    Ok(written)
}
