//! Introspection: which blocks exist, what is still allocated, and what the
//! bytes at an address look like.

use core::fmt;
use core::slice;

use log::{info, warn};

use crate::allocators::{HeapGrower, RawAlloc};
use crate::blocklist::{Block, BlockId};

/// A snapshot of one block, detached from the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub header: usize,
    pub payload: usize,
    pub size: usize,
    pub usable: usize,
    pub is_free: bool,
    pub is_mapped_independently: bool,
}

impl BlockInfo {
    fn new(id: BlockId, block: &Block) -> Self {
        BlockInfo {
            id,
            header: block.header_addr(),
            payload: block.payload_addr(),
            size: block.size(),
            usable: block.usable(),
            is_free: block.is_free(),
            is_mapped_independently: block.is_mapped_independently(),
        }
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match (self.is_free, self.is_mapped_independently) {
            (true, _) => "free",
            (false, true) => "mapped",
            (false, false) => "used",
        };
        write!(
            f,
            "{:#x}: {} bytes ({} usable) {}",
            self.payload, self.size, self.usable, state
        )
    }
}

/// What is still allocated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeakReport {
    pub live_blocks: usize,
    pub live_bytes: usize,
}

impl LeakReport {
    pub fn is_clean(&self) -> bool {
        self.live_blocks == 0
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "no memory leaks detected")
        } else {
            write!(
                f,
                "potential memory leak: {} blocks ({} bytes) still allocated",
                self.live_blocks, self.live_bytes
            )
        }
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Every block, arena chain first and then the standalone mappings.
    pub fn block_infos(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.blocks
            .iter()
            .chain(self.blocks.standalone())
            .map(|(id, block)| BlockInfo::new(id, block))
    }

    /// Summarize the live allocations and log the result.
    pub fn report_leaks(&self) -> LeakReport {
        let live_bytes = self
            .block_infos()
            .filter(|info| !info.is_free)
            .map(|info| info.usable)
            .sum();
        let report = LeakReport {
            live_blocks: self.count_live_blocks(),
            live_bytes,
        };
        if report.is_clean() {
            info!("{}", report);
        } else {
            warn!("{}", report);
            for info in self.block_infos().filter(|info| !info.is_free) {
                warn!("  still allocated: {}", info);
            }
        }
        report
    }
}

/// Hex and ASCII rendering of a byte range, 16 bytes per row:
///
/// ```text
/// 0x00007f3a9c000010: 48 65 6c 6c 6f 00 00 00  00 00 00 00 00 00 00 00  |Hello...........|
/// ```
pub struct HexDump<'a> {
    bytes: &'a [u8],
}

impl<'a> HexDump<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        HexDump { bytes }
    }
}

const ROW: usize = 16;

impl<'a> fmt::Display for HexDump<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.bytes.as_ptr() as usize;
        for (row, chunk) in self.bytes.chunks(ROW).enumerate() {
            write!(f, "{:#018x}: ", base + row * ROW)?;
            for i in 0..ROW {
                match chunk.get(i) {
                    Some(byte) => write!(f, "{:02x} ", byte)?,
                    None => write!(f, "   ")?,
                }
                if i == ROW / 2 - 1 {
                    write!(f, " ")?;
                }
            }
            write!(f, " |")?;
            for &byte in chunk {
                let c = if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                };
                write!(f, "{}", c)?;
            }
            writeln!(f, "|")?;
        }
        Ok(())
    }
}

/// Render `len` bytes starting at `ptr`. A null `ptr` renders nothing.
///
/// # Safety
///
/// `ptr..ptr + len` must be readable for as long as the dump is alive.
pub unsafe fn dump_bytes<'a>(ptr: *const u8, len: usize) -> HexDump<'a> {
    if ptr.is_null() {
        return HexDump::new(&[]);
    }
    HexDump::new(slice::from_raw_parts(ptr, len))
}
