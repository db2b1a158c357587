//! Size-classed free lists for small arena blocks.
//!
//! Every free arena block whose size falls within the bin range is also filed
//! in the bin for its size class, so a small request can skip the first-fit
//! walk. The links are stored in the blocks themselves (as handles), making
//! insertion and removal O(1).

use crate::blocklist::{BlockId, BlockTable};

/// Upper bound on the number of bins, so the heads fit in a fixed array.
pub const MAX_BIN_COUNT: usize = 64;

pub struct Bins {
    heads: [Option<BlockId>; MAX_BIN_COUNT],
    width: usize,
    count: usize,
}

impl Bins {
    /// `count` is capped at [`MAX_BIN_COUNT`].
    pub const fn new(width: usize, count: usize) -> Self {
        Bins {
            heads: [None; MAX_BIN_COUNT],
            width,
            count: if count > MAX_BIN_COUNT {
                MAX_BIN_COUNT
            } else {
                count
            },
        }
    }

    /// The bin index for a block of `size` bytes, if it is binned at all.
    pub fn class_of(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.width * self.count {
            return None;
        }
        Some((size - 1) / self.width)
    }

    /// File a free block in the bin for its size. Returns false if the block
    /// is too large to be binned.
    pub(crate) fn push(&mut self, table: &mut BlockTable, id: BlockId) -> bool {
        debug_assert!(table[id].bin.is_none(), "block {:?} is already binned", id);
        let class = match self.class_of(table[id].size()) {
            None => return false,
            Some(c) => c,
        };
        let old_head = self.heads[class].replace(id);
        if let Some(old) = old_head {
            table[old].bin_prev = Some(id);
        }
        let block = &mut table[id];
        block.bin = Some(class);
        block.bin_prev = None;
        block.bin_next = old_head;
        true
    }

    /// Take a block out of whatever bin it is in. No-op for unbinned blocks.
    pub(crate) fn remove(&mut self, table: &mut BlockTable, id: BlockId) {
        let block = &mut table[id];
        let class = match block.bin.take() {
            None => return,
            Some(c) => c,
        };
        let prev = block.bin_prev.take();
        let next = block.bin_next.take();

        match prev {
            Some(p) => table[p].bin_next = next,
            None => self.heads[class] = next,
        }
        if let Some(n) = next {
            table[n].bin_prev = prev;
        }
    }

    /// Remove and return the first block in the bin for `size` that can hold
    /// `size` bytes at alignment `align`, along with the padding it needs.
    /// When the bin width equals the base alignment every member of a bin has
    /// the same size, so at base alignment this is the head.
    pub(crate) fn pop(
        &mut self,
        table: &mut BlockTable,
        size: usize,
        align: usize,
    ) -> Option<(BlockId, usize)> {
        let class = self.class_of(size)?;
        let mut cursor = self.heads[class];
        while let Some(id) = cursor {
            if let Some(padding) = table[id].fits(size, align) {
                self.remove(table, id);
                return Some((id, padding));
            }
            cursor = table[id].bin_next;
        }
        None
    }

    /// Forget every member. The blocks themselves are left as they are.
    pub(crate) fn clear(&mut self) {
        self.heads = [None; MAX_BIN_COUNT];
    }

    /// Iterate over the members of one bin.
    pub fn members<'a>(&'a self, table: &'a BlockTable, class: usize) -> BinIter<'a> {
        BinIter {
            table,
            next: self.heads.get(class).copied().flatten(),
            remaining: table.len(),
        }
    }

    /// Number of blocks filed across all bins.
    pub fn len(&self, table: &BlockTable) -> usize {
        (0..self.count).map(|c| self.members(table, c).count()).sum()
    }
}

pub struct BinIter<'a> {
    table: &'a BlockTable,
    next: Option<BlockId>,
    // Bounds the walk even if the links were ever to form a cycle.
    remaining: usize,
}

impl<'a> Iterator for BinIter<'a> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let id = self.next.take()?;
        self.next = self.table[id].bin_next;
        Some(id)
    }
}
