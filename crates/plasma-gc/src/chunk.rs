//! Chunks: the two arenas the heap allocates from.
//!
//! [`ChunkBop`] is a run of [`BLOCK_SIZE`]-aligned blocks, each serving one
//! small size class. [`ChunkFit`] is a single region carved into
//! variable-size cells with best-fit allocation, splitting and coalescing.

use std::collections::BTreeSet;
use std::io;
use std::ptr::{self, NonNull};

use sys_alloc::{Mmap, MmapOptions};

use crate::block::Block;
use crate::cell::{CellPtrBop, CellPtrFit, CELL_ALLOCATED, CELL_MARKED};
use crate::error::HeapError;
use crate::layout::{BLOCK_SIZE, FIT_HEADER_WORDS, MAX_BOP_CELL_WORDS, MIN_CELL_WORDS, WORD_SIZE};
use crate::tracing::internal::{log_block_assigned, log_block_released};

/// What a sweep gave back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Cells freed.
    pub cells: usize,
    /// Usage bytes freed.
    pub bytes: usize,
}

impl SweepStats {
    fn add(&mut self, cells: usize, bytes: usize) {
        self.cells += cells;
        self.bytes += bytes;
    }
}

// ============================================================================
// ChunkBop - big bag of pages
// ============================================================================

/// A contiguous run of blocks for small, fixed-size-class cells.
pub struct ChunkBop {
    mmap: Mmap,
    num_blocks: usize,
    blocks_in_use: usize,
    /// Per size class, the block allocations were last served from.
    cursors: [Option<usize>; MAX_BOP_CELL_WORDS + 1],
}

impl ChunkBop {
    /// Reserve a chunk of at least one block.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the reservation fails.
    pub fn new(bytes: usize) -> io::Result<Self> {
        let num_blocks = (bytes / BLOCK_SIZE).max(1);
        // SAFETY: the mapping is owned by the chunk and outlives every
        // block handle, which only exist while the heap does.
        let mmap = unsafe {
            MmapOptions::new()
                .len(num_blocks * BLOCK_SIZE)
                .align(BLOCK_SIZE)
                .no_reserve(true)
                .map_anon()?
        };
        Ok(Self {
            mmap,
            num_blocks,
            blocks_in_use: 0,
            cursors: [None; MAX_BOP_CELL_WORDS + 1],
        })
    }

    fn base(&self) -> usize {
        self.mmap.ptr() as usize
    }

    /// Total blocks in the chunk.
    #[must_use]
    pub const fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Blocks currently assigned a size class.
    #[must_use]
    pub const fn blocks_in_use(&self) -> usize {
        self.blocks_in_use
    }

    fn block(&self, index: usize) -> Block {
        debug_assert!(index < self.num_blocks);
        // SAFETY: index is within the chunk and blocks are aligned.
        unsafe { Block::from_addr(self.base() + index * BLOCK_SIZE) }
    }

    fn block_index(&self, block: Block) -> usize {
        (block.address() - self.base()) / BLOCK_SIZE
    }

    /// The address is inside this chunk's reservation.
    #[must_use]
    pub fn contains_pointer(&self, ptr: usize) -> bool {
        ptr >= self.base() && ptr < self.base() + self.num_blocks * BLOCK_SIZE
    }

    /// The block owning `ptr`, whether or not it is in use.
    #[must_use]
    pub fn block_for(&self, ptr: usize) -> Option<Block> {
        // SAFETY: checked to be inside the chunk.
        self.contains_pointer(ptr)
            .then(|| unsafe { Block::containing(ptr) })
    }

    /// The block owning `ptr` if it currently serves a size class.
    #[must_use]
    pub fn block_in_use_for(&self, ptr: usize) -> Option<Block> {
        self.block_for(ptr).filter(Block::is_in_use)
    }

    /// Iterate over blocks that currently serve a size class.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        (0..self.num_blocks)
            .map(|i| self.block(i))
            .filter(Block::is_in_use)
    }

    /// Find an in-use block of this size class with a free cell.
    fn get_block_for_allocation(&mut self, cell_words: usize) -> Option<Block> {
        if let Some(index) = self.cursors[cell_words] {
            let block = self.block(index);
            if block.cell_words() == cell_words && !block.is_full() {
                return Some(block);
            }
        }

        let block = self
            .blocks()
            .find(|b| b.cell_words() == cell_words && !b.is_full())?;
        self.cursors[cell_words] = Some(self.block_index(block));
        Some(block)
    }

    /// Convert an unused block into a block of this size class.
    fn allocate_block(&mut self, cell_words: usize) -> Option<Block> {
        if self.blocks_in_use == self.num_blocks {
            return None;
        }

        let block = (0..self.num_blocks)
            .map(|i| self.block(i))
            .find(|b| !b.is_in_use())?;
        block.init(cell_words);
        self.blocks_in_use += 1;
        self.cursors[cell_words] = Some(self.block_index(block));
        log_block_assigned(block.address(), cell_words);
        Some(block)
    }

    /// Allocate a zeroed cell of exactly `cell_words` words.
    ///
    /// # Panics
    ///
    /// Panics if `cell_words` is not a BOP size class.
    pub fn allocate_cell(&mut self, cell_words: usize) -> Option<CellPtrBop> {
        assert!((MIN_CELL_WORDS..=MAX_BOP_CELL_WORDS).contains(&cell_words));

        let block = match self.get_block_for_allocation(cell_words) {
            Some(block) => block,
            None => self.allocate_block(cell_words)?,
        };
        let index = block.allocate_cell()?;
        Some(CellPtrBop::new(block, index))
    }

    /// The cell starting exactly at `ptr`.
    #[must_use]
    pub fn ptr_to_cell(&self, ptr: usize) -> Option<CellPtrBop> {
        let block = self.block_in_use_for(ptr)?;
        block
            .is_valid_address(ptr)
            .then(|| CellPtrBop::from_ptr(block, ptr))
    }

    /// The cell whose payload contains `ptr`.
    #[must_use]
    pub fn ptr_to_cell_interior(&self, ptr: usize) -> Option<CellPtrBop> {
        let block = self.block_in_use_for(ptr)?;
        let index = block.index_of_interior(ptr)?;
        Some(CellPtrBop::new(block, index))
    }

    /// Free unmarked cells, clear marks, and return emptied blocks to the
    /// pool.
    pub fn sweep(&mut self) -> SweepStats {
        let mut stats = SweepStats::default();
        for index in 0..self.num_blocks {
            let block = self.block(index);
            if !block.is_in_use() {
                continue;
            }
            let freed = block.sweep();
            stats.add(freed, freed * block.cell_bytes());

            if block.live_cells() == 0 {
                let cell_words = block.cell_words();
                block.reset();
                self.blocks_in_use -= 1;
                if self.cursors[cell_words] == Some(index) {
                    self.cursors[cell_words] = None;
                }
                log_block_released(block.address());
            }
        }
        stats
    }

    /// Check block bitmaps. Returns the usage bytes of allocated cells.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Corrupt`] describing the first violation.
    pub fn verify(&self) -> Result<usize, HeapError> {
        let mut bytes = 0;
        let mut in_use = 0;
        for block in self.blocks() {
            in_use += 1;
            let cell_words = block.cell_words();
            if !(MIN_CELL_WORDS..=MAX_BOP_CELL_WORDS).contains(&cell_words) {
                return Err(HeapError::corrupt(format!(
                    "block {:#x} has invalid cell size {cell_words}",
                    block.address()
                )));
            }

            let mut live = 0;
            for index in 0..block.num_cells() {
                let bits = block.cell_bits(index);
                if bits & !(CELL_ALLOCATED | CELL_MARKED) != 0 {
                    return Err(HeapError::corrupt(format!(
                        "block {:#x} cell {index} has unknown bits {bits:#x}",
                        block.address()
                    )));
                }
                if bits & CELL_MARKED != 0 {
                    return Err(HeapError::corrupt(format!(
                        "block {:#x} cell {index} is marked outside a collection",
                        block.address()
                    )));
                }
                if bits & CELL_ALLOCATED != 0 {
                    live += 1;
                }
            }
            if live != block.live_cells() {
                return Err(HeapError::corrupt(format!(
                    "block {:#x} counts {} live cells but its bitmap has {live}",
                    block.address(),
                    block.live_cells()
                )));
            }
            bytes += live * block.cell_bytes();
        }

        if in_use != self.blocks_in_use {
            return Err(HeapError::corrupt(format!(
                "{} blocks recorded in use but {in_use} found",
                self.blocks_in_use
            )));
        }
        Ok(bytes)
    }
}

// ============================================================================
// ChunkFit - best fit with splitting and coalescing
// ============================================================================

/// A region of variable-size cells for medium allocations.
///
/// Cells tile `[0, top)` (in words from the chunk base); everything above
/// `top` is untouched wilderness the chunk grows into.
pub struct ChunkFit {
    mmap: Mmap,
    capacity_words: usize,
    top: usize,
    /// One bit per word, set where a cell header begins.
    starts: Vec<u64>,
    /// Free extents keyed by `(payload words, header offset)`.
    free: BTreeSet<(usize, usize)>,
}

impl ChunkFit {
    /// Reserve a chunk of `bytes` (rounded to whole pages).
    ///
    /// # Errors
    ///
    /// Returns the OS error if the reservation fails.
    pub fn new(bytes: usize) -> io::Result<Self> {
        // SAFETY: the mapping is owned by the chunk and outlives every
        // cell handle.
        let mmap = unsafe {
            MmapOptions::new()
                .len(bytes.max(WORD_SIZE))
                .no_reserve(true)
                .map_anon()?
        };
        let capacity_words = mmap.len() / WORD_SIZE;
        Ok(Self {
            mmap,
            capacity_words,
            top: 0,
            starts: vec![0; capacity_words.div_ceil(64)],
            free: BTreeSet::new(),
        })
    }

    fn base(&self) -> usize {
        self.mmap.ptr() as usize
    }

    /// Largest payload a single cell can have.
    #[must_use]
    pub const fn max_cell_words(&self) -> usize {
        self.capacity_words - FIT_HEADER_WORDS
    }

    /// Words handed out so far, free extents included.
    #[must_use]
    pub const fn used_words(&self) -> usize {
        self.top
    }

    /// Number of free extents below the top.
    #[must_use]
    pub fn free_extents(&self) -> usize {
        self.free.len()
    }

    fn is_start(&self, offset: usize) -> bool {
        self.starts[offset / 64] & (1 << (offset % 64)) != 0
    }

    fn set_start(&mut self, offset: usize) {
        self.starts[offset / 64] |= 1 << (offset % 64);
    }

    fn clear_start(&mut self, offset: usize) {
        self.starts[offset / 64] &= !(1 << (offset % 64));
    }

    /// Offset of the last cell start at or before `offset`.
    fn prev_start(&self, offset: usize) -> Option<usize> {
        let mut word = offset / 64;
        let mut mask = u64::MAX >> (63 - offset % 64);
        loop {
            let bits = self.starts[word] & mask;
            if bits != 0 {
                return Some(word * 64 + 63 - bits.leading_zeros() as usize);
            }
            if word == 0 {
                return None;
            }
            word -= 1;
            mask = u64::MAX;
        }
    }

    fn cell_at(&self, offset: usize) -> CellPtrFit {
        debug_assert!(self.is_start(offset));
        let payload = self.base() + (offset + FIT_HEADER_WORDS) * WORD_SIZE;
        // SAFETY: offset is a cell start inside the chunk.
        unsafe { CellPtrFit::from_payload(NonNull::new_unchecked(payload as *mut u8)) }
    }

    /// The address is inside the part of the chunk handed out so far.
    #[must_use]
    pub fn contains_pointer(&self, ptr: usize) -> bool {
        ptr >= self.base() && ptr < self.base() + self.top * WORD_SIZE
    }

    /// The cell whose payload starts exactly at `ptr` (allocated or free).
    #[must_use]
    pub fn ptr_to_cell(&self, ptr: usize) -> Option<CellPtrFit> {
        if !self.contains_pointer(ptr) || (ptr - self.base()) % WORD_SIZE != 0 {
            return None;
        }
        let offset = ((ptr - self.base()) / WORD_SIZE).checked_sub(FIT_HEADER_WORDS)?;
        self.is_start(offset).then(|| self.cell_at(offset))
    }

    /// The cell whose payload contains `ptr`. Pointers into a header are
    /// not inside any cell.
    #[must_use]
    pub fn ptr_to_cell_interior(&self, ptr: usize) -> Option<CellPtrFit> {
        if !self.contains_pointer(ptr) {
            return None;
        }
        let word = (ptr - self.base()) / WORD_SIZE;
        let start = self.prev_start(word)?;
        let cell = self.cell_at(start);
        let payload = start + FIT_HEADER_WORDS;
        (word >= payload && word < payload + cell.size_words()).then_some(cell)
    }

    /// Iterate over every cell below the top in address order.
    pub fn cells(&self) -> impl Iterator<Item = CellPtrFit> + '_ {
        let mut offset = 0;
        std::iter::from_fn(move || {
            if offset >= self.top {
                return None;
            }
            let cell = self.cell_at(offset);
            offset += cell.total_words();
            Some(cell)
        })
    }

    /// Best-fit allocate a zeroed cell with at least `size_words` of payload.
    pub fn allocate_cell(&mut self, size_words: usize) -> Option<CellPtrFit> {
        let size_words = size_words.max(MIN_CELL_WORDS);

        let best = self.free.range((size_words, 0)..).next().copied();
        let cell = if let Some((free_words, offset)) = best {
            self.free.remove(&(free_words, offset));
            let remainder = free_words - size_words;
            let cell = self.cell_at(offset);
            if remainder >= FIT_HEADER_WORDS + MIN_CELL_WORDS {
                let rest = offset + FIT_HEADER_WORDS + size_words;
                self.set_start(rest);
                self.cell_at(rest).init(remainder - FIT_HEADER_WORDS, 0);
                self.free.insert((remainder - FIT_HEADER_WORDS, rest));
                cell.init(size_words, CELL_ALLOCATED);
            } else {
                cell.init(free_words, CELL_ALLOCATED);
            }
            cell
        } else {
            let total = FIT_HEADER_WORDS + size_words;
            if total > self.capacity_words - self.top {
                return None;
            }
            let offset = self.top;
            self.top += total;
            self.set_start(offset);
            let cell = self.cell_at(offset);
            cell.init(size_words, CELL_ALLOCATED);
            cell
        };

        // SAFETY: the payload lies inside the chunk.
        unsafe { ptr::write_bytes(cell.ptr().as_ptr(), 0, cell.size_words() * WORD_SIZE) };
        Some(cell)
    }

    /// Turn the cells in `[start, end)` into one free extent.
    fn coalesce(&mut self, start: usize, end: usize) {
        for offset in start + 1..end {
            self.clear_start(offset);
        }
        self.cell_at(start).init(end - start - FIT_HEADER_WORDS, 0);
        self.free.insert((end - start - FIT_HEADER_WORDS, start));
    }

    /// Free unmarked cells, clear marks, merge adjacent free extents and give
    /// a trailing free run back to the wilderness.
    pub fn sweep(&mut self) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut run: Option<usize> = None;
        self.free.clear();

        let mut offset = 0;
        while offset < self.top {
            let cell = self.cell_at(offset);
            let next = offset + cell.total_words();

            if cell.is_allocated() && cell.is_marked() {
                cell.unmark();
                if let Some(start) = run.take() {
                    self.coalesce(start, offset);
                }
            } else {
                if cell.is_allocated() {
                    stats.add(1, cell.total_words() * WORD_SIZE);
                }
                cell.free();
                run.get_or_insert(offset);
            }
            offset = next;
        }

        if let Some(start) = run {
            for offset in start..self.top {
                self.clear_start(offset);
            }
            self.top = start;
        }
        stats
    }

    /// Check the cell tiling. Returns the usage bytes of allocated cells.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Corrupt`] describing the first violation.
    pub fn verify(&self) -> Result<usize, HeapError> {
        let mut bytes = 0;
        let mut free = 0;
        let mut prev_free = false;
        let mut offset = 0;

        while offset < self.top {
            if !self.is_start(offset) {
                return Err(HeapError::corrupt(format!(
                    "fit cell at word {offset} has no start bit"
                )));
            }
            let cell = self.cell_at(offset);
            let bits = cell.cell_bits();
            if bits & CELL_MARKED != 0 {
                return Err(HeapError::corrupt(format!(
                    "fit cell at word {offset} is marked outside a collection"
                )));
            }
            if cell.size_words() < MIN_CELL_WORDS || offset + cell.total_words() > self.top {
                return Err(HeapError::corrupt(format!(
                    "fit cell at word {offset} has bad size {}",
                    cell.size_words()
                )));
            }
            for interior in offset + 1..offset + cell.total_words() {
                if self.is_start(interior) {
                    return Err(HeapError::corrupt(format!(
                        "stray start bit at word {interior} inside fit cell {offset}"
                    )));
                }
            }

            if cell.is_allocated() {
                bytes += cell.total_words() * WORD_SIZE;
                prev_free = false;
            } else {
                if prev_free {
                    return Err(HeapError::corrupt(format!(
                        "adjacent free extents at word {offset}"
                    )));
                }
                if !self.free.contains(&(cell.size_words(), offset)) {
                    return Err(HeapError::corrupt(format!(
                        "free extent at word {offset} missing from the free set"
                    )));
                }
                free += 1;
                prev_free = true;
            }
            offset += cell.total_words();
        }

        if free != self.free.len() {
            return Err(HeapError::corrupt(format!(
                "free set holds {} extents but {free} found",
                self.free.len()
            )));
        }
        Ok(bytes)
    }

    #[cfg(test)]
    fn offset(&self, cell: CellPtrFit) -> usize {
        (cell.ptr().as_ptr() as usize - self.base()) / WORD_SIZE - FIT_HEADER_WORDS
    }
}
