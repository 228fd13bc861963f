//! Fixed-size-class blocks.
//!
//! A block is a [`BLOCK_SIZE`]-aligned page. The header at its start records
//! the size class and holds one bitmap byte per cell; the rest of the page is
//! a payload of equal-size cells.
//!
//! ```text
//! +------------------------+-------+-------+-------+-----+---------+
//! | header (class, bitmap) | cell0 | cell1 | cell2 | ... | (slack) |
//! +------------------------+-------+-------+-------+-----+---------+
//! ^ block address (aligned)
//! ```

use std::mem;
use std::ptr::{self, NonNull};

use crate::cell::{CELL_ALLOCATED, CELL_MARKED};
use crate::layout::{BLOCK_MASK, BLOCK_SIZE, MAX_BOP_CELL_WORDS, MIN_CELL_WORDS, WORD_SIZE};

/// Enough bitmap bytes for the smallest size class.
const BITMAP_LEN: usize = BLOCK_SIZE / (MIN_CELL_WORDS * WORD_SIZE);

/// Metadata stored at the beginning of each block.
#[repr(C)]
pub struct BlockHeader {
    /// Cell size in words, zero while the block is unused.
    cell_words: usize,
    /// Number of cells that fit in the payload for this size class.
    num_cells: usize,
    /// Number of cells with the allocated bit set.
    live_cells: usize,
    /// Where the next free-cell search starts.
    cursor: usize,
    /// One byte per cell: [`CELL_ALLOCATED`] and [`CELL_MARKED`].
    bitmap: [u8; BITMAP_LEN],
}

/// Bytes at the start of every block taken by the header.
pub const HEADER_BYTES: usize = mem::size_of::<BlockHeader>().next_multiple_of(WORD_SIZE);

/// Bytes available for cells.
pub const PAYLOAD_BYTES: usize = BLOCK_SIZE - HEADER_BYTES;

const _: () = assert!(PAYLOAD_BYTES / (MIN_CELL_WORDS * WORD_SIZE) <= BITMAP_LEN);

/// A handle to a block inside a chunk.
///
/// The handle is a plain address; it stays valid for as long as the chunk
/// that owns the memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block(NonNull<BlockHeader>);

impl Block {
    /// Create a handle for the block at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be the block-aligned start of a block inside a live chunk.
    pub(crate) unsafe fn from_addr(addr: usize) -> Self {
        debug_assert_eq!(addr & !BLOCK_MASK, 0, "block address is not aligned");
        // SAFETY: chunk addresses are never null.
        Self(unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) })
    }

    /// The block that would contain `addr`, found by masking.
    ///
    /// # Safety
    ///
    /// `addr` must lie inside a live chunk.
    pub(crate) unsafe fn containing(addr: usize) -> Self {
        unsafe { Self::from_addr(addr & BLOCK_MASK) }
    }

    fn header(&self) -> &BlockHeader {
        // SAFETY: the chunk outlives every handle to its blocks.
        unsafe { self.0.as_ref() }
    }

    fn header_mut(&self) -> *mut BlockHeader {
        self.0.as_ptr()
    }

    /// Address of the block (and its header).
    #[must_use]
    pub fn address(&self) -> usize {
        self.0.as_ptr() as usize
    }

    fn payload_start(&self) -> usize {
        self.address() + HEADER_BYTES
    }

    /// Whether the block currently serves a size class.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.header().cell_words != 0
    }

    /// Cell size in words (zero while unused).
    #[must_use]
    pub fn cell_words(&self) -> usize {
        self.header().cell_words
    }

    /// Cell size in bytes.
    #[must_use]
    pub fn cell_bytes(&self) -> usize {
        self.cell_words() * WORD_SIZE
    }

    /// Number of cells in the payload.
    #[must_use]
    pub fn num_cells(&self) -> usize {
        self.header().num_cells
    }

    /// Number of allocated cells.
    #[must_use]
    pub fn live_cells(&self) -> usize {
        self.header().live_cells
    }

    /// No free cells remain.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.live_cells() == self.num_cells()
    }

    /// Assign a size class to an unused block.
    pub(crate) fn init(&self, cell_words: usize) {
        assert!(
            (MIN_CELL_WORDS..=MAX_BOP_CELL_WORDS).contains(&cell_words),
            "cell size {cell_words} outside the BOP size classes"
        );
        debug_assert!(!self.is_in_use());
        // SAFETY: we own the block memory and nothing else references it.
        unsafe {
            let header = self.header_mut();
            (*header).cell_words = cell_words;
            (*header).num_cells = PAYLOAD_BYTES / (cell_words * WORD_SIZE);
            (*header).live_cells = 0;
            (*header).cursor = 0;
            (*header).bitmap = [0; BITMAP_LEN];
        }
    }

    /// Return the block to the unused pool.
    pub(crate) fn reset(&self) {
        debug_assert_eq!(self.live_cells(), 0);
        // SAFETY: as for `init`.
        unsafe {
            let header = self.header_mut();
            (*header).cell_words = 0;
            (*header).num_cells = 0;
            (*header).live_cells = 0;
            (*header).cursor = 0;
            (*header).bitmap = [0; BITMAP_LEN];
        }
    }

    /// The address falls within the payload region.
    #[must_use]
    pub fn is_in_payload(&self, ptr: usize) -> bool {
        ptr >= self.payload_start() && ptr < self.payload_start() + PAYLOAD_BYTES
    }

    /// The address is the first byte of one of this block's cells.
    #[must_use]
    pub fn is_valid_address(&self, ptr: usize) -> bool {
        debug_assert!(self.is_in_use());

        if !self.is_in_payload(ptr) {
            return false;
        }
        let offset = ptr - self.payload_start();
        offset % self.cell_bytes() == 0 && offset / self.cell_bytes() < self.num_cells()
    }

    /// Index of the cell starting at `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a valid cell address for this block.
    #[must_use]
    pub fn index_of(&self, ptr: usize) -> usize {
        assert!(self.is_valid_address(ptr), "{ptr:#x} is not a cell of this block");
        (ptr - self.payload_start()) / self.cell_bytes()
    }

    /// Index of the cell whose payload contains `ptr`, if any.
    #[must_use]
    pub fn index_of_interior(&self, ptr: usize) -> Option<usize> {
        if !self.is_in_use() || !self.is_in_payload(ptr) {
            return None;
        }
        let index = (ptr - self.payload_start()) / self.cell_bytes();
        (index < self.num_cells()).then_some(index)
    }

    /// Address of the cell at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn index_to_pointer(&self, index: usize) -> NonNull<u8> {
        assert!(index < self.num_cells(), "cell index {index} out of range");
        let offset = index * self.cell_bytes();
        debug_assert!(offset + self.cell_bytes() <= PAYLOAD_BYTES);
        // SAFETY: the payload start is non-null and the offset is in range.
        unsafe { NonNull::new_unchecked((self.payload_start() + offset) as *mut u8) }
    }

    /// The bitmap byte of a cell.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn cell_bits(&self, index: usize) -> u8 {
        assert!(index < self.num_cells());
        self.header().bitmap[index]
    }

    fn cell_bits_mut(&self, index: usize) -> *mut u8 {
        assert!(index < self.num_cells());
        // SAFETY: index is in range of the bitmap.
        unsafe { ptr::addr_of_mut!((*self.header_mut()).bitmap).cast::<u8>().add(index) }
    }

    /// Allocated bit of a cell.
    #[must_use]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.cell_bits(index) & CELL_ALLOCATED != 0
    }

    /// Marked bit of a cell.
    #[must_use]
    pub fn is_marked(&self, index: usize) -> bool {
        self.cell_bits(index) & CELL_MARKED != 0
    }

    /// Set the marked bit of a cell.
    pub fn mark(&self, index: usize) {
        // SAFETY: single mutator, pointer is into this block's bitmap.
        unsafe { *self.cell_bits_mut(index) |= CELL_MARKED };
    }

    /// Clear the marked bit of a cell.
    pub fn unmark(&self, index: usize) {
        // SAFETY: as for `mark`.
        unsafe { *self.cell_bits_mut(index) &= !CELL_MARKED };
    }

    /// Claim a free cell, zero it and set its allocated bit.
    pub(crate) fn allocate_cell(&self) -> Option<usize> {
        if !self.is_in_use() || self.is_full() {
            return None;
        }

        let num_cells = self.num_cells();
        let cursor = self.header().cursor;
        let index = (cursor..num_cells)
            .chain(0..cursor)
            .find(|&i| !self.is_allocated(i))?;

        let cell = self.index_to_pointer(index);
        // SAFETY: the cell lies in our payload and is not in use.
        unsafe {
            ptr::write_bytes(cell.as_ptr(), 0, self.cell_bytes());
            *self.cell_bits_mut(index) = CELL_ALLOCATED;
            let header = self.header_mut();
            (*header).live_cells += 1;
            (*header).cursor = index + 1;
        }
        Some(index)
    }

    /// Free every allocated cell that was not marked and clear the marks of
    /// the survivors. Returns the number of cells freed.
    pub(crate) fn sweep(&self) -> usize {
        let mut freed = 0;
        for index in 0..self.num_cells() {
            let bits = self.cell_bits(index);
            if bits & CELL_ALLOCATED == 0 {
                debug_assert_eq!(bits & CELL_MARKED, 0, "marked free cell");
                continue;
            }
            // SAFETY: index is in range.
            unsafe {
                if bits & CELL_MARKED == 0 {
                    *self.cell_bits_mut(index) = 0;
                    freed += 1;
                } else {
                    *self.cell_bits_mut(index) = CELL_ALLOCATED;
                }
            }
        }
        // SAFETY: header is ours.
        unsafe {
            let header = self.header_mut();
            (*header).live_cells -= freed;
            (*header).cursor = 0;
        }
        freed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// A single zeroed, block-aligned page outside any chunk.
    pub(crate) struct TestPage(*mut u8);

    impl TestPage {
        pub(crate) fn new() -> Self {
            let layout = Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self(ptr)
        }

        pub(crate) fn block(&self) -> Block {
            unsafe { Block::from_addr(self.0 as usize) }
        }
    }

    impl Drop for TestPage {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE).unwrap();
            unsafe { dealloc(self.0, layout) };
        }
    }

    #[test]
    fn test_header_fits() {
        assert!(HEADER_BYTES < BLOCK_SIZE / 2);
        assert_eq!(HEADER_BYTES % WORD_SIZE, 0);
    }

    #[test]
    fn test_init_and_reset() {
        let page = TestPage::new();
        let block = page.block();
        assert!(!block.is_in_use());

        block.init(4);
        assert!(block.is_in_use());
        assert_eq!(block.cell_words(), 4);
        assert_eq!(block.num_cells(), PAYLOAD_BYTES / (4 * WORD_SIZE));

        block.reset();
        assert!(!block.is_in_use());
    }

    #[test]
    fn test_index_round_trip() {
        let page = TestPage::new();
        let block = page.block();
        block.init(3);

        for index in [0, 1, block.num_cells() - 1] {
            let ptr = block.index_to_pointer(index).as_ptr() as usize;
            assert!(block.is_valid_address(ptr));
            assert_eq!(block.index_of(ptr), index);
            assert_eq!(block.index_of_interior(ptr + WORD_SIZE), Some(index));
        }
    }

    #[test]
    fn test_address_validation() {
        let page = TestPage::new();
        let block = page.block();
        block.init(2);

        let first = block.index_to_pointer(0).as_ptr() as usize;
        assert!(!block.is_valid_address(block.address()));
        assert!(!block.is_valid_address(first + WORD_SIZE));
        assert!(!block.is_valid_address(first + 1));
        assert!(!block.is_in_payload(block.address() + BLOCK_SIZE));
    }

    #[test]
    #[should_panic(expected = "not a cell")]
    fn test_index_of_rejects_misaligned() {
        let page = TestPage::new();
        let block = page.block();
        block.init(2);
        let first = block.index_to_pointer(0).as_ptr() as usize;
        let _ = block.index_of(first + 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_to_pointer_out_of_range() {
        let page = TestPage::new();
        let block = page.block();
        block.init(2);
        let _ = block.index_to_pointer(block.num_cells());
    }

    #[test]
    fn test_allocate_distinct_cells() {
        let page = TestPage::new();
        let block = page.block();
        block.init(2);

        let a = block.allocate_cell().unwrap();
        let b = block.allocate_cell().unwrap();
        let c = block.allocate_cell().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert!(block.is_allocated(a) && block.is_allocated(b) && block.is_allocated(c));
        assert_eq!(block.live_cells(), 3);
    }

    #[test]
    fn test_fill_block() {
        let page = TestPage::new();
        let block = page.block();
        block.init(MAX_BOP_CELL_WORDS);

        for _ in 0..block.num_cells() {
            assert!(block.allocate_cell().is_some());
        }
        assert!(block.is_full());
        assert!(block.allocate_cell().is_none());
    }

    #[test]
    fn test_sweep_frees_unmarked() {
        let page = TestPage::new();
        let block = page.block();
        block.init(2);

        for _ in 0..3 {
            block.allocate_cell().unwrap();
        }
        block.mark(0);
        block.mark(2);

        assert_eq!(block.sweep(), 1);
        assert!(block.is_allocated(0));
        assert!(!block.is_allocated(1));
        assert!(block.is_allocated(2));
        assert!(!block.is_marked(0) && !block.is_marked(2));

        // The freed slot is the first one handed out again.
        assert_eq!(block.allocate_cell(), Some(1));
    }

    #[test]
    fn test_allocated_cell_is_zeroed() {
        let page = TestPage::new();
        let block = page.block();
        block.init(2);

        let index = block.allocate_cell().unwrap();
        let ptr = block.index_to_pointer(index).cast::<usize>();
        unsafe { ptr.as_ptr().write(0xfeed) };
        assert_eq!(block.sweep(), 1);

        let again = block.allocate_cell().unwrap();
        assert_eq!(again, index);
        assert_eq!(unsafe { ptr.as_ptr().read() }, 0);
    }
}
