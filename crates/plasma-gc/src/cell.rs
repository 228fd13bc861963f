//! Typed handles over cell addresses.
//!
//! A handle is only ever built for an address that is already known to be
//! the start of a cell: either during allocation or after a validated
//! reverse lookup through the [`Heap`](crate::heap::Heap).

use std::ptr::NonNull;

use crate::block::Block;
use crate::layout::{FIT_HEADER_WORDS, WORD_SIZE};

/// The cell holds a live allocation.
pub const CELL_ALLOCATED: u8 = 0x01;

/// The cell was reached during the current mark phase.
pub const CELL_MARKED: u8 = 0x02;

/// Bits of the fit header info word used for the cell bits.
const FIT_BITS_MASK: usize = 0xff;

/// Shift of the payload size within the fit header info word.
const FIT_SIZE_SHIFT: u32 = 8;

// ============================================================================
// CellPtrBop - a cell in a fixed-size-class block
// ============================================================================

/// A cell in a big-bag-of-pages block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellPtrBop {
    block: Block,
    index: usize,
    ptr: NonNull<u8>,
}

impl CellPtrBop {
    /// Build from coordinates.
    #[must_use]
    pub fn new(block: Block, index: usize) -> Self {
        Self {
            block,
            index,
            ptr: block.index_to_pointer(index),
        }
    }

    /// Build from an address already validated as a cell start of `block`.
    pub(crate) fn from_ptr(block: Block, ptr: usize) -> Self {
        Self::new(block, block.index_of(ptr))
    }

    /// The owning block.
    #[must_use]
    pub const fn block(&self) -> Block {
        self.block
    }

    /// Index within the block.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// The cell address.
    #[must_use]
    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Cell size in words.
    #[must_use]
    pub fn size_words(&self) -> usize {
        self.block.cell_words()
    }

    /// Allocated bit.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.block.is_allocated(self.index)
    }

    /// Marked bit.
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.block.is_marked(self.index)
    }

    /// Set the marked bit.
    pub fn mark(&self) {
        self.block.mark(self.index);
    }
}

// ============================================================================
// CellPtrFit - a variable-size cell in the best-fit chunk
// ============================================================================

/// A cell in the best-fit chunk.
///
/// The payload is preceded by a two word header:
///
/// ```text
/// [ size << 8 | bits ][ meta info ][ payload ... ]
///                                  ^ ptr
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellPtrFit {
    ptr: NonNull<u8>,
}

impl CellPtrFit {
    /// Wrap a payload address.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload start of a cell inside a live fit chunk.
    pub(crate) const unsafe fn from_payload(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    /// The payload address.
    #[must_use]
    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn header(&self) -> *mut usize {
        // SAFETY: every fit cell has its header immediately before it.
        unsafe { self.ptr.as_ptr().cast::<usize>().sub(FIT_HEADER_WORDS) }
    }

    fn info(&self) -> usize {
        // SAFETY: the header is part of the chunk.
        unsafe { self.header().read() }
    }

    /// Write a fresh header.
    pub(crate) fn init(&self, size_words: usize, bits: u8) {
        // SAFETY: the header is part of the chunk.
        unsafe {
            self.header().write((size_words << FIT_SIZE_SHIFT) | usize::from(bits));
            self.header().add(1).write(0);
        }
    }

    /// Payload size in words.
    #[must_use]
    pub fn size_words(&self) -> usize {
        self.info() >> FIT_SIZE_SHIFT
    }

    /// Header plus payload, in words.
    #[must_use]
    pub fn total_words(&self) -> usize {
        self.size_words() + FIT_HEADER_WORDS
    }

    /// The bits byte of the header.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn cell_bits(&self) -> u8 {
        (self.info() & FIT_BITS_MASK) as u8
    }

    fn set_cell_bits(&self, bits: u8) {
        let info = (self.info() & !FIT_BITS_MASK) | usize::from(bits);
        // SAFETY: the header is part of the chunk.
        unsafe { self.header().write(info) };
    }

    /// Allocated bit.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.cell_bits() & CELL_ALLOCATED != 0
    }

    /// Marked bit.
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.cell_bits() & CELL_MARKED != 0
    }

    /// Set the marked bit.
    pub fn mark(&self) {
        self.set_cell_bits(self.cell_bits() | CELL_MARKED);
    }

    /// Clear the marked bit.
    pub fn unmark(&self) {
        self.set_cell_bits(self.cell_bits() & !CELL_MARKED);
    }

    /// Clear every bit, turning the cell into a free extent.
    pub(crate) fn free(&self) {
        self.set_cell_bits(0);
        self.set_meta(std::ptr::null_mut());
    }

    /// The meta-info word.
    #[must_use]
    pub fn meta(&self) -> *mut u8 {
        // SAFETY: the header is part of the chunk.
        unsafe { self.header().add(1).read() as *mut u8 }
    }

    /// Replace the meta-info word.
    pub fn set_meta(&self, meta: *mut u8) {
        // SAFETY: the header is part of the chunk.
        unsafe { self.header().add(1).write(meta as usize) };
    }
}

// ============================================================================
// CellPtr - closed union over both cell kinds
// ============================================================================

/// Either kind of cell. The set is closed: a new chunk kind needs changes
/// throughout the collector anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellPtr {
    /// A cell in a fixed-size-class block.
    Bop(CellPtrBop),
    /// A cell in the best-fit chunk.
    Fit(CellPtrFit),
}

impl CellPtr {
    /// The cell address.
    #[must_use]
    pub const fn ptr(&self) -> NonNull<u8> {
        match self {
            Self::Bop(cell) => cell.ptr(),
            Self::Fit(cell) => cell.ptr(),
        }
    }

    /// Payload size in words.
    #[must_use]
    pub fn size_words(&self) -> usize {
        match self {
            Self::Bop(cell) => cell.size_words(),
            Self::Fit(cell) => cell.size_words(),
        }
    }

    /// Bytes this cell accounts for in heap usage.
    #[must_use]
    pub fn footprint_bytes(&self) -> usize {
        match self {
            Self::Bop(cell) => cell.size_words() * WORD_SIZE,
            Self::Fit(cell) => cell.total_words() * WORD_SIZE,
        }
    }

    /// Allocated bit.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        match self {
            Self::Bop(cell) => cell.is_allocated(),
            Self::Fit(cell) => cell.is_allocated(),
        }
    }

    /// Marked bit.
    #[must_use]
    pub fn is_marked(&self) -> bool {
        match self {
            Self::Bop(cell) => cell.is_marked(),
            Self::Fit(cell) => cell.is_marked(),
        }
    }

    /// Set the marked bit.
    pub fn mark(&self) {
        match self {
            Self::Bop(cell) => cell.mark(),
            Self::Fit(cell) => cell.mark(),
        }
    }

    /// Payload words, read one at a time.
    pub(crate) fn fields(&self) -> impl Iterator<Item = usize> {
        let base = self.ptr().as_ptr().cast::<usize>();
        // SAFETY: an allocated cell's payload holds `size_words` initialised
        // words.
        (0..self.size_words()).map(move |i| unsafe { base.add(i).read() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::tests::TestPage;

    #[test]
    fn test_bop_cell_round_trip() {
        let page = TestPage::new();
        let block = page.block();
        block.init(5);

        let index = block.allocate_cell().unwrap();
        let cell = CellPtrBop::new(block, index);
        let again = CellPtrBop::from_ptr(block, cell.ptr().as_ptr() as usize);
        assert_eq!(cell, again);
        assert_eq!(again.index(), index);
        assert_eq!(again.size_words(), 5);
    }

    #[test]
    fn test_bop_cell_marking() {
        let page = TestPage::new();
        let block = page.block();
        block.init(2);

        let cell = CellPtr::Bop(CellPtrBop::new(block, block.allocate_cell().unwrap()));
        assert!(cell.is_allocated());
        assert!(!cell.is_marked());
        cell.mark();
        assert!(cell.is_marked());
        assert_eq!(cell.footprint_bytes(), 2 * WORD_SIZE);
    }

    #[test]
    fn test_fit_header() {
        let mut words = [0usize; 8];
        let payload = NonNull::new(words[FIT_HEADER_WORDS..].as_mut_ptr().cast::<u8>()).unwrap();
        let cell = unsafe { CellPtrFit::from_payload(payload) };

        cell.init(6, CELL_ALLOCATED);
        assert_eq!(cell.size_words(), 6);
        assert_eq!(cell.total_words(), 6 + FIT_HEADER_WORDS);
        assert!(cell.is_allocated());

        cell.mark();
        assert!(cell.is_marked());
        assert_eq!(cell.size_words(), 6);
        cell.unmark();
        assert!(!cell.is_marked());

        let meta = 0x1000 as *mut u8;
        cell.set_meta(meta);
        assert_eq!(cell.meta(), meta);

        cell.free();
        assert!(!cell.is_allocated());
        assert!(cell.meta().is_null());
        assert_eq!(cell.size_words(), 6);
    }
}
