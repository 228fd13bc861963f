//! Heap layout constants.
//!
//! Everything that converts between addresses and (block, index)
//! coordinates, and the tagged-value primitives, agree on these values.

use std::mem;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// Size of a block. Blocks are aligned to their size so the owning block of
/// an address is recovered with [`BLOCK_MASK`].
pub const BLOCK_SIZE: usize = 4096;

/// Mask for extracting the block address from a pointer.
pub const BLOCK_MASK: usize = !(BLOCK_SIZE - 1);

/// Smallest cell, in words. Smaller requests are rounded up.
pub const MIN_CELL_WORDS: usize = 2;

/// Largest cell served by the big-bag-of-pages chunk, in words. Larger
/// requests use the best-fit chunk.
pub const MAX_BOP_CELL_WORDS: usize = 16;

/// Number of low bits available for a tag in any cell address.
pub const NUM_TAG_BITS: u32 = 2;

/// Mask selecting the tag bits of a tagged word.
pub const TAG_BITS: usize = (1 << NUM_TAG_BITS) - 1;

/// Words in the header that precedes every best-fit cell (size/bits word and
/// meta-info word).
pub const FIT_HEADER_WORDS: usize = 2;

/// Default size of each chunk reservation.
pub const DEFAULT_CHUNK_BYTES: usize = 4 * 1024 * 1024;

// Cells are word aligned, a tag must fit in the alignment slack.
const _: () = assert!(WORD_SIZE >= 1 << NUM_TAG_BITS);
const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(MAX_BOP_CELL_WORDS >= MIN_CELL_WORDS);

/// Round a request up to the cell size actually handed out.
#[must_use]
pub const fn cell_words_for(size_in_words: usize) -> usize {
    if size_in_words < MIN_CELL_WORDS {
        MIN_CELL_WORDS
    } else {
        size_in_words
    }
}

/// Convert a byte count to words, rounding up.
#[must_use]
pub const fn bytes_to_words(bytes: usize) -> usize {
    bytes.div_ceil(WORD_SIZE)
}
