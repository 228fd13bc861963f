//! Tagged-pointer primitives.
//!
//! A tagged word carries a small tag in its low [`NUM_TAG_BITS`] bits. A
//! pointer can be tagged in place because cells are word aligned; a plain
//! word has to be shifted left first to make room.

use crate::layout::{NUM_TAG_BITS, TAG_BITS};

/// Combine an aligned pointer with a tag.
///
/// `ptr` must have its tag bits clear and `tag` must fit in [`TAG_BITS`].
#[must_use]
#[inline]
pub const fn make_tag(ptr: usize, tag: usize) -> usize {
    debug_assert!(ptr & TAG_BITS == 0, "pointer is not tag aligned");
    debug_assert!(tag & !TAG_BITS == 0, "tag out of range");
    ptr | tag
}

/// Shift a word left to make room for a tag, then add the tag.
///
/// The top [`NUM_TAG_BITS`] bits of `word` are lost.
#[must_use]
#[inline]
pub const fn shift_make_tag(word: usize, tag: usize) -> usize {
    debug_assert!(tag & !TAG_BITS == 0, "tag out of range");
    (word << NUM_TAG_BITS) | tag
}

/// Split a tagged pointer into the pointer and its tag.
#[must_use]
#[inline]
pub const fn break_tag(tagged: usize) -> (usize, usize) {
    (tagged & !TAG_BITS, tagged & TAG_BITS)
}

/// Split a tagged word into the unshifted word and its tag.
///
/// The word is shifted logically, so a word that was negative before
/// [`shift_make_tag`] comes back with its top bits clear.
#[must_use]
#[inline]
pub const fn break_shift_tag(tagged: usize) -> (usize, usize) {
    ((tagged & !TAG_BITS) >> NUM_TAG_BITS, tagged & TAG_BITS)
}

/// Drop the tag of a shifted word, undoing [`shift_make_tag`].
#[must_use]
#[inline]
pub const fn unshift_value(word: usize) -> usize {
    word >> NUM_TAG_BITS
}
