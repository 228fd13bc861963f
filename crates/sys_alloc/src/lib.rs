//! Anonymous page mappings with a caller-chosen alignment.
//!
//! The collector finds the block that owns an address by masking, so every
//! chunk it reserves must start on a block boundary. Operating systems only
//! guarantee page (or allocation-granularity) alignment, so larger alignments
//! are obtained by over-reserving and handing out an aligned window.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Mappings are always aligned to at least this value.
pub fn allocation_granularity() -> usize {
    os::allocation_granularity()
}

/// A handle to an anonymous memory mapping.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
    offset: usize,
    len: usize,
}

impl Mmap {
    /// Returns a pointer to the start of the usable, aligned window.
    pub fn ptr(&self) -> *mut u8 {
        // SAFETY: offset + len never exceeds the reservation.
        unsafe { self.inner.ptr().add(self.offset) }
    }

    /// Returns the length of the usable window in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping is empty (never the case for a
    /// successfully created mapping).
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `addr` lies inside the usable window.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < start + self.len
    }

    /// Bytes reserved from the OS, including alignment slack.
    pub fn reserved_len(&self) -> usize {
        self.inner.len()
    }
}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0, page
    /// alignment). You must set a length before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            align: 0,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes. It is rounded up to a whole
    /// number of pages.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets the alignment of the returned window. Must be a power of two.
    /// Zero means "whatever the OS gives", i.e. page alignment.
    pub const fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Sets whether to reserve swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled, read-write mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a non power-of-two
    /// alignment, or the OS error if the mapping itself fails.
    ///
    /// # Safety
    ///
    /// The returned pointer is only valid while the `Mmap` is alive. Callers
    /// that hand out raw pointers into the window must not let them outlive
    /// it.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let page = page_size();
        let len = self.len.div_ceil(page) * page;
        let slack = if self.align > allocation_granularity() {
            self.align
        } else {
            0
        };

        let inner = unsafe {
            os::MmapInner::map_anon(len + slack, self.no_reserve)?
        };

        let base = inner.ptr() as usize;
        let offset = if slack == 0 {
            0
        } else {
            base.next_multiple_of(self.align) - base
        };

        Ok(Mmap { inner, offset, len })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}
