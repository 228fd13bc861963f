use std::io;
use std::ptr;
use std::sync::OnceLock;

use libc::c_int;

/// Skip-swap-reservation flag where the platform has one.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const NO_RESERVE_FLAG: c_int = libc::MAP_NORESERVE;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const NO_RESERVE_FLAG: c_int = 0;

/// The system page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    })
}

/// Mappings are page aligned on Unix.
pub fn allocation_granularity() -> usize {
    page_size()
}

const fn map_flags(no_reserve: bool) -> c_int {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    if no_reserve {
        flags |= NO_RESERVE_FLAG;
    }
    flags
}

/// An owned `mmap` region, unmapped on drop.
pub struct MmapInner {
    base: ptr::NonNull<u8>,
    len: usize,
}

impl MmapInner {
    /// Map `len` bytes of private, zero-filled, read-write memory.
    ///
    /// # Safety
    ///
    /// `len` must be non-zero. The memory is only valid while `self` lives.
    pub unsafe fn map_anon(len: usize, no_reserve: bool) -> io::Result<Self> {
        // SAFETY: an anonymous mapping with a null hint has no other
        // preconditions.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                map_flags(no_reserve),
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        ptr::NonNull::new(addr.cast::<u8>())
            .map(|base| Self { base, len })
            .ok_or_else(|| io::Error::other("mmap returned null"))
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping we own.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}
