//! Low-level OS memory primitives.
//!
//! Anonymous mappings that are released on drop, plus the ability to hand
//! physical memory of a sub-range back to the OS (`decommit`) while keeping
//! the address range reserved, and to make it usable again (`recommit`).

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

/// Releases the physical memory behind `[ptr, ptr + len)`.
///
/// The address range stays reserved. Its contents read as zero once it is
/// touched again (after [`recommit`] on platforms that need it).
///
/// # Errors
///
/// Returns the OS error if the request was rejected.
///
/// # Safety
///
/// The range must lie inside a live [`Mmap`], be page aligned, and hold no
/// data anyone still reads.
pub unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    unsafe { os::decommit(ptr, len) }
}

/// Makes a previously decommitted range usable again.
///
/// # Errors
///
/// Returns the OS error if the range could not be committed.
///
/// # Safety
///
/// The range must lie inside a live [`Mmap`] and be page aligned.
pub unsafe fn recommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    unsafe { os::recommit(ptr, len) }
}

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A handle to a memory mapped region.
///
/// The region is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `[ptr, ptr + len)` lies inside this mapping.
    #[must_use]
    pub fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let start = self.ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr.saturating_add(len) <= start + self.len()
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets a hint address for the mapping.
    ///
    /// The OS is free to ignore it. The address should be aligned to
    /// [`allocation_granularity`].
    #[must_use]
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to skip reserving swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled, read-write memory map.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping could not be created, or
    /// `InvalidInput` if no length was set.
    ///
    /// # Safety
    ///
    /// A non-zero hint must not overlap memory the caller relies on.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe {
            os::MmapInner::map_anon(self.hint_addr, self.len, self.populate, self.no_reserve)?
        };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe { MmapOptions::new().len(len).map_anon().expect("failed to map") };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_zero_len_rejected() {
        let err = unsafe { MmapOptions::new().map_anon() }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_decommit_then_recommit_reads_zero() {
        let ps = page_size();
        let mmap = unsafe { MmapOptions::new().len(ps * 4).map_anon().expect("failed to map") };
        let second = unsafe { mmap.ptr().add(ps) };

        unsafe {
            ptr::write_bytes(mmap.ptr(), 0xAB, ps * 4);
            decommit(second, ps * 2).expect("decommit");
            recommit(second, ps * 2).expect("recommit");

            assert_eq!(ptr::read_volatile(second), 0);
            assert_eq!(ptr::read_volatile(second.add(ps * 2 - 1)), 0);
            // Pages outside the range keep their contents.
            assert_eq!(ptr::read_volatile(mmap.ptr()), 0xAB);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(ps * 3)), 0xAB);
        }
    }

    #[test]
    fn test_contains() {
        let ps = page_size();
        let mmap = unsafe { MmapOptions::new().len(ps * 2).map_anon().expect("failed to map") };
        assert!(mmap.contains(mmap.ptr(), ps * 2));
        assert!(!mmap.contains(mmap.ptr(), ps * 2 + 1));
        assert!(!mmap.is_empty());
    }
}
