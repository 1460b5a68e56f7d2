//! Aligned buffer allocation
//!
//! Sample containers and ring-buffer cells live in page-aligned, zeroed
//! regions. On Linux the allocation is backed by `mmap`, trying huge pages
//! first and falling back to normal pages; large regions can additionally
//! be pinned with `mlock` so sustained capture never waits on paging.

use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use log::debug;
use log::warn;

/// Cache line size assumed for cell and bookkeeping alignment
pub const CACHE_ALIGNMENT: usize = 64;

/// Round `value` up to the next multiple of `alignment`
pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Round `value` up to the next power of two
pub fn next_power_of_two(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

/// A page-aligned, zero-initialised memory region
#[derive(Debug)]
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    #[cfg(target_os = "linux")]
    mapped: bool,
}

// The buffer owns its region exclusively; sharing across threads is managed
// by the owning structure.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes
    #[cfg(target_os = "linux")]
    pub fn zeroed(len: usize) -> Self {
        let len = align_up(len.max(1), page_size());
        unsafe {
            // Huge pages first; fall back to normal pages
            let mut ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                debug!("could not use huge pages, using normal pages");
                ptr = libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
            }
            if ptr != libc::MAP_FAILED {
                return Self {
                    ptr: NonNull::new_unchecked(ptr as *mut u8),
                    len,
                    mapped: true,
                };
            }
        }

        // mmap exhausted: use the global allocator
        Self::zeroed_heap(len)
    }

    /// Allocate `len` zeroed bytes
    #[cfg(not(target_os = "linux"))]
    pub fn zeroed(len: usize) -> Self {
        Self::zeroed_heap(len.max(1))
    }

    fn zeroed_heap(len: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(len, CACHE_ALIGNMENT)
            .expect("invalid buffer layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("buffer allocation failed");
        Self {
            ptr,
            len,
            #[cfg(target_os = "linux")]
            mapped: false,
        }
    }

    /// Pin the region in memory; a refusal is logged, not fatal
    pub fn lock_memory(&self) {
        #[cfg(target_os = "linux")]
        unsafe {
            if libc::mlock(self.ptr.as_ptr() as *const libc::c_void, self.len) != 0 {
                warn!("could not lock {} bytes of buffer memory", self.len);
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = self;
            warn!("memory locking not supported on this platform");
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Zero the whole region
    pub fn clear(&mut self) {
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.len) };
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if self.mapped {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
            return;
        }
        let layout = std::alloc::Layout::from_size_align(self.len, CACHE_ALIGNMENT)
            .expect("invalid buffer layout");
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

#[cfg(target_os = "linux")]
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(target_os = "linux"))]
pub fn page_size() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(3), 4);
        assert_eq!(next_power_of_two(1024), 1024);
        assert_eq!(next_power_of_two(1025), 2048);
    }

    #[test]
    fn test_zeroed_and_writable() {
        let mut buffer = AlignedBuffer::zeroed(100);
        assert!(buffer.len() >= 100);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));

        buffer.as_mut_slice()[0] = 0xAB;
        assert_eq!(buffer.as_slice()[0], 0xAB);

        buffer.clear();
        assert_eq!(buffer.as_slice()[0], 0);
    }

    #[test]
    fn test_alignment() {
        let buffer = AlignedBuffer::zeroed(10);
        assert_eq!(buffer.as_ptr() as usize % CACHE_ALIGNMENT, 0);
    }
}
