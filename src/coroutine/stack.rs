//! Coroutine stacks backed by anonymous mappings with a guard page.

use std::io;
use std::ptr::NonNull;

/// An owned stack region. The lowest page is mapped `PROT_NONE` so an
/// overflow faults instead of silently corrupting the neighbour allocation.
pub struct Stack {
    base: NonNull<u8>,
    mapped: usize,
    guard: usize,
}

// The region is plain memory owned by exactly one coroutine.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

impl Stack {
    /// Map a stack with at least `size` usable bytes.
    pub fn new(size: usize) -> io::Result<Stack> {
        let page = page_size();
        let usable = size.max(page).div_ceil(page) * page;
        let mapped = usable + page;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(ptr, mapped) };
            return Err(err);
        }

        Ok(Stack {
            // mmap never hands out null on success.
            base: NonNull::new(ptr.cast()).ok_or_else(|| io::Error::other("mmap returned null"))?,
            mapped,
            guard: page,
        })
    }

    /// Lowest usable address (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.mapped - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.mapped) };
    }
}
