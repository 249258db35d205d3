//! Region management - page-granular OS memory
//!
//! Regions are mapped directly (mmap / VirtualAlloc) so a stack region can
//! carry an inaccessible guard page below its lowest usable byte.

use core::ptr::NonNull;

use crate::error::{FfiError, Result};

/// Mapped memory block, optionally preceded by a guard page
pub struct Region {
    base: NonNull<u8>,
    len: usize,
    mapping: *mut u8,
    mapping_len: usize,
}

// Regions own their mapping; access is coordinated by arena leases.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map at least `len` bytes, rounded up to the page size
    pub fn map(len: usize, guard: bool) -> Result<Self> {
        let page = page_size();
        let len = super::bump::align_up(len.max(1), page);
        let guard_len = if guard { page } else { 0 };

        let mapping = sys::map(len + guard_len)
            .ok_or_else(|| FfiError::exhausted(format!("Failed to map {} bytes of memory", len)))?;

        if guard && !sys::protect_guard(mapping, guard_len) {
            sys::unmap(mapping, len + guard_len);
            return Err(FfiError::exhausted("Failed to install guard page"));
        }

        let base = NonNull::new(mapping.wrapping_add(guard_len))
            .ok_or_else(|| FfiError::exhausted("Mapped region is null"))?;

        Ok(Self {
            base,
            len,
            mapping,
            mapping_len: len + guard_len,
        })
    }

    /// First usable byte
    #[inline]
    pub fn start(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// One past the last usable byte
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.base.as_ptr().wrapping_add(self.len)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        sys::unmap(self.mapping, self.mapping_len);
    }
}

pub fn page_size() -> usize {
    sys::page_size()
}

#[cfg(unix)]
mod sys {
    use std::ptr;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    pub fn map(len: usize) -> Option<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        (ptr != libc::MAP_FAILED).then_some(ptr as *mut u8)
    }

    pub fn protect_guard(ptr: *mut u8, len: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_NONE) == 0 }
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, len);
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::ptr;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

    pub fn page_size() -> usize {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        (info.dwPageSize as usize).max(4096)
    }

    pub fn map(len: usize) -> Option<*mut u8> {
        let ptr = unsafe { VirtualAlloc(ptr::null_mut(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
        (!ptr.is_null()).then_some(ptr as *mut u8)
    }

    pub fn protect_guard(ptr: *mut u8, len: usize) -> bool {
        let mut old = 0;
        unsafe { VirtualProtect(ptr as *mut _, len, PAGE_NOACCESS, &mut old) != 0 }
    }

    pub fn unmap(ptr: *mut u8, _len: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    const ALIGN: usize = 4096;

    pub fn page_size() -> usize {
        ALIGN
    }

    pub fn map(len: usize) -> Option<*mut u8> {
        let layout = Layout::from_size_align(len, ALIGN).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        (!ptr.is_null()).then_some(ptr)
    }

    // No page protection without an OS mapping API
    pub fn protect_guard(_ptr: *mut u8, _len: usize) -> bool {
        true
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        if let Ok(layout) = Layout::from_size_align(len, ALIGN) {
            unsafe { dealloc(ptr, layout) };
        }
    }
}
