//! Executable memory for installed code.
//!
//! W^X discipline: a buffer is writable while code is copied and patched
//! in, then flipped to executable-and-read-only before any entry point
//! escapes. Patching installed code (jump-table entries after a label
//! moves, bailout helper rebinding) briefly flips it back.

use std::ptr::NonNull;

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub const PAGE_SIZE: usize = 4096;

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub unsafe fn free(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }

    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };

    pub const PAGE_SIZE: usize = 4096;

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let mut old = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old) != 0 }
    }

    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        let mut old = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_READWRITE, &mut old) != 0 }
    }
}

pub use platform::PAGE_SIZE;

/// A page-aligned buffer of code memory.
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    is_executable: bool,
}

impl ExecutableBuffer {
    /// Allocate a writable buffer of at least `min_capacity` bytes.
    pub fn new(min_capacity: usize) -> Option<Self> {
        let capacity = min_capacity.max(PAGE_SIZE).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let ptr = unsafe { platform::alloc_rw(capacity) };
        let ptr = NonNull::new(ptr)?;
        Some(ExecutableBuffer { ptr, capacity, len: 0, is_executable: false })
    }

    /// Copy `code` into the buffer. Fails if it does not fit or the
    /// buffer is already executable.
    pub fn write(&mut self, code: &[u8]) -> bool {
        if self.is_executable || self.len + code.len() > self.capacity {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr().add(self.len), code.len());
        }
        self.len += code.len();
        true
    }

    /// Patch 8 bytes at `offset`. Only legal while writable.
    pub fn patch_u64(&mut self, offset: usize, value: u64) -> bool {
        if self.is_executable || offset + 8 > self.len {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                value.to_le_bytes().as_ptr(),
                self.ptr.as_ptr().add(offset),
                8,
            );
        }
        true
    }

    /// Flip to executable-and-read-only.
    pub fn finalize(&mut self) -> bool {
        if self.is_executable {
            return true;
        }
        let ok = unsafe { platform::make_executable(self.ptr.as_ptr(), self.capacity) };
        self.is_executable = ok;
        ok
    }

    /// Flip back to writable for patching.
    pub fn make_writable(&mut self) -> bool {
        if !self.is_executable {
            return true;
        }
        let ok = unsafe { platform::make_writable(self.ptr.as_ptr(), self.capacity) };
        if ok {
            self.is_executable = false;
        }
        !self.is_executable
    }

    /// Base address of the buffer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Bytes written.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether anything has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the buffer is currently executable.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        unsafe {
            platform::free(self.ptr.as_ptr(), self.capacity);
        }
    }
}

// Buffers move between the codegen thread and the installer.
unsafe impl Send for ExecutableBuffer {}

impl std::fmt::Debug for ExecutableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecutableBuffer({:p}, {}/{} bytes, {})",
            self.ptr,
            self.len,
            self.capacity,
            if self.is_executable { "x" } else { "rw" }
        )
    }
}
