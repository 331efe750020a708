//! OS page primitives.

/// Page size assumed throughout the recycler.
pub const PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod imp {
    use std::ptr;

    pub unsafe fn reserve_commit(bytes: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
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

    pub unsafe fn release(ptr: *mut u8, bytes: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, bytes);
        }
    }

    pub unsafe fn decommit(ptr: *mut u8, bytes: usize) -> bool {
        unsafe { libc::madvise(ptr as *mut _, bytes, libc::MADV_DONTNEED) == 0 }
    }
}

#[cfg(windows)]
mod imp {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_READWRITE,
    };

    pub unsafe fn reserve_commit(bytes: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), bytes, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    pub unsafe fn release(ptr: *mut u8, _bytes: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    pub unsafe fn decommit(ptr: *mut u8, bytes: usize) -> bool {
        unsafe { VirtualFree(ptr as *mut _, bytes, MEM_DECOMMIT) != 0 }
    }
}

pub use imp::{decommit, release, reserve_commit};
