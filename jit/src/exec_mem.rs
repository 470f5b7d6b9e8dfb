use std::io;
use std::ptr;

use crate::error::Error;
use crate::vm::JitFn;

/// Finalized machine code in an executable mapping.
///
/// Follows W^X discipline: the mapping is writable only while the code
/// bytes are copied in, then flipped to read-execute for the rest of
/// its lifetime. Writable and executable never coexist.
pub struct ExecMem {
    ptr: *mut u8,
    size: usize,
    code_len: usize,
}

// SAFETY: ExecMem owns its mapping exclusively and the code bytes are
// immutable once installed.
unsafe impl Send for ExecMem {}
unsafe impl Sync for ExecMem {}

impl ExecMem {
    /// Map a fresh read-write region sized for `code` (rounded up to
    /// the page size), copy the bytes in, and seal it read-execute.
    pub fn install(code: &[u8]) -> Result<Self, Error> {
        let page = page_size();
        let size = (code.len().max(1) + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
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
            return Err(Error::Map(io::Error::last_os_error()));
        }

        let mem = Self {
            ptr: ptr as *mut u8,
            size,
            code_len: code.len(),
        };

        // SAFETY: the mapping is at least code.len() bytes and writable.
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), mem.ptr, code.len()) };

        let ret = unsafe {
            libc::mprotect(
                mem.ptr as *mut libc::c_void,
                mem.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if ret != 0 {
            // mem drops here and unmaps the region.
            return Err(Error::Protect(io::Error::last_os_error()));
        }

        Ok(mem)
    }

    /// Entry point of the installed function, at offset 0.
    pub fn entry(&self) -> JitFn {
        // SAFETY: the mapping holds a complete function starting at
        // offset 0 and is PROT_EXEC.
        unsafe { std::mem::transmute(self.ptr) }
    }

    /// Length of the installed code in bytes.
    #[inline]
    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

impl Drop for ExecMem {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
