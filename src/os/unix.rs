use crate::os::{AlignedAlloc, Console};
use core::{ffi::c_void, ptr::NonNull};
use libc::{STDERR_FILENO, free, posix_memalign, write};

/// Host backed by the C library: `posix_memalign`, `free` and `write(2)` on stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHost;

impl Console for DefaultHost {
    fn put_bytes(&self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let res = unsafe { write(STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
            if res <= 0 {
                return;
            }
            bytes = &bytes[res as usize..];
        }
    }
}

impl AlignedAlloc for DefaultHost {
    fn aligned_alloc(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        // posix_memalign wants at least pointer alignment.
        let align = align.max(size_of::<*const c_void>());
        let mut ptr: *mut c_void = core::ptr::null_mut();
        let res = unsafe { posix_memalign(&mut ptr, align, size) };
        if res != 0 {
            return None;
        }
        NonNull::new(ptr.cast())
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        unsafe { free(ptr.as_ptr().cast()) };
    }
}
