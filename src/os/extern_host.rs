//! Host backed by symbols the embedding environment exports.

use crate::os::{AlignedAlloc, Console};
use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
};

unsafe extern "C" {
    fn rust_console_putbytes(bs: *const u8, len: usize);
    fn rust_aligned_alloc(alignment: usize, size: usize) -> *mut u8;
    fn rust_free(ptr: *const u8);
}

/// Forwards to `rust_console_putbytes`, `rust_aligned_alloc` and `rust_free`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExternHost;

impl Console for ExternHost {
    fn put_bytes(&self, bytes: &[u8]) {
        unsafe { rust_console_putbytes(bytes.as_ptr(), bytes.len()) };
    }
}

impl AlignedAlloc for ExternHost {
    fn aligned_alloc(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { rust_aligned_alloc(align, size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        unsafe { rust_free(ptr.as_ptr()) };
    }
}

/// A [`GlobalAlloc`] over the host hooks.
///
/// Bare-metal embedders without an allocator of their own can register it:
///
/// ```rust,ignore
/// #[global_allocator]
/// static ALLOC: elf_module::os::ExternGlobalAlloc = elf_module::os::ExternGlobalAlloc;
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct ExternGlobalAlloc;

unsafe impl GlobalAlloc for ExternGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { rust_aligned_alloc(layout.align(), layout.size()) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { rust_free(ptr) }
    }
}
