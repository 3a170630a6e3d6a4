#![allow(dead_code)]

use elf_module::{
    LoadedModule,
    os::{AlignedAlloc, Console},
};
use gen_elf::{ElfOutput, RelocInfo, SLOTS_SYMBOL};
use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Host that backs regions with executable anonymous mappings and keeps count.
///
/// `failing_at(n)` makes the n-th allocation request (1-based) fail. Freeing a
/// pointer the host never handed out panics, which catches double frees.
#[derive(Default)]
pub struct CountingHost {
    /// Returned pointer to the `(mapping, length)` it lives in.
    live: Mutex<HashMap<usize, (usize, usize)>>,
    requests: AtomicUsize,
    allocs: AtomicUsize,
    frees: AtomicUsize,
    fail_at: Option<usize>,
    console: Mutex<Vec<u8>>,
}

impl CountingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(n: usize) -> Self {
        Self {
            fail_at: Some(n),
            ..Self::default()
        }
    }

    /// Successful allocations.
    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Allocation requests, including the failed one.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn console(&self) -> String {
        String::from_utf8_lossy(&self.console.lock().unwrap()).into_owned()
    }
}

impl Console for CountingHost {
    fn put_bytes(&self, bytes: &[u8]) {
        self.console.lock().unwrap().extend_from_slice(bytes);
    }
}

impl AlignedAlloc for CountingHost {
    fn aligned_alloc(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at == Some(n) {
            return None;
        }
        let page = page_size();
        let len = (size + align.saturating_sub(page)).div_ceil(page) * page;
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return None;
        }
        let ptr = (map as usize).next_multiple_of(align);
        self.live.lock().unwrap().insert(ptr, (map as usize, len));
        self.allocs.fetch_add(1, Ordering::SeqCst);
        NonNull::new(ptr as *mut u8)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let (map, len) = self
            .live
            .lock()
            .unwrap()
            .remove(&(ptr.as_ptr() as usize))
            .expect("free of a pointer the host did not allocate");
        unsafe { libc::munmap(map as *mut libc::c_void, len) };
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Address of the field patched by `reloc`.
pub fn slot<H: elf_module::os::Host>(module: &LoadedModule<H>, reloc: &RelocInfo) -> *mut u8 {
    let slots = module
        .get(SLOTS_SYMBOL)
        .expect("relocation slots are exported") as usize;
    (slots + reloc.slot_offset as usize) as *mut u8
}

pub unsafe fn read_u64(p: *const u8) -> u64 {
    unsafe { (p as *const u64).read_unaligned() }
}

pub unsafe fn read_i32(p: *const u8) -> i32 {
    unsafe { (p as *const i32).read_unaligned() }
}

/// Calls a generated `fn() -> u32`.
pub unsafe fn call_u32(addr: *const ()) -> u32 {
    let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(addr) };
    f()
}

/// Overwrites the little-endian field at `off`.
pub fn patch(output: &ElfOutput, off: usize, bytes: &[u8]) -> Vec<u8> {
    let mut data = output.data.clone();
    data[off..off + bytes.len()].copy_from_slice(bytes);
    data
}
