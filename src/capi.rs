//! `extern "C"` entry points.
//!
//! Modules loaded here live in a process-wide [`ModuleTable`] and are handed to
//! C as opaque handles. Each load resolves undefined symbols against every
//! module already in the table, in load order. Failures are reported on the
//! host console and surface as null pointers.

use crate::{
    Loader,
    input::ElfBinary,
    os::{ConsoleWriter, DefaultHost},
    registry::{Handle, ModuleTable},
};
use core::{
    ffi::{CStr, c_void},
    fmt::{self, Write},
    ptr,
};

static MODULES: ModuleTable<DefaultHost> = ModuleTable::new();

const UNNAMED: &str = "<memory>";

#[cold]
#[inline(never)]
fn report(args: fmt::Arguments<'_>) {
    let _ = ConsoleWriter(&DefaultHost).write_fmt(format_args!("[elf_module] {args}\r\n"));
}

fn load_binary(binary: ElfBinary<'_>) -> *mut c_void {
    let scope = MODULES.snapshot();
    let result = Loader::new()
        .map(binary)
        .and_then(|raw| raw.relocator().scope(&scope).relocate());
    drop(scope);
    match result {
        Ok(module) => match MODULES.insert(module) {
            Ok(handle) => handle.as_ptr(),
            Err(module) => {
                report(format_args!("load failed: handle table is full ({})", module.name()));
                ptr::null_mut()
            }
        },
        Err(err) => {
            report(format_args!("load failed: {err}"));
            ptr::null_mut()
        }
    }
}

/// Loads the ELF image at `elf_buf` and returns a handle to it, or null.
///
/// The image length is taken from its own headers.
///
/// # Safety
///
/// `elf_buf` must be null or point to an image whose ELF header and every
/// range described by its header tables are readable for the duration of
/// the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rust_elf_load(elf_buf: *const c_void) -> *mut c_void {
    if elf_buf.is_null() {
        report(format_args!("load failed: null buffer"));
        return ptr::null_mut();
    }
    match unsafe { ElfBinary::from_raw(UNNAMED, elf_buf.cast()) } {
        Ok(binary) => load_binary(binary),
        Err(err) => {
            report(format_args!("load failed: {err}"));
            ptr::null_mut()
        }
    }
}

/// Loads the ELF image in `buf[..len]` and returns a handle to it, or null.
///
/// # Safety
///
/// `buf` must be null or point to `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rust_elf_load_len(buf: *const c_void, len: usize) -> *mut c_void {
    if buf.is_null() {
        report(format_args!("load failed: null buffer"));
        return ptr::null_mut();
    }
    let bytes = unsafe { core::slice::from_raw_parts(buf.cast::<u8>(), len) };
    load_binary(ElfBinary::new(UNNAMED, bytes))
}

/// Returns the address of symbol `name` in the module behind `handle`, or null.
///
/// A null `handle` searches every loaded module in load order. A handle that
/// was already unloaded is reported and yields null.
///
/// # Safety
///
/// `name` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rust_elf_sym(handle: *const c_void, name: *const u8) -> *mut c_void {
    if name.is_null() {
        return ptr::null_mut();
    }
    let name = unsafe { CStr::from_ptr(name.cast()) }.to_bytes();
    let addr = if handle.is_null() {
        MODULES.find_global(name)
    } else {
        let found = Handle::from_ptr(handle)
            .and_then(|handle| MODULES.with(handle, |module| module.get_bytes(name)));
        let Some(addr) = found else {
            report(format_args!("sym failed: stale handle {handle:p}"));
            return ptr::null_mut();
        };
        addr
    };
    addr.map_or(ptr::null_mut(), |addr| addr.cast_mut().cast())
}

/// Unloads the module behind `handle`.
///
/// Null and stale handles are ignored; stale ones are reported.
///
/// # Safety
///
/// No code or data of the module may be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rust_elf_unload(handle: *const c_void) {
    if handle.is_null() {
        return;
    }
    match Handle::from_ptr(handle).and_then(|handle| MODULES.remove(handle)) {
        Some(module) => module.unload(),
        None => report(format_args!("unload failed: stale handle {handle:p}")),
    }
}
