#![cfg(feature = "capi")]

mod common;

use common::read_u64;
use elf_module::{
    arch::REL_SYMBOLIC,
    capi::{rust_elf_load, rust_elf_load_len, rust_elf_sym, rust_elf_unload},
};
use gen_elf::{Arch, ElfOutput, ImageWriter, RelocEntry, SLOTS_SYMBOL, SymbolDesc};
use std::{
    ffi::{CString, c_void},
    ptr,
};

// Every test in this file shares the process-wide handle table, so each one
// uses its own symbol names.

fn image(symbols: &[SymbolDesc]) -> ElfOutput {
    ImageWriter::new(Arch::current())
        .write(&[], symbols)
        .expect("Failed to generate ELF")
}

fn load(output: &ElfOutput) -> *mut c_void {
    unsafe { rust_elf_load(output.data.as_ptr().cast()) }
}

fn sym(handle: *const c_void, name: &str) -> *mut c_void {
    let name = CString::new(name).unwrap();
    unsafe { rust_elf_sym(handle, name.as_ptr().cast()) }
}

#[test]
fn load_returns_a_handle_that_resolves_symbols() {
    let output = image(&[
        SymbolDesc::global_func("capi_answer", 42),
        SymbolDesc::global_object("capi_greeting", b"hi\0\0\0\0\0\0"),
    ]);
    let handle = load(&output);
    assert!(!handle.is_null());

    let answer = sym(handle, "capi_answer");
    let greeting = sym(handle, "capi_greeting");
    assert!(!answer.is_null());
    assert!(!greeting.is_null());
    assert_ne!(answer, greeting);
    assert_eq!(unsafe { std::slice::from_raw_parts(greeting as *const u8, 2) }, b"hi");

    assert!(sym(handle, "capi_missing").is_null());
    assert!(unsafe { rust_elf_sym(handle, ptr::null()) }.is_null());

    unsafe { rust_elf_unload(handle) };
}

#[test]
fn unloaded_handles_are_detected() {
    let output = image(&[SymbolDesc::global_func("capi_stale_func", 1)]);
    let handle = load(&output);
    assert!(!sym(handle, "capi_stale_func").is_null());

    unsafe { rust_elf_unload(handle) };
    assert!(sym(handle, "capi_stale_func").is_null());
    // A second unload is reported and ignored.
    unsafe { rust_elf_unload(handle) };
    unsafe { rust_elf_unload(ptr::null()) };

    // The slot is reused with a new generation; the old handle stays dead.
    let again = load(&output);
    assert!(!again.is_null());
    assert_ne!(again, handle);
    assert!(sym(handle, "capi_stale_func").is_null());
    assert!(!sym(again, "capi_stale_func").is_null());
    unsafe { rust_elf_unload(again) };
}

#[test]
fn null_handle_searches_modules_in_load_order() {
    let first = image(&[SymbolDesc::global_object("capi_first_wins", &[1; 8])]);
    let second = image(&[SymbolDesc::global_object("capi_first_wins", &[2; 8])]);
    let a = load(&first);
    let b = load(&second);
    assert!(!a.is_null() && !b.is_null());

    let global = sym(ptr::null(), "capi_first_wins");
    assert_eq!(global, sym(a, "capi_first_wins"));
    assert_ne!(global, sym(b, "capi_first_wins"));

    unsafe { rust_elf_unload(a) };
    assert_eq!(sym(ptr::null(), "capi_first_wins"), sym(b, "capi_first_wins"));
    unsafe { rust_elf_unload(b) };
    assert!(sym(ptr::null(), "capi_first_wins").is_null());
}

#[test]
fn loads_resolve_against_loaded_modules() {
    let provider = image(&[SymbolDesc::global_func("capi_provided", 5)]);
    let consumer = ImageWriter::new(Arch::current())
        .write(
            &[RelocEntry::with_name("capi_provided", REL_SYMBOLIC)],
            &[SymbolDesc::undefined_func("capi_provided")],
        )
        .unwrap();

    // Nothing provides the symbol yet.
    assert!(load(&consumer).is_null());

    let p = load(&provider);
    let c = load(&consumer);
    assert!(!c.is_null());
    let slots = sym(c, SLOTS_SYMBOL) as *const u8;
    let patched = unsafe { read_u64(slots.add(consumer.relocations[0].slot_offset as usize)) };
    assert_eq!(patched, sym(p, "capi_provided") as u64);

    // The consumer keeps the provider's memory alive.
    let code = unsafe { *(patched as *const u8) };
    unsafe { rust_elf_unload(p) };
    assert!(sym(p, "capi_provided").is_null());
    assert_eq!(unsafe { *(patched as *const u8) }, code);
    unsafe { rust_elf_unload(c) };
}

#[test]
fn load_len_rejects_truncated_buffers() {
    let output = image(&[SymbolDesc::global_func("capi_len_func", 3)]);
    let truncated =
        unsafe { rust_elf_load_len(output.data.as_ptr().cast(), output.data.len() - 1) };
    assert!(truncated.is_null());

    let handle = unsafe { rust_elf_load_len(output.data.as_ptr().cast(), output.data.len()) };
    assert!(!handle.is_null());
    assert!(!sym(handle, "capi_len_func").is_null());
    unsafe { rust_elf_unload(handle) };
}

#[test]
fn invalid_buffers_yield_null() {
    assert!(unsafe { rust_elf_load(ptr::null()) }.is_null());
    assert!(unsafe { rust_elf_load_len(ptr::null(), 64) }.is_null());

    let zeros = [0u8; 64];
    assert!(unsafe { rust_elf_load(zeros.as_ptr().cast()) }.is_null());
    assert!(unsafe { rust_elf_load_len(zeros.as_ptr().cast(), zeros.len()) }.is_null());

    let mut wrong_machine = image(&[SymbolDesc::global_func("capi_machine", 0)]).data;
    wrong_machine[18..20].copy_from_slice(&3u16.to_le_bytes());
    assert!(unsafe { rust_elf_load(wrong_machine.as_ptr().cast()) }.is_null());
}

#[test]
fn header_offsets_past_the_address_space_yield_null() {
    let output = image(&[SymbolDesc::global_func("capi_far_tables", 0)]);
    // e_phoff, then e_shoff.
    for field in [32, 40] {
        let mut corrupt = output.data.clone();
        corrupt[field..field + 8].copy_from_slice(&(1u64 << 63).to_le_bytes());
        assert!(unsafe { rust_elf_load(corrupt.as_ptr().cast()) }.is_null());
        assert!(unsafe { rust_elf_load_len(corrupt.as_ptr().cast(), corrupt.len()) }.is_null());
    }
}
