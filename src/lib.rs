//! # elf-module
//!
//! **elf-module** loads ELF objects that already sit in memory into regions handed out by
//! the host, links them, and lets the caller look symbols up by name.
//!
//! The crate is `no_std` and knows nothing about the platform it runs on. Everything it
//! needs from the outside world goes through three host primitives: console output,
//! aligned allocation and free (see [`os::Host`]).
//!
//! ## Core Features
//!
//! * **Segment mapping**: every `PT_LOAD` segment gets its own aligned region with the
//!   BSS tail zero-filled; relocatable objects (`.o`) are packed by protection.
//! * **Relocation**: x86_64, AArch64 and RISC-V 64 relocation engines with a
//!   per-segment load bias.
//! * **Symbol lookup**: constant-time, read-only, safe to share across threads.
//! * **Leak-free failure paths**: every region is owned by a guard that frees it exactly
//!   once, whatever step of the load fails.
//! * **C ABI**: `rust_elf_load`, `rust_elf_sym` and `rust_elf_unload` with
//!   generation-tagged handles (feature `capi`).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use elf_module::{Loader, input::ElfBinary};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bytes = std::fs::read("plugin.so")?;
//!     let module = Loader::new().load(ElfBinary::new("plugin.so", &bytes))?;
//!
//!     let entry = module.get("plugin_entry").ok_or("symbol not found")?;
//!     let plugin_entry: extern "C" fn() -> i32 = unsafe { core::mem::transmute(entry) };
//!     plugin_entry();
//!
//!     module.unload();
//!     Ok(())
//! }
//! ```
#![no_std]
#![warn(
    clippy::unnecessary_wraps,
    clippy::unnecessary_lazy_evaluations,
    clippy::collapsible_if,
    clippy::cast_lossless,
    clippy::explicit_iter_loop,
    clippy::manual_assert,
    clippy::needless_question_mark,
    clippy::needless_return,
    clippy::needless_update,
    clippy::redundant_clone,
    clippy::redundant_else,
    clippy::redundant_static_lifetimes
)]
#![allow(clippy::len_without_is_empty, clippy::unnecessary_cast)]
extern crate alloc;

/// Compile-time check for supported architectures
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64",
)))]
compile_error!(
    "Unsupported target architecture. Supported architectures: x86_64, aarch64, riscv64"
);

pub mod arch;
#[cfg(feature = "capi")]
pub mod capi;
pub mod elf;
mod error;
pub mod image;
pub mod input;
pub mod loader;
pub mod os;
pub mod registry;
pub mod relocation;
pub mod segment;
mod sync;

pub(crate) use error::*;

pub use error::Error;
pub use image::{LoadedModule, RawModule, Symbol, SymbolBind, SymbolKind};
pub use loader::{LoadHook, LoadHookContext, Loader};
pub use segment::SegmentLayout;

/// A type alias for `Result`s returned by `elf_module` functions.
///
/// This is a convenience alias that eliminates the need to repeatedly specify
/// the `Error` type in function signatures.
pub type Result<T> = core::result::Result<T, Error>;
