//! ELF (Executable and Linkable Format) parsing and data structures.
//!
//! The types here describe the input as it sits in the caller's buffer. Nothing
//! in this module allocates host memory or writes to the image.

mod defs;
mod ehdr;
mod image;
mod symbol;

pub(crate) use defs::*;
pub(crate) use image::measure;
pub(crate) use symbol::SymbolPlace;

pub use defs::{EHDR_SIZE, ElfPhdr, ElfRela, ElfShdr, ElfSymbol};
pub use ehdr::ElfHeader;
pub use image::{ElfImage, ElfStringTable};
pub use symbol::SymbolTable;
