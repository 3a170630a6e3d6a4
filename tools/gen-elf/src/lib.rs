//! Writers for the small ELF files the elf-module tests load.
//!
//! [`ImageWriter`] produces a linked shared object with two `PT_LOAD` segments
//! (code, then data with a zero-filled tail); [`ObjectWriter`] produces a
//! relocatable object with `.text`, `.data` and `.bss`. Both place the field
//! of every requested relocation in a table of 8-byte slots in the data
//! section, exported as [`SLOTS_SYMBOL`], so a test can find each patched
//! field at `slots + RelocInfo::slot_offset`.

mod arch;
mod image;
mod object;
mod raw;
mod symtab;

pub use arch::Arch;
pub use image::ImageWriter;
pub use object::ObjectWriter;
pub use raw::{EHDR_SIZE, PHDR_SIZE, SHDR_SIZE};

use elf::abi::{STB_GLOBAL, STB_LOCAL, STB_WEAK};

/// Name of the exported table holding one 8-byte slot per relocation.
pub const SLOTS_SYMBOL: &str = "__reloc_slots";

/// Page size and segment alignment of linked images.
pub const PAGE_SIZE: u64 = 0x1000;

#[derive(Clone, Debug)]
pub(crate) enum SymbolBody {
    /// A function returning a constant.
    Func(u32),
    Object(Vec<u8>),
    /// Read-only data in `.rodata`; relocatable objects only.
    ReadOnly(Vec<u8>),
    /// Zero-initialized object of the given size in `.bss`.
    Bss(u64),
    UndefinedFunc,
    UndefinedObject,
    /// `SHN_COMMON` with the given size.
    Common(u64),
    Absolute(u64),
}

/// A symbol to define or reference.
#[derive(Clone, Debug)]
pub struct SymbolDesc {
    pub(crate) name: String,
    pub(crate) body: SymbolBody,
    pub(crate) bind: u8,
}

impl SymbolDesc {
    fn new(name: &str, body: SymbolBody) -> Self {
        Self {
            name: name.to_string(),
            body,
            bind: STB_GLOBAL,
        }
    }

    /// A function that returns `value`.
    pub fn global_func(name: &str, value: u32) -> Self {
        Self::new(name, SymbolBody::Func(value))
    }

    pub fn global_object(name: &str, data: &[u8]) -> Self {
        Self::new(name, SymbolBody::Object(data.to_vec()))
    }

    pub fn global_rodata(name: &str, data: &[u8]) -> Self {
        Self::new(name, SymbolBody::ReadOnly(data.to_vec()))
    }

    pub fn global_bss(name: &str, size: u64) -> Self {
        Self::new(name, SymbolBody::Bss(size))
    }

    pub fn undefined_func(name: &str) -> Self {
        Self::new(name, SymbolBody::UndefinedFunc)
    }

    pub fn undefined_object(name: &str) -> Self {
        Self::new(name, SymbolBody::UndefinedObject)
    }

    /// A tentative definition, as emitted by compilers without `-fno-common`.
    pub fn common(name: &str, size: u64) -> Self {
        Self::new(name, SymbolBody::Common(size))
    }

    pub fn absolute(name: &str, value: u64) -> Self {
        Self::new(name, SymbolBody::Absolute(value))
    }

    pub fn weak(mut self) -> Self {
        self.bind = STB_WEAK;
        self
    }

    pub fn local(mut self) -> Self {
        self.bind = STB_LOCAL;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A relocation to emit against the next free slot.
#[derive(Clone, Debug)]
pub struct RelocEntry {
    pub(crate) symbol: Option<String>,
    pub(crate) r_type: u32,
    pub(crate) addend: i64,
    /// Symbol whose address is folded into the addend, for `R_*_RELATIVE`.
    pub(crate) base: Option<String>,
}

impl RelocEntry {
    /// A relocation without a symbol.
    pub fn new(r_type: u32) -> Self {
        Self {
            symbol: None,
            r_type,
            addend: 0,
            base: None,
        }
    }

    pub fn with_name(name: &str, r_type: u32) -> Self {
        Self {
            symbol: Some(name.to_string()),
            ..Self::new(r_type)
        }
    }

    /// A symbol-less relocation whose addend is the link-time address of `name`.
    pub fn relative(r_type: u32, name: &str) -> Self {
        Self {
            base: Some(name.to_string()),
            ..Self::new(r_type)
        }
    }

    pub fn with_addend(mut self, addend: i64) -> Self {
        self.addend = addend;
        self
    }
}

/// Where a relocation was emitted.
#[derive(Clone, Debug)]
pub struct RelocInfo {
    /// Offset of the patched field from [`SLOTS_SYMBOL`].
    pub slot_offset: u64,
    pub r_type: u32,
    /// Index of the symbol in the table the relocation section links to.
    pub sym_idx: u32,
    /// The addend as written to the file.
    pub addend: i64,
    pub symbol: Option<String>,
}

/// A generated file.
#[derive(Clone, Debug)]
pub struct ElfOutput {
    pub data: Vec<u8>,
    pub relocations: Vec<RelocInfo>,
}

impl ElfOutput {
    /// File offset of program header `idx`.
    pub fn phdr_offset(&self, idx: usize) -> usize {
        EHDR_SIZE + idx * PHDR_SIZE
    }

    /// File offset of section header `idx`.
    pub fn shdr_offset(&self, idx: usize) -> usize {
        self.read_u64(40) as usize + idx * SHDR_SIZE
    }

    /// Index of the section called `name`.
    pub fn section_index(&self, name: &str) -> Option<usize> {
        let shnum = u16::from_le_bytes([self.data[60], self.data[61]]) as usize;
        let shstrndx = u16::from_le_bytes([self.data[62], self.data[63]]) as usize;
        let strtab_off = self.read_u64(self.shdr_offset(shstrndx) + 24) as usize;
        (0..shnum).find(|&idx| {
            let name_off = self.read_u32(self.shdr_offset(idx)) as usize;
            self.name_at(strtab_off + name_off, name)
        })
    }

    /// `st_value` of the first `.symtab` entry called `name`.
    pub fn symbol_value(&self, name: &str) -> Option<u64> {
        let shdr = self.shdr_offset(self.section_index(".symtab")?);
        let off = self.read_u64(shdr + 24) as usize;
        let count = self.read_u64(shdr + 32) as usize / raw::SYM_SIZE;
        let link = self.read_u32(shdr + 40) as usize;
        let strtab_off = self.read_u64(self.shdr_offset(link) + 24) as usize;
        (1..count).find_map(|idx| {
            let sym = off + idx * raw::SYM_SIZE;
            let name_off = self.read_u32(sym) as usize;
            self.name_at(strtab_off + name_off, name)
                .then(|| self.read_u64(sym + 8))
        })
    }

    fn name_at(&self, start: usize, name: &str) -> bool {
        let end = start + name.len();
        self.data.get(start..end) == Some(name.as_bytes()) && self.data.get(end) == Some(&0)
    }

    fn read_u32(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    fn read_u64(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }
}
