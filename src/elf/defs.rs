//! Raw ELF structures for the native class and byte order.
//!
//! Every supported target is a 64-bit architecture, so only the `Elf64_*`
//! layouts are defined. Fields keep their names from the System V ABI.

use bytemuck::{Pod, Zeroable};
use elf::abi::{ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB};

/// The ELF class this loader accepts.
pub const E_CLASS: u8 = ELFCLASS64;

/// The data encoding this loader accepts.
#[cfg(target_endian = "little")]
pub const E_DATA: u8 = ELFDATA2LSB;
/// The data encoding this loader accepts.
#[cfg(target_endian = "big")]
pub const E_DATA: u8 = ELFDATA2MSB;

/// Size of the ELF file header in bytes.
pub const EHDR_SIZE: usize = size_of::<ElfEhdr>();

/// ELF file header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfEhdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// Program header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfPhdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// Section header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfShdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

/// Symbol table entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfSymbol {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl ElfSymbol {
    /// Symbol binding (`STB_*`).
    #[inline]
    pub fn st_bind(&self) -> u8 {
        self.st_info >> 4
    }

    /// Symbol type (`STT_*`).
    #[inline]
    pub fn st_type(&self) -> u8 {
        self.st_info & 0xf
    }
}

/// Relocation entry with an explicit addend.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfRela {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

impl ElfRela {
    /// Relocation type.
    #[inline]
    pub fn r_type(&self) -> u32 {
        (self.r_info & 0xffff_ffff) as u32
    }

    /// Index of the referenced symbol.
    #[inline]
    pub fn r_symbol(&self) -> usize {
        (self.r_info >> 32) as usize
    }
}
