//! ELF header parsing and validation
//!
//! This module provides functionality for parsing and validating ELF headers,
//! which contain essential metadata about ELF files such as architecture,
//! file type, and section/program header information.

use crate::{
    Result,
    arch::EM_ARCH,
    elf::{E_CLASS, E_DATA, EHDR_SIZE, ElfEhdr, ElfPhdr, ElfShdr},
    parse_ehdr_error,
};
use alloc::format;
use core::ops::Deref;
use elf::abi::{EI_CLASS, EI_DATA, EI_VERSION, ELFMAGIC, ET_DYN, ET_EXEC, ET_REL, EV_CURRENT};

/// A validated copy of the ELF file header.
///
/// Construction checks that the object was built for the running target, so
/// every `ElfHeader` in hand describes something this loader can place.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct ElfHeader {
    ehdr: ElfEhdr,
}

impl Deref for ElfHeader {
    type Target = ElfEhdr;

    fn deref(&self) -> &Self::Target {
        &self.ehdr
    }
}

impl ElfHeader {
    /// Reads and validates the header at the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too short or doesn't represent a valid ELF header.
    pub(crate) fn new(data: &[u8]) -> Result<Self> {
        let Some(raw) = data.get(..EHDR_SIZE) else {
            return Err(parse_ehdr_error(format!(
                "truncated header: need {} bytes, found {}",
                EHDR_SIZE,
                data.len()
            )));
        };
        let ehdr = ElfHeader {
            ehdr: bytemuck::pod_read_unaligned(raw),
        };
        ehdr.validate()?;
        Ok(ehdr)
    }

    /// Returns `true` if the object is a relocatable file (`.o`).
    #[inline]
    pub fn is_relocatable(&self) -> bool {
        self.ehdr.e_type == ET_REL
    }

    /// Validates the ELF header magic, class, data encoding, version, type and architecture.
    pub fn validate(&self) -> Result<()> {
        if self.e_ident[0..4] != ELFMAGIC {
            return Err(parse_ehdr_error("invalid ELF magic"));
        }

        if self.e_ident[EI_CLASS] != E_CLASS {
            return Err(parse_ehdr_error(format!(
                "file class mismatch: expected {}, found {}",
                E_CLASS, self.e_ident[EI_CLASS]
            )));
        }

        if self.e_ident[EI_DATA] != E_DATA {
            return Err(parse_ehdr_error(format!(
                "data encoding mismatch: expected {}, found {}",
                E_DATA, self.e_ident[EI_DATA]
            )));
        }

        if self.e_ident[EI_VERSION] != EV_CURRENT || self.e_version != u32::from(EV_CURRENT) {
            return Err(parse_ehdr_error("invalid ELF version"));
        }

        if self.e_machine != EM_ARCH {
            return Err(parse_ehdr_error(format!(
                "file arch mismatch: expected {}, found {}",
                machine_to_str(EM_ARCH),
                machine_to_str(self.e_machine),
            )));
        }

        if !matches!(self.e_type, ET_REL | ET_EXEC | ET_DYN) {
            return Err(parse_ehdr_error(format!(
                "unsupported object type {}",
                self.e_type
            )));
        }

        if self.e_phnum != 0 && self.e_phentsize() != size_of::<ElfPhdr>() {
            return Err(parse_ehdr_error(format!(
                "unexpected program header size {}",
                self.e_phentsize
            )));
        }

        if self.e_shnum != 0 && self.e_shentsize() != size_of::<ElfShdr>() {
            return Err(parse_ehdr_error(format!(
                "unexpected section header size {}",
                self.e_shentsize
            )));
        }

        Ok(())
    }

    /// Returns the number of program headers.
    #[inline]
    pub fn e_phnum(&self) -> usize {
        self.ehdr.e_phnum as usize
    }

    /// Returns the size of each program header entry.
    #[inline]
    pub fn e_phentsize(&self) -> usize {
        self.ehdr.e_phentsize as usize
    }

    /// Returns the file offset of the program header table.
    #[inline]
    pub fn e_phoff(&self) -> usize {
        self.ehdr.e_phoff as usize
    }

    /// Returns the file offset of the section header table.
    #[inline]
    pub fn e_shoff(&self) -> usize {
        self.ehdr.e_shoff as usize
    }

    /// Returns the size of each section header entry.
    #[inline]
    pub fn e_shentsize(&self) -> usize {
        self.ehdr.e_shentsize as usize
    }

    /// Returns the number of section headers.
    #[inline]
    pub fn e_shnum(&self) -> usize {
        self.ehdr.e_shnum as usize
    }

    /// Returns the `(start, end)` file offsets of the program header table,
    /// or `None` if the range overflows.
    #[inline]
    pub fn phdr_range(&self) -> Option<(usize, usize)> {
        let phdrs_size = self.e_phentsize().checked_mul(self.e_phnum())?;
        let phdr_start = self.e_phoff();
        Some((phdr_start, phdr_start.checked_add(phdrs_size)?))
    }

    /// Returns the `(start, end)` file offsets of the section header table,
    /// or `None` if the range overflows.
    #[inline]
    pub fn shdr_range(&self) -> Option<(usize, usize)> {
        let shdrs_size = self.e_shentsize().checked_mul(self.e_shnum())?;
        let shdr_start = self.e_shoff();
        Some((shdr_start, shdr_start.checked_add(shdrs_size)?))
    }
}

fn machine_to_str(machine: u16) -> &'static str {
    match machine {
        elf::abi::EM_X86_64 => "x86_64",
        elf::abi::EM_AARCH64 => "AArch64",
        elf::abi::EM_RISCV => "RISC-V",
        elf::abi::EM_386 => "x86",
        elf::abi::EM_ARM => "ARM",
        258 => "LoongArch",
        _ => "unknown",
    }
}
