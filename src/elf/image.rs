//! Bounds-checked view over an ELF object held in memory.

use crate::{
    Result,
    elf::{EHDR_SIZE, ElfHeader, ElfPhdr, ElfShdr, SymbolTable},
    parse_phdr_error, parse_shdr_error,
};
use alloc::{format, vec::Vec};
use bytemuck::Pod;
use elf::abi::{PT_LOAD, SHN_UNDEF, SHT_DYNSYM, SHT_NOBITS, SHT_STRTAB, SHT_SYMTAB};

/// The parsed, read-only view of an input buffer.
///
/// The view borrows the caller's bytes and never writes to them. Table entries
/// are copied out with unaligned reads, so the buffer needs no alignment.
pub struct ElfImage<'bytes> {
    bytes: &'bytes [u8],
    ehdr: ElfHeader,
    phdrs: Vec<ElfPhdr>,
    shdrs: Vec<ElfShdr>,
}

impl<'bytes> ElfImage<'bytes> {
    /// Parses the header tables of `bytes`.
    pub fn parse(bytes: &'bytes [u8]) -> Result<Self> {
        let ehdr = ElfHeader::new(bytes)?;

        let phdrs = if ehdr.e_phnum() == 0 {
            Vec::new()
        } else {
            let (start, end) = ehdr
                .phdr_range()
                .ok_or_else(|| parse_phdr_error("program header table overflows"))?;
            read_table(bytes, start, end)
                .ok_or_else(|| parse_phdr_error("truncated program header table"))?
        };

        let shdrs = if ehdr.e_shnum() == 0 {
            Vec::new()
        } else {
            let (start, end) = ehdr
                .shdr_range()
                .ok_or_else(|| parse_shdr_error("section header table overflows"))?;
            read_table(bytes, start, end)
                .ok_or_else(|| parse_shdr_error("truncated section header table"))?
        };

        let image = Self {
            bytes,
            ehdr,
            phdrs,
            shdrs,
        };
        image.validate_contents()?;
        Ok(image)
    }

    fn validate_contents(&self) -> Result<()> {
        for (idx, phdr) in self.loadable_segments() {
            if phdr.p_filesz > phdr.p_memsz {
                return Err(parse_phdr_error(format!(
                    "segment {idx}: file size {:#x} exceeds memory size {:#x}",
                    phdr.p_filesz, phdr.p_memsz
                )));
            }
            if phdr.p_align > 1 && !phdr.p_align.is_power_of_two() {
                return Err(parse_phdr_error(format!(
                    "segment {idx}: alignment {:#x} is not a power of two",
                    phdr.p_align
                )));
            }
            if self.file_range(phdr.p_offset, phdr.p_filesz).is_none() {
                return Err(parse_phdr_error(format!(
                    "segment {idx}: content lies outside the image"
                )));
            }
        }
        for (idx, shdr) in self.shdrs.iter().enumerate() {
            if shdr.sh_type != SHT_NOBITS
                && shdr.sh_type != elf::abi::SHT_NULL
                && self.file_range(shdr.sh_offset, shdr.sh_size).is_none()
            {
                return Err(parse_shdr_error(format!(
                    "section {idx}: content lies outside the image"
                )));
            }
            if shdr.sh_addralign > 1 && !shdr.sh_addralign.is_power_of_two() {
                return Err(parse_shdr_error(format!(
                    "section {idx}: alignment {:#x} is not a power of two",
                    shdr.sh_addralign
                )));
            }
        }
        Ok(())
    }

    fn file_range(&self, offset: u64, size: u64) -> Option<&'bytes [u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        self.bytes.get(start..end)
    }

    /// The validated file header.
    #[inline]
    pub fn ehdr(&self) -> &ElfHeader {
        &self.ehdr
    }

    /// All program headers.
    #[inline]
    pub fn phdrs(&self) -> &[ElfPhdr] {
        &self.phdrs
    }

    /// All section headers.
    #[inline]
    pub fn shdrs(&self) -> &[ElfShdr] {
        &self.shdrs
    }

    /// `PT_LOAD` headers with their index in the program header table.
    pub fn loadable_segments(&self) -> impl Iterator<Item = (usize, &ElfPhdr)> {
        self.phdrs
            .iter()
            .enumerate()
            .filter(|(_, phdr)| phdr.p_type == PT_LOAD)
    }

    /// File content of a segment, `p_filesz` bytes long.
    pub fn segment_data(&self, phdr: &ElfPhdr) -> Result<&'bytes [u8]> {
        self.file_range(phdr.p_offset, phdr.p_filesz)
            .ok_or_else(|| parse_phdr_error("segment content lies outside the image"))
    }

    /// File content of a section. `SHT_NOBITS` sections have none.
    pub fn section_data(&self, shdr: &ElfShdr) -> Result<&'bytes [u8]> {
        if shdr.sh_type == SHT_NOBITS {
            return Ok(&[]);
        }
        self.file_range(shdr.sh_offset, shdr.sh_size)
            .ok_or_else(|| parse_shdr_error("section content lies outside the image"))
    }

    /// Returns the section at `idx`.
    pub fn section(&self, idx: usize) -> Result<&ElfShdr> {
        self.shdrs
            .get(idx)
            .ok_or_else(|| parse_shdr_error(format!("section index {idx} out of range")))
    }

    /// Reads a section's content as a table of `T`.
    pub fn section_entries<T: Pod>(&self, shdr: &ElfShdr) -> Result<Vec<T>> {
        let entsize = size_of::<T>() as u64;
        if shdr.sh_entsize != 0 && shdr.sh_entsize != entsize {
            return Err(parse_shdr_error(format!(
                "unexpected entry size {} (expected {})",
                shdr.sh_entsize, entsize
            )));
        }
        let data = self.section_data(shdr)?;
        if data.len() % size_of::<T>() != 0 {
            return Err(parse_shdr_error("section size is not a multiple of its entry size"));
        }
        Ok(data
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Returns the string table at section `idx`.
    pub fn string_table(&self, idx: usize) -> Result<ElfStringTable<'bytes>> {
        let shdr = self.section(idx)?;
        if shdr.sh_type != SHT_STRTAB {
            return Err(parse_shdr_error(format!(
                "section {idx} is not a string table"
            )));
        }
        Ok(ElfStringTable::new(self.section_data(shdr)?))
    }

    /// Locates the symbol table: `.symtab` when present, `.dynsym` otherwise.
    ///
    /// A stripped image with neither gets an empty table, so it loads with no exports.
    pub fn symbol_table(&self) -> Result<SymbolTable<'bytes>> {
        let found = self
            .shdrs
            .iter()
            .enumerate()
            .find(|(_, shdr)| shdr.sh_type == SHT_SYMTAB)
            .or_else(|| {
                self.shdrs
                    .iter()
                    .enumerate()
                    .find(|(_, shdr)| shdr.sh_type == SHT_DYNSYM)
            });
        match found {
            Some((idx, shdr)) => self.read_symbol_table(idx, shdr),
            None => Ok(SymbolTable::new(0, Vec::new(), ElfStringTable::new(&[]))),
        }
    }

    /// Reads the symbol table at section `idx`, as named by a relocation section's `sh_link`.
    pub fn symbol_table_at(&self, idx: usize) -> Result<SymbolTable<'bytes>> {
        let shdr = self.section(idx)?;
        if shdr.sh_type != SHT_SYMTAB && shdr.sh_type != SHT_DYNSYM {
            return Err(parse_shdr_error(format!(
                "section {idx} is not a symbol table"
            )));
        }
        self.read_symbol_table(idx, shdr)
    }

    fn read_symbol_table(&self, idx: usize, shdr: &ElfShdr) -> Result<SymbolTable<'bytes>> {
        let symbols = self.section_entries(shdr)?;
        let strtab = self.string_table(shdr.sh_link as usize)?;
        Ok(SymbolTable::new(idx, symbols, strtab))
    }

    /// Entry point recorded in the header, if any.
    pub fn entry(&self) -> Option<u64> {
        (self.ehdr.e_entry != 0).then_some(self.ehdr.e_entry)
    }

    /// Name of the section at `idx` from the section header string table, for diagnostics.
    pub fn section_name(&self, idx: usize) -> &'bytes [u8] {
        let shstrndx = self.ehdr.e_shstrndx as usize;
        if shstrndx == SHN_UNDEF as usize {
            return b"";
        }
        let Ok(shdr) = self.section(idx) else {
            return b"";
        };
        self.string_table(shstrndx)
            .ok()
            .and_then(|strtab| strtab.get(shdr.sh_name as usize))
            .unwrap_or(b"")
    }
}

fn read_table<T: Pod>(bytes: &[u8], start: usize, end: usize) -> Option<Vec<T>> {
    let raw = bytes.get(start..end)?;
    Some(
        raw.chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect(),
    )
}

/// A string table section.
#[derive(Clone, Copy)]
pub struct ElfStringTable<'bytes> {
    data: &'bytes [u8],
}

impl<'bytes> ElfStringTable<'bytes> {
    pub(crate) fn new(data: &'bytes [u8]) -> Self {
        Self { data }
    }

    /// Returns the NUL-terminated string at `offset`, without its terminator.
    ///
    /// Returns `None` if the offset is out of range or the string is not terminated
    /// inside the table.
    pub fn get(&self, offset: usize) -> Option<&'bytes [u8]> {
        let tail = self.data.get(offset..)?;
        let len = tail.iter().position(|&b| b == 0)?;
        Some(&tail[..len])
    }
}

/// Computes how many bytes of an image are described by its own headers.
///
/// The extent covers the file header, both header tables, and the file content of
/// every segment and section.
///
/// # Safety
///
/// `ptr` must point to at least [`EHDR_SIZE`] readable bytes, and every range
/// the header tables describe must be readable as well.
pub(crate) unsafe fn measure(ptr: *const u8) -> Result<usize> {
    let head = unsafe { core::slice::from_raw_parts(ptr, EHDR_SIZE) };
    let ehdr = ElfHeader::new(head)?;
    let mut extent = EHDR_SIZE;

    if ehdr.e_phnum() != 0 {
        let (start, end) = ehdr
            .phdr_range()
            .filter(|&(_, end)| end <= isize::MAX as usize)
            .ok_or_else(|| parse_phdr_error("program header table overflows"))?;
        extent = extent.max(end);
        let table = unsafe { core::slice::from_raw_parts(ptr, end) };
        let phdrs: Vec<ElfPhdr> = read_table(table, start, end)
            .ok_or_else(|| parse_phdr_error("truncated program header table"))?;
        for phdr in &phdrs {
            let end = phdr
                .p_offset
                .checked_add(phdr.p_filesz)
                .and_then(|end| usize::try_from(end).ok())
                .filter(|&end| end <= isize::MAX as usize)
                .ok_or_else(|| parse_phdr_error("segment range overflows"))?;
            extent = extent.max(end);
        }
    }

    if ehdr.e_shnum() != 0 {
        let (start, end) = ehdr
            .shdr_range()
            .filter(|&(_, end)| end <= isize::MAX as usize)
            .ok_or_else(|| parse_shdr_error("section header table overflows"))?;
        extent = extent.max(end);
        let table = unsafe { core::slice::from_raw_parts(ptr, end) };
        let shdrs: Vec<ElfShdr> = read_table(table, start, end)
            .ok_or_else(|| parse_shdr_error("truncated section header table"))?;
        for shdr in shdrs.iter().filter(|shdr| shdr.sh_type != SHT_NOBITS) {
            let end = shdr
                .sh_offset
                .checked_add(shdr.sh_size)
                .and_then(|end| usize::try_from(end).ok())
                .filter(|&end| end <= isize::MAX as usize)
                .ok_or_else(|| parse_shdr_error("section range overflows"))?;
            extent = extent.max(end);
        }
    }

    Ok(extent)
}
