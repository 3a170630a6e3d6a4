use crate::elf::{ElfStringTable, ElfSymbol};
use alloc::vec::Vec;
use elf::abi::{SHN_ABS, SHN_COMMON, SHN_UNDEF, STB_WEAK};

/// Where a symbol table entry is defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SymbolPlace {
    Undefined,
    Absolute,
    Common,
    Section(usize),
}

/// The symbol table of an image together with its string table.
pub struct SymbolTable<'bytes> {
    shndx: usize,
    symbols: Vec<ElfSymbol>,
    strtab: ElfStringTable<'bytes>,
}

impl<'bytes> SymbolTable<'bytes> {
    pub(crate) fn new(
        shndx: usize,
        symbols: Vec<ElfSymbol>,
        strtab: ElfStringTable<'bytes>,
    ) -> Self {
        Self {
            shndx,
            symbols,
            strtab,
        }
    }

    /// Section index of the table itself.
    #[inline]
    pub fn section_index(&self) -> usize {
        self.shndx
    }

    /// Number of entries, including the null symbol at index 0.
    #[inline]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&ElfSymbol> {
        self.symbols.get(idx)
    }

    /// Name of a symbol, without its NUL terminator.
    #[inline]
    pub fn name(&self, sym: &ElfSymbol) -> Option<&'bytes [u8]> {
        self.strtab.get(sym.st_name as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ElfSymbol)> {
        self.symbols.iter().enumerate()
    }
}

impl ElfSymbol {
    pub(crate) fn place(&self) -> SymbolPlace {
        match self.st_shndx {
            SHN_UNDEF => SymbolPlace::Undefined,
            SHN_ABS => SymbolPlace::Absolute,
            SHN_COMMON => SymbolPlace::Common,
            idx => SymbolPlace::Section(idx as usize),
        }
    }

    #[inline]
    pub(crate) fn is_weak(&self) -> bool {
        self.st_bind() == STB_WEAK
    }
}
