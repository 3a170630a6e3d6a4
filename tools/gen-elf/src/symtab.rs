use crate::raw::{StrTab, Sym, SYM_SIZE};
use elf::abi::STB_LOCAL;

/// A symbol after placement.
#[derive(Clone, Debug)]
pub(crate) struct SymEntry {
    pub name: String,
    pub bind: u8,
    pub kind: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

/// An encoded symbol table with its string table.
pub(crate) struct SymTab {
    pub syms: Vec<u8>,
    pub strs: Vec<u8>,
    /// `sh_info`: one past the last local symbol.
    pub first_global: u32,
    names: Vec<String>,
}

impl SymTab {
    /// Encodes `entries` after the null symbol, locals first.
    pub(crate) fn build<'a>(entries: impl IntoIterator<Item = &'a SymEntry>) -> Self {
        let (locals, globals): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.bind == STB_LOCAL);
        let mut strtab = StrTab::new();
        let mut syms = vec![0; SYM_SIZE];
        let mut names = vec![String::new()];
        for entry in locals.iter().chain(globals.iter()) {
            let sym = Sym {
                st_name: strtab.add(&entry.name),
                st_info: (entry.bind << 4) | (entry.kind & 0xf),
                st_shndx: entry.shndx,
                st_value: entry.value,
                st_size: entry.size,
            };
            syms.extend_from_slice(&sym.encode());
            names.push(entry.name.clone());
        }
        Self {
            syms,
            strs: strtab.into_bytes(),
            first_global: 1 + locals.len() as u32,
            names,
        }
    }

    /// Index of the first non-local symbol called `name`.
    pub(crate) fn index_of(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .skip(self.first_global as usize)
            .position(|n| n == name)
            .map(|pos| pos as u32 + self.first_global)
    }
}
