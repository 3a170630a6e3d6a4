use crate::{
    Error, LoadedModule, Result,
    elf::{ElfImage, SymbolPlace, SymbolTable},
    os::Host,
    relocation::SymbolLookup,
    segment::ElfSegments,
};
use alloc::{format, vec, vec::Vec};
use core::borrow::Borrow;
use elf::abi::{PT_TLS, STT_TLS};

/// Runtime address of every entry of a module's symbol table.
pub(crate) struct ResolvedSymbols<'bytes> {
    names: Vec<&'bytes [u8]>,
    addrs: Vec<Option<usize>>,
}

impl ResolvedSymbols<'_> {
    /// The table of a relocation section that names no symbol table.
    pub(crate) fn empty() -> Self {
        Self {
            names: Vec::new(),
            addrs: Vec::new(),
        }
    }

    /// Address of symbol `idx`. Unresolved strong symbols have none.
    #[inline]
    pub(crate) fn get(&self, idx: usize) -> Option<usize> {
        self.addrs.get(idx).copied().flatten()
    }

    pub(crate) fn name(&self, idx: usize) -> &[u8] {
        self.names.get(idx).copied().unwrap_or(b"")
    }
}

/// Where a defined symbol's value is relative to.
pub(crate) fn defined_addr<H: Host>(
    image: &ElfImage<'_>,
    segments: &ElfSegments<H>,
    place: SymbolPlace,
    st_type: u8,
    value: u64,
) -> Option<usize> {
    match place {
        SymbolPlace::Absolute => usize::try_from(value).ok(),
        SymbolPlace::Section(idx) if image.ehdr().is_relocatable() => {
            segments.section_addr(idx)?.checked_add(usize::try_from(value).ok()?)
        }
        // TLS values are offsets into the TLS template; report the template copy.
        SymbolPlace::Section(_) if st_type == STT_TLS => {
            let tls = image.phdrs().iter().find(|phdr| phdr.p_type == PT_TLS)?;
            segments.translate(tls.p_vaddr.checked_add(value)?)
        }
        SymbolPlace::Section(_) => segments.translate(value),
        SymbolPlace::Undefined | SymbolPlace::Common => None,
    }
}

/// Resolves the symbol table of a mapped module.
///
/// Undefined symbols are looked up in `pre_find` first and then in `scope`, in
/// order. The returned flags tell which scope modules supplied at least one symbol.
pub(crate) fn resolve_symbols<'bytes, H, M>(
    name: &str,
    image: &ElfImage<'bytes>,
    symtab: &SymbolTable<'bytes>,
    segments: &ElfSegments<H>,
    pre_find: &dyn SymbolLookup,
    scope: &[M],
) -> Result<(ResolvedSymbols<'bytes>, Vec<bool>)>
where
    H: Host,
    M: Borrow<LoadedModule<H>>,
{
    let mut used = vec![false; scope.len()];
    let mut names = Vec::with_capacity(symtab.len());
    let mut addrs = Vec::with_capacity(symtab.len());

    for (idx, sym) in symtab.iter() {
        let sym_name = symtab.name(sym).unwrap_or(b"");
        let addr = match sym.place() {
            SymbolPlace::Common => {
                return Err(Error::Relocation {
                    msg: format!(
                        "common symbol `{}` in {}; compile with -fno-common",
                        sym_name.escape_ascii(),
                        name
                    ),
                });
            }
            SymbolPlace::Undefined if idx == 0 => Some(0),
            SymbolPlace::Undefined => {
                let found = core::str::from_utf8(sym_name)
                    .ok()
                    .and_then(|name| pre_find.lookup(name))
                    .map(|addr| addr as usize)
                    .or_else(|| {
                        scope.iter().enumerate().find_map(|(i, module)| {
                            let addr = module.borrow().get_bytes(sym_name)?;
                            used[i] = true;
                            Some(addr as usize)
                        })
                    });
                match found {
                    Some(addr) => {
                        #[cfg(feature = "log")]
                        log::trace!(
                            "[{}] bound `{}` to {:#x}",
                            name,
                            sym_name.escape_ascii(),
                            addr
                        );
                        Some(addr)
                    }
                    None if sym.is_weak() => Some(0),
                    None => None,
                }
            }
            place => defined_addr(image, segments, place, sym.st_type(), sym.st_value),
        };
        names.push(sym_name);
        addrs.push(addr);
    }

    Ok((ResolvedSymbols { names, addrs }, used))
}
