use crate::{
    elf::{ElfImage, ElfSymbol, SymbolPlace, SymbolTable},
    os::Host,
    relocation::defined_addr,
    segment::ElfSegments,
};
use alloc::boxed::Box;
use elf::abi::{
    STB_GLOBAL, STB_LOCAL, STB_WEAK, STT_FILE, STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_SECTION,
    STT_TLS,
};
use hashbrown::{HashMap, hash_map::Entry};

const STT_COMMON: u8 = 5;
const STT_GNU_IFUNC: u8 = 10;

/// Symbol binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SymbolBind {
    Local,
    Weak,
    Global,
}

impl SymbolBind {
    fn from_st_bind(bind: u8) -> Self {
        match bind {
            STB_LOCAL => SymbolBind::Local,
            STB_WEAK => SymbolBind::Weak,
            // STB_GLOBAL and STB_GNU_UNIQUE
            _ => SymbolBind::Global,
        }
    }
}

/// What a symbol names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    NoType,
    Object,
    Func,
    Tls,
    Other,
}

impl SymbolKind {
    fn from_st_type(ty: u8) -> Option<Self> {
        Some(match ty {
            STT_NOTYPE => SymbolKind::NoType,
            STT_OBJECT | STT_COMMON => SymbolKind::Object,
            STT_FUNC | STT_GNU_IFUNC => SymbolKind::Func,
            STT_TLS => SymbolKind::Tls,
            STT_SECTION | STT_FILE => return None,
            _ => SymbolKind::Other,
        })
    }
}

/// A symbol defined by a loaded module.
#[derive(Clone, Debug)]
pub struct Symbol {
    name: Box<[u8]>,
    value: usize,
    size: usize,
    bind: SymbolBind,
    kind: SymbolKind,
}

impl Symbol {
    /// Name as stored in the string table, without the terminating NUL.
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Name as UTF-8, if it is valid UTF-8.
    #[inline]
    pub fn name_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.name).ok()
    }

    /// Runtime address.
    #[inline]
    pub fn value(&self) -> usize {
        self.value
    }

    /// Runtime address as a pointer.
    #[inline]
    pub fn as_ptr(&self) -> *const () {
        self.value as *const ()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn bind(&self) -> SymbolBind {
        self.bind
    }

    #[inline]
    pub fn kind(&self) -> SymbolKind {
        self.kind
    }
}

/// Exported symbols of a module, keyed by name.
pub(crate) type SymbolMap = HashMap<Box<[u8]>, Symbol>;

fn export<H: Host>(
    image: &ElfImage<'_>,
    segments: &ElfSegments<H>,
    name: &[u8],
    sym: &ElfSymbol,
) -> Option<Symbol> {
    if name.is_empty() {
        return None;
    }
    let kind = SymbolKind::from_st_type(sym.st_type())?;
    let place = sym.place();
    if matches!(place, SymbolPlace::Undefined | SymbolPlace::Common) {
        return None;
    }
    let value = defined_addr(image, segments, place, sym.st_type(), sym.st_value)?;
    Some(Symbol {
        name: name.into(),
        value,
        size: usize::try_from(sym.st_size).unwrap_or(usize::MAX),
        bind: SymbolBind::from_st_bind(sym.st_bind()),
        kind,
    })
}

/// Copies the defined symbols of `symtab` out of the image.
///
/// When a name is defined more than once the strongest binding wins
/// (global, then weak, then local); among equals the first definition stays.
pub(crate) fn collect_symbols<H: Host>(
    image: &ElfImage<'_>,
    symtab: &SymbolTable<'_>,
    segments: &ElfSegments<H>,
) -> SymbolMap {
    let mut map = SymbolMap::with_capacity(symtab.len());
    for (_, sym) in symtab.iter().skip(1) {
        let Some(name) = symtab.name(sym) else {
            continue;
        };
        let Some(symbol) = export(image, segments, name, sym) else {
            continue;
        };
        match map.entry(symbol.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(symbol);
            }
            Entry::Occupied(mut entry) => {
                if symbol.bind > entry.get().bind {
                    entry.insert(symbol);
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_strength_orders_global_over_weak_over_local() {
        assert!(SymbolBind::Global > SymbolBind::Weak);
        assert!(SymbolBind::Weak > SymbolBind::Local);
        assert_eq!(SymbolBind::from_st_bind(STB_GLOBAL), SymbolBind::Global);
        assert_eq!(SymbolBind::from_st_bind(10), SymbolBind::Global);
    }

    #[test]
    fn section_and_file_symbols_are_not_exported() {
        assert_eq!(SymbolKind::from_st_type(STT_SECTION), None);
        assert_eq!(SymbolKind::from_st_type(STT_FILE), None);
        assert_eq!(SymbolKind::from_st_type(STT_FUNC), Some(SymbolKind::Func));
        assert_eq!(SymbolKind::from_st_type(STT_TLS), Some(SymbolKind::Tls));
    }
}
