//! Symbol relocation and binding logic.
//!
//! Relocation runs in two passes. Every symbol table entry is first resolved to
//! a runtime address ([`resolve`]), then each relocation entry is handed to the
//! architecture's [`StaticReloc`] implementation, which patches the image
//! through a bounds-checked [`RelocHelper`].

mod resolve;
mod sections;

pub(crate) use resolve::{ResolvedSymbols, defined_addr, resolve_symbols};
pub(crate) use sections::{relocation_sections, relocation_sites};

use crate::{
    Error, Result,
    arch::rel_type_to_str,
    os::Host,
    segment::{
        ElfSegments,
        section::{GotEntry, GotSection},
    },
    sync::Arc,
};
use alloc::{boxed::Box, format, string::ToString};

/// A source of addresses for symbols a module leaves undefined.
///
/// Closures taking the symbol name are the usual implementation:
///
/// ```rust
/// use elf_module::relocation::SymbolLookup;
///
/// fn host_puts() {}
/// let lookup = |name: &str| (name == "puts").then_some(host_puts as *const ());
/// assert!(lookup.lookup("puts").is_some());
/// assert!(lookup.lookup("printf").is_none());
/// ```
pub trait SymbolLookup {
    /// Returns the address of `name`, or `None` to let the next source try.
    fn lookup(&self, name: &str) -> Option<*const ()>;
}

impl<F> SymbolLookup for F
where
    F: ?Sized + Fn(&str) -> Option<*const ()>,
{
    fn lookup(&self, name: &str) -> Option<*const ()> {
        (self)(name)
    }
}

impl<S: SymbolLookup + ?Sized> SymbolLookup for Arc<S> {
    fn lookup(&self, name: &str) -> Option<*const ()> {
        (**self).lookup(name)
    }
}

impl SymbolLookup for () {
    fn lookup(&self, _name: &str) -> Option<*const ()> {
        None
    }
}

pub(crate) type DynSymbolLookup<'a> = Box<dyn SymbolLookup + 'a>;

/// One relocation entry with its target already translated to a runtime address.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RelocSite {
    /// Runtime address of the patched field (`P`).
    pub(crate) place: usize,
    /// Address of the field as recorded in the file, for diagnostics.
    pub(crate) offset: u64,
    pub(crate) r_type: u32,
    pub(crate) r_sym: usize,
    pub(crate) addend: i64,
}

/// State shared by the architecture relocators while patching one module.
pub(crate) struct RelocHelper<'a, H: Host> {
    pub(crate) name: &'a str,
    pub(crate) segments: &'a ElfSegments<H>,
    pub(crate) symbols: &'a ResolvedSymbols<'a>,
    pub(crate) got: &'a mut GotSection,
    pub(crate) is_object: bool,
}

impl<H: Host> RelocHelper<'_, H> {
    /// Resolved address of the symbol a relocation refers to (`S`).
    #[inline]
    pub(crate) fn find_symbol(&self, site: &RelocSite) -> Result<usize> {
        if site.r_sym == 0 {
            return Ok(0);
        }
        self.symbols.get(site.r_sym).ok_or_else(|| {
            let name = self.symbols.name(site.r_sym);
            reloc_error(
                site,
                format!("undefined symbol `{}`", name.escape_ascii()),
                self.name,
            )
        })
    }

    /// Runtime address of a file address, used by `R_*_RELATIVE` (`B + A`).
    #[inline]
    pub(crate) fn relative(&self, site: &RelocSite) -> Result<usize> {
        if self.is_object {
            return Err(reloc_error(
                site,
                "relative relocation in a relocatable object",
                self.name,
            ));
        }
        self.segments
            .translate(site.addend as u64)
            .ok_or_else(|| reloc_error(site, "addend lies outside every segment", self.name))
    }

    /// Writes `value` at the relocation's place.
    #[inline]
    pub(crate) fn write<T: Copy>(&self, site: &RelocSite, value: T) -> Result<()> {
        self.write_at(site, site.place, value)
    }

    pub(crate) fn write_at<T: Copy>(&self, site: &RelocSite, addr: usize, value: T) -> Result<()> {
        self.segments
            .write(addr, value)
            .ok_or_else(|| reloc_error(site, "target lies outside the module", self.name))
    }

    pub(crate) fn read_at<T: Copy>(&self, site: &RelocSite, addr: usize) -> Result<T> {
        self.segments
            .read(addr)
            .ok_or_else(|| reloc_error(site, "target lies outside the module", self.name))
    }

    /// Address of the GOT slot holding the relocation's symbol, filling it on first use.
    pub(crate) fn got_entry(&mut self, site: &RelocSite) -> Result<usize> {
        let sym = self.find_symbol(site)?;
        let Some(entry) = self.got.entry(site.r_sym) else {
            return Err(reloc_error(site, "GOT is full", self.name));
        };
        if let GotEntry::Vacant(addr) = entry {
            self.write_at(site, addr, sym)?;
        }
        Ok(entry.addr())
    }

    /// `S + A` as a wrapping address.
    #[inline]
    pub(crate) fn sym_addend(&self, site: &RelocSite) -> Result<usize> {
        Ok(self.find_symbol(site)?.wrapping_add_signed(site.addend as isize))
    }

    /// `S + A - P` as a signed displacement.
    #[inline]
    pub(crate) fn pc_relative(&self, site: &RelocSite) -> Result<i64> {
        Ok(self.sym_addend(site)?.wrapping_sub(site.place) as i64)
    }
}

/// The per-architecture relocation engine.
pub(crate) trait StaticReloc: Sized {
    fn new() -> Self;

    /// Looks at every relocation of the module before any is applied.
    fn prepare(&mut self, _sites: &[RelocSite]) {}

    fn relocate<H: Host>(&mut self, helper: &mut RelocHelper<'_, H>, site: &RelocSite)
    -> Result<()>;

    /// Returns `true` if a relocation type needs a GOT slot in a relocatable object.
    fn needs_got(_rel_type: u32) -> bool {
        false
    }
}

/// Checks that `val` fits in a signed field of `bits` bits.
#[inline]
pub(crate) fn fits_signed(val: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    (min..=max).contains(&val)
}

#[cold]
#[inline(never)]
pub(crate) fn reloc_error(site: &RelocSite, msg: impl ToString, name: &str) -> Error {
    Error::Relocation {
        msg: format!(
            "{}: {} at {:#x} in {}",
            rel_type_to_str(site.r_type),
            msg.to_string(),
            site.offset,
            name
        ),
    }
}
