use crate::{
    image::{Symbol, SymbolMap},
    os::{DefaultHost, Host},
    relocation::SymbolLookup,
    segment::{ElfSegments, Region},
    sync::Arc,
};
use alloc::{boxed::Box, format, string::String, vec::Vec};
use core::fmt::Debug;

pub(crate) struct ModuleInner<H: Host> {
    pub(crate) name: String,
    /// Dropped before `deps`, so a module's memory goes before that of the modules it uses.
    pub(crate) segments: ElfSegments<H>,
    pub(crate) symbols: SymbolMap,
    pub(crate) entry: Option<usize>,
    pub(crate) deps: Box<[LoadedModule<H>]>,
}

impl<H: Host> Drop for ModuleInner<H> {
    fn drop(&mut self) {
        #[cfg(feature = "log")]
        log::info!(
            "Unloading module: {} ({} regions)",
            self.name,
            self.segments.regions().len()
        );
    }
}

/// A loaded and relocated module.
///
/// Clones share the same memory, which is handed back to the host when the last
/// clone is dropped. A module also holds its dependencies: the modules of its
/// relocation scope that supplied at least one of its undefined symbols.
///
/// Lookups only read the owned symbol table, so a module can be shared between
/// threads and queried concurrently.
pub struct LoadedModule<H: Host = DefaultHost> {
    pub(crate) inner: Arc<ModuleInner<H>>,
}

impl<H: Host> Clone for LoadedModule<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Host> Debug for LoadedModule<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.inner.name)
            .field(
                "regions",
                &self
                    .regions()
                    .iter()
                    .map(|region| format!("{:#x}+{:#x}", region.base(), region.len()))
                    .collect::<Vec<_>>(),
            )
            .field(
                "deps",
                &self.deps().iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<H: Host> LoadedModule<H> {
    /// Gets the name the module was loaded under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets the runtime address of a symbol by name.
    ///
    /// The name is matched byte for byte; no demangling is done.
    ///
    /// # Examples
    /// ```no_run
    /// # use elf_module::{Loader, input::ElfBinary};
    /// # let bytes: &[u8] = &[];
    /// let module = Loader::new().load(ElfBinary::new("liba.so", bytes)).unwrap();
    /// if let Some(addr) = module.get("awesome_function") {
    ///     let f: extern "C" fn(f64) -> f64 = unsafe { core::mem::transmute(addr) };
    ///     f(0.42);
    /// }
    /// ```
    #[inline]
    pub fn get(&self, name: &str) -> Option<*const ()> {
        self.get_bytes(name.as_bytes())
    }

    /// Like [`get`](Self::get), for names that are not UTF-8.
    #[inline]
    pub fn get_bytes(&self, name: &[u8]) -> Option<*const ()> {
        self.inner.symbols.get(name).map(Symbol::as_ptr)
    }

    /// Gets the full description of a symbol.
    #[inline]
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.inner.symbols.get(name.as_bytes())
    }

    /// Iterates over every exported symbol, in no particular order.
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.inner.symbols.values()
    }

    /// The host regions holding the module.
    #[inline]
    pub fn regions(&self) -> &[Region] {
        self.inner.segments.regions()
    }

    /// Runtime address of the entry point, for linked images that have one.
    #[inline]
    pub fn entry(&self) -> Option<usize> {
        self.inner.entry
    }

    /// Returns `true` if `addr` lies in one of the module's regions.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.inner.segments.contains(addr)
    }

    /// The modules this module resolved symbols from.
    #[inline]
    pub fn deps(&self) -> &[LoadedModule<H>] {
        &self.inner.deps
    }

    /// Gets the number of handles sharing this module, dependents included.
    #[inline]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns `true` if both handles refer to the same loaded module.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Releases this handle.
    ///
    /// The memory is freed once no clone and no dependent module is left.
    pub fn unload(self) {
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] unload requested, {} handles remain",
            self.name(),
            self.strong_count() - 1
        );
        drop(self);
    }
}

impl<H: Host> SymbolLookup for LoadedModule<H> {
    fn lookup(&self, name: &str) -> Option<*const ()> {
        self.get(name)
    }
}
