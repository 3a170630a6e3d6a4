use crate::{
    Result,
    arch::StaticRelocator,
    elf::ElfImage,
    image::{LoadedModule, collect_symbols, loaded::ModuleInner},
    os::Host,
    relocation::{
        DynSymbolLookup, RelocHelper, ResolvedSymbols, StaticReloc, SymbolLookup,
        relocation_sections, relocation_sites, resolve_symbols,
    },
    segment::{ElfSegments, Region, section::GotSection},
    sync::Arc,
};
use alloc::{boxed::Box, string::String, vec, vec::Vec};
use core::{borrow::Borrow, fmt::Debug};

/// A module whose memory is populated but whose relocations are still pending.
///
/// Dropping it releases the regions it holds.
pub struct RawModule<'bytes, H: Host> {
    pub(crate) name: String,
    pub(crate) image: ElfImage<'bytes>,
    pub(crate) segments: ElfSegments<H>,
    pub(crate) got: GotSection,
}

impl<'bytes, H: Host> RawModule<'bytes, H> {
    pub(crate) fn new(
        name: String,
        image: ElfImage<'bytes>,
        segments: ElfSegments<H>,
        got: GotSection,
    ) -> Self {
        Self {
            name,
            image,
            segments,
            got,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if the module comes from a relocatable object (`.o`).
    #[inline]
    pub fn is_relocatable(&self) -> bool {
        self.image.ehdr().is_relocatable()
    }

    /// The host regions holding the module.
    #[inline]
    pub fn regions(&self) -> &[Region] {
        self.segments.regions()
    }

    /// Creates a builder for relocating the module.
    pub fn relocator(self) -> Relocator<'bytes, 'static, H> {
        Relocator {
            module: self,
            pre_find: Box::new(()),
            scope: Vec::new(),
        }
    }
}

impl<H: Host> Debug for RawModule<'_, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawModule")
            .field("name", &self.name)
            .field("regions", &self.segments.regions().len())
            .finish()
    }
}

/// Binds the undefined symbols of a [`RawModule`] and applies its relocations.
///
/// Undefined symbols are looked up in the `pre_find` source first and then in
/// the modules of the scope, in the order they were added.
///
/// ```rust,no_run
/// use elf_module::{Loader, input::ElfBinary};
///
/// # let libc_bytes: &[u8] = &[];
/// # let plugin_bytes: &[u8] = &[];
/// let mut loader = Loader::new();
/// let base = loader.load(ElfBinary::new("base.o", libc_bytes)).unwrap();
/// let plugin = loader
///     .map(ElfBinary::new("plugin.o", plugin_bytes))
///     .unwrap()
///     .relocator()
///     .pre_find(|name: &str| (name == "host_hook").then_some(core::ptr::null()))
///     .scope([&base])
///     .relocate()
///     .unwrap();
/// ```
pub struct Relocator<'bytes, 'find, H: Host> {
    module: RawModule<'bytes, H>,
    pre_find: DynSymbolLookup<'find>,
    scope: Vec<LoadedModule<H>>,
}

impl<'bytes, 'find, H: Host> Relocator<'bytes, 'find, H> {
    /// Sets the lookup consulted before the scope.
    pub fn pre_find<'f, S>(self, lookup: S) -> Relocator<'bytes, 'f, H>
    where
        S: SymbolLookup + 'f,
    {
        Relocator {
            module: self.module,
            pre_find: Box::new(lookup),
            scope: self.scope,
        }
    }

    /// Appends modules to the scope.
    ///
    /// Modules that end up supplying a symbol are kept alive by the relocated module.
    pub fn scope<I>(mut self, modules: I) -> Self
    where
        I: IntoIterator,
        I::Item: Borrow<LoadedModule<H>>,
    {
        self.scope
            .extend(modules.into_iter().map(|module| module.borrow().clone()));
        self
    }

    /// Applies every relocation and returns the loaded module.
    ///
    /// On failure the regions of the module are released before the error is returned.
    pub fn relocate(self) -> Result<LoadedModule<H>> {
        let Relocator {
            module,
            pre_find,
            scope,
        } = self;
        let RawModule {
            name,
            image,
            segments,
            mut got,
        } = module;
        let is_object = image.ehdr().is_relocatable();
        let symtab = image.symbol_table()?;
        let sections = relocation_sections(&image)?;

        #[cfg(feature = "log")]
        log::debug!(
            "[{}] relocating: {} relocation sections, {} symbols, scope of {}",
            name,
            sections.len(),
            symtab.len(),
            scope.len()
        );

        // Each relocation section indexes the symbol table named by its sh_link.
        let mut used = vec![false; scope.len()];
        let mut tables: Vec<(usize, ResolvedSymbols<'_>)> = Vec::new();
        for (_, shdr) in &sections {
            let link = shdr.sh_link as usize;
            if tables.iter().any(|(idx, _)| *idx == link) {
                continue;
            }
            let resolved = if link == 0 {
                ResolvedSymbols::empty()
            } else {
                let table = if link == symtab.section_index() {
                    None
                } else {
                    Some(image.symbol_table_at(link)?)
                };
                let (resolved, supplied) = resolve_symbols(
                    &name,
                    &image,
                    table.as_ref().unwrap_or(&symtab),
                    &segments,
                    &*pre_find,
                    &scope,
                )?;
                for (used, supplied) in used.iter_mut().zip(supplied) {
                    *used |= supplied;
                }
                resolved
            };
            tables.push((link, resolved));
        }

        let mut relocator = StaticRelocator::new();
        for (idx, shdr) in &sections {
            let sites = relocation_sites(&image, &segments, *idx, shdr)?;
            #[cfg(feature = "log")]
            log::trace!(
                "[{}] section `{}`: {} entries",
                name,
                image.section_name(*idx).escape_ascii(),
                sites.len()
            );
            let Some((_, symbols)) = tables
                .iter()
                .find(|(link, _)| *link == shdr.sh_link as usize)
            else {
                continue;
            };
            let mut helper = RelocHelper {
                name: &name,
                segments: &segments,
                symbols,
                got: &mut got,
                is_object,
            };
            relocator.prepare(&sites);
            for site in &sites {
                relocator.relocate(&mut helper, site)?;
            }
        }

        let symbols = collect_symbols(&image, &symtab, &segments);
        let entry = if is_object {
            None
        } else {
            image.entry().and_then(|entry| segments.translate(entry))
        };
        let deps: Box<[LoadedModule<H>]> = scope
            .into_iter()
            .zip(used)
            .filter_map(|(module, used)| used.then_some(module))
            .collect();

        #[cfg(feature = "log")]
        log::info!(
            "Loaded module: {} ({} regions, {} exported symbols, {} dependencies)",
            name,
            segments.regions().len(),
            symbols.len(),
            deps.len()
        );

        Ok(LoadedModule {
            inner: Arc::new(ModuleInner {
                name,
                segments,
                symbols,
                entry,
                deps,
            }),
        })
    }
}
