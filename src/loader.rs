use crate::{
    LoadedModule, RawModule, Result,
    elf::{ElfImage, ElfPhdr},
    input::IntoElfBinary,
    os::{DefaultHost, Host, ProtFlags},
    segment::{
        ElfSegments, Region, SegmentLayout,
        program::load_segments,
        section::{GotSection, load_sections},
    },
    sync::Arc,
};

/// Context provided to hook functions during ELF loading.
///
/// A hook sees each populated piece of a module before any relocation is
/// applied: every `PT_LOAD` segment of a linked image, or every protection
/// group of a relocatable object.
pub struct LoadHookContext<'a> {
    name: &'a str,
    index: usize,
    phdr: Option<&'a ElfPhdr>,
    region: &'a Region,
    addr: usize,
    len: usize,
}

impl<'a> LoadHookContext<'a> {
    /// Returns the name of the ELF object being loaded.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Position of this piece among the pieces of the module.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the program header for the current segment. Relocatable objects have none.
    pub fn phdr(&self) -> Option<&ElfPhdr> {
        self.phdr
    }

    /// The host region the piece was placed in.
    pub fn region(&self) -> &Region {
        self.region
    }

    /// Runtime address of the piece.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Size of the piece in memory.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Protection the piece asks for.
    pub fn prot(&self) -> ProtFlags {
        self.phdr
            .map(|phdr| ProtFlags::from_segment_flags(phdr.p_flags))
            .unwrap_or_else(|| self.region.prot())
    }
}

/// Hook trait for inspecting a module after it is mapped.
///
/// Returning an error aborts the load; the regions mapped so far are released.
///
/// # Examples
/// ```rust
/// use elf_module::{Error, LoadHook, LoadHookContext, Result, os::ProtFlags};
///
/// struct NoWriteExec;
///
/// impl LoadHook for NoWriteExec {
///     fn call<'a>(&mut self, ctx: &'a LoadHookContext<'a>) -> Result<()> {
///         let wx = ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
///         if ctx.prot().contains(wx) {
///             return Err(Error::hook("writable and executable segment"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait LoadHook {
    /// Executes the hook with the provided context.
    fn call<'a>(&mut self, ctx: &'a LoadHookContext<'a>) -> Result<()>;
}

impl<F> LoadHook for F
where
    F: for<'a> FnMut(&'a LoadHookContext<'a>) -> Result<()>,
{
    fn call<'a>(&mut self, ctx: &'a LoadHookContext<'a>) -> Result<()> {
        (self)(ctx)
    }
}

impl LoadHook for () {
    fn call<'a>(&mut self, _ctx: &'a LoadHookContext<'a>) -> Result<()> {
        Ok(())
    }
}

/// The ELF object loader.
///
/// A loader places images in memory obtained from its [`Host`] and turns them
/// into [`LoadedModule`]s. It keeps no state between loads apart from its
/// configuration, so one loader can load any number of modules.
///
/// # Examples
/// ```rust,no_run
/// use elf_module::{Loader, SegmentLayout, input::ElfBinary};
///
/// # let bytes: &[u8] = &[];
/// let mut loader = Loader::new().with_layout(SegmentLayout::Contiguous);
/// let module = loader.load(ElfBinary::new("liba.so", bytes)).unwrap();
/// assert!(module.get("a").is_some());
/// ```
pub struct Loader<H: Host = DefaultHost, K: LoadHook = ()> {
    host: Arc<H>,
    layout: SegmentLayout,
    hook: K,
}

impl Loader<DefaultHost, ()> {
    /// Creates a new `Loader` with default settings.
    pub fn new() -> Self {
        Self {
            host: Arc::new(DefaultHost),
            layout: SegmentLayout::default(),
            hook: (),
        }
    }
}

impl Default for Loader<DefaultHost, ()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Host, K: LoadHook> Loader<H, K> {
    /// Returns a new loader that obtains memory from `host`.
    pub fn with_host<NewH: Host>(self, host: NewH) -> Loader<NewH, K> {
        self.with_shared_host(Arc::new(host))
    }

    /// Like [`with_host`](Self::with_host), for a host shared with other loaders.
    pub fn with_shared_host<NewH: Host>(self, host: Arc<NewH>) -> Loader<NewH, K> {
        Loader {
            host,
            layout: self.layout,
            hook: self.hook,
        }
    }

    /// Sets how the segments of linked images are laid out.
    pub fn with_layout(mut self, layout: SegmentLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Consumes the current loader and returns a new one with the specified hook.
    pub fn with_hook<NewHook>(self, hook: NewHook) -> Loader<H, NewHook>
    where
        NewHook: LoadHook,
    {
        Loader {
            host: self.host,
            layout: self.layout,
            hook,
        }
    }

    #[inline]
    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Maps an image into host memory without relocating it.
    ///
    /// Linked images (`ET_EXEC`, `ET_DYN`) get their `PT_LOAD` segments placed
    /// according to the loader's [`SegmentLayout`]; relocatable objects
    /// (`ET_REL`) get their allocated sections packed by protection. Every
    /// region is zero-filled past the file content.
    pub fn map<'bytes, I>(&mut self, input: I) -> Result<RawModule<'bytes, H>>
    where
        I: IntoElfBinary<'bytes>,
    {
        let (name, bytes) = input.into_elf_binary().into_parts();
        #[cfg(feature = "log")]
        log::debug!("Loading module: {} ({:#x} bytes)", name, bytes.len());

        let image = ElfImage::parse(bytes)?;
        let mut segments = ElfSegments::new(Arc::clone(&self.host));
        let got = if image.ehdr().is_relocatable() {
            load_sections(&image, &mut segments)?
        } else {
            load_segments(&image, self.layout, &mut segments)?;
            GotSection::empty()
        };
        self.run_hook(&name, &segments)?;

        #[cfg(feature = "log")]
        log::info!(
            "Mapped module: {} into {} regions",
            name,
            segments.regions().len()
        );
        Ok(RawModule::new(name, image, segments, got))
    }

    /// Maps and relocates an image.
    ///
    /// Undefined symbols must be weak; use [`map`](Self::map) and
    /// [`RawModule::relocator`] to supply definitions.
    pub fn load<'bytes, I>(&mut self, input: I) -> Result<LoadedModule<H>>
    where
        I: IntoElfBinary<'bytes>,
    {
        self.map(input)?.relocator().relocate()
    }

    fn run_hook(&mut self, name: &str, segments: &ElfSegments<H>) -> Result<()> {
        let regions = segments.regions();
        if segments.placements().is_empty() {
            for (index, region) in regions.iter().enumerate() {
                self.hook.call(&LoadHookContext {
                    name,
                    index,
                    phdr: None,
                    region,
                    addr: region.base(),
                    len: region.len(),
                })?;
            }
            return Ok(());
        }
        for (index, placement) in segments.placements().iter().enumerate() {
            let Some(region) = regions.get(placement.region) else {
                continue;
            };
            self.hook.call(&LoadHookContext {
                name,
                index,
                phdr: placement.phdr.as_ref(),
                region,
                addr: placement.runtime,
                len: placement.mem_len as usize,
            })?;
        }
        Ok(())
    }
}
