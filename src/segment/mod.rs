//! Host memory that holds a loaded image.
//!
//! An [`ElfSegments`] owns every region obtained for one module and frees each of
//! them exactly once when it is dropped, which also covers every early return on
//! a failed load. Addresses recorded in the file are translated to runtime
//! addresses through the placements built here.

pub(crate) mod program;
pub(crate) mod section;

use crate::{
    Result, alloc_error,
    elf::ElfPhdr,
    os::{Host, ProtFlags},
    sync::Arc,
};
use alloc::{format, vec::Vec};
use core::ptr::NonNull;

/// How the segments of a linked image are laid out in host memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SegmentLayout {
    /// One region per `PT_LOAD` segment, each with its own load bias.
    #[default]
    Split,
    /// One region spanning all loadable segments, preserving their distances.
    Contiguous,
}

#[inline]
pub(crate) fn roundup(x: usize, align: usize) -> Option<usize> {
    if align <= 1 {
        return Some(x);
    }
    Some(x.checked_add(align - 1)? & !(align - 1))
}

#[inline]
pub(crate) fn rounddown(x: usize, align: usize) -> usize {
    if align <= 1 { x } else { x & !(align - 1) }
}

/// One host allocation.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
    prot: ProtFlags,
}

// Regions are plain memory owned by their module; access is coordinated by the module.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Start address.
    #[inline]
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Combined protection of everything placed in the region.
    #[inline]
    pub fn prot(&self) -> ProtFlags {
        self.prot
    }

    /// Returns `true` if `addr` lies inside the region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr - self.base() < self.len
    }

    fn contains_range(&self, addr: usize, len: usize) -> bool {
        self.contains(addr)
            && (addr - self.base())
                .checked_add(len)
                .is_some_and(|end| end <= self.len)
    }
}

/// A span of file addresses and where it landed.
#[derive(Clone, Debug)]
pub(crate) struct Placement {
    pub(crate) file_addr: u64,
    pub(crate) mem_len: u64,
    pub(crate) runtime: usize,
    pub(crate) region: usize,
    pub(crate) phdr: Option<ElfPhdr>,
}

/// The regions of one module together with the address translation into them.
pub struct ElfSegments<H: Host> {
    host: Arc<H>,
    regions: Vec<Region>,
    placements: Vec<Placement>,
    section_addrs: Vec<Option<usize>>,
}

impl<H: Host> ElfSegments<H> {
    pub(crate) fn new(host: Arc<H>) -> Self {
        Self {
            host,
            regions: Vec::new(),
            placements: Vec::new(),
            section_addrs: Vec::new(),
        }
    }

    /// Obtains a zeroed region from the host and returns its index.
    pub(crate) fn allocate(&mut self, align: usize, size: usize, prot: ProtFlags) -> Result<usize> {
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());
        let size = roundup(size.max(1), align)
            .ok_or_else(|| alloc_error(format!("region size {size:#x} overflows")))?;
        let ptr = self.host.aligned_alloc(align, size).ok_or_else(|| {
            alloc_error(format!(
                "host could not provide {size:#x} bytes aligned to {align:#x}"
            ))
        })?;
        if ptr.as_ptr() as usize & (align - 1) != 0 {
            unsafe { self.host.free(ptr) };
            return Err(alloc_error(format!(
                "host returned {:p}, not aligned to {align:#x}",
                ptr.as_ptr()
            )));
        }
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        #[cfg(feature = "log")]
        log::trace!(
            "[region] {:#x}-{:#x} align {:#x} {:?}",
            ptr.as_ptr() as usize,
            ptr.as_ptr() as usize + size,
            align,
            prot
        );
        self.regions.push(Region {
            ptr,
            len: size,
            align,
            prot,
        });
        Ok(self.regions.len() - 1)
    }

    pub(crate) fn add_placement(&mut self, placement: Placement) {
        self.regions[placement.region].prot |= placement
            .phdr
            .map(|phdr| ProtFlags::from_segment_flags(phdr.p_flags))
            .unwrap_or(ProtFlags::PROT_NONE);
        self.placements.push(placement);
    }

    pub(crate) fn set_section_addr(&mut self, idx: usize, addr: usize) {
        if self.section_addrs.len() <= idx {
            self.section_addrs.resize(idx + 1, None);
        }
        self.section_addrs[idx] = Some(addr);
    }

    /// Copies `data` to `addr`, which must lie in one region together with `data.len()` bytes.
    pub(crate) fn copy_in(&mut self, addr: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(dst) = self.get_mut_ptr::<u8>(addr, data.len()) else {
            return Err(alloc_error(format!(
                "{:#x} bytes at {addr:#x} fall outside the module",
                data.len()
            )));
        };
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Runtime address of a file address, using the segment that contains it.
    ///
    /// The end of a segment still translates, so that symbols marking the end of
    /// a table resolve, unless another segment starts there.
    pub fn translate(&self, file_addr: u64) -> Option<usize> {
        let offset = |p: &&Placement| file_addr.checked_sub(p.file_addr);
        let placement = self
            .placements
            .iter()
            .find(|p| offset(p).is_some_and(|off| off < p.mem_len))
            .or_else(|| {
                self.placements
                    .iter()
                    .find(|p| offset(p).is_some_and(|off| off == p.mem_len))
            })?;
        let delta = usize::try_from(file_addr - placement.file_addr).ok()?;
        placement.runtime.checked_add(delta)
    }

    /// Runtime address of an allocated section of a relocatable object.
    pub fn section_addr(&self, idx: usize) -> Option<usize> {
        self.section_addrs.get(idx).copied().flatten()
    }

    /// Returns a pointer to `len` writable bytes at `addr`, if they belong to one region.
    pub(crate) fn get_mut_ptr<T>(&self, addr: usize, len: usize) -> Option<*mut T> {
        self.regions
            .iter()
            .any(|region| region.contains_range(addr, len))
            .then_some(addr as *mut T)
    }

    /// Writes `value` at `addr`, unaligned.
    pub(crate) fn write<T: Copy>(&self, addr: usize, value: T) -> Option<()> {
        let ptr = self.get_mut_ptr::<T>(addr, size_of::<T>())?;
        unsafe { ptr.write_unaligned(value) };
        Some(())
    }

    /// Reads a `T` at `addr`, unaligned.
    pub(crate) fn read<T: Copy>(&self, addr: usize) -> Option<T> {
        let ptr = self.get_mut_ptr::<T>(addr, size_of::<T>())?;
        Some(unsafe { ptr.read_unaligned() })
    }

    /// Returns `true` if `addr` lies in one of the regions.
    pub fn contains(&self, addr: usize) -> bool {
        self.regions.iter().any(|region| region.contains(addr))
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub(crate) fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub(crate) fn host(&self) -> &Arc<H> {
        &self.host
    }
}

impl<H: Host> Drop for ElfSegments<H> {
    fn drop(&mut self) {
        for region in self.regions.drain(..) {
            #[cfg(feature = "log")]
            log::trace!("[region] free {:#x}", region.base());
            unsafe { self.host.free(region.ptr) };
        }
    }
}
