//! Placement of `PT_LOAD` segments for linked images.

use crate::{
    Result,
    elf::{ElfImage, ElfPhdr},
    os::{Host, ProtFlags},
    parse_phdr_error,
    segment::{ElfSegments, Placement, SegmentLayout, rounddown, roundup},
};
use alloc::{format, vec::Vec};

fn segment_align(phdr: &ElfPhdr) -> Result<usize> {
    let align = usize::try_from(phdr.p_align.max(1))
        .map_err(|_| parse_phdr_error("segment alignment overflows"))?;
    Ok(align)
}

fn as_usize(val: u64, what: &str) -> Result<usize> {
    usize::try_from(val).map_err(|_| parse_phdr_error(format!("{what} {val:#x} overflows")))
}

/// Lays out the loadable segments of `image` in `segments` and fills them.
pub(crate) fn load_segments<H: Host>(
    image: &ElfImage<'_>,
    layout: SegmentLayout,
    segments: &mut ElfSegments<H>,
) -> Result<()> {
    let loads: Vec<(usize, &ElfPhdr)> = image
        .loadable_segments()
        .filter(|(_, phdr)| phdr.p_memsz != 0)
        .collect();
    if loads.is_empty() {
        return Err(parse_phdr_error("no loadable segments"));
    }
    match layout {
        SegmentLayout::Split => load_split(image, &loads, segments),
        SegmentLayout::Contiguous => load_contiguous(image, &loads, segments),
    }
}

fn load_split<H: Host>(
    image: &ElfImage<'_>,
    loads: &[(usize, &ElfPhdr)],
    segments: &mut ElfSegments<H>,
) -> Result<()> {
    for &(idx, phdr) in loads {
        let align = segment_align(phdr)?;
        let vaddr = as_usize(phdr.p_vaddr, "segment address")?;
        let memsz = as_usize(phdr.p_memsz, "segment size")?;
        // Keep the address congruent to the file address modulo the alignment.
        let lead = vaddr - rounddown(vaddr, align);
        let size = lead
            .checked_add(memsz)
            .and_then(|size| roundup(size, align))
            .ok_or_else(|| parse_phdr_error(format!("segment {idx} size overflows")))?;
        let region = segments.allocate(align, size, ProtFlags::PROT_NONE)?;
        let runtime = segments.regions()[region].base() + lead;
        segments.copy_in(runtime, image.segment_data(phdr)?)?;
        #[cfg(feature = "log")]
        log::debug!(
            "[segment {}] vaddr {:#x} -> {:#x} memsz {:#x} filesz {:#x}",
            idx,
            phdr.p_vaddr,
            runtime,
            phdr.p_memsz,
            phdr.p_filesz
        );
        segments.add_placement(Placement {
            file_addr: phdr.p_vaddr,
            mem_len: phdr.p_memsz,
            runtime,
            region,
            phdr: Some(*phdr),
        });
    }
    Ok(())
}

fn load_contiguous<H: Host>(
    image: &ElfImage<'_>,
    loads: &[(usize, &ElfPhdr)],
    segments: &mut ElfSegments<H>,
) -> Result<()> {
    let mut align = 1;
    let mut min_vaddr = usize::MAX;
    let mut max_end = 0usize;
    for &(idx, phdr) in loads {
        align = align.max(segment_align(phdr)?);
        let vaddr = as_usize(phdr.p_vaddr, "segment address")?;
        let end = vaddr
            .checked_add(as_usize(phdr.p_memsz, "segment size")?)
            .ok_or_else(|| parse_phdr_error(format!("segment {idx} end overflows")))?;
        min_vaddr = min_vaddr.min(vaddr);
        max_end = max_end.max(end);
    }
    let start = rounddown(min_vaddr, align);
    let size = roundup(max_end - start, align)
        .ok_or_else(|| parse_phdr_error("image span overflows"))?;
    let region = segments.allocate(align, size, ProtFlags::PROT_NONE)?;
    let base = segments.regions()[region].base();
    #[cfg(feature = "log")]
    log::debug!(
        "[segments] {:#x} bytes at {:#x}, bias {:#x}",
        size,
        base,
        base.wrapping_sub(start)
    );

    for &(_, phdr) in loads {
        // Fits: every segment lies in [start, max_end).
        let runtime = base + (phdr.p_vaddr as usize - start);
        segments.copy_in(runtime, image.segment_data(phdr)?)?;
        segments.add_placement(Placement {
            file_addr: phdr.p_vaddr,
            mem_len: phdr.p_memsz,
            runtime,
            region,
            phdr: Some(*phdr),
        });
    }
    Ok(())
}
