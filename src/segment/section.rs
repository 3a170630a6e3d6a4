//! Placement of allocated sections for relocatable objects.
//!
//! A `.o` file has no program headers. Its `SHF_ALLOC` sections are packed into at
//! most four regions, one per protection (R, RW, RX, RWX), and the GOT needed by
//! GOT-relative relocations is appended to the RW region.

use crate::{
    Result,
    arch::StaticRelocator,
    elf::{ElfImage, ElfRela, ElfShdr},
    os::{Host, ProtFlags},
    parse_shdr_error,
    relocation::StaticReloc,
    segment::{ElfSegments, roundup},
};
use alloc::vec::Vec;
use elf::abi::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_RELA};
use hashbrown::{HashMap, HashSet, hash_map::Entry};

const GOT_ENTRY_SIZE: usize = size_of::<usize>();

/// Convert section flags to memory protection flags
pub(crate) fn section_prot(sh_flags: u64) -> ProtFlags {
    let mut prot = ProtFlags::PROT_READ;
    if sh_flags & SHF_WRITE as u64 != 0 {
        prot |= ProtFlags::PROT_WRITE;
    }
    if sh_flags & SHF_EXECINSTR as u64 != 0 {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

/// Convert protection flags to an index (0-3: R, RW, RX, RWX)
fn prot_to_idx(prot: ProtFlags) -> usize {
    (prot.contains(ProtFlags::PROT_WRITE) as usize)
        | ((prot.contains(ProtFlags::PROT_EXEC) as usize) << 1)
}

fn idx_to_prot(idx: usize) -> ProtFlags {
    let mut prot = ProtFlags::PROT_READ;
    if idx & 1 != 0 {
        prot |= ProtFlags::PROT_WRITE;
    }
    if idx & 2 != 0 {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

/// Relocation sections of a relocatable object that patch allocated sections.
pub(crate) fn applicable_relocations<'i>(
    image: &'i ElfImage<'_>,
) -> impl Iterator<Item = (usize, &'i ElfShdr)> {
    image.shdrs().iter().enumerate().filter(|(_, shdr)| {
        shdr.sh_type == SHT_RELA
            && image
                .shdrs()
                .get(shdr.sh_info as usize)
                .is_some_and(|target| target.sh_flags & SHF_ALLOC as u64 != 0)
    })
}

fn count_got_entries(image: &ElfImage<'_>) -> Result<usize> {
    let mut got_set = HashSet::new();
    for (_, shdr) in applicable_relocations(image) {
        let relas: Vec<ElfRela> = image.section_entries(shdr)?;
        got_set.extend(
            relas
                .iter()
                .filter(|rela| StaticRelocator::needs_got(rela.r_type()))
                .map(ElfRela::r_symbol),
        );
    }
    Ok(got_set.len())
}

/// Sections with the same protection, laid out back to back.
struct SectionUnit {
    sections: Vec<(usize, usize)>,
    zero_sections: Vec<(usize, usize)>,
    got: Option<usize>,
    align: usize,
    size: usize,
}

impl SectionUnit {
    fn new() -> Self {
        Self {
            sections: Vec::new(),
            zero_sections: Vec::new(),
            got: None,
            align: 1,
            size: 0,
        }
    }

    fn place(&mut self, shdr: &ElfShdr) -> Result<usize> {
        let align = usize::try_from(shdr.sh_addralign.max(1))
            .map_err(|_| parse_shdr_error("section alignment overflows"))?;
        let size = usize::try_from(shdr.sh_size)
            .map_err(|_| parse_shdr_error("section size overflows"))?;
        self.reserve(align, size)
    }

    fn reserve(&mut self, align: usize, size: usize) -> Result<usize> {
        let offset = roundup(self.size, align)
            .ok_or_else(|| parse_shdr_error("section layout overflows"))?;
        self.size = offset
            .checked_add(size)
            .ok_or_else(|| parse_shdr_error("section layout overflows"))?;
        self.align = self.align.max(align);
        Ok(offset)
    }
}

/// The GOT of a relocatable object: one pointer per symbol referenced through it.
pub(crate) struct GotSection {
    base: usize,
    cap: usize,
    next: usize,
    map: HashMap<usize, usize>,
}

/// Represents a GOT entry that may or may not be occupied
pub(crate) enum GotEntry {
    /// Entry already holds the symbol's address.
    Occupied(usize),
    /// Entry was just reserved and has to be filled by the caller.
    Vacant(usize),
}

impl GotEntry {
    pub(crate) fn addr(&self) -> usize {
        match *self {
            GotEntry::Occupied(addr) | GotEntry::Vacant(addr) => addr,
        }
    }
}

impl GotSection {
    pub(crate) fn empty() -> Self {
        Self {
            base: 0,
            cap: 0,
            next: 0,
            map: HashMap::new(),
        }
    }

    /// Add or retrieve a GOT entry for a symbol
    pub(crate) fn entry(&mut self, r_sym: usize) -> Option<GotEntry> {
        match self.map.entry(r_sym) {
            Entry::Occupied(entry) => Some(GotEntry::Occupied(
                self.base + *entry.get() * GOT_ENTRY_SIZE,
            )),
            Entry::Vacant(entry) => {
                if self.next == self.cap {
                    return None;
                }
                let idx = *entry.insert(self.next);
                self.next += 1;
                Some(GotEntry::Vacant(self.base + idx * GOT_ENTRY_SIZE))
            }
        }
    }
}

/// Packs the allocated sections of `image` into `segments` and returns its GOT.
pub(crate) fn load_sections<H: Host>(
    image: &ElfImage<'_>,
    segments: &mut ElfSegments<H>,
) -> Result<GotSection> {
    let got_cnt = count_got_entries(image)?;
    let mut units: [SectionUnit; 4] = core::array::from_fn(|_| SectionUnit::new());

    // Content first, then zero-filled sections, so each unit's BSS forms its tail.
    for nobits in [false, true] {
        for (idx, shdr) in image.shdrs().iter().enumerate() {
            if shdr.sh_flags & SHF_ALLOC as u64 == 0 || (shdr.sh_type == SHT_NOBITS) != nobits
            {
                continue;
            }
            let unit = &mut units[prot_to_idx(section_prot(shdr.sh_flags))];
            let offset = unit.place(shdr)?;
            if nobits {
                unit.zero_sections.push((idx, offset));
            } else {
                unit.sections.push((idx, offset));
            }
        }
    }
    if got_cnt != 0 {
        let unit = &mut units[prot_to_idx(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)];
        let size = got_cnt
            .checked_mul(GOT_ENTRY_SIZE)
            .ok_or_else(|| parse_shdr_error("GOT size overflows"))?;
        unit.got = Some(unit.reserve(GOT_ENTRY_SIZE, size)?);
    }

    let mut got = GotSection::empty();
    for (unit_idx, unit) in units.iter().enumerate() {
        if unit.size == 0 {
            continue;
        }
        let region = segments.allocate(unit.align, unit.size, idx_to_prot(unit_idx))?;
        let base = segments.regions()[region].base();
        #[cfg(feature = "log")]
        log::debug!(
            "[sections] {:?} unit: {:#x} bytes at {:#x}",
            idx_to_prot(unit_idx),
            unit.size,
            base
        );
        for &(idx, offset) in &unit.sections {
            let shdr = image.section(idx)?;
            segments.copy_in(base + offset, image.section_data(shdr)?)?;
            segments.set_section_addr(idx, base + offset);
        }
        for &(idx, offset) in &unit.zero_sections {
            segments.set_section_addr(idx, base + offset);
        }
        if let Some(offset) = unit.got {
            got = GotSection {
                base: base + offset,
                cap: got_cnt,
                next: 0,
                map: HashMap::with_capacity(got_cnt),
            };
        }
    }
    Ok(got)
}
