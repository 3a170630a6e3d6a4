//! Discovery of the relocation entries a module needs applied.

use crate::{
    Error, Result,
    elf::{ElfImage, ElfRela, ElfShdr},
    os::Host,
    relocation::RelocSite,
    segment::{ElfSegments, section::applicable_relocations},
};
use alloc::{format, vec::Vec};
use elf::abi::{SHF_ALLOC, SHT_REL, SHT_RELA};

#[cold]
#[inline(never)]
fn section_error(image: &ElfImage<'_>, idx: usize, msg: &str) -> Error {
    Error::Relocation {
        msg: format!(
            "{} in section {} (`{}`)",
            msg,
            idx,
            image.section_name(idx).escape_ascii()
        ),
    }
}

/// Returns the `SHT_RELA` sections to apply, with their section index.
///
/// Linked images apply every allocated relocation section (`.rela.dyn`,
/// `.rela.plt`). Relocatable objects apply the sections that patch an
/// allocated section. Implicit-addend `SHT_REL` sections are rejected.
pub(crate) fn relocation_sections(image: &ElfImage<'_>) -> Result<Vec<(usize, ElfShdr)>> {
    let is_object = image.ehdr().is_relocatable();
    for (idx, shdr) in image.shdrs().iter().enumerate() {
        let applies = if is_object {
            image
                .shdrs()
                .get(shdr.sh_info as usize)
                .is_some_and(|target| target.sh_flags & SHF_ALLOC as u64 != 0)
        } else {
            shdr.sh_flags & SHF_ALLOC as u64 != 0
        };
        if shdr.sh_type == SHT_REL && applies {
            return Err(section_error(image, idx, "SHT_REL relocations are not supported"));
        }
    }

    if is_object {
        return Ok(applicable_relocations(image)
            .map(|(idx, shdr)| (idx, *shdr))
            .collect());
    }
    Ok(image
        .shdrs()
        .iter()
        .enumerate()
        .filter(|(_, shdr)| {
            shdr.sh_type == SHT_RELA && shdr.sh_flags & SHF_ALLOC as u64 != 0
        })
        .map(|(idx, shdr)| (idx, *shdr))
        .collect())
}

/// Reads the entries of one relocation section and translates their targets.
pub(crate) fn relocation_sites<H: Host>(
    image: &ElfImage<'_>,
    segments: &ElfSegments<H>,
    idx: usize,
    shdr: &ElfShdr,
) -> Result<Vec<RelocSite>> {
    let relas: Vec<ElfRela> = image.section_entries(shdr)?;
    let base = if image.ehdr().is_relocatable() {
        let target = shdr.sh_info as usize;
        Some(
            segments
                .section_addr(target)
                .ok_or_else(|| section_error(image, idx, "relocated section was not placed"))?,
        )
    } else {
        None
    };

    relas
        .iter()
        .map(|rela| {
            let place = match base {
                Some(base) => usize::try_from(rela.r_offset)
                    .ok()
                    .and_then(|off| base.checked_add(off)),
                None => segments.translate(rela.r_offset),
            }
            .ok_or_else(|| {
                section_error(
                    image,
                    idx,
                    &format!("target {:#x} lies outside the module", rela.r_offset),
                )
            })?;
            Ok(RelocSite {
                place,
                offset: rela.r_offset,
                r_type: rela.r_type(),
                r_sym: rela.r_symbol(),
                addend: rela.r_addend,
            })
        })
        .collect()
}
