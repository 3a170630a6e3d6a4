//! x86-64 relocation engine.

use crate::{
    Result,
    os::Host,
    relocation::{RelocHelper, RelocSite, StaticReloc, fits_signed, reloc_error},
};
use elf::abi::{
    EM_X86_64, R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_COPY, R_X86_64_DTPMOD64,
    R_X86_64_DTPOFF64, R_X86_64_GLOB_DAT, R_X86_64_GOTPCREL, R_X86_64_IRELATIVE,
    R_X86_64_JUMP_SLOT, R_X86_64_NONE, R_X86_64_PC32, R_X86_64_PC64, R_X86_64_PLT32,
    R_X86_64_RELATIVE, R_X86_64_TPOFF64,
};

/// The ELF machine type for x86-64.
pub const EM_ARCH: u16 = EM_X86_64;

const R_X86_64_GOTPCRELX: u32 = 41;
const R_X86_64_REX_GOTPCRELX: u32 = 42;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_X86_64_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_X86_64_GLOB_DAT;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_X86_64_64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_X86_64_JUMP_SLOT;
/// 32-bit PC-relative relocation type.
pub const REL_PCREL32: u32 = R_X86_64_PC32;
/// GOT-relative relocation type, allocating a GOT slot in relocatable objects.
pub const REL_GOTPCREL: u32 = R_X86_64_GOTPCREL;
/// IRELATIVE relocation type - not supported by this loader.
pub const REL_IRELATIVE: u32 = R_X86_64_IRELATIVE;
/// COPY relocation type - not supported by this loader.
pub const REL_COPY: u32 = R_X86_64_COPY;

/// Map x86-64 relocation types to human readable names
pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_PC32 => "R_X86_64_PC32",
        R_X86_64_PLT32 => "R_X86_64_PLT32",
        R_X86_64_COPY => "R_X86_64_COPY",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
        R_X86_64_32 => "R_X86_64_32",
        R_X86_64_32S => "R_X86_64_32S",
        R_X86_64_DTPMOD64 => "R_X86_64_DTPMOD64",
        R_X86_64_DTPOFF64 => "R_X86_64_DTPOFF64",
        R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
        R_X86_64_PC64 => "R_X86_64_PC64",
        R_X86_64_IRELATIVE => "R_X86_64_IRELATIVE",
        R_X86_64_GOTPCRELX => "R_X86_64_GOTPCRELX",
        R_X86_64_REX_GOTPCRELX => "R_X86_64_REX_GOTPCRELX",
        _ => "UNKNOWN",
    }
}

/// x86-64 ELF relocator implementation.
pub(crate) struct StaticRelocator;

impl StaticReloc for StaticRelocator {
    fn new() -> Self {
        StaticRelocator
    }

    fn relocate<H: Host>(
        &mut self,
        helper: &mut RelocHelper<'_, H>,
        site: &RelocSite,
    ) -> Result<()> {
        match site.r_type {
            R_X86_64_NONE => {}
            // S + A
            R_X86_64_64 => helper.write(site, helper.sym_addend(site)? as u64)?,
            // S + A, zero-extended
            R_X86_64_32 => {
                let val = helper.sym_addend(site)?;
                let val = u32::try_from(val)
                    .map_err(|_| reloc_error(site, "value does not fit in 32 bits", helper.name))?;
                helper.write(site, val)?;
            }
            // S + A, sign-extended
            R_X86_64_32S => {
                let val = helper.sym_addend(site)? as i64;
                if !fits_signed(val, 32) {
                    return Err(reloc_error(site, "value does not fit in 32 bits", helper.name));
                }
                helper.write(site, val as i32)?;
            }
            // S + A - P
            R_X86_64_PC32 | R_X86_64_PLT32 => {
                let off = helper.pc_relative(site)?;
                if !fits_signed(off, 32) {
                    return Err(reloc_error(site, "PC-relative offset out of range", helper.name));
                }
                helper.write(site, off as i32)?;
            }
            R_X86_64_PC64 => helper.write(site, helper.pc_relative(site)?)?,
            // G + GOT + A - P
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
                let got = helper.got_entry(site)?;
                let off = (got.wrapping_add_signed(site.addend as isize))
                    .wrapping_sub(site.place) as i64;
                if !fits_signed(off, 32) {
                    return Err(reloc_error(site, "GOT offset out of range", helper.name));
                }
                helper.write(site, off as i32)?;
            }
            // B + A
            R_X86_64_RELATIVE => helper.write(site, helper.relative(site)? as u64)?,
            // S
            R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
                helper.write(site, helper.find_symbol(site)? as u64)?
            }
            _ => {
                return Err(reloc_error(site, "unsupported relocation type", helper.name));
            }
        }
        Ok(())
    }

    fn needs_got(rel_type: u32) -> bool {
        matches!(
            rel_type,
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX
        )
    }
}
