//! AArch64 relocation engine.

use crate::{
    Result,
    os::Host,
    relocation::{RelocHelper, RelocSite, StaticReloc, fits_signed, reloc_error},
};
use elf::abi::EM_AARCH64;

/// The ELF machine type for AArch64.
pub const EM_ARCH: u16 = EM_AARCH64;

const R_AARCH64_NONE: u32 = 0;
const R_AARCH64_NULL: u32 = 256;
const R_AARCH64_ABS64: u32 = 257;
const R_AARCH64_ABS32: u32 = 258;
const R_AARCH64_PREL64: u32 = 260;
const R_AARCH64_PREL32: u32 = 261;
const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
const R_AARCH64_ADR_PREL_PG_HI21_NC: u32 = 276;
const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
const R_AARCH64_LDST8_ABS_LO12_NC: u32 = 278;
const R_AARCH64_JUMP26: u32 = 282;
const R_AARCH64_CALL26: u32 = 283;
const R_AARCH64_LDST16_ABS_LO12_NC: u32 = 284;
const R_AARCH64_LDST32_ABS_LO12_NC: u32 = 285;
const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286;
const R_AARCH64_LDST128_ABS_LO12_NC: u32 = 299;
const R_AARCH64_ADR_GOT_PAGE: u32 = 311;
const R_AARCH64_LD64_GOT_LO12_NC: u32 = 312;
const R_AARCH64_COPY: u32 = 1024;
const R_AARCH64_GLOB_DAT: u32 = 1025;
const R_AARCH64_JUMP_SLOT: u32 = 1026;
const R_AARCH64_RELATIVE: u32 = 1027;
const R_AARCH64_TLS_DTPMOD: u32 = 1028;
const R_AARCH64_TLS_DTPREL: u32 = 1029;
const R_AARCH64_TLS_TPREL: u32 = 1030;
const R_AARCH64_TLSDESC: u32 = 1031;
const R_AARCH64_IRELATIVE: u32 = 1032;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_AARCH64_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_AARCH64_GLOB_DAT;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_AARCH64_ABS64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_AARCH64_JUMP_SLOT;
/// 32-bit PC-relative relocation type.
pub const REL_PCREL32: u32 = R_AARCH64_PREL32;
/// GOT page relocation type, allocating a GOT slot in relocatable objects.
pub const REL_GOTPCREL: u32 = R_AARCH64_ADR_GOT_PAGE;
/// IRELATIVE relocation type - not supported by this loader.
pub const REL_IRELATIVE: u32 = R_AARCH64_IRELATIVE;
/// COPY relocation type - not supported by this loader.
pub const REL_COPY: u32 = R_AARCH64_COPY;

/// Map aarch64 relocation types to human readable names
pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_AARCH64_NONE | R_AARCH64_NULL => "R_AARCH64_NONE",
        R_AARCH64_ABS64 => "R_AARCH64_ABS64",
        R_AARCH64_ABS32 => "R_AARCH64_ABS32",
        R_AARCH64_PREL64 => "R_AARCH64_PREL64",
        R_AARCH64_PREL32 => "R_AARCH64_PREL32",
        R_AARCH64_ADR_PREL_PG_HI21 => "R_AARCH64_ADR_PREL_PG_HI21",
        R_AARCH64_ADR_PREL_PG_HI21_NC => "R_AARCH64_ADR_PREL_PG_HI21_NC",
        R_AARCH64_ADD_ABS_LO12_NC => "R_AARCH64_ADD_ABS_LO12_NC",
        R_AARCH64_LDST8_ABS_LO12_NC => "R_AARCH64_LDST8_ABS_LO12_NC",
        R_AARCH64_JUMP26 => "R_AARCH64_JUMP26",
        R_AARCH64_CALL26 => "R_AARCH64_CALL26",
        R_AARCH64_LDST16_ABS_LO12_NC => "R_AARCH64_LDST16_ABS_LO12_NC",
        R_AARCH64_LDST32_ABS_LO12_NC => "R_AARCH64_LDST32_ABS_LO12_NC",
        R_AARCH64_LDST64_ABS_LO12_NC => "R_AARCH64_LDST64_ABS_LO12_NC",
        R_AARCH64_LDST128_ABS_LO12_NC => "R_AARCH64_LDST128_ABS_LO12_NC",
        R_AARCH64_ADR_GOT_PAGE => "R_AARCH64_ADR_GOT_PAGE",
        R_AARCH64_LD64_GOT_LO12_NC => "R_AARCH64_LD64_GOT_LO12_NC",
        R_AARCH64_COPY => "R_AARCH64_COPY",
        R_AARCH64_GLOB_DAT => "R_AARCH64_GLOB_DAT",
        R_AARCH64_JUMP_SLOT => "R_AARCH64_JUMP_SLOT",
        R_AARCH64_RELATIVE => "R_AARCH64_RELATIVE",
        R_AARCH64_TLS_DTPMOD => "R_AARCH64_TLS_DTPMOD",
        R_AARCH64_TLS_DTPREL => "R_AARCH64_TLS_DTPREL",
        R_AARCH64_TLS_TPREL => "R_AARCH64_TLS_TPREL",
        R_AARCH64_TLSDESC => "R_AARCH64_TLSDESC",
        R_AARCH64_IRELATIVE => "R_AARCH64_IRELATIVE",
        _ => "UNKNOWN",
    }
}

#[inline]
fn page(addr: usize) -> usize {
    addr & !0xfff
}

/// Patches the 21-bit page immediate of an `ADRP`.
#[inline]
fn encode_adrp(insn: u32, pages: i64) -> u32 {
    let imm = pages as u32;
    let immlo = (imm & 0x3) << 29;
    let immhi = ((imm >> 2) & 0x7ffff) << 5;
    (insn & 0x9f00_001f) | immlo | immhi
}

/// Patches the 12-bit unsigned immediate of an `ADD`/`LDR`/`STR`.
#[inline]
fn encode_imm12(insn: u32, imm: u32) -> u32 {
    (insn & !(0xfff << 10)) | ((imm & 0xfff) << 10)
}

/// AArch64 ELF relocator implementation.
pub(crate) struct StaticRelocator;

impl StaticRelocator {
    fn patch_insn<H: Host>(
        helper: &RelocHelper<'_, H>,
        site: &RelocSite,
        patch: impl FnOnce(u32) -> u32,
    ) -> Result<()> {
        let insn: u32 = helper.read_at(site, site.place)?;
        helper.write(site, patch(insn))
    }

    fn adrp<H: Host>(
        helper: &RelocHelper<'_, H>,
        site: &RelocSite,
        target: usize,
        check: bool,
    ) -> Result<()> {
        let pages = (page(target).wrapping_sub(page(site.place)) as i64) >> 12;
        if check && !fits_signed(pages, 21) {
            return Err(reloc_error(site, "page offset out of range", helper.name));
        }
        Self::patch_insn(helper, site, |insn| encode_adrp(insn, pages))
    }
}

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
            R_AARCH64_NONE | R_AARCH64_NULL => {}
            // S + A
            R_AARCH64_ABS64 => helper.write(site, helper.sym_addend(site)? as u64)?,
            R_AARCH64_ABS32 => {
                let val = helper.sym_addend(site)? as i64;
                if !(-(1i64 << 31)..(1i64 << 32)).contains(&val) {
                    return Err(reloc_error(site, "value does not fit in 32 bits", helper.name));
                }
                helper.write(site, val as u32)?;
            }
            // S + A - P
            R_AARCH64_PREL64 => helper.write(site, helper.pc_relative(site)?)?,
            R_AARCH64_PREL32 => {
                let off = helper.pc_relative(site)?;
                if !(-(1i64 << 31)..(1i64 << 32)).contains(&off) {
                    return Err(reloc_error(site, "PC-relative offset out of range", helper.name));
                }
                helper.write(site, off as u32)?;
            }
            // B/BL: (S + A - P) >> 2 within +-128MiB
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                let off = helper.pc_relative(site)?;
                if off & 0x3 != 0 || !fits_signed(off, 28) {
                    return Err(reloc_error(site, "branch offset out of range", helper.name));
                }
                Self::patch_insn(helper, site, |insn| {
                    (insn & 0xfc00_0000) | (((off >> 2) as u32) & 0x03ff_ffff)
                })?;
            }
            // Page(S + A) - Page(P)
            R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_PREL_PG_HI21_NC => {
                let target = helper.sym_addend(site)?;
                let check = site.r_type == R_AARCH64_ADR_PREL_PG_HI21;
                Self::adrp(helper, site, target, check)?;
            }
            // (S + A) & 0xfff, scaled by the access size
            R_AARCH64_ADD_ABS_LO12_NC
            | R_AARCH64_LDST8_ABS_LO12_NC
            | R_AARCH64_LDST16_ABS_LO12_NC
            | R_AARCH64_LDST32_ABS_LO12_NC
            | R_AARCH64_LDST64_ABS_LO12_NC
            | R_AARCH64_LDST128_ABS_LO12_NC => {
                let shift = match site.r_type {
                    R_AARCH64_LDST16_ABS_LO12_NC => 1,
                    R_AARCH64_LDST32_ABS_LO12_NC => 2,
                    R_AARCH64_LDST64_ABS_LO12_NC => 3,
                    R_AARCH64_LDST128_ABS_LO12_NC => 4,
                    _ => 0,
                };
                let lo12 = (helper.sym_addend(site)? & 0xfff) as u32;
                Self::patch_insn(helper, site, |insn| encode_imm12(insn, lo12 >> shift))?;
            }
            // Page(G(GDAT(S))) - Page(P)
            R_AARCH64_ADR_GOT_PAGE => {
                let got = helper.got_entry(site)?;
                Self::adrp(helper, site, got, true)?;
            }
            // G(GDAT(S)) & 0xff8
            R_AARCH64_LD64_GOT_LO12_NC => {
                let got = helper.got_entry(site)?;
                let lo12 = (got & 0xff8) as u32;
                Self::patch_insn(helper, site, |insn| encode_imm12(insn, lo12 >> 3))?;
            }
            // B + A
            R_AARCH64_RELATIVE => helper.write(site, helper.relative(site)? as u64)?,
            // S + A
            R_AARCH64_GLOB_DAT | R_AARCH64_JUMP_SLOT => {
                helper.write(site, helper.sym_addend(site)? as u64)?
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
            R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC
        )
    }
}
