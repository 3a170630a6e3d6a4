//! RISC-V 64-bit relocation engine.
//!
//! Implementation based on LLVM JITLink RISC-V support (EdgeKind_riscv and applyFixup).

use crate::{
    Result,
    os::Host,
    relocation::{RelocHelper, RelocSite, StaticReloc, fits_signed, reloc_error},
};
use elf::abi::*;
use hashbrown::HashMap;

/// The ELF machine type for RISC-V architecture.
pub const EM_ARCH: u16 = EM_RISCV;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_RISCV_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_RISCV_64;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_RISCV_64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_RISCV_JUMP_SLOT;
/// 32-bit PC-relative relocation type.
pub const REL_PCREL32: u32 = R_RISCV_32_PCREL;
/// GOT-relative HI20 relocation type, allocating a GOT slot in relocatable objects.
pub const REL_GOTPCREL: u32 = R_RISCV_GOT_HI20;
/// IRELATIVE relocation type - not supported by this loader.
pub const REL_IRELATIVE: u32 = R_RISCV_IRELATIVE;
/// COPY relocation type - not supported by this loader.
pub const REL_COPY: u32 = R_RISCV_COPY;

/// Map riscv64 relocation types to human readable names
pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_RISCV_NONE => "R_RISCV_NONE",
        R_RISCV_32 => "R_RISCV_32",
        R_RISCV_64 => "R_RISCV_64",
        R_RISCV_RELATIVE => "R_RISCV_RELATIVE",
        R_RISCV_COPY => "R_RISCV_COPY",
        R_RISCV_JUMP_SLOT => "R_RISCV_JUMP_SLOT",
        R_RISCV_IRELATIVE => "R_RISCV_IRELATIVE",
        R_RISCV_BRANCH => "R_RISCV_BRANCH",
        R_RISCV_JAL => "R_RISCV_JAL",
        R_RISCV_CALL => "R_RISCV_CALL",
        R_RISCV_CALL_PLT => "R_RISCV_CALL_PLT",
        R_RISCV_GOT_HI20 => "R_RISCV_GOT_HI20",
        R_RISCV_PCREL_HI20 => "R_RISCV_PCREL_HI20",
        R_RISCV_PCREL_LO12_I => "R_RISCV_PCREL_LO12_I",
        R_RISCV_PCREL_LO12_S => "R_RISCV_PCREL_LO12_S",
        R_RISCV_HI20 => "R_RISCV_HI20",
        R_RISCV_LO12_I => "R_RISCV_LO12_I",
        R_RISCV_LO12_S => "R_RISCV_LO12_S",
        R_RISCV_ADD8 => "R_RISCV_ADD8",
        R_RISCV_ADD16 => "R_RISCV_ADD16",
        R_RISCV_ADD32 => "R_RISCV_ADD32",
        R_RISCV_ADD64 => "R_RISCV_ADD64",
        R_RISCV_SUB8 => "R_RISCV_SUB8",
        R_RISCV_SUB16 => "R_RISCV_SUB16",
        R_RISCV_SUB32 => "R_RISCV_SUB32",
        R_RISCV_SUB64 => "R_RISCV_SUB64",
        R_RISCV_SUB6 => "R_RISCV_SUB6",
        R_RISCV_SET6 => "R_RISCV_SET6",
        R_RISCV_SET8 => "R_RISCV_SET8",
        R_RISCV_SET16 => "R_RISCV_SET16",
        R_RISCV_SET32 => "R_RISCV_SET32",
        R_RISCV_32_PCREL => "R_RISCV_32_PCREL",
        R_RISCV_RVC_BRANCH => "R_RISCV_RVC_BRANCH",
        R_RISCV_RVC_JUMP => "R_RISCV_RVC_JUMP",
        R_RISCV_RELAX => "R_RISCV_RELAX",
        _ => "UNKNOWN",
    }
}

/// RISC-V 64 ELF relocator implementation.
///
/// Stores a cache of HI20 relocations for efficient LO12 pairing lookup.
pub(crate) struct StaticRelocator {
    /// Cache for PCREL_HI20/GOT_HI20 relocations.
    /// Key: runtime address of the AUIPC instruction.
    /// Value: (symbol_idx, addend, relocation_type)
    hi20_cache: HashMap<usize, (usize, i64, u32)>,
}

/// Helper functions for RISC-V instruction encoding
impl StaticRelocator {
    /// Resolve the lo12 value for PCREL_LO12_I/S relocations.
    ///
    /// This finds the paired HI20 relocation (PCREL_HI20 or GOT_HI20) at the
    /// AUIPC instruction address, recomputes the full PC-relative offset, and
    /// returns the lo12 portion.
    fn resolve_pcrel_lo12<H: Host>(
        &self,
        helper: &mut RelocHelper<'_, H>,
        site: &RelocSite,
    ) -> Result<i64> {
        // r_sym points to the label at the AUIPC instruction address
        let auipc = helper.find_symbol(site)?;
        let (target_sym, target_addend, hi20_type) = self
            .hi20_cache
            .get(&auipc)
            .copied()
            .ok_or_else(|| {
                reloc_error(site, "could not find paired HI20 relocation", helper.name)
            })?;
        let hi20_site = RelocSite {
            place: auipc,
            r_sym: target_sym,
            addend: target_addend,
            r_type: hi20_type,
            offset: site.offset,
        };

        let off = if hi20_type == R_RISCV_GOT_HI20 {
            // The AUIPC+LD pair loads from the GOT entry; addends are ignored.
            (helper.got_entry(&hi20_site)? as i64).wrapping_sub(auipc as i64)
        } else {
            // (S + A) - AUIPC_PC, plus the LO12 addend
            let target = helper
                .sym_addend(&hi20_site)?
                .wrapping_add_signed(site.addend as isize);
            (target as i64).wrapping_sub(auipc as i64)
        };

        // Split into hi20 + lo12
        let hi20 = (off + 0x800) >> 12;
        Ok(off - (hi20 << 12))
    }

    fn patch32<H: Host>(
        helper: &RelocHelper<'_, H>,
        site: &RelocSite,
        val: i64,
        ty: ImmType,
    ) -> Result<()> {
        let insn: u32 = helper.read_at(site, site.place)?;
        helper.write(site, Self::encode_imm(insn, val, ty))
    }

    fn patch16<H: Host>(
        helper: &RelocHelper<'_, H>,
        site: &RelocSite,
        val: i64,
        ty: ImmType,
    ) -> Result<()> {
        let insn: u16 = helper.read_at(site, site.place)?;
        helper.write(site, Self::encode_imm(u32::from(insn), val, ty) as u16)
    }

    /// Patches an AUIPC + JALR pair with a PC-relative offset.
    fn patch_call<H: Host>(helper: &RelocHelper<'_, H>, site: &RelocSite, off: i64) -> Result<()> {
        if !fits_signed(off, 32) {
            return Err(reloc_error(site, "CALL offset out of +-2GiB range", helper.name));
        }
        let hi20 = (off + 0x800) >> 12;
        let lo12 = off & 0xfff;
        let jalr_addr = site.place + 4;
        let auipc: u32 = helper.read_at(site, site.place)?;
        let jalr: u32 = helper.read_at(site, jalr_addr)?;
        helper.write(site, Self::encode_imm(auipc, hi20, ImmType::U))?;
        helper.write_at(site, jalr_addr, Self::encode_imm(jalr, lo12, ImmType::I))
    }

    fn branch_offset<H: Host>(
        helper: &RelocHelper<'_, H>,
        site: &RelocSite,
        bits: u32,
    ) -> Result<i64> {
        let off = helper.pc_relative(site)?;
        if off & 1 != 0 || !fits_signed(off, bits) {
            return Err(reloc_error(site, "branch offset out of range", helper.name));
        }
        Ok(off)
    }

    /// Encode immediate value into a RISC-V instruction
    #[inline]
    fn encode_imm(insn: u32, val: i64, ty: ImmType) -> u32 {
        match ty {
            ImmType::U => (insn & 0xfff) | ((val as u32) << 12),
            ImmType::I => (insn & 0xfffff) | (((val & 0xfff) as u32) << 20),
            ImmType::S => {
                let imm11_5 = ((val >> 5) & 0x7f) as u32;
                let imm4_0 = (val & 0x1f) as u32;
                (insn & 0x1fff07f) | (imm11_5 << 25) | (imm4_0 << 7)
            }
            ImmType::B => {
                let imm12 = ((val >> 12) & 0x1) as u32;
                let imm10_5 = ((val >> 5) & 0x3f) as u32;
                let imm4_1 = ((val >> 1) & 0xf) as u32;
                let imm11 = ((val >> 11) & 0x1) as u32;
                (insn & 0x1fff07f) | (imm12 << 31) | (imm10_5 << 25) | (imm4_1 << 8) | (imm11 << 7)
            }
            ImmType::J => {
                let imm20 = ((val >> 20) & 0x1) as u32;
                let imm10_1 = ((val >> 1) & 0x3ff) as u32;
                let imm11 = ((val >> 11) & 0x1) as u32;
                let imm19_12 = ((val >> 12) & 0xff) as u32;
                (insn & 0xfff) | (imm20 << 31) | (imm10_1 << 21) | (imm11 << 20) | (imm19_12 << 12)
            }
            ImmType::CB => {
                let imm8 = ((val >> 8) & 0x1) as u16;
                let imm4_3 = ((val >> 3) & 0x3) as u16;
                let imm7_6 = ((val >> 6) & 0x3) as u16;
                let imm2_1 = ((val >> 1) & 0x3) as u16;
                let imm5 = ((val >> 5) & 0x1) as u16;
                (((insn as u16) & 0xe383)
                    | ((imm8 << 12) | (imm4_3 << 10) | (imm7_6 << 5) | (imm2_1 << 3) | (imm5 << 2)))
                    as u32
            }
            ImmType::CJ => {
                let imm11 = ((val >> 11) & 0x1) as u16;
                let imm4 = ((val >> 4) & 0x1) as u16;
                let imm9_8 = ((val >> 8) & 0x3) as u16;
                let imm10 = ((val >> 10) & 0x1) as u16;
                let imm6 = ((val >> 6) & 0x1) as u16;
                let imm7 = ((val >> 7) & 0x1) as u16;
                let imm3_1 = ((val >> 1) & 0x7) as u16;
                let imm5 = ((val >> 5) & 0x1) as u16;
                (((insn as u16) & 0xe003)
                    | ((imm11 << 12)
                        | (imm4 << 11)
                        | (imm9_8 << 9)
                        | (imm10 << 8)
                        | (imm6 << 7)
                        | (imm7 << 6)
                        | (imm3_1 << 3)
                        | (imm5 << 2))) as u32
            }
        }
    }
}

/// Immediate encoding types for RISC-V instructions
#[derive(Copy, Clone)]
enum ImmType {
    U,  // Upper immediate (lui, auipc)
    I,  // I-type immediate
    S,  // S-type immediate (store)
    B,  // B-type immediate (branch)
    J,  // J-type immediate (jal)
    CB, // Compressed branch
    CJ, // Compressed jump
}

impl StaticReloc for StaticRelocator {
    fn new() -> Self {
        Self {
            hi20_cache: HashMap::new(),
        }
    }

    fn prepare(&mut self, sites: &[RelocSite]) {
        // Build HI20 cache: scan all relocations for PCREL_HI20 and GOT_HI20
        self.hi20_cache.clear();
        for site in sites {
            if site.r_type == R_RISCV_PCREL_HI20 || site.r_type == R_RISCV_GOT_HI20 {
                let addend = if site.r_type == R_RISCV_GOT_HI20 {
                    0 // GOT_HI20 must have zero addend per psABI
                } else {
                    site.addend
                };
                self.hi20_cache
                    .insert(site.place, (site.r_sym, addend, site.r_type));
            }
        }
    }

    fn relocate<H: Host>(
        &mut self,
        helper: &mut RelocHelper<'_, H>,
        site: &RelocSite,
    ) -> Result<()> {
        match site.r_type {
            R_RISCV_NONE => {}
            // Absolute 64-bit relocation: S + A
            R_RISCV_64 => helper.write(site, helper.sym_addend(site)? as u64)?,
            // Absolute 32-bit relocation: S + A
            R_RISCV_32 => {
                let val = u32::try_from(helper.sym_addend(site)?).map_err(|_| {
                    reloc_error(
                        site,
                        "out of range integral type conversion attempted",
                        helper.name,
                    )
                })?;
                helper.write(site, val)?;
            }
            // Relative relocation: B + A
            R_RISCV_RELATIVE => helper.write(site, helper.relative(site)? as u64)?,
            R_RISCV_JUMP_SLOT => helper.write(site, helper.find_symbol(site)? as u64)?,
            // PC-relative 32-bit: S + A - P
            R_RISCV_32_PCREL => {
                let off = helper.pc_relative(site)?;
                if !fits_signed(off, 32) {
                    return Err(reloc_error(site, "PC-relative offset out of range", helper.name));
                }
                helper.write(site, off as i32)?;
            }
            // Branch instruction: S + A - P (must be even, within +-4KiB)
            R_RISCV_BRANCH => {
                let off = Self::branch_offset(helper, site, 13)?;
                Self::patch32(helper, site, off, ImmType::B)?;
            }
            // JAL instruction: S + A - P (must be even, within +-1MiB)
            R_RISCV_JAL => {
                let off = Self::branch_offset(helper, site, 21)?;
                Self::patch32(helper, site, off, ImmType::J)?;
            }
            // CALL/CALL_PLT: pair of AUIPC + JALR. Targets are always called
            // directly; there are no PLT stubs.
            R_RISCV_CALL | R_RISCV_CALL_PLT => {
                let off = helper.pc_relative(site)?;
                Self::patch_call(helper, site, off)?;
            }
            // GOT_HI20: high 20 bits of GOT entry offset
            R_RISCV_GOT_HI20 => {
                if site.addend != 0 {
                    return Err(reloc_error(
                        site,
                        "R_RISCV_GOT_HI20 with non-zero addend is invalid",
                        helper.name,
                    ));
                }
                let got = helper.got_entry(site)?;
                let off = (got.wrapping_sub(site.place)) as i64;
                Self::patch32(helper, site, (off + 0x800) >> 12, ImmType::U)?;
            }
            // PCREL_HI20: high 20 bits of PC-relative offset
            R_RISCV_PCREL_HI20 => {
                let off = helper.pc_relative(site)?;
                Self::patch32(helper, site, (off + 0x800) >> 12, ImmType::U)?;
            }
            // PCREL_LO12_I/S: low 12 bits, paired with PCREL_HI20 or GOT_HI20
            R_RISCV_PCREL_LO12_I => {
                let lo12 = self.resolve_pcrel_lo12(helper, site)?;
                Self::patch32(helper, site, lo12, ImmType::I)?;
            }
            R_RISCV_PCREL_LO12_S => {
                let lo12 = self.resolve_pcrel_lo12(helper, site)?;
                Self::patch32(helper, site, lo12, ImmType::S)?;
            }
            // HI20: absolute high 20 bits
            R_RISCV_HI20 => {
                let val = helper.sym_addend(site)? as i64;
                Self::patch32(helper, site, (val + 0x800) >> 12, ImmType::U)?;
            }
            // LO12_I/S: absolute low 12 bits
            R_RISCV_LO12_I => {
                let val = helper.sym_addend(site)? as i64;
                Self::patch32(helper, site, val & 0xfff, ImmType::I)?;
            }
            R_RISCV_LO12_S => {
                let val = helper.sym_addend(site)? as i64;
                Self::patch32(helper, site, val & 0xfff, ImmType::S)?;
            }
            // ADD*/SUB*: *(uN*)P = *(uN*)P +/- (S + A)
            R_RISCV_ADD8 | R_RISCV_SUB8 => {
                let value = helper.sym_addend(site)? as u8;
                let old: u8 = helper.read_at(site, site.place)?;
                let new = if site.r_type == R_RISCV_ADD8 {
                    old.wrapping_add(value)
                } else {
                    old.wrapping_sub(value)
                };
                helper.write(site, new)?;
            }
            R_RISCV_ADD16 | R_RISCV_SUB16 => {
                let value = helper.sym_addend(site)? as u16;
                let old: u16 = helper.read_at(site, site.place)?;
                let new = if site.r_type == R_RISCV_ADD16 {
                    old.wrapping_add(value)
                } else {
                    old.wrapping_sub(value)
                };
                helper.write(site, new)?;
            }
            R_RISCV_ADD32 | R_RISCV_SUB32 => {
                let value = helper.sym_addend(site)? as u32;
                let old: u32 = helper.read_at(site, site.place)?;
                let new = if site.r_type == R_RISCV_ADD32 {
                    old.wrapping_add(value)
                } else {
                    old.wrapping_sub(value)
                };
                helper.write(site, new)?;
            }
            R_RISCV_ADD64 | R_RISCV_SUB64 => {
                let value = helper.sym_addend(site)? as u64;
                let old: u64 = helper.read_at(site, site.place)?;
                let new = if site.r_type == R_RISCV_ADD64 {
                    old.wrapping_add(value)
                } else {
                    old.wrapping_sub(value)
                };
                helper.write(site, new)?;
            }
            // SUB6/SET6: bits 5:0
            R_RISCV_SUB6 | R_RISCV_SET6 => {
                let value = helper.sym_addend(site)? as u8;
                let old: u8 = helper.read_at(site, site.place)?;
                let low = if site.r_type == R_RISCV_SUB6 {
                    (old & 0x3f).wrapping_sub(value)
                } else {
                    value
                };
                helper.write(site, (old & 0xc0) | (low & 0x3f))?;
            }
            R_RISCV_SET8 => helper.write(site, helper.sym_addend(site)? as u8)?,
            R_RISCV_SET16 => helper.write(site, helper.sym_addend(site)? as u16)?,
            R_RISCV_SET32 => helper.write(site, helper.sym_addend(site)? as u32)?,
            // RVC_BRANCH: compressed branch instruction (+-256B)
            R_RISCV_RVC_BRANCH => {
                let off = Self::branch_offset(helper, site, 9)?;
                Self::patch16(helper, site, off, ImmType::CB)?;
            }
            // RVC_JUMP: compressed jump instruction (+-2KiB)
            R_RISCV_RVC_JUMP => {
                let off = Self::branch_offset(helper, site, 12)?;
                Self::patch16(helper, site, off, ImmType::CJ)?;
            }
            // RELAX: linker optimization hint, nothing to patch at load time
            R_RISCV_RELAX => {}
            _ => {
                return Err(reloc_error(site, "unsupported relocation type", helper.name));
            }
        }
        Ok(())
    }

    fn needs_got(rel_type: u32) -> bool {
        rel_type == R_RISCV_GOT_HI20
    }
}
