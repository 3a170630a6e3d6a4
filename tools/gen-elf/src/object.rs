use crate::{
    Arch, ElfOutput, RelocEntry, RelocInfo, SLOTS_SYMBOL, SymbolBody, SymbolDesc,
    image::{Section, finish_sections},
    raw::{EHDR_SIZE, Ehdr, RELA_SIZE, SYM_SIZE, Shdr, align_up, encode_rela, pad_to},
    symtab::{SymEntry, SymTab},
};
use anyhow::{Result, anyhow};
use elf::abi::{
    ET_REL, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHN_ABS, SHN_COMMON, SHN_UNDEF, SHT_NOBITS,
    SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STB_LOCAL, STT_FILE, STT_FUNC,
    STT_NOTYPE, STT_OBJECT, STT_SECTION,
};

const SHF_INFO_LINK: u64 = 0x40;
const FUNC_ALIGN: u64 = 16;
const SLOT_SIZE: u64 = 8;

const TEXT_IDX: u16 = 1;
const DATA_IDX: u16 = 2;
const BSS_IDX: u16 = 3;
const SYMTAB_IDX: u32 = 5;
const RODATA_IDX: u16 = 7;

/// Writes a relocatable object: `.text`, `.data`, `.bss` and `.rela.data`, plus
/// `.rodata` after `.strtab` when any read-only symbol is defined.
///
/// Symbol values are section-relative. Relocations built with
/// [`RelocEntry::relative`] are emitted against the section symbol of their
/// base, the way assemblers reference local data.
pub struct ObjectWriter {
    arch: Arch,
}

impl ObjectWriter {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    pub fn write(&self, relocs: &[RelocEntry], symbols: &[SymbolDesc]) -> Result<ElfOutput> {
        let mut locals: Vec<SymEntry> = vec![SymEntry {
            name: "gen-elf.o".to_string(),
            bind: STB_LOCAL,
            kind: STT_FILE,
            shndx: SHN_ABS,
            value: 0,
            size: 0,
        }];
        for shndx in [TEXT_IDX, DATA_IDX, BSS_IDX] {
            locals.push(SymEntry {
                name: String::new(),
                bind: STB_LOCAL,
                kind: STT_SECTION,
                shndx,
                value: 0,
                size: 0,
            });
        }

        let mut entries = Vec::new();
        let mut text = Vec::new();
        let mut data = Vec::new();
        let mut rodata = Vec::new();
        let mut bss_size = 0u64;
        for sym in symbols {
            let (kind, shndx, value, size) = match &sym.body {
                SymbolBody::Func(value) => {
                    let len = align_up(text.len() as u64, FUNC_ALIGN);
                    pad_to(&mut text, len);
                    let code = self.arch.return_const(*value);
                    let off = text.len() as u64;
                    text.extend_from_slice(&code);
                    (STT_FUNC, TEXT_IDX, off, code.len() as u64)
                }
                SymbolBody::Object(bytes) => {
                    let len = align_up(data.len() as u64, 8);
                    pad_to(&mut data, len);
                    let off = data.len() as u64;
                    data.extend_from_slice(bytes);
                    (STT_OBJECT, DATA_IDX, off, bytes.len() as u64)
                }
                SymbolBody::ReadOnly(bytes) => {
                    let len = align_up(rodata.len() as u64, 8);
                    pad_to(&mut rodata, len);
                    let off = rodata.len() as u64;
                    rodata.extend_from_slice(bytes);
                    (STT_OBJECT, RODATA_IDX, off, bytes.len() as u64)
                }
                SymbolBody::Bss(size) => {
                    let off = align_up(bss_size, 8);
                    bss_size = off + size;
                    (STT_OBJECT, BSS_IDX, off, *size)
                }
                SymbolBody::UndefinedFunc => (STT_FUNC, SHN_UNDEF, 0, 0),
                SymbolBody::UndefinedObject => (STT_OBJECT, SHN_UNDEF, 0, 0),
                // st_value holds the alignment.
                SymbolBody::Common(size) => (STT_OBJECT, SHN_COMMON, 8, *size),
                SymbolBody::Absolute(value) => (STT_NOTYPE, SHN_ABS, *value, 0),
            };
            entries.push(SymEntry {
                name: sym.name.clone(),
                bind: sym.bind,
                kind,
                shndx,
                value,
                size,
            });
        }

        let len = align_up(data.len() as u64, SLOT_SIZE);
        pad_to(&mut data, len);
        let slots_off = data.len() as u64;
        let slots_size = SLOT_SIZE * relocs.len().max(1) as u64;
        pad_to(&mut data, slots_off + slots_size);
        entries.push(SymEntry {
            name: SLOTS_SYMBOL.to_string(),
            bind: STB_GLOBAL,
            kind: STT_OBJECT,
            shndx: DATA_IDX,
            value: slots_off,
            size: slots_size,
        });

        let symtab = SymTab::build(locals.iter().chain(entries.iter()));

        let mut rela = Vec::with_capacity(relocs.len() * RELA_SIZE);
        let mut infos = Vec::with_capacity(relocs.len());
        for (idx, reloc) in relocs.iter().enumerate() {
            let (sym_idx, addend) = match (&reloc.symbol, &reloc.base) {
                (_, Some(base)) => {
                    let target = entries
                        .iter()
                        .find(|e| &e.name == base)
                        .filter(|e| matches!(e.shndx, TEXT_IDX | DATA_IDX | BSS_IDX))
                        .ok_or_else(|| anyhow!("no section definition of `{base}`"))?;
                    // Section symbols follow the file symbol, in section order.
                    (u32::from(target.shndx) + 1, target.value as i64 + reloc.addend)
                }
                (Some(name), None) => {
                    let sym_idx = symtab
                        .index_of(name)
                        .ok_or_else(|| anyhow!("relocation against unknown symbol `{name}`"))?;
                    (sym_idx, reloc.addend)
                }
                (None, None) => (0, reloc.addend),
            };
            let slot_offset = idx as u64 * SLOT_SIZE;
            rela.extend_from_slice(&encode_rela(
                slots_off + slot_offset,
                sym_idx,
                reloc.r_type,
                addend,
            ));
            infos.push(RelocInfo {
                slot_offset,
                r_type: reloc.r_type,
                sym_idx,
                addend,
                symbol: reloc.symbol.clone(),
            });
        }

        let mut out = vec![0u8; EHDR_SIZE];
        let text_off = place(&mut out, &text, FUNC_ALIGN);
        let data_off = place(&mut out, &data, 8);
        let rela_off = place(&mut out, &rela, 8);
        let symtab_off = place(&mut out, &symtab.syms, 8);
        let strtab_off = place(&mut out, &symtab.strs, 1);
        let rodata_off = place(&mut out, &rodata, 8);

        let mut sections = vec![
            Section {
                name: ".text",
                shdr: Shdr {
                    sh_type: SHT_PROGBITS,
                    sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as u64,
                    sh_offset: text_off,
                    sh_size: text.len() as u64,
                    sh_addralign: FUNC_ALIGN,
                    ..Default::default()
                },
            },
            Section {
                name: ".data",
                shdr: Shdr {
                    sh_type: SHT_PROGBITS,
                    sh_flags: (SHF_ALLOC | SHF_WRITE) as u64,
                    sh_offset: data_off,
                    sh_size: data.len() as u64,
                    sh_addralign: 8,
                    ..Default::default()
                },
            },
            Section {
                name: ".bss",
                shdr: Shdr {
                    sh_type: SHT_NOBITS,
                    sh_flags: (SHF_ALLOC | SHF_WRITE) as u64,
                    sh_offset: rela_off,
                    sh_size: bss_size,
                    sh_addralign: 8,
                    ..Default::default()
                },
            },
            Section {
                name: ".rela.data",
                shdr: Shdr {
                    sh_type: SHT_RELA,
                    sh_flags: SHF_INFO_LINK,
                    sh_offset: rela_off,
                    sh_size: rela.len() as u64,
                    sh_link: SYMTAB_IDX,
                    sh_info: u32::from(DATA_IDX),
                    sh_addralign: 8,
                    sh_entsize: RELA_SIZE as u64,
                    ..Default::default()
                },
            },
            Section {
                name: ".symtab",
                shdr: Shdr {
                    sh_type: SHT_SYMTAB,
                    sh_offset: symtab_off,
                    sh_size: symtab.syms.len() as u64,
                    sh_link: SYMTAB_IDX + 1,
                    sh_info: symtab.first_global,
                    sh_addralign: 8,
                    sh_entsize: SYM_SIZE as u64,
                    ..Default::default()
                },
            },
            Section {
                name: ".strtab",
                shdr: Shdr {
                    sh_type: SHT_STRTAB,
                    sh_offset: strtab_off,
                    sh_size: symtab.strs.len() as u64,
                    sh_addralign: 1,
                    ..Default::default()
                },
            },
        ];
        if !rodata.is_empty() {
            sections.push(Section {
                name: ".rodata",
                shdr: Shdr {
                    sh_type: SHT_PROGBITS,
                    sh_flags: SHF_ALLOC as u64,
                    sh_offset: rodata_off,
                    sh_size: rodata.len() as u64,
                    sh_addralign: 8,
                    ..Default::default()
                },
            });
        }

        let (shoff, shnum, shstrndx) = finish_sections(&mut out, sections);
        Ehdr {
            e_type: ET_REL,
            e_machine: self.arch.machine(),
            e_entry: 0,
            e_phoff: 0,
            e_shoff: shoff,
            e_phnum: 0,
            e_shnum: shnum,
            e_shstrndx: shstrndx,
        }
        .write(&mut out[..EHDR_SIZE]);

        Ok(ElfOutput {
            data: out,
            relocations: infos,
        })
    }
}

fn place(out: &mut Vec<u8>, bytes: &[u8], align: u64) -> u64 {
    let off = align_up(out.len() as u64, align);
    pad_to(out, off);
    out.extend_from_slice(bytes);
    off
}
