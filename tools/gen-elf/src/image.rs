use crate::{
    Arch, ElfOutput, PAGE_SIZE, RelocEntry, RelocInfo, SLOTS_SYMBOL, SymbolBody, SymbolDesc,
    raw::{
        EHDR_SIZE, Ehdr, PHDR_SIZE, Phdr, RELA_SIZE, SHDR_SIZE, SYM_SIZE, Shdr, StrTab, align_up,
        encode_rela, pad_to,
    },
    symtab::{SymEntry, SymTab},
};
use anyhow::{Result, anyhow, bail};
use elf::abi::{
    ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_LOAD, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHN_ABS,
    SHN_UNDEF, SHT_DYNSYM, SHT_NOBITS, SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL,
    STB_LOCAL, STT_FILE, STT_FUNC, STT_NOTYPE, STT_OBJECT,
};

const FUNC_ALIGN: u64 = 16;
const SLOT_SIZE: u64 = 8;

/// Writes a linked image with two `PT_LOAD` segments.
///
/// The first segment is `R|X` and holds the headers, `.text`, the optional
/// `.dynsym`/`.dynstr` and `.rela.dyn`. The second is `R|W`, starts one page
/// past the end of the first in the address space (leaving a gap), and holds
/// `.data`, the relocation slots and a `.bss` tail that exists only in memory.
pub struct ImageWriter {
    arch: Arch,
    e_type: u16,
    entry: Option<String>,
    dynsym: bool,
}

/// A section header waiting for its name.
pub(crate) struct Section {
    pub name: &'static str,
    pub shdr: Shdr,
}

impl ImageWriter {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            e_type: ET_DYN,
            entry: None,
            dynsym: false,
        }
    }

    /// Sets `e_entry` to the address of the function `name`.
    pub fn with_entry(mut self, name: &str) -> Self {
        self.entry = Some(name.to_string());
        self
    }

    /// Emits an `ET_EXEC` header instead of `ET_DYN`.
    pub fn with_exec(mut self) -> Self {
        self.e_type = ET_EXEC;
        self
    }

    /// Links `.rela.dyn` to an allocated `.dynsym` instead of `.symtab`.
    ///
    /// `.symtab` is still written and starts with a local `STT_FILE` symbol,
    /// so the same symbol has different indices in the two tables.
    pub fn with_dynsym(mut self) -> Self {
        self.dynsym = true;
        self
    }

    pub fn write(&self, relocs: &[RelocEntry], symbols: &[SymbolDesc]) -> Result<ElfOutput> {
        const PHNUM: usize = 2;

        // Segment 1: headers and code.
        let mut out = vec![0u8; EHDR_SIZE + PHNUM * PHDR_SIZE];
        let text_off = align_up(out.len() as u64, FUNC_ALIGN);
        pad_to(&mut out, text_off);
        let mut entries = Vec::new();
        for sym in symbols {
            if let SymbolBody::Func(value) = sym.body {
                let addr = align_up(out.len() as u64, FUNC_ALIGN);
                pad_to(&mut out, addr);
                let code = self.arch.return_const(value);
                entries.push(SymEntry {
                    name: sym.name.clone(),
                    bind: sym.bind,
                    kind: STT_FUNC,
                    shndx: 1,
                    value: addr,
                    size: code.len() as u64,
                });
                out.extend_from_slice(&code);
            }
        }
        let text_size = out.len() as u64 - text_off;

        // Section indices are fixed by the layout.
        let base = if self.dynsym { 2 } else { 0 };
        let rela_idx = 2 + base;
        let data_idx = rela_idx + 1;
        let bss_idx = data_idx + 1;
        let symtab_idx = bss_idx + 1;

        // Segment 2: data, slots and bss. Addresses are known before bytes.
        let seg1_guess = self.segment1_end(out.len() as u64, symbols, relocs.len());
        let data_off = align_up(seg1_guess, PAGE_SIZE);
        let data_vaddr = data_off + PAGE_SIZE;
        let mut data = Vec::new();
        for sym in symbols {
            match &sym.body {
                SymbolBody::Object(bytes) => {
                    let len = align_up(data.len() as u64, 8);
                    pad_to(&mut data, len);
                    entries.push(SymEntry {
                        name: sym.name.clone(),
                        bind: sym.bind,
                        kind: STT_OBJECT,
                        shndx: data_idx as u16,
                        value: data_vaddr + data.len() as u64,
                        size: bytes.len() as u64,
                    });
                    data.extend_from_slice(bytes);
                }
                SymbolBody::Common(_) => {
                    bail!("common symbol `{}` in a linked image", sym.name)
                }
                SymbolBody::ReadOnly(_) => {
                    bail!("read-only symbol `{}` in a linked image", sym.name)
                }
                _ => {}
            }
        }
        let len = align_up(data.len() as u64, SLOT_SIZE);
        pad_to(&mut data, len);
        let slots_vaddr = data_vaddr + data.len() as u64;
        let slots_size = SLOT_SIZE * relocs.len().max(1) as u64;
        entries.push(SymEntry {
            name: SLOTS_SYMBOL.to_string(),
            bind: STB_GLOBAL,
            kind: STT_OBJECT,
            shndx: data_idx as u16,
            value: slots_vaddr,
            size: slots_size,
        });
        let len = data.len() as u64 + slots_size;
        pad_to(&mut data, len);
        let data_filesz = data.len() as u64;

        let bss_vaddr = align_up(data_vaddr + data_filesz, 8);
        let mut bss_end = bss_vaddr;
        for sym in symbols {
            match sym.body {
                SymbolBody::Bss(size) => {
                    bss_end = align_up(bss_end, 8);
                    entries.push(SymEntry {
                        name: sym.name.clone(),
                        bind: sym.bind,
                        kind: STT_OBJECT,
                        shndx: bss_idx as u16,
                        value: bss_end,
                        size,
                    });
                    bss_end += size;
                }
                SymbolBody::Absolute(value) => entries.push(SymEntry {
                    name: sym.name.clone(),
                    bind: sym.bind,
                    kind: STT_NOTYPE,
                    shndx: SHN_ABS,
                    value,
                    size: 0,
                }),
                SymbolBody::UndefinedFunc | SymbolBody::UndefinedObject => {
                    entries.push(SymEntry {
                        name: sym.name.clone(),
                        bind: sym.bind,
                        kind: if matches!(sym.body, SymbolBody::UndefinedFunc) {
                            STT_FUNC
                        } else {
                            STT_OBJECT
                        },
                        shndx: SHN_UNDEF,
                        value: 0,
                        size: 0,
                    })
                }
                _ => {}
            }
        }
        let bss_size = bss_end - bss_vaddr;

        let file_sym = SymEntry {
            name: "gen-elf".to_string(),
            bind: STB_LOCAL,
            kind: STT_FILE,
            shndx: SHN_ABS,
            value: 0,
            size: 0,
        };
        let symtab = SymTab::build(core::iter::once(&file_sym).chain(entries.iter()));
        let dyntab = self
            .dynsym
            .then(|| SymTab::build(entries.iter().filter(|e| e.bind != STB_LOCAL)));
        let rela_tab = dyntab.as_ref().unwrap_or(&symtab);

        let mut sections = vec![Section {
            name: ".text",
            shdr: Shdr {
                sh_type: SHT_PROGBITS,
                sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as u64,
                sh_addr: text_off,
                sh_offset: text_off,
                sh_size: text_size,
                sh_addralign: FUNC_ALIGN,
                ..Default::default()
            },
        }];

        if let Some(dyntab) = &dyntab {
            let dynsym_off = align_up(out.len() as u64, 8);
            pad_to(&mut out, dynsym_off);
            out.extend_from_slice(&dyntab.syms);
            let dynstr_off = out.len() as u64;
            out.extend_from_slice(&dyntab.strs);
            sections.push(Section {
                name: ".dynsym",
                shdr: Shdr {
                    sh_type: SHT_DYNSYM,
                    sh_flags: SHF_ALLOC as u64,
                    sh_addr: dynsym_off,
                    sh_offset: dynsym_off,
                    sh_size: dyntab.syms.len() as u64,
                    sh_link: 3,
                    sh_info: dyntab.first_global,
                    sh_addralign: 8,
                    sh_entsize: SYM_SIZE as u64,
                    ..Default::default()
                },
            });
            sections.push(Section {
                name: ".dynstr",
                shdr: Shdr {
                    sh_type: SHT_STRTAB,
                    sh_flags: SHF_ALLOC as u64,
                    sh_addr: dynstr_off,
                    sh_offset: dynstr_off,
                    sh_size: dyntab.strs.len() as u64,
                    sh_addralign: 1,
                    ..Default::default()
                },
            });
        }

        let lookup = |name: &str| {
            entries
                .iter()
                .find(|e| e.name == name && e.shndx != SHN_UNDEF)
                .map(|e| e.value)
                .ok_or_else(|| anyhow!("no definition of `{name}`"))
        };

        let rela_off = align_up(out.len() as u64, 8);
        pad_to(&mut out, rela_off);
        let mut infos = Vec::with_capacity(relocs.len());
        for (idx, reloc) in relocs.iter().enumerate() {
            let sym_idx = match &reloc.symbol {
                Some(name) => rela_tab
                    .index_of(name)
                    .ok_or_else(|| anyhow!("relocation against unknown symbol `{name}`"))?,
                None => 0,
            };
            let addend = match &reloc.base {
                Some(name) => lookup(name)? as i64 + reloc.addend,
                None => reloc.addend,
            };
            let slot_offset = idx as u64 * SLOT_SIZE;
            out.extend_from_slice(&encode_rela(
                slots_vaddr + slot_offset,
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
        let rela_size = (relocs.len() * RELA_SIZE) as u64;
        sections.push(Section {
            name: ".rela.dyn",
            shdr: Shdr {
                sh_type: SHT_RELA,
                sh_flags: SHF_ALLOC as u64,
                sh_addr: rela_off,
                sh_offset: rela_off,
                sh_size: rela_size,
                sh_link: if self.dynsym { 2 } else { symtab_idx as u32 },
                sh_addralign: 8,
                sh_entsize: RELA_SIZE as u64,
                ..Default::default()
            },
        });
        let seg1_end = out.len() as u64;
        if seg1_end != seg1_guess {
            bail!("segment 1 layout mismatch: {seg1_end:#x} != {seg1_guess:#x}");
        }

        pad_to(&mut out, data_off);
        out.extend_from_slice(&data);
        sections.push(Section {
            name: ".data",
            shdr: Shdr {
                sh_type: SHT_PROGBITS,
                sh_flags: (SHF_ALLOC | SHF_WRITE) as u64,
                sh_addr: data_vaddr,
                sh_offset: data_off,
                sh_size: data_filesz,
                sh_addralign: 8,
                ..Default::default()
            },
        });
        sections.push(Section {
            name: ".bss",
            shdr: Shdr {
                sh_type: SHT_NOBITS,
                sh_flags: (SHF_ALLOC | SHF_WRITE) as u64,
                sh_addr: bss_vaddr,
                sh_offset: data_off + data_filesz,
                sh_size: bss_size,
                sh_addralign: 8,
                ..Default::default()
            },
        });

        // Non-allocated tables.
        let symtab_off = align_up(out.len() as u64, 8);
        pad_to(&mut out, symtab_off);
        out.extend_from_slice(&symtab.syms);
        let strtab_off = out.len() as u64;
        out.extend_from_slice(&symtab.strs);
        sections.push(Section {
            name: ".symtab",
            shdr: Shdr {
                sh_type: SHT_SYMTAB,
                sh_offset: symtab_off,
                sh_size: symtab.syms.len() as u64,
                sh_link: symtab_idx as u32 + 1,
                sh_info: symtab.first_global,
                sh_addralign: 8,
                sh_entsize: SYM_SIZE as u64,
                ..Default::default()
            },
        });
        sections.push(Section {
            name: ".strtab",
            shdr: Shdr {
                sh_type: SHT_STRTAB,
                sh_offset: strtab_off,
                sh_size: symtab.strs.len() as u64,
                sh_addralign: 1,
                ..Default::default()
            },
        });

        let entry = match &self.entry {
            Some(name) => lookup(name)?,
            None => 0,
        };

        let phdrs = [
            Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_X,
                p_offset: 0,
                p_vaddr: 0,
                p_filesz: seg1_end,
                p_memsz: seg1_end,
                p_align: PAGE_SIZE,
            },
            Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: data_off,
                p_vaddr: data_vaddr,
                p_filesz: data_filesz,
                p_memsz: bss_end - data_vaddr,
                p_align: PAGE_SIZE,
            },
        ];
        for (idx, phdr) in phdrs.iter().enumerate() {
            let off = EHDR_SIZE + idx * PHDR_SIZE;
            phdr.write(&mut out[off..off + PHDR_SIZE]);
        }

        let (shoff, shnum, shstrndx) = finish_sections(&mut out, sections);
        Ehdr {
            e_type: self.e_type,
            e_machine: self.arch.machine(),
            e_entry: entry,
            e_phoff: EHDR_SIZE as u64,
            e_shoff: shoff,
            e_phnum: PHNUM as u16,
            e_shnum: shnum,
            e_shstrndx: shstrndx,
        }
        .write(&mut out[..EHDR_SIZE]);

        Ok(ElfOutput {
            data: out,
            relocations: infos,
        })
    }

    /// End of segment 1 given the end of `.text`.
    fn segment1_end(&self, text_end: u64, symbols: &[SymbolDesc], nrelocs: usize) -> u64 {
        let mut end = text_end;
        if self.dynsym {
            let mut nsyms = 2;
            let mut strs = 1 + SLOTS_SYMBOL.len() as u64 + 1;
            for sym in symbols.iter().filter(|s| s.bind != STB_LOCAL) {
                if !matches!(sym.body, SymbolBody::Common(_)) {
                    nsyms += 1;
                    strs += sym.name.len() as u64 + 1;
                }
            }
            end = align_up(end, 8) + nsyms * SYM_SIZE as u64 + strs;
        }
        align_up(end, 8) + (nrelocs * RELA_SIZE) as u64
    }
}

/// Appends `.shstrtab` and the section header table. Returns
/// `(e_shoff, e_shnum, e_shstrndx)`.
pub(crate) fn finish_sections(out: &mut Vec<u8>, sections: Vec<Section>) -> (u64, u16, u16) {
    let mut shstrtab = StrTab::new();
    let mut headers = vec![Shdr::default()];
    for section in sections {
        let mut shdr = section.shdr;
        shdr.sh_name = shstrtab.add(section.name);
        headers.push(shdr);
    }
    let shstrndx = headers.len();
    let name = shstrtab.add(".shstrtab");
    let strs = shstrtab.into_bytes();
    let shstr_off = out.len() as u64;
    out.extend_from_slice(&strs);
    headers.push(Shdr {
        sh_name: name,
        sh_type: SHT_STRTAB,
        sh_offset: shstr_off,
        sh_size: strs.len() as u64,
        sh_addralign: 1,
        ..Default::default()
    });

    let shoff = align_up(out.len() as u64, 8);
    pad_to(out, shoff);
    for shdr in &headers {
        let start = out.len();
        out.resize(start + SHDR_SIZE, 0);
        shdr.write(&mut out[start..]);
    }
    (shoff, headers.len() as u16, shstrndx as u16)
}
