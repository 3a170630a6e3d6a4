//! Little-endian ELF64 record encoders.

use elf::abi::{ELFCLASS64, ELFDATA2LSB, ELFMAGIC, EV_CURRENT};

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;
pub const SHDR_SIZE: usize = 64;
pub const SYM_SIZE: usize = 24;
pub const RELA_SIZE: usize = 24;

pub(crate) fn align_up(x: u64, align: u64) -> u64 {
    if align <= 1 {
        x
    } else {
        x.div_ceil(align) * align
    }
}

pub(crate) fn pad_to(buf: &mut Vec<u8>, len: u64) {
    if (buf.len() as u64) < len {
        buf.resize(len as usize, 0);
    }
}

pub(crate) struct Ehdr {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_phnum: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Ehdr {
    pub(crate) fn write(&self, out: &mut [u8]) {
        let mut w = Cursor::new(out);
        w.bytes(&ELFMAGIC);
        w.bytes(&[ELFCLASS64, ELFDATA2LSB, EV_CURRENT]);
        w.bytes(&[0; 9]);
        w.u16(self.e_type);
        w.u16(self.e_machine);
        w.u32(u32::from(EV_CURRENT));
        w.u64(self.e_entry);
        w.u64(self.e_phoff);
        w.u64(self.e_shoff);
        w.u32(0);
        w.u16(EHDR_SIZE as u16);
        w.u16(if self.e_phnum == 0 { 0 } else { PHDR_SIZE as u16 });
        w.u16(self.e_phnum);
        w.u16(SHDR_SIZE as u16);
        w.u16(self.e_shnum);
        w.u16(self.e_shstrndx);
    }
}

#[derive(Clone, Copy, Default)]
pub(crate) struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Phdr {
    pub(crate) fn write(&self, out: &mut [u8]) {
        let mut w = Cursor::new(out);
        w.u32(self.p_type);
        w.u32(self.p_flags);
        w.u64(self.p_offset);
        w.u64(self.p_vaddr);
        w.u64(self.p_vaddr);
        w.u64(self.p_filesz);
        w.u64(self.p_memsz);
        w.u64(self.p_align);
    }
}

#[derive(Clone, Copy, Default)]
pub(crate) struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl Shdr {
    pub(crate) fn write(&self, out: &mut [u8]) {
        let mut w = Cursor::new(out);
        w.u32(self.sh_name);
        w.u32(self.sh_type);
        w.u64(self.sh_flags);
        w.u64(self.sh_addr);
        w.u64(self.sh_offset);
        w.u64(self.sh_size);
        w.u32(self.sh_link);
        w.u32(self.sh_info);
        w.u64(self.sh_addralign);
        w.u64(self.sh_entsize);
    }
}

#[derive(Clone, Copy, Default)]
pub(crate) struct Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl Sym {
    pub(crate) fn encode(&self) -> [u8; SYM_SIZE] {
        let mut out = [0; SYM_SIZE];
        let mut w = Cursor::new(&mut out);
        w.u32(self.st_name);
        w.bytes(&[self.st_info, 0]);
        w.u16(self.st_shndx);
        w.u64(self.st_value);
        w.u64(self.st_size);
        out
    }
}

pub(crate) fn encode_rela(offset: u64, sym: u32, r_type: u32, addend: i64) -> [u8; RELA_SIZE] {
    let mut out = [0; RELA_SIZE];
    let mut w = Cursor::new(&mut out);
    w.u64(offset);
    w.u64((u64::from(sym) << 32) | u64::from(r_type));
    w.u64(addend as u64);
    out
}

/// A string table under construction. Offset 0 is the empty string.
pub(crate) struct StrTab {
    data: Vec<u8>,
}

impl StrTab {
    pub(crate) fn new() -> Self {
        Self { data: vec![0] }
    }

    pub(crate) fn add(&mut self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        offset
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

struct Cursor<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self { out, pos: 0 }
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.out[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
}
