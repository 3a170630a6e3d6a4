mod common;

use common::{CountingHost, call_u32, patch, read_u64, slot};
use elf_module::{
    Error, LoadHook, LoadHookContext, Loader, Result, SegmentLayout, SymbolBind, SymbolKind,
    arch::{REL_GOTPCREL, REL_RELATIVE, REL_SYMBOLIC},
    input::ElfBinary,
    os::ProtFlags,
};
use gen_elf::{Arch, ElfOutput, ImageWriter, ObjectWriter, PAGE_SIZE, RelocEntry, SymbolDesc};
use std::sync::{Arc, Mutex};

const ANSWER: u32 = 42;

fn two_segment_symbols() -> Vec<SymbolDesc> {
    vec![
        SymbolDesc::global_func("answer", ANSWER),
        SymbolDesc::global_object("greeting", b"hello\0\0\0"),
        SymbolDesc::global_bss("counter", 64),
    ]
}

fn two_segment_image() -> ElfOutput {
    ImageWriter::new(Arch::current())
        .write(&[], &two_segment_symbols())
        .expect("Failed to generate ELF")
}

fn counting_loader() -> (Arc<CountingHost>, Loader<CountingHost>) {
    let host = Arc::new(CountingHost::new());
    let loader = Loader::new().with_shared_host(Arc::clone(&host));
    (host, loader)
}

#[test]
fn two_segment_image_loads_and_unloads() {
    let output = two_segment_image();
    let (host, mut loader) = counting_loader();

    let module = loader
        .load(ElfBinary::new("two_segment.so", &output.data))
        .expect("Failed to load");
    assert_eq!(module.regions().len(), 2);
    assert_eq!(host.allocs(), 2);

    // Both segments start on a page boundary, so each bias is region base - p_vaddr.
    let code = &module.regions()[0];
    let answer = module.get("answer").expect("answer is exported") as usize;
    assert_eq!(
        answer,
        code.base() + output.symbol_value("answer").unwrap() as usize
    );
    assert_eq!(unsafe { call_u32(answer as *const ()) }, ANSWER);

    let data = &module.regions()[1];
    let greeting_vaddr = output.symbol_value("greeting").unwrap();
    let data_vaddr = greeting_vaddr - greeting_vaddr % PAGE_SIZE;
    let greeting = module.get("greeting").unwrap() as usize;
    assert_eq!(greeting, data.base() + (greeting_vaddr - data_vaddr) as usize);
    assert_eq!(unsafe { std::slice::from_raw_parts(greeting as *const u8, 5) }, b"hello");

    let counter = module.symbol("counter").expect("counter is exported");
    assert_eq!(counter.size(), 64);
    assert_eq!(counter.kind(), SymbolKind::Object);
    assert!(data.contains(counter.value()));
    let zeros = unsafe { std::slice::from_raw_parts(counter.value() as *const u8, 64) };
    assert!(zeros.iter().all(|&b| b == 0));

    module.unload();
    assert_eq!(host.frees(), 2);
    assert_eq!(host.live(), 0);
}

#[test]
fn every_symbol_lies_in_a_region() {
    let output = two_segment_image();
    let (_host, mut loader) = counting_loader();
    let module = loader.load(&output.data).expect("Failed to load");

    assert_eq!(module.name(), "<memory>");
    for symbol in module.symbols() {
        assert!(
            module.contains(symbol.value()),
            "{:?} lies outside the module",
            symbol.name_str()
        );
    }
    for name in ["answer", "greeting", "counter", gen_elf::SLOTS_SYMBOL] {
        assert!(module.get(name).is_some(), "{name} is missing");
    }
}

#[test]
fn missing_symbols_are_not_found() {
    let output = two_segment_image();
    let (_host, mut loader) = counting_loader();
    let module = loader.load(&output.data).expect("Failed to load");

    assert!(module.get("").is_none());
    assert!(module.get("answe").is_none());
    assert!(module.get("answer2").is_none());
    assert!(module.get_bytes(b"\xffanswer").is_none());
    // The file symbol is not exported.
    assert!(module.get("gen-elf").is_none());
}

#[test]
fn contiguous_layout_keeps_segment_distances() {
    let output = two_segment_image();
    let host = Arc::new(CountingHost::new());
    let mut loader = Loader::new()
        .with_shared_host(Arc::clone(&host))
        .with_layout(SegmentLayout::Contiguous);
    let module = loader.load(&output.data).expect("Failed to load");

    assert_eq!(module.regions().len(), 1);
    let answer = module.get("answer").unwrap() as u64;
    let greeting = module.get("greeting").unwrap() as u64;
    assert_eq!(
        greeting - answer,
        output.symbol_value("greeting").unwrap() - output.symbol_value("answer").unwrap()
    );
    assert_eq!(unsafe { call_u32(answer as *const ()) }, ANSWER);

    drop(module);
    assert_eq!(host.allocs(), 1);
    assert_eq!(host.frees(), 1);
}

#[test]
fn entry_point_is_translated() {
    let output = ImageWriter::new(Arch::current())
        .with_entry("start")
        .write(&[], &[SymbolDesc::global_func("start", 7)])
        .unwrap();
    let (_host, mut loader) = counting_loader();
    let module = loader.load(&output.data).expect("Failed to load");
    assert_eq!(module.entry(), module.get("start").map(|addr| addr as usize));
}

#[test]
fn executables_load_like_shared_objects() {
    let output = ImageWriter::new(Arch::current())
        .with_exec()
        .write(&[], &two_segment_symbols())
        .unwrap();
    let (host, mut loader) = counting_loader();
    let module = loader.load(&output.data).expect("Failed to load");
    let answer = module.get("answer").unwrap();
    assert_eq!(unsafe { call_u32(answer) }, ANSWER);
    drop(module);
    assert_eq!(host.live(), 0);
}

#[test]
fn relocatable_object_sections_are_grouped_by_protection() {
    let output = ObjectWriter::new(Arch::current())
        .write(
            &[],
            &[
                SymbolDesc::global_func("obj_answer", 1234),
                SymbolDesc::global_object("obj_table", &[1, 2, 3, 4, 5, 6, 7, 8]),
                SymbolDesc::global_bss("obj_scratch", 32),
                SymbolDesc::global_func("obj_helper", 99).local(),
            ],
        )
        .unwrap();
    let (host, mut loader) = counting_loader();
    let module = loader
        .load(ElfBinary::new("object.o", &output.data))
        .expect("Failed to load object");

    // RX for .text; RW for .data and .bss.
    assert_eq!(module.regions().len(), 2);
    assert!(module.entry().is_none());

    let answer = module.get("obj_answer").unwrap();
    assert_eq!(unsafe { call_u32(answer) }, 1234);
    let helper = module.symbol("obj_helper").unwrap();
    assert_eq!(helper.bind(), SymbolBind::Local);
    assert_eq!(unsafe { call_u32(helper.as_ptr()) }, 99);

    let table = module.get("obj_table").unwrap() as *const u8;
    assert_eq!(unsafe { std::slice::from_raw_parts(table, 8) }, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let scratch = module.symbol("obj_scratch").unwrap();
    let rw = module
        .regions()
        .iter()
        .find(|region| region.prot().contains(ProtFlags::PROT_WRITE))
        .unwrap();
    assert!(rw.contains(scratch.value()));
    assert!(rw.contains(table as usize));

    drop(module);
    assert_eq!(host.frees(), 2);
}

fn expect_rejected(data: &[u8], check: impl Fn(&Error) -> bool) {
    let (host, mut loader) = counting_loader();
    let err = loader
        .load(ElfBinary::new("malformed.so", data))
        .expect_err("malformed image was accepted");
    assert!(check(&err), "unexpected error: {err}");
    assert_eq!(host.allocs(), 0, "allocated for a malformed image");
    assert_eq!(host.live(), 0);
}

#[test]
fn malformed_headers_are_rejected_without_allocating() {
    let output = two_segment_image();
    let is_ehdr = |err: &Error| matches!(err, Error::ParseEhdr { .. });

    expect_rejected(&patch(&output, 0, b"\x7eELF"), is_ehdr);
    expect_rejected(&patch(&output, 1, b"ELG"), is_ehdr);
    // ELFCLASS32
    expect_rejected(&patch(&output, 4, &[1]), is_ehdr);
    // Big endian.
    expect_rejected(&patch(&output, 5, &[2]), is_ehdr);
    // EV_NONE
    expect_rejected(&patch(&output, 6, &[0]), is_ehdr);
    // EM_386
    expect_rejected(&patch(&output, 18, &3u16.to_le_bytes()), is_ehdr);
    // ET_CORE
    expect_rejected(&patch(&output, 16, &4u16.to_le_bytes()), is_ehdr);
    // e_phentsize
    expect_rejected(&patch(&output, 54, &32u16.to_le_bytes()), is_ehdr);

    expect_rejected(&[], is_ehdr);
    expect_rejected(&output.data[..20], is_ehdr);
}

#[test]
fn malformed_tables_are_rejected_without_allocating() {
    let output = two_segment_image();

    // Program header table cut in half.
    expect_rejected(&output.data[..output.phdr_offset(1) + 10], |err| {
        matches!(err, Error::ParsePhdr { .. })
    });

    // p_filesz > p_memsz on the data segment.
    let phdr = output.phdr_offset(1);
    let memsz = u64::from_le_bytes(output.data[phdr + 40..phdr + 48].try_into().unwrap());
    expect_rejected(&patch(&output, phdr + 32, &(memsz + 1).to_le_bytes()), |err| {
        matches!(err, Error::ParsePhdr { .. })
    });

    // Alignment that is not a power of two.
    expect_rejected(&patch(&output, phdr + 48, &0x1800u64.to_le_bytes()), |err| {
        matches!(err, Error::ParsePhdr { .. })
    });

    // Section header table past the end of the buffer.
    expect_rejected(&output.data[..output.data.len() - 1], |err| {
        matches!(err, Error::ParseShdr { .. })
    });
}

#[test]
fn allocation_failure_at_every_step_releases_everything() {
    let output = two_segment_image();
    let regions = {
        let (_host, mut loader) = counting_loader();
        loader.load(&output.data).unwrap().regions().len()
    };
    assert_eq!(regions, 2);

    for fail_at in 1..=regions {
        let host = Arc::new(CountingHost::failing_at(fail_at));
        let mut loader = Loader::new().with_shared_host(Arc::clone(&host));
        let err = loader.load(&output.data).expect_err("allocation failure was ignored");
        assert!(matches!(err, Error::Alloc { .. }), "unexpected error: {err}");
        assert_eq!(host.requests(), fail_at);
        assert_eq!(host.allocs(), fail_at - 1);
        assert_eq!(host.frees(), fail_at - 1, "step {fail_at} leaked");
        assert_eq!(host.live(), 0);
    }
}

fn read_field(output: &ElfOutput, off: usize) -> u64 {
    u64::from_le_bytes(output.data[off..off + 8].try_into().unwrap())
}

#[test]
fn touching_segments_translate_into_the_following_segment() {
    let output = ImageWriter::new(Arch::current())
        .write(
            &[RelocEntry::relative(REL_RELATIVE, "greeting")],
            &two_segment_symbols(),
        )
        .unwrap();
    let (code, data) = (output.phdr_offset(0), output.phdr_offset(1));
    let data_vaddr = read_field(&output, data + 16);
    assert_eq!(output.symbol_value("greeting"), Some(data_vaddr));

    // Stretch the code segment so that it ends where the data segment starts.
    let memsz = data_vaddr - read_field(&output, code + 16);
    let touching = patch(&output, code + 40, &memsz.to_le_bytes());

    let (host, mut loader) = counting_loader();
    let module = loader
        .load(ElfBinary::new("touching.so", &touching))
        .expect("Failed to load");
    let data_region = &module.regions()[1];

    let greeting = module.get("greeting").unwrap() as usize;
    assert_eq!(greeting, data_region.base());
    assert_eq!(unsafe { std::slice::from_raw_parts(greeting as *const u8, 5) }, b"hello");
    let relocated = unsafe { read_u64(slot(&module, &output.relocations[0])) };
    assert_eq!(relocated, greeting as u64);
    for symbol in module.symbols() {
        assert!(module.contains(symbol.value()), "{:?}", symbol.name_str());
    }
    assert_eq!(unsafe { call_u32(module.get("answer").unwrap()) }, ANSWER);

    drop(module);
    assert_eq!(host.live(), 0);
}

#[test]
fn stripped_images_load_without_exports() {
    let output = two_segment_image();
    let symtab = output.section_index(".symtab").unwrap();
    let rela = output.section_index(".rela.dyn").unwrap();
    // SHT_NULL symbol table, and a relocation section that names none.
    let mut stripped = patch(&output, output.shdr_offset(symtab) + 4, &0u32.to_le_bytes());
    let link = output.shdr_offset(rela) + 40;
    stripped[link..link + 4].copy_from_slice(&0u32.to_le_bytes());

    let (host, mut loader) = counting_loader();
    let module = loader
        .load(ElfBinary::new("stripped.so", &stripped))
        .expect("Failed to load stripped image");
    assert_eq!(module.regions().len(), 2);
    assert_eq!(module.symbols().count(), 0);
    assert!(module.get("answer").is_none());
    drop(module);
    assert_eq!(host.live(), 0);
}

fn assert_each_allocation_failure_is_clean<F>(expected_regions: usize, map: F)
where
    F: Fn(Loader<CountingHost>) -> Result<usize>,
{
    let (_host, loader) = counting_loader();
    assert_eq!(map(loader).unwrap(), expected_regions);

    for fail_at in 1..=expected_regions {
        let host = Arc::new(CountingHost::failing_at(fail_at));
        let loader = Loader::new().with_shared_host(Arc::clone(&host));
        let err = map(loader).expect_err("allocation failure was ignored");
        assert!(matches!(err, Error::Alloc { .. }), "unexpected error: {err}");
        assert_eq!(host.requests(), fail_at);
        assert_eq!(host.frees(), fail_at - 1, "step {fail_at} leaked");
        assert_eq!(host.live(), 0);
    }
}

#[test]
fn allocation_failure_in_each_object_group_releases_everything() {
    let symbols = [
        SymbolDesc::global_func("grp_func", 5),
        SymbolDesc::global_rodata("grp_const", &[9; 16]),
        SymbolDesc::global_object("grp_table", &[1; 8]),
        SymbolDesc::global_bss("grp_scratch", 16),
    ];
    let writer = ObjectWriter::new(Arch::current());
    let with_got = writer
        .write(&[RelocEntry::with_name("grp_table", REL_GOTPCREL)], &symbols)
        .unwrap();
    let without_got = writer
        .write(&[RelocEntry::with_name("grp_table", REL_SYMBOLIC)], &symbols)
        .unwrap();

    // R for .rodata, RX for .text, RW for .data, .bss and the GOT.
    let rw_len = |data: &[u8]| {
        let (_host, mut loader) = counting_loader();
        let raw = loader.map(data).unwrap();
        assert_eq!(raw.regions().len(), 3);
        raw.regions()
            .iter()
            .find(|region| region.prot().contains(ProtFlags::PROT_WRITE))
            .map(|region| region.len())
            .unwrap()
    };
    assert_eq!(rw_len(&with_got.data), rw_len(&without_got.data) + 8);

    assert_each_allocation_failure_is_clean(3, |mut loader| {
        loader.map(&with_got.data).map(|raw| raw.regions().len())
    });
}

#[test]
fn allocation_failure_in_contiguous_layout_releases_everything() {
    let output = two_segment_image();
    assert_each_allocation_failure_is_clean(1, |loader| {
        let mut loader = loader.with_layout(SegmentLayout::Contiguous);
        loader.load(&output.data).map(|module| module.regions().len())
    });
}

#[test]
fn independent_modules_do_not_alias() {
    let first = two_segment_image();
    let second = ImageWriter::new(Arch::current())
        .write(
            &[],
            &[
                SymbolDesc::global_func("answer", 7),
                SymbolDesc::global_bss("counter", 8),
            ],
        )
        .unwrap();
    let (host, mut loader) = counting_loader();
    let a = loader.load(ElfBinary::new("a.so", &first.data)).unwrap();
    let b = loader.load(ElfBinary::new("b.so", &second.data)).unwrap();

    for ra in a.regions() {
        for rb in b.regions() {
            let disjoint =
                ra.base() + ra.len() <= rb.base() || rb.base() + rb.len() <= ra.base();
            assert!(disjoint, "{a:?} and {b:?} overlap");
        }
    }
    assert_ne!(a.get("answer"), b.get("answer"));

    a.unload();
    assert_eq!(host.live(), 2);
    let answer = b.get("answer").unwrap();
    assert_eq!(unsafe { call_u32(answer) }, 7);
    assert!(b.get("greeting").is_none());
    b.unload();
    assert_eq!(host.live(), 0);
}

type Seen = Arc<Mutex<Vec<(usize, usize, usize, ProtFlags)>>>;

struct RecordingHook(Seen);

impl LoadHook for RecordingHook {
    fn call<'a>(&mut self, ctx: &'a LoadHookContext<'a>) -> Result<()> {
        assert_eq!(ctx.name(), "hooked.so");
        assert!(ctx.region().contains(ctx.addr()));
        self.0
            .lock()
            .unwrap()
            .push((ctx.index(), ctx.addr(), ctx.len(), ctx.prot()));
        Ok(())
    }
}

#[test]
fn hook_sees_every_segment() {
    let output = two_segment_image();
    let seen = Seen::default();
    let mut loader = Loader::new()
        .with_host(CountingHost::new())
        .with_hook(RecordingHook(Arc::clone(&seen)));
    let raw = loader
        .map(ElfBinary::new("hooked.so", &output.data))
        .expect("Failed to map");
    assert_eq!(raw.name(), "hooked.so");
    assert!(!raw.is_relocatable());
    let module = raw.relocator().relocate().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let (idx, addr, _, prot) = seen[0];
    assert_eq!(idx, 0);
    assert_eq!(addr, module.regions()[0].base());
    assert_eq!(prot, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);

    let phdr = output.phdr_offset(1);
    let memsz = u64::from_le_bytes(output.data[phdr + 40..phdr + 48].try_into().unwrap());
    let (idx, addr, len, prot) = seen[1];
    assert_eq!(idx, 1);
    assert_eq!(addr, module.regions()[1].base());
    assert_eq!(len, memsz as usize);
    assert_eq!(prot, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
}

struct RejectWritable;

impl LoadHook for RejectWritable {
    fn call<'a>(&mut self, ctx: &'a LoadHookContext<'a>) -> Result<()> {
        if ctx.prot().contains(ProtFlags::PROT_WRITE) {
            return Err(Error::hook(format!("segment {} is writable", ctx.index())));
        }
        Ok(())
    }
}

#[test]
fn hook_error_releases_all_regions() {
    let output = two_segment_image();
    let host = Arc::new(CountingHost::new());
    let mut loader = Loader::new()
        .with_shared_host(Arc::clone(&host))
        .with_hook(RejectWritable);
    let err = loader.load(&output.data).expect_err("hook error was ignored");
    assert_eq!(err, Error::hook("segment 1 is writable"));
    assert_eq!(host.allocs(), 2);
    assert_eq!(host.frees(), 2);
    assert_eq!(host.live(), 0);
}
