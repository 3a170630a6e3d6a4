mod common;

use common::{CountingHost, call_u32, read_i32, read_u64, slot};
use elf_module::{
    Error, LoadedModule, Loader,
    arch::{
        REL_COPY, REL_GOT, REL_IRELATIVE, REL_JUMP_SLOT, REL_PCREL32, REL_RELATIVE, REL_SYMBOLIC,
    },
    input::ElfBinary,
};
use gen_elf::{Arch, ImageWriter, ObjectWriter, RelocEntry, SymbolDesc};
use std::{collections::HashMap, sync::Arc};

const HOST_FUNC_NAME: &str = "host_func";
const HOST_VAR_NAME: &str = "host_var";

extern "C" fn host_func() -> u32 {
    0x5eed
}

static HOST_VAR: [u64; 4] = [1, 2, 3, 4];

fn get_symbol_lookup() -> (
    HashMap<&'static str, usize>,
    Arc<dyn Fn(&str) -> Option<*const ()> + Send + Sync>,
) {
    let symbol_map = HashMap::from([
        (HOST_FUNC_NAME, host_func as *const () as usize),
        (HOST_VAR_NAME, &raw const HOST_VAR as usize),
    ]);
    let lookup_map = symbol_map.clone();
    let lookup = Arc::new(move |name: &str| lookup_map.get(name).map(|&addr| addr as *const ()));
    (symbol_map, lookup)
}

fn counting_loader() -> (Arc<CountingHost>, Loader<CountingHost>) {
    let host = Arc::new(CountingHost::new());
    let loader = Loader::new().with_shared_host(Arc::clone(&host));
    (host, loader)
}

fn local_symbols() -> Vec<SymbolDesc> {
    vec![
        SymbolDesc::global_func("local_func", 11),
        SymbolDesc::global_object("local_var", &[0xAA; 16]),
        SymbolDesc::global_bss("local_bss", 32),
    ]
}

#[test]
fn symbolic_and_relative_relocations() {
    let relocs = [
        RelocEntry::with_name("local_func", REL_SYMBOLIC).with_addend(4),
        RelocEntry::relative(REL_RELATIVE, "local_var").with_addend(2),
        RelocEntry::with_name("local_var", REL_GOT),
        RelocEntry::with_name("local_func", REL_JUMP_SLOT),
        RelocEntry::relative(REL_RELATIVE, "local_bss"),
    ];
    let output = ImageWriter::new(Arch::current())
        .write(&relocs, &local_symbols())
        .expect("Failed to generate ELF");
    let (_host, mut loader) = counting_loader();
    let module = loader
        .load(ElfBinary::new("relocs.so", &output.data))
        .expect("Failed to load");

    let func = module.get("local_func").unwrap() as u64;
    let var = module.get("local_var").unwrap() as u64;
    let bss = module.get("local_bss").unwrap() as u64;
    let expected = [func + 4, var + 2, var, func, bss];
    for (info, expected) in output.relocations.iter().zip(expected) {
        let got = unsafe { read_u64(slot(&module, info)) };
        assert_eq!(got, expected, "wrong value for {info:?}");
    }

    // The data segment is placed independently of the code segment.
    assert!(module.regions()[0].contains(func as usize));
    assert!(module.regions()[1].contains(var as usize));
    let target = unsafe { read_u64(slot(&module, &output.relocations[3])) };
    assert_eq!(unsafe { call_u32(target as *const ()) }, 11);
}

#[test]
fn undefined_symbols_resolve_through_pre_find() {
    let relocs = [
        RelocEntry::with_name(HOST_FUNC_NAME, REL_JUMP_SLOT),
        RelocEntry::with_name(HOST_VAR_NAME, REL_SYMBOLIC).with_addend(8),
        RelocEntry::with_name(HOST_VAR_NAME, REL_GOT),
    ];
    let output = ImageWriter::new(Arch::current())
        .write(
            &relocs,
            &[
                SymbolDesc::undefined_func(HOST_FUNC_NAME),
                SymbolDesc::undefined_object(HOST_VAR_NAME),
            ],
        )
        .unwrap();
    let (symbol_map, symbol_lookup) = get_symbol_lookup();
    let (_host, mut loader) = counting_loader();
    let module = loader
        .map(ElfBinary::new("pre_find.so", &output.data))
        .expect("Failed to map")
        .relocator()
        .pre_find(symbol_lookup)
        .relocate()
        .expect("Failed to relocate");

    let read = |idx: usize| unsafe { read_u64(slot(&module, &output.relocations[idx])) };
    assert_eq!(read(0), symbol_map[HOST_FUNC_NAME] as u64);
    assert_eq!(read(1), symbol_map[HOST_VAR_NAME] as u64 + 8);
    assert_eq!(read(2), symbol_map[HOST_VAR_NAME] as u64);
    assert_eq!(unsafe { call_u32(read(0) as *const ()) }, 0x5eed);
    assert_eq!(unsafe { *(read(1) as *const u64) }, 2);

    // Undefined symbols are not exported.
    assert!(module.get(HOST_FUNC_NAME).is_none());
    assert!(module.deps().is_empty());
}

#[test]
fn dynsym_relocations_use_their_linked_table() {
    let relocs = [
        RelocEntry::with_name("local_func", REL_SYMBOLIC),
        RelocEntry::with_name(HOST_FUNC_NAME, REL_JUMP_SLOT),
        RelocEntry::with_name("local_var", REL_SYMBOLIC).with_addend(1),
    ];
    let mut symbols = local_symbols();
    symbols.push(SymbolDesc::undefined_func(HOST_FUNC_NAME));
    let output = ImageWriter::new(Arch::current())
        .with_dynsym()
        .write(&relocs, &symbols)
        .unwrap();
    assert!(output.section_index(".dynsym").is_some());

    let (symbol_map, symbol_lookup) = get_symbol_lookup();
    let (_host, mut loader) = counting_loader();
    let module = loader
        .map(&output.data)
        .unwrap()
        .relocator()
        .pre_find(symbol_lookup)
        .relocate()
        .expect("Failed to relocate");

    let read = |idx: usize| unsafe { read_u64(slot(&module, &output.relocations[idx])) };
    assert_eq!(read(0), module.get("local_func").unwrap() as u64);
    assert_eq!(read(1), symbol_map[HOST_FUNC_NAME] as u64);
    assert_eq!(read(2), module.get("local_var").unwrap() as u64 + 1);
}

fn provider(loader: &mut Loader<CountingHost>, name: &str) -> LoadedModule<CountingHost> {
    let output = ImageWriter::new(Arch::current())
        .write(
            &[],
            &[
                SymbolDesc::global_func("provided_func", 77),
                SymbolDesc::global_object("provided_var", &[0x11; 8]),
            ],
        )
        .unwrap();
    loader
        .load(ElfBinary::new(name, &output.data))
        .expect("Failed to load provider")
}

#[test]
fn undefined_symbols_resolve_through_scope() {
    let (host, mut loader) = counting_loader();
    let unrelated = loader
        .load(
            &ImageWriter::new(Arch::current())
                .write(&[], &[SymbolDesc::global_func("unrelated", 1)])
                .unwrap()
                .data,
        )
        .unwrap();
    let provider = provider(&mut loader, "libprovider.so");

    let relocs = [
        RelocEntry::with_name("provided_func", REL_JUMP_SLOT),
        RelocEntry::with_name("provided_var", REL_SYMBOLIC),
    ];
    let output = ImageWriter::new(Arch::current())
        .write(
            &relocs,
            &[
                SymbolDesc::undefined_func("provided_func"),
                SymbolDesc::undefined_object("provided_var"),
            ],
        )
        .unwrap();
    let consumer = loader
        .map(ElfBinary::new("consumer.so", &output.data))
        .unwrap()
        .relocator()
        .scope([&unrelated, &provider])
        .relocate()
        .expect("Failed to relocate");

    let func = unsafe { read_u64(slot(&consumer, &output.relocations[0])) };
    assert_eq!(func, provider.get("provided_func").unwrap() as u64);
    let var = unsafe { read_u64(slot(&consumer, &output.relocations[1])) };
    assert_eq!(var, provider.get("provided_var").unwrap() as u64);

    // Only the module that supplied a symbol is kept alive by the consumer.
    assert_eq!(consumer.deps().len(), 1);
    assert!(consumer.deps()[0].ptr_eq(&provider));
    assert_eq!(provider.strong_count(), 2);
    assert_eq!(unrelated.strong_count(), 1);

    drop(unrelated);
    provider.unload();
    assert_eq!(host.live(), 4);
    assert_eq!(unsafe { call_u32(func as *const ()) }, 77);

    consumer.unload();
    assert_eq!(host.live(), 0);
}

#[test]
fn pre_find_takes_precedence_over_scope() {
    let (_host, mut loader) = counting_loader();
    let provider = provider(&mut loader, "libprovider.so");
    let output = ImageWriter::new(Arch::current())
        .write(
            &[RelocEntry::with_name("provided_func", REL_JUMP_SLOT)],
            &[SymbolDesc::undefined_func("provided_func")],
        )
        .unwrap();

    let consumer = loader
        .map(&output.data)
        .unwrap()
        .relocator()
        .pre_find(|name: &str| (name == "provided_func").then_some(host_func as *const ()))
        .scope([&provider])
        .relocate()
        .unwrap();
    let func = unsafe { read_u64(slot(&consumer, &output.relocations[0])) };
    assert_eq!(func, host_func as *const () as u64);
    assert!(consumer.deps().is_empty());
}

#[test]
fn unresolved_symbol_fails_and_releases_regions() {
    let output = ImageWriter::new(Arch::current())
        .write(
            &[RelocEntry::with_name("missing_func", REL_JUMP_SLOT)],
            &[SymbolDesc::undefined_func("missing_func")],
        )
        .unwrap();
    let (host, mut loader) = counting_loader();
    let err = loader.load(&output.data).expect_err("unresolved symbol was accepted");
    match &err {
        Error::Relocation { msg } => assert!(msg.contains("missing_func"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(host.allocs(), 2);
    assert_eq!(host.frees(), 2);
}

#[test]
fn weak_undefined_symbols_resolve_to_zero() {
    let output = ImageWriter::new(Arch::current())
        .write(
            &[RelocEntry::with_name("maybe_func", REL_SYMBOLIC).with_addend(0x10)],
            &[SymbolDesc::undefined_func("maybe_func").weak()],
        )
        .unwrap();
    let (_host, mut loader) = counting_loader();
    let module = loader.load(&output.data).expect("weak undefined must not fail");
    assert_eq!(unsafe { read_u64(slot(&module, &output.relocations[0])) }, 0x10);
}

#[test]
fn unsupported_relocation_types_fail() {
    for r_type in [REL_COPY, REL_IRELATIVE] {
        let output = ImageWriter::new(Arch::current())
            .write(
                &[RelocEntry::with_name("local_var", r_type)],
                &local_symbols(),
            )
            .unwrap();
        let (host, mut loader) = counting_loader();
        let err = loader.load(&output.data).expect_err("unsupported type was applied");
        assert!(matches!(err, Error::Relocation { .. }), "unexpected error: {err}");
        assert_eq!(host.live(), 0);
    }
}

#[test]
fn object_file_relocations() {
    let relocs = [
        RelocEntry::with_name("obj_func", REL_SYMBOLIC),
        // Against the section symbol of .data.
        RelocEntry::relative(REL_SYMBOLIC, "obj_var").with_addend(4),
        RelocEntry::with_name(HOST_VAR_NAME, REL_SYMBOLIC),
        RelocEntry::with_name("obj_var", REL_PCREL32).with_addend(6),
    ];
    let output = ObjectWriter::new(Arch::current())
        .write(
            &relocs,
            &[
                SymbolDesc::global_func("obj_func", 21),
                SymbolDesc::global_object("obj_var", &[7; 16]),
                SymbolDesc::undefined_object(HOST_VAR_NAME),
            ],
        )
        .unwrap();
    let (symbol_map, symbol_lookup) = get_symbol_lookup();
    let (host, mut loader) = counting_loader();
    let raw = loader.map(ElfBinary::new("reloc.o", &output.data)).unwrap();
    assert!(raw.is_relocatable());
    let module = raw.relocator().pre_find(symbol_lookup).relocate().unwrap();

    let func = module.get("obj_func").unwrap() as u64;
    let var = module.get("obj_var").unwrap() as u64;
    let read = |idx: usize| unsafe { read_u64(slot(&module, &output.relocations[idx])) };
    assert_eq!(read(0), func);
    assert_eq!(read(1), var + 4);
    assert_eq!(read(2), symbol_map[HOST_VAR_NAME] as u64);
    let place = slot(&module, &output.relocations[3]) as u64;
    let disp = unsafe { read_i32(slot(&module, &output.relocations[3])) };
    assert_eq!(place.wrapping_add_signed(disp as i64), var + 6);
    assert_eq!(unsafe { call_u32(read(0) as *const ()) }, 21);

    drop(module);
    assert_eq!(host.live(), 0);
}

#[test]
fn relative_relocations_are_rejected_in_objects() {
    let output = ObjectWriter::new(Arch::current())
        .write(
            &[RelocEntry::relative(REL_RELATIVE, "obj_var")],
            &[SymbolDesc::global_object("obj_var", &[0; 8])],
        )
        .unwrap();
    let (host, mut loader) = counting_loader();
    let err = loader.load(&output.data).expect_err("relative relocation in an object");
    assert!(matches!(err, Error::Relocation { .. }), "unexpected error: {err}");
    assert_eq!(host.live(), 0);
}

#[test]
fn common_symbols_are_rejected() {
    let output = ObjectWriter::new(Arch::current())
        .write(&[], &[SymbolDesc::common("shared_buf", 64)])
        .unwrap();
    let (host, mut loader) = counting_loader();
    let err = loader.load(&output.data).expect_err("common symbol was accepted");
    match &err {
        Error::Relocation { msg } => {
            assert!(msg.contains("shared_buf"), "{msg}");
            assert!(msg.contains("-fno-common"), "{msg}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(host.live(), 0);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn gotpcrel_allocates_one_slot_per_symbol() {
    use elf_module::arch::REL_GOTPCREL;

    let relocs = [
        RelocEntry::with_name(HOST_VAR_NAME, REL_GOTPCREL).with_addend(-4),
        RelocEntry::with_name(HOST_VAR_NAME, REL_GOTPCREL).with_addend(-4),
        RelocEntry::with_name("obj_var", REL_GOTPCREL).with_addend(-4),
    ];
    let output = ObjectWriter::new(Arch::current())
        .write(
            &relocs,
            &[
                SymbolDesc::global_object("obj_var", &[3; 8]),
                SymbolDesc::undefined_object(HOST_VAR_NAME),
            ],
        )
        .unwrap();
    let (symbol_map, symbol_lookup) = get_symbol_lookup();
    let (_host, mut loader) = counting_loader();
    let module = loader
        .map(&output.data)
        .unwrap()
        .relocator()
        .pre_find(symbol_lookup)
        .relocate()
        .unwrap();

    // G + A - P with A = -4: the GOT slot sits at P + 4 + disp.
    let got_slot = |idx: usize| {
        let place = slot(&module, &output.relocations[idx]);
        let disp = unsafe { read_i32(place) };
        (place as u64 + 4).wrapping_add_signed(disp as i64) as *const u8
    };
    assert_eq!(got_slot(0), got_slot(1));
    assert_ne!(got_slot(0), got_slot(2));
    assert_eq!(unsafe { read_u64(got_slot(0)) }, symbol_map[HOST_VAR_NAME] as u64);
    assert_eq!(
        unsafe { read_u64(got_slot(2)) },
        module.get("obj_var").unwrap() as u64
    );
    assert!(module.contains(got_slot(0) as usize));
}
