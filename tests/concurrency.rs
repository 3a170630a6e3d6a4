mod common;

use common::{CountingHost, call_u32};
use elf_module::{Loader, input::ElfBinary};
use gen_elf::{Arch, ImageWriter, SymbolDesc};
use std::{
    sync::{Arc, Barrier},
    thread,
};

const THREADS: usize = 8;

fn symbols() -> Vec<SymbolDesc> {
    (0..16)
        .map(|i| SymbolDesc::global_func(&format!("func_{i}"), i))
        .chain([SymbolDesc::global_bss("shared_bss", 128)])
        .collect()
}

#[test]
fn concurrent_lookups_on_one_module() {
    let output = ImageWriter::new(Arch::current())
        .write(&[], &symbols())
        .expect("Failed to generate ELF");
    let host = Arc::new(CountingHost::new());
    let module = Loader::new()
        .with_shared_host(Arc::clone(&host))
        .load(ElfBinary::new("shared.so", &output.data))
        .expect("Failed to load");

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let module = module.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..100 {
                    let i = (t + round) % 16;
                    let addr = module
                        .get(&format!("func_{i}"))
                        .expect("symbol vanished");
                    assert_eq!(unsafe { call_u32(addr) }, i as u32);
                    assert!(module.get("func_16").is_none());
                }
                module.get("shared_bss").unwrap() as usize
            })
        })
        .collect();

    let expected = module.get("shared_bss").unwrap() as usize;
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
    assert_eq!(module.strong_count(), 1);
    module.unload();
    assert_eq!(host.live(), 0);
}

#[test]
fn concurrent_loads_share_nothing() {
    let output = Arc::new(
        ImageWriter::new(Arch::current())
            .write(&[], &symbols())
            .unwrap(),
    );
    let host = Arc::new(CountingHost::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let output = Arc::clone(&output);
            let host = Arc::clone(&host);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut loader = Loader::new().with_shared_host(host);
                barrier.wait();
                let module = loader
                    .load(ElfBinary::new(&format!("lib{t}.so"), &output.data))
                    .expect("Failed to load");
                let bss = module.get("shared_bss").unwrap() as *mut u8;
                // Each module has its own zero-filled copy.
                unsafe {
                    assert_eq!(*bss, 0);
                    *bss = t as u8 + 1;
                }
                barrier.wait();
                assert_eq!(unsafe { *bss }, t as u8 + 1);
                barrier.wait();
                module.unload();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(host.allocs(), THREADS * 2);
    assert_eq!(host.frees(), THREADS * 2);
}
