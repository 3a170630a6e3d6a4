//! Architecture-specific relocation engines.
//!
//! Exactly one engine is compiled in, chosen by the target architecture. Each
//! exports the same set of items: the machine type it accepts, the `REL_*`
//! relocation types of its ABI, the `StaticRelocator` and a name table for
//! diagnostics.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub use riscv64::*;
    }
}
