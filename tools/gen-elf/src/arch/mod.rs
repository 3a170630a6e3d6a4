mod aarch64;
mod riscv64;
mod x86_64;

use elf::abi::{EM_AARCH64, EM_RISCV, EM_X86_64};

/// Target architecture of the generated files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    /// The architecture the test suite runs on.
    pub fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "riscv64") {
            Arch::Riscv64
        } else {
            panic!("unsupported host architecture")
        }
    }

    pub fn machine(self) -> u16 {
        match self {
            Arch::X86_64 => EM_X86_64,
            Arch::Aarch64 => EM_AARCH64,
            Arch::Riscv64 => EM_RISCV,
        }
    }

    /// Machine code of `fn() -> u32 { value }` for the platform C ABI.
    pub(crate) fn return_const(self, value: u32) -> Vec<u8> {
        match self {
            Arch::X86_64 => x86_64::return_const(value),
            Arch::Aarch64 => aarch64::return_const(value),
            Arch::Riscv64 => riscv64::return_const(value),
        }
    }
}
