//! Host environment abstractions.
//!
//! The loader never talks to an operating system directly. Console output and
//! memory for loaded segments come from a [`Host`], so the same code runs inside
//! a process, a kernel or on bare metal.

use bitflags::bitflags;
use core::ffi::c_int;

pub use traits::{AlignedAlloc, Console, ConsoleWriter, Host};

mod traits;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags for controlling access permissions.
    ///
    /// Host allocations are plain memory, so the flags are advisory: they record
    /// what a region holds and are reported to load hooks.
    pub struct ProtFlags: c_int {
        /// No access allowed.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

impl ProtFlags {
    /// Protection of a program header's `p_flags`.
    pub(crate) fn from_segment_flags(p_flags: u32) -> Self {
        let mut prot = ProtFlags::PROT_NONE;
        if p_flags & elf::abi::PF_R != 0 {
            prot |= ProtFlags::PROT_READ;
        }
        if p_flags & elf::abi::PF_W != 0 {
            prot |= ProtFlags::PROT_WRITE;
        }
        if p_flags & elf::abi::PF_X != 0 {
            prot |= ProtFlags::PROT_EXEC;
        }
        prot
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(feature = "extern-host", not(unix)))] {
        mod extern_host;
        pub use extern_host::{ExternGlobalAlloc, ExternHost, ExternHost as DefaultHost};
    } else {
        mod unix;
        pub use unix::DefaultHost;
    }
}
