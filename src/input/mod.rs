//! ELF input sources.
//!
//! The loader reads images that already sit in memory. An [`ElfBinary`] pairs
//! such a buffer with the name the module is known by in diagnostics.

use crate::{Result, elf::measure};
use alloc::{
    string::{String, ToString},
    vec::Vec,
};

/// An ELF image backed by an in-memory byte slice.
///
/// The loader never writes to the slice and needs it only during the load; the
/// loaded module keeps no reference to it.
#[derive(Debug, Clone)]
pub struct ElfBinary<'bytes> {
    name: String,
    bytes: &'bytes [u8],
}

impl<'bytes> ElfBinary<'bytes> {
    /// Creates a new memory-based ELF object from a byte slice.
    ///
    /// # Examples
    /// ```rust
    /// use elf_module::input::ElfBinary;
    ///
    /// let data = &[]; // In practice, this would be the bytes of an ELF file
    /// let binary = ElfBinary::new("liba.so", data);
    /// assert_eq!(binary.name(), "liba.so");
    /// ```
    pub fn new(name: &str, bytes: &'bytes [u8]) -> Self {
        Self {
            name: name.to_string(),
            bytes,
        }
    }

    /// Wraps an image known only by its start address.
    ///
    /// The length is derived from the image's own headers: it reaches the end of
    /// the header tables and of every segment and section with file content.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`EHDR_SIZE`](crate::elf::EHDR_SIZE) readable
    /// bytes, every range the header tables describe must be readable, and the
    /// memory must stay valid and unmodified for `'bytes`.
    pub unsafe fn from_raw(name: &str, ptr: *const u8) -> Result<Self> {
        let len = unsafe { measure(ptr)? };
        #[cfg(feature = "log")]
        log::trace!("[{}] measured {:#x} bytes at {:p}", name, len, ptr);
        Ok(Self::new(name, unsafe {
            core::slice::from_raw_parts(ptr, len)
        }))
    }

    /// The name used in diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn bytes(&self) -> &'bytes [u8] {
        self.bytes
    }

    pub(crate) fn into_parts(self) -> (String, &'bytes [u8]) {
        (self.name, self.bytes)
    }
}

/// Conversion into an [`ElfBinary`].
///
/// Unnamed buffers are loaded under the name `"<memory>"`.
pub trait IntoElfBinary<'bytes> {
    fn into_elf_binary(self) -> ElfBinary<'bytes>;
}

impl<'bytes> IntoElfBinary<'bytes> for ElfBinary<'bytes> {
    fn into_elf_binary(self) -> ElfBinary<'bytes> {
        self
    }
}

impl<'bytes> IntoElfBinary<'bytes> for &'bytes [u8] {
    fn into_elf_binary(self) -> ElfBinary<'bytes> {
        ElfBinary::new("<memory>", self)
    }
}

impl<'bytes, const N: usize> IntoElfBinary<'bytes> for &'bytes [u8; N] {
    fn into_elf_binary(self) -> ElfBinary<'bytes> {
        ElfBinary::new("<memory>", self)
    }
}

impl<'bytes> IntoElfBinary<'bytes> for &'bytes Vec<u8> {
    fn into_elf_binary(self) -> ElfBinary<'bytes> {
        ElfBinary::new("<memory>", self)
    }
}
