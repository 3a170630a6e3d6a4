//! Error types for the loader.
//!
//! Every failure of a load is reported through [`Error`]. A missing symbol is
//! not an error: lookups return `None`.

use alloc::string::{String, ToString};
use core::fmt::Display;

/// Error types used throughout the `elf_module` library.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The ELF header is missing, truncated, or describes an object this target can't run.
    ParseEhdr {
        /// A descriptive message about the error.
        msg: String,
    },

    /// The program header table or one of its segments is malformed.
    ParsePhdr {
        /// A descriptive message about the error.
        msg: String,
    },

    /// The section header table, a string table or the symbol table is malformed.
    ParseShdr {
        /// A descriptive message about the error.
        msg: String,
    },

    /// The host could not provide an aligned region.
    Alloc {
        /// A descriptive message about the error.
        msg: String,
    },

    /// A relocation entry could not be applied.
    Relocation {
        /// A descriptive message about the error.
        msg: String,
    },

    /// A [`LoadHook`](crate::LoadHook) aborted the load.
    Hook {
        /// A descriptive message about the error.
        msg: String,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::ParseEhdr { msg } => write!(f, "failed to parse ELF header: {msg}"),
            Error::ParsePhdr { msg } => write!(f, "failed to parse program headers: {msg}"),
            Error::ParseShdr { msg } => write!(f, "failed to parse section headers: {msg}"),
            Error::Alloc { msg } => write!(f, "allocation failed: {msg}"),
            Error::Relocation { msg } => write!(f, "relocation failed: {msg}"),
            Error::Hook { msg } => write!(f, "load hook failed: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

impl Error {
    /// Builds the error a [`LoadHook`](crate::LoadHook) returns to abort a load.
    pub fn hook(msg: impl ToString) -> Self {
        Error::Hook {
            msg: msg.to_string(),
        }
    }

    /// Returns the message carried by the error, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::ParseEhdr { msg }
            | Error::ParsePhdr { msg }
            | Error::ParseShdr { msg }
            | Error::Alloc { msg }
            | Error::Relocation { msg }
            | Error::Hook { msg } => msg,
        }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_ehdr_error(msg: impl ToString) -> Error {
    Error::ParseEhdr {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_phdr_error(msg: impl ToString) -> Error {
    Error::ParsePhdr {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_shdr_error(msg: impl ToString) -> Error {
    Error::ParseShdr {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn alloc_error(msg: impl ToString) -> Error {
    Error::Alloc {
        msg: msg.to_string(),
    }
}
