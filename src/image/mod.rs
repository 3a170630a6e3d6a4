//! Loaded module representations.
//!
//! A module goes through two states. [`RawModule`] holds the mapped memory of an
//! image whose relocations have not been applied yet; [`Relocator`] binds its
//! undefined symbols and patches it, producing the [`LoadedModule`] handle that
//! owns the memory until the last clone is dropped.

mod loaded;
mod raw;
mod symbol;

pub use loaded::LoadedModule;
pub use raw::{RawModule, Relocator};
pub use symbol::{Symbol, SymbolBind, SymbolKind};

pub(crate) use symbol::{SymbolMap, collect_symbols};
