//! Reference counting for module lifetimes.
//!
//! Targets without native atomic CAS get `Arc` from `portable-atomic-util`.

#[cfg(not(feature = "portable-atomic"))]
mod inner {
    pub(crate) use alloc::sync::Arc;
}

#[cfg(feature = "portable-atomic")]
mod inner {
    pub(crate) use portable_atomic_util::Arc;
}

pub(crate) use inner::*;
