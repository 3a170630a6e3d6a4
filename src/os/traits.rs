use core::{fmt, ptr::NonNull};

/// Byte sink for diagnostics.
pub trait Console {
    /// Writes `bytes` to the console. Output is best effort; failures are dropped.
    fn put_bytes(&self, bytes: &[u8]);
}

/// Aligned memory provider for loaded segments.
pub trait AlignedAlloc {
    /// Allocates `size` bytes aligned to `align`.
    ///
    /// `align` is always a non-zero power of two and `size` is non-zero and a
    /// multiple of `align`. Returns `None` when the request can't be satisfied.
    fn aligned_alloc(&self, align: usize, size: usize) -> Option<NonNull<u8>>;

    /// Releases memory returned by [`aligned_alloc`](Self::aligned_alloc).
    ///
    /// # Safety
    /// `ptr` must come from `aligned_alloc` on the same provider and must not be
    /// used after this call.
    unsafe fn free(&self, ptr: NonNull<u8>);
}

/// Everything the loader needs from its environment.
///
/// Implemented for every type that provides both primitives and can be shared
/// between threads.
pub trait Host: Console + AlignedAlloc + Send + Sync {}

impl<T: Console + AlignedAlloc + Send + Sync> Host for T {}

/// [`fmt::Write`] adapter over a [`Console`].
pub struct ConsoleWriter<'a, C: Console + ?Sized>(pub &'a C);

impl<C: Console + ?Sized> fmt::Write for ConsoleWriter<'_, C> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_bytes(s.as_bytes());
        Ok(())
    }
}
