//! Sources of raw memory for a [`Pool`](crate::Pool).
//!
//! A backend hands out coarse chunks which the pool slices into blocks. It
//! may round a request up (page granularity, alignment, ...) but must report
//! the capacity it actually reserved and must never return less than asked.

use std::{alloc::Layout, fmt, ptr::NonNull};

use crate::error::OutOfMemory;

/// Alignment of chunks handed out by [`HeapBackend`].
pub const CHUNK_ALIGN: usize = 16;

/// A chunk of memory obtained from a [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunk {
    /// First byte of the chunk
    pub ptr: NonNull<u8>,
    /// Usable capacity of the chunk in bytes
    pub size: usize,
}

/// Supplies and reclaims the chunks backing a pool's blocks.
pub trait Backend: fmt::Debug {
    /// Obtains a chunk of at least `size` bytes.
    ///
    /// The returned chunk must be aligned to at least
    /// [`MIN_ALIGN`](crate::MIN_ALIGN) and its `size` must be the capacity
    /// actually reserved.
    fn allocate(&mut self, size: usize) -> Result<RawChunk, OutOfMemory>;

    /// Gives a chunk back to the backend.
    ///
    /// # Safety
    ///
    /// `chunk` must be a value returned by [`allocate`](Backend::allocate) on
    /// this same backend that has not been released yet. Nothing may reference
    /// its memory afterwards.
    unsafe fn release(&mut self, chunk: RawChunk);
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    #[inline]
    fn allocate(&mut self, size: usize) -> Result<RawChunk, OutOfMemory> {
        (**self).allocate(size)
    }

    #[inline]
    unsafe fn release(&mut self, chunk: RawChunk) {
        // Safety: ensured by caller
        unsafe { (**self).release(chunk) }
    }
}

/// Allocates chunks from the global heap allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBackend;

impl HeapBackend {
    fn layout(size: usize) -> Result<Layout, OutOfMemory> {
        Layout::from_size_align(size.max(1), CHUNK_ALIGN).map_err(|_| OutOfMemory { size })
    }
}

impl Backend for HeapBackend {
    fn allocate(&mut self, size: usize) -> Result<RawChunk, OutOfMemory> {
        let layout = Self::layout(size)?;

        // Safety: layout size is never 0
        let ptr = unsafe { std::alloc::alloc(layout) };

        NonNull::new(ptr)
            .map(|ptr| RawChunk { ptr, size })
            .ok_or(OutOfMemory { size })
    }

    unsafe fn release(&mut self, chunk: RawChunk) {
        // allocate() already built this layout once, so it cannot fail here
        if let Ok(layout) = Self::layout(chunk.size) {
            // Safety: chunk came from allocate() with the same layout
            unsafe { std::alloc::dealloc(chunk.ptr.as_ptr(), layout) }
        }
    }
}

/// Maps whole pages straight from the operating system.
///
/// Requests are rounded up to the page size and the rounded size is reported
/// back, so the pool gets to use the slack.
#[cfg(all(unix, feature = "mmap"))]
#[derive(Debug, Clone, Copy)]
pub struct MmapBackend {
    page_size: usize,
}

#[cfg(all(unix, feature = "mmap"))]
impl MmapBackend {
    /// Creates a backend using the system page size.
    pub fn new() -> Self {
        // Safety: sysconf has no preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        MmapBackend {
            page_size: usize::try_from(page_size).unwrap_or(4096),
        }
    }

    /// The granularity requests are rounded to.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn round_to_page(&self, size: usize) -> Option<usize> {
        let pages = size.max(1).checked_add(self.page_size - 1)? / self.page_size;
        pages.checked_mul(self.page_size)
    }
}

#[cfg(all(unix, feature = "mmap"))]
impl Default for MmapBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(unix, feature = "mmap"))]
impl Backend for MmapBackend {
    fn allocate(&mut self, size: usize) -> Result<RawChunk, OutOfMemory> {
        let rounded = self.round_to_page(size).ok_or(OutOfMemory { size })?;

        // Safety: anonymous private mapping, no file descriptor involved
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(OutOfMemory { size });
        }

        NonNull::new(ptr.cast::<u8>())
            .map(|ptr| RawChunk { ptr, size: rounded })
            .ok_or(OutOfMemory { size })
    }

    unsafe fn release(&mut self, chunk: RawChunk) {
        // Safety: chunk is a live mapping of exactly chunk.size bytes
        let result = unsafe { libc::munmap(chunk.ptr.as_ptr().cast(), chunk.size) };

        if result != 0 {
            tracing::error!(
                ptr = ?chunk.ptr,
                size = chunk.size,
                "munmap failed, address space can no longer be trusted"
            );
            std::process::abort();
        }
    }
}

/// Counters kept by a [`Counting`] backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    /// Successful calls to `allocate`
    pub allocations: usize,
    /// Calls to `release`
    pub releases: usize,
    /// Calls to `allocate` that failed
    pub failures: usize,
    /// Total bytes handed out
    pub bytes_allocated: usize,
    /// Total bytes taken back
    pub bytes_released: usize,
    /// Size argument of the most recent `allocate` call
    pub last_request: Option<usize>,
}

impl BackendStats {
    /// Chunks currently held by the pool.
    pub fn live_chunks(&self) -> usize {
        self.allocations - self.releases
    }

    /// Bytes currently held by the pool.
    pub fn live_bytes(&self) -> usize {
        self.bytes_allocated - self.bytes_released
    }
}

/// Wraps a backend and counts the traffic going through it.
///
/// # Examples
///
/// ```
/// use stack_frame_pool::{Counting, HeapBackend, Pool};
///
/// let mut pool = Pool::with_backend(Counting::new(HeapBackend));
///
/// pool.new_scope(|pool| {
///     pool.malloc(128).unwrap();
/// }).unwrap();
///
/// let stats = pool.backend().stats();
/// assert_eq!(stats.allocations, stats.releases);
/// ```
#[derive(Debug, Default, Clone)]
pub struct Counting<B> {
    inner: B,
    stats: BackendStats,
}

impl<B: Backend> Counting<B> {
    /// Starts counting calls made to `inner`.
    pub fn new(inner: B) -> Self {
        Counting {
            inner,
            stats: BackendStats::default(),
        }
    }

    /// Counters collected so far.
    pub fn stats(&self) -> BackendStats {
        self.stats
    }

    /// Resets every counter to zero.
    pub fn reset_stats(&mut self) {
        self.stats = BackendStats::default();
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: Backend> Backend for Counting<B> {
    fn allocate(&mut self, size: usize) -> Result<RawChunk, OutOfMemory> {
        self.stats.last_request = Some(size);

        match self.inner.allocate(size) {
            Ok(chunk) => {
                self.stats.allocations += 1;
                self.stats.bytes_allocated += chunk.size;
                Ok(chunk)
            }
            Err(err) => {
                self.stats.failures += 1;
                Err(err)
            }
        }
    }

    unsafe fn release(&mut self, chunk: RawChunk) {
        self.stats.releases += 1;
        self.stats.bytes_released += chunk.size;

        // Safety: ensured by caller
        unsafe { self.inner.release(chunk) }
    }
}
