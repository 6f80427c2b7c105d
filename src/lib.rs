//! A stack-scoped pooling allocator.
//!
//! A [`Pool`] keeps a stack of "Frames".  Push a frame, bump allocate as much
//! as you like from it with [`Pool::malloc`], then pop the frame and every
//! block it acquired goes back to the [`Backend`] at once.  There is no
//! per-allocation free.
//!
//! Blocks come from a pluggable [`Backend`]: [`HeapBackend`] by default,
//! [`MmapBackend`] on unix with the `mmap` feature, or anything implementing
//! the trait.  [`Counting`] wraps any backend and keeps allocation counters.
//!
//! ```
//! use stack_frame_pool::{Counting, HeapBackend, Pool, PoolConfig};
//!
//! let config = PoolConfig::default().with_block_size(4096);
//! let mut pool = Pool::with_config(config, Counting::new(HeapBackend)).unwrap();
//!
//! for _ in 0..3 {
//!     let frame = pool.push().unwrap();
//!
//!     let mut head: *mut usize = std::ptr::null_mut();
//!     for _ in 0..10_000 {
//!         let node = pool.alloc_value(head as usize).unwrap();
//!         head = node.as_ptr();
//!     }
//!
//!     pool.pop_frame(frame);
//! }
//!
//! let stats = pool.backend().stats();
//! assert_eq!(stats.allocations, stats.releases);
//! ```

#![deny(missing_debug_implementations)]
#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
mod block;
pub mod config;
pub mod error;
mod frame;
pub mod pool;
pub mod scope;

#[cfg(all(unix, feature = "mmap"))]
pub use backend::MmapBackend;
pub use backend::{Backend, BackendStats, Counting, HeapBackend, RawChunk};
pub use config::{PoolConfig, DEFAULT_BLOCK_SIZE, DEFAULT_GROWTH_MULTIPLIER, MIN_ALIGN};
pub use error::{DestroyError, OutOfMemory, PoolError, Result};
pub use frame::FrameHandle;
pub use pool::{Pool, PoolStats};
pub use scope::FrameGuard;

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
