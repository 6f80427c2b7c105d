//! Error types returned by the [`Pool`](crate::Pool) and its backends.

use std::fmt;

use thiserror::Error;

use crate::{backend::Backend, pool::Pool};

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// A [`Backend`] could not supply a chunk of the requested size.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("backend could not supply {size} bytes")]
pub struct OutOfMemory {
    /// The number of bytes that were requested
    pub size: usize,
}

/// Errors surfaced by [`Pool`] operations.
///
/// Only [`PoolError::Exhausted`] and [`PoolError::ShortChunk`] are runtime
/// conditions; every other variant is caller misuse that was rejected before
/// any state changed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The backend refused to hand out a new block
    #[error("pool exhausted: {0}")]
    Exhausted(#[from] OutOfMemory),

    /// The backend returned less memory than it was asked for
    #[error("backend returned a {actual} byte chunk for a {requested} byte request")]
    ShortChunk {
        /// Bytes requested from the backend
        requested: usize,
        /// Bytes the backend reported
        actual: usize,
    },

    /// A size computation overflowed `usize`
    #[error("allocation of {size} bytes overflows the address space")]
    CapacityOverflow {
        /// The size that could not be represented
        size: usize,
    },

    /// Every frame id of this pool has been handed out
    #[error("frame generation counter exhausted")]
    GenerationExhausted,

    /// The operation requires a frame but the stack is empty
    #[error("the frame stack is empty")]
    EmptyStack,

    /// The backend cannot be swapped once memory has been handed out
    #[error("cannot replace the backend while {frames} frame(s) are on the stack")]
    BackendInUse {
        /// Frames currently on the stack
        frames: usize,
    },

    /// A configuration value was rejected
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong with the value
        message: String,
    },

    /// The requested alignment is not a power of two
    #[error("alignment {align} is not a power of two")]
    InvalidAlignment {
        /// The rejected alignment
        align: usize,
    },
}

/// Returned by [`Pool::destroy`] when frames are still on the stack.
///
/// The pool is handed back untouched so the caller can pop its frames and try
/// again.
#[derive(Error)]
#[error("cannot destroy a pool with {frames} frame(s) still on the stack")]
pub struct DestroyError<B: Backend> {
    /// The pool that was not destroyed
    pub pool: Pool<B>,
    /// Frames that were still on the stack
    pub frames: usize,
}

impl<B: Backend> DestroyError<B> {
    /// Recovers the pool that could not be destroyed.
    pub fn into_pool(self) -> Pool<B> {
        self.pool
    }
}

impl<B: Backend> fmt::Debug for DestroyError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyError")
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}
