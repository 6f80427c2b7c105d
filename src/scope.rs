//! Scoped frames that pop themselves.

use std::ops::{Deref, DerefMut};

use crate::{
    backend::Backend,
    error::Result,
    frame::FrameHandle,
    pool::Pool,
};

/// A frame that is popped when the guard goes out of scope.
///
/// The guard derefs to the [`Pool`], so allocations made through it land in
/// the guarded frame (or in frames nested inside it).
///
/// # Panics
///
/// Dropping the guard panics if frames pushed through it were left on the
/// stack, see [`Pool::pop_frame`].
#[derive(Debug)]
pub struct FrameGuard<'p, B: Backend> {
    pool: &'p mut Pool<B>,
    handle: FrameHandle,
}

impl<B: Backend> FrameGuard<'_, B> {
    /// Handle of the guarded frame.
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }
}

impl<B: Backend> Deref for FrameGuard<'_, B> {
    type Target = Pool<B>;

    fn deref(&self) -> &Self::Target {
        self.pool
    }
}

impl<B: Backend> DerefMut for FrameGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.pool
    }
}

impl<B: Backend> Drop for FrameGuard<'_, B> {
    fn drop(&mut self) {
        self.pool.pop_frame(self.handle);
    }
}

impl<B: Backend> Pool<B> {
    /// Pushes a frame that pops itself when the returned guard is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use stack_frame_pool::Pool;
    ///
    /// let mut pool = Pool::new();
    ///
    /// for _ in 0..3 {
    ///     let mut frame = pool.new_frame().unwrap();
    ///     for _ in 0..1000 {
    ///         frame.malloc(64).unwrap();
    ///     }
    /// }
    ///
    /// assert!(pool.is_empty());
    /// assert_eq!(pool.stats().blocks, 0);
    /// ```
    pub fn new_frame(&mut self) -> Result<FrameGuard<'_, B>> {
        let handle = self.push()?;
        Ok(FrameGuard { pool: self, handle })
    }

    /// Runs `scope` inside a new frame and pops the frame afterwards.
    ///
    /// Everything allocated inside `scope` is released when it returns, so
    /// nothing allocated in it may escape.
    ///
    /// # Examples
    ///
    /// ```
    /// use stack_frame_pool::Pool;
    ///
    /// let mut pool = Pool::new();
    ///
    /// let sum = pool.new_scope(|pool| {
    ///     let numbers = pool.malloc(4 * 8).unwrap().cast::<u64>();
    ///     for i in 0..4 {
    ///         unsafe { numbers.as_ptr().add(i).write(i as u64) };
    ///     }
    ///
    ///     pool.new_scope(|pool| {
    ///         // this frame pops here, its memory is not reachable past this point
    ///         pool.malloc(1 << 20).unwrap();
    ///     }).unwrap();
    ///
    ///     (0..4).map(|i| unsafe { *numbers.as_ptr().add(i) }).sum::<u64>()
    /// }).unwrap();
    ///
    /// assert_eq!(sum, 6);
    /// ```
    pub fn new_scope<R, F>(&mut self, scope: F) -> Result<R>
    where
        F: FnOnce(&mut Pool<B>) -> R,
    {
        let handle = self.push()?;

        let result = scope(self);

        self.pop_frame(handle);
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        backend::{Counting, HeapBackend},
        config::PoolConfig,
    };

    use pretty_assertions::assert_eq;

    fn counting_pool() -> Pool<Counting<HeapBackend>> {
        Pool::with_config(PoolConfig::new(256, 2).unwrap(), Counting::new(HeapBackend)).unwrap()
    }

    #[test]
    pub fn guard_pops_on_drop_test() {
        let mut pool = counting_pool();

        {
            let mut frame = pool.new_frame().unwrap();
            let handle = frame.handle();
            assert_eq!(frame.top(), Some(handle));

            frame.malloc(1000).unwrap();

            let inner = frame.new_frame().unwrap();
            assert_eq!(inner.depth(), 2);
        }

        assert!(pool.is_empty());
        let stats = pool.backend().stats();
        assert_eq!(stats.allocations, stats.releases);
    }

    #[test]
    pub fn scope_returns_value_test() {
        let mut pool = counting_pool();

        let depth = pool
            .new_scope(|pool| pool.new_scope(|pool| pool.depth()).unwrap())
            .unwrap();

        assert_eq!(depth, 2);
        assert!(pool.is_empty());
    }

    #[test]
    pub fn scope_keeps_outer_data_test() {
        let mut pool = counting_pool();

        pool.new_scope(|pool| {
            let value = pool.alloc_value([7u32; 8]).unwrap();

            pool.new_scope(|pool| {
                let junk = pool.malloc(4096).unwrap();
                unsafe { junk.as_ptr().write_bytes(0, 4096) };
            })
            .unwrap();

            assert_eq!(unsafe { *value.as_ptr() }, [7u32; 8]);
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "unbalanced frame stack")]
    pub fn scope_leaking_frame_panics_test() {
        let mut pool = counting_pool();

        pool.new_scope(|pool| {
            pool.push().unwrap();
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "unbalanced frame stack")]
    pub fn guard_with_leaked_frame_panics_test() {
        let mut pool = counting_pool();

        let mut frame = pool.new_frame().unwrap();
        frame.push().unwrap();
    }
}
