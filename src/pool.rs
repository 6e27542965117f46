//! A single-buffer heap whose [`Arena`] lives at the front of the buffer it
//! manages.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use log::debug;
use static_assertions::const_assert;

use crate::align::{align_up, DEFAULT_ALIGN};
use crate::arena::{Arena, HeapState};
use crate::blocklist::{BlockList, Stats, Validity};
use crate::error::{AllocError, ErrFlag, InitError};
use crate::region::{Region, MIN_REGION_SIZE};

/// Bytes reserved at the aligned front of a pool buffer for its root.
pub const ROOT_SIZE: usize = align_up(size_of::<Arena>(), DEFAULT_ALIGN);
const_assert!(align_of::<Arena>() <= DEFAULT_ALIGN);

/// An [`Arena`] stored inside the buffer it manages.
///
/// The root is placed once, at construction, and the handle keeps a pointer
/// to it. A `Pool` borrows its buffer for its whole life, and is neither
/// `Send` nor `Sync`.
pub struct Pool<'buf> {
    root: NonNull<Arena>,
    _buffer: PhantomData<&'buf mut [u8]>,
}

impl<'buf> Pool<'buf> {
    /// Smallest buffer that can become a pool regardless of its alignment.
    pub const MIN_BUFFER_SIZE: usize = DEFAULT_ALIGN - 1 + ROOT_SIZE + MIN_REGION_SIZE;

    /// Set up a pool over `buffer`. Its previous contents are ignored.
    pub fn new(buffer: &'buf mut [u8]) -> Result<Self, InitError> {
        let len = buffer.len();
        let start = buffer.as_mut_ptr();
        let skip = start.align_offset(DEFAULT_ALIGN);
        let min = skip.saturating_add(ROOT_SIZE + MIN_REGION_SIZE);
        if len < min {
            return Err(InitError::BufferTooSmall { len, min });
        }

        // SAFETY: `skip + ROOT_SIZE` is within `buffer`, the root is aligned,
        // and the region after it is exclusively borrowed for `'buf`.
        unsafe {
            let root = start.add(skip).cast::<Arena>();
            root.write(Arena::new());
            let region = Region::new(start.add(skip + ROOT_SIZE), len - skip - ROOT_SIZE);
            (*root).init(&[region])?;
            debug!("Pool root at {:p}, {} bytes managed", root, (*root).total_size());
            Ok(Pool {
                root: NonNull::new_unchecked(root),
                _buffer: PhantomData,
            })
        }
    }

    fn arena(&self) -> &Arena {
        unsafe { self.root.as_ref() }
    }

    fn arena_mut(&mut self) -> &mut Arena {
        unsafe { self.root.as_mut() }
    }

    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.arena_mut().malloc(size)
    }

    pub fn aligned_alloc(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.arena_mut().aligned_alloc(align, size)
    }

    /// # Safety
    ///
    /// See [`Arena::try_realloc`].
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.arena_mut().realloc(ptr, size)
    }

    /// # Safety
    ///
    /// See [`Arena::try_realloc`].
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        self.arena_mut().free(ptr)
    }

    pub fn try_malloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.arena_mut().try_malloc(size)
    }

    pub fn try_aligned_alloc(
        &mut self,
        align: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.arena_mut().try_aligned_alloc(align, size)
    }

    /// # Safety
    ///
    /// See [`Arena::try_realloc`].
    pub unsafe fn try_realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        self.arena_mut().try_realloc(ptr, size)
    }

    /// # Safety
    ///
    /// See [`Arena::try_realloc`].
    pub unsafe fn try_free(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), AllocError> {
        self.arena_mut().try_free(ptr)
    }

    /// # Safety
    ///
    /// See [`Arena::usable_size`].
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.arena().usable_size(ptr)
    }

    pub fn state(&mut self) -> HeapState {
        self.arena_mut().state()
    }

    pub fn total_size(&self) -> usize {
        self.arena().total_size()
    }

    pub fn remain_size(&self) -> usize {
        self.arena().remain_size()
    }

    pub fn err_flag(&self) -> ErrFlag {
        self.arena().err_flag()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.arena().stats()
    }

    pub fn block_list(&self) -> Option<&BlockList> {
        self.arena().block_list()
    }
}

impl fmt::Debug for Pool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("root", &self.root)
            .field("arena", self.arena())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec;

    use test_log::test;

    use crate::align::align_down;
    use crate::blocklist::HEADER_SIZE;

    #[test]
    fn test_pool() {
        let mut buffer = vec![0u8; 4096];
        let start = buffer.as_ptr().addr();
        let mut pool = Pool::new(&mut buffer).unwrap();

        let base = pool.block_list().unwrap().base();
        let root = align_up(start, DEFAULT_ALIGN);
        assert_eq!(base, root + ROOT_SIZE);
        assert_eq!(
            pool.total_size(),
            align_down(start + 4096 - base, DEFAULT_ALIGN) - 3 * HEADER_SIZE
        );
        assert_eq!(pool.remain_size(), pool.total_size());

        let a = pool.malloc(100).unwrap();
        assert!(a.as_ptr().addr() > base);
        let a = unsafe { pool.realloc(Some(a), 300) }.unwrap();
        assert_eq!(unsafe { pool.usable_size(a) }, Some(304));
        let b = pool.aligned_alloc(64, 10).unwrap();
        assert_eq!(b.as_ptr().addr() % 64, 0);
        unsafe {
            pool.free(Some(b));
            pool.free(Some(a));
        }
        assert_eq!(pool.remain_size(), pool.total_size());
        assert_eq!(pool.err_flag(), ErrFlag::NoErr);
        assert!(pool.stats().0.is_valid());
    }

    #[test]
    fn test_buffer_too_small() {
        let mut buffer = vec![0u64; ROOT_SIZE / 8];
        let len = buffer.len() * 8;
        let bytes =
            unsafe { core::slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut u8, len) };
        assert_eq!(
            Pool::new(bytes).err(),
            Some(InitError::BufferTooSmall {
                len,
                min: ROOT_SIZE + MIN_REGION_SIZE,
            })
        );

        let mut buffer = vec![0u8; Pool::MIN_BUFFER_SIZE];
        assert!(Pool::new(&mut buffer).is_ok());
    }

    #[test]
    fn test_pool_corruption_is_sticky() {
        let mut buffer = vec![0u8; 1024];
        let mut pool = Pool::new(&mut buffer).unwrap();
        let a = pool.malloc(16).unwrap();
        let bogus = unsafe { NonNull::new_unchecked(a.as_ptr().add(8)) };
        assert!(matches!(
            unsafe { pool.try_free(Some(bogus)) },
            Err(AllocError::Corrupted { .. })
        ));
        assert_eq!(pool.err_flag(), ErrFlag::OverWrite);
        assert!(pool.malloc(8).is_none());
    }
}
