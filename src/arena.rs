//! The allocator itself: first-fit allocation with alignment, in-place
//! realloc growth, and coalescing free over a [`BlockList`].
//!
//! An [`Arena`] is a plain handle. It holds no lock and is not reentrant;
//! every mutating operation takes `&mut self`, so sharing one across threads
//! requires a lock chosen by the caller.
//!
//! Corruption of the in-band metadata is detected on a best-effort basis.
//! Once detected, the arena latches [`ErrFlag::OverWrite`] and refuses all
//! further work until it is initialized again.

use core::alloc::Layout;
use core::ptr::{self, null_mut, NonNull};

use log::{debug, error, trace, warn};
use static_assertions::const_assert;

use crate::align::{align_up, checked_align_up, DEFAULT_ALIGN};
use crate::blocklist::{
    BlockList, BlockState, Corruption, Stats, Validity, HEADER_SIZE, MIN_NODE, MIN_PAYLOAD, START,
};
use crate::error::{AllocError, ErrFlag, InitError};
use crate::region::{normalize, Normalized, Region};

/// Largest request an arena will consider. Anything above it fails with
/// [`AllocError::TooLarge`] before the free list is touched.
pub const MAX_ALLOC_SIZE: usize = isize::MAX as usize - MIN_NODE;
const_assert!(MAX_ALLOC_SIZE < usize::MAX - MIN_NODE - DEFAULT_ALIGN);

/// A snapshot of the free list, as returned by [`Arena::state`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapState {
    pub free_node_count: usize,
    pub max_node_size: usize,
    pub min_node_size: usize,
}

/// A heap spanning one or more caller-supplied memory regions.
#[derive(Debug)]
pub struct Arena {
    blocks: Option<BlockList>,
    total_size: usize,
    remain_size: usize,
    err_flag: ErrFlag,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// An arena that manages nothing yet. Every operation fails with
    /// [`ErrFlag::NoInit`] until [`init`](Arena::init) succeeds.
    pub const fn new() -> Self {
        Arena {
            blocks: None,
            total_size: 0,
            remain_size: 0,
            err_flag: ErrFlag::NoInit,
        }
    }

    /// Create an arena over `regions`. See [`init`](Arena::init).
    ///
    /// # Safety
    ///
    /// Same as [`init`](Arena::init).
    pub unsafe fn from_regions(regions: &[Region]) -> Result<Self, InitError> {
        let mut arena = Arena::new();
        arena.init(regions)?;
        Ok(arena)
    }

    /// (Re)initialize this arena over `regions`, discarding any previous
    /// state, including a latched [`ErrFlag::OverWrite`].
    ///
    /// Regions must be listed in ascending address order without overlap;
    /// the list ends at the first [`Region::END`] entry or at the end of the
    /// slice. On failure the arena is left uninitialized.
    ///
    /// # Safety
    ///
    /// Every region must be valid for reads and writes for its whole length,
    /// and must not be used by anything but this arena, or pointers handed
    /// out by it, until the arena is dropped or initialized again.
    pub unsafe fn init(&mut self, regions: &[Region]) -> Result<(), InitError> {
        *self = Arena::new();
        let Normalized { blocks, total } = normalize(regions).map_err(|err| {
            warn!("Arena init failed: {}", err);
            err
        })?;

        debug!(
            "Arena ready at {:#x}: {} bytes in {} blocks",
            blocks.base(),
            total,
            blocks.len()
        );
        self.blocks = Some(blocks);
        self.total_size = total;
        self.remain_size = total;
        self.err_flag = ErrFlag::NoErr;
        Ok(())
    }

    fn list(&self) -> Result<BlockList, AllocError> {
        if !self.err_flag.is_ok() {
            return Err(AllocError::Unavailable(self.err_flag));
        }
        self.blocks
            .as_ref()
            .map(BlockList::view)
            .ok_or(AllocError::Unavailable(ErrFlag::NoInit))
    }

    /// Latch the corruption flag.
    fn poison(&mut self, corruption: Corruption) -> AllocError {
        error!(
            "Heap corruption detected at offset {:#x}; arena disabled",
            corruption.offset
        );
        self.err_flag = ErrFlag::OverWrite;
        AllocError::Corrupted {
            offset: corruption.offset,
        }
    }

    /// Return `node` to the free list, crediting its payload and any headers
    /// reclaimed by merging.
    fn release(&mut self, list: &mut BlockList, node: usize) -> Result<(), AllocError> {
        let size = list.size(node);
        match list.insert_merge(node) {
            Ok(merges) => {
                self.remain_size += size + merges * HEADER_SIZE;
                Ok(())
            }
            Err(corruption) => Err(self.poison(corruption)),
        }
    }

    /// Give back the part of allocated `node` beyond `want` bytes, if it is
    /// large enough to stand alone as a free block.
    fn split_tail(
        &mut self,
        list: &mut BlockList,
        node: usize,
        want: usize,
    ) -> Result<(), AllocError> {
        let size = list.size(node);
        if size < MIN_NODE + want {
            return Ok(());
        }
        let tail = node + HEADER_SIZE + want;
        list.set_size(node, want);
        list.write(tail, size - want - HEADER_SIZE, BlockState::Allocated);
        self.release(list, tail)
    }

    /// Find a free block that can host `want` bytes at `align`, take it off
    /// the free list and mark it allocated. The block may be larger than
    /// `want`.
    fn take_fit(
        &mut self,
        list: &mut BlockList,
        align: usize,
        want: usize,
    ) -> Result<Option<usize>, Corruption> {
        let mut prev = START;
        let mut node = list.next(START)?;
        while node != list.end() {
            let size = list.size(node);
            if size >= want + HEADER_SIZE {
                let payload = list.address(node) + HEADER_SIZE;
                let slack_from =
                    |addr: usize| checked_align_up(addr, align).map_or(usize::MAX, |a| a - payload);
                let mut slack = slack_from(payload);
                if slack == 0 {
                    list.unlink(prev, node)?;
                    list.set_state(node, BlockState::Allocated);
                    self.remain_size -= size;
                    return Ok(Some(node));
                }

                if slack < MIN_NODE {
                    // Leave room in front for a free block of its own.
                    slack = slack_from(payload + MIN_NODE);
                }
                if slack <= size && size - slack >= want {
                    let carved = size - slack;
                    let allocated = node + slack;
                    list.set_size(node, slack - HEADER_SIZE);
                    list.write(allocated, carved, BlockState::Allocated);
                    self.remain_size -= carved + HEADER_SIZE;
                    return Ok(Some(allocated));
                }
            }
            prev = node;
            node = list.next(node)?;
        }
        Ok(None)
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// `align` must be a power of two; anything below [`DEFAULT_ALIGN`] is
    /// raised to it.
    pub fn try_aligned_alloc(
        &mut self,
        align: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut list = self.list()?;
        if size == 0 {
            warn!("Rejecting zero-sized allocation");
            return Err(AllocError::ZeroSize);
        }
        if size > MAX_ALLOC_SIZE {
            warn!("Rejecting allocation of {} bytes", size);
            return Err(AllocError::TooLarge(size));
        }
        if !align.is_power_of_two() {
            warn!("Rejecting alignment {}", align);
            return Err(AllocError::BadAlign(align));
        }

        let want = align_up(size.max(MIN_PAYLOAD), DEFAULT_ALIGN);
        let align = align.max(DEFAULT_ALIGN);
        let node = match self.take_fit(&mut list, align, want) {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!("Out of memory: no free block fits {} bytes", size);
                return Err(AllocError::OutOfMemory { size });
            }
            Err(corruption) => return Err(self.poison(corruption)),
        };
        self.split_tail(&mut list, node, want)?;

        let ptr = list.payload_ptr(node);
        trace!(
            "aligned_alloc({}, {}) -> {:p} ({} bytes)",
            align,
            size,
            ptr,
            list.size(node)
        );
        Ok(ptr)
    }

    /// Allocate `size` bytes at the default alignment.
    pub fn try_malloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.try_aligned_alloc(DEFAULT_ALIGN, size)
    }

    /// Resize the allocation at `ptr` to at least `size` bytes.
    ///
    /// `None` behaves as [`try_malloc`](Arena::try_malloc). A `size` of zero
    /// frees `ptr` and returns `Ok(None)`. Blocks never shrink; a block that
    /// is already large enough is returned unchanged. Otherwise the block
    /// grows into a free neighbor when it can, and moves when it cannot. If
    /// the move fails, the original allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None`, or point into memory managed by this arena.
    /// Pointers that were not returned by this arena, or were already freed,
    /// are detected on a best-effort basis and latch [`ErrFlag::OverWrite`].
    pub unsafe fn try_realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let mut list = self.list()?;
        let ptr = match ptr {
            None => return self.try_malloc(size).map(Some),
            Some(ptr) => ptr,
        };
        if size == 0 {
            return self.try_free(Some(ptr)).map(|()| None);
        }
        if size > MAX_ALLOC_SIZE {
            warn!("Rejecting reallocation to {} bytes", size);
            return Err(AllocError::TooLarge(size));
        }

        let node = list
            .allocated_node(ptr.as_ptr().addr())
            .map_err(|c| self.poison(c))?;
        let current = list.size(node);
        if current >= size {
            trace!("realloc({:p}, {}) fits in {} bytes", ptr, size, current);
            return Ok(Some(ptr));
        }

        if self.grow_in_place(&mut list, node, size)? {
            trace!("realloc({:p}, {}) grew in place", ptr, size);
            return Ok(Some(ptr));
        }

        let moved = self.try_malloc(size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), current);
        self.release(&mut list, node)?;
        trace!("realloc({:p}, {}) moved to {:p}", ptr, size, moved);
        Ok(Some(moved))
    }

    /// Absorb the free block directly after `node`, if that gives it room for
    /// `size` bytes.
    fn grow_in_place(
        &mut self,
        list: &mut BlockList,
        node: usize,
        size: usize,
    ) -> Result<bool, AllocError> {
        let want = align_up(size, DEFAULT_ALIGN);
        let (prev, next) = match list
            .predecessor(node)
            .and_then(|prev| Ok((prev, list.next(prev)?)))
        {
            Ok(found) => found,
            Err(corruption) => return Err(self.poison(corruption)),
        };
        if list.is_sentinel(next) || !list.is_adjacent(node, next) {
            return Ok(false);
        }
        let next_size = list.size(next);
        if list.size(node) + HEADER_SIZE + next_size < want {
            return Ok(false);
        }

        list.unlink(prev, next).map_err(|c| self.poison(c))?;
        self.remain_size -= next_size;
        list.set_size(node, list.size(node) + HEADER_SIZE + next_size);
        self.split_tail(list, node, want)?;
        Ok(true)
    }

    /// Return the allocation at `ptr` to the arena. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// Same as [`try_realloc`](Arena::try_realloc).
    pub unsafe fn try_free(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), AllocError> {
        let mut list = self.list()?;
        let ptr = match ptr {
            None => return Ok(()),
            Some(ptr) => ptr,
        };
        let node = list
            .allocated_node(ptr.as_ptr().addr())
            .map_err(|c| self.poison(c))?;
        trace!("free({:p}) returns {} bytes", ptr, list.size(node));
        self.release(&mut list, node)
    }

    /// [`try_malloc`](Arena::try_malloc), with failures reduced to `None`.
    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_malloc(size).ok()
    }

    /// [`try_aligned_alloc`](Arena::try_aligned_alloc), with failures reduced
    /// to `None`.
    pub fn aligned_alloc(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.try_aligned_alloc(align, size).ok()
    }

    /// # Safety
    ///
    /// Same as [`try_realloc`](Arena::try_realloc).
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.try_realloc(ptr, size).ok().flatten()
    }

    /// # Safety
    ///
    /// Same as [`try_realloc`](Arena::try_realloc).
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        // Failures are recorded in the error flag.
        let _ = self.try_free(ptr);
    }

    /// Allocate for `layout`, returning null on failure, in the shape of
    /// [`GlobalAlloc::alloc`](core::alloc::GlobalAlloc::alloc).
    pub fn alloc(&mut self, layout: Layout) -> *mut u8 {
        self.aligned_alloc(layout.align(), layout.size())
            .map_or(null_mut(), NonNull::as_ptr)
    }

    /// Free a pointer from [`alloc`](Arena::alloc). The layout is not needed,
    /// the block header records its size.
    ///
    /// # Safety
    ///
    /// Same as [`try_realloc`](Arena::try_realloc).
    pub unsafe fn dealloc(&mut self, ptr: *mut u8, _layout: Layout) {
        self.free(NonNull::new(ptr))
    }

    /// Payload bytes usable at `ptr`, which may exceed what was requested.
    ///
    /// # Safety
    ///
    /// `ptr` must point into memory managed by this arena.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let list = self.list().ok()?;
        let node = list.allocated_node(ptr.as_ptr().addr()).ok()?;
        Some(list.size(node))
    }

    /// Walk the free list once. All zeros if the arena is unusable, or if the
    /// walk finds corruption (which latches [`ErrFlag::OverWrite`]).
    pub fn state(&mut self) -> HeapState {
        let list = match self.list() {
            Ok(list) => list,
            Err(_) => return HeapState::default(),
        };

        let mut state: Option<HeapState> = None;
        for block in list.iter() {
            let block = match block {
                Ok(block) => block,
                Err(corruption) => {
                    self.poison(corruption);
                    return HeapState::default();
                }
            };
            let state = state.get_or_insert(HeapState {
                free_node_count: 0,
                max_node_size: block.size,
                min_node_size: block.size,
            });
            state.free_node_count += 1;
            state.max_node_size = state.max_node_size.max(block.size);
            state.min_node_size = state.min_node_size.min(block.size);
        }
        state.unwrap_or_default()
    }

    /// Free payload bytes right after the last successful init.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Free payload bytes now. This is exactly the sum of the sizes of the
    /// blocks on the free list.
    pub fn remain_size(&self) -> usize {
        self.remain_size
    }

    /// The sticky error flag. Every `try_*` failure caused by corruption
    /// leaves [`ErrFlag::OverWrite`] here until the next [`init`](Arena::init).
    pub fn err_flag(&self) -> ErrFlag {
        self.err_flag
    }

    /// Check the free list, and measure it.
    pub fn stats(&self) -> (Validity, Stats) {
        match &self.blocks {
            Some(blocks) => blocks.stats(),
            None => Default::default(),
        }
    }

    /// The underlying free list, for inspection. The view borrows the arena,
    /// so it cannot outlive it:
    ///
    /// ```compile_fail
    /// use region_allocator::{Arena, Region};
    ///
    /// let mut mem = [0u64; 64];
    /// let regions = [Region::new(mem.as_mut_ptr() as *mut u8, 512)];
    /// let view = {
    ///     let arena = unsafe { Arena::from_regions(&regions) }.unwrap();
    ///     *arena.block_list().unwrap()
    /// };
    /// drop(mem);
    /// view.stats();
    /// ```
    pub fn block_list(&self) -> Option<&BlockList> {
        self.blocks.as_ref()
    }
}
