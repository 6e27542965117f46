//! The free list: an address-ordered chain of free blocks, threaded through
//! headers that live in the managed memory itself.
//!
//! Every block, free or allocated, starts with a two-word header:
//!
//! ```text
//!   offset ┌──────────────┬──────────────┬─────────────────────────┐
//!          │ size: usize  │ link: usize  │ payload (`size` bytes)  │
//!          └──────────────┴──────────────┴─────────────────────────┘
//!          ◄────────── HEADER_SIZE ──────►
//! ```
//!
//! `size` is the payload size, full width. `link` is either the offset of
//! the next free block, a tail marker (only on the end sentinel), or the
//! allocated marker meaning "not on any list".
//!
//! Offsets are measured from the arena base, which is the address of the
//! start sentinel. The chain always begins at the start sentinel (offset 0)
//! and ends at the end sentinel; both have a zero-sized payload and are never
//! merged with a neighbor.

use core::fmt;
use core::mem::{align_of, size_of};
use core::ops::Range;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

use crate::align::{align_up, DEFAULT_ALIGN};

#[repr(C)]
#[derive(Copy, Clone)]
struct Header {
    size: usize,
    link: usize,
}

/// Bytes reserved in front of every payload.
pub const HEADER_SIZE: usize = align_up(size_of::<Header>(), DEFAULT_ALIGN);
const_assert!(HEADER_SIZE >= size_of::<Header>());
const_assert!(HEADER_SIZE % DEFAULT_ALIGN == 0);
const_assert!(align_of::<Header>() <= DEFAULT_ALIGN);

/// Smallest payload handed out, and smallest payload kept on the free list.
pub const MIN_PAYLOAD: usize = HEADER_SIZE * 2;

/// Smallest header-plus-payload span that can stand alone as a free block.
pub const MIN_NODE: usize = HEADER_SIZE + MIN_PAYLOAD;

/// Offset of the start sentinel.
pub const START: usize = 0;

const LINK_ALLOCATED: usize = usize::MAX;
const LINK_TAIL: usize = usize::MAX - 1;

/// The decoded `link` word of a header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// On the free list, pointing at the next free block. `None` only on the
    /// end sentinel.
    Free(Option<usize>),
    /// Handed out to a caller; not on any list.
    Allocated,
}

impl BlockState {
    fn encode(self) -> usize {
        match self {
            BlockState::Free(Some(next)) => next,
            BlockState::Free(None) => LINK_TAIL,
            BlockState::Allocated => LINK_ALLOCATED,
        }
    }

    fn decode(link: usize) -> Self {
        match link {
            LINK_ALLOCATED => BlockState::Allocated,
            LINK_TAIL => BlockState::Free(None),
            next => BlockState::Free(Some(next)),
        }
    }
}

/// The in-band metadata does not describe a well-formed chain. `offset` is
/// the block (relative to the arena base) where the problem was found.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Corruption {
    pub offset: usize,
}

/// Write a header at absolute address `addr`.
///
/// # Safety
///
/// `addr` must be aligned to `DEFAULT_ALIGN`, valid for writes of
/// `HEADER_SIZE` bytes, and carry exposed provenance (see
/// [`region`](crate::region)).
pub(crate) unsafe fn write_header(addr: usize, size: usize, state: BlockState) {
    let header = Header {
        size,
        link: state.encode(),
    };
    ptr::with_exposed_provenance_mut::<Header>(addr).write(header);
}

/// A free block as seen while walking the list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeBlock {
    /// Offset of the block header from the arena base.
    pub offset: usize,
    /// Payload size in bytes.
    pub size: usize,
}

/// An enum for easy comparison of blocks and their order
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

impl FreeBlock {
    /// The offsets covered by this block, header included.
    pub fn span(&self) -> Range<usize> {
        self.offset..(self.offset + HEADER_SIZE + self.size)
    }

    fn relation(&self, other: &Self) -> Relation {
        let self_range = self.span();
        let other_range = other.span();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// A view of a sentinel-bounded free list.
///
/// The list itself lives in the managed memory; this is just its base
/// address and the offset of the end sentinel. It is not `Clone`: outside
/// the crate it is only reachable by reference, through the arena that owns
/// the memory.
///
/// Invariants, while the owning arena is healthy:
///
/// - Links strictly increase, from `START` to `end`.
/// - Every real free block has a size that is a multiple of `DEFAULT_ALIGN`.
/// - No two real free blocks are physically adjacent.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockList {
    base: usize,
    end: usize,
}

impl BlockList {
    /// # Safety
    ///
    /// `base` must be the address of a start sentinel header whose chain ends
    /// at `base + end`, and all memory reachable through the chain must stay
    /// valid and exclusively owned by the list for as long as it is used.
    pub(crate) unsafe fn from_raw_parts(base: usize, end: usize) -> Self {
        BlockList { base, end }
    }

    /// A second view of the same chain, for the owning arena.
    pub(crate) fn view(&self) -> BlockList {
        BlockList {
            base: self.base,
            end: self.end,
        }
    }

    /// Address of the start sentinel.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Offset of the end sentinel.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Absolute address of the block at `offset`.
    pub fn address(&self, offset: usize) -> usize {
        self.base + offset
    }

    pub fn is_sentinel(&self, node: usize) -> bool {
        node == START || node == self.end
    }

    fn header(&self, node: usize) -> *mut Header {
        ptr::with_exposed_provenance_mut(self.base + node)
    }

    fn read(&self, node: usize) -> Header {
        unsafe { self.header(node).read() }
    }

    pub(crate) fn size(&self, node: usize) -> usize {
        self.read(node).size
    }

    pub(crate) fn state(&self, node: usize) -> BlockState {
        BlockState::decode(self.read(node).link)
    }

    pub(crate) fn set_size(&mut self, node: usize, size: usize) {
        unsafe { (*self.header(node)).size = size }
    }

    pub(crate) fn set_state(&mut self, node: usize, state: BlockState) {
        unsafe { (*self.header(node)).link = state.encode() }
    }

    pub(crate) fn write(&mut self, node: usize, size: usize, state: BlockState) {
        unsafe { write_header(self.base + node, size, state) }
    }

    pub(crate) fn payload_ptr(&self, node: usize) -> NonNull<u8> {
        let ptr = ptr::with_exposed_provenance_mut::<u8>(self.base + node + HEADER_SIZE);
        // The base of a live arena is a real, non-null region address.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Offset one past the payload of `node`.
    pub(crate) fn block_end(&self, node: usize) -> usize {
        node + HEADER_SIZE + self.size(node)
    }

    pub(crate) fn is_adjacent(&self, a: usize, b: usize) -> bool {
        self.block_end(a) == b
    }

    fn can_merge(&self, a: usize, b: usize) -> bool {
        !self.is_sentinel(a) && !self.is_sentinel(b) && self.is_adjacent(a, b)
    }

    /// The successor of `node` on the free list.
    ///
    /// Fails if `node` is not a free block, or its link does not move
    /// strictly forward to an aligned offset within the list bounds.
    pub(crate) fn next(&self, node: usize) -> Result<usize, Corruption> {
        match self.state(node) {
            BlockState::Free(Some(next))
                if next > node && next <= self.end && next % DEFAULT_ALIGN == 0 =>
            {
                Ok(next)
            }
            _ => Err(Corruption { offset: node }),
        }
    }

    /// The last list entry whose successor sits at or after `node`.
    pub(crate) fn predecessor(&self, node: usize) -> Result<usize, Corruption> {
        let mut prev = START;
        loop {
            let next = self.next(prev)?;
            if next >= node {
                return Ok(prev);
            }
            prev = next;
        }
    }

    /// Remove `node`, the successor of `prev`, from the list.
    pub(crate) fn unlink(&mut self, prev: usize, node: usize) -> Result<(), Corruption> {
        let after = self.next(node)?;
        self.set_state(prev, BlockState::Free(Some(after)));
        Ok(())
    }

    /// Attempt to merge `node` with the next block on the list.
    ///
    /// If the next block is a real block that starts exactly where `node`
    /// ends, the two merge and this returns true.
    pub(crate) fn try_merge_next(&mut self, node: usize) -> Result<bool, Corruption> {
        let next = self.next(node)?;
        if !self.can_merge(node, next) {
            return Ok(false);
        }
        let after = self.next(next)?;
        self.set_size(node, self.size(node) + HEADER_SIZE + self.size(next));
        self.set_state(node, BlockState::Free(Some(after)));
        Ok(true)
    }

    /// Insert a block into the list in address order, merging it with its
    /// predecessor and/or successor when they are physically adjacent.
    ///
    /// Returns the number of merges, each of which frees one header's worth
    /// of bytes.
    pub(crate) fn insert_merge(&mut self, node: usize) -> Result<usize, Corruption> {
        let prev = self.predecessor(node)?;
        let next = self.next(prev)?;
        if next == node || self.block_end(prev) > node || self.block_end(node) > next {
            return Err(Corruption { offset: node });
        }

        self.set_state(node, BlockState::Free(Some(next)));
        let (merges, target) = if self.can_merge(prev, node) {
            self.set_size(prev, self.size(prev) + HEADER_SIZE + self.size(node));
            (1, prev)
        } else {
            self.set_state(prev, BlockState::Free(Some(node)));
            (0, node)
        };

        Ok(merges + usize::from(self.try_merge_next(target)?))
    }

    /// Merge every pair of physically contiguous blocks in one pass.
    pub(crate) fn settle(&mut self) -> Result<usize, Corruption> {
        let mut merges = 0;
        let mut node = self.next(START)?;
        while node != self.end {
            if self.try_merge_next(node)? {
                merges += 1;
            } else {
                node = self.next(node)?;
            }
        }
        Ok(merges)
    }

    /// Resolve a payload address handed out by this list back to its header.
    ///
    /// The address must fall inside the list bounds, be aligned, and carry an
    /// allocated header with a plausible size.
    pub(crate) fn allocated_node(&self, addr: usize) -> Result<usize, Corruption> {
        let corrupt = Corruption {
            offset: addr.wrapping_sub(self.base),
        };
        let node = match addr.checked_sub(self.base + HEADER_SIZE) {
            Some(node) => node,
            None => return Err(corrupt),
        };
        if node < HEADER_SIZE || node >= self.end || addr % DEFAULT_ALIGN != 0 {
            return Err(corrupt);
        }

        let header = self.read(node);
        let fits = (node + HEADER_SIZE)
            .checked_add(header.size)
            .map_or(false, |end| end <= self.end);
        if BlockState::decode(header.link) != BlockState::Allocated
            || header.size % DEFAULT_ALIGN != 0
            || !fits
        {
            return Err(corrupt);
        }
        Ok(node)
    }

    /// Iterate over the real free blocks, in address order.
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            list: self,
            next: Some(self.next(START)),
        }
    }

    pub fn len(&self) -> usize {
        self.iter().take_while(Result::is_ok).count()
    }

    pub fn is_empty(&self) -> bool {
        self.next(START) == Ok(self.end)
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<FreeBlock> = None;
        for next in self.iter() {
            let next = match next {
                Ok(block) => block,
                Err(Corruption { offset }) => {
                    match self.state(offset) {
                        BlockState::Free(Some(link)) if link <= offset => {
                            validity.out_of_orders += 1
                        }
                        _ => validity.broken_links += 1,
                    }
                    break;
                }
            };

            match previous.map(|p| p.relation(&next)) {
                Some(Relation::Before) | None => {}
                Some(Relation::AdjacentBefore) => {
                    // Right order, but these should be merged.
                    validity.adjacents += 1;
                }
                Some(Relation::Overlapping) => {
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) | Some(Relation::After) => {
                    validity.out_of_orders += 1;
                }
            }
            if next.size % DEFAULT_ALIGN != 0 {
                validity.misaligned += 1;
            }

            stats.length += 1;
            stats.size += next.size;
            previous = Some(next);
        }

        (validity, stats)
    }
}

/// Iterator over the real free blocks of a [`BlockList`].
///
/// Yields an error, then stops, on the first broken link.
pub struct BlockIter<'list> {
    list: &'list BlockList,
    next: Option<Result<usize, Corruption>>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Result<FreeBlock, Corruption>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = match self.next.take()? {
            Ok(node) => node,
            Err(corruption) => return Some(Err(corruption)),
        };
        if node == self.list.end {
            return None;
        }

        self.next = Some(self.list.next(node));
        Some(Ok(FreeBlock {
            offset: node,
            size: self.list.size(node),
        }))
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self.iter() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            match block {
                Ok(block) => write!(f, "FreeBlock({:#x}, {})", block.offset, block.size)?,
                Err(Corruption { offset }) => write!(f, "<broken at {:#x}>", offset)?,
            }
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks overlapping the block before them.
    pub overlaps: usize,
    /// Number of blocks that are directly adjacent to the block before them,
    /// and not merged.
    pub adjacents: usize,
    /// Number of links that point backwards.
    pub out_of_orders: usize,
    /// Number of links that are neither forward nor a free-list entry. The
    /// walk stops at the first one.
    pub broken_links: usize,
    /// Number of blocks whose size is not a multiple of `DEFAULT_ALIGN`.
    pub misaligned: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.adjacents == 0
            && self.out_of_orders == 0
            && self.broken_links == 0
            && self.misaligned == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Number of real free blocks, and the sum of their payload sizes.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub length: usize,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec;
    use std::vec::Vec;

    use test_log::test;

    const H: usize = HEADER_SIZE;

    // Lay out a list by hand: a start sentinel at 0, the given free blocks,
    // and an end sentinel at `end`.
    fn build(mem: &mut Vec<u64>, blocks: &[(usize, usize)], end: usize) -> BlockList {
        assert!(end + H <= mem.len() * 8);
        let base = mem.as_mut_ptr().expose_provenance();
        let mut list = unsafe { BlockList::from_raw_parts(base, end) };
        list.write(START, 0, BlockState::Free(None));
        list.write(end, 0, BlockState::Free(None));

        let mut prev = START;
        for &(offset, size) in blocks {
            list.write(offset, size, BlockState::Free(None));
            list.set_state(prev, BlockState::Free(Some(offset)));
            prev = offset;
        }
        list.set_state(prev, BlockState::Free(Some(end)));
        list
    }

    fn blocks(list: &BlockList) -> Vec<(usize, usize)> {
        list.iter()
            .map(|b| b.map(|b| (b.offset, b.size)).unwrap())
            .collect()
    }

    #[test]
    fn test_insert_merges_both_neighbors() {
        let mut mem = vec![0u64; 64];
        let mut list = build(&mut mem, &[(H, 2 * H), (7 * H, 2 * H)], 20 * H);
        list.write(4 * H, 2 * H, BlockState::Allocated);

        let merges = list.insert_merge(4 * H).unwrap();
        assert_eq!(merges, 2);
        assert_eq!(blocks(&list), vec![(H, 8 * H)]);
        assert!(list.stats().0.is_valid());
    }

    #[test]
    fn test_insert_without_neighbors() {
        let mut mem = vec![0u64; 64];
        let mut list = build(&mut mem, &[(H, 2 * H), (14 * H, 2 * H)], 20 * H);
        list.write(7 * H, 2 * H, BlockState::Allocated);

        assert_eq!(list.insert_merge(7 * H).unwrap(), 0);
        assert_eq!(blocks(&list), vec![(H, 2 * H), (7 * H, 2 * H), (14 * H, 2 * H)]);
        assert_eq!(list.predecessor(7 * H), Ok(H));
        assert_eq!(list.predecessor(8 * H), Ok(7 * H));
    }

    #[test]
    fn test_insert_never_merges_sentinels() {
        let mut mem = vec![0u64; 64];
        // The only block touches both the start sentinel's (empty) payload and
        // the end sentinel.
        let mut list = build(&mut mem, &[], 4 * H);
        list.write(H, 2 * H, BlockState::Allocated);

        assert_eq!(list.insert_merge(H).unwrap(), 0);
        assert_eq!(blocks(&list), vec![(H, 2 * H)]);
        assert_eq!(list.next(START), Ok(H));
        assert_eq!(list.next(H), Ok(4 * H));
    }

    #[test]
    fn test_double_insert_is_corruption() {
        let mut mem = vec![0u64; 64];
        let mut list = build(&mut mem, &[(H, 2 * H)], 20 * H);
        assert_eq!(list.insert_merge(H), Err(Corruption { offset: H }));
    }

    #[test]
    fn test_settle() {
        let mut mem = vec![0u64; 64];
        let mut list = build(
            &mut mem,
            &[(H, 2 * H), (4 * H, 2 * H), (9 * H, 2 * H)],
            12 * H,
        );
        let (validity, _) = list.stats();
        assert_eq!(validity.adjacents, 1);
        assert!(!validity.is_valid());

        assert_eq!(list.settle(), Ok(1));
        // The last block touches the end sentinel, but stays separate.
        assert_eq!(blocks(&list), vec![(H, 5 * H), (9 * H, 2 * H)]);
        let (validity, stats) = list.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.length, 2);
        assert_eq!(stats.size, 7 * H);
    }

    #[test]
    fn test_backwards_link_detected() {
        let mut mem = vec![0u64; 64];
        let mut list = build(&mut mem, &[(H, 2 * H), (7 * H, 2 * H)], 20 * H);
        list.set_state(7 * H, BlockState::Free(Some(H)));

        assert_eq!(list.next(7 * H), Err(Corruption { offset: 7 * H }));
        assert_eq!(list.predecessor(19 * H), Err(Corruption { offset: 7 * H }));
        let (validity, stats) = list.stats();
        assert_eq!(validity.out_of_orders, 1);
        assert_eq!(stats.length, 2);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_allocated_node_checks() {
        let mut mem = vec![0u64; 64];
        let mut list = build(&mut mem, &[(H, 2 * H)], 20 * H);
        list.write(7 * H, 4 * H, BlockState::Allocated);
        let base = list.base();

        assert_eq!(list.allocated_node(base + 8 * H), Ok(7 * H));
        // Free block.
        assert!(list.allocated_node(base + 2 * H).is_err());
        // Before the first possible block.
        assert!(list.allocated_node(base + H).is_err());
        assert!(list.allocated_node(0).is_err());
        // Misaligned.
        assert!(list.allocated_node(base + 8 * H + 1).is_err());
        // Past the end sentinel.
        assert!(list.allocated_node(base + 40 * H).is_err());

        // A size that runs past the end sentinel is not plausible.
        list.write(7 * H, 40 * H, BlockState::Allocated);
        assert!(list.allocated_node(base + 8 * H).is_err());
    }

    #[test]
    fn test_display() {
        let mut mem = vec![0u64; 64];
        let list = build(&mut mem, &[(H, 2 * H)], 20 * H);
        let shown = std::format!("{}", list);
        assert_eq!(shown, std::format!("BlockList(FreeBlock({:#x}, {}))", H, 2 * H));
        assert!(!list.is_empty());
    }
}
