//! Caller-supplied memory regions, and the pass that turns them into one
//! sentinel-bounded free list.
//!
//! Regions are listed in ascending address order, optionally terminated by
//! [`Region::END`]. Each surviving region contributes one free block; the
//! first also hosts the start sentinel, and the last gives up its tail to the
//! end sentinel:
//!
//! ```text
//!   region 0                          region 1
//!   ┌───────┬──────────────────┐      ┌─────────────────────┬─────┐
//!   │ start │ block            │ ...  │ block               │ end │
//!   └───────┴──────────────────┘      └─────────────────────┴─────┘
//! ```
//!
//! Regions that happen to be physically contiguous are merged afterwards.
//!
//! Every region address is exposed (`expose_provenance`), and the list
//! reaches its headers through addresses computed from offsets; that is what
//! lets one list span several unrelated allocations.

use core::ptr::null_mut;

use log::debug;

use crate::align::{align_down, checked_align_up, DEFAULT_ALIGN};
use crate::blocklist::{write_header, BlockList, BlockState, HEADER_SIZE, MIN_NODE, MIN_PAYLOAD};
use crate::error::InitError;

/// Smallest region, starting at an aligned address, that can host a working
/// arena on its own: start sentinel, one minimal block, end sentinel.
pub const MIN_REGION_SIZE: usize = 3 * HEADER_SIZE + MIN_PAYLOAD;

/// A range of memory handed to an arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

impl Region {
    /// Terminator for C-style region tables. Entries after it are ignored.
    pub const END: Region = Region {
        base: null_mut(),
        len: 0,
    };

    pub const fn new(base: *mut u8, len: usize) -> Self {
        Region { base, len }
    }

    pub fn from_slice(memory: &mut [u8]) -> Self {
        Region::new(memory.as_mut_ptr(), memory.len())
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_terminator(&self) -> bool {
        self.base.is_null()
    }
}

fn live(regions: &[Region]) -> impl Iterator<Item = (usize, &Region)> {
    regions
        .iter()
        .enumerate()
        .take_while(|(_, region)| !region.is_terminator())
}

/// Reject region lists that are out of order, overlap, or wrap around.
pub(crate) fn check_order(regions: &[Region]) -> Result<(), InitError> {
    let mut prev_end = 0usize;
    for (index, region) in live(regions) {
        let start = region.base.addr();
        let end = start
            .checked_add(region.len)
            .ok_or(InitError::AddressOverflow { index })?;
        if start < prev_end {
            return Err(InitError::Unordered { index });
        }
        prev_end = end;
    }
    Ok(())
}

/// The result of normalizing a region list.
pub(crate) struct Normalized {
    pub blocks: BlockList,
    /// Sum of the payload sizes of every free block.
    pub total: usize,
}

/// Build the free list across `regions`.
///
/// # Safety
///
/// Every region must be valid for reads and writes for its whole length, not
/// be accessed by anything else for as long as the resulting list is in use,
/// and the gaps between regions must not be handed out by anyone as heap
/// pointers.
pub(crate) unsafe fn normalize(regions: &[Region]) -> Result<Normalized, InitError> {
    check_order(regions)?;

    let mut base: Option<usize> = None;
    // Address and payload size of the most recent real block.
    let mut last: Option<(usize, usize)> = None;
    let mut total = 0usize;

    for (index, region) in live(regions) {
        let start = region.base.expose_provenance();
        let aligned = match checked_align_up(start, DEFAULT_ALIGN) {
            Some(aligned) if aligned - start < region.len => aligned,
            _ => {
                debug!("Skipping region {}: consumed by alignment", index);
                continue;
            }
        };
        let usable = align_down(region.len - (aligned - start), DEFAULT_ALIGN);

        let needed = if base.is_none() {
            HEADER_SIZE + MIN_NODE
        } else {
            MIN_NODE
        };
        if usable < needed {
            debug!(
                "Skipping region {} at {:#x}: {} usable bytes, need {}",
                index, aligned, usable, needed
            );
            continue;
        }

        let (arena_base, addr, size) = match base {
            None => {
                base = Some(aligned);
                (aligned, aligned + HEADER_SIZE, usable - 2 * HEADER_SIZE)
            }
            Some(base) => (base, aligned, usable - HEADER_SIZE),
        };

        // Link whatever came before (the start sentinel, or the previous
        // region's block) to this block.
        match last {
            None => write_header(arena_base, 0, BlockState::Free(Some(addr - arena_base))),
            Some((prev, prev_size)) => {
                write_header(prev, prev_size, BlockState::Free(Some(addr - arena_base)))
            }
        }
        write_header(addr, size, BlockState::Free(None));
        debug!("Region {}: block at {:#x} with {} bytes", index, addr, size);

        total += size;
        last = Some((addr, size));
    }

    let (base, (last_addr, last_size)) = match (base, last) {
        (Some(base), Some(last)) => (base, last),
        _ => return Err(InitError::NoUsableRegion),
    };

    // Carve the end sentinel out of the tail of the last block. If what would
    // be left is too small to be useful, the whole block becomes the sentinel.
    let payload = last_addr + HEADER_SIZE;
    let carved = align_down(payload + last_size - HEADER_SIZE, DEFAULT_ALIGN);
    let remaining = carved - payload;
    let end_addr = if remaining >= MIN_PAYLOAD {
        total -= last_size - remaining;
        write_header(last_addr, remaining, BlockState::Free(Some(carved - base)));
        carved
    } else {
        total -= last_size;
        last_addr
    };
    write_header(end_addr, 0, BlockState::Free(None));

    if total == 0 {
        debug!("No capacity left after placing sentinels");
        return Err(InitError::NoUsableRegion);
    }

    let mut blocks = BlockList::from_raw_parts(base, end_addr - base);
    let merges = match blocks.settle() {
        Ok(merges) => merges,
        Err(corruption) => unreachable!(
            "freshly built free list is broken at {:#x}",
            corruption.offset
        ),
    };
    if merges > 0 {
        debug!("Merged {} contiguous regions", merges);
    }
    total += merges * HEADER_SIZE;

    Ok(Normalized { blocks, total })
}
