#![no_std]

//! A freestanding first-fit heap over caller-supplied memory regions.
//!
//! ## Basic Types
//!
//! ### [`Arena`](arena::Arena)
//!
//! An `Arena` manages one or more disjoint [`Region`](region::Region)s as a
//! single heap, keeping all of its bookkeeping inside the regions themselves:
//! `malloc`, `aligned_alloc`, `realloc` and `free`, plus introspection. It has
//! no lock and is not reentrant. Callers that share an arena between threads
//! or interrupt contexts must serialize access themselves, for example by
//! wrapping it in a mutex.
//!
//! Because every mutating call takes `&mut self`, unsynchronized sharing is
//! rejected at compile time:
//!
//! ```compile_fail
//! use region_allocator::Arena;
//!
//! let mut arena = Arena::new();
//! std::thread::scope(|s| {
//!     s.spawn(|| {
//!         arena.malloc(8);
//!     });
//!     s.spawn(|| {
//!         arena.malloc(8);
//!     });
//! });
//! ```
//!
//! ### [`Pool`](pool::Pool)
//!
//! A `Pool` is an `Arena` that lives at the front of the single buffer it
//! manages.
//!
//! ### [`BlockList`](blocklist::BlockList)
//!
//! The address-ordered free list behind every arena, exposed read-only for
//! validation and debugging through [`Arena::stats`] and
//! [`Arena::block_list`].
//!
//! ## Example
//!
//! ```
//! use region_allocator::Pool;
//!
//! let mut buffer = [0u8; 1024];
//! let mut pool = Pool::new(&mut buffer).unwrap();
//! let p = pool.malloc(64).unwrap();
//! assert!(pool.remain_size() < pool.total_size());
//! unsafe { pool.free(Some(p)) };
//! assert_eq!(pool.remain_size(), pool.total_size());
//! ```

#[cfg(test)]
extern crate std;

pub mod align;
pub mod arena;
pub mod blocklist;
pub mod error;
pub mod pool;
pub mod region;

pub use crate::align::DEFAULT_ALIGN;
pub use crate::arena::{Arena, HeapState, MAX_ALLOC_SIZE};
pub use crate::blocklist::{
    BlockList, FreeBlock, Stats, Validity, HEADER_SIZE, MIN_NODE, MIN_PAYLOAD,
};
pub use crate::error::{AllocError, ErrFlag, InitError};
pub use crate::pool::{Pool, ROOT_SIZE};
pub use crate::region::{Region, MIN_REGION_SIZE};
