//! Error types reported by the arena and the pool.

use core::fmt;

/// Health of an [`Arena`](crate::Arena).
///
/// `OverWrite` is sticky: once latched, every operation fails without
/// touching memory until the arena is initialized again.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrFlag {
    /// The arena is initialized and no corruption has been seen.
    NoErr,
    /// The arena has never been initialized, or its last init failed.
    NoInit,
    /// In-band metadata was found damaged, or a pointer that this arena
    /// does not own was passed to `free`/`realloc`.
    OverWrite,
}

impl ErrFlag {
    pub fn is_ok(self) -> bool {
        self == ErrFlag::NoErr
    }
}

impl fmt::Display for ErrFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrFlag::NoErr => write!(f, "no error"),
            ErrFlag::NoInit => write!(f, "arena not initialized"),
            ErrFlag::OverWrite => write!(f, "heap metadata overwritten"),
        }
    }
}

/// Reasons an arena (or pool) could not be initialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitError {
    /// No region was large enough to host a block after alignment.
    NoUsableRegion,
    /// Region `index` starts before the end of the region listed before it.
    Unordered { index: usize },
    /// Region `index` extends past the end of the address space.
    AddressOverflow { index: usize },
    /// A pool buffer of `len` bytes is smaller than the `min` it needs.
    BufferTooSmall { len: usize, min: usize },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::NoUsableRegion => write!(f, "no usable memory region"),
            InitError::Unordered { index } => {
                write!(f, "region {} is not in ascending address order", index)
            }
            InitError::AddressOverflow { index } => {
                write!(f, "region {} overflows the address space", index)
            }
            InitError::BufferTooSmall { len, min } => {
                write!(f, "pool buffer of {} bytes is below the minimum {}", len, min)
            }
        }
    }
}

/// Reasons an allocation, reallocation or free did not succeed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// A zero-byte allocation was requested.
    ZeroSize,
    /// The request exceeds [`MAX_ALLOC_SIZE`](crate::MAX_ALLOC_SIZE).
    TooLarge(usize),
    /// The requested alignment is not a power of two.
    BadAlign(usize),
    /// No free block can satisfy the request. The arena stays healthy.
    OutOfMemory { size: usize },
    /// The arena is not usable; carries its current flag.
    Unavailable(ErrFlag),
    /// Corruption was detected during this call, at `offset` bytes from the
    /// arena base. The arena is now flagged `OverWrite`.
    Corrupted { offset: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ZeroSize => write!(f, "zero-sized allocation"),
            AllocError::TooLarge(size) => write!(f, "allocation of {} bytes is too large", size),
            AllocError::BadAlign(align) => write!(f, "alignment {} is not a power of two", align),
            AllocError::OutOfMemory { size } => {
                write!(f, "out of memory allocating {} bytes", size)
            }
            AllocError::Unavailable(flag) => write!(f, "arena unavailable: {}", flag),
            AllocError::Corrupted { offset } => {
                write!(f, "heap corruption detected at offset {:#x}", offset)
            }
        }
    }
}
