//! An arena has no lock of its own. These tests pin down what that means for
//! callers: the handle can move between threads, but every mutating call
//! needs `&mut`, so sharing one requires a lock chosen by the caller.

use std::thread;

use region_allocator::{Arena, Pool, Region};
use static_assertions::{assert_impl_all, assert_not_impl_any};
use test_log::test;

// The handle can be moved into a lock, and the lock shared.
assert_impl_all!(Arena: Send, Sync);
assert_impl_all!(spin::Mutex<Arena>: Send, Sync);
// A pool points into its own buffer and stays on the thread that built it.
assert_not_impl_any!(Pool<'static>: Send, Sync);
// Region descriptors carry raw pointers.
assert_not_impl_any!(Region: Send, Sync);

#[test]
fn test_shared_through_lock() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 200;

    let mut mem = vec![0u64; 128 * 1024 / 8];
    let regions = [Region::new(mem.as_mut_ptr() as *mut u8, mem.len() * 8)];
    let arena = unsafe { Arena::from_regions(&regions) }.unwrap();
    let total = arena.total_size();
    let arena = spin::Mutex::new(arena);

    thread::scope(|scope| {
        for t in 0..THREADS {
            let arena = &arena;
            scope.spawn(move || {
                let tag = t as u8 + 1;
                let mut mine = Vec::new();
                for round in 0..ROUNDS {
                    let size = 8 + (round % 16) * 8;
                    let ptr = arena.lock().malloc(size).unwrap();
                    unsafe { ptr.as_ptr().write_bytes(tag, size) };
                    mine.push((ptr, size));

                    if round % 3 == 0 {
                        let (ptr, size) = mine.swap_remove(0);
                        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == tag));
                        unsafe { arena.lock().free(Some(ptr)) };
                    }
                }
                for (ptr, size) in mine {
                    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                    assert!(bytes.iter().all(|&b| b == tag));
                    unsafe { arena.lock().free(Some(ptr)) };
                }
            });
        }
    });

    let mut arena = arena.into_inner();
    let (validity, stats) = arena.stats();
    log::info!("After threads: {:?} {:?}", validity, stats);
    assert!(validity.is_valid());
    assert_eq!(arena.remain_size(), total);
    assert_eq!(arena.state().free_node_count, 1);
}
