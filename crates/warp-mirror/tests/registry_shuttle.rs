//! Shuttle-based concurrency tests for a shared memory manager
//!
//! The manager itself is single-threaded; these tests check that the external
//! lock discipline keeps the registry consistent when threads interleave
//! registration, range lookups and erasure.

use shuttle::sync::Mutex;
use shuttle::thread;
use std::sync::Arc;
use warp_mirror::{HostAddr, MemoryManager, MirrorConfig, MirrorError};

const REGION: usize = 0x1000;

fn shared_manager() -> Arc<Mutex<MemoryManager>> {
    Arc::new(Mutex::new(MemoryManager::new(MirrorConfig::default())))
}

fn region(index: usize) -> HostAddr {
    HostAddr::new(0x10_0000 + index * REGION)
}

#[test]
fn test_concurrent_insert_erase_disjoint() {
    shuttle::check_random(
        || {
            let mm = shared_manager();
            let handles: Vec<_> = (0..3)
                .map(|t| {
                    let mm = Arc::clone(&mm);
                    thread::spawn(move || {
                        let addr = region(t);
                        unsafe { mm.lock().unwrap().insert(addr, 64, 8).unwrap() };
                        assert!(mm.lock().unwrap().known(addr.add(8), true));
                        assert_eq!(mm.lock().unwrap().erase(addr).unwrap(), addr);
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            let mm = mm.lock().unwrap();
            assert_eq!(mm.len(), 3);
            assert!(mm.entries().all(|e| e.is_sub_range()));
        },
        200,
    );
}

#[test]
fn test_concurrent_duplicate_insert_single_winner() {
    shuttle::check_random(
        || {
            let mm = shared_manager();
            let addr = region(0);
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let mm = Arc::clone(&mm);
                    thread::spawn(move || unsafe { mm.lock().unwrap().insert(addr, 16, 4) })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1);
            assert!(
                results
                    .iter()
                    .filter_map(|r| r.as_ref().err())
                    .all(|e| matches!(e, MirrorError::Duplicate { .. }))
            );
            assert_eq!(mm.lock().unwrap().len(), 1);
        },
        200,
    );
}

#[test]
fn test_concurrent_erase_and_lookup() {
    shuttle::check_random(
        || {
            let mm = shared_manager();
            let base = region(0);
            unsafe { mm.lock().unwrap().insert(base, 128, 1).unwrap() };

            let eraser = {
                let mm = Arc::clone(&mm);
                thread::spawn(move || mm.lock().unwrap().erase(base).is_ok())
            };
            let reader = {
                let mm = Arc::clone(&mm);
                thread::spawn(move || mm.lock().unwrap().known(base.add(32), true))
            };

            assert!(eraser.join().unwrap());
            let found = reader.join().unwrap();

            // The interior lookup either saw the region and pinned a sub-range,
            // or ran after erasure and found nothing
            let mm = mm.lock().unwrap();
            assert!(!mm.contains(base));
            assert_eq!(mm.len(), usize::from(found));
        },
        200,
    );
}
