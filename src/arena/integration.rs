//! End-to-end scenarios wiring registry, routing, tally and back-end
//! together.  These need the real jemalloc back-end: without it accounting
//! is disabled and every readout is zero.

#[cfg(all(test, feature = "jemalloc", not(any(loom, miri))))]
mod tests {
    use crate::arena::facade::{ArenaMalloc, ClientGuard};
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;
    use crate::sync::Arc;

    #[test]
    fn test_basic_usage() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let sz1 = ArenaMalloc::precise_allocated(&client);

        // 1) Track an allocation.
        ArenaMalloc::switch_to_client(&client).unwrap();
        let p = unsafe { ArenaMalloc::malloc(4096) };
        assert!(!p.is_null());
        ArenaMalloc::switch_from_client();

        let sz2 = ArenaMalloc::precise_allocated(&client);
        assert!(sz1 < sz2);

        // 2) Allocation outside of switch_to/from is not accounted.
        let p2 = unsafe { ArenaMalloc::malloc(4096) };
        assert_eq!(sz2, ArenaMalloc::precise_allocated(&client));

        // 3) Track the deallocation.
        ArenaMalloc::switch_to_client(&client).unwrap();
        unsafe { ArenaMalloc::free(p) };
        ArenaMalloc::switch_from_client();
        let sz3 = ArenaMalloc::precise_allocated(&client);
        assert!(sz3 < sz2);
        assert_eq!(sz3, sz1);

        unsafe { ArenaMalloc::free(p2) };
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_all_alloc_methods_round_trip() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let sz1 = ArenaMalloc::precise_allocated(&client);
        assert_eq!(sz1, 0);

        let p1 = unsafe { ArenaMalloc::malloc(2048) };
        let sz2 = ArenaMalloc::precise_allocated(&client);
        assert!(sz1 < sz2);

        let p2 = unsafe { ArenaMalloc::calloc(10, 100) };
        let sz3 = ArenaMalloc::precise_allocated(&client);
        assert!(sz2 < sz3);

        let p3 = unsafe { ArenaMalloc::realloc(p1, 3121) };
        let sz4 = ArenaMalloc::precise_allocated(&client);
        assert!(sz3 < sz4);

        unsafe { ArenaMalloc::free(p3) };
        let sz5 = ArenaMalloc::precise_allocated(&client);
        assert!(sz5 < sz4);

        unsafe { ArenaMalloc::free(p2) };
        let sz6 = ArenaMalloc::precise_allocated(&client);
        assert!(sz6 < sz5);
        assert_eq!(sz6, 0);

        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_calloc_zero_fills() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let p = unsafe { ArenaMalloc::calloc(64, 8) };
        assert!(!p.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(p, 512) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { ArenaMalloc::free(p) };

        // Overflowing element counts are rejected, not wrapped.
        assert!(unsafe { ArenaMalloc::calloc(usize::MAX, 2) }.is_null());

        drop(_scope);
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_realloc_shrink_returns_bytes() {
        // S3: grow then shrink; the tally follows the usable sizes down.
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let p = unsafe { ArenaMalloc::malloc(1) };
        let prev = ArenaMalloc::precise_allocated(&client);

        let p = unsafe { ArenaMalloc::realloc(p, 100) };
        assert!(ArenaMalloc::precise_allocated(&client) >= prev + 50);
        let prev = ArenaMalloc::precise_allocated(&client);

        let p = unsafe { ArenaMalloc::realloc(p, 1) };
        assert!(ArenaMalloc::precise_allocated(&client) < prev);

        unsafe { ArenaMalloc::free(p) };
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);

        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_realloc_null_degenerates_to_malloc() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let p = unsafe { ArenaMalloc::realloc(std::ptr::null_mut(), 4096) };
        assert!(!p.is_null());
        assert!(ArenaMalloc::precise_allocated(&client) >= 4096);

        unsafe { ArenaMalloc::free(p) };
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);

        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_sized_free_round_trip() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let p = unsafe { ArenaMalloc::malloc(2048) };
        assert!(ArenaMalloc::precise_allocated(&client) >= 2048);
        unsafe { ArenaMalloc::sized_free(p, 2048) };
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);

        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_zero_size_request_is_a_real_allocation() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let p = unsafe { ArenaMalloc::malloc(0) };
        assert!(!p.is_null());
        assert!(ArenaMalloc::precise_allocated(&client) >= 8);
        unsafe { ArenaMalloc::sized_free(p, 0) };
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);

        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_strdup_round_trip() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let source = std::ffi::CString::new("tracked duplicate").unwrap();
        let copy = unsafe { ArenaMalloc::strdup(source.as_ptr()) };
        assert!(!copy.is_null());
        assert!(ArenaMalloc::precise_allocated(&client) > 0);
        let round_trip = unsafe { std::ffi::CStr::from_ptr(copy) };
        assert_eq!(round_trip.to_bytes(), b"tracked duplicate");

        unsafe { ArenaMalloc::free(copy.cast()) };
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);

        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_usable_size_does_not_touch_counters() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let p = unsafe { ArenaMalloc::malloc(100) };
        let tracked = ArenaMalloc::precise_allocated(&client);
        let usable = unsafe { ArenaMalloc::usable_size(p) };
        assert!(usable >= 100);
        assert_eq!(tracked, ArenaMalloc::precise_allocated(&client));
        assert_eq!(tracked, usable as u64);

        unsafe { ArenaMalloc::free(p) };
        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_threads_each_with_own_client() {
        // S2: four threads, four clients, balanced traffic on each.
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let mut joined = Vec::new();
        for _ in 0..4 {
            let client = ArenaMalloc::register_client(false).unwrap();
            let handle = thread::spawn(move || {
                let sz1 = ArenaMalloc::precise_allocated(&client);
                ArenaMalloc::switch_to_client(&client).unwrap();
                let p = unsafe { ArenaMalloc::malloc(4096) };
                assert!(sz1 < ArenaMalloc::precise_allocated(&client));
                unsafe { ArenaMalloc::free(p) };
                assert_eq!(sz1, ArenaMalloc::precise_allocated(&client));
                ArenaMalloc::switch_from_client();
                client
            });
            joined.push(handle);
        }

        for handle in joined {
            let client = handle.join().unwrap();
            assert_eq!(ArenaMalloc::precise_allocated(&client), 0);
            ArenaMalloc::unregister_client(client).unwrap();
        }
    }

    #[test]
    fn test_cross_thread_free_balances() {
        // Alloc on one thread, free on another; both bound to the same
        // client, so the tally converges to zero.
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();

        let producer = thread::spawn(move || {
            ArenaMalloc::switch_to_client(&client).unwrap();
            let p = unsafe { ArenaMalloc::malloc(64 * 1024) } as usize;
            ArenaMalloc::switch_from_client();
            p
        });
        let addr = producer.join().unwrap();
        assert!(ArenaMalloc::precise_allocated(&client) >= 64 * 1024);

        let consumer = thread::spawn(move || {
            ArenaMalloc::switch_to_client(&client).unwrap();
            unsafe { ArenaMalloc::free(addr as *mut u8) };
            ArenaMalloc::switch_from_client();
        });
        consumer.join().unwrap();

        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_estimate_converges_past_threshold() {
        // A single allocation larger than the 100 KiB default threshold
        // must surface in the cheap estimate without a precise readout.
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let p = unsafe { ArenaMalloc::malloc(256 * 1024) };
        assert!(ArenaMalloc::estimated_allocated(&client) >= 256 * 1024);

        unsafe { ArenaMalloc::free(p) };
        assert_eq!(ArenaMalloc::estimated_allocated(&client), 0);
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);

        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_contended_churn_ends_at_zero() {
        // Eight threads hammer one client with balanced traffic.
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(true).unwrap();
        let num_threads = 8usize;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    ArenaMalloc::switch_to_client(&client).unwrap();
                    barrier.wait();
                    let mut held = Vec::with_capacity(64);
                    for i in 0..2_000usize {
                        let size = 16 << (i % 6);
                        held.push(unsafe { ArenaMalloc::malloc(size) } as usize);
                        if held.len() == 64 {
                            for p in held.drain(..) {
                                unsafe { ArenaMalloc::free(p as *mut u8) };
                            }
                        }
                    }
                    for p in held {
                        unsafe { ArenaMalloc::free(p as *mut u8) };
                    }
                    ArenaMalloc::switch_from_client();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_arena_allocated_reports_backend_view() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let p = unsafe { ArenaMalloc::malloc(1 << 20) };
        let backend_view = ArenaMalloc::arena_allocated(&client).unwrap();
        assert!(backend_view >= 1 << 20);

        unsafe { ArenaMalloc::free(p) };
        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_total_counter_mirrors_arena_usage() {
        use crate::counter::{NonNegativeCounter, Saturate};

        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let total = Arc::new(NonNegativeCounter::<Saturate>::new(0));
        ArenaMalloc::register_total_counter(&client, total.clone()).unwrap();

        let _scope = ClientGuard::enter(&client).unwrap();
        let p = unsafe { ArenaMalloc::malloc(1 << 20) };

        ArenaMalloc::update_total_counters().unwrap();
        assert!(total.load() >= 1 << 20);

        unsafe { ArenaMalloc::free(p) };
        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_global_alloc_adapter_tracks_and_aligns() {
        use std::alloc::{GlobalAlloc, Layout};

        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&client).unwrap();

        let layout = Layout::from_size_align(4096, 64).unwrap();
        let p = unsafe { ArenaMalloc.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        assert!(ArenaMalloc::precise_allocated(&client) >= 4096);

        unsafe { ArenaMalloc.dealloc(p, layout) };
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);

        let zeroed = unsafe { ArenaMalloc.alloc_zeroed(Layout::from_size_align(256, 16).unwrap()) };
        assert!(unsafe { std::slice::from_raw_parts(zeroed, 256) }
            .iter()
            .all(|&b| b == 0));
        unsafe { ArenaMalloc.dealloc(zeroed, Layout::from_size_align(256, 16).unwrap()) };
        assert_eq!(ArenaMalloc::precise_allocated(&client), 0);

        drop(_scope);
        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_reregistered_slot_starts_from_zero() {
        // Exclusive: relies on first-free-slot scanning to reclaim the same
        // slot.
        let _guard = crate::arena::TEST_MUTEX.write().unwrap();
        let first = ArenaMalloc::register_client(false).unwrap();
        let _scope = ClientGuard::enter(&first).unwrap();

        // Leak a tracked allocation on purpose, then abandon the client.
        let leaked = unsafe { ArenaMalloc::malloc(8192) };
        assert!(ArenaMalloc::precise_allocated(&first) >= 8192);
        drop(_scope);
        ArenaMalloc::unregister_client(first).unwrap();

        // The successor inherits the slot and arena but a clean tally.
        let second = ArenaMalloc::register_client(false).unwrap();
        assert_eq!(second.index(), first.index());
        assert_eq!(ArenaMalloc::precise_allocated(&second), 0);

        // The block still lives in the arena; free it untracked.
        unsafe { ArenaMalloc::free(leaked) };
        ArenaMalloc::unregister_client(second).unwrap();
    }
}
