#[cfg(all(test, not(loom)))]
mod tests {
    use std::ptr::NonNull;

    use crate::alloc::api::{SpanAllocator, SpanAllocatorConfig};
    use crate::alloc::size_class::{VIRTUAL_SPAN_SIZE, blocks_per_span, size_to_class};
    use crate::alloc::span::{SpanHeader, owner_tag};
    use crate::alloc::stats;
    use crate::sync::Arc;
    use crate::sync::atomic::Ordering;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;

    fn allocator() -> SpanAllocator {
        SpanAllocator::with_config(SpanAllocatorConfig {
            span_region_size: VIRTUAL_SPAN_SIZE * 512,
            meta_region_size: 1 << 21,
            ..SpanAllocatorConfig::default()
        })
        .unwrap()
    }

    fn alloc_on(a: &SpanAllocator, core: usize, size: usize) -> NonNull<u8> {
        a.core_buffer(core)
            .allocator
            .allocate(&a.backends(), size)
            .unwrap()
    }

    fn free_on(a: &SpanAllocator, core: usize, p: NonNull<u8>) {
        // Safety: test pointers come from alloc_on on the same instance.
        unsafe { a.core_buffer(core).allocator.free(&a.backends(), p) };
    }

    /// Pointers cross threads as raw addresses.
    struct SendPtrs(Vec<usize>);
    // Safety: the underlying blocks are owned by the sending side until
    // handed over, exactly the producer/consumer contract under test.
    unsafe impl Send for SendPtrs {}

    #[test]
    fn test_producer_consumer_remote_free() {
        // S2: core 0 allocates, core 1 frees.  Every consumer free routes
        // through the block pool, and the producer's next allocations for
        // the class drain it without touching the span pool.
        let _guard = crate::alloc::TEST_MUTEX.write().unwrap();
        let alloc = Arc::new(allocator());
        const COUNT: usize = 1_000;

        let produced: Vec<usize> = (0..COUNT)
            .map(|i| {
                let p = alloc_on(&alloc, 0, 32);
                // Safety: Test code.
                unsafe { p.as_ptr().cast::<u32>().write(i as u32) };
                p.as_ptr() as usize
            })
            .collect();

        let frees_before = stats::BLOCK_POOL_FREES.get();
        let consumer = {
            let alloc = alloc.clone();
            let batch = SendPtrs(produced);
            thread::spawn(move || {
                for (i, addr) in batch.0.iter().enumerate() {
                    let p = NonNull::new(*addr as *mut u8).unwrap();
                    // Safety: Test code.
                    unsafe { assert_eq!(p.as_ptr().cast::<u32>().read(), i as u32) };
                    free_on(&alloc, 1, p);
                }
            })
        };
        consumer.join().unwrap();
        assert_eq!(
            stats::BLOCK_POOL_FREES.get(),
            frees_before + COUNT,
            "every consumer free must take the remote path"
        );

        // Producer refill phase: once the block pool is non-empty, the
        // span pool is not consulted for this class.
        let sc = size_to_class(32);
        let hot_left = alloc.core_buffer(0).allocator.with_class_state(sc, |v| {
            // Safety: Test code.
            unsafe { (*v.hot).flist.len() as usize }
        });
        let gets_before = stats::SPAN_POOL_GETS.get();
        let allocs_before = stats::BLOCK_POOL_ALLOCS.get();
        let mut recovered = Vec::new();
        for _ in 0..hot_left + COUNT {
            recovered.push(alloc_on(&alloc, 0, 32));
        }
        assert_eq!(
            stats::SPAN_POOL_GETS.get(),
            gets_before,
            "block pool must satisfy the refill before the span pool"
        );
        assert_eq!(stats::BLOCK_POOL_ALLOCS.get(), allocs_before + COUNT);

        for p in recovered {
            free_on(&alloc, 0, p);
        }
    }

    #[test]
    fn test_steal_then_reactivate() {
        // S3: core 0 floats a nearly-free span; its last outstanding block
        // is freed remotely; core 1's allocation steals the whole span as
        // a promotion hint.  Core 0 afterwards neither sees the span hot
        // nor reclaims it from its slow list.
        let _guard = crate::alloc::TEST_MUTEX.write().unwrap();
        let alloc = allocator();
        let sc = size_to_class(4096);
        let cap = blocks_per_span(sc);

        // Exhaust span s on core 0, plus one more to demote it to cool.
        let mut blocks = Vec::new();
        for _ in 0..cap {
            blocks.push(alloc_on(&alloc, 0, 4096));
        }
        let overflow = alloc_on(&alloc, 0, 4096);
        // Safety: Test code.
        let s = unsafe { SpanHeader::from_object(blocks[0]) };

        // Free all but one block locally; the span floats once its
        // utilization sinks and ends with a single outstanding block.
        let last = blocks.pop().unwrap();
        for p in blocks {
            free_on(&alloc, 0, p);
        }
        // Safety: Test code.
        let raw = unsafe { (*s.as_ptr()).owner_tag.load(Ordering::Relaxed) };
        assert!(!owner_tag::is_active(raw), "span must be floating");
        assert_eq!(owner_tag::owner(raw), 0);

        // The helper hands the last block back remotely.
        free_on(&alloc, 2, last);

        // Core 1 allocates: the popped block is the span's last
        // outstanding one, so the whole span rides along as a hint.
        let steals_before = stats::SPAN_STEALS.get();
        let stolen_block = alloc_on(&alloc, 1, 4096);
        assert_eq!(stats::SPAN_STEALS.get(), steals_before + 1);
        assert_eq!(
            alloc.core_buffer(1).allocator.with_class_state(sc, |v| v.hot),
            s.as_ptr(),
            "stolen span must be promoted to core 1's hot slot"
        );
        // Safety: Test code.
        let raw = unsafe { (*s.as_ptr()).owner_tag.load(Ordering::Relaxed) };
        assert!(owner_tag::is_active(raw));
        assert_eq!(owner_tag::owner(raw), 1, "adoption re-stamps the owner");

        // Core 1 now serves from the stolen span's freelist.
        let from_stolen = alloc_on(&alloc, 1, 4096);
        // Safety: Test code.
        assert_eq!(unsafe { SpanHeader::from_object(from_stolen) }, s);

        // Core 0's refill walks its slow list, fails to reclaim the stolen
        // span, and falls through to the span pool.
        let mut drain = Vec::new();
        for _ in 0..cap - 1 {
            drain.push(alloc_on(&alloc, 0, 4096));
        }
        let refilled = alloc_on(&alloc, 0, 4096);
        let hot0 = alloc.core_buffer(0).allocator.with_class_state(sc, |v| v.hot);
        assert_ne!(hot0, s.as_ptr(), "core 0 must not see the stolen span hot");
        alloc
            .core_buffer(0)
            .allocator
            .with_class_state(sc, |v| assert_eq!(v.slow_len, 0));

        for p in drain.into_iter().chain([overflow, refilled]) {
            free_on(&alloc, 0, p);
        }
        for p in [stolen_block, from_stolen] {
            free_on(&alloc, 1, p);
        }
    }

    #[test]
    fn test_shutdown_with_remote_blocks_outstanding() {
        // S4: a frontend gives up its spans with 100 blocks outstanding;
        // the blocks are freed remotely and every one is recoverable
        // through the block pool — shutdown loses no memory.
        let _guard = crate::alloc::TEST_MUTEX.write().unwrap();
        let alloc = allocator();
        const COUNT: usize = 100;

        let handed: Vec<_> = (0..COUNT).map(|_| alloc_on(&alloc, 0, 64)).collect();
        // Core 0's last thread exits.
        alloc.core_buffer(0).allocator.clear_spans(&alloc.backends());

        // Every handed-over block now frees on the remote path.
        let frees_before = stats::BLOCK_POOL_FREES.get();
        for p in handed {
            free_on(&alloc, 1, p);
        }
        assert_eq!(stats::BLOCK_POOL_FREES.get(), frees_before + COUNT);

        // Drain: core 1 allocates until all queued blocks resurface.  The
        // residency heuristic interleaves refills, so plenty of headroom:
        // each recovered block may cost a freshly refilled span's worth of
        // hot-path pops.
        let allocs_before = stats::BLOCK_POOL_ALLOCS.get();
        let mut recovered = Vec::new();
        for _ in 0..40_000 {
            if stats::BLOCK_POOL_ALLOCS.get() >= allocs_before + COUNT {
                break;
            }
            recovered.push(alloc_on(&alloc, 1, 64));
        }
        assert!(
            stats::BLOCK_POOL_ALLOCS.get() >= allocs_before + COUNT,
            "remote-freed blocks were lost after shutdown"
        );
        for p in recovered {
            free_on(&alloc, 1, p);
        }
    }

    #[test]
    fn test_block_conservation() {
        // For a quiescent span: freelist length + outstanding blocks +
        // remotely queued blocks add up to the span's capacity.
        let _guard = crate::alloc::TEST_MUTEX.write().unwrap();
        let alloc = allocator();
        let sc = size_to_class(4096);
        let cap = blocks_per_span(sc);

        let mut blocks = Vec::new();
        for _ in 0..cap {
            blocks.push(alloc_on(&alloc, 0, 4096));
        }
        // Safety: Test code.
        let s = unsafe { SpanHeader::from_object(blocks[0]) };

        // 10 local frees, 5 remote frees, the rest outstanding.
        for _ in 0..10 {
            free_on(&alloc, 0, blocks.pop().unwrap());
        }
        let frees_before = stats::BLOCK_POOL_FREES.get();
        for _ in 0..5 {
            free_on(&alloc, 1, blocks.pop().unwrap());
        }
        let queued = stats::BLOCK_POOL_FREES.get() - frees_before;

        // Safety: Test code (no concurrent span traffic).
        let flist_len = unsafe { (*s.as_ptr()).flist.len() as usize };
        let outstanding = blocks.len();
        assert_eq!(flist_len + outstanding + queued, cap);

        for p in blocks {
            free_on(&alloc, 0, p);
        }
    }

    #[test]
    fn test_threaded_stress_mix() {
        // Multiple threads hammer one allocator through the public API
        // with mixed sizes, holding allocations long enough for spans to
        // migrate between frontends.
        let _guard = crate::alloc::TEST_MUTEX.write().unwrap();
        let alloc = Arc::new(allocator());
        let num_threads = 8usize;
        let iters = 200usize;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let alloc = alloc.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let sizes = [16usize, 64, 256, 1024, 4096, 16384, 65536];
                    let mut ptrs = Vec::with_capacity(iters);

                    barrier.wait();

                    for i in 0..iters {
                        let size = sizes[(t + i) % sizes.len()];
                        let p = alloc.allocate(size).unwrap();
                        // Safety: Test code.
                        unsafe {
                            let val = (t * 1000 + i).to_le_bytes()[0];
                            p.as_ptr().write(val);
                            p.as_ptr().add(size - 1).write(val);
                        }
                        ptrs.push((p, size, (t * 1000 + i).to_le_bytes()[0]));

                        // Churn: free half as we go, in FIFO order, so
                        // spans see mixed local and remote frees.
                        if i % 2 == 1 {
                            let (q, qsize, val) = ptrs.remove(0);
                            // Safety: Test code.
                            unsafe {
                                assert_eq!(q.as_ptr().read(), val, "corruption");
                                assert_eq!(q.as_ptr().add(qsize - 1).read(), val);
                                alloc.free(q);
                            }
                        }
                    }

                    for (p, size, val) in ptrs {
                        // Safety: Test code.
                        unsafe {
                            assert_eq!(p.as_ptr().read(), val, "corruption");
                            assert_eq!(p.as_ptr().add(size - 1).read(), val);
                            alloc.free(p);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // The allocator is still coherent afterwards.
        let p = alloc.allocate(128).unwrap();
        // Safety: Test code.
        unsafe { alloc.free(p) };
        alloc.trim();
    }

    #[test]
    fn test_span_round_trip_preserves_block_addresses() {
        // A span cycling hot -> cool -> floating -> reactivated serves the
        // same block addresses again.
        let _guard = crate::alloc::TEST_MUTEX.read().unwrap();
        let alloc = allocator();
        let sc = size_to_class(1024);
        let cap = blocks_per_span(sc);

        let mut first_round: Vec<_> = (0..cap).map(|_| alloc_on(&alloc, 0, 1024)).collect();
        let _overflow = alloc_on(&alloc, 0, 1024);
        first_round.sort_by_key(|p| p.as_ptr() as usize);

        // Float the span, keeping one block outstanding so it is not
        // released to the span pool.
        let keep = first_round[0];
        for p in &first_round[1..] {
            free_on(&alloc, 0, *p);
        }

        // Reactivation: exhaust the hot span, forcing a refill that pulls
        // the span back from the slow list.
        let mut fill = Vec::new();
        for _ in 0..cap - 1 {
            fill.push(alloc_on(&alloc, 0, 1024));
        }
        let mut second_round = Vec::new();
        for _ in 0..cap - 1 {
            second_round.push(alloc_on(&alloc, 0, 1024));
        }
        second_round.push(keep);
        second_round.sort_by_key(|p| p.as_ptr() as usize);
        assert_eq!(
            first_round, second_round,
            "reactivated span must serve the same block addresses"
        );

        for p in second_round.into_iter().chain(fill) {
            free_on(&alloc, 0, p);
        }
    }
}
