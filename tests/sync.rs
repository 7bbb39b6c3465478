//! Barrier counting, fence ordering, quiet and signalling.

mod common;

use common::*;
use std::sync::Arc;
use std::thread;
use symheap_rust::fabric::{LoadStoreFabric, LocalBootstrap};
use symheap_rust::*;

#[test]
fn test_barrier_counting() {
    let k = 7;
    let n = 4;
    let results = run_default_world(n, 16 * KIB, move |ctx| {
        let mut seen_at_each = Vec::new();
        for round in 1..=k {
            ctx.barrier_all().unwrap();
            let min_seen = (0..ctx.n_pes())
                .map(|peer| ctx.observed_count(peer).unwrap())
                .min()
                .unwrap();
            seen_at_each.push(min_seen >= round);
        }
        let observed: Vec<u64> = (0..ctx.n_pes())
            .map(|peer| ctx.observed_count(peer).unwrap())
            .collect();
        (ctx.barrier_count().unwrap(), observed, seen_at_each)
    });

    for (own, observed, seen_at_each) in results {
        assert_eq!(own, k);
        assert_eq!(observed, vec![k; n]);
        assert!(seen_at_each.into_iter().all(|ok| ok));
    }
}

#[test]
fn test_fence_orders_writes_before_flag() {
    const A: u64 = 0xA;
    const B: u64 = 0xB;
    const C: u64 = 0xC;

    for _ in 0..5 {
        let results = run_default_world(2, 64 * KIB, |ctx| {
            let data = ctx.calloc(3, 8).unwrap().cast::<u64>();
            let flag = ctx.calloc(1, 8).unwrap().cast::<u64>();

            let seen = if ctx.my_pe() == 0 {
                ctx.put_nbi(data, &[A], 1).unwrap();
                ctx.put_nbi(data.add(1), &[B], 1).unwrap();
                ctx.put_nbi(data.add(2), &[C], 1).unwrap();
                ctx.fence().unwrap();
                ctx.signal_set(flag, 1, 1).unwrap();
                None
            } else {
                ctx.wait_until(flag, Cmp::Eq, 1).unwrap();
                Some(ctx.get_vec(data, 3, 1).unwrap())
            };

            ctx.barrier_all().unwrap();
            ctx.free(flag).unwrap();
            ctx.free(data).unwrap();
            seen
        });
        assert_eq!(results[1], Some(vec![A, B, C]));
    }
}

#[test]
fn test_quiet_completes_large_nbi_puts() {
    let results = run_default_world(2, 256 * KIB, |ctx| {
        let count = 10_000;
        let buf = ctx.malloc(count * 4).unwrap().cast::<u32>();
        let peer = 1 - ctx.my_pe();
        let mut src: Vec<u32> = (0..count as u32).map(|i| i ^ ctx.my_pe() as u32).collect();
        ctx.put_nbi(buf, &src, peer).unwrap();
        // The source may be reused as soon as the call returns.
        src.iter_mut().for_each(|v| *v = u32::MAX);
        ctx.quiet().unwrap();
        ctx.barrier_all().unwrap();

        let mine = ctx.get_vec(buf, count, ctx.my_pe()).unwrap();
        ctx.free(buf).unwrap();
        mine.iter()
            .enumerate()
            .all(|(i, &v)| v == i as u32 ^ peer as u32)
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_signal_add_accumulates() {
    let n = 4;
    let results = run_default_world(n, 16 * KIB, move |ctx| {
        let counter = ctx.calloc(1, 8).unwrap().cast::<u64>();
        ctx.signal_add(counter, ctx.my_pe() as u64 + 1, 0).unwrap();
        let total = if ctx.my_pe() == 0 {
            Some(ctx.wait_until(counter, Cmp::Ge, 10).unwrap())
        } else {
            None
        };
        ctx.barrier_all().unwrap();
        ctx.free(counter).unwrap();
        total
    });
    assert_eq!(results[0], Some(10));
}

#[test]
fn test_unreachable_peer_fails_fast() {
    let n = 3;
    let bootstrap = Arc::new(LocalBootstrap::new(n));
    let fabric = Arc::new(LoadStoreFabric::new(n));
    fabric.disconnect(0, 2);

    let handles: Vec<_> = (0..n)
        .map(|rank| {
            let bootstrap = bootstrap.clone();
            let fabric = fabric.clone();
            thread::spawn(move || {
                let attrs = set_attributes(rank, n, 16 * KIB, "custom://unused")
                    .unwrap()
                    .with_config(small_staging_config())
                    .unwrap();
                let ctx = Context::create_with(attrs, bootstrap, fabric).unwrap();
                ctx.init().unwrap();

                let p = ctx.malloc(64).unwrap().cast::<u8>();
                let far = if rank == 0 { 2 } else { 0 };
                let result = if rank == 1 {
                    (ctx.ptr(p, 0).is_some(), None, None)
                } else {
                    let put = ctx.put(p, &[1, 2, 3], far).err();
                    let barrier = ctx.barrier_all().err();
                    (ctx.ptr(p, far).is_some(), put, barrier)
                };
                ctx.free(p).unwrap();
                ctx.finalize().unwrap();
                result
            })
        })
        .collect();

    for (rank, handle) in handles.into_iter().enumerate() {
        let (reachable, put, barrier) = handle.join().unwrap();
        if rank == 1 {
            assert!(reachable);
        } else {
            assert!(!reachable);
            assert!(matches!(put, Some(SymHeapError::UnreachablePeer { .. })));
            assert!(matches!(barrier, Some(SymHeapError::UnreachablePeer { .. })));
        }
    }
}

#[test]
fn test_sync_requires_initialized_context() {
    let attrs = set_attributes(0, 1, 4096, unique_endpoint("sync-uninit")).unwrap();
    let ctx = Context::create(attrs).unwrap();
    assert!(matches!(ctx.barrier_all(), Err(SymHeapError::NotInitialized { .. })));
    assert!(ctx.fence().is_err());
    assert!(ctx.quiet().is_err());
}
