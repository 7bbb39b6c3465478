//! Team splitting and rank translation through the runtime context.

mod common;

use common::*;
use symheap_rust::*;

#[test]
fn test_odd_rank_team_mapping() {
    let n = 8;
    let results = run_default_world(n, 16 * KIB, move |ctx| {
        let world = ctx.team_world().unwrap();
        let odd = ctx.team_split_strided(&world, 1, 2, n / 2).unwrap();

        let to_world: Vec<_> = (0..odd.n_pes())
            .map(|k| odd.translate_pe(k, &world))
            .collect();
        let evens_back: Vec<_> = (0..n)
            .step_by(2)
            .map(|rank| world.translate_pe(rank, &odd))
            .collect();
        (ctx.my_pe(), world.my_pe(), odd.my_pe(), odd.n_pes(), to_world, evens_back)
    });

    for (rank, world_pe, odd_pe, size, to_world, evens_back) in results {
        assert_eq!(world_pe, Some(rank));
        assert_eq!(size, n / 2);
        if rank % 2 == 1 {
            assert_eq!(odd_pe, Some((rank - 1) / 2));
        } else {
            assert_eq!(odd_pe, None);
        }
        let expected: Vec<_> = (0..n / 2).map(|k| Some(1 + 2 * k)).collect();
        assert_eq!(to_world, expected);
        assert!(evens_back.iter().all(Option::is_none));
    }
}

#[test]
fn test_team_errors_and_lifecycle() {
    let results = run_default_world(4, 16 * KIB, |ctx| {
        let world = ctx.team_world().unwrap();
        let zero = ctx.team_split_strided(&world, 0, 1, 0).err();
        let no_stride = ctx.team_split_strided(&world, 0, 0, 2).err();
        let overflow = ctx.team_split_strided(&world, 2, 2, 2).err();

        // Teams and heap allocations are independent.
        let pair = ctx.team_split_strided(&world, 0, 2, 2).unwrap();
        let p = ctx.malloc(64).unwrap();
        pair.destroy();
        ctx.free(p).unwrap();
        let again = ctx.team_split_strided(&world, 0, 2, 2).unwrap();
        (zero, no_stride, overflow, again.n_pes(), again.my_pe())
    });

    for (rank, (zero, no_stride, overflow, size, my_pe)) in results.into_iter().enumerate() {
        assert!(matches!(zero, Some(SymHeapError::InvalidArgument { .. })));
        assert!(matches!(no_stride, Some(SymHeapError::InvalidArgument { .. })));
        assert!(matches!(overflow, Some(SymHeapError::InvalidArgument { .. })));
        assert_eq!(size, 2);
        assert_eq!(my_pe, (rank % 2 == 0).then_some(rank / 2));
    }
}

#[test]
fn test_team_requires_initialized_context() {
    let attrs = set_attributes(0, 1, 4096, unique_endpoint("team-uninit")).unwrap();
    let ctx = Context::create(attrs).unwrap();
    assert!(matches!(
        ctx.team_world(),
        Err(SymHeapError::NotInitialized { .. })
    ));
}
