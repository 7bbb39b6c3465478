// Spin up an in-process world and exercise every runtime surface once.
//
// Usage: symheap_selftest [RANKS] [HEAP_BYTES] [CONFIG_FILE]

use anyhow::{bail, Context as _, Result};
use std::thread;
use std::time::Instant;
use symheap_rust::{
    init_logging, set_attributes, Cmp, Context, RmaDescriptor, RuntimeConfig, VERSION,
};

fn rank_main(ctx: &Context) -> Result<()> {
    let me = ctx.my_pe();
    let n = ctx.n_pes();
    let next = (me + 1) % n;

    let ring = ctx.calloc(1024, 8)?.cast::<u64>();
    let flag = ctx.calloc(1, 8)?.cast::<u64>();
    let values: Vec<u64> = (0..1024).map(|i| (me as u64) << 32 | i).collect();

    ctx.put_nbi(ring, &values, next)?;
    ctx.fence()?;
    ctx.signal_set(flag, 1, next)?;
    ctx.wait_until(flag, Cmp::Eq, 1)?;

    let prev = (me + n - 1) % n;
    let received = ctx.get_vec(ring, 1024, me)?;
    for (i, v) in received.iter().enumerate() {
        if *v != (prev as u64) << 32 | i as u64 {
            bail!("rank {}: element {} is {:#x}", me, i, v);
        }
    }

    let world = ctx.team_world()?;
    if n >= 2 {
        let evens = ctx.team_split_strided(&world, 0, 2, n.div_ceil(2))?;
        log::info!("rank {}: {} -> {:?}", me, evens, evens.my_pe());
    }

    let column = ctx.calloc(16, 8)?.cast::<u64>();
    let descriptor = RmaDescriptor::new(16, 1, 64, 1)?;
    ctx.iput(column, &received, descriptor, me)?;
    let sampled = ctx.get_vec(column, 16, me)?;
    if sampled[1] != received[64] {
        bail!("rank {}: strided put misplaced element", me);
    }

    ctx.barrier_all()?;
    let stats = ctx.heap_stats()?;
    log::info!(
        "rank {}: {} allocations, {} bytes free, fragmentation {:.3}",
        me,
        stats.allocations,
        stats.free_bytes,
        stats.fragmentation()
    );

    ctx.free(column)?;
    ctx.free(flag)?;
    ctx.free(ring)?;
    ctx.check_heap()?;
    Ok(())
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let ranks: usize = match args.next() {
        Some(arg) => arg.parse().context("RANKS must be a positive integer")?,
        None => 4,
    };
    let heap_bytes: usize = match args.next() {
        Some(arg) => arg.parse().context("HEAP_BYTES must be a positive integer")?,
        None => 1 << 20,
    };
    let config = match args.next() {
        Some(path) => RuntimeConfig::load_from_file(&path)
            .with_context(|| format!("loading runtime config from {}", path))?,
        None => RuntimeConfig::default(),
    };
    init_logging(&config.log_level);

    log::info!("symheap-rust {} self test: {} ranks, {} byte heaps", VERSION, ranks, heap_bytes);
    let endpoint = format!("local://selftest-{}", std::process::id());
    let started = Instant::now();

    let handles: Vec<_> = (0..ranks)
        .map(|rank| {
            let endpoint = endpoint.clone();
            let config = config.clone();
            thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || -> Result<()> {
                    let attrs =
                        set_attributes(rank, ranks, heap_bytes, endpoint)?.with_config(config)?;
                    let ctx = Context::create(attrs)?;
                    ctx.init()?;
                    let outcome = rank_main(&ctx);
                    ctx.finalize()?;
                    outcome
                })
                .context("spawning rank thread")
        })
        .collect::<Result<_>>()?;

    let mut failures = 0;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("rank {} failed: {:#}", rank, e);
                failures += 1;
            }
            Err(_) => {
                log::error!("rank {} panicked", rank);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} ranks failed", failures, ranks);
    }
    println!("self test passed on {} ranks in {:?}", ranks, started.elapsed());
    Ok(())
}
