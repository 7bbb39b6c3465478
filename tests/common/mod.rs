//! Common test utilities for symmetric heap integration tests.

#![allow(dead_code)]

use symheap_rust::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub const KIB: usize = 1 << 10;
pub const MIB: usize = 1 << 20;

static WORLD_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Endpoint name no other test in this process uses.
pub fn unique_endpoint(tag: &str) -> String {
    let id = WORLD_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}{}-{}-{}", LOCAL_ENDPOINT_SCHEME, tag, std::process::id(), id)
}

/// Small staging buffers so modest transfers span several chunks.
pub fn small_staging_config() -> RuntimeConfig {
    ConfigBuilder::new()
        .staging_buffer_bytes(256)
        .staging_pool_size(2)
        .executor(ExecutorKind::Pool)
        .executor_threads(2)
        .spin_before_yield(16)
        .build()
        .unwrap()
}

/// Run `body` on `n` ranks, one thread each, with initialized contexts.
/// Each rank finalizes after `body` returns; results are ordered by rank.
pub fn run_world<R, F>(n: usize, heap_bytes: usize, config: RuntimeConfig, body: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(&Context) -> R + Send + Sync + 'static,
{
    init_logging("warn");
    let endpoint = unique_endpoint("world");
    let body = Arc::new(body);

    let handles: Vec<_> = (0..n)
        .map(|rank| {
            let endpoint = endpoint.clone();
            let config = config.clone();
            let body = body.clone();
            thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || {
                    let attrs = set_attributes(rank, n, heap_bytes, endpoint)
                        .unwrap()
                        .with_config(config)
                        .unwrap();
                    let ctx = Context::create(attrs).unwrap();
                    ctx.init().unwrap();
                    let result = body(&ctx);
                    ctx.finalize().unwrap();
                    result
                })
                .unwrap()
        })
        .collect();

    handles
        .into_iter()
        .map(|handle| handle.join().expect("rank thread panicked"))
        .collect()
}

/// `run_world` with the default configuration.
pub fn run_default_world<R, F>(n: usize, heap_bytes: usize, body: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(&Context) -> R + Send + Sync + 'static,
{
    run_world(n, heap_bytes, small_staging_config(), body)
}
