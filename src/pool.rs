//! Build and search thread pools.
//!
//! Two global rayon pools, created lazily. Build operations run as a single
//! task on the build pool (inner loops may parallelize inside it; a
//! per-operation pool is spun up when the config pins a thread count).
//! Search fans out one task per query row; query tasks do not nest further
//! parallelism.

use std::sync::OnceLock;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{IndexError, Result};

static BUILD_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();
static SEARCH_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

fn get_pool(cell: &'static OnceLock<Option<ThreadPool>>, prefix: &'static str) -> Result<&'static ThreadPool> {
    cell.get_or_init(|| {
        ThreadPoolBuilder::new()
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .ok()
    })
    .as_ref()
    .ok_or_else(|| IndexError::Inner(format!("failed to initialize {prefix} thread pool")))
}

/// The global build pool.
pub fn build_pool() -> Result<&'static ThreadPool> {
    get_pool(&BUILD_POOL, "nf-build")
}

/// The global search pool.
pub fn search_pool() -> Result<&'static ThreadPool> {
    get_pool(&SEARCH_POOL, "nf-search")
}

/// Run a build operation as one pool task. A configured thread count gets a
/// dedicated pool so the operation's inner parallelism is bounded by it.
pub(crate) fn run_build<R, F>(num_build_thread: Option<usize>, f: F) -> Result<R>
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match num_build_thread {
        Some(n) => {
            let pool = ThreadPoolBuilder::new()
                .num_threads(n.max(1))
                .build()
                .map_err(|e| IndexError::Inner(e.to_string()))?;
            Ok(pool.install(f))
        }
        None => Ok(build_pool()?.install(f)),
    }
}
