//! Parallel digest computation
//!
//! Uses a dedicated rayon pool so hashing a large distroot does not compete
//! with the category writer threads.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::digest::{digest_file, DigestKind};
use crate::{DistError, Result};

// ============================================================================
// Thread Pool Configuration
// ============================================================================

/// Maximum digest threads; hashing is I/O bound past this point
pub const MAX_DIGEST_THREADS: usize = 4;

/// Calculate default thread count: min(cpu_cores / 2, MAX_DIGEST_THREADS)
pub fn default_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_DIGEST_THREADS)
}

fn create_thread_pool(threads: Option<usize>) -> Result<ThreadPool> {
    let num_threads = threads.unwrap_or_else(default_thread_count).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("ovly-digest-{}", i))
        .build()
        .map_err(|e| DistError::Io(io::Error::other(e)))
}

/// Digest results keyed by path
pub type DigestResults = HashMap<PathBuf, io::Result<BTreeMap<DigestKind, String>>>;

/// Hash many files in parallel.
///
/// Per-file failures are reported in the result map; only failing to build
/// the pool is an error.
pub fn digest_files(
    paths: Vec<PathBuf>,
    kinds: &[DigestKind],
    threads: Option<usize>,
) -> Result<DigestResults> {
    if paths.is_empty() {
        return Ok(HashMap::new());
    }
    let pool = create_thread_pool(threads)?;
    Ok(pool.install(|| {
        paths
            .into_par_iter()
            .map(|path| {
                let result = digest_file(&path, kinds);
                (path, result)
            })
            .collect()
    }))
}
