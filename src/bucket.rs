//! Rows-per-bucket selection.
//!
//! Bucket size controls the working set of each grouped linestring build and
//! each geometry repair pass; these dominate peak memory, so the size is
//! derived once per run from total system memory.

use sysinfo::System;

const GIB: u64 = 1024 * 1024 * 1024;

/// Map total system memory to a rows-per-bucket count.
pub fn rows_per_bucket_for_memory(total_memory: u64) -> usize {
    if total_memory < 8 * GIB {
        100_000
    } else if total_memory < 16 * GIB {
        500_000
    } else if total_memory < 24 * GIB {
        1_000_000
    } else {
        5_000_000
    }
}

/// Rows-per-bucket for this host.
pub fn detect_rows_per_bucket() -> usize {
    let mut system = System::new();
    system.refresh_memory();
    rows_per_bucket_for_memory(system.total_memory())
}
