use std::time::Duration;
use sysinfo::System;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

pub fn sample(sys: &mut System) -> MemorySnapshot {
    sys.refresh_memory();
    MemorySnapshot {
        total_bytes: sys.total_memory(),
        free_bytes: sys.free_memory(),
        available_bytes: sys.available_memory(),
    }
}

/// Log free memory every `interval`. Never returns.
pub async fn run_housekeeping(interval: Duration) {
    let mut sys = System::new();
    let mut ticker = tokio::time::interval(interval);
    let mut lowest: Option<u64> = None;

    loop {
        ticker.tick().await;
        let mem = sample(&mut sys);
        info!(
            free_bytes = mem.free_bytes,
            available_bytes = mem.available_bytes,
            total_bytes = mem.total_bytes,
            "free memory"
        );
        if lowest.is_some_and(|low| mem.available_bytes < low / 2) {
            warn!(available_bytes = mem.available_bytes, "available memory halved since last low");
        }
        lowest = Some(lowest.map_or(mem.available_bytes, |low| low.min(mem.available_bytes)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_consistent() {
        let mut sys = System::new();
        let mem = sample(&mut sys);
        assert!(mem.total_bytes > 0);
        assert!(mem.free_bytes <= mem.total_bytes);
        assert!(mem.available_bytes <= mem.total_bytes);
    }
}
