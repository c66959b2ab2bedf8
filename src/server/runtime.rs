//! Worker-pool sizing.
//!
//! In a CPU-limited container, tokio's default of one worker per host core
//! schedules far more threads than the cgroup will ever run. Prefer the
//! container quota when one is visible.

use tracing::info;

/// Resolve the tokio worker thread count, never less than one.
pub fn worker_thread_count() -> usize {
    let (threads, source) = resolve();
    info!(
        "runtime: worker threads resolved, threads={}, source={}",
        threads, source
    );
    threads
}

fn resolve() -> (usize, &'static str) {
    if let Some(cores) = std::env::var("PORTAL_CPU_LIMIT")
        .ok()
        .and_then(|value| parse_cores(&value))
    {
        return (cores.max(1), "PORTAL_CPU_LIMIT");
    }

    if let Some(cores) = cgroup_cpu_quota() {
        return (cores.max(1), "cgroup");
    }

    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (host, "host")
}

/// Accepts plain core counts ("4") and k8s-style millicores ("2500m").
fn parse_cores(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix('m') {
        return millis.parse::<usize>().ok().map(|m| m / 1000);
    }
    value.parse().ok()
}

/// CPU quota from the cgroup filesystem. The unified hierarchy keeps
/// "quota period" in one `cpu.max` file; legacy v1 splits them across
/// `cpu.cfs_quota_us` and `cpu.cfs_period_us`. When the unified file is
/// present the v1 files are shims and are not consulted.
fn cgroup_cpu_quota() -> Option<usize> {
    let pair = match std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        Ok(raw) => {
            let mut fields = raw.split_whitespace().map(str::to_string);
            (fields.next()?, fields.next()?)
        }
        Err(_) => (
            std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?,
            std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?,
        ),
    };
    whole_cores(&pair.0, &pair.1)
}

/// A quota of "max" (unlimited) or any non-positive value yields `None`.
fn whole_cores(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}
