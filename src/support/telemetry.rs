//! Point-in-time process resource counters. Everything here is advisory:
//! a metric we cannot read becomes None, never an error, and nothing in
//! this module can panic into the recording path.

/// One reading of the process counters. CPU values are cumulative
/// process totals in microseconds; deltas are computed against a stored
/// baseline at job end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub memory_bytes: Option<i64>,
    pub peak_memory_bytes: Option<i64>,
    pub cpu_user_micros: Option<i64>,
    pub cpu_sys_micros: Option<i64>,
}

pub fn capture_snapshot(capture_cpu: bool) -> TelemetrySnapshot {
    let mut snapshot = platform_snapshot();
    if !capture_cpu {
        snapshot.cpu_user_micros = None;
        snapshot.cpu_sys_micros = None;
    }
    snapshot
}

/// Microsecond CPU delta rounded to whole milliseconds, clamped to zero to
/// absorb counter wraparound and measurement noise.
pub fn cpu_delta_ms(end_micros: i64, start_micros: i64) -> i64 {
    let delta = (end_micros - start_micros).max(0);
    (delta + 500) / 1000
}

/// Peak-memory growth, clamped: raw peak-end below peak-start reads as 0.
pub fn peak_delta_bytes(peak_start: i64, peak_end: i64) -> i64 {
    (peak_end - peak_start).max(0)
}

#[cfg(unix)]
fn platform_snapshot() -> TelemetrySnapshot {
    let mut snapshot = TelemetrySnapshot {
        memory_bytes: read_resident_bytes(),
        ..Default::default()
    };

    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc == 0 {
        // ru_maxrss is kilobytes on Linux.
        if usage.ru_maxrss > 0 {
            snapshot.peak_memory_bytes = Some(usage.ru_maxrss as i64 * 1024);
        }
        snapshot.cpu_user_micros =
            Some(usage.ru_utime.tv_sec as i64 * 1_000_000 + usage.ru_utime.tv_usec as i64);
        snapshot.cpu_sys_micros =
            Some(usage.ru_stime.tv_sec as i64 * 1_000_000 + usage.ru_stime.tv_usec as i64);
    }

    snapshot
}

#[cfg(unix)]
fn read_resident_bytes() -> Option<i64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: i64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as i64)
}

#[cfg(not(unix))]
fn platform_snapshot() -> TelemetrySnapshot {
    TelemetrySnapshot::default()
}
