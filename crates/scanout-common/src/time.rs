use std::io;

/// Current `CLOCK_MONOTONIC` time in nanoseconds.
///
/// This is the clock the kernel uses for fence and vblank timestamps, so
/// completion times recorded with it compare directly against scanout times.
/// Returns 0 if the clock cannot be read; the failure is logged.
pub fn monotonic_nanos() -> u64 {
    try_monotonic_nanos().unwrap_or_else(|e| {
        tracing::error!("clock_gettime(CLOCK_MONOTONIC) failed: {}", e);
        0
    })
}

/// Like [`monotonic_nanos`], but reports a failed clock read.
pub fn try_monotonic_nanos() -> io::Result<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64))
}
