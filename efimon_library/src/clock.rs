use crate::status::{EfiResult, Status, StatusCode};
use parking_lot::Mutex;

const UPTIME_PTH: &str = "/proc/uptime";

lazy_static::lazy_static! {
  // Serialises access to the uptime pseudo-file so concurrent observers never
  // interleave reads.
  static ref UPTIME_LOCK: Mutex<()> = Mutex::new(());
}

/// Monotonic system uptime in whole milliseconds.
///
/// This is the timestamp source for every observer; `difference` fields are
/// computed from consecutive values of this clock.
pub fn uptime_ms() -> EfiResult<u64> {
    let _guard = UPTIME_LOCK.lock();
    let buff = std::fs::read_to_string(UPTIME_PTH)
        .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot read {}: {}", UPTIME_PTH, e)))?;
    parse_uptime_ms(&buff)
}

fn parse_uptime_ms(buff: &str) -> EfiResult<u64> {
    let secs = buff
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| Status::new(StatusCode::FileError, "Empty uptime file"))?;
    let secs = secs
        .parse::<f64>()
        .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot parse uptime '{}': {}", secs, e)))?;
    Ok((secs * 1000.0) as u64)
}

/// Kernel clock ticks per second, needed to scale `/proc/<pid>/stat` counters.
pub fn clock_ticks_per_sec() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        100
    } else {
        ticks as u64
    }
}

/// System page size in bytes, needed to scale RSS page counts.
pub fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("123.45 678.90\n", 123450)]
    #[case("0.00 0.00\n", 0)]
    #[case("3600.10 200.00\n", 3600100)]
    fn parses_uptime(#[case] buff: &str, #[case] expected: u64) {
        assert_eq!(parse_uptime_ms(buff).unwrap(), expected);
    }

    #[rstest]
    fn rejects_garbage() {
        assert!(parse_uptime_ms("").is_err());
        assert!(parse_uptime_ms("abc def").is_err());
    }

    #[rstest]
    fn live_clock_is_monotone() {
        let t1 = uptime_ms().unwrap();
        let t2 = uptime_ms().unwrap();
        assert!(t2 >= t1);
    }
}
