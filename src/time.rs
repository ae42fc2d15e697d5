/*
 * time.rs
 *
 * Millisecond deadlines on CLOCK_MONOTONIC. The clock never goes backwards
 * and ignores wall-clock adjustments, which is the whole point - a timer
 * armed for 30s from now fires 30s from now even if NTP rewrites the date.
 *
 * Deadlines are i64 so "deadline - now" is ordinary signed math with no
 * carry step to get wrong. Arming saturates instead of wrapping.
 */

use core::mem;

/// Current monotonic time in milliseconds.
///
/// The zero point is unspecified (boot-relative on most systems); only
/// differences are meaningful.
#[inline]
#[must_use]
pub fn now_ms() -> i64 {
    // SAFETY: ts is a valid zeroed timespec; libc::timespec has no invalid
    // bit patterns.
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    // SAFETY: CLOCK_MONOTONIC is always available on the supported targets
    // and ts is a valid out-pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts);
    }
    (ts.tv_sec as i64) * 1000 + (ts.tv_nsec as i64) / 1_000_000
}

/*
 * Deadline for "msecs from now". Negative msecs land the deadline in the
 * past, which is legal - the timer fires on the next loop pass.
 */
#[inline]
#[must_use]
pub fn deadline_after(now: i64, msecs: i64) -> i64 {
    now.saturating_add(msecs)
}

/*
 * Signed time until a deadline. Negative once the deadline has passed;
 * callers that only care about expiry compare against 0.
 */
#[inline]
#[must_use]
pub const fn until(deadline: i64, now: i64) -> i64 {
    deadline - now
}

/* clamp a 64-bit remaining-time to the 32-bit form */
#[inline]
#[must_use]
pub const fn clamp_i32(ms: i64) -> i32 {
    if ms > i32::MAX as i64 {
        i32::MAX
    } else if ms < i32::MIN as i64 {
        i32::MIN
    } else {
        ms as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a, "monotonic clock went backwards: {a} -> {b}");
    }

    #[test]
    fn test_deadline_after() {
        assert_eq!(deadline_after(1000, 250), 1250);
        assert_eq!(deadline_after(1000, -250), 750);
        assert_eq!(deadline_after(i64::MAX - 1, 100), i64::MAX);
    }

    #[test]
    fn test_until_signs() {
        assert_eq!(until(150, 100), 50);
        assert_eq!(until(100, 100), 0);
        assert_eq!(until(100, 150), -50);
    }

    #[test]
    fn test_clamp_i32() {
        assert_eq!(clamp_i32(42), 42);
        assert_eq!(clamp_i32(i64::from(i32::MAX) + 1), i32::MAX);
        assert_eq!(clamp_i32(i64::from(i32::MIN) - 1), i32::MIN);
        assert_eq!(clamp_i32(-1), -1);
    }
}
