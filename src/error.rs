/*
 * error.rs
 *
 * Everything the loop can report. Syscall failures carry the errno so the
 * caller can tell EMFILE from EBADF without us guessing for them.
 *
 * State conflicts (arming an armed timer, cancelling an idle one) are their
 * own variants with no payload - there is no errno, the caller just raced
 * with itself.
 */

use core::fmt;

/* everything that can go wrong */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Backend (epoll/kqueue) creation failed at loop construction
    PollInit(i32),
    /// Self-pipe creation failed at loop construction
    PipeInit(i32),
    /// Kernel interval timer could not be created/armed
    TimerInit(i32),
    /// Backend refused the fd registration
    Register(i32),
    /// Backend refused the fd removal
    Unregister(i32),
    /// Another `EventLoop` is already live in this process
    LoopActive,
    /// fd watcher flags contained neither READ nor WRITE
    InvalidFlags,
    /// Signal number outside the 1..=64 range the bridge can carry
    InvalidSignal(i32),
    /// Watcher is already armed/linked
    AlreadyPending,
    /// Watcher is not armed/linked (or its token went stale)
    NotPending,
    /// Token refers to a slot that no longer exists
    StaleToken,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PollInit(errno) => write!(f, "poll backend init failed: errno {errno}"),
            Self::PipeInit(errno) => write!(f, "self-pipe creation failed: errno {errno}"),
            Self::TimerInit(errno) => write!(f, "interval timer setup failed: errno {errno}"),
            Self::Register(errno) => write!(f, "fd registration failed: errno {errno}"),
            Self::Unregister(errno) => write!(f, "fd removal failed: errno {errno}"),
            Self::LoopActive => write!(f, "another event loop is already active in this process"),
            Self::InvalidFlags => write!(f, "fd watcher needs READ or WRITE in its flags"),
            Self::InvalidSignal(signo) => write!(f, "signal number out of range: {signo}"),
            Self::AlreadyPending => write!(f, "watcher is already pending"),
            Self::NotPending => write!(f, "watcher is not pending"),
            Self::StaleToken => write!(f, "token refers to a dropped watcher"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/* get errno - thread-local, reached through a per-OS libc accessor */
#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
pub(crate) fn errno() -> i32 {
    // SAFETY: __errno_location always returns a valid pointer to the
    // calling thread's errno on Linux/Android.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        *libc::__errno_location()
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
#[inline]
pub(crate) fn errno() -> i32 {
    // SAFETY: __error always returns a valid pointer to the calling
    // thread's errno on the BSD family.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        *libc::__error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_errno() {
        let msg = format!("{}", Error::Register(libc::EBADF));
        assert!(msg.contains("errno 9"), "expected errno in message: {msg}");
    }

    #[test]
    fn test_state_conflict_messages() {
        assert_eq!(format!("{}", Error::AlreadyPending), "watcher is already pending");
        assert_eq!(format!("{}", Error::NotPending), "watcher is not pending");
    }

    #[test]
    fn test_errno_reflects_failed_syscall() {
        // SAFETY: close(-1) is harmless and guaranteed to fail with EBADF.
        unsafe { libc::close(-1) };
        assert_eq!(errno(), libc::EBADF);
    }
}
