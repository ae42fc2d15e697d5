/*
 * reaper.rs
 *
 * Child collection. One SIGCHLD can stand for any number of exited
 * children, so reaping is a drain: waitpid(-1, WNOHANG) until the kernel
 * has nothing left. EINTR retries, "no child" ends the drain.
 */

use crate::error::errno;

/// Raw waitpid status with the usual decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(i32);

impl ExitStatus {
    pub(crate) const fn from_raw(status: i32) -> Self {
        Self(status)
    }

    /// The raw waitpid status word.
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Exit code if the child exited normally.
    #[inline]
    #[must_use]
    pub fn code(self) -> Option<i32> {
        if libc::WIFEXITED(self.0) {
            Some(libc::WEXITSTATUS(self.0))
        } else {
            None
        }
    }

    /// Signal number if the child was killed by a signal.
    #[inline]
    #[must_use]
    pub fn signal(self) -> Option<i32> {
        if libc::WIFSIGNALED(self.0) {
            Some(libc::WTERMSIG(self.0))
        } else {
            None
        }
    }
}

/// One drain step: the next exited child, or None when the kernel has no
/// more to report (including "no children at all").
pub(crate) fn reap_next() -> Option<(libc::pid_t, ExitStatus)> {
    let mut status: i32 = 0;
    loop {
        // SAFETY: status is a valid out-pointer; waitpid(-1, WNOHANG) never
        // blocks and is safe with no children (returns -1/ECHILD).
        let pid = unsafe { libc::waitpid(-1, &raw mut status, libc::WNOHANG) };
        if pid < 0 && errno() == libc::EINTR {
            continue;
        }
        if pid <= 0 {
            return None;
        }
        return Some((pid, ExitStatus::from_raw(status)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_code() {
        /* status word layout: exit code in bits 8..16 */
        let st = ExitStatus::from_raw(7 << 8);
        assert_eq!(st.code(), Some(7));
        assert_eq!(st.signal(), None);
    }

    #[test]
    fn test_exit_status_signal() {
        let st = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(st.code(), None);
        assert_eq!(st.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_reap_next_without_children() {
        /* nothing spawned by this test: the drain reports empty */
        assert_eq!(reap_next(), None);
    }
}
