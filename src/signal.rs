/*
 * signal.rs
 *
 * The async-signal side of the loop. A handler may only do two things
 * here: store to an atomic and write one byte to the self-pipe. No
 * allocation, no locks, no logging - anything else is off-limits in
 * signal context and stays that way.
 *
 * The byte written IS the signal number, so the bridge on the other end
 * of the pipe can fan deliveries out to subscribed watchers without any
 * other shared state.
 *
 * sigaction hygiene: we never clobber a handler someone else installed,
 * and we never restore over a handler someone else installed after us.
 * Install-side checks the current handler, restore-side checks it again.
 */

use core::mem;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::error::{Error, Result, errno};
use crate::fd::RawFd;

/*
 * Process-global state reachable from signal handlers. Everything else
 * about the loop lives in the EventLoop object; this is the minimum a
 * handler must see, so it stays in atomics.
 */
static CANCELLED: AtomicBool = AtomicBool::new(false);
static STATUS: AtomicI32 = AtomicI32::new(0);
static DO_SIGCHLD: AtomicBool = AtomicBool::new(false);
/* write end of the self-pipe, -1 when no loop is live */
static WAKER_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
/* one loop per process between new() and done() */
static LOOP_ACTIVE: AtomicBool = AtomicBool::new(false);

/// True once a cancelling signal (or [`cancel`]) stopped the loop.
///
/// Sticky: the caller clears it with [`clear_cancelled`] before running
/// again.
#[inline]
#[must_use]
pub fn is_cancelled() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

/// Reset the sticky cancellation flag.
#[inline]
pub fn clear_cancelled() {
    CANCELLED.store(false, Ordering::SeqCst);
}

/// Cancel the active loop from anywhere: sets the flag and wakes the
/// backend through the self-pipe. Safe to call with no loop live.
pub fn cancel() {
    CANCELLED.store(true, Ordering::SeqCst);
    /* byte 0 is not a signal number; the bridge drains and ignores it */
    wake_with(0);
}

pub(crate) fn status() -> i32 {
    STATUS.load(Ordering::SeqCst)
}

pub(crate) fn reset_status() {
    STATUS.store(0, Ordering::SeqCst);
}

pub(crate) fn take_sigchld() -> bool {
    DO_SIGCHLD.swap(false, Ordering::SeqCst)
}

pub(crate) fn sigchld_pending() -> bool {
    DO_SIGCHLD.load(Ordering::SeqCst)
}

/// Claim the process-wide loop slot. Fails when another loop is live.
pub(crate) fn claim_active() -> Result<()> {
    if LOOP_ACTIVE.swap(true, Ordering::SeqCst) {
        return Err(Error::LoopActive);
    }
    Ok(())
}

pub(crate) fn release_active() {
    LOOP_ACTIVE.store(false, Ordering::SeqCst);
}

/* publish the waker write end before any handler can run */
pub(crate) fn set_waker_fd(fd: RawFd) {
    WAKER_WRITE_FD.store(fd, Ordering::SeqCst);
}

/* retract and return the write end for closing */
pub(crate) fn take_waker_fd() -> RawFd {
    WAKER_WRITE_FD.swap(-1, Ordering::SeqCst)
}

/* one byte down the pipe, EINTR retried, everything else dropped */
fn wake_with(signo: libc::c_int) {
    let fd = WAKER_WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let byte = signo as u8;
    loop {
        // SAFETY: writing 1 byte from a live local to a pipe fd; write()
        // is async-signal-safe per POSIX.
        let n = unsafe { libc::write(fd, (&raw const byte).cast(), 1) };
        if n < 0 && errno() == libc::EINTR {
            continue;
        }
        break;
    }
}

/* trampoline for SIGCHLD and user-subscribed signals */
pub(crate) extern "C" fn wake_trampoline(signo: libc::c_int) {
    if signo == libc::SIGCHLD {
        DO_SIGCHLD.store(true, Ordering::SeqCst);
    }
    wake_with(signo);
}

/* trampoline for SIGINT/SIGTERM: record who cancelled us, then wake */
pub(crate) extern "C" fn cancel_trampoline(signo: libc::c_int) {
    STATUS.store(signo, Ordering::SeqCst);
    CANCELLED.store(true, Ordering::SeqCst);
    wake_with(signo);
}

#[inline]
fn handler_addr(handler: extern "C" fn(libc::c_int)) -> libc::sighandler_t {
    handler as *const () as libc::sighandler_t
}

/* current disposition for a signal */
fn current_action(signo: libc::c_int) -> libc::sigaction {
    // SAFETY: sigaction has no invalid bit patterns; zeroed is a valid
    // out-param for the query-only call.
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    // SAFETY: query form of sigaction (act = NULL) with a valid out-pointer.
    unsafe {
        libc::sigaction(signo, core::ptr::null(), &raw mut sa);
    }
    sa
}

fn install_action(signo: libc::c_int, handler: libc::sighandler_t) {
    // SAFETY: sa is zeroed then fully initialized before use; sigemptyset
    // and sigaction are given valid pointers to it. The ops share the
    // invariant of building one sigaction value.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = 0;
        libc::sigemptyset(&raw mut sa.sa_mask);
        libc::sigaction(signo, &sa, core::ptr::null_mut());
    }
}

/*
 * Install-or-restore for the loop's own SIGINT/SIGTERM/SIGCHLD.
 *
 * add: only take the signal over when the current disposition is SIG_DFL,
 * saving what was there. remove: only put the saved disposition back when
 * the current handler is still ours.
 */
pub(crate) fn install_own(
    signo: libc::c_int,
    handler: extern "C" fn(libc::c_int),
    saved: &mut libc::sigaction,
    add: bool,
) {
    let cur = current_action(signo);
    if add {
        if cur.sa_sigaction == libc::SIG_DFL {
            *saved = cur;
            install_action(signo, handler_addr(handler));
        }
    } else if cur.sa_sigaction == handler_addr(handler) {
        // SAFETY: saved holds the sigaction captured at install time.
        unsafe {
            libc::sigaction(signo, saved, core::ptr::null_mut());
        }
    }
}

/*
 * SIGPIPE policy: ignore while the loop runs so a peer hanging up does
 * not kill the process mid-write. Same do-not-clobber rules: only flip
 * SIG_DFL -> SIG_IGN, only flip back while still SIG_IGN.
 */
pub(crate) fn ignore_signal(signo: libc::c_int, ignore: bool) {
    let cur = current_action(signo);
    let new_handler = if ignore {
        (cur.sa_sigaction == libc::SIG_DFL).then_some(libc::SIG_IGN)
    } else {
        (cur.sa_sigaction == libc::SIG_IGN).then_some(libc::SIG_DFL)
    };
    if let Some(handler) = new_handler {
        install_action(signo, handler);
    }
}

/*
 * User subscription path. Returns the prior disposition so signal_delete
 * can undo the installation later.
 */
pub(crate) fn subscribe(signo: libc::c_int) -> Result<libc::sigaction> {
    if !(1..=64).contains(&signo) {
        return Err(Error::InvalidSignal(signo));
    }
    let orig = current_action(signo);
    if orig.sa_sigaction != handler_addr(wake_trampoline) {
        install_action(signo, handler_addr(wake_trampoline));
    }
    Ok(orig)
}

/* restore iff the bridge trampoline is still the installed handler */
pub(crate) fn unsubscribe(signo: libc::c_int, saved: &libc::sigaction) {
    let cur = current_action(signo);
    if cur.sa_sigaction == handler_addr(wake_trampoline) {
        // SAFETY: saved holds the sigaction captured by subscribe().
        unsafe {
            libc::sigaction(signo, saved, core::ptr::null_mut());
        }
    }
}

/// 64-bit seen-set for signal numbers 1..=64, the coalescing unit of the
/// bridge: N deliveries between two drains collapse to one bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SigSet64(u64);

impl SigSet64 {
    pub(crate) fn insert(&mut self, signo: i32) {
        if (1..=64).contains(&signo) {
            self.0 |= 1u64 << (signo - 1);
        }
    }

    pub(crate) fn contains(self, signo: i32) -> bool {
        (1..=64).contains(&signo) && self.0 & (1u64 << (signo - 1)) != 0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigset_bounds() {
        let mut set = SigSet64::default();
        set.insert(0);
        set.insert(65);
        set.insert(-3);
        assert!(set.is_empty());
        set.insert(1);
        set.insert(64);
        assert!(set.contains(1));
        assert!(set.contains(64));
        assert!(!set.contains(2));
        assert!(!set.contains(0));
        assert!(!set.contains(65));
    }

    #[test]
    fn test_sigset_coalesces() {
        let mut set = SigSet64::default();
        set.insert(libc::SIGCHLD);
        set.insert(libc::SIGCHLD);
        set.insert(libc::SIGCHLD);
        assert!(set.contains(libc::SIGCHLD));
        assert_eq!(set, {
            let mut one = SigSet64::default();
            one.insert(libc::SIGCHLD);
            one
        });
    }

    #[test]
    fn test_subscribe_rejects_out_of_range() {
        assert_eq!(subscribe(0).unwrap_err(), Error::InvalidSignal(0));
        assert_eq!(subscribe(65).unwrap_err(), Error::InvalidSignal(65));
    }

    #[test]
    fn test_subscribe_unsubscribe_round_trip() {
        /* SIGUSR2 is untouched by the test harness */
        let before = current_action(libc::SIGUSR2);
        let saved = subscribe(libc::SIGUSR2).unwrap();
        let installed = current_action(libc::SIGUSR2);
        assert_eq!(installed.sa_sigaction, handler_addr(wake_trampoline));
        unsubscribe(libc::SIGUSR2, &saved);
        let after = current_action(libc::SIGUSR2);
        assert_eq!(after.sa_sigaction, before.sa_sigaction);
    }

    #[test]
    fn test_cancel_flag_round_trip() {
        clear_cancelled();
        assert!(!is_cancelled());
        cancel();
        assert!(is_cancelled());
        clear_cancelled();
        assert!(!is_cancelled());
    }
}
