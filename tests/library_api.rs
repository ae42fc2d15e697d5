/*
 * API-surface tests: construction, the singleton guard, error values,
 * token semantics. Anything that needs real I/O traffic lives in
 * integration.rs instead.
 */

use std::sync::{Mutex, MutexGuard, PoisonError};

use evloop::{Error, EventFlags, EventLoop, Options};

static LOOP_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    let guard = LOOP_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    /* surface the crate's tracing output under --nocapture; Err just
     * means an earlier test already installed the subscriber */
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    evloop::clear_cancelled();
    guard
}

#[test]
fn test_one_loop_per_process() {
    let _guard = serial();
    let lp = EventLoop::new().unwrap();
    assert!(matches!(EventLoop::new(), Err(Error::LoopActive)));
    drop(lp);
    /* slot freed on teardown */
    let lp2 = EventLoop::new().unwrap();
    drop(lp2);
}

#[test]
fn test_options_opt_out_of_sigchld() {
    let _guard = serial();
    let lp = EventLoop::with_options(Options {
        handle_sigchld: false,
    })
    .unwrap();

    // SAFETY: sigaction query form with a valid zeroed out-param.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    let handler = unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        libc::sigaction(libc::SIGCHLD, std::ptr::null(), &raw mut sa);
        sa.sa_sigaction
    };
    assert_eq!(handler, libc::SIG_DFL, "SIGCHLD must stay untouched");
    drop(lp);
}

#[test]
fn test_tokens_are_copy_and_comparable() {
    let _guard = serial();
    let lp = EventLoop::new().unwrap();

    let a = lp.timeout_new(|_lp, _tok| {});
    let b = lp.timeout_new(|_lp, _tok| {});
    let a2 = a;
    assert_eq!(a, a2);
    assert_ne!(a, b);
    drop(lp);
}

#[test]
fn test_stale_token_errors() {
    let _guard = serial();
    let lp = EventLoop::new().unwrap();

    let tok = lp.timeout_new(|_lp, _tok| {});
    lp.timeout_drop(tok);
    assert_eq!(lp.timeout_set(tok, 10), Err(Error::StaleToken));
    assert_eq!(lp.timeout_add(tok), Err(Error::StaleToken));
    assert_eq!(lp.timeout_cancel(tok), Err(Error::NotPending));
    assert_eq!(lp.timeout_remaining64(tok), None);
    assert!(!lp.timeout_pending(tok));
    /* dropping twice is harmless */
    lp.timeout_drop(tok);
    drop(lp);
}

#[test]
fn test_fd_add_rejects_bad_fd() {
    let _guard = serial();
    let lp = EventLoop::new().unwrap();
    let err = lp
        .fd_add(-1, EventFlags::READ, |_lp, _tok, _ev| {})
        .unwrap_err();
    assert!(matches!(err, Error::Register(_)));
    drop(lp);
}

#[test]
fn test_signal_add_validates_range() {
    let _guard = serial();
    let lp = EventLoop::new().unwrap();
    assert_eq!(
        lp.signal_add(0, |_lp, _tok| {}).unwrap_err(),
        Error::InvalidSignal(0)
    );
    assert_eq!(
        lp.signal_add(65, |_lp, _tok| {}).unwrap_err(),
        Error::InvalidSignal(65)
    );
    drop(lp);
}

#[test]
fn test_cancelling_reports_unwinding_only() {
    let _guard = serial();
    let lp = EventLoop::new().unwrap();

    /* flag set but not running: not "cancelling" */
    evloop::cancel();
    assert!(!lp.cancelling());
    evloop::clear_cancelled();
    drop(lp);
}

#[test]
fn test_error_display() {
    assert_eq!(
        Error::LoopActive.to_string(),
        "another event loop is already active in this process"
    );
    assert!(Error::Register(libc::EBADF).to_string().contains("errno"));
}

#[test]
fn test_event_flags_compose() {
    let flags = EventFlags::READ | EventFlags::EDGE_TRIGGER;
    assert!(flags.contains(EventFlags::READ));
    assert!(!flags.contains(EventFlags::WRITE));
    assert!(flags.wants_io());
}
