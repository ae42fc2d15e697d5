/*
 * lib.rs
 *
 * Module wiring and the curated public surface. The interesting code is
 * in event_loop.rs (dispatch) and signal.rs (the async-signal side).
 */

//! # evloop
//!
//! A single-threaded, cooperative event loop for Unix-like systems. One
//! thread owns the loop; callbacks for fd readiness, monotonic timers,
//! OS signals and child exits all run inline on that thread, between
//! backend calls. epoll on Linux/Android, kqueue on macOS/FreeBSD.
//!
//! ## Quick start
//!
//! ```no_run
//! use evloop::EventLoop;
//!
//! let lp = EventLoop::new().unwrap();
//! let tick = lp.timeout_new(|lp, tok| {
//!     println!("tick");
//!     let _ = lp.timeout_set(tok, 1000); // re-arm: fires once a second
//! });
//! lp.timeout_set(tick, 1000).unwrap();
//! lp.run(); // until SIGINT/SIGTERM or evloop::cancel()
//! ```
//!
//! Watchers are owned by the loop and addressed through `Copy` tokens;
//! deleting a watcher from inside its own callback is supported and
//! cheap. The loop is a process singleton between construction and
//! teardown because it owns process-wide signal handler state.

mod error;
mod event_loop;
mod fd;
mod flags;
mod list;
mod poll;
mod reaper;
mod signal;
mod slab;
mod time;

pub use error::{Error, Result};
pub use event_loop::{
    EventLoop, FdCallback, FdObserver, FdToken, IntervalCallback, IntervalToken, Options,
    ProcessCallback, ProcessToken, SignalCallback, SignalToken, TimerCallback, TimerToken,
};
pub use fd::RawFd;
pub use flags::EventFlags;
pub use reaper::ExitStatus;
pub use signal::{cancel, clear_cancelled, is_cancelled};
pub use time::now_ms;
