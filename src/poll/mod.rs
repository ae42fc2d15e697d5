/*
 * poll/
 *
 * The kernel readiness backend, selected at compile time: epoll on
 * Linux/Android, kqueue on the Apple platforms and FreeBSD. Both expose
 * the same narrow surface to the dispatch core:
 *
 *   Poller::new() -> Result<Poller>
 *   register(fd, data, flags, modify)   data = the watcher's token bits
 *   unregister(fd)
 *   fetch(&mut out, timeout_ms) -> usize
 *
 * A fetched RawEvent carries the registration's data word back plus the
 * delivered EventFlags (READ/WRITE/EOF/ERROR); translation from token
 * bits to watcher slots happens in the dispatch core, not here.
 */

use crate::flags::EventFlags;

/* batch capacity shared with the dispatch buffer */
pub(crate) const MAX_EVENTS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEvent {
    pub(crate) data: u64,
    pub(crate) events: EventFlags,
}

impl RawEvent {
    pub(crate) const fn empty() -> Self {
        Self {
            data: 0,
            events: EventFlags::empty(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::Poller;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::{timer_create, timer_expirations, timer_remaining_ms};

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) use kqueue::Poller;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
compile_error!("evloop needs an epoll or kqueue backend for this target");
