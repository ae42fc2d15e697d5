/*
 * poll/epoll.rs
 *
 * epoll backend. One epoll instance per loop; each registration stores
 * the watcher's token bits in the event's u64 so a fetched event maps
 * straight back to its arena slot.
 *
 * Delivered-bit mapping: EPOLLIN -> READ, EPOLLOUT -> WRITE, EPOLLERR ->
 * ERROR, EPOLLHUP/EPOLLRDHUP -> EOF. Pipes report writer close as
 * EPOLLHUP, sockets as EPOLLRDHUP; both mean the same thing to callers.
 *
 * Intervals ride on timerfd: a kernel periodic timer that becomes a
 * readable fd, so the dispatch core can watch it like any other fd.
 */

use core::mem;

use super::{MAX_EVENTS, RawEvent};
use crate::error::{Error, Result, errno};
use crate::fd::{self, RawFd};
use crate::flags::EventFlags;

pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: epoll_create1 has no preconditions; failure is checked.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::PollInit(errno()));
        }
        Ok(Self { epfd })
    }

    fn request_bits(flags: EventFlags) -> u32 {
        let mut ev: u32 = 0;
        if flags.contains(EventFlags::READ) {
            ev |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if flags.contains(EventFlags::WRITE) {
            ev |= libc::EPOLLOUT as u32;
        }
        if flags.contains(EventFlags::EDGE_TRIGGER) {
            ev |= libc::EPOLLET as u32;
        }
        ev
    }

    fn delivered_bits(kernel: u32) -> EventFlags {
        let mut out = EventFlags::empty();
        if kernel & libc::EPOLLIN as u32 != 0 {
            out |= EventFlags::READ;
        }
        if kernel & libc::EPOLLOUT as u32 != 0 {
            out |= EventFlags::WRITE;
        }
        if kernel & libc::EPOLLERR as u32 != 0 {
            out |= EventFlags::ERROR;
        }
        if kernel & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
            out |= EventFlags::EOF;
        }
        out
    }

    /// Register (or, with `modify`, reconfigure) an fd.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        data: u64,
        flags: EventFlags,
        modify: bool,
    ) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: Self::request_bits(flags),
            u64: data,
        };
        let op = if modify {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        // SAFETY: epfd is the live epoll fd; ev is a valid epoll_event.
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &raw mut ev) };
        if ret < 0 {
            return Err(Error::Register(errno()));
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, fd: RawFd) -> Result<()> {
        /* dummy event keeps pre-2.6.9 kernels happy; ignored by DEL */
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        // SAFETY: epfd is the live epoll fd; ev is a valid epoll_event.
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &raw mut ev) };
        if ret < 0 {
            return Err(Error::Unregister(errno()));
        }
        Ok(())
    }

    /// Block for readiness; fill `out` and return the event count.
    ///
    /// `None` blocks indefinitely. EINTR and timeout both surface as 0.
    pub(crate) fn fetch(&self, out: &mut [RawEvent; MAX_EVENTS], timeout_ms: Option<i64>) -> usize {
        // SAFETY: epoll_event is plain data; a zeroed array is valid.
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
        let timeout = match timeout_ms {
            None => -1,
            Some(ms) => ms.clamp(0, i64::from(i32::MAX)) as i32,
        };
        // SAFETY: events is a valid MAX_EVENTS-sized buffer for the kernel
        // to fill; epfd is the live epoll fd.
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
        };
        if n <= 0 {
            /* timeout-only wake, or EINTR - the run loop re-evaluates */
            return 0;
        }
        let n = n as usize;
        for i in 0..n {
            let ev = events[i];
            out[i] = RawEvent {
                data: ev.u64,
                events: Self::delivered_bits(ev.events),
            };
        }
        n
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        fd::close(self.epfd);
        self.epfd = -1;
    }
}

const fn ms_to_timespec(ms: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
    }
}

/// Create a periodic CLOCK_MONOTONIC timerfd firing every `period_ms`.
pub(crate) fn timer_create(period_ms: u64) -> Result<RawFd> {
    // SAFETY: timerfd_create has no preconditions; failure is checked.
    let tfd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
    if tfd < 0 {
        return Err(Error::TimerInit(errno()));
    }
    let spec = libc::itimerspec {
        it_interval: ms_to_timespec(period_ms),
        it_value: ms_to_timespec(period_ms),
    };
    // SAFETY: tfd is the timerfd just created; spec is a valid itimerspec.
    let ret = unsafe { libc::timerfd_settime(tfd, 0, &spec, core::ptr::null_mut()) };
    if ret < 0 {
        let err = errno();
        fd::close(tfd);
        return Err(Error::TimerInit(err));
    }
    Ok(tfd)
}

/// Milliseconds until the timer next fires.
pub(crate) fn timer_remaining_ms(tfd: RawFd) -> i64 {
    // SAFETY: itimerspec is plain data; zeroed is a valid out-param.
    let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
    // SAFETY: tfd is a live timerfd; spec is a valid out-pointer.
    let ret = unsafe { libc::timerfd_gettime(tfd, &raw mut spec) };
    if ret < 0 {
        return 0;
    }
    (spec.it_value.tv_sec as i64) * 1000 + (spec.it_value.tv_nsec as i64) / 1_000_000
}

/// Drain the expiration counter (8-byte native-endian read).
pub(crate) fn timer_expirations(tfd: RawFd) -> u64 {
    let mut buf = [0u8; 8];
    match fd::read_retry(tfd, &mut buf) {
        Some(8) => u64::from_ne_bytes(buf),
        /* EAGAIN (spurious wake) or short read: nothing expired */
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_bits() {
        let bits = Poller::request_bits(EventFlags::READ | EventFlags::EDGE_TRIGGER);
        assert_ne!(bits & libc::EPOLLIN as u32, 0);
        assert_ne!(bits & libc::EPOLLET as u32, 0);
        assert_eq!(bits & libc::EPOLLOUT as u32, 0);
    }

    #[test]
    fn test_delivered_bits_maps_hup_to_eof() {
        let flags = Poller::delivered_bits((libc::EPOLLIN | libc::EPOLLHUP) as u32);
        assert!(flags.contains(EventFlags::READ));
        assert!(flags.contains(EventFlags::EOF));
        assert!(!flags.contains(EventFlags::ERROR));
    }

    #[test]
    fn test_timerfd_round_trip() {
        let tfd = timer_create(500).unwrap();
        let remaining = timer_remaining_ms(tfd);
        assert!(remaining > 0 && remaining <= 500, "remaining = {remaining}");
        /* nothing expired yet */
        assert_eq!(timer_expirations(tfd), 0);
        fd::close(tfd);
    }
}
