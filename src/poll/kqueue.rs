/*
 * poll/kqueue.rs
 *
 * kqueue backend for the Apple platforms and FreeBSD. Direct libc, same
 * reasoning as everywhere else in this crate: the nix kqueue API keeps
 * changing, the kernel one does not.
 *
 * kqueue splits read and write interest into separate filters, so one
 * registration becomes up to two kevent changes. EV_CLEAR gives edge
 * semantics per filter. The token bits ride in udata.
 */

use core::mem;
use core::ptr;

use super::{MAX_EVENTS, RawEvent};
use crate::error::{Error, Result, errno};
use crate::fd::{self, RawFd};
use crate::flags::EventFlags;

pub(crate) struct Poller {
    kq: RawFd,
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: kqueue() has no preconditions; failure is checked.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::PollInit(errno()));
        }
        /* kqueue descriptors are not inherited, cloexec is for uniformity */
        let _ = fd::set_cloexec(kq);
        Ok(Self { kq })
    }

    fn change(fd: RawFd, filter: i16, flags: u16, data: u64) -> libc::kevent {
        #[allow(clippy::cast_sign_loss)]
        libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: data as usize as *mut libc::c_void,
        }
    }

    fn apply(&self, changes: &[libc::kevent]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        // SAFETY: kq is the live kqueue fd; changes is a valid slice of
        // kevent structs; no event buffer is requested.
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            return Err(Error::Register(errno()));
        }
        Ok(())
    }

    /// Register (or, with `modify`, reconfigure) an fd.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        data: u64,
        flags: EventFlags,
        modify: bool,
    ) -> Result<()> {
        let edge = if flags.contains(EventFlags::EDGE_TRIGGER) {
            libc::EV_CLEAR
        } else {
            0
        };

        let mut adds: [libc::kevent; 2] = [Self::change(fd, 0, 0, 0); 2];
        let mut n_adds = 0;
        let mut drops: [libc::kevent; 2] = adds;
        let mut n_drops = 0;

        for (filter, wanted) in [
            (libc::EVFILT_READ, flags.contains(EventFlags::READ)),
            (libc::EVFILT_WRITE, flags.contains(EventFlags::WRITE)),
        ] {
            if wanted {
                adds[n_adds] = Self::change(fd, filter, libc::EV_ADD | edge, data);
                n_adds += 1;
            } else if modify {
                drops[n_drops] = Self::change(fd, filter, libc::EV_DELETE, 0);
                n_drops += 1;
            }
        }

        /* dropping a filter that was never added is fine, ignore it */
        let _ = self.apply(&drops[..n_drops]);
        self.apply(&adds[..n_adds])
    }

    pub(crate) fn unregister(&self, fd: RawFd) -> Result<()> {
        let drops = [
            Self::change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0),
            Self::change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
        ];
        /* at most one of the two filters is registered; per-change errors
         * for the other come back as ENOENT and are not failures */
        for chg in &drops {
            let _ = self.apply(core::slice::from_ref(chg));
        }
        Ok(())
    }

    /// Block for readiness; fill `out` and return the event count.
    ///
    /// `None` blocks indefinitely. EINTR and timeout both surface as 0.
    pub(crate) fn fetch(&self, out: &mut [RawEvent; MAX_EVENTS], timeout_ms: Option<i64>) -> usize {
        // SAFETY: kevent is plain data; a zeroed array is valid.
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { mem::zeroed() };
        let ts;
        let ts_ptr = match timeout_ms {
            None => ptr::null(),
            Some(ms) => {
                let ms = ms.max(0);
                ts = libc::timespec {
                    tv_sec: (ms / 1000) as libc::time_t,
                    tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
                };
                &raw const ts
            }
        };
        // SAFETY: kq is the live kqueue fd; events is a valid buffer of
        // MAX_EVENTS kevents; ts_ptr is null or points to a live timespec.
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                ts_ptr,
            )
        };
        if n <= 0 {
            /* timeout-only wake, or EINTR - the run loop re-evaluates */
            return 0;
        }
        let n = n as usize;
        for i in 0..n {
            let ev = &events[i];
            let mut flags = EventFlags::empty();
            match ev.filter {
                libc::EVFILT_READ => flags |= EventFlags::READ,
                libc::EVFILT_WRITE => flags |= EventFlags::WRITE,
                _ => {}
            }
            if ev.flags & libc::EV_ERROR != 0 {
                flags |= EventFlags::ERROR;
            }
            if ev.flags & libc::EV_EOF != 0 {
                flags |= EventFlags::EOF;
            }
            out[i] = RawEvent {
                data: ev.udata as usize as u64,
                events: flags,
            };
        }
        n
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        fd::close(self.kq);
        self.kq = -1;
    }
}
