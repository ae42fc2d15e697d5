/*
 * event_loop.rs
 *
 * The dispatch core. One EventLoop per process, one thread owns it, every
 * callback runs inline between backend calls. The loop never holds a
 * RefCell borrow across a callback invocation - that single rule is what
 * lets callbacks re-enter the loop freely: arm timers, delete watchers
 * (including themselves), even run a nested loop.
 *
 * Watchers live in generational arenas; callers hold Copy tokens. A
 * token that outlives its watcher fails the generation check and is
 * treated like the unlinked watchers of classic intrusive-list loops.
 *
 * Dispatch order per iteration: reap children, fire expired timers,
 * block in the backend, deliver at most one fd event. Delivering one
 * event per pass keeps timers and signals interleaved with fd traffic.
 */

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use core::mem;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::fd::{self, RawFd};
use crate::flags::EventFlags;
use crate::list::WatchList;
use crate::poll::{MAX_EVENTS, Poller, RawEvent};
use crate::reaper::{self, ExitStatus};
use crate::signal;
use crate::slab::{Index, Slab};
use crate::time;

/// Handle to a registered fd watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdToken(pub(crate) Index);

/// Handle to a timeout slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(pub(crate) Index);

/// Handle to a process watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessToken(pub(crate) Index);

/// Handle to a signal watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalToken(pub(crate) Index);

/// Handle to an interval timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalToken(pub(crate) Index);

pub type FdCallback = Box<dyn FnMut(&EventLoop, FdToken, EventFlags) + 'static>;
pub type TimerCallback = Box<dyn FnMut(&EventLoop, TimerToken) + 'static>;
pub type ProcessCallback = Box<dyn FnMut(&EventLoop, ProcessToken, ExitStatus) + 'static>;
pub type SignalCallback = Box<dyn FnMut(&EventLoop, SignalToken) + 'static>;
pub type IntervalCallback = Box<dyn FnMut(&EventLoop, IntervalToken) + 'static>;
/// Hook observing every fd registration change (flags empty on delete).
pub type FdObserver = Box<dyn FnMut(RawFd, EventFlags) + 'static>;

/// Loop construction options.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Install the SIGCHLD handler and reap children (default true).
    pub handle_sigchld: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            handle_sigchld: true,
        }
    }
}

struct FdSlot {
    fd: RawFd,
    flags: EventFlags,
    eof: bool,
    error: bool,
    cb: Option<FdCallback>,
}

struct TimeoutSlot {
    deadline: i64,
    pending: bool,
    cb: Option<TimerCallback>,
}

struct ProcessSlot {
    pid: libc::pid_t,
    cb: Option<ProcessCallback>,
}

struct SignalSlot {
    signo: i32,
    saved: libc::sigaction,
    cb: Option<SignalCallback>,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
struct IntervalSlot {
    timer_fd: RawFd,
    watcher: Option<FdToken>,
    expirations: Rc<Cell<u64>>,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
struct IntervalSlot {
    period_ms: u64,
    next_fire: i64,
    timeout: Option<TimerToken>,
    expirations: Rc<Cell<u64>>,
}

/*
 * Latest backend batch. fd_delete nulls un-consumed entries for its
 * watcher, so a callback can kill anything later in the same batch.
 */
struct Batch {
    entries: [Option<(FdToken, EventFlags)>; MAX_EVENTS],
    cur: usize,
    n: usize,
}

impl Batch {
    const fn new() -> Self {
        Self {
            entries: [None; MAX_EVENTS],
            cur: 0,
            n: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.cur >= self.n
    }

    fn reset(&mut self) {
        self.entries = [None; MAX_EVENTS];
        self.cur = 0;
        self.n = 0;
    }

    /* outer None: batch exhausted; inner None: entry was nulled */
    fn next(&mut self) -> Option<Option<(FdToken, EventFlags)>> {
        if self.cur >= self.n {
            return None;
        }
        let entry = self.entries[self.cur].take();
        self.cur += 1;
        Some(entry)
    }

    fn null_token(&mut self, token: FdToken) {
        for entry in &mut self.entries[self.cur..self.n] {
            if matches!(entry, Some((t, _)) if *t == token) {
                *entry = None;
            }
        }
    }
}

/*
 * One frame per live callback invocation. While the frame for an
 * edge-triggered fd is on the stack, further events for that fd fold
 * into `events` instead of re-entering the callback.
 */
struct StackFrame {
    token: FdToken,
    alive: bool,
    events: EventFlags,
}

/// The event loop. See the crate docs for the dispatch model.
pub struct EventLoop {
    poll: RefCell<Option<Poller>>,
    fds: RefCell<Slab<FdSlot>>,
    timeouts: RefCell<Slab<TimeoutSlot>>,
    timer_queue: RefCell<WatchList<i64>>,
    processes: RefCell<Slab<ProcessSlot>>,
    process_list: RefCell<WatchList<libc::pid_t>>,
    signals: RefCell<Slab<SignalSlot>>,
    signal_list: RefCell<WatchList<i32>>,
    intervals: RefCell<Slab<IntervalSlot>>,
    batch: RefCell<Batch>,
    stack: RefCell<Vec<StackFrame>>,
    depth: Cell<u32>,
    deadline_reached: Cell<bool>,
    waker_rd: Cell<RawFd>,
    waker_token: Cell<Option<FdToken>>,
    observer: RefCell<Option<FdObserver>>,
    handle_sigchld: bool,
    saved_sigint: Cell<libc::sigaction>,
    saved_sigterm: Cell<libc::sigaction>,
    saved_sigchld: Cell<libc::sigaction>,
    finished: Cell<bool>,
    /* callbacks and RefCells already forbid Send/Sync; spell it out */
    _single_thread: PhantomData<*const ()>,
}

impl EventLoop {
    /// Build a loop with default [`Options`].
    pub fn new() -> Result<Self> {
        Self::with_options(Options::default())
    }

    /// Build a loop: backend, self-pipe, process-wide signal handlers.
    ///
    /// Fails with [`Error::LoopActive`] when another loop is live in this
    /// process. Partial state is released on any construction failure.
    pub fn with_options(options: Options) -> Result<Self> {
        signal::claim_active()?;
        let poller = match Poller::new() {
            Ok(p) => p,
            Err(e) => {
                signal::release_active();
                return Err(e);
            }
        };

        // SAFETY: sigaction has no invalid bit patterns; the zeroed value
        // is a placeholder overwritten before any restore uses it.
        let zero_sa: libc::sigaction = unsafe { mem::zeroed() };

        let lp = Self {
            poll: RefCell::new(Some(poller)),
            fds: RefCell::new(Slab::new()),
            timeouts: RefCell::new(Slab::new()),
            timer_queue: RefCell::new(WatchList::new()),
            processes: RefCell::new(Slab::new()),
            process_list: RefCell::new(WatchList::new()),
            signals: RefCell::new(Slab::new()),
            signal_list: RefCell::new(WatchList::new()),
            intervals: RefCell::new(Slab::new()),
            batch: RefCell::new(Batch::new()),
            stack: RefCell::new(Vec::new()),
            depth: Cell::new(0),
            deadline_reached: Cell::new(false),
            waker_rd: Cell::new(-1),
            waker_token: Cell::new(None),
            observer: RefCell::new(None),
            handle_sigchld: options.handle_sigchld,
            saved_sigint: Cell::new(zero_sa),
            saved_sigterm: Cell::new(zero_sa),
            saved_sigchld: Cell::new(zero_sa),
            finished: Cell::new(false),
            _single_thread: PhantomData,
        };

        if let Err(e) = lp.init_waker() {
            lp.done();
            return Err(e);
        }
        lp.setup_signals(true);
        debug!(handle_sigchld = lp.handle_sigchld, "event loop up");
        Ok(lp)
    }

    /* self-pipe: write end published for handlers, read end watched */
    fn init_waker(&self) -> Result<()> {
        let (rd, wr) = fd::waker_pipe()?;
        signal::set_waker_fd(wr);
        self.waker_rd.set(rd);
        let token = self.fd_add(rd, EventFlags::READ, |lp: &EventLoop, _tok, _events| {
            lp.consume_signals();
        })?;
        self.waker_token.set(Some(token));
        Ok(())
    }

    fn setup_signals(&self, add: bool) {
        let mut sa = self.saved_sigint.get();
        signal::install_own(libc::SIGINT, signal::cancel_trampoline, &mut sa, add);
        self.saved_sigint.set(sa);

        let mut sa = self.saved_sigterm.get();
        signal::install_own(libc::SIGTERM, signal::cancel_trampoline, &mut sa, add);
        self.saved_sigterm.set(sa);

        if self.handle_sigchld {
            let mut sa = self.saved_sigchld.get();
            signal::install_own(libc::SIGCHLD, signal::wake_trampoline, &mut sa, add);
            self.saved_sigchld.set(sa);
        }

        signal::ignore_signal(libc::SIGPIPE, add);
    }

    /* ---------------------------------------------------------------- */
    /* fd watchers                                                      */
    /* ---------------------------------------------------------------- */

    /// Register `fd` with the backend and return its token.
    ///
    /// `flags` must contain READ or WRITE. Unless BLOCKING is set the fd
    /// is switched to non-blocking. The callback receives the delivered
    /// event bits (READ/WRITE/EOF/ERROR) and may call any loop method,
    /// including `fd_delete` on its own token.
    pub fn fd_add(
        &self,
        fd: RawFd,
        flags: EventFlags,
        cb: impl FnMut(&EventLoop, FdToken, EventFlags) + 'static,
    ) -> Result<FdToken> {
        if !flags.wants_io() {
            return Err(Error::InvalidFlags);
        }
        if !flags.contains(EventFlags::BLOCKING) {
            /* best-effort: a dead fd fails registration below anyway */
            let _ = fd::set_nonblocking(fd);
        }

        let token = FdToken(self.fds.borrow_mut().insert(FdSlot {
            fd,
            flags: EventFlags::empty(),
            eof: false,
            error: false,
            cb: Some(Box::new(cb)),
        }));

        match self.with_poll(|p| p.register(fd, token.0.to_bits(), flags, false)) {
            Ok(()) => {
                self.notify_observer(fd, flags);
                if let Some(slot) = self.fds.borrow_mut().get_mut(token.0) {
                    slot.flags = flags;
                    slot.eof = false;
                    slot.error = false;
                }
                trace!(fd, ?flags, "fd watcher added");
                Ok(token)
            }
            Err(e) => {
                self.fds.borrow_mut().remove(token.0);
                Err(e)
            }
        }
    }

    /// Reconfigure a watcher's event mask. Empty flags behave as
    /// [`fd_delete`](Self::fd_delete).
    pub fn fd_modify(&self, token: FdToken, flags: EventFlags) -> Result<()> {
        if !flags.wants_io() {
            return self.fd_delete(token);
        }
        let fd = self
            .fds
            .borrow()
            .get(token.0)
            .map(|slot| slot.fd)
            .ok_or(Error::StaleToken)?;
        self.with_poll(|p| p.register(fd, token.0.to_bits(), flags, true))?;
        self.notify_observer(fd, flags);
        if let Some(slot) = self.fds.borrow_mut().get_mut(token.0) {
            slot.flags = flags;
            slot.eof = false;
            slot.error = false;
        }
        Ok(())
    }

    /// Deregister a watcher and free its slot.
    ///
    /// Safe from inside the watcher's own callback. Deleting a stale
    /// token (double delete) is a no-op returning `Ok(())`.
    pub fn fd_delete(&self, token: FdToken) -> Result<()> {
        self.batch.borrow_mut().null_token(token);

        let fd = match self.fds.borrow().get(token.0) {
            Some(slot) => slot.fd,
            None => return Ok(()),
        };

        self.notify_observer(fd, EventFlags::empty());

        /* end any in-flight re-invoke loop for this watcher */
        for frame in self.stack.borrow_mut().iter_mut() {
            if frame.token == token {
                frame.alive = false;
            }
        }

        let ret = self.with_poll(|p| p.unregister(fd));
        self.fds.borrow_mut().remove(token.0);
        trace!(fd, "fd watcher deleted");
        ret
    }

    /// True while the token's watcher is registered.
    #[must_use]
    pub fn fd_registered(&self, token: FdToken) -> bool {
        self.fds.borrow().contains(token.0)
    }

    /// Sticky EOF indication for the watcher (set once the peer hung up).
    #[must_use]
    pub fn fd_eof(&self, token: FdToken) -> bool {
        self.fds.borrow().get(token.0).is_some_and(|s| s.eof)
    }

    /// Sticky error indication for the watcher.
    #[must_use]
    pub fn fd_error(&self, token: FdToken) -> bool {
        self.fds.borrow().get(token.0).is_some_and(|s| s.error)
    }

    /// Install (or clear) the global fd registration observer.
    pub fn set_fd_observer(&self, observer: Option<FdObserver>) {
        *self.observer.borrow_mut() = observer;
    }

    fn notify_observer(&self, fd: RawFd, flags: EventFlags) {
        let taken = self.observer.borrow_mut().take();
        if let Some(mut cb) = taken {
            cb(fd, flags);
            let mut slot = self.observer.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    /* ---------------------------------------------------------------- */
    /* timeouts                                                         */
    /* ---------------------------------------------------------------- */

    /// Allocate a timeout slot. The slot persists across firings so the
    /// callback can re-arm itself; free it with
    /// [`timeout_drop`](Self::timeout_drop).
    pub fn timeout_new(&self, cb: impl FnMut(&EventLoop, TimerToken) + 'static) -> TimerToken {
        TimerToken(self.timeouts.borrow_mut().insert(TimeoutSlot {
            deadline: 0,
            pending: false,
            cb: Some(Box::new(cb)),
        }))
    }

    /// Arm the timeout at its stored absolute deadline.
    pub fn timeout_add(&self, token: TimerToken) -> Result<()> {
        let deadline = {
            let mut slots = self.timeouts.borrow_mut();
            let slot = slots.get_mut(token.0).ok_or(Error::StaleToken)?;
            if slot.pending {
                return Err(Error::AlreadyPending);
            }
            slot.pending = true;
            slot.deadline
        };
        self.timer_queue.borrow_mut().insert(token.0, deadline);
        Ok(())
    }

    /// Arm the timeout to fire `msecs` from now (cancelling any pending
    /// state first).
    pub fn timeout_set(&self, token: TimerToken, msecs: i64) -> Result<()> {
        if self.timeout_pending(token) {
            self.timeout_cancel(token)?;
        }
        {
            let mut slots = self.timeouts.borrow_mut();
            let slot = slots.get_mut(token.0).ok_or(Error::StaleToken)?;
            slot.deadline = time::deadline_after(time::now_ms(), msecs);
        }
        self.timeout_add(token)
    }

    /* arm at an absolute deadline; the interval fallback needs this */
    #[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
    fn timeout_arm_at(&self, token: TimerToken, deadline: i64) -> Result<()> {
        if self.timeout_pending(token) {
            self.timeout_cancel(token)?;
        }
        {
            let mut slots = self.timeouts.borrow_mut();
            let slot = slots.get_mut(token.0).ok_or(Error::StaleToken)?;
            slot.deadline = deadline;
        }
        self.timeout_add(token)
    }

    /// Disarm a pending timeout.
    pub fn timeout_cancel(&self, token: TimerToken) -> Result<()> {
        {
            let mut slots = self.timeouts.borrow_mut();
            let slot = slots.get_mut(token.0).ok_or(Error::NotPending)?;
            if !slot.pending {
                return Err(Error::NotPending);
            }
            slot.pending = false;
        }
        self.timer_queue.borrow_mut().remove(token.0);
        Ok(())
    }

    /// Disarm and free the slot. Stale tokens are a no-op.
    pub fn timeout_drop(&self, token: TimerToken) {
        let _ = self.timeout_cancel(token);
        self.timeouts.borrow_mut().remove(token.0);
    }

    /// Milliseconds until the deadline, clamped to i32. `None` when the
    /// timeout is not pending; negative once the deadline has passed.
    #[must_use]
    pub fn timeout_remaining(&self, token: TimerToken) -> Option<i32> {
        self.timeout_remaining64(token).map(time::clamp_i32)
    }

    /// 64-bit form of [`timeout_remaining`](Self::timeout_remaining).
    #[must_use]
    pub fn timeout_remaining64(&self, token: TimerToken) -> Option<i64> {
        let slots = self.timeouts.borrow();
        let slot = slots.get(token.0)?;
        slot.pending
            .then(|| time::until(slot.deadline, time::now_ms()))
    }

    /// True while the timeout is armed.
    #[must_use]
    pub fn timeout_pending(&self, token: TimerToken) -> bool {
        self.timeouts
            .borrow()
            .get(token.0)
            .is_some_and(|slot| slot.pending)
    }

    /*
     * Fire everything with deadline <= now, head first. Returns ms until
     * the next remaining deadline, None when the queue is empty. `now` is
     * sampled once per loop iteration, matching the dispatch contract.
     */
    fn process_timeouts(&self, now: i64) -> Option<i64> {
        loop {
            let (idx, deadline) = self.timer_queue.borrow().first()?;
            let diff = time::until(deadline, now);
            if diff > 0 {
                return Some(diff);
            }

            self.timer_queue.borrow_mut().remove(idx);
            let cb = {
                let mut slots = self.timeouts.borrow_mut();
                match slots.get_mut(idx) {
                    Some(slot) => {
                        slot.pending = false;
                        slot.cb.take()
                    }
                    None => None,
                }
            };
            if let Some(mut cb) = cb {
                cb(self, TimerToken(idx));
                /* put the callback back unless the slot went away */
                let mut slots = self.timeouts.borrow_mut();
                if let Some(slot) = slots.get_mut(idx)
                    && slot.cb.is_none()
                {
                    slot.cb = Some(cb);
                }
            }
        }
    }

    /* ---------------------------------------------------------------- */
    /* process watchers                                                 */
    /* ---------------------------------------------------------------- */

    /// Watch for the termination of `pid`. The callback fires once with
    /// the child's exit status and the watcher is removed.
    pub fn process_add(
        &self,
        pid: libc::pid_t,
        cb: impl FnMut(&EventLoop, ProcessToken, ExitStatus) + 'static,
    ) -> ProcessToken {
        let idx = self.processes.borrow_mut().insert(ProcessSlot {
            pid,
            cb: Some(Box::new(cb)),
        });
        self.process_list.borrow_mut().insert(idx, pid);
        trace!(pid, "process watcher added");
        ProcessToken(idx)
    }

    /// Remove a process watcher before it fires.
    pub fn process_delete(&self, token: ProcessToken) -> Result<()> {
        if self.processes.borrow_mut().remove(token.0).is_none() {
            return Err(Error::NotPending);
        }
        self.process_list.borrow_mut().remove(token.0);
        Ok(())
    }

    /// True while the watcher has not fired or been deleted.
    #[must_use]
    pub fn process_pending(&self, token: ProcessToken) -> bool {
        self.processes.borrow().contains(token.0)
    }

    /*
     * SIGCHLD arrived at some point: drain the kernel. One flag may stand
     * for many children; conversely a watcher whose PID never matches a
     * reaped child simply stays registered.
     */
    fn handle_processes(&self) {
        let _ = signal::take_sigchld();

        while let Some((pid, status)) = reaper::reap_next() {
            trace!(pid, raw = status.as_raw(), "reaped child");
            let matched = self.process_list.borrow().matches(pid);
            for idx in matched {
                self.process_list.borrow_mut().remove(idx);
                let slot = self.processes.borrow_mut().remove(idx);
                if let Some(mut slot) = slot
                    && let Some(mut cb) = slot.cb.take()
                {
                    cb(self, ProcessToken(idx), status);
                }
            }
        }
    }

    /* ---------------------------------------------------------------- */
    /* signal watchers                                                  */
    /* ---------------------------------------------------------------- */

    /// Subscribe to `signo` (1..=64). Installs the bridge handler unless
    /// it is already installed; the prior disposition is saved for
    /// [`signal_delete`](Self::signal_delete). Delivery does not remove
    /// the watcher.
    pub fn signal_add(
        &self,
        signo: i32,
        cb: impl FnMut(&EventLoop, SignalToken) + 'static,
    ) -> Result<SignalToken> {
        let saved = signal::subscribe(signo)?;
        let idx = self.signals.borrow_mut().insert(SignalSlot {
            signo,
            saved,
            cb: Some(Box::new(cb)),
        });
        self.signal_list.borrow_mut().insert(idx, signo);
        trace!(signo, "signal watcher added");
        Ok(SignalToken(idx))
    }

    /// Unsubscribe and restore the saved disposition iff the bridge
    /// handler is still the one installed.
    pub fn signal_delete(&self, token: SignalToken) -> Result<()> {
        let slot = self
            .signals
            .borrow_mut()
            .remove(token.0)
            .ok_or(Error::NotPending)?;
        self.signal_list.borrow_mut().remove(token.0);
        signal::unsubscribe(slot.signo, &slot.saved);
        trace!(signo = slot.signo, "signal watcher deleted");
        Ok(())
    }

    /// True while the watcher is subscribed.
    #[must_use]
    pub fn signal_pending(&self, token: SignalToken) -> bool {
        self.signals.borrow().contains(token.0)
    }

    /*
     * Bridge callback on the self-pipe read end: drain, collect the
     * signal numbers seen, then walk the watcher list once. N deliveries
     * of one signal between drains collapse into a single callback.
     */
    fn consume_signals(&self) {
        let rd = self.waker_rd.get();
        let mut seen = signal::SigSet64::default();
        let mut buf = [0u8; 32];
        loop {
            match fd::read_retry(rd, &mut buf) {
                Some(n) if n > 0 => {
                    for &byte in &buf[..n] {
                        seen.insert(i32::from(byte));
                    }
                }
                /* 0 = EOF, None = drained (EAGAIN) */
                _ => break,
            }
        }
        if seen.is_empty() {
            return;
        }

        let fired: Vec<SignalToken> = {
            let list = self.signal_list.borrow();
            let slots = self.signals.borrow();
            list.indices()
                .into_iter()
                .filter(|&idx| slots.get(idx).is_some_and(|s| seen.contains(s.signo)))
                .map(SignalToken)
                .collect()
        };
        for token in fired {
            let cb = {
                let mut slots = self.signals.borrow_mut();
                match slots.get_mut(token.0) {
                    Some(slot) => slot.cb.take(),
                    None => None,
                }
            };
            if let Some(mut cb) = cb {
                cb(self, token);
                let mut slots = self.signals.borrow_mut();
                if let Some(slot) = slots.get_mut(token.0)
                    && slot.cb.is_none()
                {
                    slot.cb = Some(cb);
                }
            }
        }
    }

    /* ---------------------------------------------------------------- */
    /* intervals                                                        */
    /* ---------------------------------------------------------------- */

    /// Start a periodic timer firing every `msecs` milliseconds.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn interval_set(
        &self,
        msecs: u64,
        cb: impl FnMut(&EventLoop, IntervalToken) + 'static,
    ) -> Result<IntervalToken> {
        let timer_fd = crate::poll::timer_create(msecs)?;
        let expirations = Rc::new(Cell::new(0u64));

        let token = IntervalToken(self.intervals.borrow_mut().insert(IntervalSlot {
            timer_fd,
            watcher: None,
            expirations: Rc::clone(&expirations),
        }));

        let mut cb = cb;
        let watcher = self.fd_add(timer_fd, EventFlags::READ, move |lp, _tok, _events| {
            let fired = crate::poll::timer_expirations(timer_fd);
            if fired == 0 {
                return;
            }
            expirations.set(expirations.get() + fired);
            cb(lp, token);
        });
        match watcher {
            Ok(w) => {
                if let Some(slot) = self.intervals.borrow_mut().get_mut(token.0) {
                    slot.watcher = Some(w);
                }
                Ok(token)
            }
            Err(e) => {
                self.intervals.borrow_mut().remove(token.0);
                fd::close(timer_fd);
                Err(e)
            }
        }
    }

    /// Start a periodic timer firing every `msecs` milliseconds.
    ///
    /// Without a kernel timer fd this rides on a re-arming timeout,
    /// advanced by whole periods so it does not drift.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn interval_set(
        &self,
        msecs: u64,
        cb: impl FnMut(&EventLoop, IntervalToken) + 'static,
    ) -> Result<IntervalToken> {
        let period = i64::try_from(msecs).unwrap_or(i64::MAX);
        let first = time::deadline_after(time::now_ms(), period);
        let expirations = Rc::new(Cell::new(0u64));

        let token = IntervalToken(self.intervals.borrow_mut().insert(IntervalSlot {
            period_ms: msecs,
            next_fire: first,
            timeout: None,
            expirations: Rc::clone(&expirations),
        }));

        let mut cb = cb;
        let ttok = self.timeout_new(move |lp, t| {
            let Some(next) = lp.interval_advance(token) else {
                return;
            };
            let _ = lp.timeout_arm_at(t, next);
            cb(lp, token);
        });
        {
            let mut slots = self.intervals.borrow_mut();
            if let Some(slot) = slots.get_mut(token.0) {
                slot.timeout = Some(ttok);
            }
        }
        if let Err(e) = self.timeout_arm_at(ttok, first) {
            self.timeout_drop(ttok);
            self.intervals.borrow_mut().remove(token.0);
            return Err(e);
        }
        Ok(token)
    }

    /* step next_fire past now by whole periods, counting expirations */
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn interval_advance(&self, token: IntervalToken) -> Option<i64> {
        let now = time::now_ms();
        let mut slots = self.intervals.borrow_mut();
        let slot = slots.get_mut(token.0)?;
        let period = i64::try_from(slot.period_ms).unwrap_or(i64::MAX).max(1);
        let mut fired = 0u64;
        while slot.next_fire <= now {
            slot.next_fire = time::deadline_after(slot.next_fire, period);
            fired += 1;
        }
        slot.expirations.set(slot.expirations.get() + fired);
        Some(slot.next_fire)
    }

    /// Stop and free an interval timer.
    pub fn interval_cancel(&self, token: IntervalToken) -> Result<()> {
        let slot = self
            .intervals
            .borrow_mut()
            .remove(token.0)
            .ok_or(Error::NotPending)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Some(watcher) = slot.watcher {
                let _ = self.fd_delete(watcher);
            }
            fd::close(slot.timer_fd);
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            if let Some(timeout) = slot.timeout {
                self.timeout_drop(timeout);
            }
        }
        Ok(())
    }

    /// Milliseconds until the interval next fires.
    #[must_use]
    pub fn interval_remaining(&self, token: IntervalToken) -> Option<i64> {
        let slots = self.intervals.borrow();
        let slot = slots.get(token.0)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            Some(crate::poll::timer_remaining_ms(slot.timer_fd))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            Some(time::until(slot.next_fire, time::now_ms()).max(0))
        }
    }

    /// Total periods elapsed since the interval was set.
    #[must_use]
    pub fn interval_expirations(&self, token: IntervalToken) -> Option<u64> {
        self.intervals
            .borrow()
            .get(token.0)
            .map(|slot| slot.expirations.get())
    }

    /* ---------------------------------------------------------------- */
    /* dispatch                                                         */
    /* ---------------------------------------------------------------- */

    fn with_poll<R>(&self, f: impl FnOnce(&Poller) -> Result<R>) -> Result<R> {
        match self.poll.borrow().as_ref() {
            Some(p) => f(p),
            None => Err(Error::Unregister(libc::EBADF)),
        }
    }

    fn load_batch(&self, raw: &[RawEvent]) {
        let mut batch = self.batch.borrow_mut();
        batch.reset();
        let mut fds = self.fds.borrow_mut();
        for (i, ev) in raw.iter().enumerate() {
            let idx = Index::from_bits(ev.data);
            if let Some(slot) = fds.get_mut(idx) {
                if ev.events.contains(EventFlags::EOF) {
                    slot.eof = true;
                }
                if ev.events.contains(EventFlags::ERROR) {
                    slot.error = true;
                }
                batch.entries[i] = Some((FdToken(idx), ev.events));
            } else {
                /* watcher died between registration and this fetch */
                batch.entries[i] = None;
            }
        }
        batch.n = raw.len();
    }

    /*
     * Block for readiness (or the timer deadline), then deliver at most
     * one callback. Un-consumed batch entries survive into the next pass
     * - and into nested run_events calls, which drain them first.
     */
    fn run_events(&self, timeout: Option<i64>) {
        if self.batch.borrow().is_empty() {
            let mut raw = [RawEvent::empty(); MAX_EVENTS];
            let n = self.with_poll(|p| Ok(p.fetch(&mut raw, timeout))).unwrap_or(0);
            self.load_batch(&raw[..n]);
        }

        loop {
            let entry = self.batch.borrow_mut().next();
            match entry {
                None => return,
                Some(None) => continue,
                Some(Some((token, events))) => {
                    if self.dispatch_fd(token, events) {
                        return;
                    }
                }
            }
        }
    }

    /* true when a callback was actually invoked */
    fn dispatch_fd(&self, token: FdToken, mut events: EventFlags) -> bool {
        let (edge, has_cb) = match self.fds.borrow().get(token.0) {
            Some(slot) => (slot.flags.contains(EventFlags::EDGE_TRIGGER), slot.cb.is_some()),
            None => return false,
        };
        if !has_cb {
            return false;
        }
        if edge && self.fold_into_stack(token, events) {
            return false;
        }

        self.stack.borrow_mut().push(StackFrame {
            token,
            alive: true,
            events: EventFlags::empty(),
        });

        loop {
            let cb = {
                let mut fds = self.fds.borrow_mut();
                match fds.get_mut(token.0) {
                    Some(slot) => slot.cb.take(),
                    None => None,
                }
            };
            let Some(mut cb) = cb else { break };

            trace!(?token, ?events, "fd dispatch");
            cb(self, token, events);

            {
                let mut fds = self.fds.borrow_mut();
                if let Some(slot) = fds.get_mut(token.0)
                    && slot.cb.is_none()
                {
                    slot.cb = Some(cb);
                }
            }

            /* events folded while the callback ran? go again */
            let buffered = {
                let mut stack = self.stack.borrow_mut();
                match stack.last_mut() {
                    Some(frame) if frame.token == token => {
                        let ev = frame.events & EventFlags::EVENT_MASK;
                        frame.events = EventFlags::empty();
                        (frame.alive && !ev.is_empty()).then_some(ev)
                    }
                    _ => None,
                }
            };
            match buffered {
                Some(ev) => events = ev,
                None => break,
            }
        }

        self.stack.borrow_mut().pop();
        true
    }

    /*
     * Fold an event for an fd whose callback is already on the stack.
     * Only edge-triggered fds fold: a level-triggered kernel re-reports,
     * an edge-triggered one does not, so the bits must not be dropped.
     */
    fn fold_into_stack(&self, token: FdToken, events: EventFlags) -> bool {
        let mut stack = self.stack.borrow_mut();
        for frame in stack.iter_mut() {
            if frame.token == token {
                if frame.alive {
                    frame.events |= events & EventFlags::EVENT_MASK;
                }
                return true;
            }
        }
        false
    }

    /* ---------------------------------------------------------------- */
    /* run                                                              */
    /* ---------------------------------------------------------------- */

    /// Run until cancelled. Returns the cancelling signal number, or 0.
    pub fn run(&self) -> i32 {
        self.run_timeout(-1)
    }

    /// Run until cancelled or `timeout_ms` elapsed (negative: no limit).
    ///
    /// Nestable: a callback may call `run_timeout` again; the inner
    /// deadline is scoped to the inner call. Returns the cancelling
    /// signal number, or 0.
    pub fn run_timeout(&self, timeout_ms: i64) -> i32 {
        if self.finished.get() {
            return 0;
        }
        self.depth.set(self.depth.get() + 1);

        let sentinel = if timeout_ms >= 0 {
            let tok = self.timeout_new(|lp: &EventLoop, _tok| {
                lp.deadline_reached.set(true);
            });
            let _ = self.timeout_set(tok, timeout_ms);
            Some(tok)
        } else {
            None
        };

        signal::reset_status();
        self.deadline_reached.set(false);

        loop {
            if signal::sigchld_pending() {
                self.handle_processes();
            }
            if signal::is_cancelled() {
                break;
            }

            let now = time::now_ms();
            let next = self.process_timeouts(now);

            if signal::is_cancelled() || self.deadline_reached.get() {
                break;
            }

            self.run_events(next);

            if signal::is_cancelled() || self.deadline_reached.get() {
                break;
            }
        }

        /* scoped per call: the enclosing run has its own sentinel */
        self.deadline_reached.set(false);
        if let Some(tok) = sentinel {
            self.timeout_drop(tok);
        }
        self.depth.set(self.depth.get() - 1);
        signal::status()
    }

    /// True while the loop is unwinding out of a cancellation - for
    /// callbacks that want to short-circuit their own work.
    #[must_use]
    pub fn cancelling(&self) -> bool {
        self.depth.get() > 0 && signal::is_cancelled()
    }

    /* ---------------------------------------------------------------- */
    /* teardown                                                         */
    /* ---------------------------------------------------------------- */

    /// Tear the loop down: restore signal handlers, close the backend
    /// and the self-pipe, drop every watcher (restoring user signal
    /// dispositions). Idempotent; also invoked by `Drop`.
    pub fn done(&self) {
        if self.finished.replace(true) {
            return;
        }
        debug!("event loop teardown");

        self.setup_signals(false);

        /* intervals first: they own timer fds and internal watchers */
        let live = self.intervals.borrow().live_indices();
        for idx in live {
            let _ = self.interval_cancel(IntervalToken(idx));
        }

        if let Some(token) = self.waker_token.take() {
            let _ = self.fd_delete(token);
        }
        fd::close(signal::take_waker_fd());
        fd::close(self.waker_rd.replace(-1));

        /* user signal watchers: restore each saved disposition */
        let live = self.signals.borrow().live_indices();
        for idx in live {
            let _ = self.signal_delete(SignalToken(idx));
        }

        *self.timer_queue.borrow_mut() = WatchList::new();
        let live = self.timeouts.borrow().live_indices();
        {
            let mut slots = self.timeouts.borrow_mut();
            for idx in live {
                slots.remove(idx);
            }
        }

        *self.process_list.borrow_mut() = WatchList::new();
        let live = self.processes.borrow().live_indices();
        {
            let mut slots = self.processes.borrow_mut();
            for idx in live {
                slots.remove(idx);
            }
        }

        let live = self.fds.borrow().live_indices();
        {
            let mut slots = self.fds.borrow_mut();
            for idx in live {
                slots.remove(idx);
            }
        }
        self.batch.borrow_mut().reset();

        /* closes the backend fd */
        *self.poll.borrow_mut() = None;

        signal::release_active();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.done();
    }
}
