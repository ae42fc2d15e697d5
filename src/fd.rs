/*
 * fd.rs
 *
 * Thin fd plumbing over libc: pipe creation, fcntl mode switches, reads
 * and writes that retry EINTR in place. Everything the bridge and the
 * watcher registration path need, nothing more.
 */

use crate::error::{Error, Result, errno};

pub type RawFd = i32;

/// Switch an fd to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl F_GETFL/F_SETFL on a caller-supplied fd; both calls
    // share the fd-validity invariant and fail cleanly on a bad fd.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    let ret = unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 {
            fl
        } else {
            libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK)
        }
    };
    if ret < 0 {
        return Err(Error::Register(errno()));
    }
    Ok(())
}

/// Mark an fd close-on-exec.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl F_GETFD/F_SETFD on a caller-supplied fd; both calls
    // share the fd-validity invariant and fail cleanly on a bad fd.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    let ret = unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFD);
        if fl < 0 {
            fl
        } else {
            libc::fcntl(fd, libc::F_SETFD, fl | libc::FD_CLOEXEC)
        }
    };
    if ret < 0 {
        return Err(Error::Register(errno()));
    }
    Ok(())
}

/// Create the self-pipe: both ends non-blocking and close-on-exec.
/// Returns (read end, write end).
pub(crate) fn waker_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is a valid 2-element array; pipe() writes exactly 2 fds.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(Error::PipeInit(errno()));
    }
    let (rd, wr) = (fds[0], fds[1]);

    for fd in [rd, wr] {
        if set_cloexec(fd).is_err() || set_nonblocking(fd).is_err() {
            let err = errno();
            close(rd);
            close(wr);
            return Err(Error::PipeInit(err));
        }
    }
    Ok((rd, wr))
}

/// Read retrying EINTR. Returns bytes read; 0 for EOF; -1 with EAGAIN
/// semantics folded in (None) when nothing is available.
pub(crate) fn read_retry(fd: RawFd, buf: &mut [u8]) -> Option<usize> {
    loop {
        // SAFETY: buf is a valid writable slice and len bounds the write.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Some(n as usize);
        }
        if errno() == libc::EINTR {
            continue;
        }
        return None;
    }
}

/// Best-effort close; EBADF and EINTR are ignored on purpose.
pub(crate) fn close(fd: RawFd) {
    if fd >= 0 {
        // SAFETY: close on any int is memory-safe; errors are irrelevant
        // on the teardown paths this is used from.
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waker_pipe_modes() {
        let (rd, wr) = waker_pipe().unwrap();
        // SAFETY: rd/wr are valid fds from waker_pipe.
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        let (fl_rd, fd_rd) = unsafe {
            (libc::fcntl(rd, libc::F_GETFL), libc::fcntl(rd, libc::F_GETFD))
        };
        assert!(fl_rd & libc::O_NONBLOCK != 0, "read end not non-blocking");
        assert!(fd_rd & libc::FD_CLOEXEC != 0, "read end not cloexec");
        close(rd);
        close(wr);
    }

    #[test]
    fn test_read_retry_drains_then_blocks() {
        let (rd, wr) = waker_pipe().unwrap();
        // SAFETY: wr is a valid pipe write end, writing 1 byte from a local.
        unsafe {
            let byte = 0x41u8;
            libc::write(wr, (&raw const byte).cast(), 1);
        }
        let mut buf = [0u8; 8];
        assert_eq!(read_retry(rd, &mut buf), Some(1));
        assert_eq!(buf[0], 0x41);
        /* empty non-blocking pipe: EAGAIN maps to None */
        assert_eq!(read_retry(rd, &mut buf), None);
        close(rd);
        close(wr);
    }

    #[test]
    fn test_set_nonblocking_bad_fd() {
        assert!(set_nonblocking(-1).is_err());
    }
}
