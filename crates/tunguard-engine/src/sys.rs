//! Thin wrappers over the few libc calls std and socket2 do not cover.
#![allow(unsafe_code)]

use std::io;
use std::os::fd::RawFd;

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl with F_GETFL/F_SETFL only reads and writes the descriptor's status flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0
            && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Soft limit on open descriptors for this process.
pub(crate) fn nofile_soft_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(limit.rlim_cur as u64)
}

/// Bytes queued in a stream socket's send buffer that the peer has not acknowledged yet.
pub(crate) fn unsent_bytes(fd: RawFd) -> io::Result<u32> {
    let mut value: libc::c_int = 0;
    // SAFETY: TIOCOUTQ (SIOCOUTQ for sockets) writes a single int through the pointer.
    if unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut value) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value.max(0) as u32)
}

/// Number of descriptors currently open in this process.
pub(crate) fn open_fd_count() -> io::Result<usize> {
    // The directory handle used for the listing is itself one of the entries.
    let count = std::fs::read_dir("/proc/self/fd")?.count();
    Ok(count.saturating_sub(1))
}
