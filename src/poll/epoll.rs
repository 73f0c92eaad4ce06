//! epoll readiness multiplexer
//!
//! Level-triggered by default; callers opt into edge-triggered delivery per
//! descriptor via [`EV_EDGE`].

use std::io;
use std::os::unix::io::RawFd;

/// Descriptor is ready for reading.
pub const EV_READ: u32 = libc::EPOLLIN as u32;
/// Descriptor is ready for writing.
pub const EV_WRITE: u32 = libc::EPOLLOUT as u32;
/// Error condition on the descriptor.
pub const EV_ERROR: u32 = libc::EPOLLERR as u32;
/// Peer hangup.
pub const EV_HANGUP: u32 = libc::EPOLLHUP as u32;
/// Edge-triggered delivery for this descriptor.
pub const EV_EDGE: u32 = libc::EPOLLET as u32;

/// An epoll instance with the watched descriptor stored as the event payload.
///
/// All methods take `&self`: the kernel serializes control operations
/// against concurrent waits, so one thread may block in [`wait`] while
/// another adds or removes descriptors.
///
/// [`wait`]: Epoller::wait
#[derive(Debug)]
pub struct Epoller {
    epfd: RawFd,
}

impl Epoller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Watch `fd` for the given event mask.
    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Change the event mask of an already watched `fd`.
    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    /// Stop watching `fd`.
    ///
    /// ENOENT and EBADF are tolerated: the descriptor may already have been
    /// closed, which removes it from every epoll set.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let ret =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Block up to `timeout_ms` for ready descriptors.
    ///
    /// Fills `events` and returns the ready count; the `u64` payload of each
    /// entry is the raw descriptor. EINTR surfaces as `Interrupted` and the
    /// caller is expected to retry.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

// SAFETY: the wrapped descriptor is only used through thread-safe syscalls.
unsafe impl Send for Epoller {}
unsafe impl Sync for Epoller {}
