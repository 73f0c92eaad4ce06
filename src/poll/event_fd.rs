//! eventfd wakeup channel
//!
//! An eventfd carries an 8-byte incrementing counter: writers add to it,
//! a read drains it to zero. Senders use it to make a blocked epoll wait
//! return.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;

/// Non-blocking eventfd.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is newly created and owned by this function.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Add one to the counter, waking any poller watching this descriptor.
    ///
    /// A write fails with EAGAIN only when the counter would overflow, in
    /// which case the receiver is guaranteed to be woken already; the write
    /// is retried until the kernel accepts it or fails for another reason.
    pub fn write_token(&self) -> io::Result<()> {
        let token: u64 = 1;
        let bytes = token.to_ne_bytes();
        loop {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                )
            };
            if n >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
    }

    /// Drain the counter, returning the accumulated token count.
    ///
    /// Returns 0 on a spurious wakeup (counter already drained).
    pub fn read_token(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let efd = EventFd::new().unwrap();
        efd.write_token().unwrap();
        efd.write_token().unwrap();
        assert_eq!(efd.read_token().unwrap(), 2);
        // Drained: next read is spurious.
        assert_eq!(efd.read_token().unwrap(), 0);
    }
}
