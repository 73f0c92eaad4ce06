//! IO interface traits

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use crate::drive::error::DriveResult;
use crate::iomgr::manager::IoManager;
use crate::iomgr::reactor::Reactor;

/// Completion callback supplied by the caller of a drive interface.
///
/// Receives the opaque cookie of the submission and the signed result:
/// bytes transferred on success, a negative errno value on failure.
pub type CompletionCallback = Arc<dyn Fn(u64, i64) + Send + Sync>;

/// Discriminates registered interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// The built-in default interface.
    General,
    /// Block-device interface backed by the kernel async-IO ring.
    UringDrive,
}

/// Capability a subsystem exposes to the IO manager.
///
/// Lifecycle methods run inline on the reactor thread that is joining or
/// leaving the pool, before the loop starts dispatching (respectively after
/// it stopped). Implementations typically allocate or tear down per-thread
/// resources here and must not block indefinitely.
pub trait IoInterface: Send + Sync {
    fn interface_kind(&self) -> InterfaceKind;

    /// A reactor thread entered the io loop.
    fn on_io_thread_start(self: Arc<Self>, mgr: &Arc<IoManager>, reactor: &Arc<Reactor>);

    /// A reactor thread left the io loop.
    fn on_io_thread_stopped(self: Arc<Self>, mgr: &Arc<IoManager>, reactor: &Arc<Reactor>);
}

/// Block-device IO capability set.
///
/// Asynchronous submissions return immediately; the completion callback
/// attached via [`attach_completion_cb`] fires later on the submitting
/// thread with the submission's cookie and result. Synchronous variants are
/// positional reads/writes executed inline.
///
/// # Safety
///
/// The `async_*` methods hand raw buffers to the kernel and return before
/// the transfer finishes. The caller must keep every buffer (and for the
/// vectored forms, the iovec array's target buffers) valid and unaliased
/// until the completion callback for that cookie has fired.
///
/// [`attach_completion_cb`]: DriveInterface::attach_completion_cb
pub trait DriveInterface: IoInterface {
    /// Install the completion callback invoked for every async submission.
    fn attach_completion_cb(&self, cb: CompletionCallback);

    /// Open a device or file for direct IO. The caller's flags are combined
    /// with `O_DIRECT`; the returned descriptor belongs to the caller and is
    /// not registered with any multiplexer.
    fn open_dev(&self, path: &Path, oflags: i32) -> DriveResult<RawFd>;

    /// Track an externally opened device descriptor with a priority hint.
    fn add_device_fd(&self, fd: RawFd, pri: u8);

    fn sync_write(&self, fd: RawFd, data: &[u8], offset: u64) -> DriveResult<usize>;
    fn sync_writev(&self, fd: RawFd, iovs: &[IoSlice<'_>], offset: u64) -> DriveResult<usize>;
    fn sync_read(&self, fd: RawFd, data: &mut [u8], offset: u64) -> DriveResult<usize>;
    fn sync_readv(&self, fd: RawFd, iovs: &mut [IoSliceMut<'_>], offset: u64)
        -> DriveResult<usize>;

    /// Submit an asynchronous write of `size` bytes at `offset`.
    ///
    /// # Safety
    /// `data` must stay valid for `size` bytes until the completion callback
    /// fires for `cookie`.
    unsafe fn async_write(&self, fd: RawFd, data: *const u8, size: u32, offset: u64, cookie: u64);

    /// Submit an asynchronous vectored write totalling `size` bytes.
    ///
    /// # Safety
    /// `iovs` must point to `iovcnt` entries whose buffers stay valid until
    /// the completion callback fires for `cookie`.
    unsafe fn async_writev(
        &self,
        fd: RawFd,
        iovs: *const libc::iovec,
        iovcnt: i32,
        size: u32,
        offset: u64,
        cookie: u64,
    );

    /// Submit an asynchronous read of `size` bytes at `offset`.
    ///
    /// # Safety
    /// `data` must stay valid and exclusively borrowed for `size` bytes
    /// until the completion callback fires for `cookie`.
    unsafe fn async_read(&self, fd: RawFd, data: *mut u8, size: u32, offset: u64, cookie: u64);

    /// Submit an asynchronous vectored read totalling `size` bytes.
    ///
    /// # Safety
    /// `iovs` must point to `iovcnt` entries whose buffers stay valid and
    /// exclusively borrowed until the completion callback fires for `cookie`.
    unsafe fn async_readv(
        &self,
        fd: RawFd,
        iovs: *const libc::iovec,
        iovcnt: i32,
        size: u32,
        offset: u64,
        cookie: u64,
    );
}
