//! Kernel async-IO drive interface
//!
//! Each io thread owns a submission context: a fixed pool of control
//! blocks feeding an io_uring of the same capacity, and an eventfd the
//! ring signals on completion. The eventfd is registered with the reactor,
//! so completion harvesting runs inline on the submitting thread.
//!
//! The free stack is the single source of backpressure against the kernel
//! queue; it never grows. When a submission cannot proceed right now the
//! operation runs synchronously on the calling thread instead and the
//! completion callback still fires with the real result.

use std::cell::RefCell;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use io_uring::{opcode, types, IoUring};
use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::iface::traits::{CompletionCallback, DriveInterface, InterfaceKind, IoInterface};
use crate::iomgr::fd_info::{EvCallback, FdInfo};
use crate::iomgr::manager::IoManager;
use crate::iomgr::reactor::Reactor;
use crate::poll::{EventFd, EV_READ};

use super::error::DriveResult;
use super::metrics::DriveMetrics;

/// Submissions outstanding per thread; the kernel queue is sized to match.
pub const MAX_OUTSTANDING_IO: usize = 200;
/// Completions harvested per wakeup.
pub const MAX_COMPLETIONS: usize = MAX_OUTSTANDING_IO;

/// Drive interface tunables.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// Whether a synchronous fallback records its size into the direction
    /// histograms. The fallback replaces a submission that never recorded
    /// itself, so recording keeps the distributions complete at the cost of
    /// mixing fallback sizes into them.
    pub record_fallback_in_histograms: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            record_fallback_in_histograms: true,
        }
    }
}

impl DriveConfig {
    pub fn with_record_fallback_in_histograms(mut self, record: bool) -> Self {
        self.record_fallback_in_histograms = record;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoDirection {
    Read,
    Write,
}

/// Pre-allocated request control block.
///
/// Lives in exactly one place at any time: the free stack or the kernel
/// in-flight set. The slot index doubles as the ring's user data.
struct IocbInfo {
    direction: IoDirection,
    fd: RawFd,
    size: u32,
    offset: u64,
    cookie: u64,
    submitted_at: Instant,
    /// Owned copy of the caller's iovec array for vectored submissions;
    /// the kernel reads it until the completion arrives.
    iovs: Vec<libc::iovec>,
    /// The submission was given up on after entering the kernel queue; the
    /// eventual completion recycles the slot without a callback.
    abandoned: bool,
}

impl IocbInfo {
    fn vacant() -> Self {
        Self {
            direction: IoDirection::Read,
            fd: -1,
            size: 0,
            offset: 0,
            cookie: 0,
            submitted_at: Instant::now(),
            iovs: Vec::new(),
            abandoned: false,
        }
    }
}

impl fmt::Display for IocbInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dir={} size={} offset={} fd={}",
            match self.direction {
                IoDirection::Read => "read",
                IoDirection::Write => "write",
            },
            self.size,
            self.offset,
            self.fd
        )
    }
}

/// Per-thread submission context.
struct UringThreadContext {
    ring: IoUring,
    iocbs: Vec<IocbInfo>,
    free_slots: Vec<u16>,
    in_flight: usize,
    ev_fd: EventFd,
    ev_fd_info: Arc<FdInfo>,
}

impl UringThreadContext {
    #[cfg(debug_assertions)]
    fn assert_accounting(&self) {
        debug_assert_eq!(
            self.free_slots.len() + self.in_flight,
            MAX_OUTSTANDING_IO,
            "control block accounting violated"
        );
    }

    #[cfg(not(debug_assertions))]
    fn assert_accounting(&self) {}
}

thread_local! {
    static DRIVE_CTX: RefCell<Option<UringThreadContext>> = const { RefCell::new(None) };
}

/// What the caller handed to an async submission.
#[derive(Clone, Copy)]
enum SubmitBuf {
    ReadBuf(*mut u8),
    WriteBuf(*const u8),
    ReadVec(*const libc::iovec, i32),
    WriteVec(*const libc::iovec, i32),
}

impl SubmitBuf {
    fn direction(&self) -> IoDirection {
        match self {
            SubmitBuf::ReadBuf(_) | SubmitBuf::ReadVec(..) => IoDirection::Read,
            SubmitBuf::WriteBuf(_) | SubmitBuf::WriteVec(..) => IoDirection::Write,
        }
    }
}

enum SubmitOutcome {
    Submitted,
    FallbackEmptyIocb,
    FallbackEagain,
    Failed(i32),
}

/// Block-device interface backed by io_uring.
pub struct UringDriveInterface {
    config: DriveConfig,
    comp_cb: RwLock<Option<CompletionCallback>>,
    metrics: DriveMetrics,
    device_fds: RwLock<Vec<(RawFd, u8)>>,
    #[cfg(test)]
    force_eagain: std::sync::atomic::AtomicBool,
}

impl UringDriveInterface {
    pub fn new(config: DriveConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            comp_cb: RwLock::new(None),
            metrics: DriveMetrics::new(),
            device_fds: RwLock::new(Vec::new()),
            #[cfg(test)]
            force_eagain: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DriveConfig::default())
    }

    pub fn metrics(&self) -> &DriveMetrics {
        &self.metrics
    }

    #[cfg(test)]
    fn set_force_eagain(&self, force: bool) {
        self.force_eagain.store(force, Ordering::SeqCst);
    }

    /// Harvest ring completions for the calling thread.
    ///
    /// Wired as the callback of the per-thread completion eventfd: drains
    /// the token, reaps up to [`MAX_COMPLETIONS`] already-finished events
    /// without waiting, releases each control block, then invokes the
    /// completion callback per event. A wakeup with no token behind it is
    /// counted and ignored.
    pub fn process_completions(&self, _fd: RawFd, _cookie: u64, _events: u32) {
        let mut completions: Vec<(u64, i64)> = Vec::new();

        let spurious = DRIVE_CTX.with(|cell| {
            let mut slot = cell.borrow_mut();
            let Some(ctx) = slot.as_mut() else {
                return false;
            };

            let tokens = match ctx.ev_fd.read_token() {
                Ok(tokens) => tokens,
                Err(e) => {
                    error!(error = %e, "completion eventfd drain failed");
                    0
                }
            };
            if tokens == 0 {
                return true;
            }

            for _ in 0..MAX_COMPLETIONS {
                let Some(cqe) = ctx.ring.completion().next() else {
                    break;
                };
                let slot_idx = cqe.user_data() as usize;
                if slot_idx >= MAX_OUTSTANDING_IO {
                    error!(slot_idx, "completion for unknown control block");
                    continue;
                }
                let result = cqe.result() as i64;

                let iocb = &mut ctx.iocbs[slot_idx];
                trace!(
                    iocb = %iocb,
                    result,
                    elapsed_us = iocb.submitted_at.elapsed().as_micros() as u64,
                    "io completed"
                );
                let cookie = iocb.cookie;
                let abandoned = iocb.abandoned;
                iocb.iovs.clear();
                iocb.abandoned = false;

                ctx.free_slots.push(slot_idx as u16);
                ctx.in_flight -= 1;

                if result < 0 {
                    self.metrics.completion_errors.fetch_add(1, Ordering::Relaxed);
                }
                if !abandoned {
                    completions.push((cookie, result));
                }
            }
            ctx.assert_accounting();
            false
        });

        if spurious {
            self.metrics.spurious_events.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for (cookie, result) in completions {
            self.dispatch_completion(cookie, result);
        }
    }

    /// Reserve a control block and hand the operation to the kernel.
    ///
    /// # Safety
    /// The buffers behind `buf` must stay valid until the completion
    /// callback fires for `cookie` (or, for the fallback outcomes, until
    /// this call returns).
    unsafe fn submit(&self, fd: RawFd, buf: SubmitBuf, size: u32, offset: u64, cookie: u64) {
        let direction = buf.direction();

        let outcome = DRIVE_CTX.with(|cell| {
            let mut slot = cell.borrow_mut();
            // No context means the calling thread never joined the io loop;
            // same recovery as an exhausted pool.
            let Some(ctx) = slot.as_mut() else {
                return SubmitOutcome::FallbackEmptyIocb;
            };

            let Some(slot_idx) = ctx.free_slots.pop() else {
                return SubmitOutcome::FallbackEmptyIocb;
            };

            #[cfg(test)]
            if self.force_eagain.load(Ordering::SeqCst) {
                ctx.free_slots.push(slot_idx);
                return SubmitOutcome::FallbackEagain;
            }

            let iocb = &mut ctx.iocbs[slot_idx as usize];
            iocb.direction = direction;
            iocb.fd = fd;
            iocb.size = size;
            iocb.offset = offset;
            iocb.cookie = cookie;
            iocb.submitted_at = Instant::now();
            iocb.abandoned = false;
            iocb.iovs.clear();

            let entry = match buf {
                SubmitBuf::ReadBuf(ptr) => opcode::Read::new(types::Fd(fd), ptr, size)
                    .offset(offset)
                    .build(),
                SubmitBuf::WriteBuf(ptr) => opcode::Write::new(types::Fd(fd), ptr, size)
                    .offset(offset)
                    .build(),
                SubmitBuf::ReadVec(iov, cnt) => {
                    // SAFETY: the caller guarantees `iov` points to `cnt`
                    // valid entries for the duration of this call.
                    iocb.iovs.extend_from_slice(unsafe {
                        std::slice::from_raw_parts(iov, cnt as usize)
                    });
                    opcode::Readv::new(types::Fd(fd), iocb.iovs.as_ptr(), cnt as u32)
                        .offset(offset)
                        .build()
                }
                SubmitBuf::WriteVec(iov, cnt) => {
                    // SAFETY: as above.
                    iocb.iovs.extend_from_slice(unsafe {
                        std::slice::from_raw_parts(iov, cnt as usize)
                    });
                    opcode::Writev::new(types::Fd(fd), iocb.iovs.as_ptr(), cnt as u32)
                        .offset(offset)
                        .build()
                }
            }
            .user_data(slot_idx as u64);

            // SAFETY: the caller keeps the buffers alive until completion;
            // vectored arrays were copied into the control block above and
            // live until the slot is recycled.
            if unsafe { ctx.ring.submission().push(&entry) }.is_err() {
                // Kernel queue full right now.
                ctx.free_slots.push(slot_idx);
                return SubmitOutcome::FallbackEagain;
            }
            // The entry is queued: from here the slot counts as in flight.
            ctx.in_flight += 1;
            ctx.assert_accounting();

            loop {
                match ctx.ring.submit() {
                    Ok(_) => break,
                    Err(e)
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY)
                        ) =>
                    {
                        std::thread::yield_now();
                    }
                    Err(e) => {
                        // The entry stays queued and may still complete
                        // later; mark the block so that completion only
                        // recycles it.
                        error!(fd, error = %e, "ring submit failed");
                        ctx.iocbs[slot_idx as usize].abandoned = true;
                        return SubmitOutcome::Failed(
                            -e.raw_os_error().unwrap_or(libc::EIO),
                        );
                    }
                }
            }
            SubmitOutcome::Submitted
        });

        match outcome {
            SubmitOutcome::Submitted => match direction {
                IoDirection::Read => {
                    self.metrics.async_read_count.fetch_add(1, Ordering::Relaxed);
                    self.metrics.read_io_sizes.record(size as u64);
                }
                IoDirection::Write => {
                    self.metrics.async_write_count.fetch_add(1, Ordering::Relaxed);
                    self.metrics.write_io_sizes.record(size as u64);
                }
            },
            SubmitOutcome::FallbackEmptyIocb => {
                self.metrics
                    .force_sync_io_empty_iocb
                    .fetch_add(1, Ordering::Relaxed);
                self.sync_fallback(fd, buf, size, offset, cookie);
            }
            SubmitOutcome::FallbackEagain => {
                self.metrics
                    .force_sync_io_eagain_error
                    .fetch_add(1, Ordering::Relaxed);
                self.sync_fallback(fd, buf, size, offset, cookie);
            }
            SubmitOutcome::Failed(err) => {
                match direction {
                    IoDirection::Read => self
                        .metrics
                        .read_io_submission_errors
                        .fetch_add(1, Ordering::Relaxed),
                    IoDirection::Write => self
                        .metrics
                        .write_io_submission_errors
                        .fetch_add(1, Ordering::Relaxed),
                };
                self.dispatch_completion(cookie, err as i64);
            }
        }
    }

    /// Run the operation synchronously on the calling thread and synthesize
    /// its completion with the real result.
    ///
    /// # Safety
    /// Same buffer contract as [`submit`](Self::submit); the buffers only
    /// need to live for the duration of this call.
    unsafe fn sync_fallback(&self, fd: RawFd, buf: SubmitBuf, size: u32, offset: u64, cookie: u64) {
        debug!(fd, size, offset, "falling back to synchronous io");
        let record = self.config.record_fallback_in_histograms;
        let result = match buf {
            SubmitBuf::ReadBuf(ptr) => self.counted_pread(fd, ptr, size as usize, offset, record),
            SubmitBuf::WriteBuf(ptr) => self.counted_pwrite(fd, ptr, size as usize, offset, record),
            SubmitBuf::ReadVec(iov, cnt) => self.counted_preadv(fd, iov, cnt, size, offset, record),
            SubmitBuf::WriteVec(iov, cnt) => {
                self.counted_pwritev(fd, iov, cnt, size, offset, record)
            }
        };
        self.dispatch_completion(cookie, result);
    }

    fn dispatch_completion(&self, cookie: u64, result: i64) {
        let cb = self.comp_cb.read().clone();
        match cb {
            Some(cb) => cb(cookie, result),
            None => warn!(cookie, result, "completion dropped: no callback attached"),
        }
    }

    fn counted_pread(
        &self,
        fd: RawFd,
        ptr: *mut u8,
        size: usize,
        offset: u64,
        record_size: bool,
    ) -> i64 {
        self.metrics.sync_read_count.fetch_add(1, Ordering::Relaxed);
        if record_size {
            self.metrics.read_io_sizes.record(size as u64);
        }
        signed_result(pread_raw(fd, ptr, size, offset))
    }

    fn counted_pwrite(
        &self,
        fd: RawFd,
        ptr: *const u8,
        size: usize,
        offset: u64,
        record_size: bool,
    ) -> i64 {
        self.metrics.sync_write_count.fetch_add(1, Ordering::Relaxed);
        if record_size {
            self.metrics.write_io_sizes.record(size as u64);
        }
        signed_result(pwrite_raw(fd, ptr, size, offset))
    }

    fn counted_preadv(
        &self,
        fd: RawFd,
        iov: *const libc::iovec,
        cnt: i32,
        size: u32,
        offset: u64,
        record_size: bool,
    ) -> i64 {
        self.metrics.sync_read_count.fetch_add(1, Ordering::Relaxed);
        if record_size {
            self.metrics.read_io_sizes.record(size as u64);
        }
        signed_result(preadv_raw(fd, iov, cnt, offset))
    }

    fn counted_pwritev(
        &self,
        fd: RawFd,
        iov: *const libc::iovec,
        cnt: i32,
        size: u32,
        offset: u64,
        record_size: bool,
    ) -> i64 {
        self.metrics.sync_write_count.fetch_add(1, Ordering::Relaxed);
        if record_size {
            self.metrics.write_io_sizes.record(size as u64);
        }
        signed_result(pwritev_raw(fd, iov, cnt, offset))
    }
}

impl IoInterface for UringDriveInterface {
    fn interface_kind(&self) -> InterfaceKind {
        InterfaceKind::UringDrive
    }

    /// Allocate this thread's submission context and wire its completion
    /// eventfd into the reactor.
    fn on_io_thread_start(self: Arc<Self>, mgr: &Arc<IoManager>, reactor: &Arc<Reactor>) {
        let occupied = DRIVE_CTX.with(|cell| cell.borrow().is_some());
        if occupied {
            warn!(
                thread = reactor.thread_num(),
                "drive context already present on this thread"
            );
            return;
        }

        let ring = match IoUring::new(MAX_OUTSTANDING_IO as u32) {
            Ok(ring) => ring,
            Err(e) => {
                error!(thread = reactor.thread_num(), error = %e, "io_uring setup failed");
                return;
            }
        };
        let ev_fd = match EventFd::new() {
            Ok(ev_fd) => ev_fd,
            Err(e) => {
                error!(thread = reactor.thread_num(), error = %e, "completion eventfd failed");
                return;
            }
        };
        if let Err(e) = ring.submitter().register_eventfd(ev_fd.as_raw_fd()) {
            error!(thread = reactor.thread_num(), error = %e, "eventfd registration failed");
            return;
        }

        let weak = Arc::downgrade(&self);
        let cb: EvCallback = Arc::new(move |fd, cookie, events| {
            if let Some(drive) = weak.upgrade() {
                drive.process_completions(fd, cookie, events);
            }
        });
        let iface: Arc<dyn IoInterface> = Arc::clone(&self) as Arc<dyn IoInterface>;
        let ev_fd_info = match mgr.add_fd(
            &iface,
            ev_fd.as_raw_fd(),
            cb,
            EV_READ,
            9,
            0,
            true,
        ) {
            Ok(info) => info,
            Err(e) => {
                error!(thread = reactor.thread_num(), error = %e, "completion fd registration failed");
                return;
            }
        };

        let ctx = UringThreadContext {
            ring,
            iocbs: (0..MAX_OUTSTANDING_IO).map(|_| IocbInfo::vacant()).collect(),
            free_slots: (0..MAX_OUTSTANDING_IO as u16).rev().collect(),
            in_flight: 0,
            ev_fd,
            ev_fd_info,
        };
        DRIVE_CTX.with(|cell| *cell.borrow_mut() = Some(ctx));
        debug!(thread = reactor.thread_num(), "drive submission context ready");
    }

    /// Tear down this thread's submission context.
    fn on_io_thread_stopped(self: Arc<Self>, mgr: &Arc<IoManager>, reactor: &Arc<Reactor>) {
        let ctx = DRIVE_CTX.with(|cell| cell.borrow_mut().take());
        let Some(ctx) = ctx else {
            return;
        };
        if ctx.in_flight > 0 {
            warn!(
                thread = reactor.thread_num(),
                in_flight = ctx.in_flight,
                "dropping drive context with operations in flight"
            );
        }
        let iface: Arc<dyn IoInterface> = Arc::clone(&self) as Arc<dyn IoInterface>;
        mgr.remove_fd(&iface, &ctx.ev_fd_info);
        // Ring and eventfd close when the context drops.
        debug!(thread = reactor.thread_num(), "drive submission context destroyed");
    }
}

impl DriveInterface for UringDriveInterface {
    fn attach_completion_cb(&self, cb: CompletionCallback) {
        *self.comp_cb.write() = Some(cb);
    }

    fn open_dev(&self, path: &Path, oflags: i32) -> DriveResult<RawFd> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if oflags & libc::O_CREAT != 0 {
            opts.create(true);
        }
        opts.custom_flags(oflags | libc::O_DIRECT);

        let file = opts.open(path)?;
        let fd = file.into_raw_fd();
        self.add_device_fd(fd, 9);
        info!(path = %path.display(), fd, "device opened for direct io");
        Ok(fd)
    }

    fn add_device_fd(&self, fd: RawFd, pri: u8) {
        self.device_fds.write().push((fd, pri));
    }

    fn sync_write(&self, fd: RawFd, data: &[u8], offset: u64) -> DriveResult<usize> {
        self.metrics.sync_write_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.write_io_sizes.record(data.len() as u64);
        Ok(pwrite_raw(fd, data.as_ptr(), data.len(), offset)?)
    }

    fn sync_writev(&self, fd: RawFd, iovs: &[IoSlice<'_>], offset: u64) -> DriveResult<usize> {
        let total: usize = iovs.iter().map(|iov| iov.len()).sum();
        self.metrics.sync_write_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.write_io_sizes.record(total as u64);
        // IoSlice is ABI-compatible with iovec.
        Ok(pwritev_raw(
            fd,
            iovs.as_ptr() as *const libc::iovec,
            iovs.len() as i32,
            offset,
        )?)
    }

    fn sync_read(&self, fd: RawFd, data: &mut [u8], offset: u64) -> DriveResult<usize> {
        self.metrics.sync_read_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.read_io_sizes.record(data.len() as u64);
        Ok(pread_raw(fd, data.as_mut_ptr(), data.len(), offset)?)
    }

    fn sync_readv(
        &self,
        fd: RawFd,
        iovs: &mut [IoSliceMut<'_>],
        offset: u64,
    ) -> DriveResult<usize> {
        let total: usize = iovs.iter().map(|iov| iov.len()).sum();
        self.metrics.sync_read_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.read_io_sizes.record(total as u64);
        Ok(preadv_raw(
            fd,
            iovs.as_ptr() as *const libc::iovec,
            iovs.len() as i32,
            offset,
        )?)
    }

    unsafe fn async_write(&self, fd: RawFd, data: *const u8, size: u32, offset: u64, cookie: u64) {
        self.submit(fd, SubmitBuf::WriteBuf(data), size, offset, cookie);
    }

    unsafe fn async_writev(
        &self,
        fd: RawFd,
        iovs: *const libc::iovec,
        iovcnt: i32,
        size: u32,
        offset: u64,
        cookie: u64,
    ) {
        self.submit(fd, SubmitBuf::WriteVec(iovs, iovcnt), size, offset, cookie);
    }

    unsafe fn async_read(&self, fd: RawFd, data: *mut u8, size: u32, offset: u64, cookie: u64) {
        self.submit(fd, SubmitBuf::ReadBuf(data), size, offset, cookie);
    }

    unsafe fn async_readv(
        &self,
        fd: RawFd,
        iovs: *const libc::iovec,
        iovcnt: i32,
        size: u32,
        offset: u64,
        cookie: u64,
    ) {
        self.submit(fd, SubmitBuf::ReadVec(iovs, iovcnt), size, offset, cookie);
    }
}

fn signed_result(res: std::io::Result<usize>) -> i64 {
    match res {
        Ok(bytes) => bytes as i64,
        Err(e) => -(e.raw_os_error().unwrap_or(libc::EIO) as i64),
    }
}

fn pread_raw(fd: RawFd, ptr: *mut u8, size: usize, offset: u64) -> std::io::Result<usize> {
    loop {
        let n = unsafe { libc::pread(fd, ptr as *mut libc::c_void, size, offset as libc::off_t) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn pwrite_raw(fd: RawFd, ptr: *const u8, size: usize, offset: u64) -> std::io::Result<usize> {
    loop {
        let n =
            unsafe { libc::pwrite(fd, ptr as *const libc::c_void, size, offset as libc::off_t) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn preadv_raw(
    fd: RawFd,
    iov: *const libc::iovec,
    iovcnt: i32,
    offset: u64,
) -> std::io::Result<usize> {
    loop {
        let n = unsafe { libc::preadv(fd, iov, iovcnt, offset as libc::off_t) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn pwritev_raw(
    fd: RawFd,
    iov: *const libc::iovec,
    iovcnt: i32,
    offset: u64,
) -> std::io::Result<usize> {
    loop {
        let n = unsafe { libc::pwritev(fd, iov, iovcnt, offset as libc::off_t) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iomgr::manager::{IoManager, IomgrConfig};
    use crate::iomgr::state::IomgrState;
    use std::io::Write;
    use std::sync::mpsc;
    use std::time::Duration;

    fn wait_for_running(mgr: &Arc<IoManager>) {
        for _ in 0..500 {
            if mgr.state() == IomgrState::Running {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("manager never reached running state");
    }

    fn start_with_drive(num_threads: usize) -> (Arc<IoManager>, Arc<UringDriveInterface>) {
        let mgr = IoManager::new(IomgrConfig::default());
        mgr.start(1, num_threads, None);
        let drive = UringDriveInterface::with_defaults();
        mgr.add_drive_interface(Arc::clone(&drive) as Arc<dyn DriveInterface>, true);
        wait_for_running(&mgr);
        (mgr, drive)
    }

    #[test]
    fn test_sync_write_read_roundtrip() {
        let drive = UringDriveInterface::with_defaults();
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();

        let written = drive.sync_write(fd, b"hello drive", 0).unwrap();
        assert_eq!(written, 11);

        let mut buf = [0u8; 11];
        let read = drive.sync_read(fd, &mut buf, 0).unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello drive");

        assert_eq!(drive.metrics().snapshot().sync_write_count, 1);
        assert_eq!(drive.metrics().snapshot().sync_read_count, 1);
    }

    #[test]
    fn test_sync_vectored_roundtrip() {
        let drive = UringDriveInterface::with_defaults();
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();

        let parts = [IoSlice::new(b"vec"), IoSlice::new(b"tored")];
        let written = drive.sync_writev(fd, &parts, 0).unwrap();
        assert_eq!(written, 8);

        let mut a = [0u8; 3];
        let mut b = [0u8; 5];
        let mut bufs = [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)];
        let read = drive.sync_readv(fd, &mut bufs, 0).unwrap();
        assert_eq!(read, 8);
        assert_eq!(&a, b"vec");
        assert_eq!(&b, b"tored");
    }

    #[test]
    fn test_submit_without_context_falls_back_to_sync() {
        let drive = UringDriveInterface::with_defaults();
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();

        let (tx, rx) = mpsc::channel();
        drive.attach_completion_cb(Arc::new(move |cookie, result| {
            tx.send((cookie, result)).unwrap();
        }));

        let data = b"fallback write".to_vec();
        // This thread runs no io loop, so there is no submission context.
        unsafe {
            drive.async_write(fd, data.as_ptr(), data.len() as u32, 0, 42);
        }

        let (cookie, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cookie, 42);
        assert_eq!(result, data.len() as i64);
        assert_eq!(drive.metrics().snapshot().force_sync_io_empty_iocb, 1);

        let mut buf = vec![0u8; data.len()];
        drive.sync_read(fd, &mut buf, 0).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_eagain_fallback_completes_synchronously() {
        let (mgr, drive) = start_with_drive(1);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 4096]).unwrap();
        let fd = file.as_file().as_raw_fd();

        let (tx, rx) = mpsc::channel();
        drive.attach_completion_cb(Arc::new(move |cookie, result| {
            tx.send((cookie, result)).unwrap();
        }));
        drive.set_force_eagain(true);

        let data = vec![7u8; 4096];
        let addr = data.as_ptr() as usize;
        let submit_drive = Arc::clone(&drive);
        mgr.run_in_io_thread(move || unsafe {
            submit_drive.async_write(fd, addr as *const u8, 4096, 0, 7);
        })
        .unwrap();

        let (cookie, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cookie, 7);
        assert_eq!(result, 4096);
        assert_eq!(drive.metrics().snapshot().force_sync_io_eagain_error, 1);
        drop(data);

        mgr.stop();
        assert_eq!(mgr.state(), IomgrState::Stopped);
    }

    #[test]
    fn test_async_write_read_roundtrip_through_ring() {
        let (mgr, drive) = start_with_drive(1);

        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();

        let (tx, rx) = mpsc::channel();
        drive.attach_completion_cb(Arc::new(move |cookie, result| {
            tx.send((cookie, result)).unwrap();
        }));

        let payload = vec![0xabu8; 8192];
        let write_addr = payload.as_ptr() as usize;
        let submit_drive = Arc::clone(&drive);
        mgr.run_in_io_thread(move || unsafe {
            submit_drive.async_write(fd, write_addr as *const u8, 8192, 0, 1);
        })
        .unwrap();
        let (cookie, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cookie, 1);
        assert_eq!(result, 8192);

        let mut read_buf = vec![0u8; 8192];
        let read_addr = read_buf.as_mut_ptr() as usize;
        let submit_drive = Arc::clone(&drive);
        mgr.run_in_io_thread(move || unsafe {
            submit_drive.async_read(fd, read_addr as *mut u8, 8192, 0, 2);
        })
        .unwrap();
        let (cookie, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cookie, 2);
        assert_eq!(result, 8192);
        assert!(read_buf.iter().all(|&b| b == 0xab));

        let snap = drive.metrics().snapshot();
        assert_eq!(snap.async_write_count, 1);
        assert_eq!(snap.async_read_count, 1);

        mgr.stop();
    }

    #[test]
    fn test_open_dev_rejects_missing_path() {
        let drive = UringDriveInterface::with_defaults();
        assert!(drive.open_dev(Path::new("/nonexistent/dev"), 0).is_err());
    }
}
