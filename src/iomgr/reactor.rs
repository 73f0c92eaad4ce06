//! Per-thread reactor
//!
//! One reactor per io thread: an epoll instance multiplexing user
//! descriptors and the thread's message eventfd, a bounded MPMC queue fed
//! by other threads, and the cooperative event loop dispatching both.
//!
//! The reactor object is shared: the owning thread runs the loop, other
//! threads enqueue messages, write wakeup tokens, and attach global
//! descriptors. The kernel serializes epoll control operations against the
//! blocked wait, so cross-thread attach needs no handshake with the loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::iface::traits::IoInterface;
use crate::poll::{Epoller, EventFd, EV_READ, EV_WRITE};

use super::error::{IomgrError, IomgrResult};
use super::fd_info::{FdDirection, FdInfo};
use super::manager::IoManager;
use super::metrics::ReactorMetrics;
use super::msg::{IomgrMsg, MsgHandler};

/// Predicate deciding whether a thread accepts a descriptor.
pub type FdSelector = Arc<dyn Fn(&Arc<FdInfo>) -> bool + Send + Sync>;

const MAX_EVENTS: usize = 64;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Reactor>>> = const { RefCell::new(None) };
}

pub struct Reactor {
    thread_num: u32,
    listen_timeout_ms: i32,
    is_io_thread: AtomicBool,
    is_iomgr_thread: AtomicBool,
    keep_running: AtomicBool,
    metrics: ReactorMetrics,
    msg_q: ArrayQueue<IomgrMsg>,
    poller: RwLock<Option<Epoller>>,
    msg_fd: RwLock<Option<EventFd>>,
    msg_fd_info: RwLock<Option<Arc<FdInfo>>>,
    fds: Mutex<HashMap<RawFd, Arc<FdInfo>>>,
    selector: RwLock<Option<FdSelector>>,
    msg_handler: RwLock<Option<MsgHandler>>,
}

impl Reactor {
    pub(crate) fn new(thread_num: u32, queue_capacity: usize, listen_timeout_ms: i32) -> Arc<Self> {
        Arc::new(Self {
            thread_num,
            listen_timeout_ms,
            is_io_thread: AtomicBool::new(false),
            is_iomgr_thread: AtomicBool::new(false),
            keep_running: AtomicBool::new(true),
            metrics: ReactorMetrics::new(),
            msg_q: ArrayQueue::new(queue_capacity),
            poller: RwLock::new(None),
            msg_fd: RwLock::new(None),
            msg_fd_info: RwLock::new(None),
            fds: Mutex::new(HashMap::new()),
            selector: RwLock::new(None),
            msg_handler: RwLock::new(None),
        })
    }

    /// The reactor bound to the calling thread, if it runs an io loop.
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn thread_num(&self) -> u32 {
        self.thread_num
    }

    pub fn is_io_thread(&self) -> bool {
        self.is_io_thread.load(Ordering::Acquire)
    }

    pub fn is_iomgr_thread(&self) -> bool {
        self.is_iomgr_thread.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &ReactorMetrics {
        &self.metrics
    }

    /// Load-balancing metric; stale reads are fine.
    pub(crate) fn op_count(&self) -> u64 {
        self.metrics.io_count.load(Ordering::Relaxed)
    }

    /// Whether the attached descriptor set contains `fd`.
    pub fn has_fd(&self, fd: RawFd) -> bool {
        self.fds.lock().contains_key(&fd)
    }

    pub(crate) fn accepts(&self, info: &Arc<FdInfo>) -> bool {
        match self.selector.read().as_ref() {
            Some(selector) => selector(info),
            None => true,
        }
    }

    /// Add a descriptor to this thread's multiplexer.
    pub(crate) fn add_fd_to_thread(&self, info: &Arc<FdInfo>) -> IomgrResult<()> {
        let guard = self.poller.read();
        let poller = guard.as_ref().ok_or(IomgrError::NotIoThread)?;
        poller.add(info.fd(), info.events())?;
        self.fds.lock().insert(info.fd(), Arc::clone(info));
        trace!(
            thread = self.thread_num,
            fd = info.fd(),
            "fd added to io thread"
        );
        Ok(())
    }

    /// Remove a descriptor from this thread's multiplexer.
    pub(crate) fn remove_fd_from_thread(&self, info: &Arc<FdInfo>) -> IomgrResult<()> {
        let guard = self.poller.read();
        let poller = guard.as_ref().ok_or(IomgrError::NotIoThread)?;
        self.fds.lock().remove(&info.fd());
        poller.remove(info.fd())?;
        trace!(
            thread = self.thread_num,
            fd = info.fd(),
            "fd removed from io thread"
        );
        Ok(())
    }

    /// Enqueue a message for this thread. The sender follows up with a
    /// wakeup token on the message descriptor.
    ///
    /// The queue is bounded; a full queue applies backpressure to the
    /// sender until the loop drains.
    pub(crate) fn put_msg(&self, msg: IomgrMsg) {
        let mut msg = msg;
        loop {
            match self.msg_q.push(msg) {
                Ok(()) => return,
                Err(back) => {
                    msg = back;
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Enqueue plus wakeup token. Gives the message back when this thread
    /// is not (or no longer) accepting deliveries.
    pub(crate) fn deliver(&self, msg: IomgrMsg) -> Result<(), IomgrMsg> {
        if !self.is_io_thread() {
            return Err(msg);
        }
        let guard = self.msg_fd.read();
        let Some(msg_fd) = guard.as_ref() else {
            return Err(msg);
        };
        trace!(thread = self.thread_num, tag = msg.tag(), "delivering msg");
        self.put_msg(msg);
        if let Err(e) = msg_fd.write_token() {
            error!(thread = self.thread_num, error = %e, "wakeup token write failed");
        }
        Ok(())
    }

    /// Run the io loop on the calling thread until relinquished.
    pub(crate) fn run(
        self: &Arc<Self>,
        mgr: &Arc<IoManager>,
        is_iomgr_thread: bool,
        selector: Option<FdSelector>,
        msg_handler: Option<MsgHandler>,
    ) -> IomgrResult<()> {
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(self)));

        let res = self.iothread_init(mgr, is_iomgr_thread, selector, msg_handler);
        match res {
            Ok(()) => {
                mgr.io_thread_started(is_iomgr_thread);
                self.listen(mgr);
                self.teardown(mgr);
                mgr.io_thread_stopped();
            }
            Err(ref e) => {
                error!(thread = self.thread_num, error = %e, "io thread init failed");
            }
        }

        CURRENT.with(|c| *c.borrow_mut() = None);
        res
    }

    fn iothread_init(
        self: &Arc<Self>,
        mgr: &Arc<IoManager>,
        is_iomgr_thread: bool,
        selector: Option<FdSelector>,
        msg_handler: Option<MsgHandler>,
    ) -> IomgrResult<()> {
        self.keep_running.store(true, Ordering::Release);
        self.is_iomgr_thread.store(is_iomgr_thread, Ordering::Release);
        *self.selector.write() = selector;
        *self.msg_handler.write() = msg_handler;

        let poller = Epoller::new()?;
        let msg_fd = EventFd::new()?;

        let owner: Weak<dyn IoInterface> = match mgr.default_interface() {
            Some(iface) => Arc::downgrade(&iface),
            None => Weak::<crate::iface::DefaultIoInterface>::new(),
        };
        // The message fd is drained inline by the loop; the callback slot is
        // never dispatched.
        let info = FdInfo::new(
            owner,
            msg_fd.as_raw_fd(),
            Arc::new(|_, _, _| {}),
            EV_READ,
            1,
            0,
            false,
        );
        // Level-triggered read interest: a token left behind re-arms the
        // next wait.
        poller.add(msg_fd.as_raw_fd(), EV_READ)?;

        self.fds.lock().insert(msg_fd.as_raw_fd(), Arc::clone(&info));
        *self.poller.write() = Some(poller);
        *self.msg_fd.write() = Some(msg_fd);
        *self.msg_fd_info.write() = Some(info);
        self.is_io_thread.store(true, Ordering::Release);

        debug!(
            thread = self.thread_num,
            iomgr_thread = is_iomgr_thread,
            "io thread initialized"
        );

        mgr.foreach_interface(|iface| {
            Arc::clone(iface).on_io_thread_start(mgr, self);
        });

        mgr.foreach_fd_info(|info| {
            if self.accepts(info) {
                if let Err(e) = self.add_fd_to_thread(info) {
                    error!(
                        thread = self.thread_num,
                        fd = info.fd(),
                        error = %e,
                        "attaching global fd failed"
                    );
                }
            }
        });

        Ok(())
    }

    /// The event loop. Blocks only at the multiplexer wait; every callback
    /// and message handler runs inline on this thread.
    fn listen(self: &Arc<Self>, mgr: &Arc<IoManager>) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while self.keep_running.load(Ordering::Acquire) {
            let n = {
                let guard = self.poller.read();
                let Some(poller) = guard.as_ref() else {
                    break;
                };
                match poller.wait(&mut events, self.listen_timeout_ms) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(thread = self.thread_num, error = %e, "multiplexer wait failed");
                        break;
                    }
                }
            };

            let msg_fd = self.msg_fd_info.read().as_ref().map(|i| i.fd());
            for i in 0..n {
                let ev = events[i];
                let fd = ev.u64 as RawFd;
                if Some(fd) == msg_fd {
                    self.on_msg_fd_notification(mgr);
                } else {
                    self.metrics.io_count.fetch_add(1, Ordering::Relaxed);
                    let info = self.fds.lock().get(&fd).cloned();
                    match info {
                        Some(info) => self.on_user_fd_notification(&info, ev.events),
                        None => trace!(thread = self.thread_num, fd, "event for detached fd"),
                    }
                }
            }
        }
    }

    /// Drain the wakeup token, then the message queue.
    fn on_msg_fd_notification(self: &Arc<Self>, mgr: &Arc<IoManager>) {
        {
            let guard = self.msg_fd.read();
            if let Some(msg_fd) = guard.as_ref() {
                if let Err(e) = msg_fd.read_token() {
                    error!(thread = self.thread_num, error = %e, "msg fd drain failed");
                }
            }
        }

        while let Some(msg) = self.msg_q.pop() {
            self.metrics.io_count.fetch_add(1, Ordering::Relaxed);
            self.metrics.msg_recvd_count.fetch_add(1, Ordering::Relaxed);
            trace!(thread = self.thread_num, tag = msg.tag(), "msg received");

            let handler = self
                .msg_handler
                .read()
                .clone()
                .or_else(|| mgr.default_msg_handler());
            if let Some(handler) = handler {
                handler(&msg);
            }
            self.handle_msg(msg);
        }
    }

    fn handle_msg(self: &Arc<Self>, msg: IomgrMsg) {
        match msg {
            IomgrMsg::Reschedule { info, events } => {
                self.metrics.rescheduled_in.fetch_add(1, Ordering::Relaxed);
                self.on_user_fd_notification(&info, events);
            }
            IomgrMsg::RunMethod(f) => f(),
            IomgrMsg::RelinquishIoThread => self.iothread_stop(),
            IomgrMsg::Wakeup => {}
        }
    }

    /// Invoke the descriptor's callback, serializing read-with-read and
    /// write-with-write dispatches on this descriptor.
    ///
    /// A direction bit is delivered only when its in-flight slot was
    /// claimed here; a direction lost to a dispatch already in progress is
    /// masked out of the callback's event mask.
    fn on_user_fd_notification(&self, info: &Arc<FdInfo>, events: u32) {
        let wants_read = events & EV_READ != 0;
        let wants_write = events & EV_WRITE != 0;
        let got_read = wants_read && info.begin_processing(FdDirection::Read);
        let got_write = wants_write && info.begin_processing(FdDirection::Write);

        if (wants_read || wants_write) && !got_read && !got_write {
            trace!(fd = info.fd(), "dispatch already in flight, skipped");
            return;
        }

        let mut claimed = 0;
        if got_read {
            claimed |= EV_READ;
        }
        if got_write {
            claimed |= EV_WRITE;
        }
        let deliver = (events & !(EV_READ | EV_WRITE)) | claimed;

        (info.callback())(info.fd(), info.cookie(), deliver);

        if got_read {
            info.end_processing(FdDirection::Read);
        }
        if got_write {
            info.end_processing(FdDirection::Write);
        }
    }

    fn iothread_stop(&self) {
        debug!(thread = self.thread_num, "relinquishing io thread");
        self.keep_running.store(false, Ordering::Release);
        self.metrics.rescheduled_out.fetch_add(1, Ordering::Relaxed);
    }

    fn teardown(self: &Arc<Self>, mgr: &Arc<IoManager>) {
        // Stop accepting deliveries before interfaces detach.
        self.is_io_thread.store(false, Ordering::Release);

        mgr.foreach_interface(|iface| {
            Arc::clone(iface).on_io_thread_stopped(mgr, self);
        });

        self.fds.lock().clear();
        *self.msg_fd_info.write() = None;
        *self.msg_fd.write() = None;
        *self.poller.write() = None;
        *self.selector.write() = None;
        *self.msg_handler.write() = None;

        debug!(thread = self.thread_num, "io thread torn down");
    }
}
