//! Process-wide IO manager
//!
//! Owns the reactor thread pool and the registries shared across it:
//! registered interfaces, drive interfaces, and global descriptors. The
//! startup handshake decouples interface registration from thread spawn so
//! every reactor observes every registered interface when it joins;
//! shutdown is cooperative via a relinquish broadcast and a countdown
//! latch.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace};

use crate::iface::default::DefaultIoInterface;
use crate::iface::traits::{DriveInterface, IoInterface};

use super::error::{IomgrError, IomgrResult};
use super::fd_info::{EvCallback, FdInfo};
use super::msg::{IomgrMsg, MsgHandler};
use super::reactor::{FdSelector, Reactor};
use super::state::{Countdown, IomgrState, StateCell};

/// Interfaces the manager registers on its own during `start`.
const INBUILT_INTERFACE_COUNT: usize = 1;

/// Tunables for the manager and its reactors.
#[derive(Debug, Clone)]
pub struct IomgrConfig {
    /// Capacity of each thread's bounded message queue.
    pub msg_queue_capacity: usize,
    /// Upper bound on one multiplexer wait, so the loop re-checks
    /// `keep_running` even when idle.
    pub listen_timeout_ms: i32,
}

impl Default for IomgrConfig {
    fn default() -> Self {
        Self {
            msg_queue_capacity: 1024,
            listen_timeout_ms: 100,
        }
    }
}

impl IomgrConfig {
    pub fn with_msg_queue_capacity(mut self, capacity: usize) -> Self {
        self.msg_queue_capacity = capacity;
        self
    }

    pub fn with_listen_timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.listen_timeout_ms = timeout_ms;
        self
    }
}

static INSTANCE: OnceLock<Arc<IoManager>> = OnceLock::new();

pub struct IoManager {
    config: IomgrConfig,
    state: StateCell,
    expected_ifaces: AtomicUsize,
    yet_to_start_nthreads: Countdown,
    yet_to_stop_nthreads: Countdown,
    next_thread_num: AtomicU32,
    ifaces: RwLock<Vec<Arc<dyn IoInterface>>>,
    drive_ifaces: RwLock<Vec<Arc<dyn DriveInterface>>>,
    default_drive_iface: RwLock<Option<Arc<dyn DriveInterface>>>,
    default_general_iface: RwLock<Option<Arc<DefaultIoInterface>>>,
    fd_infos: RwLock<HashMap<RawFd, Arc<FdInfo>>>,
    reactors: RwLock<BTreeMap<u32, Arc<Reactor>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    common_msg_handler: RwLock<Option<MsgHandler>>,
    global_timer: Mutex<Option<Box<dyn Any + Send>>>,
}

impl IoManager {
    pub fn new(config: IomgrConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: StateCell::new(),
            expected_ifaces: AtomicUsize::new(INBUILT_INTERFACE_COUNT),
            yet_to_start_nthreads: Countdown::new(),
            yet_to_stop_nthreads: Countdown::new(),
            next_thread_num: AtomicU32::new(0),
            ifaces: RwLock::new(Vec::new()),
            drive_ifaces: RwLock::new(Vec::new()),
            default_drive_iface: RwLock::new(None),
            default_general_iface: RwLock::new(None),
            fd_infos: RwLock::new(HashMap::new()),
            reactors: RwLock::new(BTreeMap::new()),
            threads: Mutex::new(Vec::new()),
            common_msg_handler: RwLock::new(None),
            global_timer: Mutex::new(None),
        })
    }

    /// The process-wide instance with default configuration.
    pub fn instance() -> Arc<IoManager> {
        Arc::clone(INSTANCE.get_or_init(|| IoManager::new(IomgrConfig::default())))
    }

    pub fn state(&self) -> IomgrState {
        self.state.get()
    }

    /// Begin the startup handshake.
    ///
    /// Records the expected interface count (built-in plus
    /// `expected_custom_ifaces`), the number of reactor threads to spawn
    /// once all interfaces registered, and the default cross-thread message
    /// handler. Registers the built-in default interface.
    pub fn start(
        self: &Arc<Self>,
        expected_custom_ifaces: usize,
        num_threads: usize,
        default_msg_handler: Option<MsgHandler>,
    ) {
        info!(
            expected_custom_ifaces,
            num_threads, "starting IO manager"
        );
        self.expected_ifaces.store(
            INBUILT_INTERFACE_COUNT + expected_custom_ifaces,
            Ordering::Release,
        );
        self.yet_to_start_nthreads.set(num_threads as i64);
        *self.common_msg_handler.write() = default_msg_handler;

        self.state.set_and_notify(IomgrState::WaitingForInterfaces);

        let default_iface = Arc::new(DefaultIoInterface::new());
        *self.default_general_iface.write() = Some(Arc::clone(&default_iface));
        self.add_interface(default_iface);
    }

    /// Register an interface. When the registry reaches the expected count
    /// the manager either spawns its reactor pool or, with no threads
    /// requested, goes straight to running. Registrations beyond the
    /// expected count succeed silently and never regress the state.
    pub fn add_interface(self: &Arc<Self>, iface: Arc<dyn IoInterface>) {
        let count = {
            let mut ifaces = self.ifaces.write();
            ifaces.push(iface);
            ifaces.len()
        };
        let expected = self.expected_ifaces.load(Ordering::Acquire);

        if count < expected {
            info!(count, expected, "waiting for remaining interfaces");
            return;
        }
        if count > expected {
            return;
        }

        info!(count, "all expected interfaces registered");
        let nthreads = self.yet_to_start_nthreads.get();
        if nthreads > 0 {
            self.state.set_and_notify(IomgrState::WaitingForThreads);
            info!(nthreads, "spawning io threads");
            let mut handles = self.threads.lock();
            for i in 0..nthreads {
                let mgr = Arc::clone(self);
                let spawned = std::thread::Builder::new()
                    .name(format!("io_thread_{i}"))
                    .spawn(move || {
                        if let Err(e) = mgr.run_io_loop(true, None, None) {
                            error!(error = %e, "io thread exited with error");
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => error!(error = %e, "spawning io thread failed"),
                }
            }
        } else {
            self.state.set_and_notify(IomgrState::Running);
        }
    }

    /// Register a drive interface, optionally as the default drive.
    pub fn add_drive_interface(self: &Arc<Self>, iface: Arc<dyn DriveInterface>, default: bool) {
        self.add_interface(Arc::clone(&iface) as Arc<dyn IoInterface>);
        self.drive_ifaces.write().push(Arc::clone(&iface));
        if default {
            *self.default_drive_iface.write() = Some(iface);
        }
    }

    /// Turn the calling thread into an io thread until it is relinquished.
    pub fn run_io_loop(
        self: &Arc<Self>,
        is_iomgr_thread: bool,
        fd_selector: Option<FdSelector>,
        msg_handler_override: Option<MsgHandler>,
    ) -> IomgrResult<()> {
        let thread_num = self.next_thread_num.fetch_add(1, Ordering::Relaxed);
        let reactor = Reactor::new(
            thread_num,
            self.config.msg_queue_capacity,
            self.config.listen_timeout_ms,
        );
        self.reactors.write().insert(thread_num, Arc::clone(&reactor));
        let res = reactor.run(self, is_iomgr_thread, fd_selector, msg_handler_override);
        self.reactors.write().remove(&thread_num);
        res
    }

    /// Quiesce the pool and clear every registry.
    ///
    /// The stop latch is pre-incremented so a manager with zero live io
    /// threads still reaches `Stopped`; the relinquish broadcast completes
    /// before the matching decrement, so no thread's exit can be missed.
    pub fn stop(self: &Arc<Self>) {
        info!("stopping IO manager");
        self.state.set_and_notify(IomgrState::Stopping);

        self.yet_to_stop_nthreads.increment();
        let delivered = self.send_msg(None, IomgrMsg::RelinquishIoThread);
        debug!(delivered, "relinquish broadcast complete");

        *self.global_timer.lock() = None;

        if self.yet_to_stop_nthreads.decrement_testz() {
            self.state.set_and_notify(IomgrState::Stopped);
        } else {
            self.state.wait_for(|s| s == IomgrState::Stopped);
        }

        info!("all io threads stopped, joining manager threads");
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("io thread panicked during shutdown");
            }
        }

        self.yet_to_start_nthreads.set(0);
        self.expected_ifaces
            .store(INBUILT_INTERFACE_COUNT, Ordering::Release);
        self.drive_ifaces.write().clear();
        *self.default_drive_iface.write() = None;
        self.ifaces.write().clear();
        *self.default_general_iface.write() = None;
        debug_assert_eq!(self.state.get(), IomgrState::Stopped);
    }

    /// Register a descriptor with the manager.
    ///
    /// Global descriptors require the manager to be running (the call waits
    /// for the startup handshake to finish) and attach to every io thread
    /// whose selector accepts them. Per-thread descriptors attach only to
    /// the calling io thread and are accepted in any state.
    #[allow(clippy::too_many_arguments)]
    pub fn add_fd(
        &self,
        iface: &Arc<dyn IoInterface>,
        fd: RawFd,
        cb: EvCallback,
        events: u32,
        pri: u8,
        cookie: u64,
        is_per_thread: bool,
    ) -> IomgrResult<Arc<FdInfo>> {
        if !is_per_thread {
            let state = self.state.get();
            if state != IomgrState::Running {
                info!(fd, state = %state, "manager not ready for global fd, waiting");
                let state = self.state.wait_for(|s| s >= IomgrState::Running);
                if state > IomgrState::Running {
                    return Err(IomgrError::NotRunning(state));
                }
            }
        }

        let info = FdInfo::new(
            Arc::downgrade(iface),
            fd,
            cb,
            events,
            pri,
            cookie,
            !is_per_thread,
        );
        trace!(
            fd,
            per_thread = is_per_thread,
            "fd requested to be added to IO manager"
        );

        if is_per_thread {
            // The selector only scopes which threads take global fds; a
            // thread registering its own descriptor always attaches it.
            let reactor = Reactor::current().ok_or(IomgrError::NotIoThread)?;
            reactor.add_fd_to_thread(&info)?;
        } else {
            let targets: Vec<_> = self.reactors.read().values().cloned().collect();
            for reactor in targets {
                if reactor.is_io_thread() && reactor.accepts(&info) {
                    if let Err(e) = reactor.add_fd_to_thread(&info) {
                        error!(
                            fd,
                            thread = reactor.thread_num(),
                            error = %e,
                            "attaching global fd failed"
                        );
                    }
                }
            }
            self.fd_infos.write().insert(fd, Arc::clone(&info));
        }
        Ok(info)
    }

    /// Detach a descriptor everywhere it was attached.
    ///
    /// Outside of running/stopping this is a state-protocol violation: it
    /// is logged and the call is a no-op.
    pub fn remove_fd(&self, _iface: &Arc<dyn IoInterface>, info: &Arc<FdInfo>) {
        let state = self.state.get();
        if state != IomgrState::Running && state != IomgrState::Stopping {
            error!(
                fd = info.fd(),
                state = %state,
                "remove_fd requires a running or stopping IO manager, ignored"
            );
            return;
        }

        if info.is_global() {
            let targets: Vec<_> = self.reactors.read().values().cloned().collect();
            for reactor in targets {
                if reactor.is_io_thread() {
                    if let Err(e) = reactor.remove_fd_from_thread(info) {
                        error!(
                            fd = info.fd(),
                            thread = reactor.thread_num(),
                            error = %e,
                            "detaching global fd failed"
                        );
                    }
                }
            }
            self.fd_infos.write().remove(&info.fd());
        } else {
            match Reactor::current() {
                Some(reactor) => {
                    if let Err(e) = reactor.remove_fd_from_thread(info) {
                        error!(fd = info.fd(), error = %e, "detaching per-thread fd failed");
                    }
                }
                None => error!(
                    fd = info.fd(),
                    "per-thread fd can only be removed from its own io thread"
                ),
            }
        }
    }

    /// Hand the descriptor's event to the least-busy io thread as if the
    /// multiplexer had just delivered it there.
    pub fn fd_reschedule(&self, info: &Arc<FdInfo>, events: u32) -> IomgrResult<()> {
        self.send_to_least_busy_thread(IomgrMsg::Reschedule {
            info: Arc::clone(info),
            events,
        })
    }

    /// [`fd_reschedule`] by raw descriptor, resolved through the global map.
    ///
    /// [`fd_reschedule`]: IoManager::fd_reschedule
    pub fn fd_reschedule_raw(&self, fd: RawFd, events: u32) -> IomgrResult<()> {
        let info = self
            .fd_infos
            .read()
            .get(&fd)
            .cloned()
            .ok_or(IomgrError::UnknownFd(fd))?;
        self.fd_reschedule(&info, events)
    }

    /// Run a closure on the least-busy io thread.
    pub fn run_in_io_thread(&self, f: impl FnOnce() + Send + 'static) -> IomgrResult<()> {
        self.send_to_least_busy_thread(IomgrMsg::RunMethod(Box::new(f)))
    }

    /// Deliver a message to one thread, or broadcast with `None`.
    ///
    /// Each delivery enqueues into the target's bounded queue and then
    /// writes a wakeup token to its message descriptor. Returns the number
    /// of threads the message reached; a target that exited between
    /// selection and delivery simply does not count.
    pub fn send_msg(&self, thread_num: Option<u32>, msg: IomgrMsg) -> usize {
        match thread_num {
            None => {
                let targets: Vec<_> = self.reactors.read().values().cloned().collect();
                let mut delivered = 0;
                for reactor in targets {
                    let Some(dup) = msg.duplicate() else {
                        // One-shot payloads are routed, never broadcast.
                        unreachable!("{} messages cannot be broadcast", msg.tag());
                    };
                    if reactor.deliver(dup).is_ok() {
                        delivered += 1;
                    }
                }
                delivered
            }
            Some(n) => {
                let target = self.reactors.read().get(&n).cloned();
                match target {
                    Some(reactor) if reactor.deliver(msg).is_ok() => 1,
                    _ => 0,
                }
            }
        }
    }

    /// Deliver to the io thread with the lowest dispatch count, re-selecting
    /// until one delivery succeeds (a chosen target may exit in between).
    pub fn send_to_least_busy_thread(&self, msg: IomgrMsg) -> IomgrResult<()> {
        let mut msg = msg;
        loop {
            let target = self
                .reactors
                .read()
                .values()
                .filter(|r| r.is_io_thread())
                .min_by_key(|r| r.op_count())
                .cloned();
            let Some(reactor) = target else {
                return Err(IomgrError::NoIoThreads);
            };
            match reactor.deliver(msg) {
                Ok(()) => return Ok(()),
                Err(back) => msg = back,
            }
        }
    }

    /// Number of threads currently participating in the io loop.
    pub fn io_thread_count(&self) -> usize {
        self.reactors
            .read()
            .values()
            .filter(|r| r.is_io_thread())
            .count()
    }

    pub fn foreach_reactor(&self, mut f: impl FnMut(&Arc<Reactor>)) {
        for reactor in self.reactors.read().values() {
            f(reactor);
        }
    }

    pub fn foreach_interface(&self, mut f: impl FnMut(&Arc<dyn IoInterface>)) {
        for iface in self.ifaces.read().iter() {
            f(iface);
        }
    }

    pub fn foreach_fd_info(&self, mut f: impl FnMut(&Arc<FdInfo>)) {
        for info in self.fd_infos.read().values() {
            f(info);
        }
    }

    /// Resolve a raw descriptor through the global map.
    pub fn fd_to_info(&self, fd: RawFd) -> Option<Arc<FdInfo>> {
        self.fd_infos.read().get(&fd).cloned()
    }

    pub fn default_drive_interface(&self) -> Option<Arc<dyn DriveInterface>> {
        self.default_drive_iface.read().clone()
    }

    pub(crate) fn default_interface(&self) -> Option<Arc<dyn IoInterface>> {
        match self.default_general_iface.read().clone() {
            Some(iface) => Some(iface),
            None => None,
        }
    }

    pub(crate) fn default_msg_handler(&self) -> Option<MsgHandler> {
        self.common_msg_handler.read().clone()
    }

    /// Park the external timer collaborator's handle; `stop` drops it.
    pub fn set_global_timer(&self, timer: Box<dyn Any + Send>) {
        *self.global_timer.lock() = Some(timer);
    }

    /// A reactor thread entered its loop.
    pub(crate) fn io_thread_started(&self, is_iomgr_thread: bool) {
        self.yet_to_stop_nthreads.increment();
        if is_iomgr_thread && self.yet_to_start_nthreads.decrement_testz() {
            self.state.set_and_notify(IomgrState::Running);
        }
    }

    /// A reactor thread left its loop.
    pub(crate) fn io_thread_stopped(&self) {
        if self.yet_to_stop_nthreads.decrement_testz() {
            self.state.set_and_notify(IomgrState::Stopped);
        }
    }
}
