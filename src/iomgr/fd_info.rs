//! Registered descriptor records

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::iface::traits::IoInterface;

/// Priority hints range over `[0, MAX_PRI)`; 0 is the most urgent.
pub const MAX_PRI: u8 = 10;

/// Callback invoked with (descriptor, cookie, ready event mask) when the
/// reactor dispatches a descriptor.
pub type EvCallback = Arc<dyn Fn(RawFd, u64, u32) + Send + Sync>;

/// Dispatch direction for the per-direction serialization flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdDirection {
    Read = 0,
    Write = 1,
}

/// Record describing one descriptor registered with the IO manager.
///
/// Shared between the owning interface and every reactor that attached it;
/// the record dies when the last of them drops it. The interface
/// back-reference is a relation, never ownership: the interface outlives
/// the record because removal happens before interface teardown.
pub struct FdInfo {
    fd: RawFd,
    events: u32,
    pri: u8,
    cookie: u64,
    is_global: bool,
    cb: EvCallback,
    iface: Weak<dyn IoInterface>,
    in_processing: [AtomicBool; 2],
}

impl FdInfo {
    pub(crate) fn new(
        iface: Weak<dyn IoInterface>,
        fd: RawFd,
        cb: EvCallback,
        events: u32,
        pri: u8,
        cookie: u64,
        is_global: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            fd,
            events,
            pri: pri.min(MAX_PRI - 1),
            cookie,
            is_global,
            cb,
            iface,
            in_processing: [AtomicBool::new(false), AtomicBool::new(false)],
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Event mask requested at registration.
    pub fn events(&self) -> u32 {
        self.events
    }

    pub fn priority(&self) -> u8 {
        self.pri
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Whether the descriptor is attached to every eligible reactor.
    /// Immutable after creation.
    pub fn is_global(&self) -> bool {
        self.is_global
    }

    /// The interface that registered this descriptor, if still alive.
    pub fn interface(&self) -> Option<Arc<dyn IoInterface>> {
        self.iface.upgrade()
    }

    pub(crate) fn callback(&self) -> &EvCallback {
        &self.cb
    }

    /// Claim the dispatch slot for a direction. Returns false when a
    /// dispatch in that direction is already running on this descriptor.
    pub(crate) fn begin_processing(&self, dir: FdDirection) -> bool {
        self.in_processing[dir as usize]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn end_processing(&self, dir: FdDirection) {
        self.in_processing[dir as usize].store(false, Ordering::Release);
    }
}

impl fmt::Debug for FdInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdInfo")
            .field("fd", &self.fd)
            .field("events", &self.events)
            .field("pri", &self.pri)
            .field("cookie", &self.cookie)
            .field("is_global", &self.is_global)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::default::DefaultIoInterface;

    fn make_info(is_global: bool) -> Arc<FdInfo> {
        let iface: Arc<dyn IoInterface> = Arc::new(DefaultIoInterface::new());
        FdInfo::new(
            Arc::downgrade(&iface),
            3,
            Arc::new(|_, _, _| {}),
            crate::poll::EV_READ,
            9,
            0xdead,
            is_global,
        )
    }

    #[test]
    fn test_processing_flags_serialize_per_direction() {
        let info = make_info(false);

        assert!(info.begin_processing(FdDirection::Read));
        // Same direction is refused while held.
        assert!(!info.begin_processing(FdDirection::Read));
        // The other direction is independent.
        assert!(info.begin_processing(FdDirection::Write));

        info.end_processing(FdDirection::Read);
        assert!(info.begin_processing(FdDirection::Read));
    }

    #[test]
    fn test_priority_clamped_below_max() {
        let iface: Arc<dyn IoInterface> = Arc::new(DefaultIoInterface::new());
        let info = FdInfo::new(
            Arc::downgrade(&iface),
            3,
            Arc::new(|_, _, _| {}),
            0,
            99,
            0,
            false,
        );
        assert!(info.priority() < MAX_PRI);
    }

    #[test]
    fn test_global_flag_reflects_construction() {
        assert!(make_info(true).is_global());
        assert!(!make_info(false).is_global());
    }
}
