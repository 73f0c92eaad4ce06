//! Built-in default interface
//!
//! Registered by `IoManager::start` so descriptors that belong to no
//! subsystem (the per-thread message descriptors, caller-supplied sockets)
//! have an owning interface. Carries no per-thread state.

use std::sync::Arc;

use crate::iomgr::manager::IoManager;
use crate::iomgr::reactor::Reactor;

use super::traits::{InterfaceKind, IoInterface};

#[derive(Debug, Default)]
pub struct DefaultIoInterface;

impl DefaultIoInterface {
    pub fn new() -> Self {
        Self
    }
}

impl IoInterface for DefaultIoInterface {
    fn interface_kind(&self) -> InterfaceKind {
        InterfaceKind::General
    }

    fn on_io_thread_start(self: Arc<Self>, _mgr: &Arc<IoManager>, reactor: &Arc<Reactor>) {
        tracing::trace!(thread = reactor.thread_num(), "default interface attached");
    }

    fn on_io_thread_stopped(self: Arc<Self>, _mgr: &Arc<IoManager>, reactor: &Arc<Reactor>) {
        tracing::trace!(thread = reactor.thread_num(), "default interface detached");
    }
}
