//! iofabric - a multi-threaded IO manager runtime for Linux
//!
//! Features:
//! - Fixed pool of reactor threads, each running an epoll event loop
//! - Cross-thread messaging over per-thread eventfds with least-busy routing
//! - Global and per-thread descriptor registration with selector predicates
//! - Block-device IO over io_uring with pre-allocated control blocks and
//!   synchronous fallback when submission cannot proceed

pub mod drive;
pub mod iface;
pub mod iomgr;
pub mod poll;

pub use drive::{DriveConfig, DriveError, DriveResult, UringDriveInterface};
pub use iface::{CompletionCallback, DefaultIoInterface, DriveInterface, InterfaceKind, IoInterface};
pub use iomgr::{
    EvCallback, FdInfo, FdSelector, IoManager, IomgrConfig, IomgrError, IomgrMsg, IomgrResult,
    IomgrState, MsgHandler, Reactor,
};
pub use poll::{EV_EDGE, EV_ERROR, EV_HANGUP, EV_READ, EV_WRITE};
