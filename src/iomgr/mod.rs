//! IO manager core
//!
//! The process-wide coordinator, the per-thread reactors it owns, and the
//! value types shared between them: descriptor records, cross-thread
//! messages, lifecycle state, and per-thread metrics.

pub mod error;
pub mod fd_info;
pub mod manager;
pub mod metrics;
pub mod msg;
pub mod reactor;
pub mod state;

pub use error::{IomgrError, IomgrResult};
pub use fd_info::{EvCallback, FdDirection, FdInfo, MAX_PRI};
pub use manager::{IoManager, IomgrConfig};
pub use metrics::{ReactorMetrics, ReactorMetricsSnapshot};
pub use msg::{IomgrMsg, MsgHandler, RunMethod};
pub use reactor::{FdSelector, Reactor};
pub use state::IomgrState;
