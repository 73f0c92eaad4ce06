//! Block-device drive layer
//!
//! The io_uring-backed drive interface, its per-thread submission context,
//! and the drive metrics.

pub mod error;
pub mod metrics;
pub mod uring;

pub use error::{DriveError, DriveResult};
pub use metrics::{DriveMetrics, DriveMetricsSnapshot, SizeHistogram};
pub use uring::{DriveConfig, UringDriveInterface, MAX_COMPLETIONS, MAX_OUTSTANDING_IO};
