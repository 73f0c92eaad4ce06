//! Interface capability layer
//!
//! Subsystems expose capabilities to the IO manager through these traits:
//! lifecycle callbacks when a reactor thread joins or leaves the pool, and
//! for drive interfaces the synchronous and asynchronous device IO surface.

pub mod default;
pub mod traits;

pub use default::DefaultIoInterface;
pub use traits::{CompletionCallback, DriveInterface, InterfaceKind, IoInterface};
