//! Cross-thread messages
//!
//! Messages are moved into the target thread's bounded queue; a wakeup token
//! on the thread's message descriptor makes the reactor drain the queue.

use std::fmt;
use std::sync::Arc;

use super::fd_info::FdInfo;

/// A closure shipped to an io thread via [`IomgrMsg::RunMethod`].
pub type RunMethod = Box<dyn FnOnce() + Send + 'static>;

/// Handler observing every message drained by a reactor, invoked before the
/// built-in tag semantics run.
pub type MsgHandler = Arc<dyn Fn(&IomgrMsg) + Send + Sync>;

/// Tagged message delivered to a reactor thread.
pub enum IomgrMsg {
    /// Re-dispatch the descriptor's callback as if the multiplexer had just
    /// delivered this event mask.
    Reschedule { info: Arc<FdInfo>, events: u32 },
    /// Run the carried thunk on the receiving thread; the receiver owns and
    /// consumes it.
    RunMethod(RunMethod),
    /// Ask the receiving thread to leave the io loop.
    RelinquishIoThread,
    /// Nudge the loop around; carries nothing.
    Wakeup,
}

impl IomgrMsg {
    pub fn tag(&self) -> &'static str {
        match self {
            IomgrMsg::Reschedule { .. } => "reschedule",
            IomgrMsg::RunMethod(_) => "run_method",
            IomgrMsg::RelinquishIoThread => "relinquish_io_thread",
            IomgrMsg::Wakeup => "wakeup",
        }
    }

    /// Copy for broadcast fan-out. RunMethod owns a one-shot thunk and
    /// cannot be duplicated.
    pub(crate) fn duplicate(&self) -> Option<IomgrMsg> {
        match self {
            IomgrMsg::Reschedule { info, events } => Some(IomgrMsg::Reschedule {
                info: Arc::clone(info),
                events: *events,
            }),
            IomgrMsg::RunMethod(_) => None,
            IomgrMsg::RelinquishIoThread => Some(IomgrMsg::RelinquishIoThread),
            IomgrMsg::Wakeup => Some(IomgrMsg::Wakeup),
        }
    }
}

// The thunk payload is opaque, so Debug is written by hand.
impl fmt::Debug for IomgrMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IomgrMsg::Reschedule { info, events } => f
                .debug_struct("Reschedule")
                .field("fd", &info.fd())
                .field("events", events)
                .finish(),
            IomgrMsg::RunMethod(_) => f.write_str("RunMethod(..)"),
            IomgrMsg::RelinquishIoThread => f.write_str("RelinquishIoThread"),
            IomgrMsg::Wakeup => f.write_str("Wakeup"),
        }
    }
}
