//! Events reported by the session worker

use std::fmt;

/// Something the session worker observed, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A complete reply frame
    Data(String),
    /// A command was written to the adapter
    Sent(String),
    /// Informational notice from the worker
    Info(String),
    /// A transient read/write fault; the worker keeps running
    Error(String),
    /// Terminal event; nothing follows it
    Closed(String),
}

impl InboundEvent {
    /// Whether this is the terminal event of a session
    pub fn is_closed(&self) -> bool {
        matches!(self, InboundEvent::Closed(_))
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundEvent::Data(payload) => write!(f, "Response <<< {}", payload),
            InboundEvent::Sent(command) => write!(f, "Sent >>> {}", command),
            InboundEvent::Info(message) => write!(f, "[INFO] {}", message),
            InboundEvent::Error(message) => write!(f, "[ERROR] {}", message),
            InboundEvent::Closed(reason) => write!(f, "[CLOSED] {}", reason),
        }
    }
}
