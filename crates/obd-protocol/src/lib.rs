//! OBD-II Protocol Implementation
//!
//! This crate talks to ELM327-compatible OBD-II adapters over a serial
//! link: a background session frames the adapter's replies, and the
//! decoders turn them into typed PID readings and trouble codes.

mod dtc;
mod error;
mod event;
mod frame;
mod hex;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod pid;
mod protocol;
mod response;
mod transport;

pub use dtc::{
    decode_dtc_tokens, decode_dtcs, DtcCode, DtcReport, DtcTable, DTC_GROUPS, NO_CODES_SENTINEL,
    NO_DESCRIPTION,
};
pub use error::ObdError;
pub use event::InboundEvent;
pub use frame::{FrameError, FrameReader, DEFAULT_FRAME_LIMIT, PROMPT};
pub use hex::tokenize;
#[cfg(any(test, feature = "mock"))]
pub use mock::MockAdapter;
pub use pid::{find_payload, LiveData, Pid, PidReading, PidRegistry};
pub use protocol::ObdProtocol;
pub use response::{
    clean_response, AdapterStatus, DtcEntry, ProcessedResponse, ResponseProcessor, SEARCHING,
};
pub use transport::{AdapterPort, SerialConfig, Session, SessionState, COMMAND_TERMINATOR};

/// Serial port settings, re-exported for building a [`SerialConfig`]
pub use tokio_serial::{DataBits, FlowControl, Parity, StopBits};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Positive response to a current data request
    pub const CURRENT_DATA_RESPONSE: u8 = CURRENT_DATA + 0x40;
    /// Positive response to a stored DTC request
    pub const READ_DTC_RESPONSE: u8 = READ_DTC + 0x40;
}

/// Adapter and OBD-II command strings
pub mod command {
    /// Reset
    pub const RESET: &str = "ATZ";
    /// Echo off
    pub const ECHO_OFF: &str = "ATE0";
    /// Linefeeds off
    pub const LINEFEEDS_OFF: &str = "ATL0";
    /// Headers off
    pub const HEADERS_OFF: &str = "ATH0";
    /// Adaptive timing
    pub const ADAPTIVE_TIMING: &str = "ATAT1";
    /// Maximum response timeout
    pub const MAX_TIMEOUT: &str = "ATSTFF";
    /// Allow long messages
    pub const LONG_MESSAGES: &str = "ATAL";
    /// Describe current protocol
    pub const DESCRIBE_PROTOCOL: &str = "ATDP";
    /// Adapter identity
    pub const IDENTIFY: &str = "ATI";
    /// Mode 01 PID support query
    pub const SUPPORTED_PIDS: &str = "0100";
    /// Read stored trouble codes (Mode 03)
    pub const READ_DTCS: &str = "03";
    /// Clear trouble codes (Mode 04)
    pub const CLEAR_DTCS: &str = "04";
}
