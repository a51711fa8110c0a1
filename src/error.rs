//! # Error Handling
//!
//! Every fallible operation in the stack returns [`ModbusResult`]. The error
//! variants fall into a small number of classes, and the class decides how a
//! failure travels:
//!
//! ### Format errors
//! - **Frame / CRC**: malformed or truncated bytes while decoding an ADU
//! - **Invalid Function**: a function code the stack does not implement
//! - **Invalid Data**: a well-framed field carrying a value the protocol forbids
//!
//! On the slave side these are logged (or answered with an exception
//! response) and the dispatch loop keeps serving.
//!
//! ### Addressing faults
//! - **Invalid Address**: a `(start, count)` range outside a process image table
//! - **Index Out Of Range**: a bit index outside a [`BitVector`](crate::bitvector::BitVector)
//!
//! Addressing faults raised while answering a request become an
//! Illegal Data Address exception response; they never reach the wire as a
//! low-level fault.
//!
//! ### Transport errors
//! - **I/O**, **Connection**, **Timeout**: failures of the underlying stream
//! - **Retries Exhausted**: the master gave up after its retry budget
//!
//! Transport errors are the only class that ends a connection or a transaction.
//!
//! ### State errors
//! - **Illegal State**: protocol misuse by the caller, such as overlapping
//!   transactions on one connection. Never retried.
//!
//! ## Error Classification
//!
//! ```rust
//! use procimg_modbus::ModbusError;
//!
//! let error = ModbusError::timeout("read response", 500);
//! assert!(error.is_transport_error());
//! assert!(error.is_recoverable());
//!
//! let error = ModbusError::exception(0x03, 0x02);
//! assert!(error.is_protocol_error());
//! assert!(!error.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus error types
///
/// Each variant carries enough context to log a useful diagnostic without
/// access to the original frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (socket or serial stream)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or loss
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An operation exceeded its deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The master used up its retry budget
    ///
    /// `last_error` is the rendering of the error that failed the final attempt.
    #[error("Transaction failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Protocol-level violations that are not framing problems
    ///
    /// # Examples
    /// - Response unit id does not match the request
    /// - Response transaction id does not match the request
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Function code not implemented by this stack
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// A `(start, count)` range outside a process image table
    #[error("Invalid address: start={start}, count={count}, table size={limit}")]
    InvalidAddress { start: u16, count: u16, limit: usize },

    /// Bit index outside a bit vector
    #[error("Index {index} out of range for size {size}")]
    IndexOutOfRange { index: usize, size: usize },

    /// A field value the protocol does not allow
    ///
    /// # Examples
    /// - Coil value not 0x0000 or 0xFF00
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure on a serial frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Modbus exception response returned by a remote device
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Malformed, truncated or oversized frame
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Caller misuse of a stateful object
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (poisoned locks and other should-not-happen states)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a retries-exhausted error from the last attempt's failure
    pub fn retries_exhausted(attempts: u32, last_error: &ModbusError) -> Self {
        Self::RetriesExhausted {
            attempts,
            last_error: last_error.to_string(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an addressing fault
    ///
    /// # Arguments
    ///
    /// * `start` - Starting address
    /// * `count` - Number of elements requested
    /// * `limit` - Size of the table that was addressed
    pub fn invalid_address(start: u16, count: u16, limit: usize) -> Self {
        Self::InvalidAddress { start, count, limit }
    }

    /// Create an index error
    pub fn index_out_of_range(index: usize, size: usize) -> Self {
        Self::IndexOutOfRange { index, size }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to their human-readable names.
    ///
    /// # Arguments
    ///
    /// * `function` - Original function code that caused the exception
    /// * `code` - Modbus exception code
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create an illegal state error
    pub fn illegal_state<S: Into<String>>(message: S) -> Self {
        Self::IllegalState { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// `true` when the condition may be temporary and repeating the operation
    /// could succeed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use procimg_modbus::ModbusError;
    ///
    /// let timeout_error = ModbusError::timeout("read operation", 5000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let invalid_function = ModbusError::invalid_function(0x99);
    /// assert!(!invalid_function.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    ///
    /// Transport errors are the class that terminates a connection or a
    /// transaction.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::RetriesExhausted { .. }
        )
    }

    /// Check if the error is a protocol or format issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::InvalidData { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }

    /// Check if the error is an addressing fault
    pub fn is_addressing_fault(&self) -> bool {
        matches!(self, Self::InvalidAddress { .. } | Self::IndexOutOfRange { .. })
    }
}

/// Convert from std::io::Error
///
/// An unexpected EOF inside a frame is reported as a frame error since the
/// bytes that did arrive were malformed; everything else is an I/O error.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::frame(format!("Truncated data: {}", err)),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
///
/// The duration is unknown here; callers that know it build the error with
/// [`ModbusError::timeout`] instead.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
