//! Callback-driven transaction logging
//!
//! A [`CallbackLogger`] can be attached to a master or a dispatcher to see
//! every request and response, either decoded, as raw PDU bytes, or both.
//! The crate's own diagnostics go through the `log` facade; this logger is
//! for applications that want the traffic routed somewhere specific.

use std::sync::Arc;

use crate::request::RequestAdu;
use crate::response::ResponseAdu;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show interpreted packet data with field descriptions
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Check if a message at the given level should be logged
    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log packet data with hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }

        let message = format!(
            "{} packet ({} bytes): {}",
            direction,
            data.len(),
            hex::encode_upper(data)
        );
        self.log(level, &message);
    }

    /// Log a request, as sent by a master or received by a slave
    pub fn log_request(&self, adu: &RequestAdu) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let interpreted = format!(
            "Modbus Request -> Unit: {}, Transaction: {}, Function: {}",
            adu.unit_id(),
            adu.transaction_id(),
            adu.request()
        );
        let frame = adu.to_frame();
        self.emit(&interpreted, "Modbus Request -> Raw", frame.header.unit_id, frame.function_code, &frame.data);
    }

    /// Log a response, as received by a master or sent by a slave
    pub fn log_response(&self, adu: &ResponseAdu) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let response = adu.response();
        let interpreted = format!(
            "Modbus Response <- Unit: {}, Transaction: {}, Function: 0x{:02X}, {}",
            adu.unit_id(),
            adu.transaction_id(),
            response.function_code(),
            response
        );
        let frame = adu.to_frame();
        self.emit(&interpreted, "Modbus Response <- Raw", frame.header.unit_id, frame.function_code, &frame.data);
    }

    fn emit(&self, interpreted: &str, raw_label: &str, unit_id: u8, function_code: u8, data: &[u8]) {
        match self.mode {
            LoggingMode::Raw => self.info(&raw_pdu(raw_label, unit_id, function_code, data)),
            LoggingMode::Interpreted => self.info(interpreted),
            LoggingMode::Both => {
                self.info(interpreted);
                self.debug(&raw_pdu(raw_label, unit_id, function_code, data));
            }
        }
    }
}

fn raw_pdu(label: &str, unit_id: u8, function_code: u8, data: &[u8]) -> String {
    let mut packet = Vec::with_capacity(2 + data.len());
    packet.push(unit_id);
    packet.push(function_code);
    packet.extend_from_slice(data);
    format!("{}: {}", label, hex::encode_upper(packet))
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}
