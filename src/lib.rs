//! # procimg_modbus - Modbus TCP/RTU master and slave over a shared process image
//!
//! An async Modbus stack built on Tokio. Slaves answer requests from an
//! in-memory *process image* (discrete inputs, coils, input registers and
//! holding registers); masters run correlated request/response transactions
//! with timeouts and retries.
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Slave |
//! |------|----------|--------|-------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ### Slave
//!
//! ```rust,no_run
//! use procimg_modbus::{Device, DeviceRegistry, ModbusServer, ModbusTcpServer, ProcessImage};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = Arc::new(ProcessImage::new(16, 16, 16, 16));
//!     let registry = Arc::new(DeviceRegistry::new().with_device(Device::slave(15, image.clone())));
//!
//!     let mut server = ModbusTcpServer::new("127.0.0.1:5020", registry)?;
//!     server.start().await?;
//!
//!     image.set_input_register(0, 230)?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Master
//!
//! ```rust,no_run
//! use procimg_modbus::{MasterConfig, ModbusClient, ModbusResult, ModbusTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let address = "127.0.0.1:5020".parse().expect("valid address");
//!     let client = ModbusTcpClient::connect(address, MasterConfig::default()).await?;
//!
//!     client.write_multiple_coils(15, 5, &[true, true, true]).await?;
//!     let coils = client.read_coils(15, 5, 3).await?;
//!     println!("Coils 5..7: {:?}", coils);
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Application   │    │    Bootstrap    │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │  ModbusMaster   │    │   Dispatcher    │──► DeviceRegistry ──► ProcessImage
//! │ (transactions)  │    │ (unit routing)  │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Request/Response│    │ Request/Response│
//! │     (codec)     │    │     (codec)     │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Transport     │◄──►│   Transport     │
//! │   (TCP / RTU)   │    │   (TCP / RTU)   │
//! └─────────────────┘    └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Function codes, exception codes and frame types
pub mod protocol;

/// Packed bit arrays for coil and discrete input payloads
pub mod bitvector;

/// Request messages and how they apply to a process image
pub mod request;

/// Response messages, including exception responses
pub mod response;

/// Addressable tables served by a slave
pub mod process_image;

/// Frame-level transports for TCP and RTU
pub mod transport;

/// Master side transaction engine
pub mod client;

/// Device registry and its configuration
pub mod device;

/// Slave dispatcher and TCP server
pub mod server;

/// Utility functions and performance monitoring
pub mod utils;

/// Logging system for the library
pub mod logging;

// Re-export main types for convenience
pub use bitvector::BitVector;
pub use client::{MasterConfig, ModbusClient, ModbusMaster, ModbusRtuClient, ModbusTcpClient};
pub use device::{Device, DeviceConfig, DeviceRegistry, DeviceRole, ProcessImageConfig, RegistryConfig};
pub use error::{ModbusError, ModbusResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use process_image::{ProcessImage, ProcessImageBuilder, ProcessImageStats};
pub use protocol::{Frame, Header, ModbusException, ModbusFunction};
pub use request::{Request, RequestAdu};
pub use response::{ExceptionResponse, Response, ResponseAdu};
pub use server::{Dispatcher, ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
pub use transport::{ModbusTransport, RtuTransport, TcpTransport, TransportStats};
pub use utils::{OperationTimer, PerformanceMetrics};

/// Default timeout for master transactions (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("procimg_modbus v{} - Modbus TCP/RTU master and slave stack", VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info() {
        assert!(info().contains(VERSION));
        assert_eq!(MasterConfig::default().timeout_ms, DEFAULT_TIMEOUT_MS);
    }
}
