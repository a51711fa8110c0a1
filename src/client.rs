//! Modbus master: the transaction engine and the typed client API
//!
//! [`ModbusMaster`] owns one transport and runs one transaction at a time on
//! it. A transaction is: assign a transaction id (TCP only), send, wait for a
//! response with a per-attempt timeout, correlate it with the request, and
//! retry within a bounded budget.
//!
//! Modbus TCP and RTU share the same application layer, so the engine is
//! written once against [`ModbusTransport`]:
//! - TCP: MBAP Header + PDU, responses correlated by transaction id
//! - RTU: Unit ID + PDU + CRC, headless, correlated by unit id and function
//!
//! ## Retry policy
//!
//! Every attempt that fails consumes one unit of the budget
//! (`MasterConfig::retries` extra attempts after the first):
//! - timeout, I/O failure or an undecodable response: the transport is
//!   reset and the same request (same transaction id) is sent again
//! - a well-formed response for another transaction, unit or function: the
//!   response is discarded and the engine reads again without re-sending
//!
//! When the budget runs out the call fails with
//! [`ModbusError::RetriesExhausted`]. A peer that closes the stream ends the
//! transaction immediately with a connection error.
//!
//! ```rust,no_run
//! use procimg_modbus::{MasterConfig, ModbusClient, ModbusTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ModbusTcpClient::connect("127.0.0.1:502".parse()?, MasterConfig::default()).await?;
//!
//!     let values = client.read_holding_registers(1, 0, 10).await?;
//!     println!("Read registers: {:?}", values);
//!
//!     client.write_single_register(1, 100, 0x1234).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{Frame, ModbusAddress, UnitId, EXCEPTION_FLAG, MAX_PDU_SIZE, MAX_READ_BITS,
    MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS};
use crate::request::{Request, RequestAdu};
use crate::response::{Response, ResponseAdu};
use crate::transport::{ModbusTransport, RtuTransport, TcpTransport, TransportStats};
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Master configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Per-attempt response timeout in milliseconds
    pub timeout_ms: u64,
    /// Extra attempts after the first one
    pub retries: u32,
}

impl MasterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            retries: 3,
        }
    }
}

/// Trait defining the interface for Modbus client operations
///
/// Implementors supply [`ModbusClient::call`]; the typed helpers build the
/// request, check the echo and turn exception responses into
/// [`ModbusError::Exception`].
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Run one request against `unit_id` and return the decoded response
    ///
    /// Exception responses are returned as `Ok(Response::Exception(..))`.
    async fn call(&self, unit_id: UnitId, request: Request) -> ModbusResult<Response>;

    /// Check if client is connected
    async fn is_connected(&self) -> bool;

    /// Close the client connection
    async fn close(&self) -> ModbusResult<()>;

    /// Get transport statistics
    async fn get_stats(&self) -> TransportStats;

    /// Read coils (function code 0x01)
    async fn read_coils(&self, unit_id: UnitId, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<bool>> {
        check_count(quantity as usize, MAX_READ_BITS)?;
        match self.call(unit_id, Request::read_coils(address, quantity)).await? {
            Response::ReadCoils(bits) => Ok(bits.to_vec()),
            other => Err(unexpected(other)),
        }
    }

    /// Read discrete inputs (function code 0x02)
    async fn read_discrete_inputs(&self, unit_id: UnitId, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<bool>> {
        check_count(quantity as usize, MAX_READ_BITS)?;
        match self.call(unit_id, Request::read_discrete_inputs(address, quantity)).await? {
            Response::ReadDiscreteInputs(bits) => Ok(bits.to_vec()),
            other => Err(unexpected(other)),
        }
    }

    /// Read holding registers (function code 0x03)
    async fn read_holding_registers(&self, unit_id: UnitId, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<u16>> {
        check_count(quantity as usize, MAX_READ_REGISTERS)?;
        match self.call(unit_id, Request::read_holding_registers(address, quantity)).await? {
            Response::ReadHoldingRegisters(values) => Ok(values),
            other => Err(unexpected(other)),
        }
    }

    /// Read input registers (function code 0x04)
    async fn read_input_registers(&self, unit_id: UnitId, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<u16>> {
        check_count(quantity as usize, MAX_READ_REGISTERS)?;
        match self.call(unit_id, Request::read_input_registers(address, quantity)).await? {
            Response::ReadInputRegisters(values) => Ok(values),
            other => Err(unexpected(other)),
        }
    }

    /// Write single coil (function code 0x05)
    async fn write_single_coil(&self, unit_id: UnitId, address: ModbusAddress, value: bool) -> ModbusResult<()> {
        match self.call(unit_id, Request::write_single_coil(address, value)).await? {
            Response::WriteSingleCoil { address: a, value: v } if a == address && v == value => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Write single register (function code 0x06)
    async fn write_single_register(&self, unit_id: UnitId, address: ModbusAddress, value: u16) -> ModbusResult<()> {
        match self.call(unit_id, Request::write_single_register(address, value)).await? {
            Response::WriteSingleRegister { address: a, value: v } if a == address && v == value => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Write multiple coils (function code 0x0F)
    async fn write_multiple_coils(&self, unit_id: UnitId, address: ModbusAddress, values: &[bool]) -> ModbusResult<()> {
        check_count(values.len(), MAX_WRITE_BITS)?;
        let quantity = values.len() as u16;
        match self.call(unit_id, Request::write_multiple_coils(address, values)).await? {
            Response::WriteMultipleCoils { address: a, quantity: q } if a == address && q == quantity => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Write multiple registers (function code 0x10)
    async fn write_multiple_registers(&self, unit_id: UnitId, address: ModbusAddress, values: &[u16]) -> ModbusResult<()> {
        check_count(values.len(), MAX_WRITE_REGISTERS)?;
        let quantity = values.len() as u16;
        match self.call(unit_id, Request::write_multiple_registers(address, values)).await? {
            Response::WriteMultipleRegisters { address: a, quantity: q } if a == address && q == quantity => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn check_count(count: usize, max: u16) -> ModbusResult<()> {
    if count == 0 || count > max as usize {
        return Err(ModbusError::invalid_data(format!(
            "Invalid quantity: {} (must be 1-{})",
            count, max
        )));
    }
    Ok(())
}

fn unexpected(response: Response) -> ModbusError {
    match response {
        Response::Exception(exception) => exception.to_error(),
        other => ModbusError::protocol(format!("Unexpected response: {}", other)),
    }
}

/// Clears the in-flight flag when the transaction ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> ModbusResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ModbusError::illegal_state("A transaction is already in flight on this connection"))?;
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Connection<T> {
    transport: T,
    last_transaction_id: u16,
}

impl<T> Connection<T> {
    fn next_transaction_id(&mut self) -> u16 {
        self.last_transaction_id = self.last_transaction_id.wrapping_add(1);
        self.last_transaction_id
    }
}

/// Why a received frame does not answer the outstanding request
enum Rejection {
    /// Well formed but meant for another transaction: discard and read again
    Mismatch(ModbusError),
    /// Could not be decoded: treat like a failed read
    Malformed(ModbusError),
}

/// Transaction engine over any transport
pub struct ModbusMaster<T: ModbusTransport> {
    connection: tokio::sync::Mutex<Connection<T>>,
    in_flight: AtomicBool,
    config: MasterConfig,
    metrics: Mutex<PerformanceMetrics>,
    logger: Option<CallbackLogger>,
}

/// Master over a TCP socket
pub type ModbusTcpClient = ModbusMaster<TcpTransport<TcpStream>>;

/// Master over a serial stream
pub type ModbusRtuClient<S> = ModbusMaster<RtuTransport<S>>;

impl ModbusMaster<TcpTransport<TcpStream>> {
    /// Connect to a Modbus TCP slave
    pub async fn connect(address: SocketAddr, config: MasterConfig) -> ModbusResult<Self> {
        let transport = TcpTransport::connect(address, config.timeout()).await?;
        Ok(Self::with_config(transport, config))
    }
}

impl<T: ModbusTransport> ModbusMaster<T> {
    /// Create a master with the default configuration
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, MasterConfig::default())
    }

    pub fn with_config(transport: T, config: MasterConfig) -> Self {
        Self {
            connection: tokio::sync::Mutex::new(Connection {
                transport,
                last_transaction_id: 0,
            }),
            in_flight: AtomicBool::new(false),
            config,
            metrics: Mutex::new(PerformanceMetrics::new()),
            logger: None,
        }
    }

    /// Attach a logger that sees every request and response
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Snapshot of the transaction metrics
    pub fn get_metrics(&self) -> PerformanceMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Run one transaction
    ///
    /// The transaction id of `request` is ignored: the engine assigns the
    /// next one (TCP) and keeps it across re-sends. Exception responses are
    /// valid responses here.
    ///
    /// # Errors
    ///
    /// - `IllegalState` if another transaction is in flight on this master
    /// - `Frame` if the request does not fit in a PDU
    /// - `RetriesExhausted` when every attempt failed
    /// - `Connection` when the transport is closed or the peer went away
    pub async fn execute(&self, request: &RequestAdu) -> ModbusResult<ResponseAdu> {
        let _in_flight = InFlight::acquire(&self.in_flight)?;
        let mut connection = self.connection.lock().await;

        let timer = OperationTimer::start(&format!("{}", request.request()));
        let result = self.transact(&mut connection, request).await;
        let duration = timer.stop();

        self.record(|m| match &result {
            Ok(_) => m.record_success(duration),
            Err(_) => m.record_failure(duration),
        });
        result
    }

    async fn transact(&self, connection: &mut Connection<T>, request: &RequestAdu) -> ModbusResult<ResponseAdu> {
        let headless = connection.transport.is_headless();
        let request = if headless {
            request.with_transaction_id(0)
        } else {
            request.with_transaction_id(connection.next_transaction_id())
        };

        let frame = request.to_frame();
        if frame.pdu_len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "Request PDU of {} bytes exceeds the {} byte limit",
                frame.pdu_len(),
                MAX_PDU_SIZE
            )));
        }
        if let Some(logger) = &self.logger {
            logger.log_request(&request);
        }

        let per_attempt = self.config.timeout();
        let timeout_ms = self.config.timeout_ms;
        let attempts = self.config.retries.saturating_add(1);
        let transport = &mut connection.transport;
        let mut send = true;
        let mut last_error = ModbusError::internal("No attempt made");

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.record(|m| m.record_retry());
                debug!(
                    "Retrying transaction {} (attempt {}/{}): {}",
                    request.transaction_id(),
                    attempt,
                    attempts,
                    last_error
                );
            }

            if send {
                if attempt > 1 {
                    transport.reset().await?;
                }
                match timeout(per_attempt, transport.write_frame(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        last_error = e;
                        continue;
                    }
                    Err(_) => {
                        // Part of the frame may be on the wire; a resend would desync the peer
                        self.record(|m| m.record_timeout());
                        warn!(
                            "Sending transaction {} timed out after {} ms, closing the transport",
                            request.transaction_id(),
                            timeout_ms
                        );
                        transport.close().await?;
                        return Err(ModbusError::connection(format!(
                            "Send timed out after {} ms, transport closed",
                            timeout_ms
                        )));
                    }
                }
            }

            match timeout(per_attempt, transport.read_response()).await {
                Err(_) => {
                    self.record(|m| m.record_timeout());
                    last_error = ModbusError::timeout("read response", timeout_ms);
                    send = true;
                }
                Ok(Err(e)) => {
                    last_error = e;
                    send = true;
                }
                Ok(Ok(None)) => {
                    return Err(ModbusError::connection("Connection closed by peer"));
                }
                Ok(Ok(Some(received))) => match Self::correlate(&request, &received, headless) {
                    Ok(response) => {
                        if let Some(logger) = &self.logger {
                            logger.log_response(&response);
                        }
                        return Ok(response);
                    }
                    Err(Rejection::Mismatch(e)) => {
                        self.record(|m| m.record_mismatch());
                        debug!("Discarding response: {}", e);
                        last_error = e;
                        send = false;
                    }
                    Err(Rejection::Malformed(e)) => {
                        last_error = e;
                        send = true;
                    }
                },
            }
        }

        let success_rate = self.metrics.lock().map(|m| m.success_rate()).unwrap_or_default();
        warn!(
            "Transaction {} to unit {} failed after {} attempts: {} (success rate so far {:.1}%)",
            request.transaction_id(),
            request.unit_id(),
            attempts,
            last_error,
            success_rate
        );
        Err(ModbusError::retries_exhausted(attempts, &last_error))
    }

    /// Check that `received` answers `request` and decode it
    fn correlate(request: &RequestAdu, received: &Frame, headless: bool) -> Result<ResponseAdu, Rejection> {
        if !headless && received.header.transaction_id != request.transaction_id() {
            return Err(Rejection::Mismatch(ModbusError::protocol(format!(
                "Transaction id mismatch: expected {}, got {}",
                request.transaction_id(),
                received.header.transaction_id
            ))));
        }
        if received.header.unit_id != request.unit_id() {
            return Err(Rejection::Mismatch(ModbusError::protocol(format!(
                "Unit id mismatch: expected {}, got {}",
                request.unit_id(),
                received.header.unit_id
            ))));
        }
        let function_code = request.request().function_code();
        if received.function_code != function_code && received.function_code != function_code | EXCEPTION_FLAG {
            return Err(Rejection::Mismatch(ModbusError::protocol(format!(
                "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
                function_code, received.function_code
            ))));
        }

        let response = ResponseAdu::decode(received).map_err(Rejection::Malformed)?;
        Self::fit_to_request(request.request(), response)
            .map(|r| ResponseAdu::new(received.header, r))
            .map_err(Rejection::Malformed)
    }

    /// Cut read-bit responses to the requested quantity and check counts
    fn fit_to_request(request: &Request, response: ResponseAdu) -> ModbusResult<Response> {
        let quantity = match request {
            Request::ReadCoils(read)
            | Request::ReadDiscreteInputs(read)
            | Request::ReadHoldingRegisters(read)
            | Request::ReadInputRegisters(read) => read.quantity,
            _ => return Ok(response.into_response()),
        };

        match response.into_response() {
            Response::ReadCoils(bits) | Response::ReadDiscreteInputs(bits) if bits.size() < quantity as usize => {
                Err(ModbusError::protocol(format!(
                    "Response carries {} bits, {} requested",
                    bits.size(),
                    quantity
                )))
            }
            Response::ReadHoldingRegisters(values) | Response::ReadInputRegisters(values)
                if values.len() != quantity as usize =>
            {
                Err(ModbusError::protocol(format!(
                    "Response carries {} registers, {} requested",
                    values.len(),
                    quantity
                )))
            }
            other => Ok(other.truncate_bits(quantity)),
        }
    }

    fn record(&self, update: impl FnOnce(&mut PerformanceMetrics)) {
        if let Ok(mut metrics) = self.metrics.lock() {
            update(&mut metrics);
        }
    }

    /// Close the underlying transport
    pub async fn close(&self) -> ModbusResult<()> {
        let _in_flight = InFlight::acquire(&self.in_flight)?;
        self.connection.lock().await.transport.close().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.transport.is_connected()
    }

    pub async fn get_stats(&self) -> TransportStats {
        self.connection.lock().await.transport.get_stats()
    }
}

#[async_trait]
impl<T: ModbusTransport> ModbusClient for ModbusMaster<T> {
    async fn call(&self, unit_id: UnitId, request: Request) -> ModbusResult<Response> {
        let response = self.execute(&RequestAdu::new(unit_id, request)).await?;
        Ok(response.into_response())
    }

    async fn is_connected(&self) -> bool {
        ModbusMaster::is_connected(self).await
    }

    async fn close(&self) -> ModbusResult<()> {
        ModbusMaster::close(self).await
    }

    async fn get_stats(&self) -> TransportStats {
        ModbusMaster::get_stats(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Header;
    use crate::response::ExceptionResponse;
    use crate::protocol::ModbusException;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn tcp_pair(config: MasterConfig) -> (ModbusMaster<TcpTransport<DuplexStream>>, TcpTransport<DuplexStream>) {
        let (a, b) = duplex(1024);
        (ModbusMaster::with_config(TcpTransport::new(a), config), TcpTransport::new(b))
    }

    fn config(timeout_ms: u64, retries: u32) -> MasterConfig {
        MasterConfig { timeout_ms, retries }
    }

    fn reply(request: &Frame, function_code: u8, data: Vec<u8>) -> Frame {
        Frame::new(request.header, function_code, data)
    }

    #[tokio::test]
    async fn test_execute_read_registers() {
        let (master, mut peer) = tcp_pair(config(1000, 0));

        let slave = tokio::spawn(async move {
            let request = peer.read_request().await.unwrap().unwrap();
            assert_eq!(request.header.transaction_id, 1);
            peer.write_frame(&reply(&request, 0x03, vec![0x04, 0x00, 0x0A, 0x00, 0x0B])).await.unwrap();
            peer
        });

        let values = master.read_holding_registers(1, 0, 2).await.unwrap();
        assert_eq!(values, vec![10, 11]);
        slave.await.unwrap();

        let metrics = master.get_metrics();
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.retries, 0);
    }

    #[tokio::test]
    async fn test_mismatched_transaction_id_is_discarded() {
        let (master, mut peer) = tcp_pair(config(1000, 3));

        let slave = tokio::spawn(async move {
            let request = peer.read_request().await.unwrap().unwrap();
            let mut stale = reply(&request, 0x03, vec![0x02, 0xDE, 0xAD]);
            stale.header.transaction_id = request.header.transaction_id.wrapping_add(1);
            peer.write_frame(&stale).await.unwrap();
            peer.write_frame(&reply(&request, 0x03, vec![0x02, 0x00, 0x2A])).await.unwrap();
            peer
        });

        let response = master
            .execute(&RequestAdu::new(1, Request::read_holding_registers(0, 1)))
            .await
            .unwrap();
        assert_eq!(response.response(), &Response::ReadHoldingRegisters(vec![42]));

        let mut peer = slave.await.unwrap();
        // nothing was re-sent
        assert_eq!(peer.get_stats().frames_received, 1);
        assert!(master.close().await.is_ok());
        assert!(peer.read_request().await.unwrap().is_none());

        let metrics = master.get_metrics();
        assert_eq!(metrics.mismatched_responses, 1);
        assert_eq!(metrics.retries, 1);
    }

    #[tokio::test]
    async fn test_unit_and_function_mismatch_are_discarded() {
        let (master, mut peer) = tcp_pair(config(1000, 2));

        let slave = tokio::spawn(async move {
            let request = peer.read_request().await.unwrap().unwrap();
            let mut other_unit = reply(&request, 0x01, vec![0x01, 0x01]);
            other_unit.header.unit_id = 99;
            peer.write_frame(&other_unit).await.unwrap();
            peer.write_frame(&reply(&request, 0x02, vec![0x01, 0x01])).await.unwrap();
            peer.write_frame(&reply(&request, 0x01, vec![0x01, 0b101])).await.unwrap();
            peer
        });

        let bits = master.read_coils(7, 0, 3).await.unwrap();
        assert_eq!(bits, vec![true, false, true]);
        slave.await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatches_consume_retry_budget() {
        let (master, mut peer) = tcp_pair(config(1000, 1));

        let slave = tokio::spawn(async move {
            let request = peer.read_request().await.unwrap().unwrap();
            for offset in 1..=2u16 {
                let mut stale = reply(&request, 0x06, vec![0x00, 0x01, 0x00, 0x02]);
                stale.header.transaction_id = request.header.transaction_id.wrapping_add(offset);
                peer.write_frame(&stale).await.unwrap();
            }
            peer
        });

        let err = master.write_single_register(1, 1, 2).await.unwrap_err();
        assert!(matches!(err, ModbusError::RetriesExhausted { attempts: 2, .. }));
        assert!(err.is_transport_error());
        let _peer = slave.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resends_same_transaction_id() {
        let (master, mut peer) = tcp_pair(config(100, 3));

        let slave = tokio::spawn(async move {
            let first = peer.read_request().await.unwrap().unwrap();
            // first attempt goes unanswered
            let second = peer.read_request().await.unwrap().unwrap();
            assert_eq!(first, second);
            peer.write_frame(&reply(&second, 0x05, vec![0x00, 0x03, 0xFF, 0x00])).await.unwrap();
            peer
        });

        master.write_single_coil(1, 3, true).await.unwrap();
        slave.await.unwrap();

        let metrics = master.get_metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let (master, _peer) = tcp_pair(config(100, 2));

        let err = master
            .execute(&RequestAdu::new(1, Request::read_coils(0, 1)))
            .await
            .unwrap_err();
        match err {
            ModbusError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("Timeout"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(master.get_metrics().timeouts, 3);
        assert_eq!(master.get_metrics().failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_closes_transport() {
        let (a, mut b) = duplex(8);
        let master = ModbusMaster::with_config(TcpTransport::new(a), config(100, 1));

        let slave = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let mut received = Vec::new();
            b.read_to_end(&mut received).await.unwrap();
            received
        });

        let err = master.read_holding_registers(1, 0x6B, 3).await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
        assert!(!master.is_connected().await);

        // Only the interrupted first frame reached the peer, nothing was resent
        let sent = RequestAdu::new(1, Request::read_holding_registers(0x6B, 3))
            .with_transaction_id(1)
            .to_frame()
            .to_tcp_adu()
            .unwrap();
        let received = slave.await.unwrap();
        assert_eq!(received, sent[..8].to_vec());

        let metrics = master.get_metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.retries, 0);
        assert_eq!(metrics.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_unbounded_retry_config() {
        let (master, mut peer) = tcp_pair(config(1000, u32::MAX));

        let slave = tokio::spawn(async move {
            let request = peer.read_request().await.unwrap().unwrap();
            peer.write_frame(&reply(&request, 0x01, vec![0x01, 0x01])).await.unwrap();
            peer
        });

        assert_eq!(master.read_coils(1, 0, 1).await.unwrap(), vec![true]);
        slave.await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_ids_increase() {
        let (master, mut peer) = tcp_pair(config(1000, 0));

        let slave = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let request = peer.read_request().await.unwrap().unwrap();
                ids.push(request.header.transaction_id);
                peer.write_frame(&reply(&request, 0x06, request.data.clone())).await.unwrap();
            }
            ids
        });

        for value in 0..3 {
            master.write_single_register(1, 0, value).await.unwrap();
        }
        assert_eq!(slave.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_overlapping_execute_is_illegal_state() {
        let (master, mut peer) = tcp_pair(config(1000, 0));
        let master = Arc::new(master);

        let slave = tokio::spawn(async move {
            let request = peer.read_request().await.unwrap().unwrap();
            peer.write_frame(&reply(&request, 0x01, vec![0x01, 0x01])).await.unwrap();
            peer
        });

        let request = RequestAdu::new(1, Request::read_coils(0, 1));
        let (first, second) = tokio::join!(master.execute(&request), master.execute(&request));
        assert!(first.is_ok());
        assert!(matches!(second, Err(ModbusError::IllegalState { .. })));
        slave.await.unwrap();

        // the flag is released once the transaction completes
        assert!(master.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_exception_response() {
        let (master, mut peer) = tcp_pair(config(1000, 3));

        let slave = tokio::spawn(async move {
            for _ in 0..2 {
                let request = peer.read_request().await.unwrap().unwrap();
                peer.write_frame(&reply(&request, 0x83, vec![0x02])).await.unwrap();
            }
            peer
        });

        let response = master
            .execute(&RequestAdu::new(1, Request::read_holding_registers(100, 5)))
            .await
            .unwrap();
        assert_eq!(
            response.response(),
            &Response::Exception(ExceptionResponse::new(0x03, ModbusException::IllegalDataAddress))
        );

        let err = master.read_holding_registers(1, 100, 5).await.unwrap_err();
        assert!(matches!(err, ModbusError::Exception { function: 0x03, code: 0x02, .. }));
        assert_eq!(master.get_metrics().retries, 0);
        slave.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_closed() {
        let (master, peer) = tcp_pair(config(1000, 3));
        drop(peer);

        let err = master.read_coils(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. } | ModbusError::Io { .. }));
    }

    #[tokio::test]
    async fn test_rtu_master_is_headless() {
        let (a, b) = duplex(256);
        let master = ModbusMaster::with_config(RtuTransport::new(a), config(1000, 0));
        let mut peer = RtuTransport::new(b);

        let slave = tokio::spawn(async move {
            let request = peer.read_request().await.unwrap().unwrap();
            assert_eq!(request.header, Header::new(4));
            peer.write_frame(&reply(&request, 0x04, vec![0x02, 0x01, 0x00])).await.unwrap();
            peer
        });

        assert_eq!(master.read_input_registers(4, 9, 1).await.unwrap(), vec![0x0100]);
        slave.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_side_quantity_checks() {
        let (master, _peer) = tcp_pair(config(1000, 0));

        assert!(matches!(master.read_coils(1, 0, 0).await, Err(ModbusError::InvalidData { .. })));
        assert!(matches!(master.read_holding_registers(1, 0, 126).await, Err(ModbusError::InvalidData { .. })));
        assert!(matches!(master.write_multiple_registers(1, 0, &[0; 124]).await, Err(ModbusError::InvalidData { .. })));
        assert_eq!(master.get_metrics().total_requests, 0);
    }

    #[test]
    fn test_master_config_serde() {
        let config: MasterConfig = serde_json::from_str(r#"{"timeout_ms": 250}"#).unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.retries, 3);
        assert_eq!(MasterConfig::default().timeout(), Duration::from_secs(5));
    }
}
