//! Modbus slave side
//!
//! The [`Dispatcher`] routes decoded requests to the device registry and
//! drives one connection through [`Dispatcher::serve`]. [`ModbusTcpServer`]
//! accepts TCP connections and runs one dispatch loop per connection.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

use crate::device::DeviceRegistry;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{Frame, ModbusException};
use crate::request::RequestAdu;
use crate::response::{ExceptionResponse, Response, ResponseAdu};
use crate::transport::{ModbusTransport, TcpTransport};

/// Served requests between two housekeeping runs unless configured otherwise
pub const DEFAULT_HOUSEKEEPING_INTERVAL: u64 = 15;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;

    /// Address the server is listening on, once started
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub exception_responses: u64,
    pub malformed_frames: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    requests: AtomicU64,
    exceptions: AtomicU64,
    malformed: AtomicU64,
}

/// Periodic task run by the dispatcher
#[derive(Clone)]
struct Housekeeping {
    interval: u64,
    task: Arc<dyn Fn() + Send + Sync>,
}

/// Routes requests to the process images of a device registry
///
/// Shared between connections behind an `Arc`; counters and the housekeeping
/// schedule are server wide.
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    logger: Option<CallbackLogger>,
    housekeeping: Option<Housekeeping>,
    counters: DispatchCounters,
}

impl Dispatcher {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            logger: None,
            housekeeping: None,
            counters: DispatchCounters::default(),
        }
    }

    /// Attach a callback logger that sees every request and response
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Run `task` after every `interval` served requests
    ///
    /// An interval of zero disables the task.
    pub fn with_housekeeping<F>(mut self, interval: u64, task: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.housekeeping = (interval > 0).then(|| Housekeeping {
            interval,
            task: Arc::new(task),
        });
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Answer one decoded request
    ///
    /// The first device registered for the unit id answers from its process
    /// image. An unknown unit, or a device without an image, gets an Illegal
    /// Function exception.
    pub fn dispatch(&self, request: &RequestAdu) -> ResponseAdu {
        let image = self
            .registry
            .find_by_unit_id(request.unit_id())
            .and_then(|device| device.process_image());

        match image {
            Some(image) => request.build_response(image),
            None => {
                debug!("No process image for unit {}", request.unit_id());
                request.build_exception_response(ModbusException::IllegalFunction)
            }
        }
    }

    /// Decode, dispatch and encode one request frame
    ///
    /// Returns `None` when the frame is malformed and no answer can be given.
    pub fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        let request = match RequestAdu::decode(&frame) {
            Ok(request) => request,
            Err(e @ (ModbusError::InvalidFunction { .. } | ModbusError::InvalidData { .. })) => {
                debug!("Rejecting request from unit {}: {}", frame.header.unit_id, e);
                let code = match e {
                    ModbusError::InvalidFunction { .. } => ModbusException::IllegalFunction,
                    _ => ModbusException::IllegalDataValue,
                };
                let response = Response::Exception(ExceptionResponse::new(frame.function_code, code));
                let adu = ResponseAdu::new(frame.header, response);
                self.finish(&adu);
                return Some(adu.to_frame());
            }
            Err(e) => {
                warn!("Dropping malformed request from unit {}: {}", frame.header.unit_id, e);
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if let Some(logger) = &self.logger {
            logger.log_request(&request);
        }
        let response = self.dispatch(&request);
        self.finish(&response);
        Some(response.to_frame())
    }

    /// Serve requests from one transport until EOF or shutdown
    ///
    /// Frames the transport rejects (bad CRC, bad protocol id, unknown
    /// function on a headless link) are skipped; stream failures end the
    /// loop with the error.
    pub async fn serve<T>(&self, transport: &mut T, mut shutdown: broadcast::Receiver<()>) -> ModbusResult<()>
    where
        T: ModbusTransport + ?Sized,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("Shutdown signal received, leaving dispatch loop");
                    return Ok(());
                }
                result = transport.read_request() => result,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Peer closed the connection");
                    return Ok(());
                }
                Err(e) if matches!(e, ModbusError::Frame { .. } | ModbusError::CrcMismatch { .. }) => {
                    warn!("Skipping invalid frame: {}", e);
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    error!("Transport failed: {}", e);
                    return Err(e);
                }
            };

            if let Some(response) = self.handle_frame(frame) {
                transport.write_frame(&response).await?;
            }
        }
    }

    /// Request, exception and malformed frame counters
    ///
    /// Connection count and uptime are left at zero; the server fills them.
    pub fn get_stats(&self) -> ServerStats {
        ServerStats {
            total_requests: self.counters.requests.load(Ordering::Relaxed),
            exception_responses: self.counters.exceptions.load(Ordering::Relaxed),
            malformed_frames: self.counters.malformed.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    fn finish(&self, response: &ResponseAdu) {
        if let Some(logger) = &self.logger {
            logger.log_response(response);
        }
        if response.response().is_exception() {
            self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
        }

        let served = self.counters.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(housekeeping) = &self.housekeeping {
            if served % housekeeping.interval == 0 {
                debug!("Running housekeeping after {} requests", served);
                (housekeeping.task)();
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("devices", &self.registry.len())
            .field("logger", &self.logger)
            .field("housekeeping", &self.housekeeping.as_ref().map(|h| h.interval))
            .field("counters", &self.counters)
            .finish()
    }
}

/// Modbus TCP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    pub max_connections: usize,
    /// Dump every frame through `tracing`
    pub packet_logging: bool,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 502)),
            max_connections: 100,
            packet_logging: false,
        }
    }
}

/// Modbus TCP server implementation
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl ModbusTcpServer {
    /// Create a server with default configuration on `bind_address`
    pub fn new(bind_address: &str, registry: Arc<DeviceRegistry>) -> ModbusResult<Self> {
        let bind_address = bind_address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("Invalid bind address: {}", e)))?;

        let config = ModbusTcpServerConfig {
            bind_address,
            ..Default::default()
        };

        Self::with_config(config, registry)
    }

    /// Create a server with custom configuration
    pub fn with_config(config: ModbusTcpServerConfig, registry: Arc<DeviceRegistry>) -> ModbusResult<Self> {
        Self::with_dispatcher(config, Dispatcher::new(registry))
    }

    /// Create a server around a pre-configured dispatcher
    pub fn with_dispatcher(config: ModbusTcpServerConfig, dispatcher: Dispatcher) -> ModbusResult<Self> {
        if config.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be at least 1"));
        }

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
            connections: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
            start_time: None,
        })
    }

    pub fn config(&self) -> &ModbusTcpServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Arc<Dispatcher>,
        connections: Arc<AtomicU64>,
        shutdown_tx: broadcast::Sender<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
        max_connections: usize,
        packet_logging: bool,
    ) {
        let permits = Arc::new(Semaphore::new(max_connections));

        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer_addr) = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            info!("New client connected: {}", peer_addr);
            connections.fetch_add(1, Ordering::Relaxed);

            let dispatcher = dispatcher.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _permit = permit;
                let mut transport = TcpTransport::with_packet_logging(stream, packet_logging);
                if let Err(e) = dispatcher.serve(&mut transport, shutdown_rx).await {
                    warn!("Connection {} ended with error: {}", peer_addr, e);
                }
                let _ = transport.close().await;
                info!("Client {} disconnected", peer_addr);
            });
        }

        debug!("Accept loop stopped");
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::illegal_state("Server is already running"));
        }

        info!("Starting Modbus TCP server on {}", self.config.bind_address);

        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.local_addr = Some(local_addr);
        self.start_time = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        info!("Modbus TCP server listening on {}", local_addr);
        info!("   - Max connections: {}", self.config.max_connections);
        info!("   - Devices: {}", self.dispatcher.registry().len());

        let dispatcher = self.dispatcher.clone();
        let connections = self.connections.clone();
        let running = self.running.clone();
        let max_connections = self.config.max_connections;
        let packet_logging = self.config.packet_logging;
        let shutdown_rx = shutdown_tx.subscribe();

        self.accept_task = Some(tokio::spawn(async move {
            Self::accept_loop(
                listener,
                dispatcher,
                connections,
                shutdown_tx,
                shutdown_rx,
                max_connections,
                packet_logging,
            )
            .await;
            running.store(false, Ordering::SeqCst);
        }));

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(accept_task) = self.accept_task.take() {
            accept_task
                .await
                .map_err(|e| ModbusError::internal(format!("Accept loop panicked: {}", e)))?;
        }
        self.running.store(false, Ordering::SeqCst);

        info!("Modbus TCP server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        ServerStats {
            connections_count: self.connections.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.map_or(0, |start| start.elapsed().as_secs()),
            ..self.dispatcher.get_stats()
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceRole};
    use crate::process_image::ProcessImage;
    use crate::protocol::Header;
    use crate::request::Request;
    use crate::transport::RtuTransport;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn registry_with(unit_id: u8, image: Arc<ProcessImage>) -> Arc<DeviceRegistry> {
        Arc::new(
            DeviceRegistry::new()
                .with_device(Device::new(9, DeviceRole::Master))
                .with_device(Device::slave(unit_id, image)),
        )
    }

    fn frame_for(unit_id: u8, tid: u16, request: Request) -> Frame {
        RequestAdu::new(unit_id, request).with_transaction_id(tid).to_frame()
    }

    #[test]
    fn test_dispatch_routes_by_unit() {
        let image = Arc::new(ProcessImage::new(0, 10, 0, 10));
        image.set_holding_register(2, 0x1234).unwrap();
        let dispatcher = Dispatcher::new(registry_with(15, image));

        let adu = RequestAdu::new(15, Request::read_holding_registers(2, 1)).with_transaction_id(4);
        let response = dispatcher.dispatch(&adu);
        assert_eq!(response.transaction_id(), 4);
        assert_eq!(response.unit_id(), 15);
        assert_eq!(response.response(), &Response::ReadHoldingRegisters(vec![0x1234]));

        // unknown unit and imageless device
        for unit_id in [1, 9] {
            let adu = RequestAdu::new(unit_id, Request::read_coils(0, 1));
            let response = dispatcher.dispatch(&adu);
            assert_eq!(
                response.response(),
                &Response::Exception(ExceptionResponse::new(0x01, ModbusException::IllegalFunction))
            );
        }
    }

    #[test]
    fn test_handle_frame_errors() {
        let dispatcher = Dispatcher::new(registry_with(1, Arc::new(ProcessImage::new(0, 8, 0, 0))));
        let header = Header::new(1).with_transaction_id(3);

        let reply = dispatcher.handle_frame(Frame::new(header, 0x2B, vec![0x0E])).unwrap();
        assert_eq!(reply.function_code, 0xAB);
        assert_eq!(reply.data, vec![0x01]);
        assert_eq!(reply.header.transaction_id, 3);

        let reply = dispatcher
            .handle_frame(Frame::new(header, 0x05, vec![0x00, 0x01, 0x12, 0x34]))
            .unwrap();
        assert_eq!(reply.function_code, 0x85);
        assert_eq!(reply.data, vec![0x03]);

        assert!(dispatcher.handle_frame(Frame::new(header, 0x03, vec![0x00])).is_none());

        let stats = dispatcher.get_stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.exception_responses, 2);
        assert_eq!(stats.malformed_frames, 1);
    }

    #[test]
    fn test_housekeeping_interval() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let dispatcher = Dispatcher::new(registry_with(1, Arc::new(ProcessImage::new(0, 8, 0, 0))))
            .with_housekeeping(3, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        for tid in 0..7 {
            dispatcher.handle_frame(frame_for(1, tid, Request::read_coils(0, 1))).unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_serve_tcp_connection() {
        let image = Arc::new(ProcessImage::new(0, 16, 0, 0));
        let dispatcher = Arc::new(Dispatcher::new(registry_with(15, image.clone())));
        let (client, server) = duplex(1024);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let mut transport = TcpTransport::new(server);
                dispatcher.serve(&mut transport, shutdown_rx).await
            })
        };

        let mut client = TcpTransport::new(client);
        client
            .write_frame(&frame_for(15, 1, Request::write_multiple_coils(5, &[true, true, true])))
            .await
            .unwrap();
        let reply = client.read_response().await.unwrap().unwrap();
        assert_eq!(reply.header.transaction_id, 1);
        assert_eq!(reply.function_code, 0x0F);
        assert_eq!(reply.data, vec![0x00, 0x05, 0x00, 0x03]);

        client
            .write_frame(&frame_for(15, 2, Request::read_coils(4, 5)))
            .await
            .unwrap();
        let reply = client.read_response().await.unwrap().unwrap();
        assert_eq!(reply.data, vec![0x01, 0b0000_1110]);
        assert_eq!(image.get_coils(5, 3).unwrap(), vec![true; 3]);

        client.close().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let dispatcher = Dispatcher::new(registry_with(1, Arc::new(ProcessImage::new(0, 1, 0, 0))));
        let (_client, server) = duplex(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut transport = TcpTransport::new(server);

        shutdown_tx.send(()).unwrap();
        dispatcher.serve(&mut transport, shutdown_rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_rtu_skips_bad_crc() {
        let image = Arc::new(ProcessImage::new(0, 0, 0, 4));
        image.set_holding_registers(0, &[1, 2]).unwrap();
        let dispatcher = Dispatcher::new(registry_with(1, image));
        let (mut client, server) = duplex(256);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let good = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];
        let mut bad = good;
        bad[7] ^= 0xFF;
        client.write_all(&bad).await.unwrap();
        client.write_all(&good).await.unwrap();

        let serve = async {
            let mut transport = RtuTransport::new(server);
            dispatcher.serve(&mut transport, shutdown_rx).await
        };
        let exchange = async {
            let mut reply = [0u8; 9];
            client.read_exact(&mut reply).await.unwrap();
            drop(client);
            reply
        };
        let (served, reply) = tokio::join!(serve, exchange);

        served.unwrap();
        assert_eq!(&reply[..7], &[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(dispatcher.get_stats().malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let registry = registry_with(1, Arc::new(ProcessImage::new(0, 1, 0, 0)));
        let config = ModbusTcpServerConfig {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let mut server = ModbusTcpServer::with_config(config, registry).unwrap();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());

        server.start().await.unwrap();
        assert!(server.is_running());
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(matches!(server.start().await, Err(ModbusError::IllegalState { .. })));

        server.stop().await.unwrap();
        assert!(!server.is_running());
    }

    #[test]
    fn test_config() {
        assert!(ModbusTcpServer::new("not an address", Arc::new(DeviceRegistry::new())).is_err());

        let config = ModbusTcpServerConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(ModbusTcpServer::with_config(config, Arc::new(DeviceRegistry::new())).is_err());

        let config: ModbusTcpServerConfig =
            serde_json::from_str(r#"{"bind_address": "0.0.0.0:1502"}"#).unwrap();
        assert_eq!(config.bind_address.port(), 1502);
        assert_eq!(config.max_connections, 100);
    }
}
