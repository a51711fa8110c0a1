//! # Modbus Transport Layer
//!
//! Transports move [`Frame`]s over a byte stream. They know about length
//! prefixes, checksums and frame boundaries; they do not know about function
//! semantics, retries or process images.
//!
//! ## Supported Transports
//!
//! ### Modbus TCP (`TcpTransport`)
//! - MBAP header: `tid:u16, pid:u16 (=0), len:u16, unit:u8`, then the PDU
//! - `len` counts the unit id and the PDU
//! - A frame with a nonzero protocol id is consumed and rejected
//!
//! ### Modbus RTU (`RtuTransport`)
//! - `unit:u8, fc:u8, payload, crc:u16` with CRC-16/MODBUS sent low byte first
//! - No length prefix: the frame length is derived from the function code and,
//!   for variable length frames, the byte count field
//! - Headless: there is no transaction id, so the master skips tid matching
//!
//! Both are generic over any `AsyncRead + AsyncWrite` stream, which is how
//! serial ports, sockets and in-memory pipes all plug in. Reads go through an
//! internal buffer, so a read abandoned by a timeout or a shutdown signal
//! never loses bytes of a frame.
//!
//! ## Usage Examples
//!
//! ```rust,no_run
//! use procimg_modbus::transport::{ModbusTransport, TcpTransport};
//! use procimg_modbus::protocol::{Frame, Header};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = TcpTransport::connect(
//!         "127.0.0.1:502".parse()?,
//!         Duration::from_secs(5),
//!     ).await?;
//!
//!     let request = Frame::new(Header::new(1).with_transaction_id(1), 0x03, vec![0, 0, 0, 10]);
//!     transport.write_frame(&request).await?;
//!
//!     if let Some(response) = transport.read_response().await? {
//!         println!("Response: {:?}", response);
//!     }
//!
//!     let stats = transport.get_stats();
//!     println!("Frames sent: {}", stats.frames_sent);
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use bytes::BytesMut;
use crc::{Crc, CRC_16_MODBUS};
use log::debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{data_utils, Frame, Header, EXCEPTION_FLAG, MAX_PDU_SIZE};

/// MBAP header size including the unit id
const MBAP_HEADER_SIZE: usize = 7;

/// Maximum frame size for Modbus TCP (MBAP header + PDU)
const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum frame size for Modbus RTU
const MAX_RTU_FRAME_SIZE: usize = 256;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Log packet with direction and format
fn log_packet(direction: &str, data: &[u8], protocol: &str, unit_id: Option<u8>) {
    let hex_string = data_utils::format_hex(data);
    match unit_id {
        Some(id) => info!("[MODBUS-{}] {} unit:{} {}", protocol, direction, id, hex_string),
        None => info!("[MODBUS-{}] {} {}", protocol, direction, hex_string),
    }
}

/// Transport layer abstraction for Modbus communication
///
/// The same trait serves both ends of a link: a slave reads requests and
/// writes responses, a master writes requests and reads responses. Reads
/// return `Ok(None)` when the peer closed the stream between frames.
///
/// ## Error Handling
///
/// - `ModbusError::Frame` / `ModbusError::CrcMismatch` - bytes arrived but did
///   not form a valid frame. The offending bytes are consumed, so the caller
///   may keep reading.
/// - `ModbusError::Io` / `ModbusError::Connection` - the stream itself failed
#[async_trait]
pub trait ModbusTransport: Send {
    /// `true` for transports without transaction ids (RTU)
    fn is_headless(&self) -> bool;

    /// Read the next request frame (slave side)
    async fn read_request(&mut self) -> ModbusResult<Option<Frame>>;

    /// Read the next response frame (master side)
    async fn read_response(&mut self) -> ModbusResult<Option<Frame>>;

    /// Serialize and send one frame
    async fn write_frame(&mut self, frame: &Frame) -> ModbusResult<()>;

    /// Prepare for a retransmission after a failed exchange
    ///
    /// Headless transports drop any partially received bytes. TCP keeps its
    /// buffer: frames are length prefixed, so a late response is read whole
    /// and rejected by its transaction id.
    async fn reset(&mut self) -> ModbusResult<()>;

    /// Check if the transport still holds its stream
    fn is_connected(&self) -> bool;

    /// Shut down and release the stream
    async fn close(&mut self) -> ModbusResult<()>;

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Read from `stream` until `buffer` holds at least `needed` bytes
///
/// Returns `Ok(false)` on a clean end of stream (nothing buffered). An end of
/// stream in the middle of a frame discards the partial frame and fails.
async fn fill_buffer<S>(stream: Option<&mut S>, buffer: &mut BytesMut, needed: usize) -> ModbusResult<bool>
where
    S: AsyncRead + Unpin,
{
    let stream = stream.ok_or_else(|| ModbusError::connection("Transport is closed"))?;
    while buffer.len() < needed {
        if stream.read_buf(buffer).await? == 0 {
            if buffer.is_empty() {
                return Ok(false);
            }
            let partial = buffer.len();
            buffer.clear();
            return Err(ModbusError::frame(format!(
                "Stream closed after {} of {} frame bytes",
                partial, needed
            )));
        }
    }
    Ok(true)
}

async fn write_adu<S>(stream: Option<&mut S>, adu: &[u8]) -> ModbusResult<()>
where
    S: AsyncWrite + Unpin,
{
    let stream = stream.ok_or_else(|| ModbusError::connection("Transport is closed"))?;
    stream.write_all(adu).await?;
    stream.flush().await?;
    Ok(())
}

/// Modbus TCP transport implementation
pub struct TcpTransport<S = TcpStream> {
    stream: Option<S>,
    buffer: BytesMut,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpTransport<TcpStream> {
    /// Connect to a Modbus TCP slave
    pub async fn connect(address: SocketAddr, connect_timeout: Duration) -> ModbusResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ModbusError::timeout(format!("connect to {}", address), connect_timeout.as_millis() as u64))?
            .map_err(|e| ModbusError::connection(format!("Failed to connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        Ok(Self::new(stream))
    }

    /// Address of the remote end, if still connected
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }
}

impl<S> TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            buffer: BytesMut::with_capacity(MAX_TCP_FRAME_SIZE),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Wrap a stream with packet logging enabled or disabled
    pub fn with_packet_logging(stream: S, enabled: bool) -> Self {
        let mut transport = Self::new(stream);
        transport.packet_logging = enabled;
        transport
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    async fn read_frame(&mut self) -> ModbusResult<Option<Frame>> {
        match self.try_read_frame().await {
            Err(e) => {
                self.stats.errors += 1;
                Err(e)
            }
            ok => ok,
        }
    }

    async fn try_read_frame(&mut self) -> ModbusResult<Option<Frame>> {
        if !fill_buffer(self.stream.as_mut(), &mut self.buffer, MBAP_HEADER_SIZE).await? {
            return Ok(None);
        }

        // length covers unit id + function code + payload
        let length = u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize;
        if !(2..=MAX_PDU_SIZE + 1).contains(&length) {
            self.buffer.clear();
            return Err(ModbusError::frame(format!("Invalid MBAP length {}", length)));
        }

        let total = MBAP_HEADER_SIZE - 1 + length;
        fill_buffer(self.stream.as_mut(), &mut self.buffer, total).await?;
        let adu = self.buffer.split_to(total);

        self.stats.frames_received += 1;
        self.stats.bytes_received += total as u64;
        if self.packet_logging {
            log_packet("receive", &adu, "TCP", Some(adu[6]));
        }

        let header = Header {
            transaction_id: u16::from_be_bytes([adu[0], adu[1]]),
            protocol_id: u16::from_be_bytes([adu[2], adu[3]]),
            unit_id: adu[6],
        };
        if header.protocol_id != 0 {
            return Err(ModbusError::frame(format!(
                "Unexpected protocol id {} (transaction {})",
                header.protocol_id, header.transaction_id
            )));
        }

        Ok(Some(Frame::new(header, adu[7], adu[8..].to_vec())))
    }
}

#[async_trait]
impl<S> ModbusTransport for TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn is_headless(&self) -> bool {
        false
    }

    async fn read_request(&mut self) -> ModbusResult<Option<Frame>> {
        self.read_frame().await
    }

    async fn read_response(&mut self) -> ModbusResult<Option<Frame>> {
        self.read_frame().await
    }

    async fn write_frame(&mut self, frame: &Frame) -> ModbusResult<()> {
        let adu = frame.to_tcp_adu()?;
        if self.packet_logging {
            log_packet("send", &adu, "TCP", Some(frame.header.unit_id));
        }

        if let Err(e) = write_adu(self.stream.as_mut(), &adu).await {
            self.stats.errors += 1;
            // A socket that failed a write is not reused
            self.stream = None;
            return Err(e);
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += adu.len() as u64;
        Ok(())
    }

    async fn reset(&mut self) -> ModbusResult<()> {
        if self.stream.is_none() {
            return Err(ModbusError::connection("Transport is closed"));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.buffer.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error shutting down TCP stream: {}", e);
            }
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Request,
    Response,
}

/// How an RTU frame announces its length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RtuLength {
    /// Whole frame size including the CRC
    Fixed(usize),
    /// Offset of a byte count field; the frame ends `count + 2` bytes after it
    ByteCount(usize),
}

fn rtu_length(kind: FrameKind, function_code: u8) -> Option<RtuLength> {
    match (kind, function_code) {
        (FrameKind::Response, fc) if fc & EXCEPTION_FLAG != 0 => Some(RtuLength::Fixed(5)),
        // unit, fc, address, quantity/value, crc
        (FrameKind::Request, 0x01..=0x06) => Some(RtuLength::Fixed(8)),
        // unit, fc, address, quantity, byte count, data, crc
        (FrameKind::Request, 0x0F | 0x10) => Some(RtuLength::ByteCount(6)),
        // unit, fc, byte count, data, crc
        (FrameKind::Response, 0x01..=0x04) => Some(RtuLength::ByteCount(2)),
        // unit, fc, address, value/quantity, crc
        (FrameKind::Response, 0x05 | 0x06 | 0x0F | 0x10) => Some(RtuLength::Fixed(8)),
        _ => None,
    }
}

/// Modbus RTU transport implementation
pub struct RtuTransport<S> {
    stream: Option<S>,
    buffer: BytesMut,
    /// Minimum silence before each transmitted frame
    frame_gap: Option<Duration>,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl<S> RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an opened serial stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            buffer: BytesMut::with_capacity(MAX_RTU_FRAME_SIZE),
            frame_gap: None,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Enforce the 3.5 character inter-frame gap for the given baud rate
    ///
    /// Above 19200 baud the gap is fixed at 1.75 ms.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> ModbusResult<Self> {
        if baud_rate == 0 {
            return Err(ModbusError::configuration("Baud rate must be positive"));
        }
        let gap = if baud_rate > 19_200 {
            Duration::from_micros(1_750)
        } else {
            // 11 bits per character
            let char_time_us = 11_000_000 / baud_rate as u64;
            Duration::from_micros(char_time_us * 35 / 10)
        };
        self.frame_gap = Some(gap);
        Ok(self)
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Inter-frame gap in effect, if any
    pub fn frame_gap(&self) -> Option<Duration> {
        self.frame_gap
    }

    async fn read_frame(&mut self, kind: FrameKind) -> ModbusResult<Option<Frame>> {
        match self.try_read_frame(kind).await {
            Err(e) => {
                self.stats.errors += 1;
                Err(e)
            }
            ok => ok,
        }
    }

    async fn try_read_frame(&mut self, kind: FrameKind) -> ModbusResult<Option<Frame>> {
        if !fill_buffer(self.stream.as_mut(), &mut self.buffer, 2).await? {
            return Ok(None);
        }

        let function_code = self.buffer[1];
        let total = match rtu_length(kind, function_code) {
            Some(RtuLength::Fixed(len)) => len,
            Some(RtuLength::ByteCount(offset)) => {
                fill_buffer(self.stream.as_mut(), &mut self.buffer, offset + 1).await?;
                offset + 1 + self.buffer[offset] as usize + 2
            }
            None => {
                // Without a length rule there is no frame boundary to resync on
                self.buffer.clear();
                return Err(ModbusError::frame(format!(
                    "Cannot frame RTU {:?} with function code 0x{:02X}",
                    kind, function_code
                )));
            }
        };
        if total > MAX_RTU_FRAME_SIZE {
            self.buffer.clear();
            return Err(ModbusError::frame(format!("RTU frame of {} bytes too large", total)));
        }

        fill_buffer(self.stream.as_mut(), &mut self.buffer, total).await?;
        let adu = self.buffer.split_to(total);

        self.stats.frames_received += 1;
        self.stats.bytes_received += total as u64;
        if self.packet_logging {
            log_packet("receive", &adu, "RTU", Some(adu[0]));
        }

        let data_len = total - 2;
        let received = u16::from_le_bytes([adu[data_len], adu[data_len + 1]]);
        let calculated = crc16(&adu[..data_len]);
        if received != calculated {
            return Err(ModbusError::crc_mismatch(calculated, received));
        }

        Ok(Some(Frame::new(
            Header::new(adu[0]),
            function_code,
            adu[2..data_len].to_vec(),
        )))
    }
}

#[async_trait]
impl<S> ModbusTransport for RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn is_headless(&self) -> bool {
        true
    }

    async fn read_request(&mut self) -> ModbusResult<Option<Frame>> {
        self.read_frame(FrameKind::Request).await
    }

    async fn read_response(&mut self) -> ModbusResult<Option<Frame>> {
        self.read_frame(FrameKind::Response).await
    }

    async fn write_frame(&mut self, frame: &Frame) -> ModbusResult<()> {
        let mut adu = frame.to_headless_adu()?;
        let crc = crc16(&adu);
        adu.extend_from_slice(&crc.to_le_bytes());

        if let Some(gap) = self.frame_gap {
            tokio::time::sleep(gap).await;
        }
        if self.packet_logging {
            log_packet("send", &adu, "RTU", Some(frame.header.unit_id));
        }

        if let Err(e) = write_adu(self.stream.as_mut(), &adu).await {
            self.stats.errors += 1;
            return Err(e);
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += adu.len() as u64;
        Ok(())
    }

    async fn reset(&mut self) -> ModbusResult<()> {
        if self.stream.is_none() {
            return Err(ModbusError::connection("Transport is closed"));
        }
        self.buffer.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.buffer.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error shutting down RTU stream: {}", e);
            }
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
