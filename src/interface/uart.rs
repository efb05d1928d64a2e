//! # UART Interface
//!
//! Serial link to a ground station radio or companion computer.
//!
//! This module handles:
//! - Opening the port 8N1 with no flow control
//! - Writing encoded frames under an async lock
//! - A receive task feeding the byte stream through a [`FrameReceiver`]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use super::port_trait::{SerialPortIO, TokioSerialPort};
use super::{Interface, InterfaceIndex};
use crate::comm::manager::CommManager;
use crate::comm::receiver::FrameReceiver;
use crate::error::{FlightLinkError, Result};

/// Default link speed
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Bytes requested from the port per read
const READ_CHUNK_SIZE: usize = 512;

/// Serial port opened by [`UartInterface::open`]
pub type SerialWriter = TokioSerialPort<WriteHalf<SerialStream>>;

/// UART transport
pub struct UartInterface<P: SerialPortIO> {
    port: Mutex<P>,
    device_path: String,
}

impl<P: SerialPortIO> std::fmt::Debug for UartInterface<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartInterface")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl UartInterface<SerialWriter> {
    /// Open a serial device
    ///
    /// # Arguments
    ///
    /// * `path` - Device path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Link speed
    ///
    /// # Returns
    ///
    /// * `Result<(UartInterface, ReadHalf)>` - Send side plus the read half to
    ///   hand to [`spawn_receiver`]
    ///
    /// # Errors
    ///
    /// Returns `Serial` if the device cannot be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use flightlink::interface::uart::{UartInterface, DEFAULT_BAUD_RATE};
    ///
    /// fn main() -> anyhow::Result<()> {
    ///     let (uart, _reader) = UartInterface::open("/dev/ttyUSB0", DEFAULT_BAUD_RATE)?;
    ///     println!("{}", uart.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(path: &str, baud_rate: u32) -> Result<(Self, ReadHalf<SerialStream>)> {
        let stream = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| FlightLinkError::Serial(format!("Failed to open {}: {}", path, e)))?;

        info!("Opened serial port {} at {} baud", path, baud_rate);

        let (reader, writer) = tokio::io::split(stream);
        Ok((Self::new(TokioSerialPort::new(writer), path), reader))
    }
}

impl<P: SerialPortIO> UartInterface<P> {
    /// Wrap an already opened port
    pub fn new(port: P, device_path: impl Into<String>) -> Self {
        Self {
            port: Mutex::new(port),
            device_path: device_path.into(),
        }
    }

    /// Device path this interface was opened on
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

#[async_trait]
impl<P: SerialPortIO> Interface for UartInterface<P> {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut port = self.port.lock().await;

        port.write_all(frame)
            .await
            .map_err(|e| FlightLinkError::Serial(format!("Write to {} failed: {}", self.device_path, e)))?;
        port.flush()
            .await
            .map_err(|e| FlightLinkError::Serial(format!("Flush of {} failed: {}", self.device_path, e)))?;

        debug!("Sent {} bytes on {}", frame.len(), self.device_path);
        Ok(())
    }
}

/// Spawn the receive task for a byte-stream interface
///
/// Reads until EOF or an I/O error, storing every valid packet in the
/// manager's queue tagged with `index`.
pub fn spawn_receiver<R>(mut reader: R, manager: Arc<CommManager>, index: InterfaceIndex) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut receiver = FrameReceiver::new();
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

        loop {
            buf.clear();
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    warn!("Interface {} closed", index);
                    break;
                }
                Ok(_) => {
                    receiver.feed(&buf, |packet| {
                        // Drops are logged and counted by the manager
                        let _ = manager.store_received_packet(index, packet);
                    });
                }
                Err(e) => {
                    error!("Read error on interface {}: {}", index, e);
                    break;
                }
            }
        }

        debug!("Interface {} receiver stopped: {:?}", index, receiver.stats());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::builder::build_frame;
    use crate::comm::protocol::PacketType;
    use crate::interface::port_trait::mocks::MockSerialPort;
    use std::io;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_send_writes_frame() {
        let mock = MockSerialPort::new();
        let uart = UartInterface::new(mock.clone(), "/dev/mock");

        uart.send(&[0xC0, 0x01, 0x02, 0xC0]).await.unwrap();
        uart.send(&[0xC0, 0x03, 0xC0]).await.unwrap();

        assert_eq!(
            mock.get_written_data(),
            vec![vec![0xC0, 0x01, 0x02, 0xC0], vec![0xC0, 0x03, 0xC0]]
        );
    }

    #[tokio::test]
    async fn test_send_maps_write_error() {
        let mock = MockSerialPort::new();
        mock.set_write_error(io::ErrorKind::BrokenPipe);
        let uart = UartInterface::new(mock, "/dev/mock");

        let result = uart.send(&[0xC0]).await;
        assert!(matches!(result, Err(FlightLinkError::Serial(_))));
    }

    #[tokio::test]
    async fn test_receiver_stores_valid_packets() {
        let (manager, mut consumer) = CommManager::init(1024, 2);
        let index = manager
            .add_interface("uart0", Arc::new(UartInterface::new(MockSerialPort::new(), "/dev/mock")))
            .unwrap();

        let (mut far, near) = tokio::io::duplex(256);
        let handle = spawn_receiver(near, Arc::clone(&manager), index);

        let mut wire = build_frame(PacketType::Telemetry, 3, &[0xAA, 0xBB]).unwrap();
        wire.extend_from_slice(&[0x00, 0xDB, 0x01]);
        wire.extend(build_frame(PacketType::Command, 4, &[0xC0]).unwrap());
        far.write_all(&wire).await.unwrap();
        drop(far);

        handle.await.unwrap();

        let queue = Arc::clone(consumer.queue());
        let mut packets = Vec::new();
        while let Some(handle) = consumer.pop_begin() {
            let info = queue.packet_info(handle).unwrap();
            let mut buf = vec![0u8; info.size];
            queue.read_payload(handle, &mut buf).unwrap();
            packets.push((info.interface, buf));
            consumer.pop_end();
        }

        assert_eq!(
            packets,
            vec![
                (index, vec![7, 0x01, 3, 0xAA, 0xBB]),
                (index, vec![6, 0x04, 4, 0xC0]),
            ]
        );
    }

    #[tokio::test]
    async fn test_receiver_reassembles_split_frame() {
        let (manager, mut consumer) = CommManager::init(1024, 1);
        let index = manager
            .add_interface("uart0", Arc::new(UartInterface::new(MockSerialPort::new(), "/dev/mock")))
            .unwrap();

        let frame = build_frame(PacketType::Configuration, 9, &[1, 2, 3, 4, 5]).unwrap();
        let (head, tail) = frame.split_at(4);
        let reader = tokio_test::io::Builder::new().read(head).read(tail).build();

        spawn_receiver(reader, Arc::clone(&manager), index).await.unwrap();

        let handle = consumer.pop_begin().expect("packet stored");
        let info = manager.queue().packet_info(handle).unwrap();
        assert_eq!(info.size, 8);
        assert_eq!(manager.stats().dropped_inbound, 0);
    }

    #[tokio::test]
    #[ignore] // Requires a serial device
    async fn test_open_real_port() {
        let (uart, _reader) = UartInterface::open("/dev/ttyUSB0", DEFAULT_BAUD_RATE).unwrap();
        assert_eq!(uart.device_path(), "/dev/ttyUSB0");
    }
}
