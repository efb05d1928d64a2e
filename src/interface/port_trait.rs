//! Write-side abstraction over a serial link so the UART interface can be
//! tested without hardware

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Trait for serial port write operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;
}

/// Any tokio writer used as a serial port, typically the write half of a
/// split `tokio_serial::SerialStream`
pub struct TokioSerialPort<W> {
    writer: W,
}

impl<W> TokioSerialPort<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> SerialPortIO for TokioSerialPort<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_tokio_port_writes_through() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut port = TokioSerialPort::new(near);

        port.write_all(&[0xC0, 0x05, 0xC0]).await.unwrap();
        port.flush().await.unwrap();

        let mut buf = [0u8; 3];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xC0, 0x05, 0xC0]);
    }
}
