//! Async serial port for the drive bus.
//!
//! The bus runs at 19,200 Bd, 8 data bits, no parity, one stop bit. The
//! port is opened non-blocking and driven through tokio's `AsyncFd`, with
//! the termios configuration applied through rustix. Splitting yields
//! independent reader and writer halves plus a control handle that can
//! issue line breaks and report byte counters; shared ownership of the
//! descriptor keeps all three usable concurrently.

use std::io;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::ready;
use rustix::fs::{open, Mode, OFlags};
use rustix::termios::{tcdrain, tcgetattr, tcsendbreak, tcsetattr, ControlModes, OptionalActions};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

/// Parity configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial port configuration.
#[derive(Debug, Clone, Copy)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 19_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Serial port error types.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("failed to open serial port: {0}")]
    Open(#[source] io::Error),

    #[error("configuration failed: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial port disconnected")]
    Disconnected,

    #[error("hardware error on serial port")]
    Hardware,
}

/// Byte counters for a port.
#[derive(Debug, Clone, Copy)]
pub struct SerialStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// An open serial port; split it to start talking.
pub struct SerialPort {
    inner: Arc<SerialInner>,
}

struct SerialInner {
    fd: AsyncFd<OwnedFd>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Reader half of a split port.
pub struct SerialReader {
    inner: Arc<SerialInner>,
}

/// Writer half of a split port.
pub struct SerialWriter {
    inner: Arc<SerialInner>,
}

/// Control handle of a split port: breaks and statistics.
pub struct SerialControl {
    inner: Arc<SerialInner>,
}

/// Applies raw-mode termios settings to a descriptor.
fn apply_serial_config<Fd: rustix::fd::AsFd>(
    fd: &Fd,
    config: &SerialConfig,
) -> Result<(), SerialError> {
    let mut termios = tcgetattr(fd)
        .map_err(|e| SerialError::Config(format!("failed to get termios: {}", e)))?;

    termios.make_raw();

    termios
        .set_speed(config.baud_rate)
        .map_err(|e| SerialError::Config(format!("failed to set baud rate: {}", e)))?;

    termios.control_modes &= !ControlModes::CSIZE;
    match config.data_bits {
        5 => termios.control_modes |= ControlModes::CS5,
        6 => termios.control_modes |= ControlModes::CS6,
        7 => termios.control_modes |= ControlModes::CS7,
        8 => termios.control_modes |= ControlModes::CS8,
        other => {
            return Err(SerialError::Config(format!("invalid data bits: {}", other)));
        }
    }

    match config.parity {
        Parity::None => {
            termios.control_modes &= !ControlModes::PARENB;
        }
        Parity::Odd => {
            termios.control_modes |= ControlModes::PARENB;
            termios.control_modes |= ControlModes::PARODD;
        }
        Parity::Even => {
            termios.control_modes |= ControlModes::PARENB;
            termios.control_modes &= !ControlModes::PARODD;
        }
    }

    match config.stop_bits {
        1 => termios.control_modes &= !ControlModes::CSTOPB,
        2 => termios.control_modes |= ControlModes::CSTOPB,
        other => {
            return Err(SerialError::Config(format!("invalid stop bits: {}", other)));
        }
    }

    tcsetattr(fd, OptionalActions::Now, &termios)
        .map_err(|e| SerialError::Config(format!("failed to apply termios: {}", e)))?;

    Ok(())
}

impl SerialPort {
    /// Opens and configures the device at `path`.
    pub fn open(path: &str, config: &SerialConfig) -> Result<Self, SerialError> {
        let fd = open(
            path,
            OFlags::RDWR | OFlags::NOCTTY | OFlags::NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| SerialError::Open(e.into()))?;

        apply_serial_config(&fd, config)?;

        Self::from_owned_fd(fd)
    }

    /// Wraps an already-open descriptor; used with pty pairs in tests.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<Self, SerialError> {
        use rustix::fs::{fcntl_getfl, fcntl_setfl};

        let flags = fcntl_getfl(&fd)
            .map_err(|e| SerialError::Config(format!("failed to get fd flags: {}", e)))?;
        fcntl_setfl(&fd, flags | OFlags::NONBLOCK)
            .map_err(|e| SerialError::Config(format!("failed to set fd flags: {}", e)))?;

        let fd = AsyncFd::new(fd).map_err(SerialError::Io)?;

        Ok(Self {
            inner: Arc::new(SerialInner {
                fd,
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
        })
    }

    /// Splits into reader, writer and control handles.
    pub fn split(self) -> (SerialReader, SerialWriter, SerialControl) {
        (
            SerialReader {
                inner: self.inner.clone(),
            },
            SerialWriter {
                inner: self.inner.clone(),
            },
            SerialControl { inner: self.inner },
        )
    }
}

impl AsyncRead for SerialReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.fd.poll_read_ready(cx))?;

            match guard.try_io(|fd| {
                let slice = buf.initialize_unfilled();
                match rustix::io::read(fd.get_ref(), slice) {
                    Ok(n) => {
                        buf.advance(n);
                        if n > 0 {
                            self.inner.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Ok(())
                    }
                    Err(rustix::io::Errno::AGAIN) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                    Err(rustix::io::Errno::IO) => Err(io::Error::other(SerialError::Hardware)),
                    Err(rustix::io::Errno::PIPE) => Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        SerialError::Disconnected,
                    )),
                    Err(e) => Err(e.into()),
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.fd.poll_write_ready(cx))?;

            match guard.try_io(|fd| match rustix::io::write(fd.get_ref(), buf) {
                Ok(n) => {
                    if n > 0 {
                        self.inner
                            .bytes_written
                            .fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Ok(n)
                }
                Err(rustix::io::Errno::AGAIN) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                Err(rustix::io::Errno::IO) => Err(io::Error::other(SerialError::Hardware)),
                Err(rustix::io::Errno::PIPE) => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    SerialError::Disconnected,
                )),
                Err(e) => Err(e.into()),
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The UART hands bytes to the driver on write; nothing to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl SerialControl {
    /// Asserts a BREAK condition on the line.
    ///
    /// A `duration_ms` of zero sends the driver's default break, between
    /// 250 ms and 500 ms on Linux. The bus master uses breaks to frame
    /// its cycles; we only need them for optional resynchronization.
    pub fn send_break(&self, duration_ms: u32) -> Result<(), SerialError> {
        trace!(duration_ms, "sending line break");
        tcsendbreak(self.inner.fd.get_ref())
            .map_err(|e| SerialError::Io(e.into()))
    }

    /// Current byte counters.
    pub fn stats(&self) -> SerialStats {
        SerialStats {
            bytes_read: self.inner.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SerialInner {
    fn drop(&mut self) {
        // Give pending output a chance to leave the UART.
        let _ = tcdrain(self.fd.get_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Virtual serial pair backed by a pty.
    fn virtual_pair() -> (SerialPort, SerialPort) {
        use nix::pty::openpty;

        let pty = openpty(None, None).unwrap();
        let master = SerialPort::from_owned_fd(pty.master).unwrap();
        let slave = SerialPort::from_owned_fd(pty.slave).unwrap();

        (master, slave)
    }

    #[tokio::test]
    async fn round_trips_bytes() {
        let (a, b) = virtual_pair();
        let (mut reader_b, _writer_b, _control_b) = b.split();
        let (_reader_a, mut writer_a, control_a) = a.split();

        writer_a.write_all(b"\x80\xf3\x29\x00\x10\x08").await.unwrap();

        let mut buf = [0u8; 6];
        reader_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x80\xf3\x29\x00\x10\x08");

        assert_eq!(control_a.stats().bytes_written, 6);
    }

    #[tokio::test]
    async fn counts_bytes_in_both_directions() {
        let (a, b) = virtual_pair();
        let (mut reader_a, mut writer_a, control_a) = a.split();
        let (mut reader_b, mut writer_b, _control_b) = b.split();

        writer_a.write_all(b"hello").await.unwrap();
        writer_b.write_all(b"world").await.unwrap();

        let mut buf = [0u8; 5];
        reader_a.read_exact(&mut buf).await.unwrap();
        reader_b.read_exact(&mut buf).await.unwrap();

        let stats = control_a.stats();
        assert_eq!(stats.bytes_written, 5);
        assert_eq!(stats.bytes_read, 5);
    }

    #[tokio::test]
    async fn send_break_succeeds_on_a_pty() {
        let (a, _b) = virtual_pair();
        let (_reader, _writer, control) = a.split();

        // A pty accepts the break silently; what matters is that the
        // call goes through the descriptor without blocking.
        control.send_break(0).unwrap();
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        use nix::pty::openpty;

        let pty = openpty(None, None).unwrap();
        let config = SerialConfig {
            data_bits: 9,
            ..SerialConfig::default()
        };
        let result = apply_serial_config(&pty.master, &config);
        assert!(matches!(result, Err(SerialError::Config(_))));

        let pty = openpty(None, None).unwrap();
        let config = SerialConfig {
            stop_bits: 3,
            ..SerialConfig::default()
        };
        let result = apply_serial_config(&pty.master, &config);
        assert!(matches!(result, Err(SerialError::Config(_))));
    }
}
