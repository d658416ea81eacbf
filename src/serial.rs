//! Serial port component
//!
//! Owns the device the JA-121T is attached to, either a real UART or the
//! in-process [`crate::simulator::Simulator`], behind the [`SerialLink`]
//! trait. A blocking worker keeps the link open, retries failed opens
//! every `wait_on_ready` seconds, pushes received lines into an unbounded
//! buffer channel, and drains queued outbound lines. Reopening after a
//! mid-session failure never drops lines that were already buffered.
//!
//! The wire format is ASCII, `\n`-terminated on write and tolerant of
//! `\r\n` on read; empty lines and undecodable input are skipped.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SerialConfig;

/// Pause between read attempts; doubles as the exit poll interval of the
/// blocking worker.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("Cannot open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("Serial I/O error: {0}")]
    Io(String),

    #[error("The line is not ASCII and cannot be written: {0}")]
    Encoding(String),

    #[error("The serial port is not available.")]
    NotReady,
}

/// Backend abstraction over the real UART and the simulator.
///
/// Implementations are driven from a single blocking worker thread, so
/// they do not need internal synchronisation for the link itself.
pub trait SerialLink: Send {
    fn open(&mut self) -> Result<(), SerialError>;
    fn close(&mut self);
    fn write_line(&mut self, line: &str) -> Result<(), SerialError>;
    /// Returns the next complete line, or `None` when the timeout expires
    /// without one.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, SerialError>;
    fn label(&self) -> String;
}

/// Real UART backend using the `serialport` crate.
pub struct UartLink {
    config: SerialConfig,
    port_path: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    pending: Vec<u8>,
}

impl UartLink {
    pub fn new(config: SerialConfig) -> Result<Self, SerialError> {
        let port_path = config.port.clone().ok_or(SerialError::NotReady)?;
        Ok(Self {
            config,
            port_path,
            port: None,
            pending: Vec::new(),
        })
    }

    fn data_bits(&self) -> serialport::DataBits {
        match self.config.bytesize {
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    fn parity(&self) -> serialport::Parity {
        match self.config.parity.as_str() {
            "E" | "e" => serialport::Parity::Even,
            "O" | "o" => serialport::Parity::Odd,
            _ => serialport::Parity::None,
        }
    }

    fn stop_bits(&self) -> serialport::StopBits {
        match self.config.stopbits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        }
    }

    fn flow_control(&self) -> serialport::FlowControl {
        if self.config.rtscts {
            serialport::FlowControl::Hardware
        } else if self.config.xonxoff {
            serialport::FlowControl::Software
        } else {
            serialport::FlowControl::None
        }
    }

    /// Extracts the next complete line from the pending byte buffer.
    fn take_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let trimmed: Vec<u8> = raw
                .into_iter()
                .filter(|&b| b != b'\n' && b != b'\r')
                .collect();
            if trimmed.is_empty() {
                continue;
            }
            match String::from_utf8(trimmed) {
                Ok(line) if line.is_ascii() => return Some(line),
                _ => {
                    error!("Dropping a line with undecodable bytes from the serial port.");
                    continue;
                }
            }
        }
        None
    }
}

impl SerialLink for UartLink {
    fn open(&mut self) -> Result<(), SerialError> {
        if !Path::new(&self.port_path).exists() {
            return Err(SerialError::Open {
                port: self.port_path.clone(),
                reason: "The port does not exist in the system. Is it connected?".to_string(),
            });
        }
        let port = serialport::new(&self.port_path, self.config.baudrate)
            .data_bits(self.data_bits())
            .parity(self.parity())
            .stop_bits(self.stop_bits())
            .flow_control(self.flow_control())
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| SerialError::Open {
                port: self.port_path.clone(),
                reason: e.to_string(),
            })?;
        self.port = Some(port);
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn write_line(&mut self, line: &str) -> Result<(), SerialError> {
        if !line.is_ascii() {
            return Err(SerialError::Encoding(line.to_string()));
        }
        let port = self.port.as_mut().ok_or(SerialError::NotReady)?;
        port.write_all(format!("{line}\n").as_bytes())
            .and_then(|_| port.flush())
            .map_err(|e| SerialError::Io(e.to_string()))
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, SerialError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        let port = self.port.as_mut().ok_or(SerialError::NotReady)?;
        let mut buf = [0u8; 256];
        match port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(self.take_line())
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(SerialError::Io(e.to_string())),
        }
    }

    fn label(&self) -> String {
        self.port_path.clone()
    }
}

/// Cloneable handle used by the bridge to reach the serial worker.
#[derive(Clone, Debug)]
pub struct SerialHandle {
    write_tx: mpsc::UnboundedSender<String>,
    ready: Arc<AtomicBool>,
    label: String,
}

impl SerialHandle {
    /// True iff the link is currently open.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Queues a single line for the worker; `\n` is appended on the wire.
    pub fn write_line(&self, line: &str) -> Result<(), SerialError> {
        if !line.is_ascii() {
            return Err(SerialError::Encoding(line.to_string()));
        }
        self.write_tx
            .send(line.to_string())
            .map_err(|_| SerialError::NotReady)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// The serial component: owns the link and the worker wiring.
pub struct Serial {
    link: Option<Box<dyn SerialLink>>,
    wait_on_ready: u64,
    handle: SerialHandle,
    write_rx: Option<mpsc::UnboundedReceiver<String>>,
    lines_tx: mpsc::UnboundedSender<String>,
    lines_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl Serial {
    pub fn new(link: Box<dyn SerialLink>, wait_on_ready: u64) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let handle = SerialHandle {
            write_tx,
            ready: Arc::new(AtomicBool::new(false)),
            label: link.label(),
        };
        info!("The serial connection configured, the port is {}", handle.label);
        Self {
            link: Some(link),
            wait_on_ready,
            handle,
            write_rx: Some(write_rx),
            lines_tx,
            lines_rx: Some(lines_rx),
        }
    }

    pub fn handle(&self) -> SerialHandle {
        self.handle.clone()
    }

    /// The unbounded FIFO of received lines; the bridge worker is its
    /// single consumer.
    pub fn take_lines(&mut self) -> mpsc::UnboundedReceiver<String> {
        self.lines_rx.take().expect("lines receiver already taken")
    }

    /// Spawns the blocking worker that owns the link.
    pub fn start(&mut self, exit: CancellationToken) -> JoinHandle<()> {
        let mut link = self.link.take().expect("serial worker already started");
        let mut write_rx = self.write_rx.take().expect("serial worker already started");
        let lines_tx = self.lines_tx.clone();
        let ready = self.handle.ready.clone();
        let wait_on_ready = self.wait_on_ready;

        tokio::task::spawn_blocking(move || {
            if !open_until_ready(link.as_mut(), &exit, wait_on_ready, &ready) {
                info!("Serial worker ended.");
                return;
            }
            while !exit.is_cancelled() {
                // queued writes first so a request precedes its response
                while let Ok(line) = write_rx.try_recv() {
                    debug!("Writing to serial: {}", line);
                    if let Err(e) = link.write_line(&line) {
                        error!("{}", e);
                    }
                }
                match link.read_line(READ_TIMEOUT) {
                    Ok(Some(line)) => {
                        debug!("Received data from serial: {}", line);
                        let _ = lines_tx.send(line);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("Error occurred while reading from the serial port. {}", e);
                        ready.store(false, Ordering::SeqCst);
                        link.close();
                        if !open_until_ready(link.as_mut(), &exit, wait_on_ready, &ready) {
                            break;
                        }
                    }
                }
            }
            ready.store(false, Ordering::SeqCst);
            link.close();
            info!("Serial worker ended.");
        })
    }
}

/// Open loop of the reopening policy: retry every `wait_on_ready` seconds
/// until the link opens or the exit signal is set. Returns false when the
/// exit signal won.
fn open_until_ready(
    link: &mut dyn SerialLink,
    exit: &CancellationToken,
    wait_on_ready: u64,
    ready: &AtomicBool,
) -> bool {
    info!("Opening serial port {}", link.label());
    while !exit.is_cancelled() {
        match link.open() {
            Ok(()) => {
                ready.store(true, Ordering::SeqCst);
                info!("The serial port {} is open.", link.label());
                return true;
            }
            Err(e) => {
                error!("{}", e);
                info!("Waiting {} seconds for the port to be ready...", wait_on_ready);
                let deadline = std::time::Instant::now() + Duration::from_secs(wait_on_ready);
                while std::time::Instant::now() < deadline {
                    if exit.is_cancelled() {
                        return false;
                    }
                    std::thread::sleep(READ_TIMEOUT);
                }
            }
        }
    }
    false
}

#[cfg(test)]
impl SerialHandle {
    /// Detached handle with a tap on the write queue, for bridge tests.
    pub(crate) fn test_handle(ready: bool) -> (SerialHandle, mpsc::UnboundedReceiver<String>) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        (
            SerialHandle {
                write_tx,
                ready: Arc::new(AtomicBool::new(ready)),
                label: "<test>".to_string(),
            },
            write_rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory link for worker tests: scripted inbound lines, recorded
    /// outbound writes.
    struct FakeLink {
        inbound: Arc<Mutex<VecDeque<String>>>,
        written: Arc<Mutex<Vec<String>>>,
        fail_opens: usize,
    }

    impl SerialLink for FakeLink {
        fn open(&mut self) -> Result<(), SerialError> {
            if self.fail_opens > 0 {
                self.fail_opens -= 1;
                return Err(SerialError::Open {
                    port: "fake".into(),
                    reason: "not yet".into(),
                });
            }
            Ok(())
        }

        fn close(&mut self) {}

        fn write_line(&mut self, line: &str) -> Result<(), SerialError> {
            self.written.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, SerialError> {
            let line = self.inbound.lock().unwrap().pop_front();
            if line.is_none() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(line)
        }

        fn label(&self) -> String {
            "fake".to_string()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_moves_lines_both_ways() {
        let inbound = Arc::new(Mutex::new(VecDeque::from([
            "STATE 1 READY".to_string(),
            "OK".to_string(),
        ])));
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut serial = Serial::new(
            Box::new(FakeLink {
                inbound: inbound.clone(),
                written: written.clone(),
                fail_opens: 0,
            }),
            1,
        );
        let handle = serial.handle();
        let mut lines = serial.take_lines();
        let exit = CancellationToken::new();
        let worker = serial.start(exit.clone());

        assert_eq!(lines.recv().await.as_deref(), Some("STATE 1 READY"));
        assert_eq!(lines.recv().await.as_deref(), Some("OK"));
        assert!(handle.is_ready());

        handle.write_line("1234 SET 1").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(written.lock().unwrap().as_slice(), ["1234 SET 1"]);

        exit.cancel();
        worker.await.unwrap();
        assert!(!handle.is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_ascii_writes_are_rejected_up_front() {
        let mut serial = Serial::new(
            Box::new(FakeLink {
                inbound: Arc::new(Mutex::new(VecDeque::new())),
                written: Arc::new(Mutex::new(Vec::new())),
                fail_opens: 0,
            }),
            1,
        );
        let handle = serial.handle();
        let exit = CancellationToken::new();
        let worker = serial.start(exit.clone());
        assert!(matches!(
            handle.write_line("příliš"),
            Err(SerialError::Encoding(_))
        ));
        exit.cancel();
        worker.await.unwrap();
    }
}
