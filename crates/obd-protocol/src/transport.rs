//! Adapter Transport Session
//!
//! Owns the serial link for the life of one connection. A background worker
//! thread polls the port, writing queued commands and framing replies into
//! [`InboundEvent`]s. Callers only ever touch the two queues.

use crate::error::ObdError;
use crate::event::InboundEvent;
use crate::frame::{FrameError, FrameReader, DEFAULT_FRAME_LIMIT};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_serial::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, error, info, warn};

/// Line terminator appended to every command
pub const COMMAND_TERMINATOR: &str = "\r";

/// Serial link settings, fixed for the life of a session
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub device: String,
    /// Baud rate (ELM327 default: 38400)
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// I/O timeout handed to the OS port
    pub open_timeout: Duration,
    /// Wait after opening before the adapter is used
    pub settle_delay: Duration,
    /// Sleep between worker loop iterations
    pub poll_interval: Duration,
    /// Maximum bytes buffered without a delimiter
    pub frame_limit: usize,
}

impl SerialConfig {
    /// Default settings for a device and baud rate
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            ..Default::default()
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            open_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            frame_limit: DEFAULT_FRAME_LIMIT,
        }
    }
}

/// Byte-level access to an adapter
///
/// Implemented for native serial ports; the `mock` feature adds an
/// in-memory ELM327.
pub trait AdapterPort: Send + 'static {
    /// Write the whole buffer
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Number of bytes that can be read without blocking
    fn bytes_available(&mut self) -> io::Result<usize>;
    /// Read into `buf`, returning the number of bytes read
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Discard anything buffered in either direction
    fn clear(&mut self) -> io::Result<()>;
}

impl AdapterPort for Box<dyn SerialPort> {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(self, data)?;
        self.flush()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn clear(&mut self) -> io::Result<()> {
        SerialPort::clear(&**self, ClearBuffer::All)?;
        Ok(())
    }
}

/// Connection lifecycle
///
/// `Session::open` finishes configuring and settling the port before a
/// handle exists, so callers only see `Opening` briefly: from
/// `Session::spawn` until the worker thread starts its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Closed = 0,
    /// Worker spawned but not yet polling
    Opening = 1,
    /// Worker polling; commands are accepted
    Open = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Opening,
            2 => SessionState::Open,
            _ => SessionState::Closed,
        }
    }
}

/// Handle to one open adapter connection
///
/// Dropping the handle cancels the worker.
pub struct Session {
    device: String,
    commands: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<InboundEvent>,
    cancel: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Open a serial device and start the worker
    ///
    /// Applies the port settings, clears stale buffered bytes and waits the
    /// settle delay before the first command can be written. There is no
    /// retry; a failure is returned as [`ObdError::Open`].
    pub async fn open(config: SerialConfig) -> Result<Self, ObdError> {
        info!("Opening {} @ {} baud", config.device, config.baud_rate);

        let port = tokio_serial::new(config.device.as_str(), config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .flow_control(config.flow_control)
            .timeout(config.open_timeout)
            .open()
            .map_err(|e| {
                error!("Failed to open {}: {}", config.device, e);
                ObdError::Open {
                    device: config.device.clone(),
                    message: e.to_string(),
                }
            })?;

        Self::start(port, config).await
    }

    /// Clear and settle an already-open port, then start the worker
    pub async fn start<P: AdapterPort>(mut port: P, config: SerialConfig) -> Result<Self, ObdError> {
        port.clear().map_err(|e| ObdError::Open {
            device: config.device.clone(),
            message: e.to_string(),
        })?;

        if !config.settle_delay.is_zero() {
            debug!("Waiting {:?} for adapter to settle", config.settle_delay);
            tokio::time::sleep(config.settle_delay).await;
        }

        Ok(Self::spawn(port, config))
    }

    /// Start the worker on a port immediately
    pub fn spawn<P: AdapterPort>(port: P, config: SerialConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(SessionState::Opening as u8));

        let device = config.device.clone();
        let worker = Worker {
            port,
            reader: FrameReader::with_limit(config.frame_limit),
            config,
            commands: command_rx,
            events: event_tx,
            cancel: cancel.clone(),
            state: state.clone(),
        };
        let handle = std::thread::spawn(move || worker.run());

        Self {
            device,
            commands: command_tx,
            events: event_rx,
            cancel,
            state,
            worker: Some(handle),
        }
    }

    /// Device this session was opened on
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the worker is running and not cancelled
    pub fn is_open(&self) -> bool {
        !self.cancel.load(Ordering::SeqCst) && self.state() != SessionState::Closed
    }

    /// Queue a command; the terminator is appended by the worker
    pub fn send(&self, command: impl Into<String>) -> Result<(), ObdError> {
        self.commands
            .send(command.into())
            .map_err(|_| ObdError::SessionClosed(format!("worker for {} has stopped", self.device)))
    }

    /// Next event without waiting
    pub fn try_next_event(&mut self) -> Option<InboundEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event; `None` once the terminal event was consumed
    pub async fn next_event(&mut self) -> Option<InboundEvent> {
        self.events.recv().await
    }

    /// Ask the worker to stop
    ///
    /// The worker notices within one poll interval, closes the port and
    /// emits exactly one [`InboundEvent::Closed`].
    pub fn close(&self) {
        debug!("Closing session on {}", self.device);
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Close and wait for the worker to finish
    ///
    /// Returns the events still queued, ending with the terminal event.
    pub async fn shutdown(mut self) -> Vec<InboundEvent> {
        self.close();

        let mut remaining = Vec::new();
        while let Some(event) = self.events.recv().await {
            remaining.push(event);
        }

        if let Some(handle) = self.worker.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Session worker for {} did not exit cleanly", self.device);
            }
        }

        remaining
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

struct Worker<P> {
    port: P,
    reader: FrameReader,
    config: SerialConfig,
    commands: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<InboundEvent>,
    cancel: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl<P: AdapterPort> Worker<P> {
    fn run(mut self) {
        self.state.store(SessionState::Open as u8, Ordering::SeqCst);
        info!("Session open on {}", self.config.device);
        self.emit(InboundEvent::Info(format!(
            "Connected to {} @ {} baud",
            self.config.device, self.config.baud_rate
        )));

        let reason = loop {
            if self.cancel.load(Ordering::SeqCst) {
                break "Serial connection closed".to_string();
            }

            match self.commands.try_recv() {
                Ok(command) => self.write_command(command),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break "Session handle dropped".to_string(),
            }

            if let Err(overflow) = self.read_frames() {
                error!("{} on {}", overflow, self.config.device);
                self.emit(InboundEvent::Error(overflow.to_string()));
                break overflow.to_string();
            }

            std::thread::sleep(self.config.poll_interval);
        };

        let Worker {
            port,
            commands,
            events,
            state,
            config,
            ..
        } = self;
        drop(commands);
        drop(port);
        state.store(SessionState::Closed as u8, Ordering::SeqCst);
        info!("Session on {} closed: {}", config.device, reason);
        let _ = events.send(InboundEvent::Closed(reason));
    }

    fn write_command(&mut self, command: String) {
        let line = format!("{}{}", command, COMMAND_TERMINATOR);
        match self.port.write_all(line.as_bytes()) {
            Ok(()) => {
                debug!("Sent >>> {}", command);
                self.emit(InboundEvent::Sent(command));
            }
            Err(e) => {
                warn!("Write of {} failed: {}", command, e);
                self.emit(InboundEvent::Error(format!("Write failed: {}", e)));
            }
        }
    }

    /// Read everything available and emit completed frames
    ///
    /// Only a framing overflow is returned; read faults become events.
    fn read_frames(&mut self) -> Result<(), ObdError> {
        let bytes = match read_available(&mut self.port) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Read failed on {}: {}", self.config.device, e);
                self.emit(InboundEvent::Error(format!("Read failed: {}", e)));
                return Ok(());
            }
        };
        if bytes.is_empty() {
            return Ok(());
        }

        match self.reader.feed(&bytes) {
            Ok(frames) => {
                self.emit_frames(frames);
                Ok(())
            }
            Err(FrameError::Overflow { limit, frames }) => {
                self.emit_frames(frames);
                Err(FrameError::Overflow {
                    limit,
                    frames: Vec::new(),
                }
                .into())
            }
        }
    }

    fn emit_frames(&self, frames: Vec<String>) {
        for frame in frames {
            debug!("Response <<< {}", frame);
            self.emit(InboundEvent::Data(frame));
        }
    }

    fn emit(&self, event: InboundEvent) {
        // Receiver gone means the handle was dropped; cancellation follows
        let _ = self.events.send(event);
    }
}

fn read_available<P: AdapterPort>(port: &mut P) -> io::Result<Vec<u8>> {
    let available = port.bytes_available()?;
    if available == 0 {
        return Ok(Vec::new());
    }

    let mut buffer = vec![0u8; available];
    let read = port.read(&mut buffer)?;
    buffer.truncate(read);
    Ok(buffer)
}
