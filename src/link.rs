//! The serial link to the robot.
//!
//! A single reader thread owns the reading side: it opens the port, splits
//! the byte stream into lines, classifies each one and pushes it down a
//! channel to the controller. When the port goes away it closes it and
//! keeps trying to reopen it, waiting a little longer after a repeated
//! failure, until the owner calls [`Link::stop`].
//!
//! Writing goes through [`LinkHandle`], which fails fast when there is no
//! port rather than waiting for the reader to reconnect. A burst of
//! commands holds the write lock for its whole duration so two senders can
//! never interleave their lines.

use crate::protocol::{classify, Command, DeviceLine};

use log::{debug, info, warn};
use serial2::SerialPort;
use std::{
    fmt, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Longest single nap while waiting to reconnect, so `stop()` is noticed
/// quickly.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Longest line the reader will buffer. Anything longer is noise, usually a
/// baud rate mismatch, and is thrown away up to the next newline.
pub const MAX_LINE_LEN: usize = 4096;

/// A byte pipe to the robot. Both methods take `&self` so the reader thread
/// and the writers can share one open port.
pub trait Port: Send + Sync {
    /// Reads whatever is available, blocking up to the port's read timeout.
    /// A timeout is reported as an `io::ErrorKind::TimedOut` error.
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `bytes`.
    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()>;
}

impl Port for SerialPort {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }
}

/// Knows how to (re)open a [`Port`].
pub trait Connector: Send + 'static {
    /// Opens a fresh port.
    fn connect(&self) -> Result<Arc<dyn Port>, LinkError>;

    /// Human readable name of the endpoint, for status messages.
    fn describe(&self) -> String;
}

/// Opens a real serial device with serial2.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: PathBuf,
    baud: u32,
    read_timeout: Duration,
}

impl SerialConnector {
    /// Instantiates a connector for the device at `path`.
    pub fn new(path: impl Into<PathBuf>, baud: u32, read_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud,
            read_timeout,
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> Result<Arc<dyn Port>, LinkError> {
        let mut port = SerialPort::open(&self.path, self.baud).map_err(LinkError::Open)?;
        port.set_read_timeout(self.read_timeout).map_err(LinkError::Open)?;
        Ok(Arc::new(port))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path.display(), self.baud)
    }
}

/// Lists serial devices we could connect to.
pub fn available_ports() -> io::Result<Vec<PathBuf>> {
    SerialPort::available_ports()
}

/// Timing and decoding knobs for the link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSettings {
    /// Number of telemetry columns to expect
    pub telemetry_arity: usize,
    /// Wait before reopening after a disconnect or a first failed open
    pub reconnect_backoff: Duration,
    /// Wait after a repeated failed open
    pub reconnect_backoff_repeat: Duration,
    /// Pause between the lines of one burst
    pub inter_write_pause: Duration,
}

/// Why a write did not make it out.
#[derive(Debug)]
pub enum LinkError {
    /// There is no open port right now
    NotConnected,
    /// The port failed mid-write; the link is now disconnected
    Write(io::Error),
    /// The port could not be opened
    Open(io::Error),
    /// Writing the rest of a burst would have run past its deadline
    DeadlinePassed {
        /// Lines of the burst that were never written
        unsent: usize,
    },
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::NotConnected => write!(f, "not connected"),
            LinkError::Write(error) => write!(f, "write failed: {}", error),
            LinkError::Open(error) => write!(f, "open failed: {}", error),
            LinkError::DeadlinePassed { unsent } => {
                write!(f, "deadline passed with {} lines unsent", unsent)
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// Anything commands can be sent through. The controller only ever talks to
/// the robot through this, which lets tests stand in a scripted robot.
pub trait CommandSink {
    /// True if a write has a chance of going through.
    fn is_connected(&self) -> bool;

    /// Sends `commands` back to back, holding the write path exclusively
    /// for the whole burst.
    fn send_burst(&self, commands: &[Command]) -> Result<(), LinkError>;

    /// Like [`CommandSink::send_burst`], but gives up on the rest of the
    /// burst instead of writing past `deadline`.
    fn send_burst_by(&self, commands: &[Command], _deadline: Instant) -> Result<(), LinkError> {
        self.send_burst(commands)
    }

    /// Sends a single command.
    fn send(&self, command: Command) -> Result<(), LinkError> {
        self.send_burst(std::slice::from_ref(&command))
    }
}

#[derive(Default)]
struct Shared {
    port: Mutex<Option<Arc<dyn Port>>>,
    write_path: Mutex<()>,
    stop: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn current(&self) -> Option<Arc<dyn Port>> {
        lock(&self.port).clone()
    }

    fn install(&self, port: Arc<dyn Port>) {
        *lock(&self.port) = Some(port);
    }

    /// Drops `port` from the slot, unless someone already replaced it.
    fn release(&self, port: &Arc<dyn Port>) {
        let mut slot = lock(&self.port);
        if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, port)) {
            *slot = None;
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn nap(&self, total: Duration) {
        let mut left = total;
        while !left.is_zero() && !self.stopped() {
            let step = left.min(STOP_POLL);
            thread::sleep(step);
            left -= step;
        }
    }
}

/// Owns the reader thread. Must be stopped explicitly.
pub struct Link {
    shared: Arc<Shared>,
    settings: LinkSettings,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    /// Spawns the reader thread, which connects straight away. Every line
    /// it classifies is sent to `lines`.
    pub fn start<C: Connector>(connector: C, settings: LinkSettings, lines: Sender<DeviceLine>) -> Self {
        let shared = Arc::new(Shared::default());
        let th_shared = Arc::clone(&shared);
        let reader = thread::spawn(move || read_loop(connector, th_shared, settings, lines));

        Self {
            shared,
            settings,
            reader: Some(reader),
        }
    }

    /// A cloneable write handle.
    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            shared: Arc::clone(&self.shared),
            pause: self.settings.inter_write_pause,
        }
    }

    /// Stops reconnecting, closes the port and joins the reader thread.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("link reader panicked");
            }
        }
        *lock(&self.shared.port) = None;
    }
}

/// The write side of a [`Link`].
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
    pause: Duration,
}

impl LinkHandle {
    /// Closes the current port. Writes fail fast until the reader thread
    /// has reopened it.
    pub fn disconnect(&self) {
        *lock(&self.shared.port) = None;
    }

    fn write_burst(&self, commands: &[Command], deadline: Option<Instant>) -> Result<(), LinkError> {
        let _burst = lock(&self.shared.write_path);
        let port = self.shared.current().ok_or(LinkError::NotConnected)?;

        for (i, command) in commands.iter().enumerate() {
            if i > 0 && !self.pause.is_zero() {
                if deadline.is_some_and(|d| Instant::now() + self.pause > d) {
                    return Err(LinkError::DeadlinePassed {
                        unsent: commands.len() - i,
                    });
                }
                spin_sleep::sleep(self.pause);
            }
            let line = format!("{}\n", command.wire());
            if let Err(error) = port.write_bytes(line.as_bytes()) {
                warn!("write of {:?} failed: {}", command.wire(), error);
                self.shared.release(&port);
                return Err(LinkError::Write(error));
            }
            debug!("sent: {}", command);
        }
        Ok(())
    }
}

impl CommandSink for LinkHandle {
    fn is_connected(&self) -> bool {
        lock(&self.shared.port).is_some()
    }

    fn send_burst(&self, commands: &[Command]) -> Result<(), LinkError> {
        self.write_burst(commands, None)
    }

    fn send_burst_by(&self, commands: &[Command], deadline: Instant) -> Result<(), LinkError> {
        self.write_burst(commands, Some(deadline))
    }
}

fn read_loop<C: Connector>(
    connector: C,
    shared: Arc<Shared>,
    settings: LinkSettings,
    lines: Sender<DeviceLine>,
) {
    let mut failures = 0u32;
    let mut buffer = [0u8; 256];
    let mut read_buf = Vec::new();
    let mut skipping = false;

    while !shared.stopped() {
        let port = match shared.current() {
            Some(port) => port,
            None => match connector.connect() {
                Ok(port) => {
                    info!("connected to {}", connector.describe());
                    failures = 0;
                    read_buf.clear();
                    skipping = false;
                    shared.install(Arc::clone(&port));
                    port
                }
                Err(error) => {
                    let wait = if failures == 0 {
                        settings.reconnect_backoff
                    } else {
                        settings.reconnect_backoff_repeat
                    };
                    failures += 1;
                    warn!(
                        "could not open {}: {}, retrying in {:?}",
                        connector.describe(),
                        error,
                        wait
                    );
                    shared.nap(wait);
                    continue;
                }
            },
        };

        match port.read_bytes(&mut buffer) {
            Ok(read_len) => {
                for &c in buffer.iter().take(read_len) {
                    if c != b'\n' {
                        if skipping {
                            continue;
                        }
                        if read_buf.len() >= MAX_LINE_LEN {
                            warn!("no line end in {} bytes, dropping the line", read_buf.len());
                            read_buf.clear();
                            skipping = true;
                            continue;
                        }
                        read_buf.push(c);
                        continue;
                    }
                    if skipping {
                        skipping = false;
                        continue;
                    }
                    // Garbage left in the robot's buffer at power-up is
                    // common, so bad bytes are replaced rather than fatal.
                    let text = String::from_utf8_lossy(&read_buf).into_owned();
                    read_buf.clear();
                    if !dispatch(&text, settings.telemetry_arity, &lines) {
                        info!("nobody is listening any more, link reader exits");
                        shared.stop.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(error) => {
                warn!("lost {}: {}", connector.describe(), error);
                shared.release(&port);
                drop(port);
                failures = 1;
                shared.nap(settings.reconnect_backoff);
            }
        }
    }

    *lock(&shared.port) = None;
    info!("link to {} closed", connector.describe());
}

/// Classifies one line and forwards it. Returns false once the receiving
/// end is gone.
fn dispatch(text: &str, arity: usize, lines: &Sender<DeviceLine>) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return true;
    }
    match classify(text, arity) {
        Ok(line) => lines.send(line).is_ok(),
        Err(error) => {
            warn!("dropping {:?}: {}", text, error);
            true
        }
    }
}
