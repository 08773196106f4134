//! Byte transports and the background reader shared by the wire backends
//!
//! A wire backend writes commands synchronously (fire-and-forget) and never
//! blocks its caller on a read. Instead a background thread owns an independent
//! read half of the transport, reads with a bounded timeout and hands whatever
//! it received to a [`ReadSink`]. The client then drains the sink's queue with
//! its own bounded timeouts.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A duplex byte stream to a controller
pub trait Transport: Write + Send {
    /// Independent read half whose reads give up after `timeout`
    fn reader(&self, timeout: Duration) -> io::Result<Box<dyn Read + Send>>;

    /// Tear the link down so a blocked reader wakes up
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn reader(&self, timeout: Duration) -> io::Result<Box<dyn Read + Send>> {
        let reader = self.try_clone()?;
        reader.set_read_timeout(Some(timeout))?;
        Ok(Box::new(reader))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match TcpStream::shutdown(self, std::net::Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(feature = "serial-port")]
impl Transport for Box<dyn serialport::SerialPort> {
    fn reader(&self, timeout: Duration) -> io::Result<Box<dyn Read + Send>> {
        let mut reader = self.try_clone().map_err(io::Error::from)?;
        reader.set_timeout(timeout).map_err(io::Error::from)?;
        Ok(Box::new(reader))
    }
}

/// Open a serial device as a transport
#[cfg(feature = "serial-port")]
pub fn open_serial(path: &str, baud_rate: u32, timeout: Duration) -> io::Result<Box<dyn Transport>> {
    log::info!("Opening serial port {} at {} baud", path, baud_rate);
    let port = serialport::new(path, baud_rate)
        .timeout(timeout)
        .open()
        .map_err(io::Error::from)?;
    Ok(Box::new(port))
}

/// Receiver of the bytes read by a [`ReaderThread`]
pub(crate) trait ReadSink: Send + 'static {
    fn feed(&mut self, bytes: &[u8]);

    /// The stream ended or failed; no more bytes will arrive
    fn closed(&mut self) {}
}

/// Background thread that pumps a transport's read half into a sink
pub(crate) struct ReaderThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderThread {
    pub(crate) fn spawn<S: ReadSink>(name: &str, mut reader: Box<dyn Read + Send>, mut sink: S) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
            let mut buf = [0u8; 4096];
            while !stop_flag.load(Ordering::Acquire) {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        log::debug!("{}: stream closed by peer", thread_name);
                        break;
                    }
                    Ok(n) => {
                        log::trace!("{}: read {} bytes", thread_name, n);
                        sink.feed(&buf[..n]);
                    }
                    Err(e) if is_timeout(&e) => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if !stop_flag.load(Ordering::Acquire) {
                            log::warn!("{}: read failed: {}", thread_name, e);
                        }
                        break;
                    }
                }
            }
            sink.closed();
        })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to finish and wait for it (at most one read timeout)
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Reader thread panicked");
            }
        }
    }
}

impl Drop for ReaderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

#[derive(Default)]
struct QueueState {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// Thread-safe byte queue filled by the reader thread
#[derive(Default)]
pub(crate) struct ByteQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl ByteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.bytes.extend(bytes);
        self.ready.notify_all();
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    pub(crate) fn reopen(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        state.bytes.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Drop everything currently queued, returning how many bytes were dropped
    pub(crate) fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.bytes.len();
        state.bytes.clear();
        n
    }

    /// Wait until `n` bytes are queued and take them; None on timeout
    pub(crate) fn take(&self, n: usize, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.bytes.len() < n {
            if state.closed || self.ready.wait_until(&mut state, deadline).timed_out() {
                if state.bytes.len() >= n {
                    break;
                }
                return None;
            }
        }
        Some(state.bytes.drain(..n).collect())
    }

    /// Take a single byte; None on timeout
    pub(crate) fn pop(&self, timeout: Duration) -> Option<u8> {
        self.take(1, timeout).map(|b| b[0])
    }

    /// Take one newline-terminated line (terminator stripped); None on timeout
    pub(crate) fn read_line(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(pos) = state.bytes.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = state.bytes.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..pos]);
                return Some(text.trim_end_matches('\r').to_string());
            }
            if state.closed || self.ready.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }
}

impl ReadSink for Arc<ByteQueue> {
    fn feed(&mut self, bytes: &[u8]) {
        self.push(bytes);
    }

    fn closed(&mut self) {
        self.close();
    }
}
