//! Soft-real-time host backend speaking a line-oriented text protocol
//!
//! Every command is one text line. The server answers `OK`, `READY`, a value
//! line, `ERROR <reason>`, or a `MATRIX <rows> <cols>` header that is followed
//! by a binary block once the client answers `READY`. Binary uploads use the
//! reverse handshake: the client sends the command, waits for `READY`, writes
//! the block and waits for `OK`.
//!
//! A background thread frames replies with [`ReplyParser`] and hands them over
//! an mpsc channel, so a command never blocks longer than the reply timeout.

pub mod codec;
pub mod routing;

pub use codec::{Reply, ReplyParser};
pub use routing::{default_routes, encode_routes, OutputRoute};

use super::transport::{ReadSink, ReaderThread, Transport};
use super::StateMachineClient;
use crate::config::SocketConfig;
use crate::matrix::{OutputPattern, StateMatrix, WireTable};
use crate::types::{ClientError, Event, MatrixError, Result};
use std::io;
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};

/// Columns of a `GET EVENTS` reply
const EVENT_COLUMNS: usize = 4;

/// Frames bytes from the reader thread into replies
struct ReplyPump {
    parser: ReplyParser,
    tx: Sender<Reply>,
}

impl ReadSink for ReplyPump {
    fn feed(&mut self, bytes: &[u8]) {
        for reply in self.parser.push(bytes) {
            log::trace!("socket <- {:?}", reply);
            if self.tx.send(reply).is_err() {
                return;
            }
        }
    }
}

/// Client for a state machine hosted by a soft-real-time server
pub struct SocketTextClient {
    config: SocketConfig,
    transport: Option<Box<dyn Transport>>,
    replies: Option<Receiver<Reply>>,
    reader: Option<ReaderThread>,
    /// Last uploaded matrix, patched by `set_state_outputs`
    matrix: Option<StateMatrix>,
    events_fetched: usize,
    bypass_mask: u32,
    version: Option<String>,
    /// Reported when a GET TIME reply is late
    last_time: f64,
}

impl SocketTextClient {
    /// Client that opens a TCP connection to `config.address` on `connect()`
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            transport: None,
            replies: None,
            reader: None,
            matrix: None,
            events_fetched: 0,
            bypass_mask: 0,
            version: None,
            last_time: 0.0,
        }
    }

    /// Client over an already established transport
    pub fn with_transport(config: SocketConfig, transport: Box<dyn Transport>) -> Self {
        let mut client = Self::new(config);
        client.transport = Some(transport);
        client
    }

    /// Server version reported during `connect()`
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Number of events already fetched from the server this session
    pub fn events_fetched(&self) -> usize {
        self.events_fetched
    }

    /// Total number of events the server has recorded
    pub fn get_event_counter(&mut self) -> Result<usize> {
        let value = self.query_value("GET EVENT COUNTER")?;
        value
            .parse()
            .map_err(|_| ClientError::Protocol(format!("malformed event counter '{}'", value)))
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(ClientError::NotConnected)?;
        transport.write_all(bytes)?;
        transport.flush()?;
        Ok(())
    }

    fn send_line(&mut self, command: &str) -> Result<()> {
        if self.replies.is_none() {
            return Err(ClientError::NotConnected);
        }
        self.discard_stale();
        log::trace!("socket -> {}", command);
        self.send_bytes(format!("{}\n", command).as_bytes())
    }

    fn discard_stale(&self) {
        if let Some(replies) = &self.replies {
            while let Ok(reply) = replies.try_recv() {
                log::debug!("Discarding stale reply {:?}", reply);
            }
        }
    }

    fn next_reply(&self, command: &str) -> Result<Reply> {
        let replies = self.replies.as_ref().ok_or(ClientError::NotConnected)?;
        match replies.recv_timeout(self.config.reply_timeout()) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::NoReply(command.to_string())),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ))),
        }
    }

    fn next_line(&self, command: &str) -> Result<String> {
        match self.next_reply(command)? {
            Reply::Line(line) if line.starts_with("ERROR") => Err(ClientError::Controller(line)),
            Reply::Line(line) => Ok(line),
            other => Err(ClientError::Protocol(format!(
                "expected a text reply to '{}', got {:?}",
                command, other
            ))),
        }
    }

    fn expect_line(&self, command: &str, expected: &str) -> Result<()> {
        let received = self.next_line(command)?;
        if received.trim() == expected {
            Ok(())
        } else {
            Err(ClientError::AckMismatch {
                command: command.to_string(),
                expected: expected.to_string(),
                received,
            })
        }
    }

    fn command(&mut self, command: &str) -> Result<()> {
        self.send_line(command)?;
        self.expect_line(command, "OK")
    }

    /// Command answered by one value line and `OK`
    fn query_value(&mut self, command: &str) -> Result<String> {
        self.send_line(command)?;
        let value = self.next_line(command)?;
        self.expect_line(command, "OK")?;
        Ok(value.trim().to_string())
    }

    /// Binary upload with the READY handshake
    fn upload(&mut self, command: &str, values: &[f64]) -> Result<()> {
        self.send_line(command)?;
        self.expect_line(command, "READY")?;
        self.send_bytes(&codec::pack_f64(values))?;
        self.expect_line(command, "OK")
    }

    /// Binary download announced by a MATRIX header
    fn fetch_matrix(&mut self, command: &str) -> Result<WireTable> {
        self.send_line(command)?;
        let (rows, cols) = match self.next_reply(command)? {
            Reply::MatrixHeader { rows, cols } => (rows, cols),
            Reply::Line(line) if line.starts_with("ERROR") => return Err(ClientError::Controller(line)),
            other => {
                return Err(ClientError::AckMismatch {
                    command: command.to_string(),
                    expected: "MATRIX".to_string(),
                    received: format!("{:?}", other),
                })
            }
        };
        self.send_bytes(b"READY\n")?;
        let values = match self.next_reply(command)? {
            Reply::Payload(values) => values,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected a {}x{} payload for '{}', got {:?}",
                    rows, cols, command, other
                )))
            }
        };
        self.expect_line(command, "OK")?;
        Ok(WireTable::from_column_major(rows, cols, &values)?)
    }

    /// Wire table plus the input-routing row and one row per schedule wave
    fn matrix_payload(&self, matrix: &StateMatrix) -> Result<WireTable> {
        let mut table = matrix.wire_table();
        let cols = table.cols();

        let mut routing = vec![0.0; cols];
        for line in 0..matrix.n_inputs() {
            routing[2 * line] = (line + 1) as f64;
            routing[2 * line + 1] = -((line + 1) as f64);
        }
        table.push_row(&routing)?;

        for wave in matrix.schedule_waves() {
            table.push_row(&wave.to_row(cols)?)?;
        }
        Ok(table)
    }

    fn output_routes(&self, matrix: &StateMatrix) -> Result<Vec<OutputRoute>> {
        let routes = self
            .config
            .output_routes
            .clone()
            .unwrap_or_else(|| default_routes(matrix.n_outputs()));
        if routes.len() != matrix.output_columns() {
            return Err(MatrixError::Shape {
                expected: matrix.output_columns(),
                found: routes.len(),
            }
            .into());
        }
        for route in &routes {
            route.validate()?;
        }
        Ok(routes)
    }

    fn upload_matrix(&mut self, matrix: &StateMatrix) -> Result<()> {
        matrix.validate()?;
        self.config.sizes.check_matrix(matrix)?;
        let routes = self.output_routes(matrix)?;
        let table = self.matrix_payload(matrix)?;
        let command = format!(
            "SET STATE MATRIX {} {} {} {} {} {} 0 0 0 {} {}",
            table.rows(),
            table.cols(),
            matrix.n_inputs(),
            matrix.schedule_waves().len(),
            self.config.input_type.wire_code(),
            matrix.ready_state(),
            encode_routes(&routes),
            u8::from(self.config.pending_swap),
        );
        self.upload(&command, &table.column_major())?;
        log::debug!(
            "Uploaded {} x {} matrix ({} states, {} schedule waves)",
            table.rows(),
            table.cols(),
            matrix.n_states(),
            matrix.schedule_waves().len()
        );
        Ok(())
    }

    fn cached_matrix(&self) -> Result<&StateMatrix> {
        self.matrix
            .as_ref()
            .ok_or_else(|| ClientError::Protocol("no state matrix uploaded".to_string()))
    }
}

impl StateMachineClient for SocketTextClient {
    fn backend_name(&self) -> &'static str {
        "socket"
    }

    fn connect(&mut self) -> Result<()> {
        if self.transport.is_none() {
            log::info!("Connecting to FSM server at {}", self.config.address);
            let stream = TcpStream::connect(&self.config.address)?;
            stream.set_nodelay(true)?;
            self.transport = Some(Box::new(stream));
        }
        if self.reader.is_none() {
            let transport = self.transport.as_ref().ok_or(ClientError::NotConnected)?;
            let reader = transport.reader(self.config.read_timeout())?;
            let (tx, rx) = mpsc::channel();
            let pump = ReplyPump {
                parser: ReplyParser::new(),
                tx,
            };
            self.reader = Some(ReaderThread::spawn("socket-reader", reader, pump)?);
            self.replies = Some(rx);
        }

        let version = self.query_value("VERSION")?;
        log::info!("FSM server version {}", version);
        self.version = Some(version);
        self.command(&format!("SET STATE MACHINE {}", self.config.machine_id))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.shutdown() {
                log::debug!("Transport shutdown failed: {}", e);
            }
        }
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        self.replies = None;
        self.transport = None;
        log::info!("Closed connection to {}", self.config.address);
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        self.command("INITIALIZE")?;
        self.events_fetched = 0;
        self.bypass_mask = 0;
        log::info!("Initialized state machine {}", self.config.machine_id);
        Ok(())
    }

    fn set_state_matrix(&mut self, matrix: &StateMatrix) -> Result<()> {
        self.upload_matrix(matrix)?;
        self.matrix = Some(matrix.clone());
        self.set_state_timers(&matrix.timers())?;
        if matrix.n_extra_timers() > 0 {
            let durations: Vec<f64> = matrix.extra_timers().iter().map(|t| t.duration).collect();
            self.set_extra_timers(&durations)?;
            self.set_extra_triggers(&matrix.extra_triggers())?;
        }
        Ok(())
    }

    fn set_state_outputs(&mut self, outputs: &[OutputPattern]) -> Result<()> {
        let mut patched = self.cached_matrix()?.clone();
        patched.replace_outputs(outputs)?;
        self.upload_matrix(&patched)?;
        self.matrix = Some(patched);
        Ok(())
    }

    fn set_state_timers(&mut self, timers: &[f64]) -> Result<()> {
        let mut patched = self.cached_matrix()?.clone();
        patched.replace_timers(timers)?;
        self.upload(&format!("SET STATE TIMERS {}", timers.len()), timers)?;
        self.matrix = Some(patched);
        Ok(())
    }

    fn set_extra_timers(&mut self, durations: &[f64]) -> Result<()> {
        self.upload(&format!("SET EXTRA TIMERS {}", durations.len()), durations)
    }

    fn set_extra_triggers(&mut self, triggers: &[Option<usize>]) -> Result<()> {
        let values: Vec<f64> = triggers
            .iter()
            .map(|t| t.map_or(-1.0, |state| state as f64))
            .collect();
        self.upload(&format!("SET EXTRA TRIGGERS {}", values.len()), &values)
    }

    fn run(&mut self) -> Result<()> {
        self.command("RUN")?;
        log::info!("State machine {} running", self.config.machine_id);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.command("HALT")?;
        log::info!("State machine {} halted", self.config.machine_id);
        Ok(())
    }

    fn force_state(&mut self, state: usize) -> Result<()> {
        self.command(&format!("FORCE STATE {}", state))
    }

    fn force_output(&mut self, line: usize, value: bool) -> Result<()> {
        if line >= u32::BITS as usize {
            return Err(ClientError::Protocol(format!("output line {} out of range", line)));
        }
        let mask = if value {
            self.bypass_mask | (1 << line)
        } else {
            self.bypass_mask & !(1 << line)
        };
        self.command(&format!("BYPASS DOUT {}", mask))?;
        self.bypass_mask = mask;
        Ok(())
    }

    fn get_time(&mut self) -> Result<f64> {
        let value = match self.query_value("GET TIME") {
            Ok(value) => value,
            Err(ClientError::NoReply(_)) => {
                log::warn!("No reply to GET TIME; reusing {:.3}s", self.last_time);
                return Ok(self.last_time);
            }
            Err(e) => return Err(e),
        };
        self.last_time = value
            .parse()
            .map_err(|_| ClientError::Protocol(format!("malformed time '{}'", value)))?;
        Ok(self.last_time)
    }

    fn get_events(&mut self) -> Result<Vec<Event>> {
        let counter = match self.get_event_counter() {
            Ok(counter) => counter,
            Err(ClientError::NoReply(command)) => {
                log::warn!("No reply to {}; polling again later", command);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        if counter <= self.events_fetched {
            return Ok(Vec::new());
        }

        // A late range is asked for again; its leftovers are dropped as stale replies
        let command = format!("GET EVENTS {} {}", self.events_fetched, counter - 1);
        let table = match self.fetch_matrix(&command) {
            Ok(table) => table,
            Err(ClientError::NoReply(_)) => {
                log::warn!("No reply to '{}'; polling again later", command);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        if table.rows() > 0 && table.cols() < EVENT_COLUMNS {
            return Err(MatrixError::Shape {
                expected: EVENT_COLUMNS,
                found: table.cols(),
            }
            .into());
        }

        // Columns: previous state, event code, timestamp, next state
        let events: Vec<Event> = (0..table.rows())
            .map(|r| Event::new(table.get(r, 2), table.get(r, 1) as i32, table.get(r, 3) as usize))
            .collect();
        self.events_fetched += events.len();
        log::debug!("Fetched {} events ({} total)", events.len(), self.events_fetched);
        Ok(events)
    }

    fn get_current_state(&mut self) -> Result<usize> {
        let value = self.query_value("GET CURRENT STATE")?;
        value
            .parse()
            .map_err(|_| ClientError::Protocol(format!("malformed state '{}'", value)))
    }
}

impl Drop for SocketTextClient {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            let _ = transport.shutdown();
        }
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
    }
}
