//! Microcontroller backend speaking single-byte opcodes
//!
//! Commands are an opcode byte optionally followed by a binary payload. Timers
//! travel as little-endian `u32` milliseconds and the matrix as one byte per
//! cell. Configuration commands are acknowledged with [`opcode::OK`]; the board
//! firmware does not always answer, so silence until the read timeout is also
//! taken as success.

use super::transport::{ByteQueue, ReaderThread, Transport};
use super::StateMachineClient;
use crate::config::SerialConfig;
use crate::matrix::{OutputPattern, StateMatrix};
use crate::types::{ClientError, Event, MatrixError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::sync::Arc;
use std::time::Duration;

/// Opcode byte values
pub mod opcode {
    pub const CONNECT: u8 = 0x64;
    pub const OK: u8 = 0xAA;
    pub const GET_VERSION: u8 = 0x03;
    pub const SET_SIZES: u8 = 0x04;
    pub const GET_TIME: u8 = 0x05;
    pub const GET_INPUTS: u8 = 0x0E;
    pub const FORCE_OUTPUT: u8 = 0x0F;
    pub const SET_STATE_MATRIX: u8 = 0x10;
    pub const RUN: u8 = 0x11;
    pub const STOP: u8 = 0x12;
    pub const GET_EVENTS: u8 = 0x13;
    pub const GET_CURRENT_STATE: u8 = 0x15;
    pub const FORCE_STATE: u8 = 0x16;
    pub const SET_STATE_TIMERS: u8 = 0x17;
    pub const SET_EXTRA_TIMERS: u8 = 0x19;
    pub const SET_EXTRA_TRIGGERS: u8 = 0x1A;
    pub const SET_STATE_OUTPUTS: u8 = 0x1B;
    pub const ERROR: u8 = 0xFF;
}

/// Trigger byte meaning "never armed"
pub const NO_TRIGGER: u8 = 0xFF;

/// Lower bound on how long a query waits for its reply
const MIN_QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Client for a microcontroller state machine on a serial link
pub struct SerialOpcodeClient {
    config: SerialConfig,
    transport: Box<dyn Transport>,
    queue: Arc<ByteQueue>,
    reader: Option<ReaderThread>,
    connect_timeouts: u32,
    /// Row count of the last uploaded matrix (timers and outputs are sent per row)
    n_states: usize,
    /// Reported when a GET_TIME reply is late
    last_time: f64,
    /// Event lines announced by a GET_EVENTS count byte but not read yet
    pending_events: usize,
    /// Events read but not handed out yet
    carried: Vec<Event>,
}

impl SerialOpcodeClient {
    /// Open the configured serial device
    #[cfg(feature = "serial-port")]
    pub fn open(config: SerialConfig) -> Result<Self> {
        let transport = super::transport::open_serial(&config.port, config.baud_rate, config.read_timeout())?;
        Ok(Self::with_transport(config, transport))
    }

    /// Use an already opened transport
    pub fn with_transport(config: SerialConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            queue: Arc::new(ByteQueue::new()),
            reader: None,
            connect_timeouts: 0,
            n_states: 0,
            last_time: 0.0,
            pending_events: 0,
            carried: Vec::new(),
        }
    }

    /// Read timeouts seen by the last `connect()` before the board answered
    pub fn connect_timeouts(&self) -> u32 {
        self.connect_timeouts
    }

    /// Firmware version string
    pub fn get_version(&mut self) -> Result<String> {
        self.query(&[opcode::GET_VERSION])?;
        self.queue
            .read_line(self.query_timeout())
            .ok_or_else(|| ClientError::NoReply("GET_VERSION".to_string()))
    }

    /// Current level of every input line
    pub fn get_inputs(&mut self) -> Result<Vec<bool>> {
        self.query(&[opcode::GET_INPUTS])?;
        let n = self.config.sizes.n_inputs;
        let bytes = self
            .queue
            .take(n, self.query_timeout())
            .ok_or_else(|| ClientError::NoReply("GET_INPUTS".to_string()))?;
        Ok(bytes.into_iter().map(|b| b != 0).collect())
    }

    fn query_timeout(&self) -> Duration {
        self.config.read_timeout().max(MIN_QUERY_TIMEOUT)
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        if self.reader.is_none() {
            return Err(ClientError::NotConnected);
        }
        log::trace!("serial -> {:02X?}", command);
        self.transport.write_all(command)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Send a command whose reply must not be confused with stale bytes
    ///
    /// Event lines still owed by an earlier GET_EVENTS are read first, so they
    /// are not thrown away with the stale bytes.
    fn query(&mut self, command: &[u8]) -> Result<()> {
        if self.pending_events > 0 {
            self.drain_pending(self.config.read_timeout())?;
            if self.pending_events > 0 {
                log::warn!("Dropping {} announced events that never arrived", self.pending_events);
                self.pending_events = 0;
            }
        }
        let stale = self.queue.clear();
        if stale > 0 {
            log::warn!("Discarded {} stale bytes before opcode 0x{:02X}", stale, command[0]);
        }
        self.send(command)
    }

    /// Read owed event lines into `carried`; lines not in by `timeout` stay owed
    fn drain_pending(&mut self, timeout: Duration) -> Result<()> {
        while self.pending_events > 0 {
            let Some(line) = self.queue.read_line(timeout) else {
                log::debug!("{} announced events still in transit", self.pending_events);
                break;
            };
            self.pending_events -= 1;
            self.carried.push(parse_event_line(&line)?);
        }
        Ok(())
    }

    fn expect_ok(&self, command: &str) -> Result<()> {
        match self.queue.pop(self.config.read_timeout()) {
            Some(opcode::OK) => Ok(()),
            None => {
                log::trace!("No acknowledgement to {}; assuming success", command);
                Ok(())
            }
            Some(opcode::ERROR) => Err(ClientError::Controller(format!("{} rejected", command))),
            Some(other) => Err(ClientError::AckMismatch {
                command: command.to_string(),
                expected: format!("0x{:02X}", opcode::OK),
                received: format!("0x{:02X}", other),
            }),
        }
    }

    fn configure(&mut self, command: &[u8], name: &str) -> Result<()> {
        self.query(command)?;
        self.expect_ok(name)
    }

    fn expect_rows(&self, found: usize) -> Result<()> {
        if found != self.n_states {
            return Err(MatrixError::Shape {
                expected: self.n_states,
                found,
            }
            .into());
        }
        Ok(())
    }
}

/// Convert a count or index to the single byte the protocol carries
fn byte(value: usize, what: &str) -> Result<u8> {
    u8::try_from(value).map_err(|_| ClientError::Protocol(format!("{} {} does not fit in one byte", what, value)))
}

fn millis(seconds: f64) -> u32 {
    (seconds * 1000.0).round().clamp(0.0, u32::MAX as f64) as u32
}

fn parse_event_line(line: &str) -> Result<Event> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let bad = || ClientError::Protocol(format!("malformed event line '{}'", line));
    if fields.len() != 3 {
        return Err(bad());
    }
    let ms: f64 = fields[0].parse().map_err(|_| bad())?;
    let code: i32 = fields[1].parse().map_err(|_| bad())?;
    let next: usize = fields[2].parse().map_err(|_| bad())?;
    Ok(Event::new(ms / 1000.0, code, next))
}

impl StateMachineClient for SerialOpcodeClient {
    fn backend_name(&self) -> &'static str {
        "serial"
    }

    fn connect(&mut self) -> Result<()> {
        if self.reader.is_none() {
            let reader = self.transport.reader(self.config.read_timeout())?;
            self.queue.reopen();
            self.reader = Some(ReaderThread::spawn("serial-reader", reader, self.queue.clone())?);
        }

        self.connect_timeouts = 0;
        let timeout = self.config.read_timeout();
        for attempt in 1..=self.config.connect_retries {
            self.send(&[opcode::CONNECT])?;
            match self.queue.pop(timeout) {
                Some(opcode::OK) => {
                    log::info!(
                        "Connected to {} after {} attempt(s), {} timeout(s)",
                        self.config.port,
                        attempt,
                        self.connect_timeouts
                    );
                    return Ok(());
                }
                Some(other) => log::trace!("Ignoring byte 0x{:02X} during connect", other),
                None => {
                    self.connect_timeouts += 1;
                    log::warn!("Connect attempt {} to {} timed out", attempt, self.config.port);
                }
            }
        }

        Err(ClientError::ConnectTimeout {
            attempts: self.config.connect_retries,
        })
    }

    fn close(&mut self) -> Result<()> {
        if let Err(e) = self.transport.shutdown() {
            log::debug!("Transport shutdown failed: {}", e);
        }
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        self.queue.close();
        log::info!("Closed serial link {}", self.config.port);
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        let sizes = self.config.sizes;
        let command = [
            opcode::SET_SIZES,
            byte(sizes.n_inputs, "input count")?,
            byte(sizes.n_outputs, "output count")?,
            byte(sizes.n_extra_timers, "extra timer count")?,
        ];
        self.configure(&command, "SET_SIZES")?;
        log::info!(
            "Initialized controller: {} inputs, {} outputs, {} extra timers",
            sizes.n_inputs,
            sizes.n_outputs,
            sizes.n_extra_timers
        );
        Ok(())
    }

    fn set_state_matrix(&mut self, matrix: &StateMatrix) -> Result<()> {
        matrix.validate()?;
        self.config.sizes.check_matrix(matrix)?;
        let table = matrix.wire_table();
        let width = matrix.transition_width();

        let mut command = vec![
            opcode::SET_STATE_MATRIX,
            byte(table.rows(), "state count")?,
            byte(width, "transition width")?,
        ];
        command.extend(table.byte_cells(0..width)?);
        self.configure(&command, "SET_STATE_MATRIX")?;
        self.n_states = table.rows();
        log::debug!("Uploaded {} x {} transition table", table.rows(), width);

        self.set_state_outputs(&matrix.output_patterns())?;
        self.set_state_timers(&matrix.timers())?;
        if matrix.n_extra_timers() > 0 {
            let durations: Vec<f64> = matrix.extra_timers().iter().map(|t| t.duration).collect();
            self.set_extra_timers(&durations)?;
            self.set_extra_triggers(&matrix.extra_triggers())?;
        }
        Ok(())
    }

    fn set_state_outputs(&mut self, outputs: &[OutputPattern]) -> Result<()> {
        self.expect_rows(outputs.len())?;
        let n_outputs = outputs.first().map_or(0, |p| p.actions.len());
        let mut command = vec![
            opcode::SET_STATE_OUTPUTS,
            byte(outputs.len(), "state count")?,
            byte(n_outputs + 1, "output column count")?,
        ];
        for pattern in outputs {
            if pattern.actions.len() != n_outputs {
                return Err(MatrixError::Shape {
                    expected: n_outputs,
                    found: pattern.actions.len(),
                }
                .into());
            }
            command.extend(pattern.actions.iter().map(|a| a.code()));
            command.push(pattern.serial_code());
        }
        self.configure(&command, "SET_STATE_OUTPUTS")
    }

    fn set_state_timers(&mut self, timers: &[f64]) -> Result<()> {
        self.expect_rows(timers.len())?;
        let mut command = vec![opcode::SET_STATE_TIMERS];
        for &timer in timers {
            command.write_u32::<LittleEndian>(millis(timer))?;
        }
        self.configure(&command, "SET_STATE_TIMERS")
    }

    fn set_extra_timers(&mut self, durations: &[f64]) -> Result<()> {
        let mut command = vec![opcode::SET_EXTRA_TIMERS, byte(durations.len(), "extra timer count")?];
        for &duration in durations {
            command.write_u32::<LittleEndian>(millis(duration))?;
        }
        self.configure(&command, "SET_EXTRA_TIMERS")
    }

    fn set_extra_triggers(&mut self, triggers: &[Option<usize>]) -> Result<()> {
        let mut command = vec![opcode::SET_EXTRA_TRIGGERS, byte(triggers.len(), "extra timer count")?];
        for trigger in triggers {
            let value = match trigger {
                Some(state) if *state < NO_TRIGGER as usize => *state as u8,
                Some(state) => return Err(ClientError::Protocol(format!("trigger state {} out of range", state))),
                None => NO_TRIGGER,
            };
            command.push(value);
        }
        self.configure(&command, "SET_EXTRA_TRIGGERS")
    }

    fn run(&mut self) -> Result<()> {
        self.send(&[opcode::RUN])?;
        log::info!("Controller running");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.send(&[opcode::STOP])?;
        log::info!("Controller stopped");
        Ok(())
    }

    fn force_state(&mut self, state: usize) -> Result<()> {
        self.send(&[opcode::FORCE_STATE, byte(state, "state")?])
    }

    fn force_output(&mut self, line: usize, value: bool) -> Result<()> {
        self.send(&[opcode::FORCE_OUTPUT, byte(line, "output line")?, u8::from(value)])
    }

    fn get_time(&mut self) -> Result<f64> {
        self.query(&[opcode::GET_TIME])?;
        let Some(line) = self.queue.read_line(self.query_timeout()) else {
            log::warn!("No reply to GET_TIME; reusing {:.3}s", self.last_time);
            return Ok(self.last_time);
        };
        let ms: f64 = line
            .trim()
            .parse()
            .map_err(|_| ClientError::Protocol(format!("malformed time reply '{}'", line)))?;
        self.last_time = ms / 1000.0;
        Ok(self.last_time)
    }

    fn get_events(&mut self) -> Result<Vec<Event>> {
        let timeout = self.query_timeout();
        // Lines still owed by the last request come before a new request
        if self.pending_events == 0 {
            self.query(&[opcode::GET_EVENTS])?;
            match self.queue.pop(timeout) {
                Some(count) => self.pending_events = usize::from(count),
                None => log::warn!("No reply to GET_EVENTS; polling again later"),
            }
        }
        self.drain_pending(timeout)?;

        let events = std::mem::take(&mut self.carried);
        if !events.is_empty() {
            log::debug!("Fetched {} events", events.len());
        }
        Ok(events)
    }

    fn get_current_state(&mut self) -> Result<usize> {
        self.query(&[opcode::GET_CURRENT_STATE])?;
        self.queue
            .pop(self.query_timeout())
            .map(usize::from)
            .ok_or_else(|| ClientError::NoReply("GET_CURRENT_STATE".to_string()))
    }
}

impl Drop for SerialOpcodeClient {
    fn drop(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{StateMatrixBuilder, StateSpec, END_TRIAL};
    use crate::client::transport::scripted::ScriptedTransport;
    use crate::config::{ControllerSizes, EmulatorConfig};
    use crate::emulator::{EmulatorClock, EmulatorEngine, FsmCore};
    use crate::matrix::{ExtraTimer, WireTable};
    use byteorder::ReadBytesExt;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn config(sizes: ControllerSizes) -> SerialConfig {
        SerialConfig::new("stub", sizes).with_read_timeout(Duration::from_millis(20))
    }

    fn client_with(sizes: ControllerSizes, responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> SerialOpcodeClient {
        SerialOpcodeClient::with_transport(config(sizes), Box::new(ScriptedTransport::new(responder)))
    }

    /// Answers CONNECT with OK and stays silent otherwise
    fn connected(responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> SerialOpcodeClient {
        let mut responder = responder;
        let mut client = client_with(ControllerSizes::new(1, 1, 0), move |cmd| {
            if cmd == [opcode::CONNECT] {
                vec![opcode::OK]
            } else {
                responder(cmd)
            }
        });
        client.connect().unwrap();
        client
    }

    #[test]
    fn test_connect_after_three_timeouts() {
        let mut silent_for = 3;
        let mut client = client_with(ControllerSizes::new(1, 1, 0), move |cmd| {
            assert_eq!(cmd, [opcode::CONNECT]);
            if silent_for > 0 {
                silent_for -= 1;
                Vec::new()
            } else {
                vec![opcode::OK]
            }
        });
        client.connect().unwrap();
        assert_eq!(client.connect_timeouts(), 3);
    }

    #[test]
    fn test_connect_gives_up() {
        let sizes = ControllerSizes::new(1, 1, 0);
        let mut client = SerialOpcodeClient::with_transport(
            config(sizes).with_connect_retries(2),
            Box::new(ScriptedTransport::new(|_| Vec::new())),
        );
        assert!(matches!(client.connect(), Err(ClientError::ConnectTimeout { attempts: 2 })));
    }

    #[test]
    fn test_commands_require_connect() {
        let mut client = client_with(ControllerSizes::new(1, 1, 0), |_| Vec::new());
        assert!(matches!(client.run(), Err(ClientError::NotConnected)));
    }

    #[test]
    fn test_ack_mismatch_names_command() {
        let mut client = connected(|_| vec![0x42]);
        match client.initialize() {
            Err(ClientError::AckMismatch {
                command,
                expected,
                received,
            }) => {
                assert_eq!(command, "SET_SIZES");
                assert_eq!(expected, "0xAA");
                assert_eq!(received, "0x42");
            }
            other => panic!("expected ack mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_silence_counts_as_ack() {
        let mut client = connected(|_| Vec::new());
        client.initialize().unwrap();
    }

    #[test]
    fn test_error_byte_is_controller_error() {
        let mut client = connected(|_| vec![opcode::ERROR]);
        assert!(matches!(client.initialize(), Err(ClientError::Controller(_))));
    }

    #[test]
    fn test_queries() {
        let mut client = connected(|cmd| match cmd[0] {
            opcode::GET_TIME => b"1500\n".to_vec(),
            opcode::GET_CURRENT_STATE => vec![7],
            opcode::GET_VERSION => b"fsm-fw 2.1\n".to_vec(),
            opcode::GET_INPUTS => vec![1],
            opcode::GET_EVENTS => b"\x0210 0 3\n20 -1 2\n".to_vec(),
            _ => Vec::new(),
        });
        assert_eq!(client.get_time().unwrap(), 1.5);
        assert_eq!(client.get_current_state().unwrap(), 7);
        assert_eq!(client.get_version().unwrap(), "fsm-fw 2.1");
        assert_eq!(client.get_inputs().unwrap(), vec![true]);
        assert_eq!(
            client.get_events().unwrap(),
            vec![Event::new(0.01, 0, 3), Event::new(0.02, -1, 2)]
        );
    }

    #[test]
    fn test_timer_payload_is_little_endian_millis() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut client = connected(move |cmd| {
            sink.lock().push(cmd.to_vec());
            vec![opcode::OK]
        });
        let mut b = StateMatrixBuilder::new(&["P"], &["Light"]);
        b.add_state(StateSpec::new("A").timer(2.5)).unwrap();
        client.set_state_matrix(&b.build().unwrap()).unwrap();

        let commands = captured.lock();
        let timers = commands.iter().find(|c| c[0] == opcode::SET_STATE_TIMERS).unwrap();
        let mut cursor = Cursor::new(&timers[1..]);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 1);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 1_000_000_000);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 2500);
    }

    #[test]
    fn test_silent_board_does_not_end_session() {
        let answered = Arc::new(AtomicBool::new(false));
        let flag = answered.clone();
        let mut client = connected(move |cmd| match cmd[0] {
            opcode::GET_TIME if !flag.swap(true, Ordering::SeqCst) => b"1500\n".to_vec(),
            _ => Vec::new(),
        });
        assert!(client.get_events().unwrap().is_empty());
        assert_eq!(client.get_time().unwrap(), 1.5);
        // Second GET_TIME goes unanswered
        assert_eq!(client.get_time().unwrap(), 1.5);
    }

    /// Client whose scripted board also hands back a channel for late bytes
    fn connected_with_late_bytes(
        responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    ) -> (SerialOpcodeClient, std::sync::mpsc::Sender<Vec<u8>>) {
        let mut responder = responder;
        let transport = ScriptedTransport::new(move |cmd| {
            if cmd == [opcode::CONNECT] {
                vec![opcode::OK]
            } else {
                responder(cmd)
            }
        });
        let late = transport.injector();
        let mut client = SerialOpcodeClient::with_transport(config(ControllerSizes::new(1, 1, 0)), Box::new(transport));
        client.connect().unwrap();
        (client, late)
    }

    #[test]
    fn test_event_lines_split_across_polls() {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let (mut client, late) = connected_with_late_bytes(move |cmd| match cmd[0] {
            // Two events announced, only the first line arrives in time
            opcode::GET_EVENTS if counter.fetch_add(1, Ordering::SeqCst) == 0 => b"\x0210 0 3\n".to_vec(),
            opcode::GET_EVENTS => vec![0],
            _ => Vec::new(),
        });

        assert_eq!(client.get_events().unwrap(), vec![Event::new(0.01, 0, 3)]);
        late.send(b"20 -1 2\n".to_vec()).unwrap();
        assert_eq!(client.get_events().unwrap(), vec![Event::new(0.02, -1, 2)]);
        // The owed line was collected without asking again
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        assert!(client.get_events().unwrap().is_empty());
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_owed_event_lines_survive_other_queries() {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let (mut client, late) = connected_with_late_bytes(move |cmd| match cmd[0] {
            opcode::GET_EVENTS if counter.fetch_add(1, Ordering::SeqCst) == 0 => b"\x0210 0 3\n".to_vec(),
            opcode::GET_EVENTS => vec![0],
            opcode::GET_TIME => b"30\n".to_vec(),
            _ => Vec::new(),
        });

        assert_eq!(client.get_events().unwrap().len(), 1);
        late.send(b"20 -1 2\n".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(client.get_time().unwrap(), 0.03);
        assert_eq!(client.get_events().unwrap(), vec![Event::new(0.02, -1, 2)]);
    }

    #[test]
    fn test_matrix_for_other_sizes_is_not_uploaded() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut client = connected(move |cmd| {
            sink.lock().push(cmd.to_vec());
            vec![opcode::OK]
        });
        // Two inputs against a board configured for one
        let mut b = StateMatrixBuilder::new(&["L", "R"], &["Light"]);
        b.add_state(StateSpec::new("A").on("Lin", END_TRIAL)).unwrap();

        assert!(matches!(
            client.set_state_matrix(&b.build().unwrap()),
            Err(ClientError::Matrix(MatrixError::Shape { .. }))
        ));
        assert!(captured.lock().iter().all(|c| c[0] != opcode::SET_STATE_MATRIX));
    }

    /// Controller double that decodes the uploaded bytes and runs them on an FsmCore
    #[derive(Default)]
    struct FakeController {
        n_inputs: usize,
        n_outputs: usize,
        transitions: Vec<Vec<u8>>,
        outputs: Vec<Vec<u8>>,
        timers: Vec<f64>,
        extra_durations: Vec<f64>,
        extra_triggers: Vec<u8>,
        core: Option<FsmCore>,
        now: f64,
        pending: Vec<Event>,
    }

    impl FakeController {
        fn build_core(&self) -> FsmCore {
            let width = self.transitions[0].len();
            let rows = self
                .transitions
                .iter()
                .zip(&self.outputs)
                .map(|(t, o)| t.iter().chain(o.iter()).map(|&v| v as f64).collect())
                .collect();
            let table = WireTable::from_rows(rows, width + self.n_outputs + 1).unwrap();
            let extra = self
                .extra_durations
                .iter()
                .zip(&self.extra_triggers)
                .enumerate()
                .map(|(i, (&duration, &trigger))| ExtraTimer {
                    name: format!("timer_{}", i),
                    duration,
                    trigger_state: (trigger != NO_TRIGGER).then_some(trigger as usize),
                })
                .collect();
            let matrix = StateMatrix::from_wire_table(&table, self.n_inputs, self.n_outputs, &self.timers, extra).unwrap();
            FsmCore::new(matrix)
        }

        fn step(&mut self, now: f64, inputs: &[bool]) {
            self.now = now;
            if let Some(core) = self.core.as_mut() {
                core.cycle(now, inputs);
                self.pending.extend(core.take_events());
            }
        }

        fn handle(&mut self, cmd: &[u8]) -> Vec<u8> {
            let mut cursor = Cursor::new(&cmd[1..]);
            match cmd[0] {
                opcode::CONNECT => return vec![opcode::OK],
                opcode::SET_SIZES => {
                    self.n_inputs = cmd[1] as usize;
                    self.n_outputs = cmd[2] as usize;
                }
                opcode::SET_STATE_MATRIX => {
                    let (rows, cols) = (cmd[1] as usize, cmd[2] as usize);
                    self.transitions = cmd[3..].chunks(cols).take(rows).map(|r| r.to_vec()).collect();
                }
                opcode::SET_STATE_OUTPUTS => {
                    let (rows, cols) = (cmd[1] as usize, cmd[2] as usize);
                    self.outputs = cmd[3..].chunks(cols).take(rows).map(|r| r.to_vec()).collect();
                }
                opcode::SET_STATE_TIMERS => {
                    self.timers = (0..self.transitions.len())
                        .map(|_| cursor.read_u32::<LittleEndian>().unwrap() as f64 / 1000.0)
                        .collect();
                }
                opcode::SET_EXTRA_TIMERS => {
                    let n = cursor.read_u8().unwrap();
                    self.extra_durations = (0..n)
                        .map(|_| cursor.read_u32::<LittleEndian>().unwrap() as f64 / 1000.0)
                        .collect();
                }
                opcode::SET_EXTRA_TRIGGERS => self.extra_triggers = cmd[2..].to_vec(),
                opcode::RUN => {
                    let mut core = self.build_core();
                    core.start(self.now);
                    self.core = Some(core);
                    return Vec::new();
                }
                opcode::FORCE_STATE => {
                    if let Some(core) = self.core.as_mut() {
                        core.force_state(cmd[1] as usize, self.now);
                        self.pending.extend(core.take_events());
                    }
                    return Vec::new();
                }
                opcode::GET_EVENTS => {
                    let mut reply = vec![self.pending.len() as u8];
                    for event in self.pending.drain(..) {
                        reply.extend(format!("{} {} {}\n", event.timestamp * 1000.0, event.code, event.next_state).bytes());
                    }
                    return reply;
                }
                _ => return Vec::new(),
            }
            vec![opcode::OK]
        }
    }

    fn equivalence_matrix() -> StateMatrix {
        let mut b = StateMatrixBuilder::new(&["P"], &["Light"]);
        b.add_extra_timer("limit", 0.3).unwrap();
        b.add_state(StateSpec::new("A").on("Pin", "B")).unwrap();
        b.add_state(
            StateSpec::new("B")
                .arm(&["limit"])
                .outputs_on(&["Light"])
                .on("Pout", "C")
                .on("limit", "A"),
        )
        .unwrap();
        b.add_state(StateSpec::new("C").timer(0.5).outputs_off(&["Light"]).on("Tup", END_TRIAL))
            .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_serial_matches_emulator() {
        let matrix = equivalence_matrix();
        let sizes = ControllerSizes::new(1, 1, 1);
        // (time, input level) samples; both backends see the same instants
        let samples = [
            (0.001, false),
            (0.1, true),
            (0.3, true),
            (0.45, true),
            (0.5, false),
            (0.6, true),
            (0.7, false),
            (1.2, false),
            (1.3, false),
        ];

        let fake = Arc::new(Mutex::new(FakeController::default()));
        let handler = fake.clone();
        let mut serial = SerialOpcodeClient::with_transport(
            config(sizes),
            Box::new(ScriptedTransport::new(move |cmd| handler.lock().handle(cmd))),
        );
        serial.connect().unwrap();
        serial.initialize().unwrap();
        serial.set_state_matrix(&matrix).unwrap();
        serial.run().unwrap();

        let clock = EmulatorClock::manual();
        let mut emulator = EmulatorEngine::with_clock(EmulatorConfig::new(sizes).manual(), clock.clone());
        emulator.connect().unwrap();
        emulator.initialize().unwrap();
        emulator.set_state_matrix(&matrix).unwrap();
        emulator.run().unwrap();

        let mut serial_events = Vec::new();
        let mut emulated_events = Vec::new();
        for (i, &(t, level)) in samples.iter().enumerate() {
            // Fire-and-forget commands are handled synchronously by the fake
            fake.lock().step(t, &[level]);
            clock.set(t);
            emulator.input_panel().set(0, level).unwrap();
            emulator.tick();

            if i == 0 {
                serial.force_state(2).unwrap();
                emulator.force_state(2).unwrap();
            }
            serial_events.extend(serial.get_events().unwrap());
            emulated_events.extend(emulator.get_events().unwrap());
        }

        let pairs = |events: &[Event]| events.iter().map(|e| (e.code, e.next_state)).collect::<Vec<_>>();
        assert!(emulated_events.len() > 5);
        assert_eq!(pairs(&serial_events), pairs(&emulated_events));
    }
}
