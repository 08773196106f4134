//! Backend and dispatcher configuration types
//!
//! Every tunable of the library is carried by one of these structs. They are
//! plain serde types so the application layer can load them from a session file;
//! the library itself never reads files or environment variables.

use crate::client::socket::OutputRoute;
use crate::matrix::{check_shape, StateMatrix, TRIAL_START_STATE};
use crate::types::MatrixError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sizes of the controller's I/O, shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSizes {
    pub n_inputs: usize,
    pub n_outputs: usize,
    #[serde(default)]
    pub n_extra_timers: usize,
}

impl ControllerSizes {
    pub fn new(n_inputs: usize, n_outputs: usize, n_extra_timers: usize) -> Self {
        Self {
            n_inputs,
            n_outputs,
            n_extra_timers,
        }
    }

    /// Reject a matrix built for different I/O sizes than the controller's
    pub fn check_matrix(&self, matrix: &StateMatrix) -> Result<(), MatrixError> {
        check_shape(matrix.wire_width(), self.n_inputs, self.n_extra_timers, self.n_outputs)?;
        // Equal widths can still trade inputs for extra timers
        if matrix.n_inputs() != self.n_inputs {
            return Err(MatrixError::Shape {
                expected: self.n_inputs,
                found: matrix.n_inputs(),
            });
        }
        Ok(())
    }
}

/// Configuration for the microcontroller (single-byte opcode) backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyACM0`
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    pub sizes: ControllerSizes,

    /// Read timeout used by the background reader and by every reply wait
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Connect attempts before giving up (the board resets on power-up)
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout() -> u64 {
    100
}

fn default_connect_retries() -> u32 {
    50
}

impl SerialConfig {
    pub fn new(port: impl Into<String>, sizes: ControllerSizes) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            sizes,
            read_timeout_ms: default_read_timeout(),
            connect_retries: default_connect_retries(),
        }
    }

    /// Builder method: set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set the number of connect attempts
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Input channel type reported to the soft-real-time host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputChannelType {
    Analog,
    #[default]
    Digital,
}

impl InputChannelType {
    /// Numeric value used on the `SET STATE MATRIX` line
    pub fn wire_code(self) -> u8 {
        match self {
            InputChannelType::Analog => 0,
            InputChannelType::Digital => 1,
        }
    }
}

/// Configuration for the soft-real-time host (text socket) backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// `host:port` of the FSM server
    pub address: String,

    /// State machine slot on a server that hosts several
    #[serde(default)]
    pub machine_id: u32,

    pub sizes: ControllerSizes,

    #[serde(default)]
    pub input_type: InputChannelType,

    /// Custom routing for the output columns (default: dout per line + ext)
    #[serde(default)]
    pub output_routes: Option<Vec<OutputRoute>>,

    /// Ask the server to swap in a new matrix at the next state-0 jump
    #[serde(default = "default_true")]
    pub pending_swap: bool,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// How long to wait for the server's reply to a command
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_reply_timeout() -> u64 {
    2000
}

impl SocketConfig {
    pub fn new(address: impl Into<String>, sizes: ControllerSizes) -> Self {
        Self {
            address: address.into(),
            machine_id: 0,
            sizes,
            input_type: InputChannelType::default(),
            output_routes: None,
            pending_swap: true,
            read_timeout_ms: default_read_timeout(),
            reply_timeout_ms: default_reply_timeout(),
        }
    }

    /// Builder method: route the output columns explicitly
    pub fn with_output_routes(mut self, routes: Vec<OutputRoute>) -> Self {
        self.output_routes = Some(routes);
        self
    }

    /// Builder method: select the state machine slot
    pub fn with_machine_id(mut self, id: u32) -> Self {
        self.machine_id = id;
        self
    }

    /// Builder method: set the reply timeout
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Configuration for the software emulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    pub sizes: ControllerSizes,

    /// Period of the emulator's own cycle
    #[serde(default = "default_emulator_tick")]
    pub tick_ms: u64,

    /// Run the cycle on a background thread (false = caller drives `tick()`)
    #[serde(default = "default_true")]
    pub background: bool,
}

fn default_emulator_tick() -> u64 {
    1
}

impl EmulatorConfig {
    pub fn new(sizes: ControllerSizes) -> Self {
        Self {
            sizes,
            tick_ms: default_emulator_tick(),
            background: true,
        }
    }

    /// Builder method: cycle period
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_ms = tick.as_millis().max(1) as u64;
        self
    }

    /// Builder method: drive the cycle manually instead of from a thread
    pub fn manual(mut self) -> Self {
        self.background = false;
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Configuration for the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Polling period (typically 100-300 ms)
    #[serde(default = "default_poll_period")]
    pub poll_period_ms: u64,

    /// States whose arrival hands control to the paradigm
    #[serde(default = "default_prepare_states")]
    pub prepare_next_trial_states: Vec<usize>,

    /// State forced by `ready_to_start_trial`
    #[serde(default = "default_trial_start")]
    pub trial_start_state: usize,

    /// Output lines forced off by `pause`
    #[serde(default)]
    pub n_outputs: usize,
}

fn default_poll_period() -> u64 {
    100
}

fn default_prepare_states() -> Vec<usize> {
    vec![crate::matrix::READY_STATE]
}

fn default_trial_start() -> usize {
    TRIAL_START_STATE
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: default_poll_period(),
            prepare_next_trial_states: default_prepare_states(),
            trial_start_state: default_trial_start(),
            n_outputs: 0,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: polling period
    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period_ms = period.as_millis() as u64;
        self
    }

    /// Builder method: prepare-next-trial state set
    pub fn with_prepare_next_trial(mut self, states: Vec<usize>) -> Self {
        self.prepare_next_trial_states = states;
        self
    }

    /// Builder method: number of outputs to force off on pause
    pub fn with_outputs(mut self, n_outputs: usize) -> Self {
        self.n_outputs = n_outputs;
        self
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}
