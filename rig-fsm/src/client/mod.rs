//! State machine clients
//!
//! [`StateMachineClient`] is the one interface the dispatcher talks to. Three
//! backends implement it:
//! - [`SerialOpcodeClient`]: single-byte opcodes to a microcontroller
//! - [`SocketTextClient`]: text commands with binary payloads to a soft-real-time host
//! - [`EmulatorEngine`](crate::emulator::EmulatorEngine): the state machine in software
//!
//! All three report the same event stream for the same matrix and inputs, so
//! callers never need to know which one is active.

use crate::matrix::{OutputPattern, StateMatrix};
use crate::types::{Event, Result};

pub mod serial;
pub mod socket;
pub mod transport;

pub use serial::SerialOpcodeClient;
pub use socket::SocketTextClient;
pub use transport::Transport;

/// Operations every state machine backend supports
pub trait StateMachineClient: Send {
    /// Short backend name for log messages
    fn backend_name(&self) -> &'static str;

    /// Open the link (wire backends perform their handshake here)
    fn connect(&mut self) -> Result<()>;

    /// Release the link; safe to call with a read in flight
    fn close(&mut self) -> Result<()>;

    /// Reset the controller and restart its clock
    fn initialize(&mut self) -> Result<()>;

    /// Upload a complete matrix: transitions, outputs, timers and extra timers
    fn set_state_matrix(&mut self, matrix: &StateMatrix) -> Result<()>;

    /// Replace the output pattern of every state
    fn set_state_outputs(&mut self, outputs: &[OutputPattern]) -> Result<()>;

    /// Replace the self-timer (seconds) of every state
    fn set_state_timers(&mut self, timers: &[f64]) -> Result<()>;

    /// Replace the duration (seconds) of every extra timer
    fn set_extra_timers(&mut self, durations: &[f64]) -> Result<()>;

    /// Replace the arming state of every extra timer
    fn set_extra_triggers(&mut self, triggers: &[Option<usize>]) -> Result<()>;

    fn run(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Jump to `state` from outside the matrix (reported with code -1)
    fn force_state(&mut self, state: usize) -> Result<()>;

    fn force_output(&mut self, line: usize, value: bool) -> Result<()>;

    /// Seconds since `initialize`
    fn get_time(&mut self) -> Result<f64>;

    /// Every event produced since the previous call, oldest first
    ///
    /// An event is returned exactly once.
    fn get_events(&mut self) -> Result<Vec<Event>>;

    fn get_current_state(&mut self) -> Result<usize>;

    /// Force the first `n_outputs` lines to `value`
    fn force_all_outputs(&mut self, n_outputs: usize, value: bool) -> Result<()> {
        for line in 0..n_outputs {
            self.force_output(line, value)?;
        }
        Ok(())
    }
}
