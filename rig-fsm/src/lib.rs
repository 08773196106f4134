//! Behavioral Rig State Machine Library
//!
//! Drives trial-based behavioral experiments on a finite state machine that
//! runs outside the host program: on a microcontroller, on a soft-real-time
//! server, or emulated in software.
//!
//! # Architecture
//!
//! - [`builder`] turns named states, events, outputs and timers into a dense,
//!   validated [`StateMatrix`]
//! - [`client`] defines the [`StateMachineClient`] interface and the two wire
//!   backends (single-byte serial opcodes, text commands over a socket)
//! - [`emulator`] executes the matrix in software with the same observable
//!   behavior as the wire backends
//! - [`dispatcher`] polls whichever backend is active, keeps the event log,
//!   detects trial boundaries and hands control to paradigm code between trials
//!
//! The library does NOT:
//! - Read configuration files or parse command lines
//! - Play sounds or show images (serial-output codes go to an [`emulator::OutputSink`])
//! - Persist event logs
//!
//! Those live in the application layer (rig-fsm-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use rig_fsm::builder::{StateMatrixBuilder, StateSpec, END_TRIAL};
//! use rig_fsm::config::{ControllerSizes, DispatcherConfig, EmulatorConfig};
//! use rig_fsm::{Dispatcher, EmulatorEngine, StateMachineClient};
//!
//! let mut emulator = EmulatorEngine::new(EmulatorConfig::new(ControllerSizes::new(1, 1, 0)));
//! emulator.connect().unwrap();
//! emulator.initialize().unwrap();
//!
//! let mut builder = StateMatrixBuilder::new(&["C"], &["Valve"]);
//! builder.add_state(StateSpec::new("wait").on("Cin", "reward")).unwrap();
//! builder
//!     .add_state(StateSpec::new("reward").timer(0.05).outputs_on(&["Valve"]).on("Tup", END_TRIAL))
//!     .unwrap();
//! let matrix = builder.build().unwrap();
//!
//! let mut dispatcher = Dispatcher::new(Box::new(emulator), DispatcherConfig::new().with_outputs(1));
//! dispatcher.load_matrix(&matrix).unwrap();
//! let outcome = dispatcher.resume().unwrap();
//! if outcome.prepare.is_some() {
//!     dispatcher.ready_to_start_trial().unwrap();
//! }
//! ```

// Public modules
pub mod builder;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod emulator;
pub mod matrix;
pub mod ticker;
pub mod types;

// Re-export main types for convenience
pub use builder::{StateMatrixBuilder, StateSpec};
pub use client::{SerialOpcodeClient, SocketTextClient, StateMachineClient};
pub use config::{ControllerSizes, DispatcherConfig, EmulatorConfig, SerialConfig, SocketConfig};
pub use dispatcher::{Dispatcher, DispatcherError, DispatcherEvent, DispatcherObserver, Paradigm, Tick};
pub use emulator::EmulatorEngine;
pub use matrix::{StateMatrix, READY_STATE, STATE_0, TRIAL_START_STATE};
pub use types::{BuilderError, ClientError, Event, EventKind, MatrixError, OutputAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
