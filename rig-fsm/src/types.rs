//! Core types shared by every layer of the rig
//!
//! This module defines the event record produced by the state machine, the
//! per-output actions a state can request, and the error types returned by the
//! builder, the protocol clients and the dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Event code reported when the state machine was forced into a state from outside
pub const FORCED_JUMP: i32 = -1;

/// A single state transition reported by the controller
///
/// Events are appended to the dispatcher's log in the order the controller
/// produced them and are never modified afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Seconds since the controller was initialized
    pub timestamp: f64,
    /// Column of the state matrix that fired (see [`EventKind`])
    pub code: i32,
    /// State the machine entered as a result of this event
    pub next_state: usize,
}

impl Event {
    /// Create a new event record
    pub fn new(timestamp: f64, code: i32, next_state: usize) -> Self {
        Self {
            timestamp,
            code,
            next_state,
        }
    }

    /// Classify the event code for a controller with `n_inputs` input lines
    pub fn kind(&self, n_inputs: usize) -> EventKind {
        EventKind::classify(self.code, n_inputs)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}s code={} -> {}", self.timestamp, self.code, self.next_state)
    }
}

/// What produced an event code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Input line went high
    Rising(usize),
    /// Input line went low
    Falling(usize),
    /// The state's own timer elapsed
    StateTimer,
    /// An extra timer expired
    ExtraTimer(usize),
    /// The state was forced from outside the matrix
    Forced,
    /// Negative codes other than the forced jump
    Unknown(i32),
}

impl EventKind {
    /// Map an event code onto its source
    ///
    /// Codes `[0, 2·n_inputs)` are edges (even = rising, odd = falling),
    /// `2·n_inputs` is the state timer and anything above is an extra timer.
    pub fn classify(code: i32, n_inputs: usize) -> Self {
        if code == FORCED_JUMP {
            return EventKind::Forced;
        }
        if code < 0 {
            return EventKind::Unknown(code);
        }
        let code = code as usize;
        let n_edges = 2 * n_inputs;
        if code < n_edges {
            if code % 2 == 0 {
                EventKind::Rising(code / 2)
            } else {
                EventKind::Falling(code / 2)
            }
        } else if code == n_edges {
            EventKind::StateTimer
        } else {
            EventKind::ExtraTimer(code - n_edges - 1)
        }
    }
}

/// What a state does to one output line on entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputAction {
    Off,
    On,
    #[default]
    Unchanged,
}

impl OutputAction {
    /// Numeric code used in the wire table (0 off, 1 on, 2 unchanged)
    pub fn code(self) -> u8 {
        match self {
            OutputAction::Off => 0,
            OutputAction::On => 1,
            OutputAction::Unchanged => 2,
        }
    }

    /// Inverse of [`OutputAction::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OutputAction::Off),
            1 => Some(OutputAction::On),
            2 => Some(OutputAction::Unchanged),
            _ => None,
        }
    }

    /// Resolve the action against the current line value
    pub fn apply(self, current: bool) -> bool {
        match self {
            OutputAction::Off => false,
            OutputAction::On => true,
            OutputAction::Unchanged => current,
        }
    }
}

/// Errors raised while validating or encoding a state matrix
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatrixError {
    #[error("Matrix shape mismatch: expected {expected} columns, found {found}")]
    Shape { expected: usize, found: usize },

    #[error("State {state} has {found} transitions, expected {expected}")]
    RowWidth {
        state: usize,
        expected: usize,
        found: usize,
    },

    #[error("State {state} event {code} targets undefined state {target}")]
    TargetOutOfRange { state: usize, code: usize, target: usize },

    #[error("Value {value} does not fit in a one-byte cell (row {row}, column {col})")]
    CellOutOfRange { row: usize, col: usize, value: f64 },

    #[error("A state matrix needs at least {minimum} rows, found {found}")]
    TooFewRows { minimum: usize, found: usize },

    #[error("Invalid timer value for {what}: {value}")]
    InvalidTimer { what: String, value: f64 },
}

/// Errors raised while authoring a state matrix
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuilderError {
    #[error("Unknown event name: {0}")]
    UnknownEvent(String),

    #[error("Unknown output name: {0}")]
    UnknownOutput(String),

    #[error("Unknown extra timer: {0}")]
    UnknownTimer(String),

    #[error("State name '{0}' is reserved")]
    ReservedState(String),

    #[error("Row width changed with {0} authored states present; call reset() before resizing")]
    StaleRows(usize),

    #[error("State '{0}' is used as a target but never defined")]
    UndefinedState(String),

    #[error("Extra timer '{timer}' is armed by both '{first}' and '{second}'")]
    TimerArmedTwice {
        timer: String,
        first: String,
        second: String,
    },

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// Errors raised by the protocol clients
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Unexpected acknowledgement to '{command}': expected '{expected}', received '{received}'")]
    AckMismatch {
        command: String,
        expected: String,
        received: String,
    },

    #[error("Controller reported an error: {0}")]
    Controller(String),

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client is not connected")]
    NotConnected,

    #[error("Controller did not answer the connect handshake after {attempts} attempts")]
    ConnectTimeout { attempts: u32 },

    #[error("Invalid output route: {0}")]
    Route(String),

    #[error("No reply to '{0}' before the read timeout")]
    NoReply(String),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
