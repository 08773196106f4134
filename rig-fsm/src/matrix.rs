//! State matrix data model
//!
//! A [`StateMatrix`] is the fixed-width table executed by the controller: one row
//! per state, one transition column per event code, plus the per-state timer,
//! output pattern and serial-output code. Matrices are produced by the
//! [`StateMatrixBuilder`](crate::builder::StateMatrixBuilder) and are immutable
//! once built.
//!
//! The wire backends do not ship [`State`] structs; they ship the dense
//! [`WireTable`] produced by [`StateMatrix::wire_table`].

use crate::types::{MatrixError, OutputAction};
use serde::{Deserialize, Serialize};

/// Trial-end sentinel and bootstrap state
pub const STATE_0: usize = 0;

/// Reserved rendezvous state where the controller idles between trials
pub const READY_STATE: usize = 1;

/// First ID handed to an authored state; the canonical trial-start state
pub const TRIAL_START_STATE: usize = 2;

/// Output pattern applied when a state is entered
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputPattern {
    /// One action per output line
    pub actions: Vec<OutputAction>,
    /// Side-effect code for the external sound/image module
    pub serial_out: Option<u8>,
}

impl OutputPattern {
    /// Pattern that leaves every line untouched and emits nothing
    pub fn unchanged(n_outputs: usize) -> Self {
        Self {
            actions: vec![OutputAction::Unchanged; n_outputs],
            serial_out: None,
        }
    }

    /// Wire code for the serial column (0 means no side effect)
    pub fn serial_code(&self) -> u8 {
        self.serial_out.unwrap_or(0)
    }
}

/// One row of the state matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: usize,
    pub name: String,
    /// Self-timer duration in seconds
    pub timer: f64,
    /// Next state for every event code
    pub transitions: Vec<usize>,
    pub outputs: OutputPattern,
    /// Extra timers (by index) armed when this state is entered
    pub arm_timers: Vec<usize>,
}

impl State {
    /// A state that loops on itself for every event and changes no outputs
    pub fn self_looping(id: usize, name: impl Into<String>, width: usize, n_outputs: usize, timer: f64) -> Self {
        Self {
            id,
            name: name.into(),
            timer,
            transitions: vec![id; width],
            outputs: OutputPattern::unchanged(n_outputs),
            arm_timers: Vec::new(),
        }
    }
}

/// A secondary timer armed on entry to a specific state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraTimer {
    pub name: String,
    /// Seconds from arming to expiry
    pub duration: f64,
    /// State whose entry arms the timer (None = never armed)
    pub trigger_state: Option<usize>,
}

impl ExtraTimer {
    pub fn new(name: impl Into<String>, duration: f64) -> Self {
        Self {
            name: name.into(),
            duration,
            trigger_state: None,
        }
    }
}

/// Schedule-wave specification passed through to a soft-real-time host
///
/// The core never interprets these; the socket backend appends one row per
/// wave to the uploaded matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleWave {
    pub id: u32,
    /// Event column fired when the wave goes high (-1 = none)
    #[serde(default = "no_column")]
    pub in_event_col: i32,
    /// Event column fired when the wave goes low (-1 = none)
    #[serde(default = "no_column")]
    pub out_event_col: i32,
    /// Digital line driven by the wave (-1 = none)
    #[serde(default = "no_column")]
    pub dio_line: i32,
    /// Sound trigger fired by the wave (0 = none)
    #[serde(default)]
    pub sound_trig: i32,
    pub preamble: f64,
    pub sustain: f64,
    #[serde(default)]
    pub refraction: f64,
}

fn no_column() -> i32 {
    -1
}

impl ScheduleWave {
    /// Number of numeric fields in an encoded wave row
    pub const FIELDS: usize = 8;

    /// Encode the wave as a table row of `cols` cells (zero padded)
    pub fn to_row(&self, cols: usize) -> Result<Vec<f64>, MatrixError> {
        if cols < Self::FIELDS {
            return Err(MatrixError::Shape {
                expected: Self::FIELDS,
                found: cols,
            });
        }
        let mut row = vec![0.0; cols];
        row[..Self::FIELDS].copy_from_slice(&[
            self.id as f64,
            self.in_event_col as f64,
            self.out_event_col as f64,
            self.dio_line as f64,
            self.sound_trig as f64,
            self.preamble,
            self.sustain,
            self.refraction,
        ]);
        Ok(row)
    }
}

/// Immutable, validated state matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMatrix {
    n_inputs: usize,
    n_outputs: usize,
    states: Vec<State>,
    extra_timers: Vec<ExtraTimer>,
    ready_state: usize,
    prepare_next_trial: Vec<usize>,
    schedule_waves: Vec<ScheduleWave>,
}

impl StateMatrix {
    /// Assemble and validate a matrix
    ///
    /// Fails if there are fewer than two rows, if any transition row does not
    /// have exactly `2·n_inputs + 1 + n_extra_timers` entries, or if any target
    /// or timer reference points outside the matrix.
    pub fn new(
        n_inputs: usize,
        n_outputs: usize,
        states: Vec<State>,
        extra_timers: Vec<ExtraTimer>,
    ) -> Result<Self, MatrixError> {
        let matrix = Self {
            n_inputs,
            n_outputs,
            states,
            extra_timers,
            ready_state: READY_STATE,
            prepare_next_trial: vec![READY_STATE],
            schedule_waves: Vec::new(),
        };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Builder method: replace the set of prepare-next-trial states
    pub fn with_prepare_next_trial(mut self, states: Vec<usize>) -> Self {
        self.prepare_next_trial = states;
        self
    }

    /// Builder method: attach schedule waves for the socket backend
    pub fn with_schedule_waves(mut self, waves: Vec<ScheduleWave>) -> Self {
        self.schedule_waves = waves;
        self
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn n_extra_timers(&self) -> usize {
        self.extra_timers.len()
    }

    pub fn ready_state(&self) -> usize {
        self.ready_state
    }

    pub fn prepare_next_trial(&self) -> &[usize] {
        &self.prepare_next_trial
    }

    pub fn schedule_waves(&self) -> &[ScheduleWave] {
        &self.schedule_waves
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn state(&self, id: usize) -> Option<&State> {
        self.states.get(id)
    }

    pub fn extra_timers(&self) -> &[ExtraTimer] {
        &self.extra_timers
    }

    /// Number of transition columns: `2·n_inputs + 1 + n_extra_timers`
    pub fn transition_width(&self) -> usize {
        transition_width(self.n_inputs, self.extra_timers.len())
    }

    /// Output columns in the wire table: one per line plus the serial column
    pub fn output_columns(&self) -> usize {
        self.n_outputs + 1
    }

    /// Full wire-table width
    pub fn wire_width(&self) -> usize {
        self.transition_width() + self.output_columns()
    }

    /// Event code of the self-timer column
    pub fn timer_event_code(&self) -> usize {
        2 * self.n_inputs
    }

    /// Event code fired when extra timer `index` expires
    pub fn extra_timer_code(&self, index: usize) -> usize {
        2 * self.n_inputs + 1 + index
    }

    /// Look up `matrix[state][code]`
    pub fn next_state(&self, state: usize, code: usize) -> Option<usize> {
        self.states.get(state)?.transitions.get(code).copied()
    }

    /// Self-timer duration of every state, in row order
    pub fn timers(&self) -> Vec<f64> {
        self.states.iter().map(|s| s.timer).collect()
    }

    /// Output pattern of every state, in row order
    pub fn output_patterns(&self) -> Vec<OutputPattern> {
        self.states.iter().map(|s| s.outputs.clone()).collect()
    }

    /// Arming state of every extra timer, in timer order
    pub fn extra_triggers(&self) -> Vec<Option<usize>> {
        self.extra_timers.iter().map(|t| t.trigger_state).collect()
    }

    /// Replace every state's self-timer
    pub(crate) fn replace_timers(&mut self, timers: &[f64]) -> Result<(), MatrixError> {
        expect_len(self.states.len(), timers.len())?;
        for (state, &timer) in self.states.iter().zip(timers) {
            check_timer(&state.name, timer)?;
        }
        for (state, &timer) in self.states.iter_mut().zip(timers) {
            state.timer = timer;
        }
        Ok(())
    }

    /// Replace every state's output pattern
    pub(crate) fn replace_outputs(&mut self, outputs: &[OutputPattern]) -> Result<(), MatrixError> {
        expect_len(self.states.len(), outputs.len())?;
        for pattern in outputs {
            expect_len(self.n_outputs, pattern.actions.len())?;
        }
        for (state, pattern) in self.states.iter_mut().zip(outputs) {
            state.outputs = pattern.clone();
        }
        Ok(())
    }

    /// Replace every extra timer's duration
    pub(crate) fn replace_extra_durations(&mut self, durations: &[f64]) -> Result<(), MatrixError> {
        expect_len(self.extra_timers.len(), durations.len())?;
        for (timer, &duration) in self.extra_timers.iter().zip(durations) {
            check_timer(&timer.name, duration)?;
        }
        for (timer, &duration) in self.extra_timers.iter_mut().zip(durations) {
            timer.duration = duration;
        }
        Ok(())
    }

    /// Replace every extra timer's arming state
    pub(crate) fn replace_extra_triggers(&mut self, triggers: &[Option<usize>]) -> Result<(), MatrixError> {
        expect_len(self.extra_timers.len(), triggers.len())?;
        let n_states = self.states.len();
        if let Some(&target) = triggers.iter().flatten().find(|&&t| t >= n_states) {
            return Err(MatrixError::TargetOutOfRange {
                state: target,
                code: 0,
                target,
            });
        }
        for (timer, &trigger) in self.extra_timers.iter_mut().zip(triggers) {
            timer.trigger_state = trigger;
        }
        for state in self.states.iter_mut() {
            state.arm_timers = triggers
                .iter()
                .enumerate()
                .filter(|(_, t)| **t == Some(state.id))
                .map(|(i, _)| i)
                .collect();
        }
        Ok(())
    }

    /// Check every structural invariant of the matrix
    pub fn validate(&self) -> Result<(), MatrixError> {
        let n_states = self.states.len();
        if n_states < 2 {
            return Err(MatrixError::TooFewRows {
                minimum: 2,
                found: n_states,
            });
        }

        let width = self.transition_width();
        for state in &self.states {
            if state.transitions.len() != width {
                return Err(MatrixError::RowWidth {
                    state: state.id,
                    expected: width,
                    found: state.transitions.len(),
                });
            }
            if let Some((code, &target)) = state
                .transitions
                .iter()
                .enumerate()
                .find(|(_, target)| **target >= n_states)
            {
                return Err(MatrixError::TargetOutOfRange {
                    state: state.id,
                    code,
                    target,
                });
            }
            if state.outputs.actions.len() != self.n_outputs {
                return Err(MatrixError::Shape {
                    expected: self.n_outputs,
                    found: state.outputs.actions.len(),
                });
            }
            check_timer(&state.name, state.timer)?;
        }

        for timer in &self.extra_timers {
            check_timer(&timer.name, timer.duration)?;
            if let Some(trigger) = timer.trigger_state {
                if trigger >= n_states {
                    return Err(MatrixError::TargetOutOfRange {
                        state: trigger,
                        code: 0,
                        target: trigger,
                    });
                }
            }
        }

        Ok(())
    }

    /// Dense numeric table shipped by the wire backends
    ///
    /// Columns: edge targets, self-timer target, extra-timer targets, one
    /// action code per output line, serial-output code.
    pub fn wire_table(&self) -> WireTable {
        let cols = self.wire_width();
        let mut table = WireTable::zeros(self.states.len(), cols);
        for (row, state) in self.states.iter().enumerate() {
            let mut col = 0;
            for &target in &state.transitions {
                table.set(row, col, target as f64);
                col += 1;
            }
            for action in &state.outputs.actions {
                table.set(row, col, action.code() as f64);
                col += 1;
            }
            table.set(row, col, state.outputs.serial_code() as f64);
        }
        table
    }

    /// Rebuild a matrix from its wire table and the separately uploaded timers
    ///
    /// State names are not carried on the wire and come back as `state_<id>`.
    pub fn from_wire_table(
        table: &WireTable,
        n_inputs: usize,
        n_outputs: usize,
        timers: &[f64],
        extra_timers: Vec<ExtraTimer>,
    ) -> Result<Self, MatrixError> {
        let width = transition_width(n_inputs, extra_timers.len());
        check_shape(table.cols(), n_inputs, extra_timers.len(), n_outputs)?;
        if timers.len() != table.rows() {
            return Err(MatrixError::Shape {
                expected: table.rows(),
                found: timers.len(),
            });
        }

        let mut states = Vec::with_capacity(table.rows());
        for (id, timer) in timers.iter().enumerate() {
            let row = table.row(id);
            let transitions = row[..width]
                .iter()
                .enumerate()
                .map(|(col, &value)| integer_cell(id, col, value, u32::MAX as f64).map(|v| v as usize))
                .collect::<Result<Vec<_>, _>>()?;
            let mut actions = Vec::with_capacity(n_outputs);
            for (offset, &value) in row[width..width + n_outputs].iter().enumerate() {
                let col = width + offset;
                let code = integer_cell(id, col, value, u8::MAX as f64)? as u8;
                let action = OutputAction::from_code(code).ok_or(MatrixError::CellOutOfRange { row: id, col, value })?;
                actions.push(action);
            }
            let serial = integer_cell(id, width + n_outputs, row[width + n_outputs], u8::MAX as f64)? as u8;
            let arm_timers = extra_timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.trigger_state == Some(id))
                .map(|(i, _)| i)
                .collect();
            states.push(State {
                id,
                name: format!("state_{}", id),
                timer: *timer,
                transitions,
                outputs: OutputPattern {
                    actions,
                    serial_out: (serial != 0).then_some(serial),
                },
                arm_timers,
            });
        }

        Self::new(n_inputs, n_outputs, states, extra_timers)
    }
}

/// Number of transition columns for the given sizes
pub fn transition_width(n_inputs: usize, n_extra_timers: usize) -> usize {
    2 * n_inputs + 1 + n_extra_timers
}

/// Verify a wire-table width against the configured controller sizes
///
/// The expected width is `2·n_inputs + 1 + n_extra_timers + n_outputs + 1`
/// (the final output column carries the serial-output code).
pub fn check_shape(
    cols: usize,
    n_inputs: usize,
    n_extra_timers: usize,
    n_outputs: usize,
) -> Result<(), MatrixError> {
    let expected = transition_width(n_inputs, n_extra_timers) + n_outputs + 1;
    if cols != expected {
        return Err(MatrixError::Shape {
            expected,
            found: cols,
        });
    }
    Ok(())
}

/// Cell value that must be a whole number in `0..=max`
fn integer_cell(row: usize, col: usize, value: f64, max: f64) -> Result<f64, MatrixError> {
    if value.fract() != 0.0 || !(0.0..=max).contains(&value) {
        return Err(MatrixError::CellOutOfRange { row, col, value });
    }
    Ok(value)
}

fn expect_len(expected: usize, found: usize) -> Result<(), MatrixError> {
    if expected != found {
        return Err(MatrixError::Shape { expected, found });
    }
    Ok(())
}

fn check_timer(what: &str, value: f64) -> Result<(), MatrixError> {
    if !value.is_finite() || value < 0.0 {
        return Err(MatrixError::InvalidTimer {
            what: what.to_string(),
            value,
        });
    }
    Ok(())
}

/// Row-major table of numeric cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTable {
    rows: usize,
    cols: usize,
    cells: Vec<f64>,
}

impl WireTable {
    /// Table of the given shape filled with zeros
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![0.0; rows * cols],
        }
    }

    /// Build a table from row vectors; every row must have `cols` entries
    pub fn from_rows(rows: Vec<Vec<f64>>, cols: usize) -> Result<Self, MatrixError> {
        let mut table = Self::zeros(rows.len(), cols);
        for (r, row) in rows.into_iter().enumerate() {
            if row.len() != cols {
                return Err(MatrixError::Shape {
                    expected: cols,
                    found: row.len(),
                });
            }
            table.cells[r * cols..(r + 1) * cols].copy_from_slice(&row);
        }
        Ok(table)
    }

    /// Build a table from cells listed column by column
    pub fn from_column_major(rows: usize, cols: usize, values: &[f64]) -> Result<Self, MatrixError> {
        if values.len() != rows * cols {
            return Err(MatrixError::Shape {
                expected: rows * cols,
                found: values.len(),
            });
        }
        let mut table = Self::zeros(rows, cols);
        for c in 0..cols {
            for r in 0..rows {
                table.set(r, c, values[c * rows + r]);
            }
        }
        Ok(table)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.cells[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.cells[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.cells[row * self.cols..(row + 1) * self.cols]
    }

    /// Append a row of exactly `cols` cells
    pub fn push_row(&mut self, row: &[f64]) -> Result<(), MatrixError> {
        if row.len() != self.cols {
            return Err(MatrixError::Shape {
                expected: self.cols,
                found: row.len(),
            });
        }
        self.cells.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    /// Cells listed column by column
    pub fn column_major(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.cells.len());
        for c in 0..self.cols {
            for r in 0..self.rows {
                values.push(self.get(r, c));
            }
        }
        values
    }

    /// Cells as bytes for the serial protocol, restricted to the given columns
    ///
    /// Every value must be an integer in `0..=255`.
    pub fn byte_cells(&self, cols: std::ops::Range<usize>) -> Result<Vec<u8>, MatrixError> {
        let mut bytes = Vec::with_capacity(self.rows * cols.len());
        for r in 0..self.rows {
            for c in cols.clone() {
                let value = self.get(r, c);
                if value.fract() != 0.0 || !(0.0..=255.0).contains(&value) {
                    return Err(MatrixError::CellOutOfRange { row: r, col: c, value });
                }
                bytes.push(value as u8);
            }
        }
        Ok(bytes)
    }
}
