//! Named-state authoring for state matrices
//!
//! Paradigm code describes a trial as named states with named transitions
//! (`"Cin" -> "reward"`), named outputs and named extra timers. The builder
//! resolves every name to a dense integer index and produces a validated
//! [`StateMatrix`]. The name table lives only here; the runtime matrix is purely
//! numeric.
//!
//! Two rows always exist: state 0 (trial-end sentinel, jumps to the ready state
//! almost immediately) and the ready state, where the controller idles until the
//! dispatcher starts the next trial.
//!
//! # Example
//!
//! ```
//! use rig_fsm::builder::{StateMatrixBuilder, StateSpec, END_TRIAL};
//!
//! let mut builder = StateMatrixBuilder::new(&["C"], &["CenterLED"]);
//! builder.add_extra_timer("session_timeout", 30.0).unwrap();
//! builder
//!     .add_state(
//!         StateSpec::new("wait_for_poke")
//!             .outputs_on(&["CenterLED"])
//!             .on("Cin", "reward")
//!             .arm(&["session_timeout"]),
//!     )
//!     .unwrap();
//! builder
//!     .add_state(StateSpec::new("reward").timer(0.1).on("Tup", END_TRIAL))
//!     .unwrap();
//! let matrix = builder.build().unwrap();
//! assert_eq!(matrix.n_states(), 4);
//! ```

use crate::matrix::{
    transition_width, ExtraTimer, OutputPattern, ScheduleWave, State, StateMatrix, READY_STATE, STATE_0,
};
use crate::types::{BuilderError, OutputAction};
use std::collections::HashMap;

/// Name of state 0
pub const STATE_0_NAME: &str = "_state_0";

/// Name of the reserved ready state
pub const READY_STATE_NAME: &str = "ready_next_trial";

/// Transition target that ends the current trial
pub const END_TRIAL: &str = STATE_0_NAME;

/// Name of the self-timer event
pub const TIMER_EVENT: &str = "Tup";

/// Timer of state 0: short enough to move on to the ready state immediately
pub const STATE_0_TIMER: f64 = 0.001;

/// Timer used for states that should never time out on their own
pub const DEFAULT_TIMER: f64 = 1e6;

/// Result type for builder operations
pub type Result<T> = std::result::Result<T, BuilderError>;

/// Description of one state, consumed by [`StateMatrixBuilder::add_state`]
#[derive(Debug, Clone, PartialEq)]
pub struct StateSpec {
    pub name: String,
    pub timer: f64,
    /// (event name, target state name)
    pub transitions: Vec<(String, String)>,
    pub outputs_on: Vec<String>,
    pub outputs_off: Vec<String>,
    pub serial_out: Option<u8>,
    pub arm_timers: Vec<String>,
}

impl StateSpec {
    /// Create a spec with no transitions and the default (very long) timer
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timer: DEFAULT_TIMER,
            transitions: Vec::new(),
            outputs_on: Vec::new(),
            outputs_off: Vec::new(),
            serial_out: None,
            arm_timers: Vec::new(),
        }
    }

    /// Builder method: self-timer duration in seconds
    pub fn timer(mut self, seconds: f64) -> Self {
        self.timer = seconds;
        self
    }

    /// Builder method: jump to `target` when `event` fires
    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.transitions.push((event.into(), target.into()));
        self
    }

    /// Builder method: outputs switched on when the state is entered
    pub fn outputs_on(mut self, names: &[&str]) -> Self {
        self.outputs_on.extend(names.iter().map(|s| s.to_string()));
        self
    }

    /// Builder method: outputs switched off when the state is entered
    pub fn outputs_off(mut self, names: &[&str]) -> Self {
        self.outputs_off.extend(names.iter().map(|s| s.to_string()));
        self
    }

    /// Builder method: serial-output code emitted on entry
    pub fn serial_out(mut self, code: u8) -> Self {
        self.serial_out = Some(code);
        self
    }

    /// Builder method: extra timers armed on entry
    pub fn arm(mut self, timers: &[&str]) -> Self {
        self.arm_timers.extend(timers.iter().map(|s| s.to_string()));
        self
    }
}

/// Turns named states into a [`StateMatrix`]
#[derive(Debug, Clone)]
pub struct StateMatrixBuilder {
    input_names: Vec<String>,
    output_names: Vec<String>,
    extra_timers: Vec<ExtraTimer>,
    state_ids: HashMap<String, usize>,
    rows: Vec<State>,
    /// Whether each row was authored explicitly (implicit targets are not)
    defined: Vec<bool>,
    prepare_next_trial: Vec<usize>,
    schedule_waves: Vec<ScheduleWave>,
}

impl StateMatrixBuilder {
    /// Create a builder for the given input and output line names
    pub fn new(inputs: &[&str], outputs: &[&str]) -> Self {
        let mut builder = Self {
            input_names: inputs.iter().map(|s| s.to_string()).collect(),
            output_names: outputs.iter().map(|s| s.to_string()).collect(),
            extra_timers: Vec::new(),
            state_ids: HashMap::new(),
            rows: Vec::new(),
            defined: Vec::new(),
            prepare_next_trial: vec![READY_STATE],
            schedule_waves: Vec::new(),
        };
        builder.bootstrap();
        builder
    }

    pub fn n_inputs(&self) -> usize {
        self.input_names.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.output_names.len()
    }

    /// Transition columns per row for the current configuration
    pub fn row_width(&self) -> usize {
        transition_width(self.input_names.len(), self.extra_timers.len())
    }

    /// Number of rows authored on top of the two bootstrap rows
    pub fn authored_rows(&self) -> usize {
        self.rows.len() - 2
    }

    /// ID of a named state, if it exists
    pub fn state_id(&self, name: &str) -> Option<usize> {
        self.state_ids.get(name).copied()
    }

    /// Resolve an event name to its column
    ///
    /// `<input>in` / `<input>out` are the rising and falling edges of an input
    /// line, `Tup` is the self-timer and an extra timer's name is its expiry.
    pub fn event_code(&self, event: &str) -> Result<usize> {
        let n_inputs = self.input_names.len();
        if event == TIMER_EVENT {
            return Ok(2 * n_inputs);
        }
        for (line, name) in self.input_names.iter().enumerate() {
            if let Some(edge) = event.strip_prefix(name.as_str()) {
                match edge {
                    "in" => return Ok(2 * line),
                    "out" => return Ok(2 * line + 1),
                    _ => {}
                }
            }
        }
        if let Some(index) = self.timer_index(event) {
            return Ok(2 * n_inputs + 1 + index);
        }
        Err(BuilderError::UnknownEvent(event.to_string()))
    }

    /// Register an extra timer; its expiry becomes an event named after it
    ///
    /// Adding a timer widens every row, so it is only allowed while no states
    /// have been authored.
    pub fn add_extra_timer(&mut self, name: &str, duration: f64) -> Result<usize> {
        if self.timer_index(name).is_some() {
            return Err(BuilderError::DuplicateName(name.to_string()));
        }
        self.ensure_resizable()?;
        self.extra_timers.push(ExtraTimer::new(name, duration));
        self.bootstrap();
        Ok(self.extra_timers.len() - 1)
    }

    /// Change an extra timer's duration (row width is unaffected)
    pub fn set_extra_timer_duration(&mut self, name: &str, duration: f64) -> Result<()> {
        let index = self
            .timer_index(name)
            .ok_or_else(|| BuilderError::UnknownTimer(name.to_string()))?;
        self.extra_timers[index].duration = duration;
        Ok(())
    }

    /// Replace the input lines; fails loudly if authored rows would go stale
    pub fn set_inputs(&mut self, inputs: &[&str]) -> Result<()> {
        self.ensure_resizable()?;
        self.input_names = inputs.iter().map(|s| s.to_string()).collect();
        self.bootstrap();
        Ok(())
    }

    /// Replace the output lines; fails loudly if authored rows would go stale
    pub fn set_outputs(&mut self, outputs: &[&str]) -> Result<()> {
        self.ensure_resizable()?;
        self.output_names = outputs.iter().map(|s| s.to_string()).collect();
        self.bootstrap();
        Ok(())
    }

    /// Replace all extra timers; fails loudly if authored rows would go stale
    pub fn set_extra_timers(&mut self, timers: &[(&str, f64)]) -> Result<()> {
        self.ensure_resizable()?;
        self.extra_timers = timers
            .iter()
            .map(|(name, duration)| ExtraTimer::new(*name, *duration))
            .collect();
        self.bootstrap();
        Ok(())
    }

    /// States whose entry tells the dispatcher to prepare the next trial
    pub fn set_prepare_next_trial(&mut self, names: &[&str]) -> Result<()> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let id = self
                .state_id(name)
                .ok_or_else(|| BuilderError::UndefinedState(name.to_string()))?;
            ids.push(id);
        }
        self.prepare_next_trial = ids;
        Ok(())
    }

    /// Attach a schedule wave (socket backend only)
    pub fn add_schedule_wave(&mut self, wave: ScheduleWave) {
        self.schedule_waves.push(wave);
    }

    /// Add or redefine a state
    ///
    /// A new name gets the next free ID; re-adding a name keeps its ID. Every
    /// event self-loops unless overridden by the spec, and target names that do
    /// not exist yet are created with a default row.
    pub fn add_state(&mut self, spec: StateSpec) -> Result<usize> {
        if spec.name == STATE_0_NAME || spec.name == READY_STATE_NAME {
            return Err(BuilderError::ReservedState(spec.name));
        }

        // Resolve every name before touching the table so a bad spec leaves no trace
        let mut resolved = Vec::with_capacity(spec.transitions.len());
        for (event, target) in &spec.transitions {
            resolved.push((self.event_code(event)?, target.as_str()));
        }
        let mut actions = vec![OutputAction::Unchanged; self.output_names.len()];
        for (names, action) in [(&spec.outputs_on, OutputAction::On), (&spec.outputs_off, OutputAction::Off)] {
            for name in names {
                let line = self
                    .output_names
                    .iter()
                    .position(|o| o == name)
                    .ok_or_else(|| BuilderError::UnknownOutput(name.clone()))?;
                actions[line] = action;
            }
        }
        let mut arm = Vec::with_capacity(spec.arm_timers.len());
        for timer in &spec.arm_timers {
            let index = self
                .timer_index(timer)
                .ok_or_else(|| BuilderError::UnknownTimer(timer.clone()))?;
            if let Some(owner) = self.extra_timers[index].trigger_state {
                if self.rows[owner].name != spec.name {
                    return Err(BuilderError::TimerArmedTwice {
                        timer: timer.clone(),
                        first: self.rows[owner].name.clone(),
                        second: spec.name.clone(),
                    });
                }
            }
            arm.push(index);
        }

        let id = self.get_or_create(&spec.name);
        let mut row = State::self_looping(id, &spec.name, self.row_width(), self.output_names.len(), spec.timer);
        for (code, target) in resolved {
            row.transitions[code] = self.get_or_create(target);
        }
        row.outputs = OutputPattern {
            actions,
            serial_out: spec.serial_out,
        };

        // A redefinition replaces the old arming list
        for timer in self.extra_timers.iter_mut() {
            if timer.trigger_state == Some(id) {
                timer.trigger_state = None;
            }
        }
        for &index in &arm {
            self.extra_timers[index].trigger_state = Some(id);
        }
        row.arm_timers = arm;

        log::trace!("State '{}' -> id {}", spec.name, id);
        self.rows[id] = row;
        self.defined[id] = true;
        Ok(id)
    }

    /// Drop every authored state, keeping state 0 and the ready state
    pub fn reset(&mut self) {
        self.rows.truncate(2);
        self.defined.truncate(2);
        self.state_ids.retain(|_, id| *id < 2);
        for timer in self.extra_timers.iter_mut() {
            timer.trigger_state = None;
        }
        self.prepare_next_trial = vec![READY_STATE];
        self.schedule_waves.clear();
    }

    /// Validate and produce the numeric matrix
    pub fn build(&self) -> Result<StateMatrix> {
        for (row, defined) in self.rows.iter().zip(&self.defined) {
            if !defined {
                log::warn!(
                    "State '{}' (id {}) is a transition target but was never defined; it self-loops forever",
                    row.name,
                    row.id
                );
            }
        }

        let matrix = StateMatrix::new(
            self.input_names.len(),
            self.output_names.len(),
            self.rows.clone(),
            self.extra_timers.clone(),
        )?
        .with_prepare_next_trial(self.prepare_next_trial.clone())
        .with_schedule_waves(self.schedule_waves.clone());

        log::debug!(
            "Built state matrix: {} states, {} transition columns",
            matrix.n_states(),
            matrix.transition_width()
        );
        Ok(matrix)
    }

    fn timer_index(&self, name: &str) -> Option<usize> {
        self.extra_timers.iter().position(|t| t.name == name)
    }

    fn ensure_resizable(&self) -> Result<()> {
        match self.authored_rows() {
            0 => Ok(()),
            n => Err(BuilderError::StaleRows(n)),
        }
    }

    fn get_or_create(&mut self, name: &str) -> usize {
        if let Some(&id) = self.state_ids.get(name) {
            return id;
        }
        let id = self.rows.len();
        debug_assert_ne!(id, READY_STATE, "ready state ID must never be auto-assigned");
        self.rows.push(State::self_looping(
            id,
            name,
            self.row_width(),
            self.output_names.len(),
            DEFAULT_TIMER,
        ));
        self.defined.push(false);
        self.state_ids.insert(name.to_string(), id);
        id
    }

    /// (Re)create the two bootstrap rows at the current width
    fn bootstrap(&mut self) {
        let width = self.row_width();
        let n_outputs = self.output_names.len();

        let mut state_0 = State::self_looping(STATE_0, STATE_0_NAME, width, n_outputs, STATE_0_TIMER);
        state_0.transitions[2 * self.input_names.len()] = READY_STATE;
        let ready = State::self_looping(READY_STATE, READY_STATE_NAME, width, n_outputs, DEFAULT_TIMER);

        self.rows = vec![state_0, ready];
        self.defined = vec![true, true];
        self.state_ids.clear();
        self.state_ids.insert(STATE_0_NAME.to_string(), STATE_0);
        self.state_ids.insert(READY_STATE_NAME.to_string(), READY_STATE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::TRIAL_START_STATE;

    fn builder() -> StateMatrixBuilder {
        let mut builder = StateMatrixBuilder::new(&["C", "L", "R"], &["CenterLED", "LeftWater"]);
        builder.add_extra_timer("timeout", 5.0).unwrap();
        builder
    }

    #[test]
    fn test_bootstrap_rows() {
        let matrix = builder().build().unwrap();
        assert_eq!(matrix.n_states(), 2);
        assert_eq!(matrix.state(STATE_0).unwrap().timer, STATE_0_TIMER);
        assert_eq!(matrix.next_state(STATE_0, matrix.timer_event_code()), Some(READY_STATE));
        assert_eq!(matrix.next_state(READY_STATE, 0), Some(READY_STATE));
    }

    #[test]
    fn test_row_width_for_every_row() {
        let mut b = builder();
        b.add_state(StateSpec::new("wait").on("Cin", "reward").on("timeout", END_TRIAL))
            .unwrap();
        b.add_state(StateSpec::new("reward").timer(0.2).on("Tup", END_TRIAL)).unwrap();
        let matrix = b.build().unwrap();
        // 3 inputs * 2 + Tup + 1 extra timer
        assert_eq!(matrix.transition_width(), 8);
        for state in matrix.states() {
            assert_eq!(state.transitions.len(), 2 * 3 + 1 + 1);
        }
    }

    #[test]
    fn test_event_names() {
        let b = builder();
        assert_eq!(b.event_code("Cin").unwrap(), 0);
        assert_eq!(b.event_code("Cout").unwrap(), 1);
        assert_eq!(b.event_code("Rout").unwrap(), 5);
        assert_eq!(b.event_code("Tup").unwrap(), 6);
        assert_eq!(b.event_code("timeout").unwrap(), 7);
        assert_eq!(
            b.event_code("Xin").unwrap_err(),
            BuilderError::UnknownEvent("Xin".to_string())
        );
    }

    #[test]
    fn test_idempotent_numbering() {
        let mut b = builder();
        let first = b.add_state(StateSpec::new("wait").on("Cin", "reward")).unwrap();
        let again = b.add_state(StateSpec::new("wait").on("Lin", "reward")).unwrap();
        assert_eq!(first, again);
        assert_eq!(first, TRIAL_START_STATE);
        // "reward" was created implicitly by the first call and kept its ID
        assert_eq!(b.state_id("reward"), Some(3));
        assert_eq!(b.authored_rows(), 2);

        // The redefinition replaced the row: Cin self-loops again
        let matrix = b.build().unwrap();
        assert_eq!(matrix.next_state(first, 0), Some(first));
        assert_eq!(matrix.next_state(first, 2), Some(3));
    }

    #[test]
    fn test_ready_id_never_auto_assigned() {
        let mut b = builder();
        for i in 0..10 {
            let id = b.add_state(StateSpec::new(format!("s{}", i))).unwrap();
            assert_ne!(id, READY_STATE);
            assert_ne!(id, STATE_0);
        }
    }

    #[test]
    fn test_reserved_names_rejected() {
        let mut b = builder();
        assert!(matches!(
            b.add_state(StateSpec::new(READY_STATE_NAME)),
            Err(BuilderError::ReservedState(_))
        ));
        assert!(matches!(
            b.add_state(StateSpec::new(STATE_0_NAME)),
            Err(BuilderError::ReservedState(_))
        ));
    }

    #[test]
    fn test_outputs_and_serial_code() {
        let mut b = builder();
        let id = b
            .add_state(
                StateSpec::new("cue")
                    .outputs_on(&["CenterLED"])
                    .outputs_off(&["LeftWater"])
                    .serial_out(7),
            )
            .unwrap();
        let matrix = b.build().unwrap();
        let outputs = &matrix.state(id).unwrap().outputs;
        assert_eq!(outputs.actions, vec![OutputAction::On, OutputAction::Off]);
        assert_eq!(outputs.serial_out, Some(7));

        let err = b.add_state(StateSpec::new("bad").outputs_on(&["Laser"])).unwrap_err();
        assert_eq!(err, BuilderError::UnknownOutput("Laser".to_string()));
        // The failed spec did not allocate a state
        assert_eq!(b.state_id("bad"), None);
    }

    #[test]
    fn test_arm_timers() {
        let mut b = builder();
        let id = b.add_state(StateSpec::new("wait").arm(&["timeout"])).unwrap();
        let matrix = b.build().unwrap();
        assert_eq!(matrix.extra_timers()[0].trigger_state, Some(id));
        assert_eq!(matrix.state(id).unwrap().arm_timers, vec![0]);

        let err = b.add_state(StateSpec::new("other").arm(&["timeout"])).unwrap_err();
        assert!(matches!(err, BuilderError::TimerArmedTwice { .. }));
    }

    #[test]
    fn test_resize_with_authored_rows_fails_loudly() {
        let mut b = builder();
        b.add_state(StateSpec::new("wait")).unwrap();
        assert_eq!(b.set_inputs(&["C"]).unwrap_err(), BuilderError::StaleRows(1));
        assert_eq!(b.add_extra_timer("t2", 1.0).unwrap_err(), BuilderError::StaleRows(1));
        // Width is unchanged after the failed resize
        assert_eq!(b.row_width(), 8);

        b.reset();
        b.set_inputs(&["C"]).unwrap();
        assert_eq!(b.row_width(), 2 + 1 + 1);
        let matrix = b.build().unwrap();
        assert_eq!(matrix.n_states(), 2);
    }

    #[test]
    fn test_reset_keeps_bootstrap_rows() {
        let mut b = builder();
        b.add_state(StateSpec::new("wait").arm(&["timeout"])).unwrap();
        b.reset();
        assert_eq!(b.authored_rows(), 0);
        assert_eq!(b.state_id("wait"), None);
        assert_eq!(b.state_id(READY_STATE_NAME), Some(READY_STATE));
        let id = b.add_state(StateSpec::new("again")).unwrap();
        assert_eq!(id, TRIAL_START_STATE);
        assert_eq!(b.build().unwrap().extra_timers()[0].trigger_state, None);
    }

    #[test]
    fn test_prepare_next_trial_states() {
        let mut b = builder();
        b.add_state(StateSpec::new("iti")).unwrap();
        b.set_prepare_next_trial(&["iti", READY_STATE_NAME]).unwrap();
        let matrix = b.build().unwrap();
        assert_eq!(matrix.prepare_next_trial(), &[TRIAL_START_STATE, READY_STATE]);
        assert!(b.set_prepare_next_trial(&["missing"]).is_err());
    }
}
