//! Deterministic state machine core
//!
//! [`FsmCore`] executes a [`StateMatrix`] the way the controller firmware does,
//! but driven by explicit timestamps instead of a hardware clock. Every call to
//! [`FsmCore::cycle`] is one controller cycle:
//!
//! 1. diff the sampled inputs against the previous sample and queue edge events
//! 2. queue the self-timer event if the active state's timer has elapsed
//! 3. queue every armed extra timer past its deadline and disarm it
//! 4. drain the queue in FIFO order through `matrix[current][code]`
//! 5. on every state change, run enter-state (arm timers, outputs, serial code)

use super::sink::SideEffect;
use crate::matrix::{StateMatrix, STATE_0};
use crate::types::{Event, FORCED_JUMP};
use std::collections::VecDeque;

/// Software state machine executing one matrix
#[derive(Debug, Clone)]
pub struct FsmCore {
    matrix: StateMatrix,
    current: usize,
    state_entered_at: f64,
    running: bool,
    inputs: Vec<bool>,
    outputs: Vec<bool>,
    /// Expiry time of every armed extra timer
    deadlines: Vec<Option<f64>>,
    queue: VecDeque<usize>,
    events: Vec<Event>,
    effects: Vec<SideEffect>,
}

impl FsmCore {
    /// Create a halted machine sitting in state 0 with every output low
    pub fn new(matrix: StateMatrix) -> Self {
        let n_inputs = matrix.n_inputs();
        let n_outputs = matrix.n_outputs();
        let n_timers = matrix.n_extra_timers();
        Self {
            matrix,
            current: STATE_0,
            state_entered_at: 0.0,
            running: false,
            inputs: vec![false; n_inputs],
            outputs: vec![false; n_outputs],
            deadlines: vec![None; n_timers],
            queue: VecDeque::new(),
            events: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn matrix(&self) -> &StateMatrix {
        &self.matrix
    }

    pub(crate) fn matrix_mut(&mut self) -> &mut StateMatrix {
        &mut self.matrix
    }

    /// Swap in a new matrix, keeping the current state when it still exists
    ///
    /// Armed extra timers are cleared if the number of timers changed.
    pub fn load_matrix(&mut self, matrix: StateMatrix) {
        if matrix.n_extra_timers() != self.deadlines.len() {
            self.deadlines = vec![None; matrix.n_extra_timers()];
        }
        self.inputs.resize(matrix.n_inputs(), false);
        self.outputs.resize(matrix.n_outputs(), false);
        if self.current >= matrix.n_states() {
            self.current = STATE_0;
        }
        self.matrix = matrix;
    }

    pub fn current_state(&self) -> usize {
        self.current
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn outputs(&self) -> &[bool] {
        &self.outputs
    }

    /// Start executing; the active state's timer restarts at `now`
    pub fn start(&mut self, now: f64) {
        if !self.running {
            self.running = true;
            self.state_entered_at = now;
        }
    }

    pub fn halt(&mut self) {
        self.running = false;
    }

    /// Run one controller cycle at time `now` with the given input sample
    ///
    /// While halted the input sample is still recorded, so edges that happen
    /// during a pause do not fire on resume.
    pub fn cycle(&mut self, now: f64, inputs: &[bool]) {
        let n_inputs = self.inputs.len().min(inputs.len());
        if !self.running {
            self.inputs[..n_inputs].copy_from_slice(&inputs[..n_inputs]);
            return;
        }

        // (i) edges, in line order
        for line in 0..n_inputs {
            if inputs[line] != self.inputs[line] {
                let code = if inputs[line] { 2 * line } else { 2 * line + 1 };
                self.queue.push_back(code);
                self.inputs[line] = inputs[line];
            }
        }

        // (ii) self-timer of the active state
        let timer = self.matrix.state(self.current).map(|s| s.timer).unwrap_or(f64::INFINITY);
        if now - self.state_entered_at >= timer {
            self.queue.push_back(self.matrix.timer_event_code());
        }

        // (iii) extra timers
        for index in 0..self.deadlines.len() {
            if let Some(deadline) = self.deadlines[index] {
                if now >= deadline {
                    self.deadlines[index] = None;
                    self.queue.push_back(self.matrix.extra_timer_code(index));
                }
            }
        }

        // (iv) drain in FIFO order
        while let Some(code) = self.queue.pop_front() {
            let next = match self.matrix.next_state(self.current, code) {
                Some(next) => next,
                None => {
                    log::warn!("Event code {} has no column in state {}", code, self.current);
                    continue;
                }
            };
            self.events.push(Event::new(now, code as i32, next));

            if next != self.current {
                // (v)
                self.enter_state(next, now);
            } else if code == self.matrix.timer_event_code() {
                // A self-looping timer restarts instead of firing every cycle
                self.state_entered_at = now;
            }
        }
    }

    /// Jump to `state` from outside the matrix
    ///
    /// Recorded with code -1. Enter-state side effects run even when halted.
    pub fn force_state(&mut self, state: usize, now: f64) -> bool {
        if state >= self.matrix.n_states() {
            return false;
        }
        self.queue.clear();
        self.events.push(Event::new(now, FORCED_JUMP, state));
        self.enter_state(state, now);
        true
    }

    /// Drive an output line directly
    pub fn force_output(&mut self, line: usize, value: bool, now: f64) -> bool {
        match self.outputs.get_mut(line) {
            Some(current) => {
                if *current != value {
                    *current = value;
                    self.effects.push(SideEffect::Output { line, value, time: now });
                }
                true
            }
            None => false,
        }
    }

    /// Events recorded since the previous call
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Side effects produced since the previous call
    pub fn take_effects(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.effects)
    }

    fn enter_state(&mut self, state: usize, now: f64) {
        self.current = state;
        self.state_entered_at = now;

        for (index, timer) in self.matrix.extra_timers().iter().enumerate() {
            if timer.trigger_state == Some(state) {
                self.deadlines[index] = Some(now + timer.duration);
            }
        }

        let Some(entered) = self.matrix.state(state) else {
            return;
        };
        for (line, action) in entered.outputs.actions.iter().enumerate() {
            let value = action.apply(self.outputs[line]);
            if value != self.outputs[line] {
                self.outputs[line] = value;
                self.effects.push(SideEffect::Output { line, value, time: now });
            }
        }
        if let Some(code) = entered.outputs.serial_out {
            self.effects.push(SideEffect::Serial { code, time: now });
        }
    }
}
