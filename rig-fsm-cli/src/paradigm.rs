//! Paradigm driven entirely by the session file
//!
//! Every trial runs the same matrix. Between trials the paradigm reports the
//! trial that just ended, re-uploads the matrix and starts the next one.

use crate::config::ParadigmConfig;
use crate::report::{format_summary, OutputFormat, TrialSummary};
use rig_fsm::builder::StateSpec;
use rig_fsm::dispatcher::{Dispatcher, DispatcherError, Paradigm, Result};
use rig_fsm::{StateMatrix, StateMatrixBuilder};

pub struct ConfigParadigm {
    matrix: StateMatrix,
    format: OutputFormat,
    summaries: Vec<TrialSummary>,
}

impl ConfigParadigm {
    /// Resolve the configured states into a matrix
    pub fn new(config: &ParadigmConfig, format: OutputFormat) -> Result<Self> {
        let matrix = build_matrix(config)?;
        log::info!(
            "Paradigm '{}': {} states, {} extra timers",
            config.name,
            matrix.n_states(),
            matrix.n_extra_timers()
        );
        Ok(Self {
            matrix,
            format,
            summaries: Vec::new(),
        })
    }

    pub fn matrix(&self) -> &StateMatrix {
        &self.matrix
    }

    pub fn summaries(&self) -> &[TrialSummary] {
        &self.summaries
    }

    fn report(&mut self, dispatcher: &Dispatcher, trial: usize) -> Result<()> {
        let events = dispatcher.events_for_trial(trial)?;
        let end_time = dispatcher
            .boundaries()
            .get(trial)
            .and_then(|&b| dispatcher.events().get(b))
            .map_or(dispatcher.server_time(), |e| e.timestamp);
        let summary = TrialSummary::from_events(trial, events, end_time, &self.matrix);
        println!("{}", format_summary(&summary, self.format));
        self.summaries.push(summary);
        Ok(())
    }
}

impl Paradigm for ConfigParadigm {
    fn prepare_next_trial(&mut self, dispatcher: &mut Dispatcher, next_trial: usize) -> Result<()> {
        if next_trial > 0 {
            self.report(dispatcher, next_trial - 1)?;
        }
        dispatcher.load_matrix(&self.matrix)?;
        dispatcher.ready_to_start_trial()
    }
}

/// Build the numeric matrix from the named states
pub fn build_matrix(config: &ParadigmConfig) -> Result<StateMatrix> {
    let inputs: Vec<&str> = config.inputs.iter().map(String::as_str).collect();
    let outputs: Vec<&str> = config.outputs.iter().map(String::as_str).collect();
    let mut builder = StateMatrixBuilder::new(&inputs, &outputs);

    for timer in &config.extra_timers {
        builder.add_extra_timer(&timer.name, timer.duration)?;
    }
    for state in &config.states {
        let mut spec = StateSpec::new(&state.name);
        if let Some(timer) = state.timer {
            spec = spec.timer(timer);
        }
        for (event, target) in &state.transitions {
            spec = spec.on(event, target);
        }
        spec.outputs_on = state.outputs_on.clone();
        spec.outputs_off = state.outputs_off.clone();
        spec.serial_out = state.serial_out;
        spec.arm_timers = state.arm.clone();
        builder.add_state(spec)?;
    }
    if !config.prepare_next_trial.is_empty() {
        let mut names = vec![rig_fsm::builder::READY_STATE_NAME];
        names.extend(config.prepare_next_trial.iter().map(String::as_str));
        builder.set_prepare_next_trial(&names)?;
    }

    builder.build().map_err(DispatcherError::from)
}
