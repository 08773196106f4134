//! Trial lifecycle on top of any state machine backend
//!
//! The [`Dispatcher`] polls a [`StateMachineClient`] at a fixed period and keeps
//! the session's append-only event log. Trials are delimited by the state
//! machine itself: a trial ends with a jump to state 0, the bootstrap row then
//! moves on to the "ready" state, and reaching any prepare-next-trial state
//! hands control back to the paradigm. At that point the dispatcher records the
//! index of the closing state-0 event as a trial boundary and notifies
//! observers. The paradigm uploads the next matrix and calls
//! [`Dispatcher::ready_to_start_trial`], which force-jumps into the trial-start
//! state.
//!
//! All log and trial-counter mutation happens inside [`Dispatcher::poll_cycle`],
//! which takes `&mut self` and therefore cannot be reentered.

use crate::client::StateMachineClient;
use crate::config::DispatcherConfig;
use crate::matrix::{StateMatrix, STATE_0};
use crate::ticker::Ticker;
use crate::types::{BuilderError, ClientError, Event};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::mpsc::Sender;
use thiserror::Error;

/// Errors raised by the dispatcher
#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error("Trial {trial} is not complete ({completed} trials completed)")]
    TrialIncomplete { trial: usize, completed: usize },

    #[error("Dispatcher is not running")]
    NotRunning,

    #[error("Trial {0} is still running")]
    TrialInProgress(usize),

    #[error("Paradigm error: {0}")]
    Paradigm(String),
}

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatcherError>;

/// Snapshot reported after every poll
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tick {
    /// Backend time in seconds
    pub server_time: f64,
    pub state: usize,
    /// Length of the event log
    pub event_count: usize,
    /// Current trial (None before the first trial starts)
    pub trial: Option<usize>,
}

/// Notification delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherEvent {
    Tick(Tick),
    /// The machine is waiting in a prepare-next-trial state
    PrepareNextTrial {
        next_trial: usize,
        /// Log index of the state-0 event that closed the previous trial. For
        /// the first trial, the last state-0 event logged before it, if any.
        boundary: Option<usize>,
    },
    /// Polling stopped after a backend failure
    Halted(String),
}

/// Receiver of dispatcher notifications, called synchronously inside `poll_cycle`
pub trait DispatcherObserver: Send {
    fn notify(&mut self, event: &DispatcherEvent);
}

impl<F> DispatcherObserver for F
where
    F: FnMut(&DispatcherEvent) + Send,
{
    fn notify(&mut self, event: &DispatcherEvent) {
        self(event)
    }
}

/// Forwards notifications over an mpsc channel
pub struct ChannelObserver {
    tx: Sender<DispatcherEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<DispatcherEvent>) -> Self {
        Self { tx }
    }
}

impl DispatcherObserver for ChannelObserver {
    fn notify(&mut self, event: &DispatcherEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Trial-building logic driven by [`Dispatcher::run_session`]
pub trait Paradigm {
    /// Build and upload the matrix for `next_trial`, then call
    /// [`Dispatcher::ready_to_start_trial`] to start it
    fn prepare_next_trial(&mut self, dispatcher: &mut Dispatcher, next_trial: usize) -> Result<()>;
}

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollOutcome {
    pub tick: Tick,
    /// Trial to prepare, when this poll raised the prepare-next-trial notification
    pub prepare: Option<usize>,
}

/// Polls a backend and tracks trials
pub struct Dispatcher {
    client: Box<dyn StateMachineClient>,
    config: DispatcherConfig,
    running: bool,
    events: Vec<Event>,
    current_state: usize,
    server_time: f64,
    current_trial: Option<usize>,
    /// Log index of the state-0 event closing each completed trial
    boundaries: Vec<usize>,
    /// Last state-0 event logged before the first trial
    opening_boundary: Option<usize>,
    /// Set when the prepare notification fired; cleared by `ready_to_start_trial`
    prepare_latched: bool,
    observers: Vec<Box<dyn DispatcherObserver>>,
    started_at: Option<DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new(client: Box<dyn StateMachineClient>, config: DispatcherConfig) -> Self {
        Self {
            client,
            config,
            running: false,
            events: Vec::new(),
            current_state: STATE_0,
            server_time: 0.0,
            current_trial: None,
            boundaries: Vec::new(),
            opening_boundary: None,
            prepare_latched: false,
            observers: Vec::new(),
            started_at: None,
        }
    }

    /// Register an observer
    pub fn subscribe(&mut self, observer: impl DispatcherObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn client_mut(&mut self) -> &mut dyn StateMachineClient {
        self.client.as_mut()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The full event log
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn current_state(&self) -> usize {
        self.current_state
    }

    pub fn server_time(&self) -> f64 {
        self.server_time
    }

    pub fn current_trial(&self) -> Option<usize> {
        self.current_trial
    }

    pub fn trials_completed(&self) -> usize {
        self.boundaries.len()
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    /// Wall-clock time of the first `resume`
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Upload the next trial's matrix to the backend
    pub fn load_matrix(&mut self, matrix: &StateMatrix) -> Result<()> {
        self.client.set_state_matrix(matrix)?;
        log::debug!(
            "Loaded matrix with {} states for trial {:?}",
            matrix.n_states(),
            self.current_trial.map_or(0, |t| t + 1)
        );
        Ok(())
    }

    /// Start the backend and poll once
    pub fn resume(&mut self) -> Result<PollOutcome> {
        self.client.run()?;
        self.running = true;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        log::info!("Dispatcher running ({} backend)", self.client.backend_name());
        self.poll_cycle()
    }

    /// Stop the backend, force state 0 and turn every output off
    pub fn pause(&mut self) -> Result<()> {
        self.running = false;
        self.client.stop()?;
        self.client.force_state(STATE_0)?;
        self.client.force_all_outputs(self.config.n_outputs, false)?;
        log::info!("Dispatcher paused");
        Ok(())
    }

    /// Fetch new events, update bookkeeping and notify observers
    pub fn poll_cycle(&mut self) -> Result<PollOutcome> {
        if !self.running {
            return Err(DispatcherError::NotRunning);
        }

        let (server_time, new_events) = match self.fetch() {
            Ok(polled) => polled,
            Err(e) => return Err(self.halt(e)),
        };

        self.server_time = server_time;
        if let Some(last) = new_events.last() {
            self.current_state = last.next_state;
        }
        if !new_events.is_empty() {
            log::debug!(
                "Polled {} events at t={:.3}, state {}",
                new_events.len(),
                server_time,
                self.current_state
            );
        }
        self.events.extend(new_events);

        let tick = Tick {
            server_time,
            state: self.current_state,
            event_count: self.events.len(),
            trial: self.current_trial,
        };
        self.notify(&DispatcherEvent::Tick(tick));

        let prepare = self.detect_trial_end();
        Ok(PollOutcome { tick, prepare })
    }

    fn fetch(&mut self) -> std::result::Result<(f64, Vec<Event>), ClientError> {
        let time = self.client.get_time()?;
        let events = self.client.get_events()?;
        Ok((time, events))
    }

    /// Stop polling after a backend failure and return the error to surface
    fn halt(&mut self, error: ClientError) -> DispatcherError {
        log::error!("Backend failure, halting dispatcher: {}", error);
        self.running = false;
        if let Err(e) = self.client.stop() {
            log::warn!("Failed to stop backend after failure: {}", e);
        }
        if let Err(e) = self.client.force_all_outputs(self.config.n_outputs, false) {
            log::warn!("Failed to clear outputs after failure: {}", e);
        }
        self.notify(&DispatcherEvent::Halted(error.to_string()));
        DispatcherError::Client(error)
    }

    fn detect_trial_end(&mut self) -> Option<usize> {
        if self.prepare_latched || !self.config.prepare_next_trial_states.contains(&self.current_state) {
            return None;
        }

        let (next_trial, boundary) = match self.current_trial {
            None => {
                // Present when the machine reached state 0 before the dispatcher started
                self.opening_boundary = self.events.iter().rposition(|e| e.next_state == STATE_0);
                (0, self.opening_boundary)
            }
            Some(trial) => {
                let search_from = self.trial_start_index(self.boundaries.len());
                let found = self.events[search_from..]
                    .iter()
                    .rposition(|e| e.next_state == STATE_0)
                    .map(|offset| search_from + offset);
                match found {
                    Some(index) => {
                        self.boundaries.push(index);
                        log::info!("Trial {} ended at event {}", trial, index);
                        (trial + 1, Some(index))
                    }
                    None => {
                        log::warn!(
                            "State {} reached but trial {} has no closing state-0 event yet; retrying next poll",
                            self.current_state,
                            trial
                        );
                        return None;
                    }
                }
            }
        };

        self.prepare_latched = true;
        self.notify(&DispatcherEvent::PrepareNextTrial { next_trial, boundary });
        Some(next_trial)
    }

    /// Start the next trial: bump the counter and jump to the trial-start state
    pub fn ready_to_start_trial(&mut self) -> Result<()> {
        if let Some(trial) = self.current_trial {
            if !self.prepare_latched {
                return Err(DispatcherError::TrialInProgress(trial));
            }
        }
        let trial = self.current_trial.map_or(0, |t| t + 1);
        self.client.force_state(self.config.trial_start_state)?;
        self.current_trial = Some(trial);
        self.prepare_latched = false;
        log::info!("Starting trial {}", trial);
        Ok(())
    }

    /// Events of a completed trial
    ///
    /// The slice lies strictly between the previous boundary (or the log start)
    /// and the trial's closing state-0 event, without the leading events that
    /// still land in the ready state (the state-0 bootstrap jump and anything
    /// logged while waiting).
    pub fn events_for_trial(&self, trial: usize) -> Result<&[Event]> {
        let Some(&end) = self.boundaries.get(trial) else {
            return Err(DispatcherError::TrialIncomplete {
                trial,
                completed: self.boundaries.len(),
            });
        };
        let start = self.trial_start_index(trial);
        let waiting = self.events[start..end]
            .iter()
            .take_while(|e| self.config.prepare_next_trial_states.contains(&e.next_state))
            .count();
        Ok(&self.events[start + waiting..end])
    }

    /// First log index that can belong to `trial`
    fn trial_start_index(&self, trial: usize) -> usize {
        let previous = match trial {
            0 => self.opening_boundary,
            _ => self.boundaries.get(trial - 1).copied(),
        };
        previous.map_or(0, |b| b + 1)
    }

    /// Drive the session until `done` returns true
    ///
    /// Resumes the backend if needed, then polls once per period and hands every
    /// prepare-next-trial notification to `paradigm`. Errors from the backend
    /// or the paradigm end the session.
    pub fn run_session<P, F>(&mut self, paradigm: &mut P, mut done: F) -> Result<()>
    where
        P: Paradigm + ?Sized,
        F: FnMut(&Dispatcher) -> bool,
    {
        if !self.running {
            let outcome = self.resume()?;
            if let Some(next) = outcome.prepare {
                paradigm.prepare_next_trial(self, next)?;
            }
        }

        let mut ticker = Ticker::new(self.config.poll_period());
        while !done(self) {
            ticker.wait();
            let outcome = self.poll_cycle()?;
            if let Some(next) = outcome.prepare {
                paradigm.prepare_next_trial(self, next)?;
            }
        }
        log::info!(
            "Session finished: {} trials, {} events",
            self.trials_completed(),
            self.events.len()
        );
        Ok(())
    }

    fn notify(&mut self, event: &DispatcherEvent) {
        for observer in self.observers.iter_mut() {
            observer.notify(event);
        }
    }
}
