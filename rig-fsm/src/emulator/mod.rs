//! Software state machine backend
//!
//! [`EmulatorEngine`] implements [`StateMachineClient`] without any hardware. It
//! wraps a deterministic [`FsmCore`] with:
//! - an [`EmulatorClock`] (monotonic wall time, or a manual clock for tests)
//! - a set of simulated input lines driven through an [`InputPanel`] or a script
//! - an [`OutputSink`] that receives output and serial-code side effects
//! - an optional background thread that cycles the core at a fixed period
//!
//! In manual mode (`EmulatorConfig::manual()`) no thread is started and the
//! caller advances the machine with [`EmulatorEngine::tick`] or a [`Stepper`].

pub mod fsm;
pub mod sink;

pub use fsm::FsmCore;
pub use sink::{ChannelSink, FileSink, NullSink, OutputSink, SideEffect};

use crate::client::StateMachineClient;
use crate::config::EmulatorConfig;
use crate::matrix::{OutputPattern, StateMatrix, STATE_0};
use crate::ticker::Ticker;
use crate::types::{ClientError, Event, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

#[derive(Debug)]
enum ClockSource {
    Monotonic(Instant),
    Manual(f64),
}

/// Session clock shared by the engine and its handles
///
/// Cloning yields another handle to the same clock.
#[derive(Debug, Clone)]
pub struct EmulatorClock {
    source: Arc<Mutex<ClockSource>>,
}

impl EmulatorClock {
    /// Clock backed by `Instant`, zeroed at creation and on `reset`
    pub fn monotonic() -> Self {
        Self {
            source: Arc::new(Mutex::new(ClockSource::Monotonic(Instant::now()))),
        }
    }

    /// Clock that only moves through `set` and `advance`
    pub fn manual() -> Self {
        Self {
            source: Arc::new(Mutex::new(ClockSource::Manual(0.0))),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(*self.source.lock(), ClockSource::Manual(_))
    }

    /// Seconds since the last reset
    pub fn now(&self) -> f64 {
        match &*self.source.lock() {
            ClockSource::Monotonic(origin) => origin.elapsed().as_secs_f64(),
            ClockSource::Manual(now) => *now,
        }
    }

    pub fn reset(&self) {
        let mut source = self.source.lock();
        *source = match *source {
            ClockSource::Monotonic(_) => ClockSource::Monotonic(Instant::now()),
            ClockSource::Manual(_) => ClockSource::Manual(0.0),
        };
    }

    /// Move a manual clock to `seconds`; ignored by a monotonic clock
    pub fn set(&self, seconds: f64) {
        match &mut *self.source.lock() {
            ClockSource::Manual(now) => *now = seconds,
            ClockSource::Monotonic(_) => log::warn!("Cannot set a monotonic emulator clock"),
        }
    }

    /// Advance a manual clock by `seconds`; ignored by a monotonic clock
    pub fn advance(&self, seconds: f64) {
        match &mut *self.source.lock() {
            ClockSource::Manual(now) => *now += seconds,
            ClockSource::Monotonic(_) => log::warn!("Cannot advance a monotonic emulator clock"),
        }
    }
}

/// Input change applied by the engine once the clock reaches `at`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScriptedInput {
    /// Session time in seconds
    pub at: f64,
    pub line: usize,
    pub value: bool,
}

struct Shared {
    core: Option<FsmCore>,
    inputs: Vec<bool>,
    /// Pending scripted changes, ordered by time
    script: VecDeque<ScriptedInput>,
    sink: Box<dyn OutputSink>,
    events: Vec<Event>,
}

impl Shared {
    fn core_mut(&mut self) -> Result<&mut FsmCore> {
        self.core
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("no state matrix loaded".to_string()))
    }

    /// Move recorded events and side effects out of the core
    fn collect(&mut self) {
        let Some(core) = self.core.as_mut() else {
            return;
        };
        self.events.extend(core.take_events());
        for effect in core.take_effects() {
            self.sink.emit(&effect);
        }
    }

    fn cycle(&mut self, now: f64) {
        while self.script.front().map_or(false, |change| change.at <= now) {
            if let Some(change) = self.script.pop_front() {
                match self.inputs.get_mut(change.line) {
                    Some(value) => *value = change.value,
                    None => log::warn!("Scripted input line {} out of range", change.line),
                }
            }
        }
        if let Some(core) = self.core.as_mut() {
            core.cycle(now, &self.inputs);
        }
        self.collect();
    }
}

/// Handle for driving the emulator's input lines from another thread
#[derive(Clone)]
pub struct InputPanel {
    shared: Arc<Mutex<Shared>>,
}

impl InputPanel {
    /// Set the level of an input line; the edge is seen on the next cycle
    pub fn set(&self, line: usize, value: bool) -> Result<()> {
        let mut shared = self.shared.lock();
        let n_inputs = shared.inputs.len();
        match shared.inputs.get_mut(line) {
            Some(current) => {
                *current = value;
                Ok(())
            }
            None => Err(ClientError::Protocol(format!(
                "input line {} out of range ({} inputs)",
                line, n_inputs
            ))),
        }
    }

    pub fn get(&self, line: usize) -> Option<bool> {
        self.shared.lock().inputs.get(line).copied()
    }

    /// Queue a level change for session time `at`
    pub fn schedule(&self, at: f64, line: usize, value: bool) {
        insert_scripted(&mut self.shared.lock().script, ScriptedInput { at, line, value });
    }
}

/// Cycles a manual-mode emulator after the engine has been handed to a dispatcher
#[derive(Clone)]
pub struct Stepper {
    shared: Arc<Mutex<Shared>>,
    clock: EmulatorClock,
}

impl Stepper {
    /// Run one cycle at the clock's current time
    pub fn tick(&self) {
        // Clock is read under the state lock so cycles and forced jumps stay ordered
        let mut shared = self.shared.lock();
        let now = self.clock.now();
        shared.cycle(now);
    }

    /// Move a manual clock to `seconds` and run one cycle there
    pub fn tick_at(&self, seconds: f64) {
        self.clock.set(seconds);
        self.tick();
    }
}

fn insert_scripted(script: &mut VecDeque<ScriptedInput>, change: ScriptedInput) {
    let position = script.iter().position(|pending| pending.at > change.at).unwrap_or(script.len());
    script.insert(position, change);
}

/// Software backend executing the state machine on the host
pub struct EmulatorEngine {
    config: EmulatorConfig,
    clock: EmulatorClock,
    shared: Arc<Mutex<Shared>>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EmulatorEngine {
    /// Create an emulator with a monotonic clock and a [`NullSink`]
    pub fn new(config: EmulatorConfig) -> Self {
        Self::with_clock(config, EmulatorClock::monotonic())
    }

    pub fn with_clock(config: EmulatorConfig, clock: EmulatorClock) -> Self {
        let shared = Shared {
            core: None,
            inputs: vec![false; config.sizes.n_inputs],
            script: VecDeque::new(),
            sink: Box::new(NullSink),
            events: Vec::new(),
        };
        Self {
            config,
            clock,
            shared: Arc::new(Mutex::new(shared)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Builder method: side-effect receiver
    pub fn with_sink(self, sink: impl OutputSink + 'static) -> Self {
        self.shared.lock().sink = Box::new(sink);
        self
    }

    /// Builder method: scripted input changes
    pub fn with_script(self, script: impl IntoIterator<Item = ScriptedInput>) -> Self {
        {
            let mut shared = self.shared.lock();
            for change in script {
                insert_scripted(&mut shared.script, change);
            }
        }
        self
    }

    pub fn clock(&self) -> EmulatorClock {
        self.clock.clone()
    }

    pub fn input_panel(&self) -> InputPanel {
        InputPanel {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stepper(&self) -> Stepper {
        Stepper {
            shared: Arc::clone(&self.shared),
            clock: self.clock.clone(),
        }
    }

    /// Current level of every output line (empty before a matrix is loaded)
    pub fn outputs(&self) -> Vec<bool> {
        self.shared
            .lock()
            .core
            .as_ref()
            .map(|core| core.outputs().to_vec())
            .unwrap_or_default()
    }

    /// Run one cycle at the clock's current time
    pub fn tick(&self) {
        self.stepper().tick();
    }

    fn start_worker(&mut self) {
        if self.worker.is_some() || !self.config.background {
            return;
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        let stepper = self.stepper();
        let stop_flag = Arc::clone(&self.stop_flag);
        let period = self.config.tick();

        log::debug!("Starting emulator cycle thread ({:?} period)", period);
        self.worker = Some(std::thread::spawn(move || {
            let mut ticker = Ticker::new(period);
            while !stop_flag.load(Ordering::SeqCst) {
                ticker.wait();
                stepper.tick();
            }
            if ticker.overruns() > 0 {
                log::debug!("Emulator cycle overran {} times", ticker.overruns());
            }
        }));
    }

    fn stop_worker(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Emulator cycle thread panicked");
            }
        }
    }

    fn with_core<T>(&self, f: impl FnOnce(&mut FsmCore) -> std::result::Result<T, ClientError>) -> Result<T> {
        let mut shared = self.shared.lock();
        let result = f(shared.core_mut()?);
        shared.collect();
        result
    }
}

impl StateMachineClient for EmulatorEngine {
    fn backend_name(&self) -> &'static str {
        "emulator"
    }

    fn connect(&mut self) -> Result<()> {
        log::info!("Emulator connected");
        self.start_worker();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop_worker();
        log::info!("Emulator closed");
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.core = shared.core.take().map(|core| FsmCore::new(core.matrix().clone()));
        shared.events.clear();
        self.clock.reset();
        log::info!("Emulator initialized");
        Ok(())
    }

    fn set_state_matrix(&mut self, matrix: &StateMatrix) -> Result<()> {
        matrix.validate()?;
        self.config.sizes.check_matrix(matrix)?;
        let mut shared = self.shared.lock();
        if shared.inputs.len() < matrix.n_inputs() {
            shared.inputs.resize(matrix.n_inputs(), false);
        }
        match shared.core.as_mut() {
            Some(core) => core.load_matrix(matrix.clone()),
            None => shared.core = Some(FsmCore::new(matrix.clone())),
        }
        log::debug!(
            "Emulator loaded {} states x {} columns",
            matrix.n_states(),
            matrix.wire_width()
        );
        Ok(())
    }

    fn set_state_outputs(&mut self, outputs: &[OutputPattern]) -> Result<()> {
        self.with_core(|core| Ok(core.matrix_mut().replace_outputs(outputs)?))
    }

    fn set_state_timers(&mut self, timers: &[f64]) -> Result<()> {
        self.with_core(|core| Ok(core.matrix_mut().replace_timers(timers)?))
    }

    fn set_extra_timers(&mut self, durations: &[f64]) -> Result<()> {
        self.with_core(|core| Ok(core.matrix_mut().replace_extra_durations(durations)?))
    }

    fn set_extra_triggers(&mut self, triggers: &[Option<usize>]) -> Result<()> {
        self.with_core(|core| Ok(core.matrix_mut().replace_extra_triggers(triggers)?))
    }

    fn run(&mut self) -> Result<()> {
        let now = self.with_core(|core| {
            let now = self.clock.now();
            core.start(now);
            Ok(now)
        })?;
        log::info!("Emulator running at t={:.3}", now);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.with_core(|core| {
            core.halt();
            Ok(())
        })?;
        log::info!("Emulator halted");
        Ok(())
    }

    fn force_state(&mut self, state: usize) -> Result<()> {
        self.with_core(|core| {
            if core.force_state(state, self.clock.now()) {
                Ok(())
            } else {
                Err(ClientError::Protocol(format!("cannot force undefined state {}", state)))
            }
        })
    }

    fn force_output(&mut self, line: usize, value: bool) -> Result<()> {
        self.with_core(|core| {
            if core.force_output(line, value, self.clock.now()) {
                Ok(())
            } else {
                Err(ClientError::Protocol(format!("output line {} out of range", line)))
            }
        })
    }

    fn get_time(&mut self) -> Result<f64> {
        Ok(self.clock.now())
    }

    fn get_events(&mut self) -> Result<Vec<Event>> {
        let mut shared = self.shared.lock();
        shared.collect();
        Ok(std::mem::take(&mut shared.events))
    }

    fn get_current_state(&mut self) -> Result<usize> {
        Ok(self
            .shared
            .lock()
            .core
            .as_ref()
            .map(|core| core.current_state())
            .unwrap_or(STATE_0))
    }
}

impl Drop for EmulatorEngine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{StateMatrixBuilder, StateSpec};
    use crate::config::ControllerSizes;
    use crate::matrix::READY_STATE;
    use crate::types::FORCED_JUMP;
    use std::sync::mpsc;
    use std::time::Duration;

    fn ab_matrix() -> StateMatrix {
        let mut b = StateMatrixBuilder::new(&["P"], &["Light"]);
        b.add_state(StateSpec::new("A").on("Pin", "B")).unwrap();
        b.add_state(StateSpec::new("B").timer(2.0).on("Tup", "A").outputs_on(&["Light"]))
            .unwrap();
        b.build().unwrap()
    }

    fn manual_engine() -> (EmulatorEngine, EmulatorClock) {
        let clock = EmulatorClock::manual();
        let config = EmulatorConfig::new(ControllerSizes::new(1, 1, 0)).manual();
        let mut engine = EmulatorEngine::with_clock(config, clock.clone());
        engine.connect().unwrap();
        engine.set_state_matrix(&ab_matrix()).unwrap();
        engine.run().unwrap();
        (engine, clock)
    }

    #[test]
    fn test_manual_clock() {
        let clock = EmulatorClock::manual();
        clock.advance(0.5);
        clock.advance(0.25);
        assert_eq!(clock.now(), 0.75);
        clock.reset();
        assert_eq!(clock.now(), 0.0);
        assert!(clock.is_manual());
    }

    #[test]
    fn test_input_panel_drives_edges() {
        let (mut engine, clock) = manual_engine();
        let a = 2;
        let b = 3;
        engine.force_state(a).unwrap();
        clock.set(0.05);
        engine.input_panel().set(0, true).unwrap();
        engine.tick();

        let events = engine.get_events().unwrap();
        assert_eq!(events, vec![Event::new(0.0, FORCED_JUMP, a), Event::new(0.05, 0, b)]);
        assert_eq!(engine.get_current_state().unwrap(), b);
        assert_eq!(engine.outputs(), vec![true]);
    }

    #[test]
    fn test_get_events_never_redelivers() {
        let (mut engine, clock) = manual_engine();
        clock.set(0.001);
        engine.tick();
        assert_eq!(engine.get_events().unwrap(), vec![Event::new(0.001, 2, READY_STATE)]);
        assert!(engine.get_events().unwrap().is_empty());
        engine.tick();
        assert!(engine.get_events().unwrap().is_empty());
    }

    #[test]
    fn test_script_applies_when_due() {
        let clock = EmulatorClock::manual();
        let config = EmulatorConfig::new(ControllerSizes::new(1, 1, 0)).manual();
        let mut engine = EmulatorEngine::with_clock(config, clock.clone()).with_script(vec![
            ScriptedInput { at: 0.3, line: 0, value: false },
            ScriptedInput { at: 0.2, line: 0, value: true },
        ]);
        engine.set_state_matrix(&ab_matrix()).unwrap();
        engine.run().unwrap();
        engine.force_state(2).unwrap();
        engine.get_events().unwrap();

        clock.set(0.1);
        engine.tick();
        assert!(engine.get_events().unwrap().is_empty());
        clock.set(0.2);
        engine.tick();
        assert_eq!(engine.get_events().unwrap(), vec![Event::new(0.2, 0, 3)]);
        assert_eq!(engine.input_panel().get(0), Some(true));
        clock.set(0.3);
        engine.tick();
        assert_eq!(engine.input_panel().get(0), Some(false));
    }

    #[test]
    fn test_setters_require_matrix() {
        let config = EmulatorConfig::new(ControllerSizes::new(1, 1, 0)).manual();
        let mut engine = EmulatorEngine::with_clock(config, EmulatorClock::manual());
        assert!(matches!(engine.set_state_timers(&[1.0]), Err(ClientError::Protocol(_))));
        assert_eq!(engine.get_current_state().unwrap(), STATE_0);
    }

    #[test]
    fn test_state_timers_update() {
        let (mut engine, clock) = manual_engine();
        let matrix = ab_matrix();
        let mut timers = matrix.timers();
        timers[3] = 0.5;
        engine.set_state_timers(&timers).unwrap();
        engine.force_state(3).unwrap();
        engine.get_events().unwrap();
        clock.set(0.5);
        engine.tick();
        let code = matrix.timer_event_code() as i32;
        assert_eq!(engine.get_events().unwrap(), vec![Event::new(0.5, code, 2)]);
    }

    #[test]
    fn test_sink_receives_effects() {
        let (tx, rx) = mpsc::channel();
        let clock = EmulatorClock::manual();
        let config = EmulatorConfig::new(ControllerSizes::new(1, 1, 0)).manual();
        let mut engine = EmulatorEngine::with_clock(config, clock).with_sink(ChannelSink::new(tx));
        engine.set_state_matrix(&ab_matrix()).unwrap();
        engine.force_output(0, true).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SideEffect::Output { line: 0, value: true, time: 0.0 });
    }

    #[test]
    fn test_initialize_resets() {
        let (mut engine, clock) = manual_engine();
        engine.force_state(3).unwrap();
        clock.set(4.0);
        engine.initialize().unwrap();
        assert_eq!(clock.now(), 0.0);
        assert!(engine.get_events().unwrap().is_empty());
        assert_eq!(engine.get_current_state().unwrap(), STATE_0);
    }

    #[test]
    fn test_background_thread_bootstraps() {
        let config = EmulatorConfig::new(ControllerSizes::new(1, 1, 0)).with_tick(Duration::from_millis(1));
        let mut engine = EmulatorEngine::new(config);
        engine.connect().unwrap();
        engine.set_state_matrix(&ab_matrix()).unwrap();
        engine.run().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let events = engine.get_events().unwrap();
        engine.close().unwrap();
        assert_eq!(events.first().map(|e| e.next_state), Some(READY_STATE));
    }

    #[test]
    fn test_forced_jumps_stay_in_time_order_with_worker() {
        let config = EmulatorConfig::new(ControllerSizes::new(1, 1, 0)).with_tick(Duration::from_millis(1));
        let mut engine = EmulatorEngine::new(config);
        engine.connect().unwrap();
        engine.set_state_matrix(&ab_matrix()).unwrap();
        engine.run().unwrap();

        let mut events = Vec::new();
        for i in 0..300 {
            engine.force_state(2 + i % 2).unwrap();
            if i % 50 == 0 {
                events.extend(engine.get_events().unwrap());
            }
        }
        std::thread::sleep(Duration::from_millis(5));
        events.extend(engine.get_events().unwrap());
        engine.close().unwrap();

        assert!(events.iter().filter(|e| e.code == FORCED_JUMP).count() >= 300);
        for pair in events.windows(2) {
            assert!(
                pair[0].timestamp <= pair[1].timestamp,
                "{:?} logged before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_matrix_must_match_sizes() {
        let clock = EmulatorClock::manual();
        let config = EmulatorConfig::new(ControllerSizes::new(2, 1, 0)).manual();
        let mut engine = EmulatorEngine::with_clock(config, clock);
        assert!(matches!(
            engine.set_state_matrix(&ab_matrix()),
            Err(ClientError::Matrix(crate::types::MatrixError::Shape { .. }))
        ));
        assert!(matches!(engine.set_state_timers(&[1.0]), Err(ClientError::Protocol(_))));
    }
}
