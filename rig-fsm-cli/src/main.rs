//! Rig FSM CLI Application
//!
//! This is the command-line runner for behavioral rig sessions.
//! It uses the rig-fsm library and adds:
//! - Session files (backend, dispatcher, paradigm, stop conditions)
//! - A paradigm built from named states in the session file
//! - Per-trial summaries on stdout (text or JSON lines)

use anyhow::{Context, Result};
use clap::Parser;
use rig_fsm::dispatcher::DispatcherEvent;
use rig_fsm::emulator::{FileSink, Stepper};
use rig_fsm::{Dispatcher, EmulatorEngine, SocketTextClient, StateMachineClient};
use std::path::PathBuf;
use std::time::Instant;

mod config;
mod paradigm;
mod report;

use config::{AppConfig, BackendConfig};
use paradigm::ConfigParadigm;
use report::{OutputFormat, TrialSummary};

/// Rig FSM - Run trial-based sessions on a behavioral state machine
#[derive(Parser, Debug)]
#[command(name = "rig-fsm-cli")]
#[command(about = "Run trial-based sessions on a behavioral rig state machine", long_about = None)]
#[command(version)]
struct Args {
    /// Path to session configuration file (session.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stop after this many completed trials (overrides the session file)
    #[arg(long, value_name = "COUNT")]
    max_trials: Option<usize>,

    /// Stop after this many seconds (overrides the session file)
    #[arg(long, value_name = "SECONDS")]
    duration: Option<f64>,

    /// Print trial summaries as JSON lines
    #[arg(long)]
    json: bool,

    /// Build and print the state matrix without connecting
    #[arg(long)]
    dry_run: bool,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

/// Stop conditions and output settings for one session
#[derive(Debug, Clone)]
struct SessionOptions {
    max_trials: Option<usize>,
    duration_s: Option<f64>,
    format: OutputFormat,
}

impl SessionOptions {
    fn from_args(args: &Args, config: &AppConfig) -> Self {
        Self {
            max_trials: args.max_trials.or(config.session.max_trials),
            duration_s: args.duration.or(config.session.duration_s),
            format: if args.json { OutputFormat::Json } else { OutputFormat::Text },
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("Rig FSM CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using rig-fsm library v{}", rig_fsm::VERSION);

    if let Some(config_path) = &args.config {
        session_mode(config_path, &args)?;
    } else {
        // No arguments - show help
        println!("Rig FSM - No session file specified");
        println!("\nQuick Start:");
        println!("  rig-fsm-cli --config session.toml");
        println!("  rig-fsm-cli --config session.toml --max-trials 10 --json");
        println!("\nCheck a paradigm without hardware:");
        println!("  rig-fsm-cli --config session.toml --dry-run");
        println!("\nUse --help for more options");
    }

    Ok(())
}

/// Session mode - load the session file, run trials, print summaries
fn session_mode(config_path: &PathBuf, args: &Args) -> Result<()> {
    log::info!("Loading configuration from: {:?}", config_path);
    let config = config::load_config(config_path)?;
    log::debug!("Configuration loaded successfully");

    let options = SessionOptions::from_args(args, &config);
    let banners = options.format == OutputFormat::Text;

    if banners {
        println!("═══════════════════════════════════════════════");
        println!("  Rig FSM - {} on {}", config.paradigm.name, config.backend.name());
        println!("═══════════════════════════════════════════════\n");
    }

    if args.dry_run {
        let paradigm = ConfigParadigm::new(&config.paradigm, options.format)?;
        print_matrix(&paradigm);
        return Ok(());
    }

    let summaries = run_session(&config, &options)?;

    if banners {
        println!("\n───────────────────────────────────────────────");
        println!("✓ Session finished: {} trials", summaries.len());
        if let (Some(first), Some(last)) = (summaries.first(), summaries.last()) {
            println!("  Controller time: {:.3}s - {:.3}s", first.start_time, last.end_time);
        }
    }
    Ok(())
}

/// Connect the configured backend, run trials until a stop condition holds
fn run_session(config: &AppConfig, options: &SessionOptions) -> Result<Vec<TrialSummary>> {
    let mut paradigm = ConfigParadigm::new(&config.paradigm, options.format)?;

    let (mut client, stepper) = open_backend(config)?;
    client
        .connect()
        .with_context(|| format!("Failed to connect to the {} backend", config.backend.name()))?;
    client.initialize()?;

    let dispatcher_config = config
        .dispatcher
        .clone()
        .with_outputs(config.backend.sizes().n_outputs)
        .with_prepare_next_trial(paradigm.matrix().prepare_next_trial().to_vec());
    let mut dispatcher = Dispatcher::new(client, dispatcher_config);
    dispatcher.subscribe(|event: &DispatcherEvent| match event {
        DispatcherEvent::Tick(tick) => log::trace!("t={:.3}s state={} events={}", tick.server_time, tick.state, tick.event_count),
        DispatcherEvent::PrepareNextTrial { next_trial, .. } => log::debug!("Preparing trial {}", next_trial),
        DispatcherEvent::Halted(reason) => log::error!("Session halted: {}", reason),
    });
    dispatcher.load_matrix(paradigm.matrix())?;

    if options.max_trials.is_none() && options.duration_s.is_none() {
        log::warn!("No trial or time limit set; running until interrupted");
    }
    let started = Instant::now();
    let max_trials = options.max_trials;
    let duration_s = options.duration_s;
    let result = dispatcher.run_session(&mut paradigm, |d| {
        if let Some(stepper) = &stepper {
            stepper.tick();
        }
        max_trials.map_or(false, |m| d.trials_completed() >= m)
            || duration_s.map_or(false, |s| started.elapsed().as_secs_f64() >= s)
    });

    // Leave the rig with outputs off even when the session failed
    if let Err(e) = dispatcher.pause() {
        log::warn!("Failed to pause the backend: {}", e);
    }
    if let Some(started_at) = dispatcher.started_at() {
        log::info!(
            "Session started {} ran {:.1}s",
            started_at.format("%Y-%m-%d %H:%M:%S"),
            started.elapsed().as_secs_f64()
        );
    }
    dispatcher.client_mut().close()?;
    result?;

    Ok(paradigm.summaries().to_vec())
}

/// Create the client for the configured backend
///
/// A manually driven emulator also hands back its [`Stepper`], which the
/// session loop ticks once per poll.
fn open_backend(config: &AppConfig) -> Result<(Box<dyn StateMachineClient>, Option<Stepper>)> {
    match &config.backend {
        BackendConfig::Emulator(emulator) => {
            let mut engine = EmulatorEngine::new(emulator.clone()).with_script(config.script.iter().copied());
            if let Some(path) = &config.session.side_effects {
                let sink = FileSink::create(path).with_context(|| format!("Failed to create {:?}", path))?;
                engine = engine.with_sink(sink);
            }
            let stepper = if emulator.background {
                None
            } else {
                log::info!("Emulator cycles once per poll");
                Some(engine.stepper())
            };
            Ok((Box::new(engine), stepper))
        }
        BackendConfig::Serial(serial) => Ok((open_serial(serial.clone())?, None)),
        BackendConfig::Socket(socket) => Ok((Box::new(SocketTextClient::new(socket.clone())), None)),
    }
}

#[cfg(feature = "serial-port")]
fn open_serial(config: rig_fsm::SerialConfig) -> Result<Box<dyn StateMachineClient>> {
    let port = config.port.clone();
    let client = rig_fsm::SerialOpcodeClient::open(config).with_context(|| format!("Failed to open {}", port))?;
    Ok(Box::new(client))
}

#[cfg(not(feature = "serial-port"))]
fn open_serial(config: rig_fsm::SerialConfig) -> Result<Box<dyn StateMachineClient>> {
    anyhow::bail!(
        "Serial backend ({}) needs rig-fsm-cli built with the 'serial-port' feature",
        config.port
    )
}

/// Print the numeric matrix the paradigm uploads
fn print_matrix(paradigm: &ConfigParadigm) {
    let matrix = paradigm.matrix();
    println!("📊 State Matrix:");
    println!("  States:       {}", matrix.n_states());
    println!("  Inputs:       {}", matrix.n_inputs());
    println!("  Outputs:      {}", matrix.n_outputs());
    println!("  Extra timers: {}", matrix.n_extra_timers());
    println!();
    for state in matrix.states() {
        println!(
            "  {:>3} {:<20} timer {:>10.3}  -> {:?}",
            state.id, state.name, state.timer, state.transitions
        );
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator_session(background: bool) -> AppConfig {
        let toml_content = format!(
            r#"
            [backend]
            kind = "emulator"
            background = {}
            sizes = {{ n_inputs = 0, n_outputs = 1 }}

            [dispatcher]
            poll_period_ms = 10

            [paradigm]
            inputs = []
            outputs = ["Light"]

            [[paradigm.states]]
            name = "light_on"
            timer = 0.02
            outputs_on = ["Light"]
            transitions = {{ Tup = "light_off" }}

            [[paradigm.states]]
            name = "light_off"
            timer = 0.01
            outputs_off = ["Light"]
            transitions = {{ Tup = "_state_0" }}
        "#,
            background
        );
        toml::from_str(&toml_content).unwrap()
    }

    fn options(max_trials: usize) -> SessionOptions {
        SessionOptions {
            max_trials: Some(max_trials),
            duration_s: Some(10.0),
            format: OutputFormat::Json,
        }
    }

    #[test]
    fn test_emulator_session_reports_trials() {
        let config = emulator_session(true);
        config.validate().unwrap();

        let summaries = run_session(&config, &options(2)).unwrap();
        assert!(summaries.len() >= 2);
        for (i, summary) in summaries.iter().enumerate() {
            assert_eq!(summary.trial, i);
            assert_eq!(summary.final_state, "light_off");
            assert!(summary.end_time >= summary.start_time);
        }
    }

    #[test]
    fn test_stepped_emulator_session() {
        let config = emulator_session(false);
        let summaries = run_session(&config, &options(1)).unwrap();
        assert!(!summaries.is_empty());
        assert_eq!(summaries[0].states, vec!["light_on", "light_off"]);
    }

    #[test]
    #[cfg(not(feature = "serial-port"))]
    fn test_serial_backend_needs_feature() {
        let mut config = emulator_session(true);
        config.backend = BackendConfig::Serial(rig_fsm::SerialConfig::new(
            "/dev/ttyACM0",
            rig_fsm::ControllerSizes::new(0, 1, 0),
        ));
        let err = open_backend(&config).err().unwrap();
        assert!(err.to_string().contains("serial-port"));
    }
}
