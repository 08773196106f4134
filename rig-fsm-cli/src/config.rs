//! Session configuration loading and parsing

use anyhow::{bail, Context, Result};
use rig_fsm::config::{ControllerSizes, DispatcherConfig, EmulatorConfig, SerialConfig, SocketConfig};
use rig_fsm::emulator::ScriptedInput;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from session.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    pub paradigm: ParadigmConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Input changes replayed by the emulator backend
    #[serde(default)]
    pub script: Vec<ScriptedInput>,
}

/// Which controller to drive
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Emulator(EmulatorConfig),
    Serial(SerialConfig),
    Socket(SocketConfig),
}

impl BackendConfig {
    pub fn sizes(&self) -> ControllerSizes {
        match self {
            BackendConfig::Emulator(c) => c.sizes,
            BackendConfig::Serial(c) => c.sizes,
            BackendConfig::Socket(c) => c.sizes,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Emulator(_) => "emulator",
            BackendConfig::Serial(_) => "serial",
            BackendConfig::Socket(_) => "socket",
        }
    }
}

/// Named-state description of the trial run on every iteration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParadigmConfig {
    #[serde(default = "default_paradigm_name")]
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub extra_timers: Vec<ExtraTimerConfig>,
    pub states: Vec<StateConfig>,
    /// Extra states (besides the ready state) that hand control back between trials
    #[serde(default)]
    pub prepare_next_trial: Vec<String>,
}

fn default_paradigm_name() -> String {
    "paradigm".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtraTimerConfig {
    pub name: String,
    pub duration: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    pub name: String,
    /// Self-timer in seconds (default: never fires)
    pub timer: Option<f64>,
    /// Event name -> target state name
    #[serde(default)]
    pub transitions: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs_on: Vec<String>,
    #[serde(default)]
    pub outputs_off: Vec<String>,
    pub serial_out: Option<u8>,
    /// Extra timers armed on entry
    #[serde(default)]
    pub arm: Vec<String>,
}

/// When to stop and where to write side output
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionConfig {
    pub max_trials: Option<usize>,
    /// Wall-clock limit in seconds
    pub duration_s: Option<f64>,
    /// Emulator side-effect log (emulator backend only)
    pub side_effects: Option<PathBuf>,
}

impl AppConfig {
    /// Check that the paradigm fits the controller it will be uploaded to
    pub fn validate(&self) -> Result<()> {
        let sizes = self.backend.sizes();
        let paradigm = &self.paradigm;
        if paradigm.inputs.len() != sizes.n_inputs {
            bail!(
                "Paradigm declares {} inputs but the {} backend has {}",
                paradigm.inputs.len(),
                self.backend.name(),
                sizes.n_inputs
            );
        }
        if paradigm.outputs.len() != sizes.n_outputs {
            bail!(
                "Paradigm declares {} outputs but the {} backend has {}",
                paradigm.outputs.len(),
                self.backend.name(),
                sizes.n_outputs
            );
        }
        if paradigm.extra_timers.len() != sizes.n_extra_timers {
            bail!(
                "Paradigm declares {} extra timers but the {} backend has {}",
                paradigm.extra_timers.len(),
                self.backend.name(),
                sizes.n_extra_timers
            );
        }
        if paradigm.states.is_empty() {
            bail!("Paradigm '{}' defines no states", paradigm.name);
        }
        if !self.script.is_empty() && !matches!(self.backend, BackendConfig::Emulator(_)) {
            log::warn!("Input script is ignored by the {} backend", self.backend.name());
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}
