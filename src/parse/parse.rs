use serde::Deserialize;
use std::{collections::HashMap, fs, io, time::Duration};
use thiserror::Error;

/// Build mode; selects the spawn backend and the forced-kill primitive.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Development,
    Production,
}

impl Mode {
    /// Mode implied by the host's own build profile.
    pub fn from_build() -> Self {
        if cfg!(debug_assertions) {
            Mode::Development
        } else {
            Mode::Production
        }
    }

    /// Value handed to the child as `BACKEND_MODE`.
    pub fn as_env(&self) -> &'static str {
        match self {
            Mode::Development => "development",
            Mode::Production => "production",
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::from_build()
    }
}

fn default_port() -> u16 { 4123 }
fn default_healthpath() -> String { "/api".to_string() }
fn default_pollinterval() -> u64 { 500 }
fn default_probetimeout() -> u64 { 400 }
fn default_starttime() -> u64 { 30 }
fn default_stoptime() -> u64 { 5 }

/// Timings used while waiting for the child to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessTimings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub startup_timeout: Duration,
}

impl Default for ReadinessTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(default_pollinterval()),
            probe_timeout: Duration::from_millis(default_probetimeout()),
            startup_timeout: Duration::from_secs(default_starttime()),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: Mode,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub workingdir: Option<String>,
    pub env: Option<HashMap<String, String>>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub storagepath: String,
    #[serde(default = "default_healthpath")]
    pub healthpath: String,
    /// milliseconds
    #[serde(default = "default_pollinterval")]
    pub pollinterval: u64,
    /// milliseconds
    #[serde(default = "default_probetimeout")]
    pub probetimeout: u64,
    /// seconds
    #[serde(default = "default_starttime")]
    pub starttime: u64,
    /// seconds
    #[serde(default = "default_stoptime")]
    pub stoptime: u64,
}

impl BackendConfig {
    /// A config with every optional field at its default.
    pub fn new(mode: Mode, cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            mode,
            cmd: cmd.into(),
            args,
            workingdir: None,
            env: None,
            port: default_port(),
            storagepath: String::new(),
            healthpath: default_healthpath(),
            pollinterval: default_pollinterval(),
            probetimeout: default_probetimeout(),
            starttime: default_starttime(),
            stoptime: default_stoptime(),
        }
    }

    pub fn readiness(&self) -> ReadinessTimings {
        ReadinessTimings {
            poll_interval: Duration::from_millis(self.pollinterval),
            probe_timeout: Duration::from_millis(self.probetimeout),
            startup_timeout: Duration::from_secs(self.starttime),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stoptime)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}



/*
    @@@
    @parser();
    . Reads the content of the YAML config into a String. I/O errors (file not found, permission denied) come back as ConfigError::Io.
    . Hands the raw text to serde_yaml and maps it into Config; malformed YAML or a missing `cmd` comes back as ConfigError::Yaml.
*/
pub fn parser(path: &str) -> Result<Config, ConfigError> {
    let yaml_file = fs::read_to_string(path)?;
    let parsed_config: Config = serde_yaml::from_str(&yaml_file)?;
    Ok(parsed_config)
}
