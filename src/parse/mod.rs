mod parse;

pub use parse::{parser, BackendConfig, Config, ConfigError, Mode, ReadinessTimings};
