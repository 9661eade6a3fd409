use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// No loopback port could be bound between the preferred port and 65535.
    #[error("no free port found at or above {preferred}")]
    PortExhausted { preferred: u16 },

    /// The child could not be created.
    #[error("failed to spawn `{cmd}`: {source}")]
    ProcessSpawnError {
        cmd: String,
        #[source]
        source: io::Error,
    },

    /// The child exited before it signalled readiness.
    #[error("backend exited before becoming ready (code {code:?}, signal {signal:?})")]
    PrematureExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// Neither a ready message nor a health probe answered in time.
    #[error("backend not ready after {timeout:?}")]
    StartupTimeout { timeout: Duration },

    /// `start()` was already called on this supervisor.
    #[error("supervisor already started; build a new one to start again")]
    AlreadyStarted,

    /// The HTTP client used for readiness checks could not be built.
    #[error("cannot build health probe client: {0}")]
    ProbeSetup(#[source] reqwest::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::PortExhausted { .. } => "port_exhausted",
            SupervisorError::ProcessSpawnError { .. } => "process_spawn_error",
            SupervisorError::PrematureExit { .. } => "premature_exit",
            SupervisorError::StartupTimeout { .. } => "startup_timeout",
            SupervisorError::AlreadyStarted => "already_started",
            SupervisorError::ProbeSetup(_) => "probe_setup",
            SupervisorError::Io(_) => "io",
        }
    }
}
