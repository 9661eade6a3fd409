/* src/lib.rs */

pub mod error;
pub mod parse;
pub mod port;
pub mod runtime;
pub mod readiness;
pub mod control;
pub mod supervisor;
pub mod shell;
pub mod logger;

pub use error::SupervisorError;
pub use parse::{BackendConfig, Mode};
pub use supervisor::{CrashHandler, Phase, Status, Supervisor};
