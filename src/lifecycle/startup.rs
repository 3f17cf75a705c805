//! Startup orchestration.
//!
//! # Responsibilities
//! - Resolve configuration (defaults, or a TOML file named by the environment)
//! - Map a finished run to the process exit status
//!
//! # Design Decisions
//! - Fail fast: invalid config and bind failures are fatal
//! - A timed-out drain still exits 0

use std::path::Path;

use crate::config::{load_config, validate_config, ConfigError, ServerConfig};
use crate::lifecycle::coordinator::{LifecycleError, Outcome};

/// Environment variable naming an optional TOML config file.
pub const CONFIG_ENV: &str = "SERVICE_BOOTSTRAP_CONFIG";

/// Configuration for this process: the file in [`CONFIG_ENV`] if set, defaults otherwise.
pub fn load_config_from_env() -> Result<ServerConfig, ConfigError> {
    let path = std::env::var_os(CONFIG_ENV);
    resolve_config(path.as_deref().map(Path::new))
}

/// Load `path` if given, otherwise validate and return the defaults.
pub fn resolve_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            let config = ServerConfig::default();
            validate_config(&config).map_err(ConfigError::Validation)?;
            Ok(config)
        }
    }
}

/// Exit status for a finished run.
pub fn exit_status(result: &Result<Outcome, LifecycleError>) -> u8 {
    match result {
        Ok(Outcome::Drained) | Ok(Outcome::TimedOut) => 0,
        Err(_) => 1,
    }
}
