//! Configuration for the server, store backends, HTTP facade, and worker
//! queues.
//!
//! A deployment is described by a single YAML file:
//!
//! ```yaml
//! server:
//!   collection: jobs
//!   promote_interval: 15000
//!   start_stopped: false
//!   stale_run_reply: rejected
//!   cancel_repeats_match: type_only
//! store:
//!   type: sqlite
//!   path: /var/lib/quarry/jobs.db
//! api:
//!   host: 127.0.0.1
//!   port: 8566
//! ```
//!
//! Every section is optional; omitted fields take their defaults. The two
//! `stale_run_reply` / `cancel_repeats_match` knobs select between the
//! behaviors deployments of the original system disagree on.

mod error;
mod types;

pub use error::ConfigError;
pub use types::{
    ApiConfig, CancelRepeatsMatch, Config, QueueConfig, ServerConfig, StaleRunReply, StoreConfig,
};

use std::path::Path;

/// Load and validate a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
