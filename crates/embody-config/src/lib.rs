//! Embody Config - Layered configuration for the Embody broker.
//!
//! Configuration is read from, lowest precedence first:
//! 1. The embedded `defaults.toml`
//! 2. A config file (explicit path, or `~/.embody/config.toml`)
//! 3. `EMBODY_*` environment variables
//!
//! The merged result is validated before it is returned.
//!
//! # Example
//!
//! ```
//! use embody_config::Config;
//!
//! let config = Config::from_toml_str("[sessions]\nviolation_threshold = 3\n").unwrap();
//! assert_eq!(config.sessions.violation_threshold, 3);
//! assert_eq!(config.protocol.clock_skew_ms, 300_000);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod env;
mod error;
mod loader;
mod types;
mod validate;

pub use env::{apply_env_overrides, collect_env_vars};
pub use error::{ConfigError, ConfigResult};
pub use loader::{default_config_path, load_with_env};
pub use types::{
    AuditBackend, AuditSection, Config, DiscoverySection, LoggingSection, ProtocolSection,
    ServiceSection, SessionsSection,
};
pub use validate::validate;
