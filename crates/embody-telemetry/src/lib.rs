//! Embody Telemetry - Logging setup for the Embody broker.
//!
//! Turns the `[logging]` configuration section into a `tracing`
//! subscriber with the requested format and output target.
//!
//! # Example
//!
//! ```rust,no_run
//! use embody_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Json)
//!     .with_directive("embody_session=trace");
//! setup_logging(&config).expect("failed to set up logging");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    DEFAULT_FILE_PREFIX, LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging,
};
