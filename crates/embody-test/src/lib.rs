//! Embody Test - Shared fixtures and mocks for the Embody workspace.
//!
//! Use as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! embody-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use embody_test::{MockToolBackend, TestAgent, dev_box, test_broker};
//!
//! let broker = test_broker();
//! let host = TestAgent::new("host-1");
//! let body = dev_box("dev-box", &host.id);
//! MockToolBackend::new().install(broker.tools(), &body);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
