//! Integration tests for Embody.
//!
//! Not published and holds no library code. The tests in `tests/` drive a
//! broker end to end through signed envelopes and the session endpoint.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
