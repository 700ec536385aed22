//! Network broker shared library.
//!
//! Configuration model, allowlist and relay matchers, and the teardown
//! stack shared by the broker binary and its tests.

pub mod allowlist;
pub mod config;
pub mod error;
pub mod relay;
pub mod teardown;
pub mod token;

pub use error::{Error, Result};
