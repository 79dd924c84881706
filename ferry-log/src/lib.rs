//! Logging facade for the ferry crates.
//!
//! All crates in this workspace log through the macros re-exported here, so
//! the embedding process controls output with a single [`init`] call. The
//! subscriber is built on `tracing-subscriber` with an environment filter;
//! `RUST_LOG` overrides the configured defaults.

#![warn(missing_docs)]

mod setup;

pub use self::setup::{init, init_test, LogConfig, LogFormat};

// Logging macros, so dependent crates do not need a direct tracing
// dependency.
pub use tracing::{debug, error, info, trace, warn};
