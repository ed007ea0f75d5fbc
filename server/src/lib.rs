//! Quota ledger HTTP server.
//!
//! The binary in `main.rs` wires the pieces together; this library exposes
//! the environment [`Config`](config::Config) so it can be tested without a
//! process environment.

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]

pub mod config;

pub use config::Config;
