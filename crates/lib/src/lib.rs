//! Courier core library: the message bus, channel adapters (Signal, ntfy, iMessage, Omi),
//! configuration and runtime wiring used by the CLI.

pub mod bus;
pub mod channels;
pub mod config;
pub mod error;
pub mod exec;
pub mod runtime;
