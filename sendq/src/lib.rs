//! Configuration, wiring and reporting behind the `sendq` command

pub mod config;
pub mod controller;
pub mod report;

pub use config::Sendq;
pub use controller::{Controller, SHUTDOWN_BROADCAST};
