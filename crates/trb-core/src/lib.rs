//! Core domain + application logic for the multi-account relay bot.
//!
//! This crate is intentionally framework-agnostic. The platform client
//! library, the relational store and the durable broker live behind ports
//! (traits) implemented in adapter crates.

pub mod auth;
pub mod client;
pub mod config;
pub mod control;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod expiry;
pub mod logging;
pub mod ports;
pub mod queue;
pub mod registry;
pub mod relay;

#[cfg(test)]
pub(crate) mod testutil;

pub use errors::{Error, Result};
