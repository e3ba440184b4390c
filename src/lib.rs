//! Floodgate - per-client admission control for HTTP services
//!
//! This crate admits or rejects requests against a per-client sliding-window
//! quota and logs one structured record for every request it sees, whether it
//! was served, rejected, failed downstream or was abandoned mid-flight.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod proxy;
pub mod ratelimit;
