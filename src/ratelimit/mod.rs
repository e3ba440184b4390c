//! Rate limiting logic and state management.

mod client;
mod limiter;
mod window;

pub use client::ClientId;
pub use limiter::{Decision, DenyReason, MissingClientPolicy, Quota, RateLimiter};
pub use window::{ClientWindowStore, WindowCount};
