//! dpa-gateway - Control loops of the data plane aggregator
//!
//! # Architecture
//!
//! ```text
//!   ResourceSource ──watch──▶ Controller ──keys──▶ WorkQueue
//!                                                     │
//!                                              single worker
//!                                                     │
//!                                                     ▼
//!                                             RouteRegistrar
//!
//!   ResourceSource ──list──▶ AvailabilityChecker ──▶ StatusWriter
//! ```
//!
//! The controller signals [`dpa_core::Readiness`] once its first full list
//! pass has been applied.

pub mod availability;
pub mod controller;
pub mod rate_limit;
pub mod workqueue;

pub use availability::{AvailabilityChecker, AvailabilityConfig, ProbeResult};
pub use controller::{Controller, ControllerConfig, InvalidConfig, ReconcileError};
pub use rate_limit::{
    controller_rate_limiter, ExponentialBackoff, MaxOf, RateLimiter, TokenBucket, MAX_BUCKET_DELAY,
};
pub use workqueue::WorkQueue;
