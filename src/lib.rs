//! Payrail Backend Library
//!
//! Outbound payouts engine: idempotent intake, ledger holds, worker-driven
//! dispatch over pluggable bank connectors, SLA tracking, batches, and an
//! audit/alert trail. Exposed as a library so the API server and the
//! worker binary share one wiring.

pub mod api;
pub mod batch;
pub mod config;
pub mod connectors;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod models;
pub mod routing;
pub mod service;
pub mod sla;
pub mod store;
pub mod worker;

pub mod bootstrap;

pub use config::Config;
pub use error::{PayoutError, PayoutResult};
