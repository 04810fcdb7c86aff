//! Classwatch Server
//!
//! Live classroom session hub: WebSocket fan-out of session updates,
//! liveness probing, detection event ingest and the analytics API.
//!
//! Wiring, leaf-first: [`hub::BroadcastHub`] (registry + subscriptions),
//! [`hub::LivenessMonitor`], [`ingest::IngestPipeline`] (persist, count,
//! broadcast), [`engine`] (analysis engine client and poller) and the axum
//! surface in [`dashboard`].

pub mod auth;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod messages;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use hub::BroadcastHub;
pub use ingest::IngestPipeline;
