//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - Well-known discovery (WebFinger, NodeInfo)
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::{metrics_router, track_http_metrics};
pub use wellknown::wellknown_router;
