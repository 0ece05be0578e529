//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - Discovery (WebFinger, NodeInfo, host-meta)
//! - Operations (metrics, health)

mod activitypub;
mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::{ops_router, track_requests};
pub use wellknown::wellknown_router;
