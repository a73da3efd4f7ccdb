//! Observability for the SFU service.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sfu_rooms_active` | Gauge | none |
//! | `sfu_peers_active` | Gauge | none |
//! | `sfu_connections_active` | Gauge | none |
//! | `sfu_signaling_requests_total` | Counter | `type`, `status` |
//! | `sfu_signaling_request_duration_seconds` | Histogram | `type` |
//! | `sfu_push_dropped_total` | Counter | none |
//! | `sfu_close_failures_total` | Counter | `resource` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
