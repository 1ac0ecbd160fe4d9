//! Observability for the signaling relay.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Credentials and payloads are never recorded. Metric labels are bounded:
//! - `result`: join outcome labels from `RelayError::as_label` plus `success`
//! - `message_type`: bounded by the client message types (5 values)
//! - `reason`: bounded by `CloseReason` (7 values) plus `peer_closed`
//! - `operation`: bounded by `ParticipantStore` methods (4 values)
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_connections_active` | Gauge | none | Open WebSocket connections |
//! | `relay_rooms_active` | Gauge | none | Non-empty rooms |
//! | `relay_joins_total` | Counter | `result` | Join attempts by outcome |
//! | `relay_messages_total` | Counter | `message_type` | Client messages processed |
//! | `relay_connections_closed_total` | Counter | `reason` | Connection closes by reason |
//! | `relay_store_latency_seconds` | Histogram | `operation` | Participant store latency |
//! | `relay_store_errors_total` | Counter | `operation` | Participant store failures |
//! | `relay_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure per actor type |
//! | `relay_messages_dropped_total` | Counter | `actor_type` | Outbound frames dropped |
//! | `relay_actor_panics_total` | Counter | `actor_type` | Actor panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
