//! Time-series metrics pipeline.
//!
//! Points are submitted asynchronously to a [`MetricsClient`], batched by a
//! worker task and shipped to the ingestion endpoint using the textual line
//! protocol. A self-probe task reports process statistics every second so a
//! daemon is observable even without application-level points.

pub mod line_protocol;

mod client;
mod point;
mod probe;

pub use client::{MetricsCfg, MetricsClient, MetricsError, DEFAULT_BATCH_SIZE, DEFAULT_URI};
pub use point::{FieldValue, Fields, Point, Tags};
