//! Batched activity telemetry.

mod batcher;
mod event;

pub use batcher::{CloseOptions, TelemetryBatcher, TelemetryConfig};
pub use event::{EventType, TelemetryEvent};
