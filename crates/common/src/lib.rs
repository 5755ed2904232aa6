pub mod dto;
pub mod error;
pub mod observability;


pub use dto::*;
pub use error::{Error, ErrorReport, Result};
pub use observability::{GenerationId, GenerationTelemetry, PerformanceTracker, TelemetrySnapshot};
