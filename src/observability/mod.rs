//! Observability for log units
//!
//! - Structured JSON logging with a process-wide minimum severity
//! - Typed lifecycle and hot-path events
//! - Per-unit atomic counters
//!
//! Observability is read-only: nothing here changes what a log unit does,
//! and a failed log write is ignored.
//!
//! ```ignore
//! use samwal::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::LogTrimmed, &[("head_lsn", "4096")]);
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{enabled, Logger, Severity};
pub use metrics::{KindCount, MetricsRegistry, MetricsSnapshot};
pub use scope::ObservationScope;

/// Log an event at its own severity.
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log an event with fields at its own severity.
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
