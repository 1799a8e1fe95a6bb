//! Observability
//!
//! - Structured one-line JSON logs with deterministic field order
//! - Typed lifecycle events
//! - Monotonic counters
//!
//! Observability never changes engine behavior: a failed log write is
//! ignored and counters are never read back by the engine itself.
//!
//! ```ignore
//! use seqvault::observability::{log_event_with_fields, Event, Logger};
//!
//! Logger::info("CUSTOM_EVENT", &[("rows", "42")]);
//! log_event_with_fields(Event::FlushComplete, &[("layer", "L3")]);
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

fn severity_for(event: Event) -> Severity {
    if event.is_fatal() {
        Severity::Fatal
    } else if event.is_warning() {
        Severity::Warn
    } else {
        Severity::Info
    }
}

pub fn log_event(event: Event) {
    Logger::log(severity_for(event), event.as_str(), &[]);
}

pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(severity_for(event), event.as_str(), fields);
}
