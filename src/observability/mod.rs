//! Observability for aerocast
//!
//! This module provides:
//! - Structured logging (JSON lines)
//! - Per-stack metrics counters
//! - Typed lifecycle events
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on protocol behavior
//! 3. No background threads
//! 4. Deterministic output
//!
//! # Usage
//!
//! ```ignore
//! use aerocast::observability::{log_event_with_fields, Event, MetricsRegistry};
//!
//! log_event_with_fields(Event::ViewInstalled, &[("view", "[a|3] (a, b)")]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.increment_messages_sent();
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

fn severity_of(event: Event) -> Severity {
    if event.is_fatal() {
        Severity::Fatal
    } else if event.is_warning() {
        Severity::Warn
    } else {
        Severity::Info
    }
}

/// Log a lifecycle event
pub fn log_event(event: Event) {
    Logger::log(severity_of(event), event.as_str(), &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(severity_of(event), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_severity() {
        assert_eq!(severity_of(Event::JoinFailed), Severity::Fatal);
        assert_eq!(severity_of(Event::MergeCancelled), Severity::Warn);
        assert_eq!(severity_of(Event::ViewInstalled), Severity::Info);
    }

    #[test]
    fn test_log_event_with_fields() {
        // Verifies no panic
        log_event(Event::ChannelConnecting);
        log_event_with_fields(Event::ViewInstalled, &[("view", "[a|1]")]);
    }
}
