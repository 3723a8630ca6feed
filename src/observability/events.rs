//! Observable lifecycle events
//!
//! Events are explicit and typed. Per-message activity is not an event;
//! it is counted in `MetricsRegistry` instead.

use std::fmt;

/// Observable events of a channel and its protocol stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Channel lifecycle
    /// Stack configuration loaded and validated
    ConfigLoaded,
    /// connect() begins
    ChannelConnecting,
    /// connect() succeeded, a view containing the local member is installed
    ChannelConnected,
    /// disconnect() completed
    ChannelDisconnected,
    /// close() completed
    ChannelClosed,

    // Membership
    /// Join attempt timed out and is retried
    JoinRetry,
    /// Join gave up after the maximum number of attempts (FATAL)
    JoinFailed,
    /// Join request rejected by the coordinator
    JoinRejected,
    /// A new view was installed
    ViewInstalled,
    /// Not every member acknowledged a view in time
    ViewAckTimeout,
    /// Local member became coordinator
    BecameCoordinator,
    /// A member was suspected
    MemberSuspected,
    /// Leave completed
    LeaveComplete,

    // Merge
    /// Merge leader started a merge
    MergeStarted,
    /// Merged view installed
    MergeCompleted,
    /// Merge cancelled (timeout, rejection or killer)
    MergeCancelled,

    // Reliable multicast
    /// Digest set / merged / overwritten
    DigestInstalled,
    /// Post-merge rebroadcast begins
    RebroadcastStarted,
    /// Post-merge rebroadcast finished
    RebroadcastCompleted,

    // Reliable unicast
    /// Connection to a peer established
    ConnectionOpened,
    /// Connection closed (by peer, by reset or locally)
    ConnectionClosed,
    /// Idle connection expired
    ConnectionExpired,

    // Flow control
    /// A sender blocked waiting for credits
    FlowControlBlocked,

    // Transport
    /// Inbound frame could not be decoded
    FrameDropped,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::ChannelConnecting => "CHANNEL_CONNECTING",
            Event::ChannelConnected => "CHANNEL_CONNECTED",
            Event::ChannelDisconnected => "CHANNEL_DISCONNECTED",
            Event::ChannelClosed => "CHANNEL_CLOSED",

            Event::JoinRetry => "JOIN_RETRY",
            Event::JoinFailed => "JOIN_FAILED",
            Event::JoinRejected => "JOIN_REJECTED",
            Event::ViewInstalled => "VIEW_INSTALLED",
            Event::ViewAckTimeout => "VIEW_ACK_TIMEOUT",
            Event::BecameCoordinator => "BECAME_COORDINATOR",
            Event::MemberSuspected => "MEMBER_SUSPECTED",
            Event::LeaveComplete => "LEAVE_COMPLETE",

            Event::MergeStarted => "MERGE_STARTED",
            Event::MergeCompleted => "MERGE_COMPLETED",
            Event::MergeCancelled => "MERGE_CANCELLED",

            Event::DigestInstalled => "DIGEST_INSTALLED",
            Event::RebroadcastStarted => "REBROADCAST_STARTED",
            Event::RebroadcastCompleted => "REBROADCAST_COMPLETED",

            Event::ConnectionOpened => "CONNECTION_OPENED",
            Event::ConnectionClosed => "CONNECTION_CLOSED",
            Event::ConnectionExpired => "CONNECTION_EXPIRED",

            Event::FlowControlBlocked => "FLOW_CONTROL_BLOCKED",

            Event::FrameDropped => "FRAME_DROPPED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::JoinFailed)
    }

    /// Returns true for recoverable anomalies worth a WARN line
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Event::JoinRetry
                | Event::JoinRejected
                | Event::ViewAckTimeout
                | Event::MemberSuspected
                | Event::MergeCancelled
                | Event::FlowControlBlocked
                | Event::FrameDropped
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_events_have_string_representation() {
        let events = [
            Event::ConfigLoaded,
            Event::ChannelConnecting,
            Event::ChannelConnected,
            Event::ChannelDisconnected,
            Event::ChannelClosed,
            Event::JoinRetry,
            Event::JoinFailed,
            Event::JoinRejected,
            Event::ViewInstalled,
            Event::ViewAckTimeout,
            Event::BecameCoordinator,
            Event::MemberSuspected,
            Event::LeaveComplete,
            Event::MergeStarted,
            Event::MergeCompleted,
            Event::MergeCancelled,
            Event::DigestInstalled,
            Event::RebroadcastStarted,
            Event::RebroadcastCompleted,
            Event::ConnectionOpened,
            Event::ConnectionClosed,
            Event::ConnectionExpired,
            Event::FlowControlBlocked,
            Event::FrameDropped,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::JoinFailed.is_fatal());
        assert!(!Event::ViewInstalled.is_fatal());
        assert!(!Event::MergeCancelled.is_fatal());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::MergeCompleted), "MERGE_COMPLETED");
    }
}
