//! Metrics registry
//!
//! - Counters only, monotonic
//! - One registry per protocol stack, no process-global state
//! - Thread-safe, lock-free (relaxed atomics)

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($( $(#[$doc:meta])* $name:ident => $inc:ident, $add:ident; )*) => {
        /// Operational counters of one protocol stack.
        #[derive(Debug, Default)]
        pub struct MetricsRegistry {
            $( $(#[$doc])* $name: AtomicU64, )*
        }

        impl MetricsRegistry {
            $(
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }

                pub fn $add(&self, n: u64) {
                    self.$name.fetch_add(n, Ordering::Relaxed);
                }
            )*

            /// Get all metrics as a snapshot
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $( $name: self.$name.load(Ordering::Relaxed), )*
                }
            }
        }

        /// A point-in-time snapshot of all metrics
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct MetricsSnapshot {
            $( pub $name: u64, )*
        }
    };
}

counters! {
    /// Application messages handed to the stack
    messages_sent => increment_messages_sent, add_messages_sent;
    /// Messages decoded from inbound frames
    messages_received => increment_messages_received, add_messages_received;
    /// Messages delivered to the application
    messages_delivered => increment_messages_delivered, add_messages_delivered;
    /// Frame bytes written to the transport
    bytes_sent => increment_bytes_sent, add_bytes_sent;
    /// Frames written to the transport
    batches_sent => increment_batches_sent, add_batches_sent;
    /// Duplicate or stale messages discarded
    duplicates_discarded => increment_duplicates_discarded, add_duplicates_discarded;
    /// Retransmission requests sent
    xmit_requests_sent => increment_xmit_requests_sent, add_xmit_requests_sent;
    /// Retransmission requests received
    xmit_requests_received => increment_xmit_requests_received, add_xmit_requests_received;
    /// Messages resent in answer to a request
    xmit_responses_sent => increment_xmit_responses_sent, add_xmit_responses_sent;
    /// Seqnos detected as missing
    missing_messages => increment_missing_messages, add_missing_messages;
    /// Times a sender had to wait for credits
    credit_blocks => increment_credit_blocks, add_credit_blocks;
    /// Messages queued for lack of credits
    queued_messages => increment_queued_messages, add_queued_messages;
    /// Fragments produced
    fragments_sent => increment_fragments_sent, add_fragments_sent;
    /// Messages reassembled from fragments
    fragments_reassembled => increment_fragments_reassembled, add_fragments_reassembled;
    /// Views installed
    views_installed => increment_views_installed, add_views_installed;
    /// Merges completed
    merges_completed => increment_merges_completed, add_merges_completed;
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot as a JSON object
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
