//! Outbound batching
//!
//! Bundlers sit between the transport protocol and the wire. They collect
//! outbound messages and hand them to a `BundleSink` as per-destination
//! lists, each list becoming one frame:
//! - messages to the same destination reach the sink in submission order
//! - a frame never exceeds `max_bundle_size` encoded bytes unless a single
//!   message does
//! - a message flagged `DONT_BUNDLE` always travels in a frame of its own
//!
//! Two implementations:
//! - `PerDestinationBundler`: per-destination queues, flushed by whichever
//!   sending thread wins the drainer
//! - `RingBufferBundler`: a bounded ring drained by one consumer thread

mod per_destination;
mod ring_buffer;
mod ring_bundler;

use std::sync::Arc;

pub use per_destination::PerDestinationBundler;
pub use ring_buffer::RingBuffer;
pub use ring_bundler::RingBufferBundler;

use crate::address::Address;
use crate::message::{encoded_size, Flags, Message};
use crate::stack::{BundlerKind, StackResult, TransportConfig};

/// Where bundles go.
pub trait BundleSink: Send + Sync {
    /// Write `messages` as one frame. `None` is a multicast.
    fn write(&self, dest: Option<&Address>, messages: &[Message]);
}

/// Outbound batching stage.
pub trait Bundler: Send + Sync {
    fn start(&self) {}

    /// Flush what is pending and stop accepting messages.
    fn stop(&self) {}

    fn send(&self, msg: Message);

    /// Messages accepted but not yet handed to the sink.
    fn size(&self) -> usize;
}

/// Build the bundler selected by `config`.
pub fn new_bundler(
    config: &TransportConfig,
    sink: Arc<dyn BundleSink>,
) -> StackResult<Arc<dyn Bundler>> {
    Ok(match config.bundler {
        BundlerKind::PerDestination => {
            Arc::new(PerDestinationBundler::new(sink, config.max_bundle_size))
        }
        BundlerKind::RingBuffer => Arc::new(RingBufferBundler::new(
            sink,
            config.max_bundle_size,
            config.ring_capacity,
        )?),
    })
}

/// Split one destination's messages into frames, preserving order.
pub(crate) fn frames(messages: Vec<Message>, max_bytes: usize) -> Vec<Vec<Message>> {
    let mut out = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut size = 0usize;
    for msg in messages {
        if msg.is_flag_set(Flags::DONT_BUNDLE) {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
                size = 0;
            }
            out.push(vec![msg]);
            continue;
        }
        let n = encoded_size(&msg);
        if !current.is_empty() && size + n > max_bytes {
            out.push(std::mem::take(&mut current));
            size = 0;
        }
        size += n;
        current.push(msg);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::sync::lock;
    use std::sync::Mutex;

    /// Sink remembering every frame it was given.
    #[derive(Default)]
    pub(crate) struct CollectSink {
        pub(crate) frames: Mutex<Vec<(Option<Address>, Vec<Message>)>>,
    }

    impl CollectSink {
        pub(crate) fn payloads_to(&self, dest: Option<&Address>) -> Vec<Vec<u8>> {
            lock(&self.frames)
                .iter()
                .filter(|(d, _)| d.as_ref() == dest)
                .flat_map(|(_, msgs)| msgs.iter().map(|m| m.payload().to_vec()))
                .collect()
        }

        pub(crate) fn frame_count(&self) -> usize {
            lock(&self.frames).len()
        }
    }

    impl BundleSink for CollectSink {
        fn write(&self, dest: Option<&Address>, messages: &[Message]) {
            lock(&self.frames).push((dest.cloned(), messages.to_vec()));
        }
    }
}
