//! Per-destination queues flushed by a single drainer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{frames, BundleSink, Bundler};
use crate::address::Address;
use crate::message::Message;
use crate::sync::{lock, Drainer};

#[derive(Default)]
struct Pending {
    queues: HashMap<Option<Address>, Vec<Message>>,
    count: usize,
}

/// Appends under a short lock; whichever sender wins the drainer writes
/// everything queued, including what other threads added meanwhile.
pub struct PerDestinationBundler {
    sink: Arc<dyn BundleSink>,
    max_bundle_size: usize,
    pending: Mutex<Pending>,
    drainer: Drainer,
}

impl PerDestinationBundler {
    pub fn new(sink: Arc<dyn BundleSink>, max_bundle_size: usize) -> Self {
        Self {
            sink,
            max_bundle_size,
            pending: Mutex::new(Pending::default()),
            drainer: Drainer::new(),
        }
    }

    fn flush(&self) {
        let queues = {
            let mut pending = lock(&self.pending);
            pending.count = 0;
            std::mem::take(&mut pending.queues)
        };
        for (dest, messages) in queues {
            for frame in frames(messages, self.max_bundle_size) {
                self.sink.write(dest.as_ref(), &frame);
            }
        }
    }
}

impl Bundler for PerDestinationBundler {
    fn stop(&self) {
        self.drainer.run(|| self.flush());
    }

    fn send(&self, msg: Message) {
        {
            let mut pending = lock(&self.pending);
            pending.queues.entry(msg.dest().cloned()).or_default().push(msg);
            pending.count += 1;
        }
        self.drainer.run(|| self.flush());
    }

    fn size(&self) -> usize {
        lock(&self.pending).count
    }
}
