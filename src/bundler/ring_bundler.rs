//! Ring-buffer bundler with one consumer thread.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{frames, BundleSink, Bundler, RingBuffer};
use crate::address::Address;
use crate::message::Message;
use crate::observability::{log_event_with_fields, Event};
use crate::sync::lock;
use crate::window::WindowResult;

const PUT_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_WAIT: Duration = Duration::from_millis(50);

struct Shared {
    ring: RingBuffer<Message>,
    sink: Arc<dyn BundleSink>,
    max_bundle_size: usize,
}

impl Shared {
    fn run(&self) {
        let mut batch = Vec::with_capacity(self.ring.capacity());
        loop {
            if !self.ring.wait_readable(IDLE_WAIT) {
                if self.ring.is_closed() {
                    return;
                }
                continue;
            }
            self.ring.drain_to(&mut batch, self.ring.capacity());
            self.write(std::mem::take(&mut batch));
        }
    }

    fn write(&self, batch: Vec<Message>) {
        // Group by destination, keeping first-seen destination order.
        let mut groups: Vec<(Option<Address>, Vec<Message>)> = Vec::new();
        for msg in batch {
            let dest = msg.dest().cloned();
            match groups.iter_mut().find(|(d, _)| *d == dest) {
                Some((_, msgs)) => msgs.push(msg),
                None => groups.push((dest, vec![msg])),
            }
        }
        for (dest, messages) in groups {
            for frame in frames(messages, self.max_bundle_size) {
                self.sink.write(dest.as_ref(), &frame);
            }
        }
    }
}

/// Producers put into a bounded ring; a single thread drains it and writes
/// per-destination frames.
pub struct RingBufferBundler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RingBufferBundler {
    pub fn new(
        sink: Arc<dyn BundleSink>,
        max_bundle_size: usize,
        capacity: usize,
    ) -> WindowResult<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                ring: RingBuffer::new(capacity)?,
                sink,
                max_bundle_size,
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn ring(&self) -> &RingBuffer<Message> {
        &self.shared.ring
    }
}

impl Bundler for RingBufferBundler {
    fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() || self.shared.ring.is_closed() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("aerocast-bundler".into())
            .spawn(move || shared.run())
        {
            Ok(handle) => *worker = Some(handle),
            Err(e) => log_event_with_fields(
                Event::FrameDropped,
                &[("reason", "bundler thread not started"), ("error", &e.to_string())],
            ),
        }
    }

    fn stop(&self) {
        self.shared.ring.close();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn send(&self, msg: Message) {
        if let Err(msg) = self.shared.ring.put(msg, Some(PUT_TIMEOUT)) {
            // Reliable protocols above resend; unreliable traffic is lost.
            log_event_with_fields(
                Event::FrameDropped,
                &[("reason", "bundler ring full or closed"), ("message", &msg.to_string())],
            );
        }
    }

    fn size(&self) -> usize {
        self.shared.ring.size()
    }
}

impl Drop for RingBufferBundler {
    fn drop(&mut self) {
        self.shared.ring.close();
    }
}
