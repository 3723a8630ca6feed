//! FRAG protocol implementation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use super::table::FragmentTable;
use crate::message::{FragHeader, Header, Message, ProtocolId, MAX_FRAGMENTS};
use crate::observability::{Logger, Severity};
use crate::stack::{Event, FragConfig, Layer, Protocol, StackError, StackResult};
use crate::sync::lock;
use crate::timer::TaskHandle;

struct Inner {
    config: FragConfig,
    layer: OnceLock<Layer>,
    table: FragmentTable,
    next_id: AtomicU64,
    expiry_task: Mutex<Option<TaskHandle>>,
    running: AtomicBool,
}

/// Splits payloads larger than `frag_size` into numbered fragments and
/// reassembles them on the receiving side.
pub struct Frag {
    inner: Arc<Inner>,
}

impl Frag {
    pub fn new(config: FragConfig) -> StackResult<Self> {
        if config.frag_size == 0 {
            return Err(StackError::config("frag_size must be > 0"));
        }
        if config.max_fragments == 0 || config.max_fragments > MAX_FRAGMENTS {
            return Err(StackError::config(format!(
                "max_fragments must be in [1, {}]",
                MAX_FRAGMENTS
            )));
        }
        let timeout = config.reassembly_timeout();
        let max_fragments = config.max_fragments;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                layer: OnceLock::new(),
                table: FragmentTable::new(timeout, max_fragments),
                next_id: AtomicU64::new(1),
                expiry_task: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Incomplete fragment sets being held.
    pub fn pending_sets(&self) -> usize {
        self.inner.table.len()
    }
}

impl Inner {
    fn layer(&self) -> StackResult<&Layer> {
        self.layer.get().ok_or(StackError::NotConnected)
    }

    fn fragment(&self, layer: &Layer, msg: Message) -> StackResult<()> {
        let size = self.config.frag_size;
        if msg.len() <= size {
            return layer.down(Event::Message(msg));
        }
        let payload = msg.payload().clone();
        let needed = payload.len().div_ceil(size) as u64;
        if needed > self.config.max_fragments as u64 {
            return Err(StackError::MessageTooLarge {
                size: payload.len(),
                fragments: needed,
                limit: self.config.max_fragments,
            });
        }
        let count = needed as u32;
        let frag_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        layer.metrics().add_fragments_sent(count as u64);
        for index in 0..count {
            let start = index as usize * size;
            let end = (start + size).min(payload.len());
            let mut piece = msg.copy(true);
            piece.set_payload(payload.slice(start..end));
            piece.put_header(
                ProtocolId::FRAG,
                Header::Frag(FragHeader {
                    frag_id,
                    index,
                    count,
                }),
            );
            layer.down(Event::Message(piece))?;
        }
        Ok(())
    }

    /// Returns the message to pass up: unfragmented messages as they are,
    /// fragments only once their set is complete.
    fn unfragment(&self, layer: &Layer, msg: Message) -> Option<Message> {
        let header = match msg.header(ProtocolId::FRAG) {
            Some(Header::Frag(h)) => *h,
            _ => return Some(msg),
        };
        let sender = msg.src()?.clone();
        let whole = self
            .table
            .add(&sender, header, msg, layer.scheduler().now())?;
        layer.metrics().increment_fragments_reassembled();
        Some(whole)
    }

    fn start(self: &Arc<Self>) -> StackResult<()> {
        let layer = self.layer()?;
        self.running.store(true, Ordering::Release);
        let period = self.config.reassembly_timeout();
        if !period.is_zero() {
            let weak: Weak<Inner> = Arc::downgrade(self);
            let handle = layer.scheduler().schedule_at_fixed_rate(
                period,
                period,
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire();
                    }
                }),
            );
            if let Some(old) = lock(&self.expiry_task).replace(handle) {
                old.cancel();
            }
        }
        Ok(())
    }

    fn expire(&self) {
        let Ok(layer) = self.layer() else {
            return;
        };
        let dropped = self.table.expire(layer.scheduler().now());
        if dropped > 0 && Logger::enabled(Severity::Trace) {
            Logger::trace("FRAG_SETS_EXPIRED", &[("count", &dropped.to_string())]);
        }
    }
}

impl Protocol for Frag {
    fn name(&self) -> &'static str {
        "FRAG"
    }

    fn id(&self) -> Option<ProtocolId> {
        Some(ProtocolId::FRAG)
    }

    fn init(&self, layer: Layer) -> StackResult<()> {
        let _ = self.inner.layer.set(layer);
        Ok(())
    }

    fn start(&self) -> StackResult<()> {
        self.inner.start()
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = lock(&self.inner.expiry_task).take() {
            task.cancel();
        }
        self.inner.table.clear();
    }

    fn down(&self, evt: Event) -> StackResult<()> {
        let layer = self.inner.layer()?;
        match evt {
            Event::Message(msg) => self.inner.fragment(layer, msg),
            evt => layer.down(evt),
        }
    }

    fn up(&self, evt: Event) {
        let Ok(layer) = self.inner.layer() else {
            return;
        };
        match evt {
            Event::Message(msg) => {
                if let Some(msg) = self.inner.unfragment(layer, msg) {
                    layer.up(Event::Message(msg));
                }
            }
            Event::Batch(mut batch) => {
                let fragments = batch.take_matching(|m| m.header(ProtocolId::FRAG).is_some());
                let whole: Vec<Message> = fragments
                    .into_iter()
                    .filter_map(|m| self.inner.unfragment(layer, m))
                    .collect();
                if !batch.is_empty() {
                    layer.up(Event::Batch(batch));
                }
                for msg in whole {
                    layer.up(Event::Message(msg));
                }
            }
            Event::ViewChange(view) => {
                self.inner.table.retain_members(&view);
                layer.up(Event::ViewChange(view));
            }
            evt => layer.up(evt),
        }
    }
}
