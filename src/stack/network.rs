//! In-memory network
//!
//! A process-local fabric connecting any number of endpoints, used by the
//! scenario tests and the `simulate` command. Each endpoint gets its own
//! delivery thread fed by a crossbeam channel, so frames from one sender
//! arrive in send order. The fabric also plays failure detector and
//! discovery service:
//! - `partition(groups)` splits the members; each side is told to suspect
//!   the members it can no longer reach
//! - `heal()` reconnects everyone
//! - `crash(addr)` kills a member; survivors are told to suspect it
//! - `drop_next` / `drop_matching` lose frames or messages on purpose
//!
//! Unicast to a crashed member fails with `ConnectionReset`, to a member
//! that never existed with `Unreachable`. Traffic across a partition is
//! silently lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Sender};

use super::discovery::{Discovery, PingData};
use super::errors::{TransportError, TransportResult};
use super::transport::{Transport, TransportHandler};
use crate::address::Address;
use crate::message::{decode_frame, encode_frame, HeaderRegistry, Message};
use crate::sync::{lock, read, write};

/// Decides whether a message from `from` to `to` is lost.
pub type MessageFilter = Arc<dyn Fn(&Address, &Address, &Message) -> bool + Send + Sync>;

enum Delivery {
    Frame(Address, Bytes),
    Suspect(Address),
    Stop,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NodeState {
    Running,
    Crashed,
}

struct Node {
    state: NodeState,
    tx: Option<Sender<Delivery>>,
}

#[derive(Default)]
struct Drops {
    next: HashMap<(Address, Address), u32>,
    filters: Vec<MessageFilter>,
}

struct NetInner {
    nodes: RwLock<HashMap<Address, Node>>,
    /// Partition group per member; `None` when fully connected.
    groups: RwLock<Option<HashMap<Address, usize>>>,
    drops: Mutex<Drops>,
    pings: RwLock<HashMap<Address, PingData>>,
    registry: HeaderRegistry,
}

impl NetInner {
    fn reachable(&self, from: &Address, to: &Address) -> bool {
        if from == to {
            return true;
        }
        match &*read(&self.groups) {
            None => true,
            Some(groups) => match (groups.get(from), groups.get(to)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn is_running(&self, addr: &Address) -> bool {
        read(&self.nodes)
            .get(addr)
            .map(|n| n.state == NodeState::Running && n.tx.is_some())
            .unwrap_or(false)
    }

    /// Apply drop rules. Returns the frame to deliver, if anything is left.
    fn filter(&self, from: &Address, to: &Address, data: Bytes) -> Option<Bytes> {
        let mut drops = lock(&self.drops);
        if let Some(n) = drops.next.get_mut(&(from.clone(), to.clone())) {
            if *n > 0 {
                *n -= 1;
                return None;
            }
        }
        if drops.filters.is_empty() {
            return Some(data);
        }
        let filters = drops.filters.clone();
        drop(drops);

        let Ok(frame) = decode_frame(&data, &self.registry) else {
            return Some(data);
        };
        let total = frame.messages.len();
        let kept: Vec<Message> = frame
            .messages
            .into_iter()
            .filter(|m| !filters.iter().any(|f| f(from, to, m)))
            .collect();
        if kept.is_empty() {
            return None;
        }
        if kept.len() == total {
            return Some(data);
        }
        Some(encode_frame(&frame.cluster, frame.multicast, &kept))
    }

    fn deliver(&self, from: &Address, to: &Address, data: Bytes) {
        let Some(data) = self.filter(from, to, data) else {
            return;
        };
        let nodes = read(&self.nodes);
        if let Some(Node {
            state: NodeState::Running,
            tx: Some(tx),
        }) = nodes.get(to)
        {
            let _ = tx.send(Delivery::Frame(from.clone(), data));
        }
    }

    fn notify_suspect(&self, at: &Address, suspect: &Address) {
        let nodes = read(&self.nodes);
        if let Some(Node {
            state: NodeState::Running,
            tx: Some(tx),
        }) = nodes.get(at)
        {
            let _ = tx.send(Delivery::Suspect(suspect.clone()));
        }
    }

    fn running(&self) -> Vec<Address> {
        let mut members: Vec<Address> = read(&self.nodes)
            .iter()
            .filter(|(_, n)| n.state == NodeState::Running && n.tx.is_some())
            .map(|(a, _)| a.clone())
            .collect();
        members.sort();
        members
    }
}

/// A simulated network shared by every endpoint created from it.
#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Arc<NetInner>,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetInner {
                nodes: RwLock::new(HashMap::new()),
                groups: RwLock::new(None),
                drops: Mutex::new(Drops::default()),
                pings: RwLock::new(HashMap::new()),
                registry: HeaderRegistry::with_defaults(),
            }),
        }
    }

    /// A transport endpoint for `local`.
    pub fn endpoint(&self, local: Address) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            local,
            net: Arc::clone(&self.inner),
        })
    }

    /// This network as a discovery service.
    pub fn discovery(&self) -> Arc<dyn Discovery> {
        Arc::new(self.clone())
    }

    /// Split the members into `groups`. Members not listed are isolated.
    /// Every running member suspects the running members it can no longer
    /// reach.
    pub fn partition(&self, groups: &[Vec<Address>]) {
        let mut map = HashMap::new();
        for (i, group) in groups.iter().enumerate() {
            for addr in group {
                map.insert(addr.clone(), i);
            }
        }
        *write(&self.inner.groups) = Some(map);

        let running = self.inner.running();
        for at in &running {
            for other in &running {
                if !self.inner.reachable(at, other) {
                    self.inner.notify_suspect(at, other);
                }
            }
        }
    }

    /// Remove every partition.
    pub fn heal(&self) {
        *write(&self.inner.groups) = None;
    }

    /// Kill `addr`: it stops receiving, its sends fail, and every other
    /// running member suspects it.
    pub fn crash(&self, addr: &Address) {
        let tx = {
            let mut nodes = write(&self.inner.nodes);
            match nodes.get_mut(addr) {
                Some(node) => {
                    node.state = NodeState::Crashed;
                    node.tx.take()
                }
                None => None,
            }
        };
        if let Some(tx) = tx {
            let _ = tx.send(Delivery::Stop);
        }
        write(&self.inner.pings).remove(addr);
        for at in self.inner.running() {
            if self.inner.reachable(&at, addr) {
                self.inner.notify_suspect(&at, addr);
            }
        }
    }

    /// Lose the next `count` frames sent from `from` to `to`.
    pub fn drop_next(&self, from: &Address, to: &Address, count: u32) {
        lock(&self.inner.drops)
            .next
            .insert((from.clone(), to.clone()), count);
    }

    /// Lose every message for which `filter(from, to, msg)` holds, until
    /// `clear_drops` is called.
    pub fn drop_matching(
        &self,
        filter: impl Fn(&Address, &Address, &Message) -> bool + Send + Sync + 'static,
    ) {
        lock(&self.inner.drops).filters.push(Arc::new(filter));
    }

    pub fn clear_drops(&self) {
        *lock(&self.inner.drops) = Drops::default();
    }

    /// Running members, in address order.
    pub fn members(&self) -> Vec<Address> {
        self.inner.running()
    }

    pub fn is_reachable(&self, from: &Address, to: &Address) -> bool {
        self.inner.reachable(from, to)
    }
}

impl Discovery for InMemoryNetwork {
    fn find_members(&self, requester: &Address, cluster: &str) -> Vec<PingData> {
        let mut found: Vec<PingData> = read(&self.inner.pings)
            .values()
            .filter(|p| {
                &p.address != requester
                    && p.cluster == cluster
                    && self.inner.is_running(&p.address)
                    && self.inner.reachable(requester, &p.address)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.address.cmp(&b.address));
        found
    }

    fn publish(&self, data: PingData) {
        write(&self.inner.pings).insert(data.address.clone(), data);
    }

    fn withdraw(&self, member: &Address) {
        write(&self.inner.pings).remove(member);
    }
}

/// One member's attachment to an `InMemoryNetwork`.
pub struct InMemoryTransport {
    local: Address,
    net: Arc<NetInner>,
}

impl Transport for InMemoryTransport {
    fn local_address(&self) -> &Address {
        &self.local
    }

    fn start(&self, handler: Arc<dyn TransportHandler>) -> TransportResult<()> {
        let (tx, rx) = unbounded();
        {
            let mut nodes = write(&self.net.nodes);
            if let Some(node) = nodes.get(&self.local) {
                if node.state == NodeState::Crashed {
                    return Err(TransportError::Closed);
                }
            }
            nodes.insert(
                self.local.clone(),
                Node {
                    state: NodeState::Running,
                    tx: Some(tx),
                },
            );
        }
        let spawned = thread::Builder::new()
            .name(format!("aerocast-net-{}", self.local))
            .spawn(move || {
                for delivery in rx {
                    match delivery {
                        Delivery::Frame(from, data) => handler.receive(&from, data),
                        Delivery::Suspect(member) => handler.suspect(&member),
                        Delivery::Stop => break,
                    }
                }
            });
        if spawned.is_err() {
            write(&self.net.nodes).remove(&self.local);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn send_unicast(&self, dest: &Address, data: Bytes) -> TransportResult<()> {
        if !self.net.is_running(&self.local) {
            return Err(TransportError::Closed);
        }
        let state = read(&self.net.nodes).get(dest).map(|n| n.state);
        match state {
            None => Err(TransportError::Unreachable(dest.to_string())),
            Some(NodeState::Crashed) => Err(TransportError::ConnectionReset(dest.to_string())),
            Some(NodeState::Running) => {
                if self.net.reachable(&self.local, dest) {
                    self.net.deliver(&self.local, dest, data);
                }
                Ok(())
            }
        }
    }

    fn send_multicast(&self, data: Bytes) -> TransportResult<()> {
        if !self.net.is_running(&self.local) {
            return Err(TransportError::Closed);
        }
        for member in self.net.running() {
            if member != self.local && self.net.reachable(&self.local, &member) {
                self.net.deliver(&self.local, &member, data.clone());
            }
        }
        Ok(())
    }

    fn stop(&self) {
        let tx = {
            let mut nodes = write(&self.net.nodes);
            match nodes.get(&self.local).map(|n| n.state) {
                Some(NodeState::Running) => nodes.remove(&self.local).and_then(|n| n.tx),
                _ => None,
            }
        };
        if let Some(tx) = tx {
            let _ = tx.send(Delivery::Stop);
        }
        write(&self.net.pings).remove(&self.local);
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("local", &self.local)
            .finish()
    }
}
