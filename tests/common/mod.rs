//! Shared helpers for multi-member scenarios on the in-memory network.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use aerocast::address::Address;
use aerocast::message::Message;
use aerocast::stack::{Channel, InMemoryNetwork, Receiver, StackConfig};
use aerocast::timer::{Scheduler, TokioScheduler};
use aerocast::view::View;

pub const WAIT: Duration = Duration::from_secs(15);
pub const POLL: Duration = Duration::from_millis(10);

pub fn addr(n: u128) -> Address {
    Address::from_u128(n)
}

/// Timeouts short enough for tests, merge detection off.
pub fn test_config() -> StackConfig {
    let mut config = StackConfig::default();
    config.gms.join_timeout_ms = 300;
    config.gms.max_join_attempts = 5;
    config.gms.view_ack_collection_timeout_ms = 300;
    config.gms.leave_timeout_ms = 500;
    config.gms.merge_min_interval_ms = 0;
    config.gms.merge_max_interval_ms = 0;
    config.nakack.stable_interval_ms = 200;
    config
}

/// `test_config` with merge detection every few hundred milliseconds.
pub fn merge_config() -> StackConfig {
    let mut config = test_config();
    config.gms.merge_min_interval_ms = 200;
    config.gms.merge_max_interval_ms = 500;
    config.gms.merge_timeout_ms = 500;
    config.gms.rebroadcast_timeout_ms = 1000;
    config
}

/// Records deliveries and installed views.
#[derive(Default)]
pub struct Recorder {
    messages: Mutex<Vec<(Option<Address>, Bytes)>>,
    views: Mutex<Vec<View>>,
}

impl Recorder {
    pub fn payloads(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    /// Payloads sent by `sender`, in delivery order.
    pub fn payloads_from(&self, sender: &Address) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(src, _)| src.as_ref() == Some(sender))
            .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn views(&self) -> Vec<View> {
        self.views.lock().unwrap().clone()
    }
}

impl Receiver for Recorder {
    fn receive(&self, msg: Message) {
        self.messages
            .lock()
            .unwrap()
            .push((msg.src().cloned(), msg.payload().clone()));
    }

    fn view_accepted(&self, view: &View) {
        self.views.lock().unwrap().push(view.clone());
    }
}

pub struct Member {
    pub channel: Channel,
    pub recorder: Arc<Recorder>,
}

impl Member {
    pub fn address(&self) -> Address {
        self.channel.local_address().clone()
    }

    pub fn members(&self) -> Vec<Address> {
        self.channel
            .get_view()
            .map(|v| v.members().to_vec())
            .unwrap_or_default()
    }

    pub fn multicast(&self, payload: &str) {
        self.channel
            .send(Message::new(None, Bytes::from(payload.to_string())))
            .unwrap();
    }

    pub fn unicast(&self, dest: &Address, payload: &str) {
        self.channel
            .send(Message::new(
                Some(dest.clone()),
                Bytes::from(payload.to_string()),
            ))
            .unwrap();
    }
}

pub struct Cluster {
    pub net: InMemoryNetwork,
    pub scheduler: Arc<dyn Scheduler>,
    pub config: StackConfig,
    pub members: Vec<Member>,
}

impl Cluster {
    pub fn new(config: StackConfig) -> Self {
        Self {
            net: InMemoryNetwork::new(),
            scheduler: Arc::new(TokioScheduler::new(4).unwrap()),
            config,
            members: Vec::new(),
        }
    }

    /// Add member `n` and connect it to `cluster`.
    pub fn join(&mut self, n: u128, cluster: &str) -> &Member {
        let channel = Channel::new(
            self.config.clone(),
            self.net.endpoint(addr(n)),
            self.net.discovery(),
            Arc::clone(&self.scheduler),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        channel.set_receiver(Some(recorder.clone()));
        channel.connect(cluster).unwrap();
        self.members.push(Member { channel, recorder });
        self.members.last().unwrap()
    }

    /// Start a cluster of members `1..=n`, joined one after the other, and
    /// wait until everyone has the full view.
    pub fn start(config: StackConfig, n: u128, cluster: &str) -> Self {
        let mut c = Self::new(config);
        for i in 1..=n {
            c.join(i, cluster);
        }
        let all: Vec<Address> = (1..=n).map(addr).collect();
        assert!(
            c.wait_for_members(&all, &all),
            "cluster of {} did not form",
            n
        );
        c
    }

    pub fn member(&self, n: u128) -> &Member {
        self.members
            .iter()
            .find(|m| m.address() == addr(n))
            .unwrap()
    }

    /// Wait until every member in `at` has exactly `members` as its view.
    pub fn wait_for_members(&self, at: &[Address], members: &[Address]) -> bool {
        aerocast::sync::wait_until(WAIT, POLL, || {
            at.iter().all(|a| {
                self.members
                    .iter()
                    .find(|m| &m.address() == a)
                    .map(|m| m.members() == members)
                    .unwrap_or(false)
            })
        })
    }
}

pub fn addrs(ns: &[u128]) -> Vec<Address> {
    ns.iter().map(|n| addr(*n)).collect()
}
