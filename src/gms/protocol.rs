//! GMS protocol implementation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use rand::Rng;

use super::comparator::{comparator_for, select_first, CoordinatorComparator};
use super::merge::{
    consolidate, determine_merge_coords, determine_merge_participants, sanitize_views,
};
use super::policy::{policy_for, MembershipChangePolicy};
use crate::address::Address;
use crate::message::{Flags, GmsHeader, Header, JoinResult, Message, MergeId, ProtocolId};
use crate::nakack::Nakack;
use crate::observability::{log_event_with_fields, Event as LogEvent, Logger, Severity};
use crate::stack::{
    Discovery, Event, GmsConfig, Layer, PingData, Protocol, StackError, StackResult,
};
use crate::sync::{lock, read, write, CondVar, DrainQueue, Promise};
use crate::timer::TaskHandle;
use crate::view::{Digest, View, ViewId};

/// Where the local member stands in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmsState {
    Disconnected,
    Joining,
    Coordinator,
    Participant,
    Leaving,
}

/// Membership changes waiting for the coordinator.
#[derive(Debug)]
enum Request {
    Join(Address),
    Leave(Address),
    Suspect(Address),
}

enum JoinTarget {
    /// Nobody else around: start a new group
    Singleton,
    Coordinator(Address),
    /// Another joiner will found the group; try again later
    Wait,
}

struct AckCollector {
    view_id: ViewId,
    missing: HashSet<Address>,
}

#[derive(Default)]
struct MergeState {
    /// Merge this member currently takes part in
    id: Option<MergeId>,
    /// Leader only: members asked for their state
    expected: Vec<Address>,
    /// Leader only: answers so far; `None` is a rejection
    responses: HashMap<Address, Option<(View, Digest)>>,
}

struct Inner {
    config: GmsConfig,
    nakack: Arc<Nakack>,
    discovery: Arc<dyn Discovery>,
    policy: Box<dyn MembershipChangePolicy>,
    comparator: Box<dyn CoordinatorComparator>,
    layer: OnceLock<Layer>,
    cluster: RwLock<Option<String>>,
    state: RwLock<GmsState>,
    view: RwLock<Option<View>>,
    /// Serializes view installs
    installing: Mutex<()>,
    join_promise: Promise<JoinResult>,
    leave_promise: Promise<()>,
    requests: DrainQueue<Request>,
    acks: CondVar<Option<AckCollector>>,
    suspected: Mutex<HashSet<Address>>,
    merge: CondVar<MergeState>,
    merge_task: Mutex<Option<TaskHandle>>,
    merge_killer: Mutex<Option<TaskHandle>>,
    running: AtomicBool,
}

/// Group membership: joins, leaves, crash handling and merging of
/// partitioned subgroups.
pub struct Gms {
    inner: Arc<Inner>,
}

fn control(dest: Option<&Address>, header: GmsHeader) -> Message {
    Message::control(dest.cloned(), ProtocolId::GMS, Header::Gms(header))
}

impl Gms {
    /// `nakack` must be the reliable multicast layer of the same stack; its
    /// digests are handed to joiners and merged after partitions heal.
    pub fn new(
        config: GmsConfig,
        nakack: Arc<Nakack>,
        discovery: Arc<dyn Discovery>,
    ) -> StackResult<Self> {
        if config.max_join_attempts == 0 {
            return Err(StackError::config("max_join_attempts must be >= 1"));
        }
        if config.merge_min_interval_ms > config.merge_max_interval_ms {
            return Err(StackError::config(format!(
                "merge interval [{}, {}] is empty",
                config.merge_min_interval_ms, config.merge_max_interval_ms
            )));
        }
        let policy = policy_for(config.policy);
        let comparator = comparator_for(config.preferred_coordinator.as_ref());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                nakack,
                discovery,
                policy,
                comparator,
                layer: OnceLock::new(),
                cluster: RwLock::new(None),
                state: RwLock::new(GmsState::Disconnected),
                view: RwLock::new(None),
                installing: Mutex::new(()),
                join_promise: Promise::new(),
                leave_promise: Promise::new(),
                requests: DrainQueue::new(),
                acks: CondVar::new(None),
                suspected: Mutex::new(HashSet::new()),
                merge: CondVar::new(MergeState::default()),
                merge_task: Mutex::new(None),
                merge_killer: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn state(&self) -> GmsState {
        self.inner.state()
    }

    /// The installed view, if any.
    pub fn view(&self) -> Option<View> {
        self.inner.view()
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.state() == GmsState::Coordinator
    }

    /// Members currently suspected, sorted.
    pub fn suspected(&self) -> Vec<Address> {
        let mut s: Vec<Address> = lock(&self.inner.suspected).iter().cloned().collect();
        s.sort();
        s
    }

    pub fn merge_in_progress(&self) -> bool {
        self.inner.merge.lock().id.is_some()
    }

    /// Look for other subgroups of the cluster and start a merge if this
    /// member should lead it. Runs periodically when merging is enabled.
    /// Returns whether a merge was started.
    pub fn check_for_merge(&self) -> bool {
        self.inner.check_for_merge()
    }
}

impl Inner {
    fn layer(&self) -> StackResult<&Layer> {
        self.layer.get().ok_or(StackError::NotConnected)
    }

    fn state(&self) -> GmsState {
        *read(&self.state)
    }

    fn set_state(&self, state: GmsState) {
        *write(&self.state) = state;
    }

    fn view(&self) -> Option<View> {
        read(&self.view).clone()
    }

    fn cluster(&self) -> Option<String> {
        read(&self.cluster).clone()
    }

    fn send(&self, layer: &Layer, msg: Message) {
        if let Err(e) = layer.down(Event::Message(msg)) {
            Logger::warn("GMS_SEND_FAILED", &[("error", &e.to_string())]);
        }
    }

    // ==================
    // Joining
    // ==================

    fn join(self: &Arc<Self>, layer: &Layer, cluster: String) -> StackResult<()> {
        let local = layer.local_address().clone();
        *write(&self.cluster) = Some(cluster.clone());
        *write(&self.view) = None;
        self.set_state(GmsState::Joining);
        self.join_promise.reset();
        self.discovery
            .publish(PingData::joining(local.clone(), cluster.clone()));

        let attempts = self.config.max_join_attempts;
        for attempt in 1..=attempts {
            let found = self.discovery.find_members(&local, &cluster);
            match self.join_target(&local, &found) {
                JoinTarget::Singleton => {
                    self.install_view(layer, View::singleton(local.clone()));
                    self.schedule_merge_check();
                    return Ok(());
                }
                JoinTarget::Coordinator(coord) => {
                    self.send(layer, control(Some(&coord), GmsHeader::JoinRequest));
                    match self.join_promise.take_result(self.config.join_timeout()) {
                        Some(JoinResult::Accepted { view, digest }) if view.contains(&local) => {
                            self.accept_join(layer, view, &digest)?;
                            self.schedule_merge_check();
                            return Ok(());
                        }
                        Some(JoinResult::Accepted { view, .. }) => {
                            Logger::warn(
                                "GMS_JOIN_VIEW_WITHOUT_SELF",
                                &[("view", &view.to_string())],
                            );
                        }
                        Some(JoinResult::Rejected { reason }) => {
                            log_event_with_fields(
                                LogEvent::JoinRejected,
                                &[("coordinator", &coord.to_string()), ("reason", &reason)],
                            );
                            self.reset_membership(&local);
                            return Err(StackError::JoinRejected(reason));
                        }
                        None => {}
                    }
                }
                JoinTarget::Wait => std::thread::sleep(self.config.join_timeout()),
            }
            if attempt < attempts {
                log_event_with_fields(
                    LogEvent::JoinRetry,
                    &[
                        ("cluster", &cluster),
                        ("attempt", &attempt.to_string()),
                        ("max_attempts", &attempts.to_string()),
                    ],
                );
            }
        }
        log_event_with_fields(
            LogEvent::JoinFailed,
            &[("cluster", &cluster), ("attempts", &attempts.to_string())],
        );
        self.reset_membership(&local);
        Err(StackError::JoinFailed { attempts })
    }

    fn join_target(&self, local: &Address, found: &[PingData]) -> JoinTarget {
        if found.is_empty() {
            return JoinTarget::Singleton;
        }
        let cmp = self.comparator.as_ref();
        let coords = found.iter().filter(|p| p.is_coord).map(|p| &p.address);
        if let Some(coord) = select_first(cmp, coords) {
            return JoinTarget::Coordinator(coord.clone());
        }
        // Members without a coordinator entry still know who leads them.
        let known = found
            .iter()
            .filter_map(|p| p.view.as_ref())
            .filter_map(|v| v.coordinator())
            .filter(|c| *c != local);
        if let Some(coord) = select_first(cmp, known) {
            return JoinTarget::Coordinator(coord.clone());
        }
        // Only joiners: the first of them founds the group.
        let joiners = found
            .iter()
            .map(|p| &p.address)
            .chain(std::iter::once(local));
        match select_first(cmp, joiners) {
            Some(first) if first == local => JoinTarget::Singleton,
            _ => JoinTarget::Wait,
        }
    }

    fn accept_join(&self, layer: &Layer, view: View, digest: &Digest) -> StackResult<()> {
        self.nakack.overwrite_digest(digest)?;
        let creator = view.view_id().creator().clone();
        let view_id = view.view_id().clone();
        self.install_view(layer, view);
        if &creator != layer.local_address() {
            self.send(
                layer,
                control(Some(&creator), GmsHeader::ViewAck { view_id })
                    .with_flags(Flags::OOB),
            );
        }
        Ok(())
    }

    fn reset_membership(&self, local: &Address) {
        self.discovery.withdraw(local);
        *write(&self.view) = None;
        self.set_state(GmsState::Disconnected);
    }

    // ==================
    // Views
    // ==================

    /// Install `view` if it is newer than the current one. Returns whether
    /// it was installed.
    fn install_view(&self, layer: &Layer, view: View) -> bool {
        let local = layer.local_address();
        let _installing = lock(&self.installing);
        {
            let mut current = write(&self.view);
            if let Some(cur) = current.as_ref() {
                if view.view_id() <= cur.view_id() {
                    return false;
                }
            }
            *current = Some(view.clone());
        }

        let was_coord = self.state() == GmsState::Coordinator;
        let is_coord = view.coordinator() == Some(local);
        if self.state() != GmsState::Leaving {
            self.set_state(if is_coord {
                GmsState::Coordinator
            } else {
                GmsState::Participant
            });
        }
        lock(&self.suspected).retain(|a| view.contains(a));

        if let Err(e) = layer.down(Event::ViewChange(view.clone())) {
            Logger::error(
                "GMS_VIEW_RECONCILE_FAILED",
                &[("view", &view.to_string()), ("error", &e.to_string())],
            );
        }
        layer.up(Event::ViewChange(view.clone()));

        if let Some(cluster) = self.cluster() {
            self.discovery
                .publish(PingData::member(local.clone(), cluster, view.clone()));
        }
        layer.metrics().increment_views_installed();
        log_event_with_fields(
            LogEvent::ViewInstalled,
            &[
                ("view_id", &view.view_id().to_string()),
                ("members", &view.size().to_string()),
                (
                    "coordinator",
                    &view.coordinator().map(|c| c.to_string()).unwrap_or_default(),
                ),
            ],
        );
        if is_coord && !was_coord {
            log_event_with_fields(
                LogEvent::BecameCoordinator,
                &[("view_id", &view.view_id().to_string())],
            );
        }
        true
    }

    fn handle_view(&self, layer: &Layer, from: &Address, view: View) {
        let local = layer.local_address();
        // Our own casts are installed by the code that cast them.
        if from == local {
            return;
        }
        match self.state() {
            GmsState::Disconnected | GmsState::Joining => return,
            GmsState::Leaving if !view.contains(local) => {
                self.leave_promise.set_result(());
                return;
            }
            _ => {}
        }
        if !view.contains(local) {
            if Logger::enabled(Severity::Trace) {
                Logger::trace(
                    "GMS_VIEW_WITHOUT_SELF",
                    &[("from", &from.to_string()), ("view", &view.to_string())],
                );
            }
            return;
        }
        let creator = view.view_id().creator().clone();
        let view_id = view.view_id().clone();
        if self.install_view(layer, view) && &creator != local {
            self.send(
                layer,
                control(Some(&creator), GmsHeader::ViewAck { view_id }).with_flags(Flags::OOB),
            );
        }
    }

    fn handle_view_ack(&self, from: &Address, view_id: &ViewId) {
        self.acks.update(|acks| {
            if let Some(c) = acks.as_mut() {
                if &c.view_id == view_id {
                    c.missing.remove(from);
                }
            }
        });
    }

    /// Multicast `view`, then wait until every other member acked it.
    fn cast_view(&self, layer: &Layer, view: &View) {
        let local = layer.local_address();
        let missing: HashSet<Address> =
            view.members().iter().filter(|m| *m != local).cloned().collect();
        self.acks.update(|acks| {
            *acks = Some(AckCollector {
                view_id: view.view_id().clone(),
                missing,
            })
        });
        self.send(layer, control(None, GmsHeader::View { view: view.clone() }));
    }

    fn wait_for_acks(&self, view: &View) {
        let timeout = self.config.view_ack_collection_timeout();
        let all_acked = self.acks.wait_for(
            |acks| acks.as_ref().map_or(true, |c| c.missing.is_empty()),
            Some(timeout),
        );
        let missing = self.acks.update(|acks| acks.take().map(|c| c.missing));
        if !all_acked {
            let mut missing: Vec<String> = missing
                .unwrap_or_default()
                .iter()
                .map(|a| a.to_string())
                .collect();
            missing.sort();
            log_event_with_fields(
                LogEvent::ViewAckTimeout,
                &[
                    ("view_id", &view.view_id().to_string()),
                    ("missing", &missing.join(",")),
                    ("timeout_ms", &timeout.as_millis().to_string()),
                ],
            );
        }
    }

    // ==================
    // Coordinator
    // ==================

    fn enqueue(self: &Arc<Self>, layer: &Layer, request: Request) {
        if !self.requests.add(request) {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        layer.scheduler().execute(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.requests.drain_batches(|batch| inner.process_requests(batch));
            }
        }));
    }

    /// Turn a batch of joins, leaves and suspicions into one new view.
    fn process_requests(&self, batch: Vec<Request>) {
        let Ok(layer) = self.layer() else {
            return;
        };
        let local = layer.local_address();
        if self.state() != GmsState::Coordinator {
            if Logger::enabled(Severity::Trace) {
                Logger::trace("GMS_REQUESTS_DROPPED", &[("count", &batch.len().to_string())]);
            }
            return;
        }
        let Some(current) = self.view() else {
            return;
        };

        let mut joiners: Vec<Address> = Vec::new();
        let mut leavers: Vec<Address> = Vec::new();
        let mut suspects: Vec<Address> = Vec::new();
        for request in batch {
            match request {
                Request::Join(a) if current.contains(&a) => {
                    // The response got lost; the joiner asks again.
                    self.send_join_response(layer, &a, &current);
                }
                Request::Join(a) if lock(&self.suspected).contains(&a) => {
                    self.send(
                        layer,
                        control(
                            Some(&a),
                            GmsHeader::JoinResponse(JoinResult::Rejected {
                                reason: format!("{} is suspected in view {}", a, current.view_id()),
                            }),
                        ),
                    );
                }
                Request::Join(a) => {
                    if !joiners.contains(&a) {
                        joiners.push(a);
                    }
                }
                Request::Leave(a) if !current.contains(&a) => {
                    self.send(layer, control(Some(&a), GmsHeader::LeaveResponse));
                }
                Request::Leave(a) => {
                    if !leavers.contains(&a) {
                        leavers.push(a);
                    }
                }
                Request::Suspect(a) => {
                    if current.contains(&a) && &a != local && !suspects.contains(&a) {
                        suspects.push(a);
                    }
                }
            }
        }
        if joiners.is_empty() && leavers.is_empty() && suspects.is_empty() {
            return;
        }

        let members =
            self.policy
                .new_membership(current.members(), &joiners, &leavers, &suspects);
        let next = View::new(current.view_id().successor(local.clone()), members);
        self.cast_view(layer, &next);
        self.install_view(layer, next.clone());
        for joiner in &joiners {
            self.send_join_response(layer, joiner, &next);
        }
        for leaver in &leavers {
            self.send(layer, control(Some(leaver), GmsHeader::LeaveResponse));
        }
        self.wait_for_acks(&next);
    }

    fn send_join_response(&self, layer: &Layer, joiner: &Address, view: &View) {
        let mut digest = self.nakack.get_digest();
        digest.retain(view.members());
        self.send(
            layer,
            control(
                Some(joiner),
                GmsHeader::JoinResponse(JoinResult::Accepted {
                    view: view.clone(),
                    digest,
                }),
            ),
        );
    }

    // ==================
    // Failures and leaving
    // ==================

    fn handle_suspect(self: &Arc<Self>, layer: &Layer, suspect: Address) {
        let local = layer.local_address();
        let Some(view) = self.view() else {
            return;
        };
        if &suspect == local || !view.contains(&suspect) {
            return;
        }
        let suspected = {
            let mut s = lock(&self.suspected);
            if !s.insert(suspect.clone()) {
                return;
            }
            s.clone()
        };
        log_event_with_fields(
            LogEvent::MemberSuspected,
            &[
                ("member", &suspect.to_string()),
                ("view_id", &view.view_id().to_string()),
            ],
        );
        match self.state() {
            GmsState::Coordinator => self.enqueue(layer, Request::Suspect(suspect)),
            GmsState::Participant => {
                let next_coord = view.members().iter().find(|m| !suspected.contains(m));
                if next_coord == Some(local) {
                    self.set_state(GmsState::Coordinator);
                    log_event_with_fields(
                        LogEvent::BecameCoordinator,
                        &[
                            ("view_id", &view.view_id().to_string()),
                            ("suspected", &suspected.len().to_string()),
                        ],
                    );
                    for s in suspected {
                        self.enqueue(layer, Request::Suspect(s));
                    }
                }
            }
            _ => {}
        }
    }

    fn leave(&self, layer: &Layer) {
        let local = layer.local_address().clone();
        let state = self.state();
        match state {
            GmsState::Disconnected | GmsState::Leaving => return,
            GmsState::Joining => {}
            GmsState::Participant => {
                self.set_state(GmsState::Leaving);
                self.leave_promise.reset();
                if let Some(coord) = self.view().and_then(|v| v.coordinator().cloned()) {
                    self.send(layer, control(Some(&coord), GmsHeader::LeaveRequest));
                    let timeout = self.config.leave_timeout();
                    if self.leave_promise.take_result(timeout).is_none() {
                        Logger::warn(
                            "GMS_LEAVE_TIMEOUT",
                            &[
                                ("coordinator", &coord.to_string()),
                                ("timeout_ms", &timeout.as_millis().to_string()),
                            ],
                        );
                    }
                }
            }
            GmsState::Coordinator => {
                self.set_state(GmsState::Leaving);
                if let Some(view) = self.view().filter(|v| v.size() > 1) {
                    let members = self.policy.new_membership(
                        view.members(),
                        &[],
                        std::slice::from_ref(&local),
                        &[],
                    );
                    let next = View::new(view.view_id().successor(local.clone()), members);
                    self.cast_view(layer, &next);
                    self.wait_for_acks(&next);
                }
            }
        }
        self.cancel_merge_tasks();
        self.merge.update(|m| *m = MergeState::default());
        self.reset_membership(&local);
        log_event_with_fields(
            LogEvent::LeaveComplete,
            &[
                ("member", &local.to_string()),
                ("cluster", &self.cluster().unwrap_or_default()),
            ],
        );
    }

    // ==================
    // Merging
    // ==================

    fn schedule_merge_check(self: &Arc<Self>) {
        if !self.config.merge_enabled() || !self.running.load(Ordering::Acquire) {
            return;
        }
        let Ok(layer) = self.layer() else {
            return;
        };
        let (min, max) = (
            self.config.merge_min_interval_ms,
            self.config.merge_max_interval_ms,
        );
        let delay = rand::thread_rng().gen_range(min.max(1)..=max.max(1));
        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = layer.scheduler().schedule(
            Duration::from_millis(delay),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.check_for_merge();
                    inner.schedule_merge_check();
                }
            }),
        );
        if let Some(old) = lock(&self.merge_task).replace(handle) {
            old.cancel();
        }
    }

    fn cancel_merge_tasks(&self) {
        if let Some(task) = lock(&self.merge_task).take() {
            task.cancel();
        }
        if let Some(task) = lock(&self.merge_killer).take() {
            task.cancel();
        }
    }

    fn check_for_merge(self: &Arc<Self>) -> bool {
        let Ok(layer) = self.layer() else {
            return false;
        };
        if self.state() != GmsState::Coordinator || self.merge.lock().id.is_some() {
            return false;
        }
        let (Some(view), Some(cluster)) = (self.view(), self.cluster()) else {
            return false;
        };
        let local = layer.local_address();

        let mut views: HashMap<Address, View> = HashMap::new();
        for p in self.discovery.find_members(local, &cluster) {
            if let Some(v) = p.view {
                views.insert(p.address, v);
            }
        }
        views.insert(local.clone(), view);
        let ids: HashSet<&ViewId> = views.values().map(|v| v.view_id()).collect();
        if ids.len() < 2 {
            return false;
        }

        sanitize_views(&mut views);
        let coords = determine_merge_coords(&views);
        if coords.len() < 2 {
            return false;
        }
        if select_first(self.comparator.as_ref(), &coords) != Some(local) {
            return false;
        }
        let participants = determine_merge_participants(&views);
        self.start_merge(layer, participants)
    }

    fn own_merge_data(&self) -> Option<(View, Digest)> {
        let view = self.view()?;
        let mut digest = self.nakack.get_digest();
        digest.retain(view.members());
        Some((view, digest))
    }

    fn start_merge(self: &Arc<Self>, layer: &Layer, participants: Vec<Address>) -> bool {
        let local = layer.local_address().clone();
        let others: Vec<Address> = participants
            .iter()
            .filter(|p| **p != local)
            .cloned()
            .collect();
        let Some(own) = self.own_merge_data() else {
            return false;
        };
        if others.is_empty() {
            return false;
        }
        let merge_id = MergeId {
            initiator: local.clone(),
            id: rand::random(),
        };
        let started = self.merge.update(|m| {
            if m.id.is_some() {
                return false;
            }
            *m = MergeState {
                id: Some(merge_id.clone()),
                expected: others.clone(),
                responses: HashMap::from([(local.clone(), Some(own))]),
            };
            true
        });
        if !started {
            return false;
        }
        log_event_with_fields(
            LogEvent::MergeStarted,
            &[
                ("merge_id", &merge_id.to_string()),
                ("participants", &participants.len().to_string()),
            ],
        );
        self.schedule_merge_killer(layer, &merge_id);
        for p in &others {
            self.send(
                layer,
                control(
                    Some(p),
                    GmsHeader::MergeRequest {
                        merge_id: merge_id.clone(),
                        members: participants.clone(),
                    },
                )
                .with_flags(Flags::OOB),
            );
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        layer.scheduler().execute(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.collect_merge(merge_id);
            }
        }));
        true
    }

    /// Clears a merge that never finished, so the member is free to take
    /// part in the next one.
    fn schedule_merge_killer(self: &Arc<Self>, layer: &Layer, merge_id: &MergeId) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let merge_id = merge_id.clone();
        let handle = layer.scheduler().schedule(
            self.config.merge_timeout() * 2,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if inner.clear_merge(&merge_id) {
                        log_event_with_fields(
                            LogEvent::MergeCancelled,
                            &[("merge_id", &merge_id.to_string()), ("reason", "expired")],
                        );
                    }
                }
            }),
        );
        if let Some(old) = lock(&self.merge_killer).replace(handle) {
            old.cancel();
        }
    }

    fn clear_merge(&self, merge_id: &MergeId) -> bool {
        self.merge.update(|m| {
            if m.id.as_ref() != Some(merge_id) {
                return false;
            }
            *m = MergeState::default();
            true
        })
    }

    fn collect_merge(&self, merge_id: MergeId) {
        let Ok(layer) = self.layer() else {
            return;
        };
        let local = layer.local_address();
        let responses = self.merge.wait_then(
            |m| {
                m.id.as_ref() != Some(&merge_id)
                    || m.expected.iter().all(|p| m.responses.contains_key(p))
            },
            Some(self.config.merge_timeout()),
            |m, _| (m.id.as_ref() == Some(&merge_id)).then(|| m.responses.clone()),
        );
        let Some(responses) = responses else {
            return;
        };

        let mut accepted: Vec<(Address, (View, Digest))> = responses
            .into_iter()
            .filter_map(|(from, data)| data.map(|d| (from, d)))
            .collect();
        accepted.sort_by(|a, b| a.0.cmp(&b.0));
        let data: Vec<(View, Digest)> = accepted.iter().map(|(_, d)| d.clone()).collect();
        let merged = if accepted.len() < 2 {
            None
        } else {
            consolidate(&data, self.comparator.as_ref())
        };
        let Some((view, digest)) = merged else {
            for (to, _) in accepted.iter().filter(|(a, _)| a != local) {
                self.send(
                    layer,
                    control(
                        Some(to),
                        GmsHeader::CancelMerge {
                            merge_id: merge_id.clone(),
                        },
                    )
                    .with_flags(Flags::OOB),
                );
            }
            if self.clear_merge(&merge_id) {
                log_event_with_fields(
                    LogEvent::MergeCancelled,
                    &[
                        ("merge_id", &merge_id.to_string()),
                        ("reason", "too few responses"),
                        ("responses", &accepted.len().to_string()),
                    ],
                );
            }
            return;
        };

        for member in view.members().iter().filter(|m| *m != local) {
            self.send(
                layer,
                control(
                    Some(member),
                    GmsHeader::InstallMergeView {
                        merge_id: merge_id.clone(),
                        view: view.clone(),
                        digest: digest.clone(),
                    },
                )
                .with_flags(Flags::OOB),
            );
        }
        let members = view.size();
        let view_id = view.view_id().to_string();
        self.install_merge_view(layer, &merge_id, view, digest);
        layer.metrics().increment_merges_completed();
        log_event_with_fields(
            LogEvent::MergeCompleted,
            &[
                ("merge_id", &merge_id.to_string()),
                ("view_id", &view_id),
                ("members", &members.to_string()),
            ],
        );
    }

    fn handle_merge_request(
        self: &Arc<Self>,
        layer: &Layer,
        from: &Address,
        merge_id: MergeId,
    ) {
        let member = matches!(
            self.state(),
            GmsState::Coordinator | GmsState::Participant
        );
        let accepted = member
            && self.merge.update(|m| {
                if m.id.is_some() {
                    return false;
                }
                m.id = Some(merge_id.clone());
                true
            });
        let data = if accepted {
            self.schedule_merge_killer(layer, &merge_id);
            self.own_merge_data()
        } else {
            if Logger::enabled(Severity::Trace) {
                Logger::trace(
                    "GMS_MERGE_REQUEST_REJECTED",
                    &[("merge_id", &merge_id.to_string()), ("from", &from.to_string())],
                );
            }
            None
        };
        self.send(
            layer,
            control(Some(from), GmsHeader::MergeResponse { merge_id, data })
                .with_flags(Flags::OOB),
        );
    }

    fn handle_merge_response(
        &self,
        from: &Address,
        merge_id: &MergeId,
        data: Option<(View, Digest)>,
    ) {
        self.merge.update(|m| {
            if m.id.as_ref() == Some(merge_id) && m.expected.contains(from) {
                m.responses.insert(from.clone(), data);
            }
        });
    }

    fn handle_install_merge_view(
        &self,
        layer: &Layer,
        merge_id: &MergeId,
        view: View,
        digest: Digest,
    ) {
        let ours = {
            let m = self.merge.lock();
            m.id.is_none() || m.id.as_ref() == Some(merge_id)
        };
        let newer = self
            .view()
            .map_or(true, |cur| view.view_id() > cur.view_id());
        if !ours || !newer || !view.contains(layer.local_address()) {
            if Logger::enabled(Severity::Trace) {
                Logger::trace(
                    "GMS_MERGE_VIEW_IGNORED",
                    &[("merge_id", &merge_id.to_string()), ("view", &view.to_string())],
                );
            }
            return;
        }
        self.install_merge_view(layer, merge_id, view, digest);
    }

    /// Take over the merged digest, install the merged view and fetch
    /// whatever the other subgroups delivered that this member missed.
    fn install_merge_view(&self, layer: &Layer, merge_id: &MergeId, view: View, digest: Digest) {
        if let Err(e) = self.nakack.merge_digest(&digest) {
            Logger::error(
                "GMS_MERGE_DIGEST_FAILED",
                &[("merge_id", &merge_id.to_string()), ("error", &e.to_string())],
            );
        }
        self.install_view(layer, view);
        if self.clear_merge(merge_id) {
            if let Some(task) = lock(&self.merge_killer).take() {
                task.cancel();
            }
        }
        let nakack = Arc::clone(&self.nakack);
        let timeout = self.config.rebroadcast_timeout();
        layer.scheduler().execute(Box::new(move || {
            nakack.rebroadcast(&digest, timeout);
        }));
    }

    fn handle_cancel_merge(&self, merge_id: &MergeId) {
        if self.clear_merge(merge_id) {
            if let Some(task) = lock(&self.merge_killer).take() {
                task.cancel();
            }
            log_event_with_fields(
                LogEvent::MergeCancelled,
                &[("merge_id", &merge_id.to_string()), ("reason", "cancelled by leader")],
            );
        }
    }

    // ==================
    // Dispatch
    // ==================

    fn handle(self: &Arc<Self>, layer: &Layer, msg: Message) {
        let header = match msg.header(ProtocolId::GMS) {
            Some(Header::Gms(h)) => h.clone(),
            _ => {
                layer.up(Event::Message(msg));
                return;
            }
        };
        let Some(from) = msg.src().cloned() else {
            return;
        };
        match header {
            GmsHeader::JoinRequest => {
                if self.state() == GmsState::Coordinator {
                    self.enqueue(layer, Request::Join(from));
                }
            }
            GmsHeader::JoinResponse(result) => {
                if self.state() == GmsState::Joining {
                    self.join_promise.set_result(result);
                }
            }
            GmsHeader::LeaveRequest => {
                if self.state() == GmsState::Coordinator {
                    self.enqueue(layer, Request::Leave(from));
                }
            }
            GmsHeader::LeaveResponse => {
                if self.state() == GmsState::Leaving {
                    self.leave_promise.set_result(());
                }
            }
            GmsHeader::View { view } => self.handle_view(layer, &from, view),
            GmsHeader::ViewAck { view_id } => self.handle_view_ack(&from, &view_id),
            GmsHeader::MergeRequest { merge_id, .. } => {
                self.handle_merge_request(layer, &from, merge_id)
            }
            GmsHeader::MergeResponse { merge_id, data } => {
                self.handle_merge_response(&from, &merge_id, data)
            }
            GmsHeader::InstallMergeView {
                merge_id,
                view,
                digest,
            } => self.handle_install_merge_view(layer, &merge_id, view, digest),
            GmsHeader::CancelMerge { merge_id } => self.handle_cancel_merge(&merge_id),
        }
    }
}

impl Protocol for Gms {
    fn name(&self) -> &'static str {
        "GMS"
    }

    fn id(&self) -> Option<ProtocolId> {
        Some(ProtocolId::GMS)
    }

    fn init(&self, layer: Layer) -> StackResult<()> {
        let _ = self.inner.layer.set(layer);
        Ok(())
    }

    fn start(&self) -> StackResult<()> {
        self.inner.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel_merge_tasks();
        self.inner.acks.update(|acks| *acks = None);
        self.inner.merge.update(|m| *m = MergeState::default());
    }

    fn down(&self, evt: Event) -> StackResult<()> {
        let layer = self.inner.layer()?;
        match evt {
            Event::Connect(cluster) => {
                layer.down(Event::Connect(cluster.clone()))?;
                self.inner.join(layer, cluster)
            }
            Event::Disconnect => {
                self.inner.leave(layer);
                layer.down(Event::Disconnect)
            }
            evt => layer.down(evt),
        }
    }

    fn up(&self, evt: Event) {
        let Ok(layer) = self.inner.layer() else {
            return;
        };
        match evt {
            Event::Message(msg) => self.inner.handle(layer, msg),
            Event::Batch(mut batch) => {
                let mine = batch.take_matching(|m| m.header(ProtocolId::GMS).is_some());
                for msg in mine {
                    self.inner.handle(layer, msg);
                }
                if !batch.is_empty() {
                    layer.up(Event::Batch(batch));
                }
            }
            Event::Suspect(member) => {
                self.inner.handle_suspect(layer, member.clone());
                layer.up(Event::Suspect(member));
            }
            evt => layer.up(evt),
        }
    }
}

impl std::fmt::Debug for Gms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gms")
            .field("state", &self.inner.state())
            .field("view", &self.inner.view().map(|v| v.to_string()))
            .finish()
    }
}
