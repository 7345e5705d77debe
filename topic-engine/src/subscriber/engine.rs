/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Receive engine behind a [`Subscriber`](super::Subscriber).
//!
//! Receive and functional requests go through one [`BatchingQueue`] drained by
//! the receive daemon. Each drain cycle runs queued seeks and position queries,
//! serves receives from the prefetch queue, and otherwise polls the current
//! owned channel. Ownership changes and populated notifications run on a second
//! daemon. The channel array, owned set and prefetch queue are only mutated under
//! the channel gate; state changes and their listeners use the state gate.
//!
//! Lock order is channel gate, prefetch queue, then the request queue's own lock.

use crate::batching::queue::TriggerFn;
use crate::batching::{BatchingQueue, DebouncedFlowControl, ErrorAction, OperationFuture};
use crate::config::TopicDependencies;
use crate::connector::{InitializeRequest, SubscriberConnector, SubscriberEvent, SubscriberListener};
use crate::error::{Result, TopicError};
use crate::lifecycle::StateCell;
use crate::listeners::ListenerRegistry;
use crate::model::{
    ChannelId, CommitResult, Position, ReceiveResult, ReceiveStatus, ReceivedElement, SeekResult,
    SubscriberGroupId, SubscriberId,
};
use crate::observability::events;
use crate::observability::fields::{
    format_channels, REASON_NO_PENDING_REQUESTS, REASON_STALE_CONNECTION, REASON_SUSPENDED,
};
use crate::runtime::{scheduler, Executor, TaskDaemon};
use crate::subscriber::channel::{ChannelGate, ChannelStatistics};
use crate::subscriber::options::ChannelOwnershipListener;
use crate::subscriber::request::{PositionKind, Prefetched, Request, Response, SeekTarget};
use crate::subscriber::state::{StateListener, SubscriberState};
use crate::subscriber::statistics::SubscriberStatistics;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Level};

const COMPONENT: &str = "subscriber";

/// Receive requests moved into the current batch per drain cycle.
const RECEIVE_BATCH: usize = 1;

pub(crate) type BinaryFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

type CloseAction = Box<dyn FnOnce() + Send>;

enum OwnershipChange {
    Unchanged,
    /// The allocation names channels this subscriber does not know about yet.
    Resized(ChannelId),
    Changed {
        revoked: BTreeSet<ChannelId>,
        added: BTreeSet<ChannelId>,
    },
}

pub(crate) struct SubscriberCore {
    id: SubscriberId,
    group: SubscriberGroupId,
    connector: Arc<dyn SubscriberConnector>,
    dependencies: TopicDependencies,
    state: StateCell<SubscriberState>,
    state_gate: ReentrantMutex<()>,
    state_listeners: ListenerRegistry<dyn StateListener>,
    gate: Mutex<ChannelGate>,
    prefetch: Mutex<VecDeque<Prefetched>>,
    queue: BatchingQueue<Request, Response>,
    connect_lock: tokio::sync::Mutex<()>,
    receive_daemon: Arc<TaskDaemon>,
    channel_daemon: TaskDaemon,
    filter: Option<BinaryFilter>,
    complete_on_empty: bool,
    manual_channels: BTreeSet<ChannelId>,
    ownership_listeners: ListenerRegistry<dyn ChannelOwnershipListener>,
    statistics: SubscriberStatistics,
    force_reconnect: AtomicBool,
    reconnect_scheduled: AtomicBool,
    listener: Mutex<Option<Arc<dyn SubscriberListener>>>,
    on_close: Mutex<Vec<CloseAction>>,
}

impl SubscriberCore {
    pub(crate) fn new(
        connector: Arc<dyn SubscriberConnector>,
        group: SubscriberGroupId,
        filter: Option<BinaryFilter>,
        complete_on_empty: bool,
        manual_channels: BTreeSet<ChannelId>,
        ownership_listeners: Vec<Arc<dyn ChannelOwnershipListener>>,
    ) -> Result<Arc<Self>> {
        let id = connector.subscriber_id();
        let dependencies = connector.dependencies();
        let receive_daemon = Arc::new(TaskDaemon::start(format!("subscriber-{}", id.id()))?);
        let channel_daemon = TaskDaemon::start(format!("subscriber-{}-channels", id.id()))?;
        let clogged = dependencies.clogged_count.max(1) as u64;
        let backlog = Arc::new(DebouncedFlowControl::new(clogged * 2 / 3, clogged));
        let executor: Arc<dyn Executor> = receive_daemon.clone();
        let channel_count = connector.channel_count();

        let registry = ListenerRegistry::new("channel_ownership");
        for listener in ownership_listeners {
            registry.add(listener);
        }

        let core = Arc::new_cyclic(|this: &Weak<Self>| {
            let trigger: TriggerFn = {
                let this = this.clone();
                Arc::new(move |_initial_batch| {
                    if let Some(core) = this.upgrade() {
                        let daemon = core.receive_daemon.clone();
                        daemon.spawn(core.receive_loop());
                    }
                })
            };
            Self {
                queue: BatchingQueue::new(
                    format!("subscriber-{}-requests", id.id()),
                    trigger,
                    RECEIVE_BATCH,
                    Arc::new(|_request: &Request| 1),
                    backlog,
                    executor,
                ),
                id,
                group,
                connector,
                dependencies,
                state: StateCell::new(SubscriberState::Initial),
                state_gate: ReentrantMutex::new(()),
                state_listeners: ListenerRegistry::new("subscriber_state"),
                gate: Mutex::new(ChannelGate::new(channel_count)),
                prefetch: Mutex::new(VecDeque::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                receive_daemon,
                channel_daemon,
                filter,
                complete_on_empty,
                manual_channels,
                ownership_listeners: registry,
                statistics: SubscriberStatistics::default(),
                force_reconnect: AtomicBool::new(false),
                reconnect_scheduled: AtomicBool::new(false),
                listener: Mutex::new(None),
                on_close: Mutex::new(Vec::new()),
            }
        });

        let listener: Arc<dyn SubscriberListener> = Arc::new(SubscriberEvents {
            core: Arc::downgrade(&core),
        });
        core.connector.add_listener(listener.clone());
        *core.listener.lock() = Some(listener);
        Ok(core)
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn group(&self) -> &SubscriberGroupId {
        &self.group
    }

    pub(crate) fn topic_name(&self) -> &str {
        self.connector.topic_name()
    }

    pub(crate) fn statistics(&self) -> &SubscriberStatistics {
        &self.statistics
    }

    pub(crate) fn flow_control(&self) -> &Arc<DebouncedFlowControl> {
        self.queue.flow_control()
    }

    // ---- state ----

    pub(crate) fn state(&self) -> SubscriberState {
        self.state.get()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == SubscriberState::Connected
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TopicError::IllegalState(
                "the subscriber has been closed".to_string(),
            ))
        }
    }

    fn set_state(&self, next: SubscriberState) -> Option<SubscriberState> {
        let _gate = self.state_gate.lock();
        let previous = self.state.transition(next)?;
        self.on_state_change(next, previous);
        Some(previous)
    }

    fn compare_and_set_state(&self, expected: SubscriberState, next: SubscriberState) -> bool {
        let _gate = self.state_gate.lock();
        if !self.state.compare_and_set(expected, next) {
            return false;
        }
        self.on_state_change(next, expected);
        true
    }

    fn on_state_change(&self, state: SubscriberState, previous: SubscriberState) {
        debug!(
            event = events::SUBSCRIBER_STATE_CHANGE,
            component = COMPONENT,
            subscriber_id = %self.id,
            state = ?state,
            prev_state = ?previous,
            "subscriber state changed"
        );
        self.state_listeners
            .dispatch(|listener| listener.on_state_change(state, previous));
    }

    pub(crate) fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.state_listeners.add(listener);
    }

    pub(crate) fn remove_state_listener(&self, listener: &Arc<dyn StateListener>) {
        self.state_listeners.remove(listener);
    }

    // ---- channels ----

    pub(crate) fn channels(&self) -> BTreeSet<ChannelId> {
        self.gate.lock().owned_set()
    }

    pub(crate) fn is_owner(&self, channel: ChannelId) -> bool {
        self.gate.lock().is_owner(channel)
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.gate.lock().channels.len()
    }

    pub(crate) fn channel_statistics(&self) -> Vec<ChannelStatistics> {
        self.gate
            .lock()
            .channels
            .iter()
            .map(|channel| channel.statistics())
            .collect()
    }

    fn ensure_owned(
        &self,
        channels: impl IntoIterator<Item = ChannelId>,
        error: fn(String) -> TopicError,
    ) -> Result<()> {
        let gate = self.gate.lock();
        let unowned: BTreeSet<ChannelId> = channels
            .into_iter()
            .filter(|channel| !gate.is_owner(*channel))
            .collect();
        if unowned.is_empty() {
            Ok(())
        } else {
            Err(error(format!(
                "the subscriber is not allocated channels {}",
                format_channels(&unowned)
            )))
        }
    }

    /// Recomputes the owned set from an allocation. `lost` reports revoked
    /// channels as lost rather than rebalanced.
    pub(crate) fn update_channel_ownership(
        self: &Arc<Self>,
        channels: BTreeSet<ChannelId>,
        lost: bool,
    ) {
        if !self.is_active() {
            return;
        }
        let channels: BTreeSet<ChannelId> = if self.manual_channels.is_empty() {
            channels
        } else {
            channels
                .intersection(&self.manual_channels)
                .copied()
                .collect()
        };

        let change = {
            let mut gate = self.gate.lock();
            let previous = gate.owned_set();
            match channels.last() {
                Some(max) if *max >= gate.channels.len() => OwnershipChange::Resized(*max),
                _ if previous == channels => OwnershipChange::Unchanged,
                _ => {
                    let revoked: BTreeSet<ChannelId> =
                        previous.difference(&channels).copied().collect();
                    let added: BTreeSet<ChannelId> =
                        channels.difference(&previous).copied().collect();
                    gate.set_owned(&channels);
                    for channel in revoked.iter().chain(added.iter()) {
                        if let Some(state) = gate.channel_mut(*channel) {
                            state.reset_poll_flags();
                        }
                    }
                    let mut prefetch = self.prefetch.lock();
                    if prefetch.front().is_some_and(Prefetched::is_empty_marker) {
                        prefetch.pop_front();
                    }
                    OwnershipChange::Changed { revoked, added }
                }
            }
        };

        match change {
            OwnershipChange::Unchanged => {}
            OwnershipChange::Resized(max) => {
                info!(
                    event = events::SUBSCRIBER_CHANNELS_RESIZED,
                    component = COMPONENT,
                    subscriber_id = %self.id,
                    channel = max,
                    known = self.channel_count(),
                    "allocation names unknown channels; reconnecting"
                );
                self.disconnect_internal(true);
            }
            OwnershipChange::Changed { revoked, added } => {
                info!(
                    event = events::SUBSCRIBER_OWNERSHIP_CHANGED,
                    component = COMPONENT,
                    subscriber_id = %self.id,
                    group = %self.group,
                    channels = format_channels(&channels),
                    added = format_channels(&added),
                    revoked = format_channels(&revoked),
                    lost,
                    "channel ownership changed"
                );
                if !revoked.is_empty() {
                    self.ownership_listeners.dispatch(|listener| {
                        if lost {
                            listener.on_channels_lost(&revoked);
                        } else {
                            listener.on_channels_revoked(&revoked);
                        }
                    });
                }
                if !added.is_empty() {
                    self.ownership_listeners
                        .dispatch(|listener| listener.on_channels_assigned(&channels));
                }
                self.on_channels_populated(&channels, false);
            }
        }
    }

    /// Marks `channels` populated and wakes the receive loop if it was waiting.
    pub(crate) fn on_channels_populated(
        &self,
        channels: &BTreeSet<ChannelId>,
        notification: bool,
    ) {
        if channels.is_empty() || !self.is_active() {
            return;
        }
        if notification {
            self.statistics.record_notification();
        }
        let was_empty = {
            let mut gate = self.gate.lock();
            let was_empty = gate
                .current
                .and_then(|current| gate.channel(current))
                .map_or(true, |state| state.is_empty() || !state.is_owned());
            for channel in channels {
                if let Some(state) = gate.channel_mut(*channel) {
                    if notification {
                        state.on_populated_notification();
                    } else {
                        state.set_populated();
                    }
                }
            }
            let mut prefetch = self.prefetch.lock();
            if prefetch.front().is_some_and(Prefetched::is_empty_marker) {
                prefetch.pop_front();
            }
            if was_empty {
                gate.switch_channel();
            }
            was_empty
        };
        trace!(
            event = events::SUBSCRIBER_CHANNEL_POPULATED,
            component = COMPONENT,
            subscriber_id = %self.id,
            channels = format_channels(channels),
            was_empty,
            "channels populated"
        );
        if was_empty && self.is_connected() {
            self.queue.trigger_operations();
        }
    }

    // ---- connection ----

    /// Connects and initialises the subscription, retrying transient failures
    /// until the reconnect timeout.
    pub(crate) async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        self.ensure_active()?;
        if self.is_connected() {
            return Ok(());
        }
        {
            let _connecting = self.connect_lock.lock().await;
            let retry = self.dependencies.reconnect_retry();
            let deadline = Instant::now() + self.dependencies.reconnect_timeout();
            let mut attempt = 0u32;
            while !self.is_connected() {
                self.ensure_active()?;
                if self.connector.is_suspended() {
                    return Err(TopicError::Connection(
                        "the topic service is suspended".to_string(),
                    ));
                }
                attempt += 1;
                debug!(
                    event = events::SUBSCRIBER_CONNECT_ATTEMPT,
                    component = COMPONENT,
                    subscriber_id = %self.id,
                    attempt,
                    "connecting subscriber"
                );
                let outcome = match self.connector.ensure_connected().await {
                    Ok(()) => self.initialise().await,
                    Err(err) => Err(err),
                };
                let Err(err) = outcome else {
                    continue;
                };
                if err.is_fatal() || !self.is_active() || Instant::now() + retry > deadline {
                    warn!(
                        event = events::SUBSCRIBER_CONNECT_FAILED,
                        component = COMPONENT,
                        subscriber_id = %self.id,
                        attempt,
                        err = %err,
                        "subscriber failed to connect"
                    );
                    return Err(err);
                }
                debug!(
                    event = events::SUBSCRIBER_CONNECT_FAILED,
                    component = COMPONENT,
                    subscriber_id = %self.id,
                    attempt,
                    retry_ms = retry.as_millis() as u64,
                    err = %err,
                    "subscriber connect attempt failed; retrying"
                );
                tokio::time::sleep(retry).await;
            }
        }
        self.queue.trigger_operations();
        Ok(())
    }

    async fn initialise(self: &Arc<Self>) -> Result<()> {
        let Some(previous) = self.set_state(SubscriberState::Connecting) else {
            return Err(TopicError::IllegalState(format!(
                "cannot connect a subscriber in state {:?}",
                self.state()
            )));
        };
        let request = InitializeRequest {
            subscriber_id: self.id,
            group: self.group.clone(),
            force_reconnect: self.force_reconnect.load(Ordering::Acquire),
            is_reconnect: self.statistics.connects() > 0,
            was_disconnected: previous == SubscriberState::Disconnected,
        };
        let outcome = self.subscribe(request).await;
        if outcome.is_err() {
            self.compare_and_set_state(SubscriberState::Connecting, SubscriberState::Disconnected);
        }
        outcome
    }

    async fn subscribe(self: &Arc<Self>, request: InitializeRequest) -> Result<()> {
        let heads = self.connector.initialize(request).await?;
        let allocated = if self.group.is_anonymous() {
            None
        } else {
            Some(self.connector.owned_channels().await?)
        };

        let owned = {
            let mut gate = self.gate.lock();
            gate.ensure_capacity(heads.len());
            for (channel, head) in heads.iter().enumerate() {
                if let Some(state) = gate.channel_mut(channel) {
                    state.set_head(*head);
                    state.set_populated();
                }
            }
            allocated.unwrap_or_else(|| (0..gate.channels.len()).collect())
        };
        self.update_channel_ownership(owned, false);
        self.connector.heartbeat().await;

        if !self.compare_and_set_state(SubscriberState::Connecting, SubscriberState::Connected) {
            return Err(TopicError::Connection(
                "the subscriber was disconnected while connecting".to_string(),
            ));
        }
        self.force_reconnect.store(false, Ordering::Release);
        self.statistics.record_connect();
        let channels = {
            let mut gate = self.gate.lock();
            gate.switch_channel();
            gate.owned_set()
        };
        info!(
            event = events::SUBSCRIBER_CONNECTED,
            component = COMPONENT,
            subscriber_id = %self.id,
            group = %self.group,
            topic = self.connector.topic_name(),
            channels = format_channels(&channels),
            "subscriber connected"
        );
        Ok(())
    }

    /// Drops the connection and schedules a reconnect. Does nothing when the
    /// connection it was called about has already been replaced.
    pub(crate) fn disconnect_internal(self: &Arc<Self>, force: bool) {
        let timestamp = self.connector.connection_timestamp();
        loop {
            match self.state() {
                SubscriberState::Connected => {
                    let disconnected = {
                        let mut gate = self.gate.lock();
                        if self.connector.connection_timestamp() != timestamp {
                            debug!(
                                event = events::SUBSCRIBER_DISCONNECT,
                                component = COMPONENT,
                                subscriber_id = %self.id,
                                reason = REASON_STALE_CONNECTION,
                                "ignoring disconnect for a replaced connection"
                            );
                            return;
                        }
                        let disconnected = self.compare_and_set_state(
                            SubscriberState::Connected,
                            SubscriberState::Disconnected,
                        );
                        if disconnected {
                            gate.current = None;
                            self.prefetch.lock().clear();
                        }
                        disconnected
                    };
                    if disconnected {
                        self.force_reconnect.fetch_or(force, Ordering::AcqRel);
                        self.statistics.record_disconnect();
                        info!(
                            event = events::SUBSCRIBER_DISCONNECT,
                            component = COMPONENT,
                            subscriber_id = %self.id,
                            force,
                            "subscriber disconnected"
                        );
                        self.schedule_reconnect();
                        return;
                    }
                }
                state @ (SubscriberState::Initial | SubscriberState::Connecting) => {
                    if self.compare_and_set_state(state, SubscriberState::Disconnected) {
                        self.force_reconnect.fetch_or(force, Ordering::AcqRel);
                        self.statistics.record_disconnect();
                        return;
                    }
                }
                SubscriberState::Disconnected
                | SubscriberState::Closing
                | SubscriberState::Closed => return,
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.is_active() || self.reconnect_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let wait = self.dependencies.reconnect_wait();
        debug!(
            event = events::SUBSCRIBER_RECONNECT_SCHEDULED,
            component = COMPONENT,
            subscriber_id = %self.id,
            wait_ms = wait.as_millis() as u64,
            "reconnect scheduled"
        );
        let core = Arc::downgrade(self);
        scheduler::schedule(wait, async move {
            if let Some(core) = core.upgrade() {
                core.reconnect_scheduled.store(false, Ordering::Release);
                core.reconnect_internal().await;
            }
        });
    }

    async fn reconnect_internal(self: &Arc<Self>) {
        if self.is_connected() || !self.is_active() {
            return;
        }
        if self.connector.is_suspended() {
            debug!(
                event = events::SUBSCRIBER_RECONNECT_SKIPPED,
                component = COMPONENT,
                subscriber_id = %self.id,
                reason = REASON_SUSPENDED,
                "reconnect skipped"
            );
            self.schedule_reconnect();
            return;
        }
        if self.queue.size() == 0 {
            debug!(
                event = events::SUBSCRIBER_RECONNECT_SKIPPED,
                component = COMPONENT,
                subscriber_id = %self.id,
                reason = REASON_NO_PENDING_REQUESTS,
                "reconnect skipped"
            );
            return;
        }
        if let Err(err) = self.ensure_connected().await {
            warn!(
                event = events::SUBSCRIBER_RECONNECT_FAILED,
                component = COMPONENT,
                subscriber_id = %self.id,
                err = %err,
                "subscriber reconnect failed"
            );
            if !err.is_fatal() {
                self.schedule_reconnect();
            }
        }
    }

    // ---- receive loop ----

    pub(crate) fn receive(&self, batch: Option<usize>) -> Result<OperationFuture<Response>> {
        self.ensure_active()?;
        let future = self.queue.add(Request::Receive { batch })?;
        self.statistics.record_receive_request();
        Ok(future)
    }

    /// Queues a seek or position query ahead of waiting receives.
    pub(crate) async fn request_positions(
        &self,
        request: Request,
    ) -> Result<BTreeMap<ChannelId, Position>> {
        self.ensure_active()?;
        match self.queue.add_first(request)?.await? {
            Response::Positions(positions) => Ok(positions),
            _ => Err(TopicError::IllegalState(
                "unexpected response to a position request".to_string(),
            )),
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            if !self.is_active() {
                return;
            }
            if !self.is_connected() {
                self.queue.reset_trigger();
                self.schedule_reconnect();
                return;
            }
            self.queue.promote_pending(Request::is_functional);
            if self.queue.is_batch_complete() && !self.queue.fill_current_batch(RECEIVE_BATCH) {
                return;
            }

            self.connector.heartbeat().await;
            self.complete_requests().await;
            if self.queue.is_batch_complete() {
                continue;
            }

            if let Some((channel, head, version)) = self.ensure_owned_channel() {
                let result = self.connector.receive(channel, head, usize::MAX).await;
                self.on_receive_result(channel, head, version, result);
                continue;
            }

            // Decided under the gate so a populated notification cannot slip in
            // between the last empty verdict and reopening the trigger.
            let waiting = {
                let mut gate = self.gate.lock();
                if gate.switch_channel() {
                    false
                } else if self.complete_on_empty {
                    let mut prefetch = self.prefetch.lock();
                    if !prefetch.back().is_some_and(Prefetched::is_empty_marker) {
                        prefetch.push_back(Prefetched::Empty);
                    }
                    false
                } else {
                    self.queue.reset_trigger();
                    true
                }
            };
            if waiting {
                self.statistics.record_wait();
                return;
            }
        }
    }

    /// Current channel if it is still owned and readable, otherwise the next one.
    fn ensure_owned_channel(&self) -> Option<(ChannelId, Position, u64)> {
        let mut gate = self.gate.lock();
        let readable = gate
            .current
            .and_then(|current| gate.channel(current))
            .is_some_and(|state| state.is_owned() && !state.is_empty());
        if !readable && !gate.switch_channel() {
            return None;
        }
        let channel = gate.current?;
        let state = gate.channel(channel)?;
        Some((channel, state.head(), state.version()))
    }

    async fn complete_requests(&self) {
        let mut paused = false;
        while let Some(request) = self.queue.batch_head().filter(Request::is_functional) {
            if !paused {
                self.queue.pause();
                paused = true;
            }
            let mut outcome = Some(self.execute(&request).await);
            self.queue.complete_elements(1, |_, _| {
                outcome.take().unwrap_or_else(|| {
                    Err(TopicError::IllegalState("request already completed".to_string()))
                })
            });
        }
        if paused {
            self.queue.resume();
        }
        self.complete_receives();
    }

    async fn execute(&self, request: &Request) -> Result<Response> {
        let positions = match request {
            Request::Seek(target) => self.seek_internal(target).await,
            Request::Positions(PositionKind::Head) => Ok(self.heads_internal()),
            Request::Positions(PositionKind::Tail) => self.tails_internal().await,
            Request::Positions(PositionKind::Committed) => self.last_committed_internal().await,
            Request::Receive { .. } => Err(TopicError::IllegalState(
                "receive requests are completed from the prefetch queue".to_string(),
            )),
        };
        positions.map(Response::Positions)
    }

    /// Serves waiting receives from the prefetch queue.
    fn complete_receives(&self) {
        if !self.is_connected() {
            return;
        }
        let mut gate = self.gate.lock();
        let mut prefetch = self.prefetch.lock();
        if prefetch.is_empty() {
            return;
        }
        let requests = self.queue.current_batch_values();

        if prefetch.front().is_some_and(Prefetched::is_empty_marker) {
            prefetch.pop_front();
            let receives = requests
                .iter()
                .take_while(|request| !request.is_functional())
                .count();
            let completed = self
                .queue
                .complete_elements(receives, |_, request| Ok(Response::empty_for(request)));
            for _ in 0..completed {
                self.statistics.record_received_empty();
            }
            return;
        }

        for request in requests {
            let response = match request {
                Request::Receive { batch: None } => match pop_owned(&gate, &mut prefetch) {
                    Some(element) => Response::Element(Some(element)),
                    None => break,
                },
                Request::Receive { batch: Some(max) } => {
                    let mut elements = Vec::new();
                    while elements.len() < max {
                        match pop_owned(&gate, &mut prefetch) {
                            Some(element) => elements.push(element),
                            None => break,
                        }
                    }
                    if elements.is_empty() {
                        break;
                    }
                    Response::Batch(elements)
                }
                _ => break,
            };
            let delivered: Vec<(ChannelId, Position)> = match &response {
                Response::Element(Some(element)) => vec![(element.channel, element.position)],
                Response::Batch(elements) => elements
                    .iter()
                    .map(|element| (element.channel, element.position))
                    .collect(),
                _ => Vec::new(),
            };
            match self.queue.complete_element(response) {
                Ok(()) => {
                    self.statistics.record_received(delivered.len());
                    for (channel, position) in delivered {
                        if let Some(state) = gate.channel_mut(channel) {
                            state.record_received(position);
                        }
                    }
                }
                Err(returned) => {
                    for element in returned.into_elements().into_iter().rev() {
                        prefetch.push_front(Prefetched::Element(element));
                    }
                }
            }
            if prefetch.is_empty() {
                break;
            }
        }
    }

    fn on_receive_result(
        self: &Arc<Self>,
        channel: ChannelId,
        head: Position,
        version: u64,
        result: Result<ReceiveResult>,
    ) {
        let result = match result {
            Ok(result) => result,
            Err(err) => return self.on_receive_error(channel, err),
        };
        if result.status == ReceiveStatus::UnknownSubscriber {
            debug!(
                event = events::SUBSCRIBER_DISCONNECT,
                component = COMPONENT,
                subscriber_id = %self.id,
                channel,
                "subscriber is unknown to the topic; reconnecting"
            );
            self.disconnect_internal(true);
            return;
        }

        let polled = result.elements.len();
        self.statistics.record_poll(polled);
        if polled == 0 {
            self.statistics.record_miss();
        }
        let drained = result.remaining == 0
            || matches!(
                result.status,
                ReceiveStatus::Exhausted | ReceiveStatus::NotAllocatedChannel
            );

        let mut gate = self.gate.lock();
        if let Some(state) = gate.channel_mut(channel) {
            state.record_poll(head, polled);
            if let Some(next) = result.head {
                state.set_head(next);
            }
            if drained {
                state.set_empty(version);
            }
        }
        if self.is_connected() {
            let mut prefetch = self.prefetch.lock();
            for element in result.elements {
                if self.accepts(&element) {
                    prefetch.push_back(Prefetched::Element(element));
                }
            }
        }
        if drained {
            gate.switch_channel();
        }
        if tracing::enabled!(Level::TRACE) {
            trace!(
                component = COMPONENT,
                subscriber_id = %self.id,
                channel,
                status = ?result.status,
                polled,
                remaining = result.remaining,
                "receive completed"
            );
        }
    }

    fn accepts(&self, element: &ReceivedElement) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter(&element.binary))
    }

    fn on_receive_error(self: &Arc<Self>, channel: ChannelId, err: TopicError) {
        self.statistics.record_received_error();
        if err.is_connection() {
            debug!(
                event = events::SUBSCRIBER_RECEIVE_FAILED,
                component = COMPONENT,
                subscriber_id = %self.id,
                channel,
                err = %err,
                "receive lost its connection"
            );
            self.disconnect_internal(false);
            return;
        }
        warn!(
            event = events::SUBSCRIBER_RECEIVE_FAILED,
            component = COMPONENT,
            subscriber_id = %self.id,
            channel,
            err = %err,
            "receive failed"
        );
        self.queue.handle_error(
            |_| err.clone().wrap(format!("failed to receive from channel {channel}")),
            ErrorAction::CompleteWithException,
        );
    }

    // ---- positions ----

    async fn seek_internal(&self, target: &SeekTarget) -> Result<BTreeMap<ChannelId, Position>> {
        self.ensure_active()?;
        let results = match target {
            SeekTarget::Head(channels) => {
                self.ensure_owned(channels.iter().copied(), TopicError::IllegalArgument)?;
                if channels.is_empty() {
                    return Ok(BTreeMap::new());
                }
                let heads = self.connector.topic_heads(channels).await?;
                self.connector.seek_to_position(heads).await?
            }
            SeekTarget::Tail(channels) => {
                self.ensure_owned(channels.iter().copied(), TopicError::IllegalArgument)?;
                if channels.is_empty() {
                    return Ok(BTreeMap::new());
                }
                let tails = self.connector.topic_tails().await?;
                let positions = tails
                    .into_iter()
                    .filter(|(channel, _)| channels.contains(channel))
                    .collect();
                self.connector.seek_to_position(positions).await?
            }
            SeekTarget::Positions(positions) => {
                self.ensure_owned(positions.keys().copied(), TopicError::IllegalState)?;
                if positions.is_empty() {
                    return Ok(BTreeMap::new());
                }
                self.connector.seek_to_position(positions.clone()).await?
            }
            SeekTarget::Timestamps(timestamps) => {
                self.ensure_owned(timestamps.keys().copied(), TopicError::IllegalState)?;
                if timestamps.is_empty() {
                    return Ok(BTreeMap::new());
                }
                self.connector.seek_to_timestamp(timestamps.clone()).await?
            }
        };
        Ok(self.apply_seek(results))
    }

    fn apply_seek(
        &self,
        results: BTreeMap<ChannelId, SeekResult>,
    ) -> BTreeMap<ChannelId, Position> {
        let mut gate = self.gate.lock();
        let mut prefetch = self.prefetch.lock();
        let mut seeked = BTreeMap::new();
        for (channel, result) in results {
            if let Some(state) = gate.channel_mut(channel) {
                state.set_head(result.head);
                state.set_populated();
            }
            prefetch.retain(|entry| entry.channel() != Some(channel));
            seeked.insert(channel, result.seeked_to);
        }
        if gate.current.is_none() {
            gate.switch_channel();
        }
        info!(
            event = events::SUBSCRIBER_SEEK,
            component = COMPONENT,
            subscriber_id = %self.id,
            channels = format_channels(seeked.keys()),
            "subscriber seeked"
        );
        seeked
    }

    /// Owned channel heads, lowered to anything still waiting in the prefetch
    /// queue.
    fn heads_internal(&self) -> BTreeMap<ChannelId, Position> {
        let gate = self.gate.lock();
        let prefetch = self.prefetch.lock();
        let mut heads: BTreeMap<ChannelId, Position> = gate
            .owned
            .iter()
            .filter_map(|channel| gate.channel(*channel).map(|state| (*channel, state.head())))
            .collect();
        for entry in prefetch.iter() {
            if let Prefetched::Element(element) = entry {
                if let Some(head) = heads.get_mut(&element.channel) {
                    if element.position < *head {
                        *head = element.position;
                    }
                }
            }
        }
        heads
    }

    async fn tails_internal(&self) -> Result<BTreeMap<ChannelId, Position>> {
        let tails = self.connector.topic_tails().await?;
        let gate = self.gate.lock();
        Ok(gate
            .owned
            .iter()
            .filter_map(|channel| {
                let tail = tails
                    .get(channel)
                    .copied()
                    .or_else(|| gate.channel(*channel).map(|state| state.head()))?;
                Some((*channel, tail))
            })
            .collect())
    }

    async fn last_committed_internal(&self) -> Result<BTreeMap<ChannelId, Position>> {
        let committed = self.connector.last_committed().await?;
        let owned = self.channels();
        Ok(owned
            .into_iter()
            .map(|channel| {
                let position = committed.get(&channel).copied().unwrap_or(Position::EMPTY);
                (channel, position)
            })
            .collect())
    }

    pub(crate) async fn commit(
        &self,
        channel: ChannelId,
        position: Position,
    ) -> Result<CommitResult> {
        self.ensure_active()?;
        let known = self.channel_count();
        if channel >= known {
            return Err(TopicError::IllegalArgument(format!(
                "channel {channel} is out of range for {known} channels"
            )));
        }
        match self.connector.commit(channel, position).await {
            Ok(result) => {
                if result.is_success() {
                    if let Some(state) = self.gate.lock().channel_mut(channel) {
                        state.record_committed(position);
                    }
                }
                Ok(result)
            }
            Err(err) => {
                warn!(
                    event = events::SUBSCRIBER_COMMIT_FAILED,
                    component = COMPONENT,
                    subscriber_id = %self.id,
                    channel,
                    position = %position,
                    err = %err,
                    "commit failed"
                );
                Err(err)
            }
        }
    }

    // ---- close ----

    pub(crate) fn close_async(self: &Arc<Self>, destroyed: bool) {
        let core = self.clone();
        scheduler::spawn(async move { core.close_internal(destroyed).await });
    }

    pub(crate) async fn close_internal(&self, destroyed: bool) {
        let previous = {
            let _gate = self.gate.lock();
            self.set_state(SubscriberState::Closing)
        };
        let Some(previous) = previous else {
            return;
        };
        info!(
            event = events::SUBSCRIBER_CLOSE_START,
            component = COMPONENT,
            subscriber_id = %self.id,
            topic = self.connector.topic_name(),
            prev_state = ?previous,
            destroyed,
            "closing subscriber"
        );

        if let Some(listener) = self.listener.lock().take() {
            self.connector.remove_listener(&listener);
        }
        self.queue.close();
        self.queue
            .cancel_all_and_close("the subscriber has been closed", None);

        let close_timeout = self.dependencies.close_timeout();
        if tokio::time::timeout(close_timeout, self.queue.flush())
            .await
            .is_err()
        {
            warn!(
                event = events::SUBSCRIBER_CLOSE_FLUSH_TIMEOUT,
                component = COMPONENT,
                subscriber_id = %self.id,
                timeout_ms = close_timeout.as_millis() as u64,
                "flush timed out; failing outstanding requests"
            );
            self.queue.handle_error(
                |_| TopicError::Fatal("force close of subscriber".to_string()),
                ErrorAction::CompleteWithException,
            );
        }
        self.prefetch.lock().clear();

        if let Err(err) = self.connector.close_subscription(destroyed).await {
            debug!(
                event = events::SUBSCRIBER_UNSUBSCRIBE_FAILED,
                component = COMPONENT,
                subscriber_id = %self.id,
                err = %err,
                "failed to close the subscription"
            );
        }
        self.set_state(SubscriberState::Closed);

        let actions = std::mem::take(&mut *self.on_close.lock());
        for action in actions {
            self.run_close_action(action);
        }
        self.receive_daemon.stop();
        self.channel_daemon.stop();
        self.connector.close().await;

        info!(
            event = events::SUBSCRIBER_CLOSE_OK,
            component = COMPONENT,
            subscriber_id = %self.id,
            "subscriber closed"
        );
    }

    pub(crate) fn on_close(&self, action: CloseAction) {
        {
            let mut actions = self.on_close.lock();
            if self.state() != SubscriberState::Closed {
                actions.push(action);
                return;
            }
        }
        self.run_close_action(action);
    }

    fn run_close_action(&self, action: CloseAction) {
        if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
            warn!(
                event = events::SUBSCRIBER_ON_CLOSE_FAILED,
                component = COMPONENT,
                subscriber_id = %self.id,
                "on-close action failed"
            );
        }
    }
}

fn pop_owned(gate: &ChannelGate, prefetch: &mut VecDeque<Prefetched>) -> Option<ReceivedElement> {
    while let Some(entry) = prefetch.pop_front() {
        if let Prefetched::Element(element) = entry {
            if gate.is_owner(element.channel) {
                return Some(element);
            }
        }
    }
    None
}

/// Routes connector events back into the subscriber.
struct SubscriberEvents {
    core: Weak<SubscriberCore>,
}

impl SubscriberListener for SubscriberEvents {
    fn on_event(&self, event: SubscriberEvent) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if !core.is_active() {
            return;
        }
        if tracing::enabled!(Level::DEBUG) {
            debug!(
                event = events::SUBSCRIBER_EVENT,
                component = COMPONENT,
                subscriber_id = %core.id,
                subscriber_event = ?event,
                "subscriber connector event"
            );
        }
        match event {
            SubscriberEvent::GroupDestroyed | SubscriberEvent::Destroyed => core.close_async(true),
            SubscriberEvent::Released => core.close_async(false),
            SubscriberEvent::ChannelAllocation(channels) => {
                let target = core.clone();
                core.channel_daemon
                    .execute(move || target.update_channel_ownership(channels, false));
            }
            SubscriberEvent::ChannelsLost => {
                let target = core.clone();
                core.channel_daemon
                    .execute(move || target.update_channel_ownership(BTreeSet::new(), true));
            }
            SubscriberEvent::Unsubscribed => {
                let target = core.clone();
                core.channel_daemon.execute(move || {
                    target.update_channel_ownership(BTreeSet::new(), true);
                    target.disconnect_internal(false);
                });
            }
            SubscriberEvent::ChannelPopulated(channels) => {
                let target = core.clone();
                core.channel_daemon
                    .execute(move || target.on_channels_populated(&channels, true));
            }
            SubscriberEvent::Disconnected => core.disconnect_internal(false),
        }
    }
}
