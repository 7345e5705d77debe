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

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use topic_engine::{
    ChannelId, CommitResult, CommitStatus, InitializeRequest, OfferCookie, Position,
    PublishResult, PublisherChannelConnector, PublisherConnector, PublisherEvent,
    PublisherListener, ReceiveResult, ReceiveStatus, ReceivedElement, Result, SeekResult,
    SubscriberConnector, SubscriberEvent, SubscriberId, SubscriberListener, TopicDependencies,
    TopicError,
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Dependencies with short timings so reconnect paths finish quickly.
pub(crate) fn fast_dependencies() -> TopicDependencies {
    TopicDependencies {
        reconnect_timeout_millis: 2_000,
        reconnect_retry_millis: 20,
        reconnect_wait_millis: 50,
        max_batch_size_bytes: 4096,
        notify_post_full_timeout_millis: 0,
        subscriber_timeout_millis: 1_000,
        close_timeout_millis: 500,
        clogged_count: 64,
    }
}

/// Awaits `future`, failing the test if it takes longer than the wait limit.
pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT_LIMIT, future)
        .await
        .expect("operation should complete within the wait limit")
}

/// Polls `condition` until it holds or the wait limit passes.
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Opens once; everything waiting on it proceeds.
#[derive(Clone)]
pub(crate) struct Gate {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Gate {
    pub(crate) fn new(open: bool) -> Self {
        let (sender, receiver) = watch::channel(open);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub(crate) fn open(&self) {
        let _ = self.sender.send(true);
    }

    pub(crate) async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|open| *open).await;
    }
}

// ---- publisher side ----

/// One offer as the backend saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RecordedOffer {
    pub(crate) channel: ChannelId,
    pub(crate) values: Vec<Vec<u8>>,
    pub(crate) notify_post_full: bool,
}

struct PublisherBackend {
    offers: Mutex<Vec<RecordedOffer>>,
    stored: Mutex<BTreeMap<ChannelId, Vec<Vec<u8>>>>,
    /// Values a channel holds before it reports itself full. `None` is unbounded.
    capacity: Mutex<Option<usize>>,
    initialized: AtomicUsize,
    connects: AtomicUsize,
    /// Errors for the first value of upcoming offers.
    rejections: Mutex<VecDeque<TopicError>>,
    gate: Gate,
}

pub(crate) struct MockPublisherConnector {
    topic: String,
    channel_count: usize,
    dependencies: TopicDependencies,
    backend: Arc<PublisherBackend>,
    listeners: Mutex<Vec<Arc<dyn PublisherListener>>>,
    closed: AtomicBool,
}

impl MockPublisherConnector {
    pub(crate) fn new(topic: &str, channel_count: usize, dependencies: TopicDependencies) -> Self {
        Self::with_gate(topic, channel_count, dependencies, Gate::new(true))
    }

    /// Holds every channel `initialize` until the returned gate opens.
    pub(crate) fn gated(
        topic: &str,
        channel_count: usize,
        dependencies: TopicDependencies,
    ) -> (Self, Gate) {
        let gate = Gate::new(false);
        let connector = Self::with_gate(topic, channel_count, dependencies, gate.clone());
        (connector, gate)
    }

    fn with_gate(
        topic: &str,
        channel_count: usize,
        dependencies: TopicDependencies,
        gate: Gate,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            channel_count,
            dependencies,
            backend: Arc::new(PublisherBackend {
                offers: Mutex::new(Vec::new()),
                stored: Mutex::new(BTreeMap::new()),
                capacity: Mutex::new(None),
                initialized: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                rejections: Mutex::new(VecDeque::new()),
                gate,
            }),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_capacity(&self, capacity: Option<usize>) {
        *self.backend.capacity.lock() = capacity;
    }

    /// Makes the next offer reject its first value with `error`.
    pub(crate) fn reject_next(&self, error: TopicError) {
        self.backend.rejections.lock().push_back(error);
    }

    /// Calls to `ensure_connected` on any channel connector.
    pub(crate) fn channel_connects(&self) -> usize {
        self.backend.connects.load(Ordering::Acquire)
    }

    pub(crate) fn offers(&self) -> Vec<RecordedOffer> {
        self.backend.offers.lock().clone()
    }

    pub(crate) fn stored(&self, channel: ChannelId) -> Vec<Vec<u8>> {
        self.backend
            .stored
            .lock()
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn raise(&self, event: PublisherEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }
}

#[async_trait]
impl PublisherConnector for MockPublisherConnector {
    fn topic_name(&self) -> &str {
        &self.topic
    }

    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn dependencies(&self) -> TopicDependencies {
        self.dependencies.clone()
    }

    fn is_active(&self) -> bool {
        !self.is_closed()
    }

    async fn ensure_connected(&self) -> Result<()> {
        Ok(())
    }

    fn create_channel_connector(&self, channel: ChannelId) -> Arc<dyn PublisherChannelConnector> {
        Arc::new(MockPublisherChannel {
            channel,
            backend: self.backend.clone(),
        })
    }

    fn add_listener(&self, listener: Arc<dyn PublisherListener>) {
        self.listeners.lock().push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn PublisherListener>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct MockPublisherChannel {
    channel: ChannelId,
    backend: Arc<PublisherBackend>,
}

#[async_trait]
impl PublisherChannelConnector for MockPublisherChannel {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn is_active(&self) -> bool {
        true
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.backend.connects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn initialize(&self) -> Result<OfferCookie> {
        self.backend.gate.wait().await;
        let cookie = self.backend.initialized.fetch_add(1, Ordering::AcqRel) as u64;
        Ok(OfferCookie(cookie))
    }

    async fn offer(
        &self,
        _cookie: OfferCookie,
        values: Vec<Vec<u8>>,
        notify_post_full: bool,
    ) -> Result<PublishResult> {
        self.backend.offers.lock().push(RecordedOffer {
            channel: self.channel,
            values: values.clone(),
            notify_post_full,
        });
        if let Some(error) = self.backend.rejections.lock().pop_front() {
            let mut rejected = PublishResult::success(Vec::new(), 1 << 20);
            rejected.errors.insert(0, error);
            return Ok(rejected);
        }
        let offered = values.len();
        let capacity = *self.backend.capacity.lock();
        let mut stored = self.backend.stored.lock();
        let log = stored.entry(self.channel).or_default();
        let room = capacity.map_or(usize::MAX, |capacity| capacity.saturating_sub(log.len()));
        let accepted = offered.min(room);
        let positions = (log.len()..log.len() + accepted)
            .map(|offset| Position::new(0, offset as i32))
            .collect();
        log.extend(values.into_iter().take(accepted));
        if accepted < offered {
            return Ok(PublishResult::topic_full(positions));
        }
        let remaining_capacity = if room == accepted { 0 } else { 1 << 20 };
        Ok(PublishResult::success(positions, remaining_capacity))
    }

    async fn prepare_offer_retry(&self, cookie: OfferCookie) -> Result<OfferCookie> {
        Ok(cookie)
    }

    async fn close(&self) {}
}

// ---- subscriber side ----

struct StoredElement {
    binary: Vec<u8>,
    timestamp: SystemTime,
}

/// In-memory topic a subscriber connector reads from.
pub(crate) struct MockSubscriberConnector {
    topic: String,
    subscriber_id: SubscriberId,
    dependencies: TopicDependencies,
    channels: Mutex<Vec<Vec<StoredElement>>>,
    owned: Mutex<BTreeSet<ChannelId>>,
    committed: Mutex<BTreeMap<ChannelId, Position>>,
    listeners: Mutex<Vec<Arc<dyn SubscriberListener>>>,
    initializations: Mutex<Vec<InitializeRequest>>,
    connection: AtomicU64,
    failing_connects: AtomicUsize,
    receives: AtomicUsize,
    scripted: Mutex<VecDeque<ReceiveStatus>>,
    exhausted_at_end: AtomicBool,
    subscription_closed: AtomicBool,
    closed: AtomicBool,
}

impl MockSubscriberConnector {
    pub(crate) fn new(topic: &str, channel_count: usize, dependencies: TopicDependencies) -> Self {
        Self {
            topic: topic.to_string(),
            subscriber_id: SubscriberId::external(1),
            dependencies,
            channels: Mutex::new((0..channel_count).map(|_| Vec::new()).collect()),
            owned: Mutex::new((0..channel_count).collect()),
            committed: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
            initializations: Mutex::new(Vec::new()),
            connection: AtomicU64::new(0),
            failing_connects: AtomicUsize::new(0),
            receives: AtomicUsize::new(0),
            scripted: Mutex::new(VecDeque::new()),
            exhausted_at_end: AtomicBool::new(false),
            subscription_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Channels the group reports as owned on the next `owned_channels` call.
    pub(crate) fn with_owned(self, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        *self.owned.lock() = channels.into_iter().collect();
        self
    }

    /// Makes the next `count` initialisations fail with a connection error.
    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::Release);
    }

    /// Makes the next receive answer with `status` and no elements.
    pub(crate) fn script_receive(&self, status: ReceiveStatus) {
        self.scripted.lock().push_back(status);
    }

    /// Reports a read at the end of a channel as `Exhausted` instead of an empty
    /// success.
    pub(crate) fn report_exhausted_at_end(&self) {
        self.exhausted_at_end.store(true, Ordering::Release);
    }

    /// Adds `count` channels to the topic without telling the subscriber.
    pub(crate) fn grow(&self, count: usize) {
        let mut channels = self.channels.lock();
        channels.extend((0..count).map(|_| Vec::new()));
    }

    /// Stores `values` in `channel` without telling the subscriber.
    pub(crate) fn store(&self, channel: ChannelId, values: impl IntoIterator<Item = Vec<u8>>) {
        let mut channels = self.channels.lock();
        let timestamp = SystemTime::now();
        channels[channel].extend(
            values
                .into_iter()
                .map(|binary| StoredElement { binary, timestamp }),
        );
    }

    /// Stores `values` and raises a populated event for `channel`.
    pub(crate) fn append(&self, channel: ChannelId, values: impl IntoIterator<Item = Vec<u8>>) {
        self.store(channel, values);
        self.raise(SubscriberEvent::ChannelPopulated(BTreeSet::from([channel])));
    }

    /// Reassigns the subscriber's channels the way a group coordinator would.
    pub(crate) fn allocate(&self, channels: impl IntoIterator<Item = ChannelId>) {
        let channels: BTreeSet<ChannelId> = channels.into_iter().collect();
        *self.owned.lock() = channels.clone();
        self.raise(SubscriberEvent::ChannelAllocation(channels));
    }

    pub(crate) fn raise(&self, event: SubscriberEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }

    pub(crate) fn initializations(&self) -> Vec<InitializeRequest> {
        self.initializations.lock().clone()
    }

    pub(crate) fn committed(&self) -> BTreeMap<ChannelId, Position> {
        self.committed.lock().clone()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn receive_calls(&self) -> usize {
        self.receives.load(Ordering::Acquire)
    }

    pub(crate) fn is_subscription_closed(&self) -> bool {
        self.subscription_closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn channel_count_now(&self) -> usize {
        self.channels.lock().len()
    }
}

/// Stored elements of one channel are at `Position::new(0, index)`; a head is the
/// position of the next element to read.
fn offset_of(position: Position) -> usize {
    if position.is_empty() {
        0
    } else {
        position.offset().max(0) as usize
    }
}

fn after(position: Position) -> Position {
    if position.is_empty() {
        Position::new(0, 0)
    } else {
        Position::new(0, position.offset() + 1)
    }
}

#[async_trait]
impl SubscriberConnector for MockSubscriberConnector {
    fn topic_name(&self) -> &str {
        &self.topic
    }

    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    fn channel_count(&self) -> usize {
        self.channel_count_now()
    }

    fn dependencies(&self) -> TopicDependencies {
        self.dependencies.clone()
    }

    fn is_active(&self) -> bool {
        !self.is_closed()
    }

    fn connection_timestamp(&self) -> u64 {
        self.connection.load(Ordering::Acquire)
    }

    async fn ensure_connected(&self) -> Result<()> {
        Ok(())
    }

    async fn initialize(&self, request: InitializeRequest) -> Result<Vec<Position>> {
        self.initializations.lock().push(request);
        let failing = self.failing_connects.load(Ordering::Acquire);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::Release);
            return Err(TopicError::Connection("backend unavailable".to_string()));
        }
        self.connection.fetch_add(1, Ordering::AcqRel);
        let committed = self.committed.lock();
        Ok((0..self.channel_count_now())
            .map(|channel| {
                committed
                    .get(&channel)
                    .map_or(Position::new(0, 0), |position| after(*position))
            })
            .collect())
    }

    async fn owned_channels(&self) -> Result<BTreeSet<ChannelId>> {
        Ok(self.owned.lock().clone())
    }

    async fn receive(
        &self,
        channel: ChannelId,
        head: Position,
        max_elements: usize,
    ) -> Result<ReceiveResult> {
        self.receives.fetch_add(1, Ordering::AcqRel);
        if let Some(status) = self.scripted.lock().pop_front() {
            return Ok(ReceiveResult::status(status));
        }
        if !self.owned.lock().contains(&channel) {
            return Ok(ReceiveResult::status(ReceiveStatus::NotAllocatedChannel));
        }
        let channels = self.channels.lock();
        let Some(stored) = channels.get(channel) else {
            return Err(TopicError::IllegalArgument(format!("no channel {channel}")));
        };
        let start = offset_of(head).min(stored.len());
        if start == stored.len() && self.exhausted_at_end.load(Ordering::Acquire) {
            return Ok(ReceiveResult::status(ReceiveStatus::Exhausted));
        }
        let end = start.saturating_add(max_elements).min(stored.len());
        let elements = (start..end)
            .map(|index| ReceivedElement {
                channel,
                position: Position::new(0, index as i32),
                timestamp: stored[index].timestamp,
                binary: stored[index].binary.clone(),
            })
            .collect();
        Ok(ReceiveResult::with_elements(
            elements,
            stored.len() - end,
            Position::new(0, end as i32),
        ))
    }

    async fn commit(&self, channel: ChannelId, position: Position) -> Result<CommitResult> {
        let mut committed = self.committed.lock();
        let status = match committed.get(&channel) {
            Some(previous) if *previous >= position => CommitStatus::AlreadyCommitted,
            _ => {
                committed.insert(channel, position);
                CommitStatus::Committed
            }
        };
        Ok(CommitResult {
            channel,
            position,
            status,
        })
    }

    async fn seek_to_position(
        &self,
        positions: BTreeMap<ChannelId, Position>,
    ) -> Result<BTreeMap<ChannelId, SeekResult>> {
        Ok(positions
            .into_iter()
            .map(|(channel, position)| {
                (
                    channel,
                    SeekResult {
                        head: after(position),
                        seeked_to: position,
                    },
                )
            })
            .collect())
    }

    async fn seek_to_timestamp(
        &self,
        timestamps: BTreeMap<ChannelId, SystemTime>,
    ) -> Result<BTreeMap<ChannelId, SeekResult>> {
        let channels = self.channels.lock();
        Ok(timestamps
            .into_iter()
            .filter_map(|(channel, timestamp)| {
                let stored = channels.get(channel)?;
                let index = stored
                    .iter()
                    .position(|element| element.timestamp >= timestamp)
                    .unwrap_or(stored.len());
                let head = Position::new(0, index as i32);
                Some((
                    channel,
                    SeekResult {
                        head,
                        seeked_to: head,
                    },
                ))
            })
            .collect())
    }

    async fn topic_heads(
        &self,
        channels: &BTreeSet<ChannelId>,
    ) -> Result<BTreeMap<ChannelId, Position>> {
        Ok(channels
            .iter()
            .map(|channel| (*channel, Position::EMPTY))
            .collect())
    }

    async fn topic_tails(&self) -> Result<BTreeMap<ChannelId, Position>> {
        let channels = self.channels.lock();
        Ok(channels
            .iter()
            .enumerate()
            .map(|(channel, stored)| {
                let tail = match stored.len() {
                    0 => Position::EMPTY,
                    len => Position::new(0, len as i32 - 1),
                };
                (channel, tail)
            })
            .collect())
    }

    async fn last_committed(&self) -> Result<BTreeMap<ChannelId, Position>> {
        Ok(self.committed())
    }

    async fn heartbeat(&self) {}

    async fn close_subscription(&self, _destroyed: bool) -> Result<()> {
        self.subscription_closed.store(true, Ordering::Release);
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn SubscriberListener>) {
        self.listeners.lock().push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn SubscriberListener>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
