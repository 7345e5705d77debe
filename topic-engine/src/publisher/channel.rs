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

//! Per-channel publish engine.
//!
//! A [`PublisherChannel`] owns the batching queue of serialized values bound for
//! one channel. The first publish after the queue goes idle spawns a drain task
//! on the publisher daemon; the task offers batches to the channel connector
//! until the queue is empty, the channel is paused by a full topic, or a hard
//! failure closes the channel.

use crate::batching::{BatchingQueue, DebouncedFlowControl, ErrorAction, OperationFuture};
use crate::batching::queue::TriggerFn;
use crate::config::TopicDependencies;
use crate::connector::PublisherChannelConnector;
use crate::error::{Result, TopicError};
use crate::lifecycle::{LifecycleState, StateCell};
use crate::model::{ChannelId, OfferCookie, PublishReceipt, PublishResult, PublishStatus};
use crate::observability::events;
use crate::publisher::options::FlushMode;
use crate::publisher::statistics::PublisherStatistics;
use crate::runtime::TaskDaemon;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const COMPONENT: &str = "publisher_channel";

const TOPIC_FULL_MESSAGE: &str = "the topic is at capacity";

/// Callback through which a channel reports failures to its publisher.
pub(crate) type ChannelErrorHandler = Arc<dyn Fn(ChannelId, &TopicError) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ChannelState {
    Active,
    Closing,
    Closed,
}

impl LifecycleState for ChannelState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Active,
            1 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    fn can_transition(self, next: Self) -> bool {
        next > self
    }
}

pub(crate) struct PublisherChannel {
    channel: ChannelId,
    publisher_id: String,
    connector: Arc<dyn PublisherChannelConnector>,
    state: StateCell<ChannelState>,
    queue: BatchingQueue<Vec<u8>, PublishReceipt>,
    dependencies: TopicDependencies,
    daemon: Arc<TaskDaemon>,
    statistics: Arc<PublisherStatistics>,
    on_error: ChannelErrorHandler,
    /// Set on replacement channels; the first drain reconnects before offering.
    reconnect_first: AtomicBool,
}

impl PublisherChannel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        channel: ChannelId,
        publisher_id: String,
        connector: Arc<dyn PublisherChannelConnector>,
        dependencies: TopicDependencies,
        daemon: Arc<TaskDaemon>,
        flow_control: Arc<DebouncedFlowControl>,
        statistics: Arc<PublisherStatistics>,
        on_error: ChannelErrorHandler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let trigger: TriggerFn = {
                let this = this.clone();
                Arc::new(move |_initial_batch| {
                    if let Some(channel) = this.upgrade() {
                        let daemon = channel.daemon.clone();
                        daemon.spawn(channel.drain());
                    }
                })
            };
            let queue = BatchingQueue::new(
                format!("publisher-{publisher_id}-channel-{channel}"),
                trigger,
                1,
                Arc::new(|value: &Vec<u8>| value.len() as u64),
                flow_control,
                daemon.clone(),
            );
            debug!(
                event = events::PUBLISHER_CHANNEL_CREATE,
                component = COMPONENT,
                publisher_id = publisher_id.as_str(),
                channel,
                "publisher channel created"
            );
            Self {
                channel,
                publisher_id,
                connector,
                state: StateCell::new(ChannelState::Active),
                queue,
                dependencies,
                daemon,
                statistics,
                on_error,
                reconnect_first: AtomicBool::new(false),
            }
        })
    }

    /// Makes the first drain run [`Self::ensure_connected`] before its first offer.
    pub(crate) fn reconnect_before_offer(&self) {
        self.reconnect_first.store(true, Ordering::Release);
    }

    pub(crate) fn channel(&self) -> ChannelId {
        self.channel
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.get() == ChannelState::Active && self.queue.is_active()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.queue.is_paused()
    }

    /// Outstanding values, queued or in flight.
    pub(crate) fn size(&self) -> usize {
        self.queue.size()
    }

    /// Queues `binary` for the channel.
    pub(crate) fn publish(&self, binary: Vec<u8>) -> Result<OperationFuture<PublishReceipt>> {
        let inactive = || {
            TopicError::IllegalState(format!(
                "publisher channel {} is no longer active",
                self.channel
            ))
        };
        if self.state.get() != ChannelState::Active {
            return Err(inactive());
        }
        self.queue.add(binary).map_err(|_| inactive())
    }

    /// Resumes a channel paused by a full topic.
    pub(crate) fn on_channel_freed(&self) {
        if self.queue.resume() {
            self.statistics.record_resume();
            debug!(
                event = events::PUBLISHER_CHANNEL_RESUMED,
                component = COMPONENT,
                publisher_id = self.publisher_id.as_str(),
                channel = self.channel,
                "publisher channel resumed"
            );
            self.queue.trigger_operations();
        }
    }

    /// Resolves once everything queued before the call has completed.
    pub(crate) fn flush(&self, mode: FlushMode) -> impl Future<Output = ()> + Send + 'static {
        match mode {
            FlushMode::Flush => {}
            FlushMode::FlushDestroy => self.queue.handle_error(
                |_| TopicError::Fatal("the topic has been destroyed".to_string()),
                ErrorAction::CompleteWithException,
            ),
            FlushMode::FlushCloseExceptionally => self.queue.handle_error(
                |_| TopicError::IllegalState("the publisher has been closed".to_string()),
                ErrorAction::CompleteWithException,
            ),
        }
        self.queue.flush()
    }

    /// Stops accepting values; queued values are still offered.
    pub(crate) fn stop(&self) {
        self.state.compare_and_set(ChannelState::Active, ChannelState::Closing);
        self.queue.close();
    }

    /// Cancels everything outstanding and closes the queue.
    pub(crate) fn cancel(&self, reason: &str, cause: Option<&TopicError>) {
        self.queue.cancel_all_and_close(reason, cause);
    }

    pub(crate) async fn close(&self) {
        if self.state.transition(ChannelState::Closed).is_none() {
            return;
        }
        self.queue
            .cancel_all_and_close("the publisher channel has been closed", None);
        self.connector.close().await;
    }

    /// Retries the connector's `ensure_connected` with a fixed pause between
    /// attempts until it succeeds, reports a fatal error, or the reconnect timeout
    /// elapses. Returns the last error on failure.
    pub(crate) async fn ensure_connected(&self) -> Result<()> {
        let deadline = Instant::now() + self.dependencies.reconnect_timeout();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connector.ensure_connected().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_fatal() || Instant::now() >= deadline => {
                    warn!(
                        event = events::PUBLISHER_RECONNECT_FAILED,
                        component = COMPONENT,
                        publisher_id = self.publisher_id.as_str(),
                        channel = self.channel,
                        attempt,
                        err = %err,
                        "publisher channel could not reconnect"
                    );
                    return Err(err);
                }
                Err(err) => {
                    debug!(
                        event = events::PUBLISHER_RECONNECT_ATTEMPT,
                        component = COMPONENT,
                        publisher_id = self.publisher_id.as_str(),
                        channel = self.channel,
                        attempt,
                        err = %err,
                        "publisher channel reconnect attempt failed"
                    );
                    tokio::time::sleep(self.dependencies.reconnect_retry()).await;
                }
            }
        }
    }

    /// Offers batches until the queue is drained, paused or failed.
    async fn drain(self: Arc<Self>) {
        let max_batch = self.dependencies.max_batch_size_bytes.max(1);
        let mut fill_limit = max_batch;
        let mut cookie: Option<OfferCookie> = None;

        loop {
            if self.state.get() == ChannelState::Closed {
                return;
            }
            if self.queue.is_paused() {
                self.park();
                return;
            }

            let current = match cookie {
                Some(current) => current,
                None => match self.initialize().await {
                    Ok(current) => current,
                    Err(err) => {
                        self.fail(err);
                        return;
                    }
                },
            };
            cookie = Some(current);

            if self.queue.is_batch_complete() && !self.queue.fill_current_batch(fill_limit) {
                return;
            }
            let values = self.queue.current_batch_values();
            if values.is_empty() {
                continue;
            }

            let batch_len = values.len();
            let notify_post_full = self.dependencies.notify_post_full();
            self.statistics.record_offer();
            trace!(
                event = events::PUBLISHER_OFFER,
                component = COMPONENT,
                publisher_id = self.publisher_id.as_str(),
                channel = self.channel,
                values = batch_len,
                "offering batch"
            );

            match self.connector.offer(current, values, notify_post_full).await {
                Ok(result) => match result.status {
                    PublishStatus::Success => {
                        if let Some(err) = self.complete_offer(&result, batch_len, false) {
                            self.fail(err);
                            return;
                        }
                        if result.remaining_capacity == 0 {
                            cookie = None;
                            fill_limit = max_batch;
                        } else {
                            fill_limit = result.remaining_capacity.min(max_batch);
                        }
                    }
                    PublishStatus::Retry => {
                        if let Some(err) = self.complete_offer(&result, batch_len, false) {
                            self.fail(err);
                            return;
                        }
                        match self.retry_offer(result.retry_cookie.unwrap_or(current)).await {
                            Ok(next) => cookie = Some(next),
                            Err(err) => {
                                self.fail(err);
                                return;
                            }
                        }
                    }
                    PublishStatus::TopicFull => {
                        self.statistics.record_topic_full();
                        cookie = None;
                        fill_limit = max_batch;
                        debug!(
                            event = events::PUBLISHER_TOPIC_FULL,
                            component = COMPONENT,
                            publisher_id = self.publisher_id.as_str(),
                            channel = self.channel,
                            accepted = result.accepted,
                            notify_post_full,
                            "channel is full"
                        );
                        let capacity_errors = !notify_post_full;
                        if let Some(err) = self.complete_offer(&result, batch_len, capacity_errors) {
                            self.fail(err);
                            return;
                        }
                        if notify_post_full {
                            self.queue.pause();
                            self.park();
                            return;
                        }
                    }
                },
                Err(err) if err.is_connection() => {
                    match self.retry_offer(current).await {
                        Ok(next) => cookie = Some(next),
                        Err(err) => {
                            self.fail(err);
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        }
    }

    async fn initialize(&self) -> Result<OfferCookie> {
        if self.reconnect_first.swap(false, Ordering::AcqRel) || !self.connector.is_active() {
            self.ensure_connected().await?;
        }
        match self.connector.initialize().await {
            Err(err) if err.is_connection() => {
                self.ensure_connected().await?;
                self.connector.initialize().await
            }
            other => other,
        }
    }

    async fn retry_offer(&self, cookie: OfferCookie) -> Result<OfferCookie> {
        self.statistics.record_retry();
        debug!(
            event = events::PUBLISHER_OFFER_RETRY,
            component = COMPONENT,
            publisher_id = self.publisher_id.as_str(),
            channel = self.channel,
            "retrying offer"
        );
        self.ensure_connected().await?;
        self.connector.prepare_offer_retry(cookie).await
    }

    /// Reopens the trigger of a paused queue without losing a resume that raced
    /// the pause.
    fn park(&self) {
        self.queue.reset_trigger();
        if !self.queue.is_paused() {
            self.queue.trigger_operations();
        }
    }

    /// Completes the offered prefix of the current batch. With `capacity_errors`
    /// every value the backend did not accept fails with a capacity error.
    /// Returns the first error the backend reported for an individual value.
    fn complete_offer(
        &self,
        result: &PublishResult,
        batch_len: usize,
        capacity_errors: bool,
    ) -> Option<TopicError> {
        if !result.errors.is_empty() {
            // Closed before callers see the rejection so new values go to a replacement.
            self.queue.close();
        }
        let accepted = result.accepted.min(batch_len);
        let mut count = accepted;
        if let Some(last_error) = result.errors.keys().max() {
            count = count.max(last_error + 1);
        }
        if capacity_errors {
            count = batch_len;
        }
        let count = count.min(batch_len);
        if count == 0 {
            return None;
        }

        let channel = self.channel;
        let mut first_error: Option<TopicError> = None;
        let mut failed = 0;
        self.queue.complete_elements(count, |index, _| {
            let rejected = result.errors.get(&index).cloned();
            if first_error.is_none() {
                first_error = rejected.clone();
            }
            let error = rejected.or_else(|| {
                (capacity_errors && index >= accepted)
                    .then(|| TopicError::IllegalState(TOPIC_FULL_MESSAGE.to_string()))
            });
            match error {
                Some(err) => {
                    failed += 1;
                    Err(err.wrap(format!("failed to publish to channel {channel}")))
                }
                None => Ok(PublishReceipt {
                    channel,
                    position: result.positions.get(index).copied().unwrap_or_default(),
                }),
            }
        });
        self.statistics.record_completed(count - failed, failed);

        if failed > 0 {
            warn!(
                event = events::PUBLISHER_OFFER_FAILED,
                component = COMPONENT,
                publisher_id = self.publisher_id.as_str(),
                channel = self.channel,
                failed,
                rejected = first_error.is_some(),
                "values were rejected"
            );
        }
        first_error
    }

    /// Hard failure: the publisher decides what happens next, this channel closes.
    fn fail(&self, err: TopicError) {
        warn!(
            event = events::PUBLISHER_CHANNEL_FAILED,
            component = COMPONENT,
            publisher_id = self.publisher_id.as_str(),
            channel = self.channel,
            err = %err,
            "publisher channel failed"
        );
        (self.on_error)(self.channel, &err);
        self.queue
            .cancel_all_and_close("the publisher channel failed", Some(&err));
        self.state.transition(ChannelState::Closed);
    }
}

impl Debug for PublisherChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherChannel")
            .field("channel", &self.channel)
            .field("state", &self.state.get())
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelErrorHandler, PublisherChannel};
    use crate::batching::DebouncedFlowControl;
    use crate::config::TopicDependencies;
    use crate::connector::PublisherChannelConnector;
    use crate::error::{Result, TopicError};
    use crate::model::{ChannelId, OfferCookie, Position, PublishResult};
    use crate::publisher::options::FlushMode;
    use crate::publisher::statistics::PublisherStatistics;
    use crate::runtime::TaskDaemon;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Answers offers from a script; an exhausted script accepts everything.
    #[derive(Default)]
    struct ScriptedConnector {
        script: Mutex<VecDeque<Result<PublishResult>>>,
        offered: Mutex<Vec<Vec<Vec<u8>>>>,
        connect_failures: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl PublisherChannelConnector for ScriptedConnector {
        fn channel(&self) -> ChannelId {
            0
        }

        fn is_active(&self) -> bool {
            true
        }

        async fn ensure_connected(&self) -> Result<()> {
            if self.connect_failures.load(Ordering::SeqCst) > 0 {
                self.connect_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TopicError::Connection("still down".to_string()));
            }
            Ok(())
        }

        async fn initialize(&self) -> Result<OfferCookie> {
            Ok(OfferCookie(1))
        }

        async fn offer(
            &self,
            _cookie: OfferCookie,
            values: Vec<Vec<u8>>,
            _notify_post_full: bool,
        ) -> Result<PublishResult> {
            let count = values.len();
            self.offered.lock().push(values);
            let scripted = self.script.lock().pop_front();
            scripted.unwrap_or_else(|| {
                let positions = (0..count)
                    .map(|offset| Position::new(1, offset as i32))
                    .collect();
                Ok(PublishResult::success(positions, 1024))
            })
        }

        async fn prepare_offer_retry(&self, cookie: OfferCookie) -> Result<OfferCookie> {
            Ok(OfferCookie(cookie.0 + 1))
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        channel: Arc<PublisherChannel>,
        connector: Arc<ScriptedConnector>,
        failures: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(connector: ScriptedConnector, dependencies: TopicDependencies) -> Fixture {
        let connector = Arc::new(connector);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let on_error: ChannelErrorHandler = {
            let failures = failures.clone();
            Arc::new(move |_channel, err: &TopicError| failures.lock().push(err.to_string()))
        };
        let daemon =
            Arc::new(TaskDaemon::start("publisher-channel-test").expect("daemon should start"));
        let channel = PublisherChannel::new(
            0,
            "test".to_string(),
            connector.clone(),
            dependencies,
            daemon,
            Arc::new(DebouncedFlowControl::new(1 << 20, 1 << 21)),
            Arc::new(PublisherStatistics::default()),
            on_error,
        );
        Fixture {
            channel,
            connector,
            failures,
        }
    }

    fn fast_dependencies() -> TopicDependencies {
        TopicDependencies {
            reconnect_retry_millis: 1,
            reconnect_timeout_millis: 200,
            ..TopicDependencies::default()
        }
    }

    #[tokio::test]
    async fn published_values_complete_with_offered_positions() {
        let Fixture { channel, .. } = fixture(ScriptedConnector::default(), fast_dependencies());

        let receipt = channel
            .publish(b"one".to_vec())
            .expect("publish should queue")
            .await
            .expect("publish should succeed");

        assert_eq!(receipt.channel, 0);
        assert_eq!(receipt.position, Position::new(1, 0));
    }

    #[tokio::test]
    async fn retry_status_reoffers_the_remaining_values() {
        let connector = ScriptedConnector::default();
        connector
            .script
            .lock()
            .push_back(Ok(PublishResult::retry(OfferCookie(9))));
        connector.connect_failures.store(2, Ordering::SeqCst);
        let Fixture {
            channel, connector, ..
        } = fixture(connector, fast_dependencies());

        channel
            .publish(b"value".to_vec())
            .expect("publish should queue")
            .await
            .expect("retried publish should succeed");

        assert_eq!(connector.offered.lock().len(), 2);
    }

    #[tokio::test]
    async fn per_value_error_fails_the_value_and_closes_the_channel() {
        let connector = ScriptedConnector::default();
        let mut rejected = PublishResult::success(vec![Position::new(1, 0)], 1024);
        rejected
            .errors
            .insert(0, TopicError::IllegalArgument("too large".to_string()));
        connector.script.lock().push_back(Ok(rejected));
        let Fixture {
            channel, failures, ..
        } = fixture(connector, fast_dependencies());

        let err = channel
            .publish(b"huge".to_vec())
            .expect("publish should queue")
            .await
            .expect_err("rejected value should fail");

        assert!(matches!(
            err.root_cause(),
            TopicError::IllegalArgument(message) if message == "too large"
        ));
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.is_active() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("channel should close after a rejected value");
        assert_eq!(failures.lock().len(), 1);
        assert!(channel
            .publish(b"next".to_vec())
            .expect_err("closed channel should reject publishes")
            .is_illegal_state());
    }

    #[tokio::test]
    async fn replacement_channel_reconnects_before_its_first_offer() {
        let connector = ScriptedConnector::default();
        connector.connect_failures.store(1, Ordering::SeqCst);
        let Fixture {
            channel, connector, ..
        } = fixture(connector, fast_dependencies());
        channel.reconnect_before_offer();

        channel
            .publish(b"value".to_vec())
            .expect("publish should queue")
            .await
            .expect("publish should succeed after reconnecting");

        assert_eq!(connector.connect_failures.load(Ordering::SeqCst), 0);
        assert_eq!(connector.offered.lock().len(), 1);
    }

    #[tokio::test]
    async fn hard_offer_failure_closes_the_channel() {
        let connector = ScriptedConnector::default();
        connector
            .script
            .lock()
            .push_back(Err(TopicError::Fatal("topic destroyed".to_string())));
        let Fixture {
            channel, failures, ..
        } = fixture(connector, fast_dependencies());

        let err = channel
            .publish(b"doomed".to_vec())
            .expect("publish should queue")
            .await
            .expect_err("publish should fail");

        assert!(err.is_cancellation());
        assert!(err.to_string().contains("topic destroyed"));
        assert_eq!(failures.lock().len(), 1);
        assert!(!channel.is_active());
        assert!(channel
            .publish(b"late".to_vec())
            .expect_err("failed channel should reject publishes")
            .is_illegal_state());
    }

    #[tokio::test]
    async fn exhausted_reconnect_fails_the_channel() {
        let connector = ScriptedConnector::default();
        connector
            .script
            .lock()
            .push_back(Err(TopicError::Connection("link lost".to_string())));
        connector.connect_failures.store(usize::MAX, Ordering::SeqCst);
        let dependencies = TopicDependencies {
            reconnect_retry_millis: 5,
            reconnect_timeout_millis: 20,
            ..TopicDependencies::default()
        };
        let Fixture { channel, .. } = fixture(connector, dependencies);

        let err = channel
            .publish(b"value".to_vec())
            .expect("publish should queue")
            .await
            .expect_err("publish should fail once reconnecting gives up");

        assert!(err.to_string().contains("still down"));
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn flush_close_exceptionally_fails_values_stuck_behind_a_full_channel() {
        let connector = ScriptedConnector::default();
        connector
            .script
            .lock()
            .push_back(Ok(PublishResult::topic_full(Vec::new())));
        let dependencies = TopicDependencies {
            notify_post_full_timeout_millis: 1_000,
            ..fast_dependencies()
        };
        let Fixture {
            channel, connector, ..
        } = fixture(connector, dependencies);
        let stuck = channel.publish(b"value".to_vec()).expect("publish should queue");
        while !channel.is_paused() {
            tokio::task::yield_now().await;
        }

        channel.flush(FlushMode::FlushCloseExceptionally).await;
        channel.close().await;

        let err = stuck.await.expect_err("stuck value should fail");
        assert!(err.is_illegal_state());
        assert_eq!(channel.size(), 0);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }
}
