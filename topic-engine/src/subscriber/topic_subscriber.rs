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

//! Application-facing subscriber.

use crate::batching::{DebouncedFlowControl, OperationFuture};
use crate::connector::SubscriberConnector;
use crate::error::{Result, TopicError};
use crate::model::{ChannelId, CommitResult, Position, SubscriberGroupId, SubscriberId};
use crate::observability::events;
use crate::observability::fields::format_channels;
use crate::serializer::ValueSerializer;
use crate::subscriber::channel::ChannelStatistics;
use crate::subscriber::engine::{BinaryFilter, SubscriberCore};
use crate::subscriber::element::Element;
use crate::subscriber::options::SubscriberOptions;
use crate::subscriber::request::{PositionKind, Request, Response, SeekTarget};
use crate::subscriber::state::{StateListener, SubscriberState};
use crate::subscriber::statistics::SubscriberStatistics;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::SystemTime;
use tracing::debug;

const COMPONENT: &str = "subscriber";

type Decoder<T> = Box<dyn FnOnce(Response) -> Result<T> + Send>;

/// Pending receive. Dropping it before it resolves cancels the request.
#[must_use = "dropping the future cancels the receive"]
pub struct Receive<T> {
    inner: OperationFuture<Response>,
    decode: Option<Decoder<T>>,
    core: Weak<SubscriberCore>,
}

impl<T> Receive<T> {
    fn new(
        inner: OperationFuture<Response>,
        core: &Arc<SubscriberCore>,
        decode: Decoder<T>,
    ) -> Self {
        Self {
            inner,
            decode: Some(decode),
            core: Arc::downgrade(core),
        }
    }
}

impl<T> Future for Receive<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let response = match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(response) => response,
            Poll::Pending => return Poll::Pending,
        };
        let Some(decode) = this.decode.take() else {
            return Poll::Ready(Err(TopicError::IllegalState(
                "receive polled after completion".to_string(),
            )));
        };
        Poll::Ready(response.and_then(decode))
    }
}

impl<T> Drop for Receive<T> {
    fn drop(&mut self) {
        if self.decode.is_none() {
            return;
        }
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if core.is_active() {
            core.statistics().record_cancelled();
            debug!(
                event = events::SUBSCRIBER_RECEIVE_CANCELLED,
                component = COMPONENT,
                subscriber_id = %core.id(),
                "receive cancelled by caller"
            );
        }
    }
}

impl<T> Debug for Receive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receive")
            .field("completed", &self.decode.is_none())
            .finish_non_exhaustive()
    }
}

/// Reads values of type `V` from the channels a topic allocates to it.
///
/// Anonymous subscribers own every channel. Subscribers in a durable group share
/// the channels with the rest of the group, and each channel is read by one
/// member at a time. Delivery is at least once: elements that were received but
/// not committed are delivered again after a reconnect or reallocation.
pub struct Subscriber<V> {
    core: Arc<SubscriberCore>,
    serializer: Arc<dyn ValueSerializer<V>>,
}

impl<V: Send + 'static> Subscriber<V> {
    /// Creates the subscriber and connects it, retrying transient failures up to
    /// the topic's reconnect timeout.
    pub async fn new(
        connector: Arc<dyn SubscriberConnector>,
        serializer: Arc<dyn ValueSerializer<V>>,
        options: SubscriberOptions<V>,
    ) -> Result<Self> {
        let group = options
            .group
            .map(SubscriberGroupId::durable)
            .unwrap_or_else(SubscriberGroupId::anonymous);
        let filter = options.filter.map(|filter| {
            let serializer = serializer.clone();
            let filter: BinaryFilter = Arc::new(move |binary: &[u8]| {
                serializer
                    .deserialize(binary)
                    .map_or(true, |value| filter(&value))
            });
            filter
        });
        let core = SubscriberCore::new(
            connector,
            group,
            filter,
            options.complete_on_empty,
            options.subscribe_to,
            options.ownership_listeners,
        )?;
        if let Err(err) = core.ensure_connected().await {
            core.close_internal(false).await;
            return Err(err);
        }
        Ok(Self { core, serializer })
    }

    /// Requests the next element. Resolves to `None` only when the subscriber
    /// completes on empty and every owned channel is empty.
    pub fn receive(&self) -> Result<Receive<Option<Element<V>>>> {
        let inner = self.core.receive(None)?;
        let serializer = self.serializer.clone();
        let core = Arc::downgrade(&self.core);
        Ok(Receive::new(
            inner,
            &self.core,
            Box::new(move |response| match response {
                Response::Element(Some(received)) => {
                    Element::decode(received, serializer.as_ref(), core).map(Some)
                }
                Response::Element(None) => Ok(None),
                _ => Err(unexpected_response()),
            }),
        ))
    }

    /// Requests up to `max_elements` elements in one go.
    pub fn receive_batch(&self, max_elements: usize) -> Result<Receive<Vec<Element<V>>>> {
        if max_elements == 0 {
            return Err(TopicError::IllegalArgument(
                "a batch receive needs room for at least one element".to_string(),
            ));
        }
        let inner = self.core.receive(Some(max_elements))?;
        let serializer = self.serializer.clone();
        let core = Arc::downgrade(&self.core);
        Ok(Receive::new(
            inner,
            &self.core,
            Box::new(move |response| match response {
                Response::Batch(received) => received
                    .into_iter()
                    .map(|element| Element::decode(element, serializer.as_ref(), core.clone()))
                    .collect(),
                _ => Err(unexpected_response()),
            }),
        ))
    }
}

impl<V> Subscriber<V> {
    pub async fn commit(&self, channel: ChannelId, position: Position) -> Result<CommitResult> {
        self.core.commit(channel, position).await
    }

    /// Commits every entry of `positions`, one result per channel.
    pub async fn commit_all(
        &self,
        positions: BTreeMap<ChannelId, Position>,
    ) -> Result<BTreeMap<ChannelId, CommitResult>> {
        self.core.ensure_active()?;
        let commits = positions
            .into_iter()
            .map(|(channel, position)| async move {
                self.core
                    .commit(channel, position)
                    .await
                    .map(|result| (channel, result))
            });
        join_all(commits).await.into_iter().collect()
    }

    /// Moves `channel` so the next element read follows `position`. Returns the
    /// position actually seeked to.
    pub async fn seek(&self, channel: ChannelId, position: Position) -> Result<Option<Position>> {
        let seeked = self
            .seek_positions(BTreeMap::from([(channel, position)]))
            .await?;
        Ok(seeked.get(&channel).copied())
    }

    pub async fn seek_positions(
        &self,
        positions: BTreeMap<ChannelId, Position>,
    ) -> Result<BTreeMap<ChannelId, Position>> {
        self.core
            .request_positions(Request::Seek(SeekTarget::Positions(positions)))
            .await
    }

    /// Moves `channel` to the first element published at or after `timestamp`.
    pub async fn seek_timestamp(
        &self,
        channel: ChannelId,
        timestamp: SystemTime,
    ) -> Result<Option<Position>> {
        let seeked = self
            .seek_timestamps(BTreeMap::from([(channel, timestamp)]))
            .await?;
        Ok(seeked.get(&channel).copied())
    }

    pub async fn seek_timestamps(
        &self,
        timestamps: BTreeMap<ChannelId, SystemTime>,
    ) -> Result<BTreeMap<ChannelId, Position>> {
        self.core
            .request_positions(Request::Seek(SeekTarget::Timestamps(timestamps)))
            .await
    }

    pub async fn seek_to_head(
        &self,
        channels: impl IntoIterator<Item = ChannelId>,
    ) -> Result<BTreeMap<ChannelId, Position>> {
        let channels = channels.into_iter().collect();
        self.core
            .request_positions(Request::Seek(SeekTarget::Head(channels)))
            .await
    }

    pub async fn seek_to_tail(
        &self,
        channels: impl IntoIterator<Item = ChannelId>,
    ) -> Result<BTreeMap<ChannelId, Position>> {
        let channels = channels.into_iter().collect();
        self.core
            .request_positions(Request::Seek(SeekTarget::Tail(channels)))
            .await
    }

    /// Position the next receive reads from, per owned channel.
    pub async fn heads(&self) -> Result<BTreeMap<ChannelId, Position>> {
        self.core
            .request_positions(Request::Positions(PositionKind::Head))
            .await
    }

    /// Last position published, per owned channel.
    pub async fn tails(&self) -> Result<BTreeMap<ChannelId, Position>> {
        self.core
            .request_positions(Request::Positions(PositionKind::Tail))
            .await
    }

    pub async fn last_committed(&self) -> Result<BTreeMap<ChannelId, Position>> {
        self.core
            .request_positions(Request::Positions(PositionKind::Committed))
            .await
    }

    /// Channels currently owned.
    pub fn channels(&self) -> BTreeSet<ChannelId> {
        self.core.channels()
    }

    pub fn is_owner(&self, channel: ChannelId) -> bool {
        self.core.is_owner(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.core.channel_count()
    }

    pub fn channel_statistics(&self) -> Vec<ChannelStatistics> {
        self.core.channel_statistics()
    }

    /// Connects now instead of on the next receive.
    pub async fn connect(&self) -> Result<()> {
        self.core.ensure_connected().await
    }

    /// Drops the connection. Pending receives reconnect after the reconnect wait.
    pub fn disconnect(&self) {
        self.core.disconnect_internal(false);
    }

    /// Cancels outstanding requests, closes the subscription and releases the
    /// connector. Calling it again is a no-op.
    pub async fn close(&self) {
        self.core.close_internal(false).await;
    }

    /// Runs `action` once the subscriber has closed, or immediately if it already
    /// has.
    pub fn on_close(&self, action: impl FnOnce() + Send + 'static) {
        self.core.on_close(Box::new(action));
    }

    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.core.add_state_listener(listener);
    }

    pub fn remove_state_listener(&self, listener: &Arc<dyn StateListener>) {
        self.core.remove_state_listener(listener);
    }

    pub fn id(&self) -> SubscriberId {
        self.core.id()
    }

    pub fn group(&self) -> &SubscriberGroupId {
        self.core.group()
    }

    pub fn topic_name(&self) -> &str {
        self.core.topic_name()
    }

    pub fn state(&self) -> SubscriberState {
        self.core.state()
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Backlog of outstanding receive requests.
    pub fn flow_control(&self) -> &Arc<DebouncedFlowControl> {
        self.core.flow_control()
    }

    pub fn statistics(&self) -> &SubscriberStatistics {
        self.core.statistics()
    }
}

fn unexpected_response() -> TopicError {
    TopicError::IllegalState("unexpected response to a receive request".to_string())
}

impl<V> Display for Subscriber<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Subscriber(topic={}, id={}, group={}, state={:?}, channels={}, backlog={}, {})",
            self.topic_name(),
            self.id(),
            self.group(),
            self.state(),
            format_channels(&self.channels()),
            self.flow_control().backlog(),
            self.statistics()
        )
    }
}

impl<V> Debug for Subscriber<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id())
            .field("group", self.group())
            .field("state", &self.state())
            .field("channels", &self.channels())
            .finish()
    }
}
