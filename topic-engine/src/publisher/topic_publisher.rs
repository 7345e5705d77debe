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

//! Application-facing publisher fanning values out to per-channel engines.

use crate::batching::{DebouncedFlowControl, OperationFuture};
use crate::config::TopicDependencies;
use crate::connector::{PublisherConnector, PublisherEvent, PublisherListener};
use crate::error::{Result, TopicError};
use crate::lifecycle::{LifecycleState, StateCell};
use crate::model::{ChannelId, PublishReceipt};
use crate::observability::events;
use crate::observability::fields::format_channels;
use crate::publisher::channel::{ChannelErrorHandler, PublisherChannel};
use crate::publisher::options::{FlushMode, OnFailure, OrderBy, PublisherOptions};
use crate::publisher::statistics::PublisherStatistics;
use crate::runtime::{scheduler, TaskDaemon};
use crate::serializer::ValueSerializer;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn, Level};
use uuid::Uuid;

const COMPONENT: &str = "publisher";

/// Extra channel lookups `publish` makes when a channel turns out to be closing.
const PUBLISH_RETRIES: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublisherState {
    Active,
    Disconnected,
    /// A channel failed under [`OnFailure::Stop`]; the publisher is closing.
    OnError,
    Closing,
    Closed,
}

impl LifecycleState for PublisherState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PublisherState::Active,
            1 => PublisherState::Disconnected,
            2 => PublisherState::OnError,
            3 => PublisherState::Closing,
            _ => PublisherState::Closed,
        }
    }

    fn can_transition(self, next: Self) -> bool {
        use PublisherState::*;
        matches!(
            (self, next),
            (Active, Disconnected)
                | (Disconnected, Active)
                | (Active | Disconnected, OnError)
                | (Active | Disconnected | OnError, Closing)
                | (Closing, Closed)
        )
    }
}

type CloseAction = Box<dyn FnOnce() + Send>;

struct PublisherCore {
    id: String,
    connector: Arc<dyn PublisherConnector>,
    dependencies: TopicDependencies,
    channel_count: usize,
    channels: RwLock<Vec<Arc<PublisherChannel>>>,
    state: StateCell<PublisherState>,
    on_failure: OnFailure,
    flow_control: Arc<DebouncedFlowControl>,
    daemon: Arc<TaskDaemon>,
    statistics: Arc<PublisherStatistics>,
    offered: Mutex<BTreeSet<ChannelId>>,
    listener: Mutex<Option<Arc<dyn PublisherListener>>>,
    on_close: Mutex<Vec<CloseAction>>,
    round_robin: AtomicUsize,
}

impl PublisherCore {
    fn new_channel(self: &Arc<Self>, channel: ChannelId) -> Arc<PublisherChannel> {
        let on_error: ChannelErrorHandler = {
            let core = Arc::downgrade(self);
            Arc::new(move |channel, err: &TopicError| {
                if let Some(core) = core.upgrade() {
                    core.on_channel_error(channel, err);
                }
            })
        };
        PublisherChannel::new(
            channel,
            self.id.clone(),
            self.connector.create_channel_connector(channel),
            self.dependencies.clone(),
            self.daemon.clone(),
            self.flow_control.clone(),
            self.statistics.clone(),
            on_error,
        )
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state.get() {
            PublisherState::Active | PublisherState::Disconnected => Ok(()),
            PublisherState::OnError => Err(TopicError::IllegalState(
                "the publisher is no longer active".to_string(),
            )),
            PublisherState::Closing | PublisherState::Closed => Err(TopicError::IllegalState(
                "the publisher has been closed".to_string(),
            )),
        }
    }

    fn publish(
        self: &Arc<Self>,
        channel: ChannelId,
        binary: Vec<u8>,
    ) -> Result<OperationFuture<PublishReceipt>> {
        let mut attempt = 0;
        loop {
            let publisher_channel = self.ensure_channel(channel)?;
            match publisher_channel.publish(binary.clone()) {
                Ok(future) => {
                    self.statistics.record_published();
                    self.offered.lock().insert(channel);
                    return Ok(future);
                }
                Err(err) if err.is_illegal_state() && attempt < PUBLISH_RETRIES => attempt += 1,
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the active engine for `channel`, replacing a failed one unless the
    /// failure policy is to stop.
    fn ensure_channel(self: &Arc<Self>, channel: ChannelId) -> Result<Arc<PublisherChannel>> {
        {
            let channels = self.channels.read();
            let current = channels.get(channel).ok_or_else(|| {
                TopicError::IllegalArgument(format!(
                    "channel {channel} is out of range for {} channels",
                    channels.len()
                ))
            })?;
            if current.is_active() {
                return Ok(current.clone());
            }
        }

        self.ensure_active()?;
        if self.on_failure == OnFailure::Stop {
            if self.state.transition(PublisherState::OnError).is_some() {
                self.close_async(false);
            }
            return Err(TopicError::IllegalState(
                "the publisher is no longer active".to_string(),
            ));
        }

        let mut channels = self.channels.write();
        if channels[channel].is_active() {
            return Ok(channels[channel].clone());
        }
        let replacement = self.new_channel(channel);
        replacement.reconnect_before_offer();
        debug!(
            event = events::PUBLISHER_CHANNEL_REPLACE,
            component = COMPONENT,
            publisher_id = self.id.as_str(),
            channel,
            "replacing inactive publisher channel"
        );
        channels[channel] = replacement.clone();
        Ok(replacement)
    }

    fn on_channel_error(self: &Arc<Self>, channel: ChannelId, err: &TopicError) {
        match self.on_failure {
            OnFailure::Stop => {
                if self.state.transition(PublisherState::OnError).is_none() {
                    return;
                }
                warn!(
                    event = events::PUBLISHER_CHANNEL_FAILED,
                    component = COMPONENT,
                    publisher_id = self.id.as_str(),
                    channel,
                    err = %err,
                    "closing publisher after channel failure"
                );
                let channels = self.channels.read().clone();
                for publisher_channel in channels {
                    publisher_channel.cancel("the publisher failed", Some(err));
                }
                self.close_async(false);
            }
            OnFailure::Continue => {
                warn!(
                    event = events::PUBLISHER_CHANNEL_FAILED,
                    component = COMPONENT,
                    publisher_id = self.id.as_str(),
                    channel,
                    err = %err,
                    "publisher channel failed; continuing"
                );
            }
        }
    }

    fn on_channels_freed(&self, freed: &BTreeSet<ChannelId>) {
        let channels = self.channels.read();
        for channel in freed {
            if let Some(publisher_channel) = channels.get(*channel) {
                publisher_channel.on_channel_freed();
            }
        }
    }

    fn flush(&self, mode: FlushMode) -> impl Future<Output = ()> + Send + 'static {
        let flushes: Vec<_> = self
            .channels
            .read()
            .iter()
            .map(|channel| channel.flush(mode))
            .collect();
        async move {
            join_all(flushes).await;
        }
    }

    fn close_async(self: &Arc<Self>, destroyed: bool) {
        let core = self.clone();
        scheduler::spawn(async move { core.close_internal(destroyed).await });
    }

    async fn close_internal(&self, destroyed: bool) {
        let Some(previous) = self.state.transition(PublisherState::Closing) else {
            return;
        };
        info!(
            event = events::PUBLISHER_CLOSE_START,
            component = COMPONENT,
            publisher_id = self.id.as_str(),
            topic = self.connector.topic_name(),
            prev_state = ?previous,
            destroyed,
            "closing publisher"
        );

        if let Some(listener) = self.listener.lock().take() {
            self.connector.remove_listener(&listener);
        }

        let channels = self.channels.read().clone();
        for channel in &channels {
            channel.stop();
        }

        let mode = if destroyed {
            FlushMode::FlushDestroy
        } else {
            FlushMode::Flush
        };
        let close_timeout = self.dependencies.close_timeout();
        if tokio::time::timeout(close_timeout, self.flush(mode))
            .await
            .is_err()
        {
            warn!(
                event = events::PUBLISHER_CLOSE_FLUSH_TIMEOUT,
                component = COMPONENT,
                publisher_id = self.id.as_str(),
                timeout_ms = close_timeout.as_millis() as u64,
                "flush timed out; failing outstanding publishes"
            );
            self.flush(FlushMode::FlushCloseExceptionally).await;
        }

        for channel in &channels {
            channel.close().await;
        }
        self.connector.close().await;
        self.state.transition(PublisherState::Closed);
        self.daemon.stop();

        let actions = std::mem::take(&mut *self.on_close.lock());
        for action in actions {
            self.run_close_action(action);
        }

        info!(
            event = events::PUBLISHER_CLOSE_OK,
            component = COMPONENT,
            publisher_id = self.id.as_str(),
            "publisher closed"
        );
    }

    fn run_close_action(&self, action: CloseAction) {
        if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
            warn!(
                event = events::PUBLISHER_ON_CLOSE_FAILED,
                component = COMPONENT,
                publisher_id = self.id.as_str(),
                "on-close action failed"
            );
        }
    }
}

/// Routes connector events back into the publisher.
struct PublisherEvents {
    core: Weak<PublisherCore>,
}

impl PublisherListener for PublisherEvents {
    fn on_event(&self, event: PublisherEvent) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if tracing::enabled!(Level::DEBUG) {
            debug!(
                event = events::PUBLISHER_EVENT,
                component = COMPONENT,
                publisher_id = core.id.as_str(),
                publisher_event = ?event,
                "publisher connector event"
            );
        }
        match event {
            PublisherEvent::Connected => {
                core.state
                    .compare_and_set(PublisherState::Disconnected, PublisherState::Active);
            }
            PublisherEvent::Disconnected => {
                core.state
                    .compare_and_set(PublisherState::Active, PublisherState::Disconnected);
            }
            PublisherEvent::Released => core.close_async(false),
            PublisherEvent::Destroyed => core.close_async(true),
            PublisherEvent::ChannelsFreed(channels) => core.on_channels_freed(&channels),
        }
    }
}

/// Publishes values of type `V` to a topic.
///
/// Each value is serialized, mapped to a channel by the [`OrderBy`] option and
/// queued on that channel's engine. `publish` returns as soon as the value is
/// queued; the returned future resolves once the backend accepted or rejected
/// it. Values with the same order key are stored in publish order.
pub struct Publisher<V> {
    core: Arc<PublisherCore>,
    serializer: Arc<dyn ValueSerializer<V>>,
    order_by: OrderBy<V>,
}

impl<V> Publisher<V> {
    /// Creates a publisher and registers it with `connector`.
    pub fn new(
        connector: Arc<dyn PublisherConnector>,
        serializer: Arc<dyn ValueSerializer<V>>,
        options: PublisherOptions<V>,
    ) -> Result<Self> {
        let dependencies = connector.dependencies();
        let channel_count = options
            .channel_count
            .unwrap_or_else(|| connector.channel_count())
            .max(1);
        let id = Uuid::new_v4().to_string();
        let daemon = Arc::new(TaskDaemon::start(format!("publisher-{id}"))?);
        let max_batch = dependencies.max_batch_size_bytes.max(1) as u64;

        let core = Arc::new(PublisherCore {
            id,
            connector: connector.clone(),
            dependencies,
            channel_count,
            channels: RwLock::new(Vec::with_capacity(channel_count)),
            state: StateCell::new(PublisherState::Active),
            on_failure: options.on_failure,
            flow_control: Arc::new(DebouncedFlowControl::new(max_batch * 2, max_batch * 3)),
            daemon,
            statistics: Arc::new(PublisherStatistics::default()),
            offered: Mutex::new(BTreeSet::new()),
            listener: Mutex::new(None),
            on_close: Mutex::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
        });

        let channels: Vec<_> = (0..channel_count)
            .map(|channel| core.new_channel(channel))
            .collect();
        *core.channels.write() = channels;

        let listener: Arc<dyn PublisherListener> = Arc::new(PublisherEvents {
            core: Arc::downgrade(&core),
        });
        connector.add_listener(listener.clone());
        *core.listener.lock() = Some(listener);

        debug!(
            event = events::PUBLISHER_CHANNEL_CREATE,
            component = COMPONENT,
            publisher_id = core.id.as_str(),
            topic = connector.topic_name(),
            channels = channel_count,
            order_by = ?options.order_by,
            on_failure = ?options.on_failure,
            "publisher created"
        );

        Ok(Self {
            core,
            serializer,
            order_by: options.order_by,
        })
    }

    /// Queues `value` on its channel.
    ///
    /// Fails immediately when the publisher is not active or the value does not
    /// serialize; otherwise the returned future carries the outcome.
    pub fn publish(&self, value: V) -> Result<OperationFuture<PublishReceipt>> {
        self.core.ensure_active()?;
        let binary = self.serializer.serialize(&value)?;
        let channel = self.order_by.channel_of(
            &value,
            self.core.channel_count,
            &self.core.round_robin,
        );
        self.core.publish(channel, binary)
    }

    /// Resolves once every value published before the call has completed.
    pub fn flush(&self) -> impl Future<Output = ()> + Send + 'static {
        self.core.flush(FlushMode::Flush)
    }

    /// Flushes within the close timeout, fails whatever is left, and releases the
    /// connector. Calling it again is a no-op.
    pub async fn close(&self) {
        self.core.close_internal(false).await;
    }

    /// Runs `action` once the publisher has closed, or immediately if it already
    /// has.
    pub fn on_close(&self, action: impl FnOnce() + Send + 'static) {
        let action: CloseAction = Box::new(action);
        {
            let mut actions = self.core.on_close.lock();
            if self.core.state.get() != PublisherState::Closed {
                actions.push(action);
                return;
            }
        }
        self.core.run_close_action(action);
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn topic_name(&self) -> &str {
        self.core.connector.topic_name()
    }

    pub fn state(&self) -> PublisherState {
        self.core.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.core.ensure_active().is_ok()
    }

    pub fn channel_count(&self) -> usize {
        self.core.channel_count
    }

    /// Backlog of serialized bytes not yet accepted, across all channels.
    pub fn flow_control(&self) -> &Arc<DebouncedFlowControl> {
        &self.core.flow_control
    }

    pub fn statistics(&self) -> &PublisherStatistics {
        &self.core.statistics
    }

    /// Channels that have been published to.
    pub fn offered_channels(&self) -> BTreeSet<ChannelId> {
        self.core.offered.lock().clone()
    }

    /// Channels currently paused waiting for capacity.
    pub fn paused_channels(&self) -> HashSet<ChannelId> {
        self.core
            .channels
            .read()
            .iter()
            .filter(|channel| channel.is_paused())
            .map(|channel| channel.channel())
            .collect()
    }
}

impl<V> Display for Publisher<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let offered = self.offered_channels();
        write!(
            f,
            "Publisher(topic={}, id={}, state={:?}, channels={}, batch_size={}, offered={}, backlog={}, {})",
            self.topic_name(),
            self.core.id,
            self.state(),
            self.core.channel_count,
            self.core.dependencies.max_batch_size_bytes,
            format_channels(&offered),
            self.core.flow_control.backlog(),
            self.core.statistics
        )
    }
}

impl<V> Debug for Publisher<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .field("channels", &*self.core.channels.read())
            .finish()
    }
}
