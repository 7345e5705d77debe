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

//! Subscriber-side connector trait.

use crate::config::TopicDependencies;
use crate::error::Result;
use crate::model::{
    ChannelId, CommitResult, Position, ReceiveResult, SeekResult, SubscriberGroupId, SubscriberId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

/// Events a subscriber connector raises about the subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberEvent {
    GroupDestroyed,
    /// The group coordinator assigned this set of channels to the subscriber.
    ChannelAllocation(BTreeSet<ChannelId>),
    /// The subscriber lost its channels, typically after timing out.
    ChannelsLost,
    /// New elements arrived in the listed channels.
    ChannelPopulated(BTreeSet<ChannelId>),
    Unsubscribed,
    Destroyed,
    Released,
    Disconnected,
}

pub trait SubscriberListener: Send + Sync {
    fn on_event(&self, event: SubscriberEvent);
}

/// Parameters of one subscription (re)initialisation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitializeRequest {
    pub subscriber_id: SubscriberId,
    pub group: SubscriberGroupId,
    pub force_reconnect: bool,
    pub is_reconnect: bool,
    pub was_disconnected: bool,
}

#[async_trait]
pub trait SubscriberConnector: Send + Sync {
    fn topic_name(&self) -> &str;

    fn subscriber_id(&self) -> SubscriberId;

    fn channel_count(&self) -> usize;

    fn dependencies(&self) -> TopicDependencies;

    fn is_active(&self) -> bool;

    /// True while the backend service is suspended; reconnects are skipped.
    fn is_suspended(&self) -> bool {
        false
    }

    /// Changes every time the connector establishes a new connection.
    fn connection_timestamp(&self) -> u64;

    async fn ensure_connected(&self) -> Result<()>;

    /// Registers the subscription and returns the head position of every channel.
    async fn initialize(&self, request: InitializeRequest) -> Result<Vec<Position>>;

    /// Channels currently allocated to this subscriber by its group.
    async fn owned_channels(&self) -> Result<BTreeSet<ChannelId>>;

    async fn receive(
        &self,
        channel: ChannelId,
        head: Position,
        max_elements: usize,
    ) -> Result<ReceiveResult>;

    async fn commit(&self, channel: ChannelId, position: Position) -> Result<CommitResult>;

    async fn seek_to_position(
        &self,
        positions: BTreeMap<ChannelId, Position>,
    ) -> Result<BTreeMap<ChannelId, SeekResult>>;

    async fn seek_to_timestamp(
        &self,
        timestamps: BTreeMap<ChannelId, SystemTime>,
    ) -> Result<BTreeMap<ChannelId, SeekResult>>;

    async fn topic_heads(
        &self,
        channels: &BTreeSet<ChannelId>,
    ) -> Result<BTreeMap<ChannelId, Position>>;

    async fn topic_tails(&self) -> Result<BTreeMap<ChannelId, Position>>;

    async fn last_committed(&self) -> Result<BTreeMap<ChannelId, Position>>;

    async fn heartbeat(&self);

    async fn close_subscription(&self, destroyed: bool) -> Result<()>;

    fn add_listener(&self, listener: Arc<dyn SubscriberListener>);

    fn remove_listener(&self, listener: &Arc<dyn SubscriberListener>);

    async fn close(&self);
}
