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

//! Publisher-side connector traits.

use crate::config::TopicDependencies;
use crate::error::Result;
use crate::model::{ChannelId, OfferCookie, PublishResult};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Lifecycle and capacity events raised by a publisher connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublisherEvent {
    Connected,
    Disconnected,
    /// The local topic reference was released; the publisher must close.
    Released,
    /// The topic was destroyed; the publisher must close without flushing normally.
    Destroyed,
    /// Capacity became available again on the listed channels.
    ChannelsFreed(BTreeSet<ChannelId>),
}

pub trait PublisherListener: Send + Sync {
    fn on_event(&self, event: PublisherEvent);
}

/// Topic-level publisher connection.
#[async_trait]
pub trait PublisherConnector: Send + Sync {
    fn topic_name(&self) -> &str;

    fn channel_count(&self) -> usize;

    fn dependencies(&self) -> TopicDependencies;

    fn is_active(&self) -> bool;

    async fn ensure_connected(&self) -> Result<()>;

    fn create_channel_connector(&self, channel: ChannelId) -> Arc<dyn PublisherChannelConnector>;

    fn add_listener(&self, listener: Arc<dyn PublisherListener>);

    fn remove_listener(&self, listener: &Arc<dyn PublisherListener>);

    async fn close(&self);
}

/// Connection to one channel of a topic.
#[async_trait]
pub trait PublisherChannelConnector: Send + Sync {
    fn channel(&self) -> ChannelId;

    fn is_active(&self) -> bool;

    async fn ensure_connected(&self) -> Result<()>;

    /// Obtains a write handle for the next offer.
    async fn initialize(&self) -> Result<OfferCookie>;

    /// Appends `values` to the channel. With `notify_post_full` a full channel raises
    /// [`PublisherEvent::ChannelsFreed`] once capacity returns.
    async fn offer(
        &self,
        cookie: OfferCookie,
        values: Vec<Vec<u8>>,
        notify_post_full: bool,
    ) -> Result<PublishResult>;

    /// Prepares a retry of an offer that reported `Retry`, returning the cookie to use.
    async fn prepare_offer_retry(&self, cookie: OfferCookie) -> Result<OfferCookie>;

    async fn close(&self);
}
