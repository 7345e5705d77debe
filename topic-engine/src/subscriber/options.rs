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

//! Subscriber construction options.

use crate::model::ChannelId;
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Observer of channel ownership changes.
pub trait ChannelOwnershipListener: Send + Sync {
    fn on_channels_assigned(&self, _channels: &BTreeSet<ChannelId>) {}

    fn on_channels_revoked(&self, _channels: &BTreeSet<ChannelId>) {}

    /// Channels taken away because the subscriber lost its membership rather
    /// than through a rebalance.
    fn on_channels_lost(&self, channels: &BTreeSet<ChannelId>) {
        self.on_channels_revoked(channels);
    }
}

pub type Filter<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

pub struct SubscriberOptions<V> {
    /// Durable group to join; `None` subscribes anonymously.
    pub group: Option<String>,
    /// Elements for which the filter returns false are skipped.
    pub filter: Option<Filter<V>>,
    /// Resolve receives with nothing instead of waiting when every owned
    /// channel is empty.
    pub complete_on_empty: bool,
    /// Restricts the subscriber to these channels. Empty means no restriction.
    pub subscribe_to: BTreeSet<ChannelId>,
    pub ownership_listeners: Vec<Arc<dyn ChannelOwnershipListener>>,
}

impl<V> SubscriberOptions<V> {
    pub fn new() -> Self {
        Self {
            group: None,
            filter: None,
            complete_on_empty: false,
            subscribe_to: BTreeSet::new(),
            ownership_listeners: Vec::new(),
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn complete_on_empty(mut self) -> Self {
        self.complete_on_empty = true;
        self
    }

    pub fn subscribe_to(mut self, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        self.subscribe_to.extend(channels);
        self
    }

    pub fn with_ownership_listener(mut self, listener: Arc<dyn ChannelOwnershipListener>) -> Self {
        self.ownership_listeners.push(listener);
        self
    }
}

impl<V> Default for SubscriberOptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Debug for SubscriberOptions<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberOptions")
            .field("group", &self.group)
            .field("filtered", &self.filter.is_some())
            .field("complete_on_empty", &self.complete_on_empty)
            .field("subscribe_to", &self.subscribe_to)
            .field("ownership_listeners", &self.ownership_listeners.len())
            .finish()
    }
}
