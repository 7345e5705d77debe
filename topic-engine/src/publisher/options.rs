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

//! Publisher options and channel selection.

use crate::model::ChannelId;
use std::collections::hash_map::DefaultHasher;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a publisher does when one of its channels fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnFailure {
    /// Close the whole publisher.
    #[default]
    Stop,
    /// Log the failure; the channel is recreated on the next publish.
    Continue,
}

/// How outstanding publishes are treated by a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Wait for everything to be offered.
    Flush,
    /// Fail outstanding publishes because the topic was destroyed, then wait.
    FlushDestroy,
    /// Fail outstanding publishes because the publisher is closing, then wait.
    FlushCloseExceptionally,
}

/// Maps a value to its order key; values with equal keys share a channel.
pub enum OrderBy<V> {
    /// Key is the publishing thread.
    Thread,
    /// Fixed key for every value.
    Id(i32),
    /// Key derived from the value.
    Value(Arc<dyn Fn(&V) -> i32 + Send + Sync>),
    /// No ordering; channels are used in turn.
    RoundRobin,
}

impl<V> OrderBy<V> {
    pub fn value(order: impl Fn(&V) -> i32 + Send + Sync + 'static) -> Self {
        OrderBy::Value(Arc::new(order))
    }

    /// Channel for `value` among `channel_count` channels.
    pub fn channel_of(
        &self,
        value: &V,
        channel_count: usize,
        round_robin: &AtomicUsize,
    ) -> ChannelId {
        let channel_count = channel_count.max(1);
        match self {
            OrderBy::Thread => {
                let mut hasher = DefaultHasher::new();
                std::thread::current().id().hash(&mut hasher);
                (hasher.finish() % channel_count as u64) as ChannelId
            }
            OrderBy::Id(id) => channel_for_key(*id, channel_count),
            OrderBy::Value(order) => channel_for_key(order(value), channel_count),
            OrderBy::RoundRobin => round_robin.fetch_add(1, Ordering::Relaxed) % channel_count,
        }
    }
}

/// Non-negative remainder of `key`; `-1` over five channels is channel 4.
fn channel_for_key(key: i32, channel_count: usize) -> ChannelId {
    i64::from(key).rem_euclid(channel_count as i64) as ChannelId
}

impl<V> Default for OrderBy<V> {
    fn default() -> Self {
        OrderBy::Thread
    }
}

impl<V> Clone for OrderBy<V> {
    fn clone(&self) -> Self {
        match self {
            OrderBy::Thread => OrderBy::Thread,
            OrderBy::Id(id) => OrderBy::Id(*id),
            OrderBy::Value(order) => OrderBy::Value(order.clone()),
            OrderBy::RoundRobin => OrderBy::RoundRobin,
        }
    }
}

impl<V> Debug for OrderBy<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderBy::Thread => write!(f, "OrderBy::Thread"),
            OrderBy::Id(id) => write!(f, "OrderBy::Id({id})"),
            OrderBy::Value(_) => write!(f, "OrderBy::Value(..)"),
            OrderBy::RoundRobin => write!(f, "OrderBy::RoundRobin"),
        }
    }
}

/// Options a publisher is created with.
#[derive(Clone, Debug)]
pub struct PublisherOptions<V> {
    pub order_by: OrderBy<V>,
    pub on_failure: OnFailure,
    /// Overrides the channel count reported by the connector.
    pub channel_count: Option<usize>,
}

impl<V> Default for PublisherOptions<V> {
    fn default() -> Self {
        Self {
            order_by: OrderBy::default(),
            on_failure: OnFailure::default(),
            channel_count: None,
        }
    }
}

impl<V> PublisherOptions<V> {
    pub fn order_by(mut self, order_by: OrderBy<V>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn channel_count(mut self, channel_count: usize) -> Self {
        self.channel_count = Some(channel_count);
        self
    }
}
