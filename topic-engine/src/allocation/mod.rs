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

//! Channel allocation for subscriber groups.
//!
//! The group coordinator runs a [`ChannelAllocationStrategy`] whenever group
//! membership changes and publishes the resulting channel sets to the subscribers
//! as `ChannelAllocation` events:
//!
//! 1. dead subscribers are removed ([`ChannelAllocationStrategy::cleanup`]),
//! 2. manual (sticky) channel requests are honored,
//! 3. the remaining channels are spread round-robin over the remaining subscribers.

mod simple;

pub use simple::SimpleChannelAllocationStrategy;

use crate::model::{ChannelId, SubscriberId};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// Live cluster members, identified by member id and membership UUID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterMembership {
    members: HashSet<(u32, Uuid)>,
}

impl ClusterMembership {
    pub fn new(members: impl IntoIterator<Item = (u32, Uuid)>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    /// Subscribers hosted outside the cluster (member id 0) are always considered live.
    pub fn is_live(&self, subscriber: &SubscriberId) -> bool {
        subscriber.member_id() == 0
            || self
                .members
                .contains(&(subscriber.member_id(), subscriber.member_uuid()))
    }
}

/// Everything an allocation run needs.
#[derive(Clone, Debug)]
pub struct AllocationInput<'a> {
    /// Group members, walked in ascending id order.
    pub subscribers: &'a BTreeSet<SubscriberId>,
    /// Channels explicitly requested by individual subscribers.
    pub manual: &'a BTreeMap<SubscriberId, BTreeSet<ChannelId>>,
    pub channel_count: usize,
    pub membership: &'a ClusterMembership,
}

/// Result of an allocation run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelAllocation {
    /// Owner of each channel, `None` when no subscriber could take it.
    pub channels: Vec<Option<SubscriberId>>,
    /// Subscribers dropped because their member left the cluster.
    pub removed: BTreeSet<SubscriberId>,
}

impl ChannelAllocation {
    /// Channels owned by `subscriber`, ascending.
    pub fn channels_of(&self, subscriber: &SubscriberId) -> BTreeSet<ChannelId> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_ref() == Some(subscriber))
            .map(|(channel, _)| channel)
            .collect()
    }

    /// Per-subscriber channel sets, the form ownership events carry.
    pub fn by_subscriber(&self) -> BTreeMap<SubscriberId, BTreeSet<ChannelId>> {
        let mut owned: BTreeMap<SubscriberId, BTreeSet<ChannelId>> = BTreeMap::new();
        for (channel, owner) in self.channels.iter().enumerate() {
            if let Some(owner) = owner {
                owned.entry(*owner).or_default().insert(channel);
            }
        }
        owned
    }
}

/// Deterministic assignment of channels to subscribers.
pub trait ChannelAllocationStrategy: Send + Sync {
    /// Subscribers in `subscribers` whose member is no longer live.
    fn cleanup(
        &self,
        subscribers: &BTreeSet<SubscriberId>,
        membership: &ClusterMembership,
    ) -> BTreeSet<SubscriberId> {
        subscribers
            .iter()
            .filter(|subscriber| !membership.is_live(subscriber))
            .copied()
            .collect()
    }

    /// Assigns every channel to at most one live subscriber. Reapplying the function to
    /// the same input reproduces the same result.
    fn allocate(&self, input: &AllocationInput<'_>) -> ChannelAllocation;
}
