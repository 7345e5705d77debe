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

//! Per-channel read state of a subscriber and the gate that guards it.

use crate::model::{ChannelId, Position};
use std::collections::BTreeSet;
use std::time::SystemTime;

/// Read cursor and bookkeeping of one channel.
#[derive(Clone, Debug)]
pub(crate) struct TopicChannel {
    channel: ChannelId,
    head: Position,
    owned: bool,
    empty: bool,
    /// Bumped by every populated notification so stale empty verdicts are ignored.
    version: u64,
    polled: bool,
    hit: bool,
    polls: u64,
    hits: u64,
    notifications: u64,
    received: u64,
    first_polled: Option<Position>,
    last_polled: Option<Position>,
    last_polled_at: Option<SystemTime>,
    last_received: Option<Position>,
    last_committed: Option<Position>,
}

impl TopicChannel {
    pub(crate) fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            head: Position::EMPTY,
            owned: false,
            empty: false,
            version: 0,
            polled: false,
            hit: false,
            polls: 0,
            hits: 0,
            notifications: 0,
            received: 0,
            first_polled: None,
            last_polled: None,
            last_polled_at: None,
            last_received: None,
            last_committed: None,
        }
    }

    pub(crate) fn head(&self) -> Position {
        self.head
    }

    pub(crate) fn set_head(&mut self, head: Position) {
        self.head = head;
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.owned
    }

    pub(crate) fn set_owned(&mut self, owned: bool) {
        self.owned = owned;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.empty
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    /// Marks the channel empty unless a populated notification arrived after
    /// `version` was read.
    pub(crate) fn set_empty(&mut self, version: u64) -> bool {
        if self.version != version {
            return false;
        }
        self.empty = true;
        true
    }

    pub(crate) fn set_populated(&mut self) {
        self.version += 1;
        self.empty = false;
    }

    pub(crate) fn on_populated_notification(&mut self) {
        self.notifications += 1;
        self.set_populated();
    }

    pub(crate) fn reset_poll_flags(&mut self) {
        self.polled = false;
        self.hit = false;
    }

    /// Records one backend receive that returned `elements` elements from `head`.
    pub(crate) fn record_poll(&mut self, head: Position, elements: usize) {
        self.polls += 1;
        self.polled = true;
        if self.first_polled.is_none() {
            self.first_polled = Some(head);
        }
        self.last_polled = Some(head);
        self.last_polled_at = Some(SystemTime::now());
        if elements > 0 {
            self.hit = true;
            self.hits += elements as u64;
        }
    }

    pub(crate) fn record_received(&mut self, position: Position) {
        self.received += 1;
        self.last_received = Some(position);
    }

    pub(crate) fn record_committed(&mut self, position: Position) {
        self.last_committed = Some(position);
    }

    pub(crate) fn statistics(&self) -> ChannelStatistics {
        ChannelStatistics {
            channel: self.channel,
            owned: self.owned,
            empty: self.empty,
            head: self.head,
            polled: self.polled,
            hit: self.hit,
            polls: self.polls,
            hits: self.hits,
            notifications: self.notifications,
            received: self.received,
            first_polled: self.first_polled,
            last_polled: self.last_polled,
            last_polled_at: self.last_polled_at,
            last_received: self.last_received,
            last_committed: self.last_committed,
        }
    }
}

/// Snapshot of one channel as seen by a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelStatistics {
    pub channel: ChannelId,
    pub owned: bool,
    pub empty: bool,
    pub head: Position,
    /// Polled since ownership last changed.
    pub polled: bool,
    /// Returned elements since ownership last changed.
    pub hit: bool,
    pub polls: u64,
    pub hits: u64,
    pub notifications: u64,
    pub received: u64,
    pub first_polled: Option<Position>,
    pub last_polled: Option<Position>,
    pub last_polled_at: Option<SystemTime>,
    pub last_received: Option<Position>,
    pub last_committed: Option<Position>,
}

/// Channel array, owned set and current read channel. Only ever touched under
/// the subscriber's channel gate.
#[derive(Debug, Default)]
pub(crate) struct ChannelGate {
    pub(crate) channels: Vec<TopicChannel>,
    pub(crate) owned: Vec<ChannelId>,
    pub(crate) current: Option<ChannelId>,
}

impl ChannelGate {
    pub(crate) fn new(channel_count: usize) -> Self {
        Self {
            channels: (0..channel_count).map(TopicChannel::new).collect(),
            owned: Vec::new(),
            current: None,
        }
    }

    /// Grows the channel array to `channel_count`. Never shrinks.
    pub(crate) fn ensure_capacity(&mut self, channel_count: usize) {
        let known = self.channels.len();
        if channel_count > known {
            self.channels
                .extend((known..channel_count).map(TopicChannel::new));
        }
    }

    pub(crate) fn is_owner(&self, channel: ChannelId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(TopicChannel::is_owned)
    }

    pub(crate) fn owned_set(&self) -> BTreeSet<ChannelId> {
        self.owned.iter().copied().collect()
    }

    pub(crate) fn channel(&self, channel: ChannelId) -> Option<&TopicChannel> {
        self.channels.get(channel)
    }

    pub(crate) fn channel_mut(&mut self, channel: ChannelId) -> Option<&mut TopicChannel> {
        self.channels.get_mut(channel)
    }

    fn is_readable(&self, channel: ChannelId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|state| state.is_owned() && !state.is_empty())
    }

    /// Picks the next owned, non-empty channel after the current one, wrapping
    /// around. Returns false and clears the current channel when there is none.
    pub(crate) fn switch_channel(&mut self) -> bool {
        let next = match self.owned.as_slice() {
            [] => None,
            [only] => Some(*only).filter(|channel| self.is_readable(*channel)),
            owned => {
                let start = match self.current {
                    Some(current) => owned
                        .iter()
                        .position(|channel| *channel > current)
                        .unwrap_or(0),
                    None => 0,
                };
                (0..owned.len())
                    .map(|offset| owned[(start + offset) % owned.len()])
                    .find(|channel| self.is_readable(*channel))
            }
        };
        self.current = next;
        next.is_some()
    }

    /// Replaces the owned set, updating each channel's owned flag. Every channel
    /// starts out populated again so the new owner polls it at least once.
    pub(crate) fn set_owned(&mut self, owned: &BTreeSet<ChannelId>) {
        for channel in &mut self.channels {
            channel.set_owned(false);
            channel.set_populated();
        }
        for channel in owned {
            if let Some(state) = self.channels.get_mut(*channel) {
                state.set_owned(true);
            }
        }
        self.owned = owned.iter().copied().collect();
        if self.current.is_some_and(|current| !self.is_owner(current)) {
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelGate, TopicChannel};
    use crate::model::Position;
    use std::collections::BTreeSet;

    fn gate(channel_count: usize, owned: &[usize]) -> ChannelGate {
        let mut gate = ChannelGate::new(channel_count);
        gate.set_owned(&owned.iter().copied().collect::<BTreeSet<_>>());
        gate
    }

    #[test]
    fn stale_empty_verdict_is_ignored_after_populated_notification() {
        let mut channel = TopicChannel::new(0);
        let version = channel.version();

        channel.on_populated_notification();

        assert!(!channel.set_empty(version));
        assert!(!channel.is_empty());
        assert!(channel.set_empty(channel.version()));
        assert!(channel.is_empty());
    }

    #[test]
    fn switch_round_robins_over_owned_channels() {
        let mut gate = gate(5, &[1, 3, 4]);

        let mut visited = Vec::new();
        for _ in 0..4 {
            assert!(gate.switch_channel());
            visited.push(gate.current.expect("a channel should be current"));
        }

        assert_eq!(visited, vec![1, 3, 4, 1]);
    }

    #[test]
    fn switch_skips_empty_channels() {
        let mut gate = gate(4, &[0, 1, 2]);
        gate.current = Some(0);
        let version = gate.channels[1].version();
        gate.channels[1].set_empty(version);

        assert!(gate.switch_channel());
        assert_eq!(gate.current, Some(2));
    }

    #[test]
    fn switch_fails_when_every_owned_channel_is_empty() {
        let mut gate = gate(3, &[0, 2]);
        for channel in [0, 2] {
            let version = gate.channels[channel].version();
            gate.channels[channel].set_empty(version);
        }

        assert!(!gate.switch_channel());
        assert_eq!(gate.current, None);
    }

    #[test]
    fn single_owned_channel_is_tested_directly() {
        let mut gate = gate(3, &[2]);

        assert!(gate.switch_channel());
        assert_eq!(gate.current, Some(2));
        let version = gate.channels[2].version();
        gate.channels[2].set_empty(version);
        assert!(!gate.switch_channel());
    }

    #[test]
    fn ownership_change_drops_unowned_current_channel() {
        let mut gate = gate(3, &[0, 1]);
        gate.current = Some(1);

        gate.set_owned(&BTreeSet::from([0]));

        assert_eq!(gate.current, None);
        assert!(gate.is_owner(0));
        assert!(!gate.is_owner(1));
    }

    #[test]
    fn polls_record_first_and_last_heads() {
        let mut channel = TopicChannel::new(1);

        channel.record_poll(Position::new(0, 1), 0);
        channel.record_poll(Position::new(0, 4), 3);
        let statistics = channel.statistics();

        assert_eq!(statistics.polls, 2);
        assert_eq!(statistics.hits, 3);
        assert_eq!(statistics.first_polled, Some(Position::new(0, 1)));
        assert_eq!(statistics.last_polled, Some(Position::new(0, 4)));
        assert!(statistics.hit);
    }

    #[test]
    fn growing_keeps_existing_channel_state() {
        let mut gate = gate(2, &[1]);
        gate.channels[1].set_head(Position::new(3, 3));

        gate.ensure_capacity(4);
        gate.ensure_capacity(1);

        assert_eq!(gate.channels.len(), 4);
        assert_eq!(gate.channels[1].head(), Position::new(3, 3));
    }
}
