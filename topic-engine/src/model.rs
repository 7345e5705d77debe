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

//! Data model shared between the engine and its connectors.

use crate::error::TopicError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;
use uuid::Uuid;

/// Index of a channel within a topic, `0..channel_count`.
pub type ChannelId = usize;

/// Ordered cursor within one channel.
///
/// Positions are opaque to the engine apart from their ordering. [`Position::EMPTY`]
/// sorts before every issued position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    page: i64,
    offset: i32,
}

impl Position {
    pub const EMPTY: Position = Position {
        page: -1,
        offset: -1,
    };

    pub const fn new(page: i64, offset: i32) -> Self {
        Self { page, offset }
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        *self == Position::EMPTY
    }
}

impl Default for Position {
    fn default() -> Self {
        Position::EMPTY
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "EMPTY")
        } else {
            write!(f, "{}:{}", self.page, self.offset)
        }
    }
}

/// Identity of one subscriber instance.
///
/// Ordering is by `id` first, which is the order the allocation strategy walks
/// subscribers in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId {
    id: u64,
    member_id: u32,
    member_uuid: Uuid,
}

impl SubscriberId {
    pub fn new(id: u64, member_id: u32, member_uuid: Uuid) -> Self {
        Self {
            id,
            member_id,
            member_uuid,
        }
    }

    /// A subscriber hosted outside of the cluster membership (member id 0).
    pub fn external(id: u64) -> Self {
        Self::new(id, 0, Uuid::nil())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn member_id(&self) -> u32 {
        self.member_id
    }

    pub fn member_uuid(&self) -> Uuid {
        self.member_uuid
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.id, self.member_id)
    }
}

/// Group a subscriber reads on behalf of.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubscriberGroupId {
    /// Durable, named group sharing commit positions.
    Durable(String),
    /// Private group of exactly one subscriber; owns all channels.
    Anonymous(Uuid),
}

impl SubscriberGroupId {
    pub fn durable(name: impl Into<String>) -> Self {
        SubscriberGroupId::Durable(name.into())
    }

    pub fn anonymous() -> Self {
        SubscriberGroupId::Anonymous(Uuid::new_v4())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, SubscriberGroupId::Anonymous(_))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            SubscriberGroupId::Durable(name) => Some(name.as_str()),
            SubscriberGroupId::Anonymous(_) => None,
        }
    }
}

impl Display for SubscriberGroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberGroupId::Durable(name) => write!(f, "{name}"),
            SubscriberGroupId::Anonymous(uuid) => write!(f, "$anonymous-{uuid}"),
        }
    }
}

/// Raw element as produced by a subscriber connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedElement {
    pub channel: ChannelId,
    pub position: Position,
    pub timestamp: SystemTime,
    pub binary: Vec<u8>,
}

/// Opaque backend write handle returned by `PublisherChannelConnector::initialize`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OfferCookie(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishStatus {
    Success,
    Retry,
    TopicFull,
}

/// Outcome of one `offer` call.
#[derive(Clone, Debug)]
pub struct PublishResult {
    pub status: PublishStatus,
    /// Number of leading batch values the backend accepted.
    pub accepted: usize,
    /// Positions of the accepted values, index-aligned with the batch.
    pub positions: Vec<Position>,
    /// Per-value failures keyed by batch index.
    pub errors: HashMap<usize, TopicError>,
    /// Capacity left in the channel, in bytes.
    pub remaining_capacity: usize,
    pub retry_cookie: Option<OfferCookie>,
}

impl PublishResult {
    pub fn success(positions: Vec<Position>, remaining_capacity: usize) -> Self {
        Self {
            status: PublishStatus::Success,
            accepted: positions.len(),
            positions,
            errors: HashMap::new(),
            remaining_capacity,
            retry_cookie: None,
        }
    }

    pub fn retry(cookie: OfferCookie) -> Self {
        Self {
            status: PublishStatus::Retry,
            accepted: 0,
            positions: Vec::new(),
            errors: HashMap::new(),
            remaining_capacity: 0,
            retry_cookie: Some(cookie),
        }
    }

    pub fn topic_full(positions: Vec<Position>) -> Self {
        Self {
            status: PublishStatus::TopicFull,
            accepted: positions.len(),
            positions,
            errors: HashMap::new(),
            remaining_capacity: 0,
            retry_cookie: None,
        }
    }
}

/// Receipt delivered to a `publish` caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub channel: ChannelId,
    pub position: Position,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveStatus {
    Success,
    /// Nothing more is readable from the head; the channel stays empty until a
    /// populated notification arrives.
    Exhausted,
    /// The backend no longer considers the channel allocated to this subscriber.
    NotAllocatedChannel,
    /// The backend lost the subscription; the subscriber reconnects.
    UnknownSubscriber,
}

/// Outcome of one `receive` call.
#[derive(Clone, Debug)]
pub struct ReceiveResult {
    pub status: ReceiveStatus,
    pub elements: Vec<ReceivedElement>,
    /// Elements still readable in the channel after this batch.
    pub remaining: usize,
    /// Head to read from next, when the backend moved it.
    pub head: Option<Position>,
}

impl ReceiveResult {
    pub fn with_elements(elements: Vec<ReceivedElement>, remaining: usize, head: Position) -> Self {
        Self {
            status: ReceiveStatus::Success,
            elements,
            remaining,
            head: Some(head),
        }
    }

    pub fn status(status: ReceiveStatus) -> Self {
        Self {
            status,
            elements: Vec::new(),
            remaining: 0,
            head: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStatus {
    Committed,
    AlreadyCommitted,
    NothingToCommit,
    Unowned,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitResult {
    pub channel: ChannelId,
    pub position: Position,
    pub status: CommitStatus,
}

impl CommitResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            CommitStatus::Committed | CommitStatus::AlreadyCommitted
        )
    }
}

/// Outcome of a seek on one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeekResult {
    /// New head of the channel, the next position to be read.
    pub head: Position,
    /// Position actually seeked to.
    pub seeked_to: Position,
}
