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

//! Requests queued on a subscriber and what completes them.

use crate::model::{ChannelId, Position, ReceivedElement};
use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

/// Where a seek moves the targeted channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SeekTarget {
    Head(BTreeSet<ChannelId>),
    Tail(BTreeSet<ChannelId>),
    Positions(BTreeMap<ChannelId, Position>),
    Timestamps(BTreeMap<ChannelId, SystemTime>),
}

/// Which positions a position query reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PositionKind {
    Head,
    Tail,
    Committed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Request {
    /// One element, or up to `batch` elements.
    Receive { batch: Option<usize> },
    Seek(SeekTarget),
    Positions(PositionKind),
}

impl Request {
    /// Functional requests run against engine state instead of waiting for
    /// elements.
    pub(crate) fn is_functional(&self) -> bool {
        !matches!(self, Request::Receive { .. })
    }
}

#[derive(Debug)]
pub(crate) enum Response {
    Element(Option<ReceivedElement>),
    Batch(Vec<ReceivedElement>),
    Positions(BTreeMap<ChannelId, Position>),
}

impl Response {
    /// The empty answer to a receive request.
    pub(crate) fn empty_for(request: &Request) -> Response {
        match request {
            Request::Receive { batch: Some(_) } => Response::Batch(Vec::new()),
            _ => Response::Element(None),
        }
    }

    /// Elements carried back when the response could not be delivered.
    pub(crate) fn into_elements(self) -> Vec<ReceivedElement> {
        match self {
            Response::Element(element) => element.into_iter().collect(),
            Response::Batch(elements) => elements,
            Response::Positions(_) => Vec::new(),
        }
    }
}

/// Entry of the prefetch queue.
#[derive(Clone, Debug)]
pub(crate) enum Prefetched {
    Element(ReceivedElement),
    /// Every owned channel was found empty; completes waiting receives empty.
    Empty,
}

impl Prefetched {
    pub(crate) fn is_empty_marker(&self) -> bool {
        matches!(self, Prefetched::Empty)
    }

    pub(crate) fn channel(&self) -> Option<ChannelId> {
        match self {
            Prefetched::Element(element) => Some(element.channel),
            Prefetched::Empty => None,
        }
    }
}
