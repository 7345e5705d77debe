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

//! Subscriber counters.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SubscriberStatistics {
    receive_requests: AtomicU64,
    polls: AtomicU64,
    elements_polled: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    waits: AtomicU64,
    notifications: AtomicU64,
    received: AtomicU64,
    received_empty: AtomicU64,
    received_errors: AtomicU64,
    cancelled: AtomicU64,
    disconnects: AtomicU64,
    connects: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident) => {
        pub(crate) fn $record(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }
    };
}

impl SubscriberStatistics {
    counter!(record_receive_request, receive_requests);
    counter!(record_miss, misses);
    counter!(record_wait, waits);
    counter!(record_notification, notifications);
    counter!(record_received_empty, received_empty);
    counter!(record_received_error, received_errors);
    counter!(record_cancelled, cancelled);
    counter!(record_disconnect, disconnects);
    counter!(record_connect, connects);

    /// Records one backend receive that returned `elements` elements.
    pub(crate) fn record_poll(&self, elements: usize) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if elements > 0 {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.elements_polled
                .fetch_add(elements as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_received(&self, elements: usize) {
        self.received.fetch_add(elements as u64, Ordering::Relaxed);
    }

    /// Backend receive calls.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Receive calls that returned at least one element.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn elements_polled(&self) -> u64 {
        self.elements_polled.load(Ordering::Relaxed)
    }

    /// Elements handed to callers.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl Display for SubscriberStatistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let polls = self.polls();
        write!(
            f,
            "requests={}, polls={}, hits={}, misses={}, waits={}, notifications={}, received={}, \
             received_empty={}, errors={}, cancelled={}, batch_size={}, hit_rate={:.2}, \
             disconnects={}, connects={}",
            self.receive_requests(),
            polls,
            self.hits(),
            self.misses(),
            self.waits(),
            self.notifications(),
            self.received(),
            self.received_empty(),
            self.received_errors(),
            self.cancelled(),
            self.elements_polled() / polls.max(1),
            self.hits() as f64 / polls.max(1) as f64,
            self.disconnects(),
            self.connects()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SubscriberStatistics;

    #[test]
    fn display_without_polls_reports_zero_rates() {
        let statistics = SubscriberStatistics::default();

        let text = statistics.to_string();

        assert!(text.contains("batch_size=0"));
        assert!(text.contains("hit_rate=0.00"));
    }

    #[test]
    fn empty_polls_count_towards_polls_but_not_hits() {
        let statistics = SubscriberStatistics::default();
        statistics.record_poll(0);
        statistics.record_poll(6);
        statistics.record_poll(2);

        assert_eq!(statistics.polls(), 3);
        assert_eq!(statistics.hits(), 2);
        assert_eq!(statistics.elements_polled(), 8);
        assert!(statistics.to_string().contains("hit_rate=0.67"));
    }
}
