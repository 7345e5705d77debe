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

//! Publisher counters.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by a publisher and its channels.
#[derive(Debug, Default)]
pub struct PublisherStatistics {
    published: AtomicU64,
    offers: AtomicU64,
    accepted: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    topic_full: AtomicU64,
    resumes: AtomicU64,
}

impl PublisherStatistics {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_offer(&self) {
        self.offers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, accepted: usize, failed: usize) {
        self.accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        self.failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_topic_full(&self) {
        self.topic_full.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
    }

    /// Values handed to `publish`.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Offer calls made to the connector.
    pub fn offers(&self) -> u64 {
        self.offers.load(Ordering::Relaxed)
    }

    /// Values the backend accepted.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Values completed with an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn topic_full(&self) -> u64 {
        self.topic_full.load(Ordering::Relaxed)
    }

    /// Channels resumed by a capacity-freed notification.
    pub fn resumes(&self) -> u64 {
        self.resumes.load(Ordering::Relaxed)
    }

    /// Average values per offer.
    pub fn batch_size(&self) -> u64 {
        self.accepted() / self.offers().max(1)
    }
}

impl Display for PublisherStatistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "published={}, offers={}, accepted={}, failed={}, batch_size={}, retries={}, topic_full={}, resumes={}",
            self.published(),
            self.offers(),
            self.accepted(),
            self.failed(),
            self.batch_size(),
            self.retries(),
            self.topic_full(),
            self.resumes()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::PublisherStatistics;

    #[test]
    fn batch_size_without_offers_reports_zero() {
        let statistics = PublisherStatistics::default();

        assert_eq!(statistics.batch_size(), 0);
        assert!(statistics.to_string().contains("batch_size=0"));
    }

    #[test]
    fn batch_size_averages_accepted_values_per_offer() {
        let statistics = PublisherStatistics::default();
        statistics.record_offer();
        statistics.record_offer();
        statistics.record_completed(7, 1);

        assert_eq!(statistics.batch_size(), 3);
        assert_eq!(statistics.failed(), 1);
    }
}
