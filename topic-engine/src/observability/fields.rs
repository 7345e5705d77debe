/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
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

//! Shared structured field values and value-format helpers.

use crate::model::ChannelId;

pub const NONE: &str = "none";
pub const REASON_NO_PENDING_REQUESTS: &str = "no_pending_requests";
pub const REASON_SUSPENDED: &str = "suspended";
pub const REASON_STALE_CONNECTION: &str = "stale_connection";
pub const DEFAULT_WORKER_THREAD: &str = "unknown-thread";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerContext {
    pub worker_id: String,
    pub worker_thread: String,
}

impl WorkerContext {
    pub fn new(worker_id: impl Into<String>, worker_thread: Option<&str>) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_thread: thread_name_or_default(worker_thread),
        }
    }
}

pub fn thread_name_or_default(thread_name: Option<&str>) -> String {
    thread_name.unwrap_or(DEFAULT_WORKER_THREAD).to_string()
}

/// Formats a channel set as `[0,3,5]`, or `none` when empty.
pub fn format_channels<'a>(channels: impl IntoIterator<Item = &'a ChannelId>) -> String {
    let joined = channels
        .into_iter()
        .map(|channel| channel.to_string())
        .collect::<Vec<_>>()
        .join(",");

    if joined.is_empty() {
        NONE.to_string()
    } else {
        format!("[{joined}]")
    }
}
