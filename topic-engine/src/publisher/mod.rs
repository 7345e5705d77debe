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

//! Publishing side of a topic.

pub(crate) mod channel;
mod options;
mod statistics;
mod topic_publisher;

pub use options::{FlushMode, OnFailure, OrderBy, PublisherOptions};
pub use statistics::PublisherStatistics;
pub use topic_publisher::{Publisher, PublisherState};
