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

//! Structured logging vocabulary for `topic-engine`.
//!
//! Modules emit `tracing` events tagged with an `event` name from [`events`] and a
//! per-module `component`; [`fields`] holds the shared field keys and formatters.

pub mod events;
pub mod fields;
