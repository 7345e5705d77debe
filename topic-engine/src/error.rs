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

//! Error taxonomy shared by publishers, subscribers and the batching queue.

use std::sync::Arc;
use thiserror::Error;

/// Failures surfaced by the topic engine.
///
/// The type is `Clone` so that one backend failure can be attached to every
/// pending future of a batch.
#[derive(Debug, Clone, Error)]
pub enum TopicError {
    /// Transient transport failure; retried with backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// The channel has no capacity left for the offered values.
    #[error("topic full: {0}")]
    TopicFull(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Authoritative failure (topic destroyed, subscriber group gone). Never retried.
    #[error("topic error: {0}")]
    Fatal(String),

    /// The operation was cancelled by its caller or by queue shutdown.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("closed: {0}")]
    Closed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A failure wrapped with the context of the operation it broke.
    #[error("{message}")]
    Wrapped {
        message: String,
        #[source]
        source: Arc<TopicError>,
    },
}

impl TopicError {
    /// Wraps `self` with an outer message, keeping it as the error source.
    pub fn wrap(self, message: impl Into<String>) -> Self {
        TopicError::Wrapped {
            message: message.into(),
            source: Arc::new(self),
        }
    }

    /// Returns the innermost error of a wrapped chain.
    pub fn root_cause(&self) -> &TopicError {
        match self {
            TopicError::Wrapped { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// True for errors that must abort reconnect loops immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(self.root_cause(), TopicError::Fatal(_))
    }

    /// True for transient transport errors.
    pub fn is_connection(&self) -> bool {
        matches!(self.root_cause(), TopicError::Connection(_))
    }

    /// True when the failure is a cancellation rather than an error.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root_cause(), TopicError::Cancelled(_))
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self.root_cause(), TopicError::IllegalState(_))
    }
}

impl From<serde_json::Error> for TopicError {
    fn from(err: serde_json::Error) -> Self {
        TopicError::Serialization(err.to_string())
    }
}

pub type Result<T, E = TopicError> = std::result::Result<T, E>;
