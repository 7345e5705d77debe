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

//! Value to binary conversion boundary.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts application values to the binary form connectors transport.
pub trait ValueSerializer<V>: Send + Sync {
    fn serialize(&self, value: &V) -> Result<Vec<u8>>;

    fn deserialize(&self, binary: &[u8]) -> Result<V>;
}

/// serde_json encoding for any serde value.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl<V> ValueSerializer<V> for JsonSerializer
where
    V: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &V) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, binary: &[u8]) -> Result<V> {
        Ok(serde_json::from_slice(binary)?)
    }
}

/// Pass-through for topics that already carry raw bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinarySerializer;

impl ValueSerializer<Vec<u8>> for BinarySerializer {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, binary: &[u8]) -> Result<Vec<u8>> {
        Ok(binary.to_vec())
    }
}
