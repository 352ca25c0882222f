// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Payload codecs.
//!
//! The store only sees bytes. A [`Codec`] is chosen per queue handle and
//! converts between the caller's type and the stored payload.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Result, codec_error};

/// Converts values of `T` to and from stored payload bytes.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Bytes>;

    fn decode(&self, payload: &[u8]) -> Result<T>;
}

/// JSON via `serde_json`. Works for any serde type.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(codec_error)
    }

    fn decode(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(codec_error)
    }
}

/// Pass-through for payloads that are already bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec<Bytes> for RawCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes> { Ok(value.clone()) }

    fn decode(&self, payload: &[u8]) -> Result<Bytes> { Ok(Bytes::copy_from_slice(payload)) }
}

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Bytes> { Ok(Bytes::copy_from_slice(value)) }

    fn decode(&self, payload: &[u8]) -> Result<Vec<u8>> { Ok(payload.to_vec()) }
}
