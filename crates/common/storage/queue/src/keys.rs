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

//! Key and value encodings shared by the log and cursor stores.
//!
//! ## Record keys
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  sequence (8B, big-endian)   │
//! └──────────────────────────────┘
//! ```
//!
//! Big-endian fixed width makes byte order equal numeric order, so the store's
//! ordered index doubles as the sequence index.
//!
//! ## Cursor keys and values
//!
//! ```text
//! key:   queue bytes │ 0x00 │ consumer bytes
//! value: offset (8B, big-endian) │ touched_at millis (8B, big-endian)
//! ```
//!
//! NUL is rejected in both names, so a key splits back unambiguously and all
//! cursors of one queue share the prefix `queue 0x00`.

use snafu::ensure;

use crate::error::{InvalidNameSnafu, InvalidProgressSnafu, Result};

/// Reserved collection holding consumer cursors.
pub const CURSOR_COLLECTION: &str = "__cursors";

const SEPARATOR: u8 = 0x00;
const SEQUENCE_KEY_LEN: usize = 8;
const CURSOR_VALUE_LEN: usize = 16;

#[inline]
pub(crate) fn sequence_key(sequence: u64) -> [u8; SEQUENCE_KEY_LEN] { sequence.to_be_bytes() }

/// Decodes a record key. Anything but 8 bytes is not a record key.
#[inline]
pub(crate) fn decode_sequence(key: &[u8]) -> Option<u64> {
    let bytes: [u8; SEQUENCE_KEY_LEN] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub(crate) fn validate_queue_name(name: &str) -> Result<()> {
    validate_name(name)?;
    ensure!(
        name != CURSOR_COLLECTION,
        InvalidNameSnafu {
            name,
            reason: "reserved for consumer cursors",
        }
    );
    Ok(())
}

pub(crate) fn validate_consumer_id(id: &str) -> Result<()> { validate_name(id) }

fn validate_name(name: &str) -> Result<()> {
    ensure!(
        !name.is_empty(),
        InvalidNameSnafu {
            name,
            reason: "must not be empty",
        }
    );
    ensure!(
        !name.as_bytes().contains(&SEPARATOR),
        InvalidNameSnafu {
            name,
            reason: "must not contain NUL",
        }
    );
    Ok(())
}

pub(crate) fn cursor_key(queue: &str, consumer: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(queue.len() + 1 + consumer.len());
    key.extend_from_slice(queue.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(consumer.as_bytes());
    key
}

/// Key prefix shared by every cursor of `queue`.
pub(crate) fn cursor_prefix(queue: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(queue.len() + 1);
    prefix.extend_from_slice(queue.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

/// Splits a cursor key into `(queue, consumer)`.
pub(crate) fn split_cursor_key(key: &[u8]) -> Option<(String, String)> {
    let at = key.iter().position(|b| *b == SEPARATOR)?;
    let queue = std::str::from_utf8(&key[..at]).ok()?;
    let consumer = std::str::from_utf8(&key[at + 1..]).ok()?;
    Some((queue.to_owned(), consumer.to_owned()))
}

pub(crate) fn encode_cursor(offset: u64, touched_at_millis: i64) -> [u8; CURSOR_VALUE_LEN] {
    let mut value = [0u8; CURSOR_VALUE_LEN];
    value[..8].copy_from_slice(&offset.to_be_bytes());
    value[8..].copy_from_slice(&touched_at_millis.to_be_bytes());
    value
}

pub(crate) fn decode_cursor(key: &[u8], value: &[u8]) -> Result<(u64, i64)> {
    let bytes: [u8; CURSOR_VALUE_LEN] = value.try_into().map_err(|_| {
        InvalidProgressSnafu {
            key: String::from_utf8_lossy(key).replace('\0', ":"),
        }
        .build()
    })?;
    let mut offset = [0u8; 8];
    let mut touched = [0u8; 8];
    offset.copy_from_slice(&bytes[..8]);
    touched.copy_from_slice(&bytes[8..]);
    Ok((u64::from_be_bytes(offset), i64::from_be_bytes(touched)))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_sequence_keys_sort_numerically() {
        let mut keys: Vec<_> = [1u64, 9, 10, 99, 1_000_000_000, 10_000_000_000, 2]
            .into_iter()
            .map(sequence_key)
            .collect();
        keys.sort_unstable();
        let decoded: Vec<_> = keys.iter().filter_map(|k| decode_sequence(k)).collect();
        assert_eq!(decoded, vec![1, 2, 9, 10, 99, 1_000_000_000, 10_000_000_000]);
    }

    #[test]
    fn test_decode_sequence_rejects_other_lengths() {
        assert_eq!(decode_sequence(b"12"), None);
        assert_eq!(decode_sequence(&[0; 9]), None);
    }

    #[test_case("q1:c", "x" ; "colon in queue")]
    #[test_case("q1_c", "x" ; "underscore in queue")]
    #[test_case("q", "1c" ; "short queue")]
    fn test_cursor_keys_do_not_collide(queue: &str, consumer: &str) {
        let others = [("q1", "c"), ("q", "1:c"), ("q1:", "c"), ("q", "1_c")];
        let key = cursor_key(queue, consumer);
        for (q, c) in others {
            if (q, c) != (queue, consumer) {
                assert_ne!(key, cursor_key(q, c), "{queue}/{consumer} vs {q}/{c}");
            }
        }
        assert_eq!(
            split_cursor_key(&key),
            Some((queue.to_owned(), consumer.to_owned()))
        );
    }

    #[test]
    fn test_cursor_prefix_excludes_prefixed_queues() {
        let prefix = cursor_prefix("q");
        assert!(cursor_key("q", "consumer").starts_with(&prefix));
        assert!(!cursor_key("q1", "consumer").starts_with(&prefix));
    }

    #[test_case("" ; "empty")]
    #[test_case("a\0b" ; "nul")]
    #[test_case(CURSOR_COLLECTION ; "reserved")]
    fn test_invalid_queue_names(name: &str) {
        assert!(validate_queue_name(name).is_err());
    }

    #[test]
    fn test_cursor_value_layout() {
        let value = encode_cursor(42, 1_700_000_000_000);
        assert_eq!(decode_cursor(b"q\0c", &value).unwrap(), (42, 1_700_000_000_000));
        assert!(decode_cursor(b"q\0c", b"42").is_err());
    }
}
