// Copyright [2026] [Rollup Machine Manager Contributors]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Decoding rules for the tx buffer and the hashes memory ranges.
//!
//! Every header field is a 32-byte word. Lengths are encoded big-endian in
//! the last 8 bytes of their word; the upper 24 bytes must be zero.

use crate::hash::{Hash, HASH_SIZE};
use thiserror::Error;

pub const VOUCHER_ADDRESS_LENGTH: usize = 32;
pub const VOUCHER_OFFSET_LENGTH: usize = 32;
pub const VOUCHER_LENGTH_LENGTH: usize = 32;

/// Voucher header: address word, offset word, length word.
pub const VOUCHER_HEADER_LENGTH: usize =
    VOUCHER_ADDRESS_LENGTH + VOUCHER_OFFSET_LENGTH + VOUCHER_LENGTH_LENGTH;

pub const NOTICE_OFFSET_LENGTH: usize = 32;
pub const NOTICE_LENGTH_LENGTH: usize = 32;

/// Notice and report header: offset word, length word.
pub const NOTICE_HEADER_LENGTH: usize = NOTICE_OFFSET_LENGTH + NOTICE_LENGTH_LENGTH;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TxDecodeError {
    #[error("payload length too large")]
    LengthTooLarge,
    #[error("invalid hash length")]
    InvalidHashLength,
    #[error("invalid length word")]
    InvalidLengthWord,
}

/// Decodes a payload length from its 32-byte big-endian word.
pub fn decode_payload_length(word: &[u8]) -> Result<u64, TxDecodeError> {
    if word.len() != 32 {
        return Err(TxDecodeError::InvalidLengthWord);
    }
    if word[..24].iter().any(|&b| b != 0) {
        return Err(TxDecodeError::LengthTooLarge);
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[24..32]);
    Ok(u64::from_be_bytes(tail))
}

/// Copies a 32-byte big-endian hash out of a buffer slice.
pub fn hash_from_slice(bytes: &[u8]) -> Result<Hash, TxDecodeError> {
    let mut hash = [0u8; HASH_SIZE];
    if bytes.len() != HASH_SIZE {
        return Err(TxDecodeError::InvalidHashLength);
    }
    hash.copy_from_slice(bytes);
    Ok(hash)
}

/// Counts fixed-size entries up to the first all-zero entry. A trailing
/// partial entry is ignored.
pub fn count_null_terminated_entries(data: &[u8], entry_length: usize) -> u64 {
    let mut count = 0u64;
    for entry in data.chunks_exact(entry_length) {
        if entry.iter().all(|&b| b == 0) {
            return count;
        }
        count += 1;
    }
    count
}
