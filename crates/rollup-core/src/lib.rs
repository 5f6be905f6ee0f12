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

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![forbid(unsafe_code)]

pub mod hash;
pub mod htif;
pub mod merkle;
pub mod tx;

/// Log2 of the epoch Merkle tree address space, in bytes.
pub const LOG2_ROOT_SIZE: u32 = 37;

/// Log2 of a keccak-256 digest, in bytes.
pub const LOG2_KECCAK_SIZE: u32 = 5;

/// Size of a keccak-256 digest, in bytes.
pub const KECCAK_SIZE: usize = 1 << LOG2_KECCAK_SIZE;

/// Exact length of the metadata array that accompanies every input.
pub const INPUT_METADATA_LENGTH: usize = 128;
