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

pub mod pb {
    pub mod v1 {
        tonic::include_proto!("rollup.v1");
    }

    pub use v1::*;
}

/// Version reported by the manager's own `GetVersion`.
pub const MANAGER_VERSION_MAJOR: u32 = 0;
pub const MANAGER_VERSION_MINOR: u32 = 1;
pub const MANAGER_VERSION_PATCH: u32 = 0;
pub const MANAGER_VERSION_PRE_RELEASE: &str = "";
pub const MANAGER_VERSION_BUILD: &str = "";

/// Worker machine server version the manager is compatible with. A worker
/// reporting any other major/minor fails the session handshake.
pub const MACHINE_VERSION_MAJOR: u32 = 0;
pub const MACHINE_VERSION_MINOR: u32 = 5;

/// SHA-256 of `proto/rollup.proto`. The wire surface is shared by the
/// manager, the workers, and external clients; changing it requires a
/// coordinated version bump.
pub const PROTO_SHA256: &str = "91ccf049f37019a0831c54e25e4a3ee73821857772bf9fc45702a54efe0623b8";

impl pb::SemanticVersion {
    pub fn manager() -> Self {
        Self {
            major: MANAGER_VERSION_MAJOR,
            minor: MANAGER_VERSION_MINOR,
            patch: MANAGER_VERSION_PATCH,
            pre_release: MANAGER_VERSION_PRE_RELEASE.to_string(),
            build: MANAGER_VERSION_BUILD.to_string(),
        }
    }
}
