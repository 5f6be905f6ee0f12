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

//! Per-session deadline and cycle budgets, validated out of the wire types.

use std::time::Duration;

use rollup_protocol::pb;
use tonic::Status;

/// Wall-clock budgets for classes of worker operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineConfig {
    /// Budget for receiving a check-in from a spawned worker.
    pub checkin: Duration,
    pub update_merkle_tree: Duration,
    /// Budget for processing one whole input.
    pub advance_state: Duration,
    /// Budget for a single `Run` increment.
    pub advance_state_increment: Duration,
    pub inspect_state: Duration,
    pub inspect_state_increment: Duration,
    /// Budget for instantiating a machine.
    pub machine: Duration,
    pub store: Duration,
    /// Budget for quick worker control operations.
    pub fast: Duration,
}

impl DeadlineConfig {
    pub fn from_proto(proto: &pb::DeadlineConfig) -> Self {
        Self {
            checkin: Duration::from_millis(proto.checkin),
            update_merkle_tree: Duration::from_millis(proto.update_merkle_tree),
            advance_state: Duration::from_millis(proto.advance_state),
            advance_state_increment: Duration::from_millis(proto.advance_state_increment),
            inspect_state: Duration::from_millis(proto.inspect_state),
            inspect_state_increment: Duration::from_millis(proto.inspect_state_increment),
            machine: Duration::from_millis(proto.machine),
            store: Duration::from_millis(proto.store),
            fast: Duration::from_millis(proto.fast),
        }
    }

    pub fn validate(&self) -> Result<(), Status> {
        if self.advance_state < self.advance_state_increment {
            return Err(Status::invalid_argument(
                "advance state deadline is less than advance state increment deadline",
            ));
        }
        if self.inspect_state < self.inspect_state_increment {
            return Err(Status::invalid_argument(
                "inspect state deadline is less than inspect state increment deadline",
            ));
        }
        Ok(())
    }
}

/// Cycle budgets for the input-processing run loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct CyclesConfig {
    /// Maximum number of cycles one input may consume.
    pub max_advance_state: u64,
    /// Cycles granted per `Run` increment.
    pub advance_state_increment: u64,
    pub max_inspect_state: u64,
    pub inspect_state_increment: u64,
}

impl CyclesConfig {
    pub fn from_proto(proto: &pb::CyclesConfig) -> Self {
        Self {
            max_advance_state: proto.max_advance_state,
            advance_state_increment: proto.advance_state_increment,
            max_inspect_state: proto.max_inspect_state,
            inspect_state_increment: proto.inspect_state_increment,
        }
    }

    pub fn validate(&self) -> Result<(), Status> {
        if self.max_advance_state == 0 || self.advance_state_increment == 0 {
            return Err(Status::invalid_argument(
                "max cycles per advance state or cycles per advance state increment is zero",
            ));
        }
        if self.max_advance_state < self.advance_state_increment {
            return Err(Status::invalid_argument(
                "max cycles per advance state is less than cycles per advance state increment",
            ));
        }
        if self.max_inspect_state == 0 || self.inspect_state_increment == 0 {
            return Err(Status::invalid_argument(
                "max cycles per inspect state or cycles per inspect state increment is zero",
            ));
        }
        if self.max_inspect_state < self.inspect_state_increment {
            return Err(Status::invalid_argument(
                "max cycles per inspect state is less than cycles per inspect state increment",
            ));
        }
        Ok(())
    }
}
