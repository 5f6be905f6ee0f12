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

//! Session records, epochs, and the process-wide session store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use rollup_core::hash::Hash;
use rollup_core::merkle::{CompleteTree, MerkleError, Proof};
use rollup_core::{INPUT_METADATA_LENGTH, LOG2_KECCAK_SIZE, LOG2_ROOT_SIZE};
use rollup_protocol::pb;
use tonic::Status;

use crate::config::{CyclesConfig, DeadlineConfig};
use crate::worker::{WorkerClient, WorkerProcess};

/// One input waiting to be processed.
#[derive(Debug, Clone)]
pub struct Input {
    pub metadata: [u8; INPUT_METADATA_LENGTH],
    pub payload: Vec<u8>,
}

/// Hash of a voucher or notice payload, with the proof of its slot inside
/// the corresponding hashes memory range.
#[derive(Debug, Clone)]
pub struct OutputHash {
    pub keccak: Hash,
    pub keccak_in_hashes: Proof,
}

#[derive(Debug, Clone)]
pub struct Voucher {
    pub address: Hash,
    pub payload: Vec<u8>,
    pub hash: Option<OutputHash>,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub payload: Vec<u8>,
    pub hash: Option<OutputHash>,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub payload: Vec<u8>,
}

/// Reason an input was skipped instead of completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSkipReason {
    CycleLimitExceeded,
    RequestedByMachine,
    MachineHalted,
    TimeLimitExceeded,
}

impl InputSkipReason {
    pub fn to_proto(self) -> pb::InputSkipReason {
        match self {
            InputSkipReason::CycleLimitExceeded => pb::InputSkipReason::CycleLimitExceeded,
            InputSkipReason::RequestedByMachine => pb::InputSkipReason::RequestedByMachine,
            InputSkipReason::MachineHalted => pb::InputSkipReason::MachineHalted,
            InputSkipReason::TimeLimitExceeded => pb::InputSkipReason::TimeLimitExceeded,
        }
    }
}

/// Side effects of an input the machine accepted.
#[derive(Debug, Clone)]
pub struct InputResult {
    pub voucher_hashes_in_machine: Proof,
    pub vouchers: Vec<Voucher>,
    pub notice_hashes_in_machine: Proof,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone)]
pub enum InputProcessing {
    Result(InputResult),
    Skipped(InputSkipReason),
}

#[derive(Debug, Clone)]
pub struct ProcessedInput {
    pub input_index: u64,
    pub most_recent_machine_hash: Hash,
    pub voucher_hashes_in_epoch: Proof,
    pub notice_hashes_in_epoch: Proof,
    pub processed: InputProcessing,
    pub reports: Vec<Report>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    Active,
    Finished,
}

#[derive(Debug)]
pub struct Epoch {
    pub epoch_index: u64,
    pub state: EpochState,
    pub vouchers_tree: CompleteTree,
    pub notices_tree: CompleteTree,
    pub processed_inputs: Vec<ProcessedInput>,
    pub pending_inputs: VecDeque<Input>,
}

impl Epoch {
    pub fn new(epoch_index: u64) -> Result<Self, MerkleError> {
        Ok(Self {
            epoch_index,
            state: EpochState::Active,
            vouchers_tree: CompleteTree::new(LOG2_ROOT_SIZE, LOG2_KECCAK_SIZE)?,
            notices_tree: CompleteTree::new(LOG2_ROOT_SIZE, LOG2_KECCAK_SIZE)?,
            processed_inputs: Vec::new(),
            pending_inputs: VecDeque::new(),
        })
    }

    pub fn current_input_index(&self) -> u64 {
        self.pending_inputs.len() as u64 + self.processed_inputs.len() as u64
    }
}

/// Description of one of the five worker-side memory ranges the manager
/// drives. The retained config has its image cleared so it doubles as the
/// zeroing argument for `ReplaceMemoryRange`.
#[derive(Debug, Clone, Default)]
pub struct MemoryRangeDescription {
    pub start: u64,
    pub length: u64,
    pub log2_size: u32,
    pub config: pb::MemoryRangeConfig,
}

impl MemoryRangeDescription {
    /// Validates a range reported by the worker: not shared, power-of-two
    /// length, start aligned to that power.
    pub fn check(name: &str, config: &pb::MemoryRangeConfig) -> Result<Self, Status> {
        if config.shared {
            return Err(Status::invalid_argument(format!(
                "{name} buffer cannot be shared"
            )));
        }
        let length = config.length;
        if length == 0 || length & (length - 1) != 0 {
            return Err(Status::out_of_range(format!(
                "{name} memory range length not a power of two ({length})"
            )));
        }
        let log2_size = 63 - length.leading_zeros();
        let start = config.start;
        if start & (length - 1) != 0 {
            return Err(Status::out_of_range(format!(
                "{name} memory range start not aligned to its power of two size"
            )));
        }
        let mut config = config.clone();
        config.image_filename.clear();
        Ok(Self {
            start,
            length,
            log2_size,
            config,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRanges {
    pub rx_buffer: MemoryRangeDescription,
    pub tx_buffer: MemoryRangeDescription,
    pub input_metadata: MemoryRangeDescription,
    pub voucher_hashes: MemoryRangeDescription,
    pub notice_hashes: MemoryRangeDescription,
}

/// One-way session health latch.
#[derive(Debug, Clone)]
pub enum SessionHealth {
    Healthy,
    Tainted(Status),
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub active_epoch_index: u64,
    pub epochs: BTreeMap<u64, Epoch>,
    pub health: SessionHealth,
    /// Set while the input-processing engine is draining the pending queue.
    pub processing_lock: bool,
    pub worker: Option<WorkerClient>,
    pub worker_process: Option<WorkerProcess>,
    /// Address the worker reported at its last check-in.
    pub server_address: String,
    /// Worker mcycle after the last accepted input.
    pub current_mcycle: u64,
    pub memory_ranges: MemoryRanges,
    pub deadlines: DeadlineConfig,
    pub cycles: CyclesConfig,
}

impl Session {
    pub fn new(
        id: String,
        active_epoch_index: u64,
        deadlines: DeadlineConfig,
        cycles: CyclesConfig,
    ) -> Result<Self, MerkleError> {
        let mut epochs = BTreeMap::new();
        epochs.insert(active_epoch_index, Epoch::new(active_epoch_index)?);
        Ok(Self {
            id,
            active_epoch_index,
            epochs,
            health: SessionHealth::Healthy,
            processing_lock: false,
            worker: None,
            worker_process: None,
            server_address: String::new(),
            current_mcycle: 0,
            memory_ranges: MemoryRanges::default(),
            deadlines,
            cycles,
        })
    }

    pub fn is_tainted(&self) -> bool {
        matches!(self.health, SessionHealth::Tainted(_))
    }

    /// Latches the session as tainted. The first taint wins; later ones are
    /// only logged.
    pub fn taint(&mut self, status: Status) {
        match &self.health {
            SessionHealth::Healthy => {
                tracing::error!(
                    session_id = %self.id,
                    code = ?status.code(),
                    message = %status.message(),
                    "tainting session"
                );
                self.health = SessionHealth::Tainted(status);
            }
            SessionHealth::Tainted(first) => {
                tracing::error!(
                    session_id = %self.id,
                    first = %first.message(),
                    dropped = %status.message(),
                    "session already tainted; dropping later taint"
                );
            }
        }
    }

    pub fn check_tainted(&self) -> Result<(), Status> {
        if self.is_tainted() {
            Err(Status::data_loss("session is tainted"))
        } else {
            Ok(())
        }
    }

    pub fn check_epoch_index_overflow(&self) -> Result<(), Status> {
        if self.active_epoch_index == u64::MAX {
            Err(Status::out_of_range("active epoch index will overflow"))
        } else {
            Ok(())
        }
    }

    pub fn taint_status(&self) -> Option<pb::TaintStatus> {
        match &self.health {
            SessionHealth::Healthy => None,
            SessionHealth::Tainted(status) => Some(pb::TaintStatus {
                error_code: status.code() as i32,
                error_message: status.message().to_string(),
            }),
        }
    }

    pub fn active_epoch_mut(&mut self) -> Result<&mut Epoch, Status> {
        self.epochs
            .get_mut(&self.active_epoch_index)
            .ok_or_else(|| Status::internal("active epoch not found"))
    }

    pub fn worker(&self) -> Result<WorkerClient, Status> {
        self.worker
            .clone()
            .ok_or_else(|| Status::internal("session has no worker connection"))
    }

    /// Starts the next epoch after the current one was finished.
    pub fn start_new_epoch(&mut self) -> Result<(), Status> {
        self.active_epoch_index += 1;
        let epoch = Epoch::new(self.active_epoch_index)
            .map_err(|e| Status::internal(format!("failed creating epoch ({e})")))?;
        self.epochs.insert(self.active_epoch_index, epoch);
        Ok(())
    }

    pub fn terminate_worker_process(&self) {
        if let Some(process) = &self.worker_process {
            process.terminate();
        }
    }
}

/// A stored session. The tokio mutex is the per-session RPC lock: handlers
/// take it with `try_lock`, so a second in-flight RPC observes `ABORTED`
/// instead of queueing.
#[derive(Debug)]
pub struct SessionEntry {
    pub id: String,
    pub session: Arc<tokio::sync::Mutex<Session>>,
}

impl SessionEntry {
    pub fn try_lock(&self) -> Result<tokio::sync::MutexGuard<'_, Session>, Status> {
        self.session
            .try_lock()
            .map_err(|_| Status::aborted("concurrent call in session"))
    }
}

/// Process-wide keyed collection of sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<parking_lot::Mutex<HashMap<String, Arc<SessionEntry>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new session and hands back its already-held lock, so the
    /// creating handler owns the session before anyone else can observe it.
    pub fn try_insert(
        &self,
        session: Session,
    ) -> Result<(Arc<SessionEntry>, tokio::sync::OwnedMutexGuard<Session>), Status> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&session.id) {
            return Err(Status::already_exists("session id is taken"));
        }
        let id = session.id.clone();
        let session = Arc::new(tokio::sync::Mutex::new(session));
        let guard = session
            .clone()
            .try_lock_owned()
            .map_err(|_| Status::internal("fresh session already locked"))?;
        let entry = Arc::new(SessionEntry { id, session });
        inner.insert(entry.id.clone(), entry.clone());
        Ok((entry, guard))
    }

    pub fn get(&self, id: &str) -> Result<Arc<SessionEntry>, Status> {
        self.inner
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Status::invalid_argument("session id not found"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.inner.lock().values().cloned().collect()
    }
}
