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

//! Externally visible RPC handlers. Handlers validate, take the session
//! lock, and delegate; the engine owns everything between enqueue and
//! processed input.

use std::sync::Arc;

use rollup_core::merkle::MerkleError;
use rollup_core::{INPUT_METADATA_LENGTH, LOG2_KECCAK_SIZE};
use rollup_protocol::pb;
use rollup_protocol::pb::rollup_machine_manager_server::RollupMachineManager;
use rollup_protocol::{MACHINE_VERSION_MAJOR, MACHINE_VERSION_MINOR};
use tonic::{Request, Response, Status};

use crate::checkin::CheckInSlots;
use crate::config::{CyclesConfig, DeadlineConfig};
use crate::engine;
use crate::session::{
    Epoch, EpochState, Input, InputProcessing, MemoryRangeDescription, MemoryRanges, Notice,
    ProcessedInput, Report, Session, SessionStore, Voucher,
};
use crate::worker::{proof_to_proto, WorkerClient, WorkerLauncher};

#[derive(Clone)]
pub struct ManagerService {
    sessions: SessionStore,
    checkin_slots: CheckInSlots,
    launcher: Arc<dyn WorkerLauncher>,
    manager_address: String,
    worker_address: String,
}

impl ManagerService {
    pub fn new(
        sessions: SessionStore,
        checkin_slots: CheckInSlots,
        launcher: Arc<dyn WorkerLauncher>,
        manager_address: String,
        worker_address: String,
    ) -> Self {
        Self {
            sessions,
            checkin_slots,
            launcher,
            manager_address,
            worker_address,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Spawns the worker, waits for its check-in, and runs the handshake.
    /// Called with the session lock held; any error makes the caller remove
    /// the session record.
    async fn setup_session(
        &self,
        session: &mut Session,
        request: &pb::StartSessionRequest,
    ) -> Result<(), Status> {
        if request
            .machine
            .as_ref()
            .and_then(|m| m.machine_oneof.as_ref())
            .is_none()
        {
            return Err(Status::invalid_argument("missing initial machine config"));
        }
        session.check_epoch_index_overflow()?;
        if request.server_deadline.is_none() {
            return Err(Status::invalid_argument("missing server deadline config"));
        }
        session.deadlines.validate()?;
        if request.server_cycles.is_none() {
            return Err(Status::invalid_argument("missing server cycles config"));
        }
        session.cycles.validate()?;

        let receiver = self.checkin_slots.register(&session.id);
        let process = match self
            .launcher
            .launch(&session.id, &self.manager_address, &self.worker_address)
        {
            Ok(process) => process,
            Err(status) => {
                self.checkin_slots.cancel(&session.id);
                return Err(status);
            }
        };
        session.worker_process = Some(process);
        let address = match tokio::time::timeout(session.deadlines.checkin, receiver).await {
            Ok(Ok(address)) => address,
            Ok(Err(_)) => return Err(Status::internal("check-in slot dropped")),
            Err(_) => {
                self.checkin_slots.cancel(&session.id);
                return Err(Status::deadline_exceeded(
                    "spawned worker did not check in",
                ));
            }
        };
        tracing::info!(session_id = %session.id, address = %address, "worker checked in");
        session.server_address = address.clone();
        let worker = WorkerClient::connect(&address, session.deadlines).await?;
        session.worker = Some(worker.clone());

        let result = self.handshake(session, &worker, request).await;
        if result.is_err() {
            // Best-effort shutdown of the half-configured worker.
            if let Err(err) = worker.shutdown().await {
                tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "failed shutting down worker after aborted session start"
                );
            }
        }
        result
    }

    async fn handshake(
        &self,
        session: &mut Session,
        worker: &WorkerClient,
        request: &pb::StartSessionRequest,
    ) -> Result<(), Status> {
        tracing::debug!(session_id = %session.id, "checking worker version");
        let version = worker.get_version().await?;
        if version.major != MACHINE_VERSION_MAJOR || version.minor != MACHINE_VERSION_MINOR {
            return Err(Status::failed_precondition(
                "manager is incompatible with machine server",
            ));
        }
        tracing::debug!(session_id = %session.id, "instantiating machine");
        let machine = request
            .machine
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing initial machine config"))?;
        worker.machine(machine).await?;
        tracing::debug!(session_id = %session.id, "getting initial config");
        let config = worker.get_initial_config().await?;
        let htif = config.htif.clone().unwrap_or_default();
        if !htif.yield_manual {
            return Err(Status::invalid_argument("yield manual must be enabled"));
        }
        if !htif.yield_automatic {
            return Err(Status::invalid_argument("yield automatic must be enabled"));
        }
        if htif.console_getchar {
            return Err(Status::invalid_argument("console getchar must be disabled"));
        }
        // The machine may have started at mcycle != 0; cycle budgets are
        // counted from here.
        session.current_mcycle = config.processor.as_ref().map(|p| p.mcycle).unwrap_or(0);
        let rollup = config
            .rollup
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing server rollup config"))?;
        session.memory_ranges = MemoryRanges {
            tx_buffer: MemoryRangeDescription::check(
                "tx buffer",
                &rollup.tx_buffer.clone().unwrap_or_default(),
            )?,
            rx_buffer: MemoryRangeDescription::check(
                "rx buffer",
                &rollup.rx_buffer.clone().unwrap_or_default(),
            )?,
            input_metadata: MemoryRangeDescription::check(
                "input metadata",
                &rollup.input_metadata.clone().unwrap_or_default(),
            )?,
            voucher_hashes: MemoryRangeDescription::check(
                "voucher hashes",
                &rollup.voucher_hashes.clone().unwrap_or_default(),
            )?,
            notice_hashes: MemoryRangeDescription::check(
                "notice hashes",
                &rollup.notice_hashes.clone().unwrap_or_default(),
            )?,
        };
        worker.update_merkle_tree().await?;
        Ok(())
    }
}

#[tonic::async_trait]
impl RollupMachineManager for ManagerService {
    async fn get_version(
        &self,
        _: Request<pb::Void>,
    ) -> Result<Response<pb::GetVersionResponse>, Status> {
        tracing::info!("received get_version");
        Ok(Response::new(pb::GetVersionResponse {
            version: Some(pb::SemanticVersion::manager()),
        }))
    }

    async fn get_status(
        &self,
        _: Request<pb::Void>,
    ) -> Result<Response<pb::GetStatusResponse>, Status> {
        tracing::info!("received get_status");
        Ok(Response::new(pb::GetStatusResponse {
            session_id: self.sessions.ids(),
        }))
    }

    async fn start_session(
        &self,
        request: Request<pb::StartSessionRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        let request = request.into_inner();
        tracing::info!(session_id = %request.session_id, "received start_session");
        if request.session_id.is_empty() {
            return Err(Status::invalid_argument("session id is empty"));
        }
        let deadlines = request
            .server_deadline
            .as_ref()
            .map(DeadlineConfig::from_proto)
            .unwrap_or_default();
        let cycles = request
            .server_cycles
            .as_ref()
            .map(CyclesConfig::from_proto)
            .unwrap_or_default();
        let session = Session::new(
            request.session_id.clone(),
            request.active_epoch_index,
            deadlines,
            cycles,
        )
        .map_err(|e| Status::internal(format!("failed creating session ({e})")))?;
        // The record is inserted before validation so a concurrent duplicate
        // start observes ALREADY_EXISTS; every failure path removes it.
        let (_entry, mut session) = self.sessions.try_insert(session)?;
        let result = self.setup_session(&mut session, &request).await;
        drop(session);
        match result {
            Ok(()) => Ok(Response::new(pb::Void {})),
            Err(status) => {
                self.sessions.remove(&request.session_id);
                Err(status)
            }
        }
    }

    async fn end_session(
        &self,
        request: Request<pb::EndSessionRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        let request = request.into_inner();
        tracing::info!(session_id = %request.session_id, "received end_session");
        let entry = self.sessions.get(&request.session_id)?;
        let session = entry.try_lock()?;
        if !session.is_tainted() {
            // A healthy session may only end with a pristine active epoch.
            let epoch = session
                .epochs
                .get(&session.active_epoch_index)
                .ok_or_else(|| Status::internal("active epoch not found"))?;
            if !epoch.pending_inputs.is_empty() {
                return Err(Status::invalid_argument("active epoch has pending inputs"));
            }
            if !epoch.processed_inputs.is_empty() {
                return Err(Status::invalid_argument(
                    "active epoch has processed inputs",
                ));
            }
        }
        if session.processing_lock {
            return Err(Status::internal("session is processing inputs"));
        }
        let worker = session.worker()?;
        if session.is_tainted() {
            if let Err(err) = worker.shutdown().await {
                tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "shutdown of tainted worker failed; killing its process group"
                );
            }
            session.terminate_worker_process();
        } else {
            worker.shutdown().await?;
        }
        self.sessions.remove(&session.id);
        Ok(Response::new(pb::Void {}))
    }

    async fn get_session_status(
        &self,
        request: Request<pb::GetSessionStatusRequest>,
    ) -> Result<Response<pb::GetSessionStatusResponse>, Status> {
        let request = request.into_inner();
        tracing::info!(session_id = %request.session_id, "received get_session_status");
        let entry = self.sessions.get(&request.session_id)?;
        let session = entry.try_lock()?;
        Ok(Response::new(pb::GetSessionStatusResponse {
            session_id: session.id.clone(),
            active_epoch_index: session.active_epoch_index,
            epoch_index: session.epochs.keys().copied().collect(),
            taint_status: session.taint_status(),
        }))
    }

    async fn get_epoch_status(
        &self,
        request: Request<pb::GetEpochStatusRequest>,
    ) -> Result<Response<pb::GetEpochStatusResponse>, Status> {
        let request = request.into_inner();
        tracing::info!(
            session_id = %request.session_id,
            epoch_index = request.epoch_index,
            "received get_epoch_status"
        );
        let entry = self.sessions.get(&request.session_id)?;
        let session = entry.try_lock()?;
        let epoch = session
            .epochs
            .get(&request.epoch_index)
            .ok_or_else(|| Status::invalid_argument("unknown epoch index"))?;
        Ok(Response::new(pb::GetEpochStatusResponse {
            session_id: session.id.clone(),
            epoch_index: epoch.epoch_index,
            state: match epoch.state {
                EpochState::Active => pb::EpochState::Active as i32,
                EpochState::Finished => pb::EpochState::Finished as i32,
            },
            processed_inputs: epoch
                .processed_inputs
                .iter()
                .map(processed_input_to_proto)
                .collect(),
            pending_input_count: epoch.pending_inputs.len() as u64,
            taint_status: session.taint_status(),
        }))
    }

    async fn advance_state(
        &self,
        request: Request<pb::AdvanceStateRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        let request = request.into_inner();
        tracing::info!(
            session_id = %request.session_id,
            epoch_index = request.active_epoch_index,
            input_index = request.current_input_index,
            "received advance_state"
        );
        let entry = self.sessions.get(&request.session_id)?;
        let run_engine = {
            let mut session = entry.try_lock()?;
            session.check_epoch_index_overflow()?;
            session.check_tainted()?;
            if session.active_epoch_index != request.active_epoch_index {
                return Err(Status::invalid_argument(format!(
                    "incorrect active epoch index (expected {}, got {})",
                    session.active_epoch_index, request.active_epoch_index
                )));
            }
            let rx_buffer_length = session.memory_ranges.rx_buffer.length;
            let epoch = session.active_epoch_mut()?;
            if epoch.state != EpochState::Active {
                return Err(Status::invalid_argument("epoch is finished"));
            }
            let current_input_index = epoch.current_input_index();
            if current_input_index != request.current_input_index {
                return Err(Status::invalid_argument(format!(
                    "incorrect current input index (expected {current_input_index}, got {})",
                    request.current_input_index
                )));
            }
            if request.input_metadata.len() != INPUT_METADATA_LENGTH {
                return Err(Status::invalid_argument(format!(
                    "input metadata wrong size (expected {INPUT_METADATA_LENGTH} bytes, got {} bytes)",
                    request.input_metadata.len()
                )));
            }
            if request.input_payload.len() as u64 >= rx_buffer_length {
                return Err(Status::invalid_argument(format!(
                    "input payload too long for rx buffer length (expected {rx_buffer_length} bytes max, got {} bytes)",
                    request.input_payload.len()
                )));
            }
            let mut metadata = [0u8; INPUT_METADATA_LENGTH];
            metadata.copy_from_slice(&request.input_metadata);
            epoch.pending_inputs.push_back(Input {
                metadata,
                payload: request.input_payload,
            });
            // The enqueue that makes the queue non-empty owns the drain.
            epoch.pending_inputs.len() == 1
        };
        if run_engine {
            tokio::spawn(engine::process_pending_inputs(
                entry,
                self.checkin_slots.clone(),
            ));
        }
        Ok(Response::new(pb::Void {}))
    }

    async fn finish_epoch(
        &self,
        request: Request<pb::FinishEpochRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        let request = request.into_inner();
        tracing::info!(
            session_id = %request.session_id,
            epoch_index = request.active_epoch_index,
            "received finish_epoch"
        );
        let entry = self.sessions.get(&request.session_id)?;
        let mut session = entry.try_lock()?;
        session.check_epoch_index_overflow()?;
        session.check_tainted()?;
        {
            let epoch = session
                .epochs
                .get(&request.active_epoch_index)
                .ok_or_else(|| Status::invalid_argument("unknown epoch index"))?;
            if epoch.state != EpochState::Active {
                return Err(Status::invalid_argument("epoch already finished"));
            }
            if !epoch.pending_inputs.is_empty() {
                return Err(Status::invalid_argument("epoch still has pending inputs"));
            }
            if epoch.processed_inputs.len() as u64 != request.processed_input_count {
                return Err(Status::invalid_argument(format!(
                    "incorrect processed input count (expected {}, got {})",
                    epoch.processed_inputs.len(),
                    request.processed_input_count
                )));
            }
        }
        // Store before any mutation so a failed store leaves the epoch
        // untouched.
        if !request.storage_directory.is_empty() {
            tracing::info!(
                session_id = %session.id,
                directory = %request.storage_directory,
                "storing worker machine"
            );
            let worker = session.worker()?;
            worker.store(request.storage_directory).await?;
        }
        let epoch = session
            .epochs
            .get_mut(&request.active_epoch_index)
            .ok_or_else(|| Status::internal("epoch disappeared"))?;
        finish_epoch(epoch)?;
        session.start_new_epoch()?;
        Ok(Response::new(pb::Void {}))
    }
}

/// Marks the epoch finished and back-fills every processed input's in-epoch
/// proofs from the now-complete trees.
fn finish_epoch(epoch: &mut Epoch) -> Result<(), Status> {
    epoch.state = EpochState::Finished;
    let Epoch {
        vouchers_tree,
        notices_tree,
        processed_inputs,
        ..
    } = epoch;
    for input in processed_inputs.iter_mut() {
        let address = input.input_index << LOG2_KECCAK_SIZE;
        input.voucher_hashes_in_epoch = vouchers_tree
            .proof(address, LOG2_KECCAK_SIZE)
            .map_err(epoch_proof_status)?;
        input.notice_hashes_in_epoch = notices_tree
            .proof(address, LOG2_KECCAK_SIZE)
            .map_err(epoch_proof_status)?;
    }
    Ok(())
}

fn epoch_proof_status(error: MerkleError) -> Status {
    Status::internal(format!(
        "unexpected error when proving epoch merkle tree ({error})"
    ))
}

fn hash_to_proto(hash: &rollup_core::hash::Hash) -> pb::Hash {
    pb::Hash {
        data: hash.to_vec(),
    }
}

fn voucher_to_proto(voucher: &Voucher) -> pb::Voucher {
    pb::Voucher {
        address: Some(hash_to_proto(&voucher.address)),
        payload: voucher.payload.clone(),
        keccak: voucher.hash.as_ref().map(|h| hash_to_proto(&h.keccak)),
        keccak_in_voucher_hashes: voucher
            .hash
            .as_ref()
            .map(|h| proof_to_proto(&h.keccak_in_hashes)),
    }
}

fn notice_to_proto(notice: &Notice) -> pb::Notice {
    pb::Notice {
        payload: notice.payload.clone(),
        keccak: notice.hash.as_ref().map(|h| hash_to_proto(&h.keccak)),
        keccak_in_notice_hashes: notice
            .hash
            .as_ref()
            .map(|h| proof_to_proto(&h.keccak_in_hashes)),
    }
}

fn report_to_proto(report: &Report) -> pb::Report {
    pb::Report {
        payload: report.payload.clone(),
    }
}

fn processed_input_to_proto(input: &ProcessedInput) -> pb::ProcessedInput {
    let processed_oneof = match &input.processed {
        InputProcessing::Result(result) => {
            Some(pb::processed_input::ProcessedOneof::Result(pb::InputResult {
                voucher_hashes_in_machine: Some(proof_to_proto(&result.voucher_hashes_in_machine)),
                vouchers: result.vouchers.iter().map(voucher_to_proto).collect(),
                notice_hashes_in_machine: Some(proof_to_proto(&result.notice_hashes_in_machine)),
                notices: result.notices.iter().map(notice_to_proto).collect(),
            }))
        }
        InputProcessing::Skipped(reason) => Some(pb::processed_input::ProcessedOneof::SkipReason(
            reason.to_proto() as i32,
        )),
    };
    pb::ProcessedInput {
        input_index: input.input_index,
        most_recent_machine_hash: Some(hash_to_proto(&input.most_recent_machine_hash)),
        voucher_hashes_in_epoch: Some(proof_to_proto(&input.voucher_hashes_in_epoch)),
        notice_hashes_in_epoch: Some(proof_to_proto(&input.notice_hashes_in_epoch)),
        reports: input.reports.iter().map(report_to_proto).collect(),
        processed_oneof,
    }
}
