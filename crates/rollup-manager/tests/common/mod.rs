// Copyright (c) 2026 Rollup Machine Manager Contributors
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)] // Shared across the integration test crates; each uses a subset.

//! Test harness: an in-process scripted worker implementing the machine
//! surface, a launcher that stands in for process spawning, and helpers to
//! boot a manager around them.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rollup_core::hash::keccak;
use rollup_core::htif;
use rollup_core::merkle::{pristine_hash, range_tree, Proof};
use rollup_manager::build_services;
use rollup_manager::worker::{proof_to_proto, WorkerLauncher, WorkerProcess};
use rollup_protocol::pb;
use rollup_protocol::pb::machine_check_in_client::MachineCheckInClient;
use rollup_protocol::pb::machine_check_in_server::MachineCheckInServer;
use rollup_protocol::pb::machine_server::{Machine, MachineServer};
use rollup_protocol::pb::rollup_machine_manager_client::RollupMachineManagerClient;
use rollup_protocol::pb::rollup_machine_manager_server::RollupMachineManagerServer;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

pub const RX_START: u64 = 0x9000_0000;
pub const RX_LENGTH: u64 = 1 << 12;
pub const TX_START: u64 = 0x9000_1000;
pub const TX_LENGTH: u64 = 1 << 12;
pub const METADATA_START: u64 = 0x9000_2000;
pub const METADATA_LENGTH: u64 = 1 << 7;
pub const VOUCHER_HASHES_START: u64 = 0x9000_3000;
pub const VOUCHER_HASHES_LENGTH: u64 = 1 << 12;
pub const NOTICE_HASHES_START: u64 = 0x9000_4000;
pub const NOTICE_HASHES_LENGTH: u64 = 1 << 12;

/// One scripted `Run` response.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Automatic yield announcing a voucher in the tx buffer.
    Voucher { address: [u8; 32], payload: Vec<u8> },
    /// Automatic yield announcing a notice in the tx buffer.
    Notice { payload: Vec<u8> },
    /// Automatic yield announcing a report in the tx buffer.
    Report { payload: Vec<u8> },
    /// Manual yield accepting the input.
    Accept,
    /// Manual yield rejecting the input.
    Reject,
    /// Machine halts.
    Halt,
    /// Runs to the requested limit without any event.
    Progress,
    /// Like `Progress`, but answering only after the given delay.
    SleepProgress { millis: u64 },
    /// Manual yield with a reason the manager does not know.
    UnknownManualYield,
    /// Automatic yield with a reason the manager ignores.
    UnknownAutomaticYield,
}

#[derive(Debug)]
pub struct MockState {
    pub version: pb::SemanticVersion,
    pub htif: pb::HtifConfig,
    pub rollup: pb::RollupConfig,
    pub initial_mcycle: u64,
    pub mcycle: u64,
    pub steps: VecDeque<MockStep>,
    pub memory: BTreeMap<u64, u8>,
    pub session_id: Option<String>,
    pub manager_address: Option<String>,
    pub own_address: Option<String>,
    pub stored_directories: Vec<String>,
    pub shutdown_count: usize,
    pub snapshot_count: usize,
    pub rollback_count: usize,
    pub voucher_hash_cursor: u64,
    pub notice_hash_cursor: u64,
    /// Junk entries appended to the voucher hashes range on accept, to force
    /// a count mismatch.
    pub extra_voucher_hashes: usize,
    /// Limits of every `Run` call, in order.
    pub run_limits: Vec<u64>,
}

fn range_config(start: u64, length: u64) -> pb::MemoryRangeConfig {
    pb::MemoryRangeConfig {
        start,
        length,
        shared: false,
        image_filename: String::new(),
    }
}

pub fn default_rollup_config() -> pb::RollupConfig {
    pb::RollupConfig {
        rx_buffer: Some(range_config(RX_START, RX_LENGTH)),
        tx_buffer: Some(range_config(TX_START, TX_LENGTH)),
        input_metadata: Some(range_config(METADATA_START, METADATA_LENGTH)),
        voucher_hashes: Some(range_config(VOUCHER_HASHES_START, VOUCHER_HASHES_LENGTH)),
        notice_hashes: Some(range_config(NOTICE_HASHES_START, NOTICE_HASHES_LENGTH)),
    }
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            version: pb::SemanticVersion {
                major: rollup_protocol::MACHINE_VERSION_MAJOR,
                minor: rollup_protocol::MACHINE_VERSION_MINOR,
                patch: 0,
                pre_release: String::new(),
                build: String::new(),
            },
            htif: pb::HtifConfig {
                yield_manual: true,
                yield_automatic: true,
                console_getchar: false,
            },
            rollup: default_rollup_config(),
            initial_mcycle: 0,
            mcycle: 0,
            steps: VecDeque::new(),
            memory: BTreeMap::new(),
            session_id: None,
            manager_address: None,
            own_address: None,
            stored_directories: Vec::new(),
            shutdown_count: 0,
            snapshot_count: 0,
            rollback_count: 0,
            voucher_hash_cursor: 0,
            notice_hash_cursor: 0,
            extra_voucher_hashes: 0,
            run_limits: Vec::new(),
        }
    }
}

impl MockState {
    fn write_mem(&mut self, address: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.memory.insert(address + i as u64, *byte);
        }
    }

    fn read_mem(&self, address: u64, length: u64) -> Vec<u8> {
        (0..length)
            .map(|i| self.memory.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    fn zero_range(&mut self, start: u64, length: u64) {
        let keys: Vec<u64> = self
            .memory
            .range(start..start + length)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.memory.remove(&key);
        }
        if start == VOUCHER_HASHES_START {
            self.voucher_hash_cursor = 0;
        }
        if start == NOTICE_HASHES_START {
            self.notice_hash_cursor = 0;
        }
    }

    /// Writes a tx entry: the given header words followed by the payload.
    fn write_tx(&mut self, header_words: &[[u8; 32]], payload: &[u8]) {
        let mut offset = TX_START;
        for word in header_words {
            self.write_mem(offset, word);
            offset += 32;
        }
        self.write_mem(offset, payload);
    }
}

fn length_word(length: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..32].copy_from_slice(&length.to_be_bytes());
    word
}

/// Shared handle to the scripted worker state.
#[derive(Debug, Clone, Default)]
pub struct MockHandle(pub Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, steps: Vec<MockStep>) {
        self.0.lock().steps = steps.into();
    }

    pub fn push_steps(&self, steps: Vec<MockStep>) {
        self.0.lock().steps.extend(steps);
    }

    pub fn set_version(&self, major: u32, minor: u32) {
        let mut state = self.0.lock();
        state.version.major = major;
        state.version.minor = minor;
    }

    pub fn set_htif(&self, htif: pb::HtifConfig) {
        self.0.lock().htif = htif;
    }

    pub fn set_rollup(&self, rollup: pb::RollupConfig) {
        self.0.lock().rollup = rollup;
    }

    pub fn set_extra_voucher_hashes(&self, count: usize) {
        self.0.lock().extra_voucher_hashes = count;
    }

    pub fn stored_directories(&self) -> Vec<String> {
        self.0.lock().stored_directories.clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.0.lock().snapshot_count
    }

    pub fn rollback_count(&self) -> usize {
        self.0.lock().rollback_count
    }

    pub fn shutdown_count(&self) -> usize {
        self.0.lock().shutdown_count
    }

    pub fn run_limits(&self) -> Vec<u64> {
        self.0.lock().run_limits.clone()
    }
}

/// In-process worker implementing the machine surface against the scripted
/// state.
#[derive(Debug, Clone)]
pub struct MockMachine {
    handle: MockHandle,
}

async fn send_checkin(manager_address: String, session_id: String, own_address: String) {
    let mut client = match MachineCheckInClient::connect(format!("http://{manager_address}")).await
    {
        Ok(client) => client,
        Err(_) => return,
    };
    let _ = client
        .check_in(pb::CheckInRequest {
            session_id,
            address: own_address,
        })
        .await;
}

impl MockMachine {
    /// Forks are simulated by checking the same worker back in.
    fn spawn_checkin(&self) {
        let (manager_address, session_id, own_address) = {
            let state = self.handle.0.lock();
            (
                state.manager_address.clone(),
                state.session_id.clone(),
                state.own_address.clone(),
            )
        };
        if let (Some(manager), Some(id), Some(own)) = (manager_address, session_id, own_address) {
            tokio::spawn(send_checkin(manager, id, own));
        }
    }

    /// Builds a machine-level proof for an address inside one of the five
    /// ranges: real siblings inside the range, pristine padding above it.
    fn proof_for(&self, address: u64, log2_size: u64) -> Result<Proof, Status> {
        let state = self.handle.0.lock();
        let ranges = [
            (RX_START, RX_LENGTH),
            (TX_START, TX_LENGTH),
            (METADATA_START, METADATA_LENGTH),
            (VOUCHER_HASHES_START, VOUCHER_HASHES_LENGTH),
            (NOTICE_HASHES_START, NOTICE_HASHES_LENGTH),
        ];
        let (start, length) = ranges
            .into_iter()
            .find(|(start, length)| address >= *start && address < start + length)
            .ok_or_else(|| Status::invalid_argument("proof address outside known ranges"))?;
        let range_log2 = 63 - length.leading_zeros();
        let data = state.read_mem(start, length);
        let tree = range_tree(&data, range_log2)
            .map_err(|e| Status::internal(format!("range tree failed ({e})")))?;
        let mut proof = if log2_size == u64::from(range_log2) {
            Proof {
                target_address: start,
                log2_target_size: range_log2,
                target_hash: tree.root_hash(),
                log2_root_size: range_log2,
                root_hash: tree.root_hash(),
                sibling_hashes: Vec::new(),
            }
        } else {
            let mut inner = tree
                .proof(address - start, log2_size as u32)
                .map_err(|e| Status::internal(format!("range proof failed ({e})")))?;
            inner.target_address = address;
            inner
        };
        for level in proof.log2_root_size..64 {
            proof.sibling_hashes.push(pristine_hash(5, level));
        }
        proof.log2_root_size = 64;
        proof.target_address = address;
        proof.root_hash = proof
            .compute_root()
            .map_err(|e| Status::internal(format!("proof extension failed ({e})")))?;
        Ok(proof)
    }
}

#[tonic::async_trait]
impl Machine for MockMachine {
    async fn get_version(
        &self,
        _: Request<pb::Void>,
    ) -> Result<Response<pb::GetVersionResponse>, Status> {
        Ok(Response::new(pb::GetVersionResponse {
            version: Some(self.handle.0.lock().version.clone()),
        }))
    }

    async fn machine(
        &self,
        _request: Request<pb::MachineRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        Ok(Response::new(pb::Void {}))
    }

    async fn get_initial_config(
        &self,
        _: Request<pb::Void>,
    ) -> Result<Response<pb::GetInitialConfigResponse>, Status> {
        let state = self.handle.0.lock();
        Ok(Response::new(pb::GetInitialConfigResponse {
            config: Some(pb::MachineConfig {
                processor: Some(pb::ProcessorConfig {
                    mcycle: state.initial_mcycle,
                }),
                htif: Some(state.htif.clone()),
                rollup: Some(state.rollup.clone()),
            }),
        }))
    }

    async fn run(
        &self,
        request: Request<pb::RunRequest>,
    ) -> Result<Response<pb::RunResponse>, Status> {
        let limit = request.into_inner().limit;
        let step = {
            let mut state = self.handle.0.lock();
            state.run_limits.push(limit);
            state.steps.pop_front().unwrap_or(MockStep::Progress)
        };
        let response = match step {
            MockStep::Progress => {
                let mut state = self.handle.0.lock();
                state.mcycle = limit;
                pb::RunResponse {
                    mcycle: limit,
                    tohost: 0,
                    iflags_h: false,
                    iflags_y: false,
                    iflags_x: false,
                }
            }
            MockStep::SleepProgress { millis } => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                let mut state = self.handle.0.lock();
                state.mcycle = limit;
                pb::RunResponse {
                    mcycle: limit,
                    tohost: 0,
                    iflags_h: false,
                    iflags_y: false,
                    iflags_x: false,
                }
            }
            MockStep::Accept => {
                let mut state = self.handle.0.lock();
                state.mcycle += 1;
                if state.extra_voucher_hashes > 0 {
                    let cursor = state.voucher_hash_cursor;
                    for extra in 0..state.extra_voucher_hashes as u64 {
                        let junk = keccak(&extra.to_be_bytes());
                        state.write_mem(VOUCHER_HASHES_START + (cursor + extra) * 32, &junk);
                    }
                    state.voucher_hash_cursor += state.extra_voucher_hashes as u64;
                }
                pb::RunResponse {
                    mcycle: state.mcycle,
                    tohost: htif::encode_yield_reason(htif::YIELD_REASON_RX_ACCEPTED),
                    iflags_h: false,
                    iflags_y: true,
                    iflags_x: false,
                }
            }
            MockStep::Reject => {
                let mut state = self.handle.0.lock();
                state.mcycle += 1;
                pb::RunResponse {
                    mcycle: state.mcycle,
                    tohost: htif::encode_yield_reason(htif::YIELD_REASON_RX_REJECTED),
                    iflags_h: false,
                    iflags_y: true,
                    iflags_x: false,
                }
            }
            MockStep::Halt => {
                let mut state = self.handle.0.lock();
                state.mcycle += 1;
                pb::RunResponse {
                    mcycle: state.mcycle,
                    tohost: 0,
                    iflags_h: true,
                    iflags_y: false,
                    iflags_x: false,
                }
            }
            MockStep::UnknownManualYield => {
                let mut state = self.handle.0.lock();
                state.mcycle += 1;
                pb::RunResponse {
                    mcycle: state.mcycle,
                    tohost: htif::encode_yield_reason(99),
                    iflags_h: false,
                    iflags_y: true,
                    iflags_x: false,
                }
            }
            MockStep::UnknownAutomaticYield => {
                let mut state = self.handle.0.lock();
                state.mcycle += 1;
                pb::RunResponse {
                    mcycle: state.mcycle,
                    tohost: htif::encode_yield_reason(htif::YIELD_REASON_PROGRESS),
                    iflags_h: false,
                    iflags_y: false,
                    iflags_x: true,
                }
            }
            MockStep::Voucher { address, payload } => {
                let mut state = self.handle.0.lock();
                state.mcycle += 1;
                state.write_tx(
                    &[address, [0u8; 32], length_word(payload.len() as u64)],
                    &payload,
                );
                let cursor = state.voucher_hash_cursor;
                let hash = keccak(&payload);
                state.write_mem(VOUCHER_HASHES_START + cursor * 32, &hash);
                state.voucher_hash_cursor += 1;
                pb::RunResponse {
                    mcycle: state.mcycle,
                    tohost: htif::encode_yield_reason(htif::YIELD_REASON_TX_VOUCHER),
                    iflags_h: false,
                    iflags_y: false,
                    iflags_x: true,
                }
            }
            MockStep::Notice { payload } => {
                let mut state = self.handle.0.lock();
                state.mcycle += 1;
                state.write_tx(&[[0u8; 32], length_word(payload.len() as u64)], &payload);
                let cursor = state.notice_hash_cursor;
                let hash = keccak(&payload);
                state.write_mem(NOTICE_HASHES_START + cursor * 32, &hash);
                state.notice_hash_cursor += 1;
                pb::RunResponse {
                    mcycle: state.mcycle,
                    tohost: htif::encode_yield_reason(htif::YIELD_REASON_TX_NOTICE),
                    iflags_h: false,
                    iflags_y: false,
                    iflags_x: true,
                }
            }
            MockStep::Report { payload } => {
                let mut state = self.handle.0.lock();
                state.mcycle += 1;
                state.write_tx(&[[0u8; 32], length_word(payload.len() as u64)], &payload);
                pb::RunResponse {
                    mcycle: state.mcycle,
                    tohost: htif::encode_yield_reason(htif::YIELD_REASON_TX_REPORT),
                    iflags_h: false,
                    iflags_y: false,
                    iflags_x: true,
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn read_memory(
        &self,
        request: Request<pb::ReadMemoryRequest>,
    ) -> Result<Response<pb::ReadMemoryResponse>, Status> {
        let request = request.into_inner();
        let data = self.handle.0.lock().read_mem(request.address, request.length);
        Ok(Response::new(pb::ReadMemoryResponse { data }))
    }

    async fn write_memory(
        &self,
        request: Request<pb::WriteMemoryRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        let request = request.into_inner();
        self.handle
            .0
            .lock()
            .write_mem(request.address, &request.data);
        Ok(Response::new(pb::Void {}))
    }

    async fn replace_memory_range(
        &self,
        request: Request<pb::ReplaceMemoryRangeRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        let config = request
            .into_inner()
            .config
            .ok_or_else(|| Status::invalid_argument("missing range config"))?;
        self.handle.0.lock().zero_range(config.start, config.length);
        Ok(Response::new(pb::Void {}))
    }

    async fn get_proof(
        &self,
        request: Request<pb::GetProofRequest>,
    ) -> Result<Response<pb::GetProofResponse>, Status> {
        let request = request.into_inner();
        let proof = self.proof_for(request.address, request.log2_size)?;
        Ok(Response::new(pb::GetProofResponse {
            proof: Some(proof_to_proto(&proof)),
        }))
    }

    async fn get_root_hash(
        &self,
        _: Request<pb::Void>,
    ) -> Result<Response<pb::GetRootHashResponse>, Status> {
        let mcycle = self.handle.0.lock().mcycle;
        Ok(Response::new(pb::GetRootHashResponse {
            hash: Some(pb::Hash {
                data: keccak(&mcycle.to_be_bytes()).to_vec(),
            }),
        }))
    }

    async fn update_merkle_tree(
        &self,
        _: Request<pb::Void>,
    ) -> Result<Response<pb::UpdateMerkleTreeResponse>, Status> {
        Ok(Response::new(pb::UpdateMerkleTreeResponse { success: true }))
    }

    async fn snapshot(&self, _: Request<pb::Void>) -> Result<Response<pb::Void>, Status> {
        self.handle.0.lock().snapshot_count += 1;
        self.spawn_checkin();
        Ok(Response::new(pb::Void {}))
    }

    async fn rollback(&self, _: Request<pb::Void>) -> Result<Response<pb::Void>, Status> {
        self.handle.0.lock().rollback_count += 1;
        self.spawn_checkin();
        Ok(Response::new(pb::Void {}))
    }

    async fn reset_iflags_y(&self, _: Request<pb::Void>) -> Result<Response<pb::Void>, Status> {
        Ok(Response::new(pb::Void {}))
    }

    async fn store(
        &self,
        request: Request<pb::StoreRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        self.handle
            .0
            .lock()
            .stored_directories
            .push(request.into_inner().directory);
        Ok(Response::new(pb::Void {}))
    }

    async fn shutdown(&self, _: Request<pb::Void>) -> Result<Response<pb::Void>, Status> {
        self.handle.0.lock().shutdown_count += 1;
        Ok(Response::new(pb::Void {}))
    }
}

/// Launcher that boots the in-process worker instead of spawning a binary.
pub struct MockLauncher {
    pub handle: MockHandle,
}

impl WorkerLauncher for MockLauncher {
    fn launch(
        &self,
        session_id: &str,
        checkin_address: &str,
        _server_address: &str,
    ) -> Result<WorkerProcess, Status> {
        let handle = self.handle.clone();
        let session_id = session_id.to_string();
        let checkin_address = checkin_address.to_string();
        tokio::spawn(async move {
            let listener = match TcpListener::bind("127.0.0.1:0").await {
                Ok(listener) => listener,
                Err(_) => return,
            };
            let own_address = match listener.local_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => return,
            };
            {
                let mut state = handle.0.lock();
                state.session_id = Some(session_id.clone());
                state.manager_address = Some(checkin_address.clone());
                state.own_address = Some(own_address.clone());
            }
            let machine = MockMachine {
                handle: handle.clone(),
            };
            tokio::spawn(async move {
                let _ = tonic::transport::Server::builder()
                    .add_service(MachineServer::new(machine))
                    .serve_with_incoming(TcpListenerStream::new(listener))
                    .await;
            });
            send_checkin(checkin_address, session_id, own_address).await;
        });
        Ok(WorkerProcess::Detached)
    }
}

pub type ManagerClient = RollupMachineManagerClient<Channel>;

pub struct TestManager {
    pub client: ManagerClient,
    pub mock: MockHandle,
    pub addr: SocketAddr,
}

/// Boots a manager whose sessions are backed by the scripted worker.
pub async fn start_manager(mock: MockHandle) -> TestManager {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let launcher = Arc::new(MockLauncher {
        handle: mock.clone(),
    });
    let (manager, checkin) =
        build_services(launcher, addr.to_string(), "127.0.0.1:0".to_string());
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(RollupMachineManagerServer::new(manager))
            .add_service(MachineCheckInServer::new(checkin))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });
    let client = RollupMachineManagerClient::connect(format!("http://{addr}"))
        .await
        .expect("connect");
    TestManager { client, mock, addr }
}

pub fn default_deadlines() -> pb::DeadlineConfig {
    pb::DeadlineConfig {
        checkin: 5_000,
        update_merkle_tree: 2_000,
        advance_state: 4_000,
        advance_state_increment: 2_000,
        inspect_state: 4_000,
        inspect_state_increment: 2_000,
        machine: 2_000,
        store: 2_000,
        fast: 2_000,
    }
}

pub fn default_cycles() -> pb::CyclesConfig {
    pb::CyclesConfig {
        max_advance_state: 1 << 20,
        advance_state_increment: 1 << 16,
        max_inspect_state: 1 << 20,
        inspect_state_increment: 1 << 16,
    }
}

pub fn machine_config_request() -> pb::MachineRequest {
    pb::MachineRequest {
        machine_oneof: Some(pb::machine_request::MachineOneof::Config(
            pb::MachineConfig::default(),
        )),
    }
}

pub fn start_session_request(session_id: &str) -> pb::StartSessionRequest {
    pb::StartSessionRequest {
        session_id: session_id.to_string(),
        machine: Some(machine_config_request()),
        active_epoch_index: 0,
        server_deadline: Some(default_deadlines()),
        server_cycles: Some(default_cycles()),
    }
}

pub fn zero_metadata() -> Vec<u8> {
    vec![0u8; 128]
}

/// Enqueues an input, retrying while the engine briefly holds the session
/// lock.
pub async fn advance(
    client: &mut ManagerClient,
    session_id: &str,
    epoch: u64,
    input_index: u64,
    payload: Vec<u8>,
) -> Result<(), Status> {
    for _ in 0..200 {
        let result = client
            .advance_state(pb::AdvanceStateRequest {
                session_id: session_id.to_string(),
                active_epoch_index: epoch,
                current_input_index: input_index,
                input_metadata: zero_metadata(),
                input_payload: payload.clone(),
            })
            .await;
        match result {
            Ok(_) => return Ok(()),
            Err(status) if status.code() == tonic::Code::Aborted => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(status) => return Err(status),
        }
    }
    Err(Status::aborted("session stayed locked"))
}

/// Polls the epoch status until all inputs are processed.
pub async fn wait_for_processed(
    client: &mut ManagerClient,
    session_id: &str,
    epoch: u64,
    count: usize,
) -> pb::GetEpochStatusResponse {
    for _ in 0..400 {
        let response = client
            .get_epoch_status(pb::GetEpochStatusRequest {
                session_id: session_id.to_string(),
                epoch_index: epoch,
            })
            .await;
        if let Ok(response) = response {
            let status = response.into_inner();
            if status.processed_inputs.len() >= count && status.pending_input_count == 0 {
                return status;
            }
            if status.taint_status.is_some() {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {count} processed inputs");
}

/// Polls the session status until it reports a taint.
pub async fn wait_for_taint(client: &mut ManagerClient, session_id: &str) -> pb::TaintStatus {
    for _ in 0..400 {
        let response = client
            .get_session_status(pb::GetSessionStatusRequest {
                session_id: session_id.to_string(),
            })
            .await;
        if let Ok(response) = response {
            if let Some(taint) = response.into_inner().taint_status {
                return taint;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for session taint");
}
