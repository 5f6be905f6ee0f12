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

//! Typed, deadline-scoped client for the worker machine surface, and the
//! launcher that spawns worker processes.

use std::future::Future;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use rollup_core::hash::Hash;
use rollup_core::merkle::Proof;
use rollup_core::tx::hash_from_slice;
use rollup_protocol::pb;
use rollup_protocol::pb::machine_client::MachineClient;
use tonic::transport::Channel;
use tonic::{Response, Status};

use crate::config::DeadlineConfig;

/// Runs a worker call under a wall-clock deadline. Expiry is reported as
/// `DEADLINE_EXCEEDED`, which the caller treats like any other worker
/// failure.
async fn with_deadline<T, F>(deadline: Duration, future: F) -> Result<T, Status>
where
    F: Future<Output = Result<Response<T>, Status>>,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(status),
        Err(_) => Err(Status::deadline_exceeded("worker call exceeded deadline")),
    }
}

fn hash_from_proto(hash: Option<&pb::Hash>) -> Result<Hash, Status> {
    let hash = hash.ok_or_else(|| Status::out_of_range("missing hash"))?;
    hash_from_slice(&hash.data).map_err(|_| Status::out_of_range("invalid hash length"))
}

pub fn proof_from_proto(proof: &pb::MerkleTreeProof) -> Result<Proof, Status> {
    let log2_target_size = u32::try_from(proof.log2_target_size)
        .map_err(|_| Status::out_of_range("invalid proof target size"))?;
    let log2_root_size = u32::try_from(proof.log2_root_size)
        .map_err(|_| Status::out_of_range("invalid proof root size"))?;
    let mut sibling_hashes = Vec::with_capacity(proof.sibling_hashes.len());
    for sibling in &proof.sibling_hashes {
        sibling_hashes.push(hash_from_proto(Some(sibling))?);
    }
    Ok(Proof {
        target_address: proof.target_address,
        log2_target_size,
        target_hash: hash_from_proto(proof.target_hash.as_ref())?,
        log2_root_size,
        root_hash: hash_from_proto(proof.root_hash.as_ref())?,
        sibling_hashes,
    })
}

pub fn proof_to_proto(proof: &Proof) -> pb::MerkleTreeProof {
    pb::MerkleTreeProof {
        target_address: proof.target_address,
        log2_target_size: u64::from(proof.log2_target_size),
        target_hash: Some(pb::Hash {
            data: proof.target_hash.to_vec(),
        }),
        log2_root_size: u64::from(proof.log2_root_size),
        root_hash: Some(pb::Hash {
            data: proof.root_hash.to_vec(),
        }),
        sibling_hashes: proof
            .sibling_hashes
            .iter()
            .map(|hash| pb::Hash {
                data: hash.to_vec(),
            })
            .collect(),
    }
}

/// Connection to one worker machine server. Every call carries a deadline
/// selected from the session's deadline config.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    inner: MachineClient<Channel>,
    deadlines: DeadlineConfig,
}

impl WorkerClient {
    pub async fn connect(address: &str, deadlines: DeadlineConfig) -> Result<Self, Status> {
        let endpoint = format!("http://{address}");
        let inner = MachineClient::connect(endpoint).await.map_err(|e| {
            Status::internal(format!("unable to connect to worker at {address} ({e})"))
        })?;
        Ok(Self { inner, deadlines })
    }

    pub async fn get_version(&self) -> Result<pb::SemanticVersion, Status> {
        let mut client = self.inner.clone();
        let response = with_deadline(self.deadlines.fast, client.get_version(pb::Void {})).await?;
        response
            .version
            .ok_or_else(|| Status::internal("worker reported no version"))
    }

    pub async fn machine(&self, request: pb::MachineRequest) -> Result<(), Status> {
        let mut client = self.inner.clone();
        with_deadline(self.deadlines.machine, client.machine(request)).await?;
        Ok(())
    }

    pub async fn get_initial_config(&self) -> Result<pb::MachineConfig, Status> {
        let mut client = self.inner.clone();
        let response =
            with_deadline(self.deadlines.fast, client.get_initial_config(pb::Void {})).await?;
        response
            .config
            .ok_or_else(|| Status::internal("worker reported no machine config"))
    }

    pub async fn run(&self, limit: u64) -> Result<pb::RunResponse, Status> {
        let mut client = self.inner.clone();
        with_deadline(
            self.deadlines.advance_state_increment,
            client.run(pb::RunRequest { limit }),
        )
        .await
    }

    pub async fn read_memory(&self, address: u64, length: u64) -> Result<Vec<u8>, Status> {
        let mut client = self.inner.clone();
        let response = with_deadline(
            self.deadlines.fast,
            client.read_memory(pb::ReadMemoryRequest { address, length }),
        )
        .await?;
        if response.data.len() as u64 != length {
            return Err(Status::internal("read returned wrong number of bytes"));
        }
        Ok(response.data)
    }

    pub async fn write_memory(&self, address: u64, data: Vec<u8>) -> Result<(), Status> {
        let mut client = self.inner.clone();
        with_deadline(
            self.deadlines.fast,
            client.write_memory(pb::WriteMemoryRequest { address, data }),
        )
        .await?;
        Ok(())
    }

    pub async fn replace_memory_range(&self, config: pb::MemoryRangeConfig) -> Result<(), Status> {
        let mut client = self.inner.clone();
        with_deadline(
            self.deadlines.fast,
            client.replace_memory_range(pb::ReplaceMemoryRangeRequest {
                config: Some(config),
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn get_proof(&self, address: u64, log2_size: u64) -> Result<Proof, Status> {
        let mut client = self.inner.clone();
        let response = with_deadline(
            self.deadlines.fast,
            client.get_proof(pb::GetProofRequest { address, log2_size }),
        )
        .await?;
        let proof = response
            .proof
            .ok_or_else(|| Status::internal("worker returned no proof"))?;
        proof_from_proto(&proof)
    }

    pub async fn get_root_hash(&self) -> Result<Hash, Status> {
        let mut client = self.inner.clone();
        let response =
            with_deadline(self.deadlines.fast, client.get_root_hash(pb::Void {})).await?;
        hash_from_proto(response.hash.as_ref())
    }

    pub async fn update_merkle_tree(&self) -> Result<(), Status> {
        let mut client = self.inner.clone();
        let response = with_deadline(
            self.deadlines.update_merkle_tree,
            client.update_merkle_tree(pb::Void {}),
        )
        .await?;
        if !response.success {
            return Err(Status::internal("failed updating merkle tree"));
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<(), Status> {
        let mut client = self.inner.clone();
        with_deadline(self.deadlines.fast, client.snapshot(pb::Void {})).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), Status> {
        let mut client = self.inner.clone();
        with_deadline(self.deadlines.fast, client.rollback(pb::Void {})).await?;
        Ok(())
    }

    pub async fn reset_iflags_y(&self) -> Result<(), Status> {
        let mut client = self.inner.clone();
        with_deadline(self.deadlines.fast, client.reset_iflags_y(pb::Void {})).await?;
        Ok(())
    }

    pub async fn store(&self, directory: String) -> Result<(), Status> {
        let mut client = self.inner.clone();
        with_deadline(
            self.deadlines.store,
            client.store(pb::StoreRequest { directory }),
        )
        .await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), Status> {
        let mut client = self.inner.clone();
        with_deadline(self.deadlines.fast, client.shutdown(pb::Void {})).await?;
        Ok(())
    }
}

/// Handle to the operating-system side of a worker.
#[derive(Debug)]
pub enum WorkerProcess {
    /// Process group of a spawned worker binary.
    Group(Pid),
    /// Worker not owned through a process handle (in-process test workers).
    Detached,
}

impl WorkerProcess {
    /// Force-kills the worker's whole process group. Errors are logged and
    /// swallowed; the group may already be gone.
    pub fn terminate(&self) {
        if let WorkerProcess::Group(pgid) = self {
            match killpg(*pgid, Signal::SIGKILL) {
                Ok(()) => tracing::info!(pgid = %pgid, "terminated worker process group"),
                Err(err) => {
                    tracing::warn!(pgid = %pgid, error = %err, "failed terminating worker process group");
                }
            }
        }
    }
}

/// Spawns the worker that backs a session. The production implementation
/// execs the machine-server binary; tests substitute an in-process worker.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        session_id: &str,
        checkin_address: &str,
        server_address: &str,
    ) -> Result<WorkerProcess, Status>;
}

/// Launches the machine-server binary in a new process group, telling it
/// where to bind and where to check in.
#[derive(Debug, Clone)]
pub struct SpawnedWorkerLauncher {
    command: PathBuf,
}

impl SpawnedWorkerLauncher {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

impl WorkerLauncher for SpawnedWorkerLauncher {
    fn launch(
        &self,
        session_id: &str,
        checkin_address: &str,
        server_address: &str,
    ) -> Result<WorkerProcess, Status> {
        use std::os::unix::process::CommandExt;

        tracing::info!(
            command = %self.command.display(),
            session_id,
            server_address,
            "spawning worker"
        );
        let child = Command::new(&self.command)
            .arg(format!("--session-id={session_id}"))
            .arg(format!("--checkin-address={checkin_address}"))
            .arg(format!("--server-address={server_address}"))
            .process_group(0)
            .spawn()
            .map_err(|e| {
                Status::internal(format!(
                    "failed spawning worker with command '{}' ({e})",
                    self.command.display()
                ))
            })?;
        Ok(WorkerProcess::Group(Pid::from_raw(child.id() as i32)))
    }
}

/// Reaps exited workers without blocking. Wired to `SIGCHLD`.
pub fn reap_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => tracing::debug!(?status, "reaped worker child"),
        }
    }
}
