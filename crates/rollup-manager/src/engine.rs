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

//! Input-processing engine.
//!
//! The enqueuer that flips the pending queue from empty to one element
//! spawns exactly one engine run for the session. The engine removes inputs
//! only after fully processing them, so later enqueuers observe a non-empty
//! queue and never start a second run. Worker failures taint the session and
//! stop the drain; the session lock is not held across worker calls, so
//! status reads and further enqueues proceed while an input is in flight.

use std::sync::Arc;
use std::time::Instant;

use rollup_core::hash::{Hash, ZERO_HASH};
use rollup_core::htif;
use rollup_core::merkle::{MerkleError, Proof};
use rollup_core::tx::{
    count_null_terminated_entries, decode_payload_length, hash_from_slice, NOTICE_HEADER_LENGTH,
    NOTICE_OFFSET_LENGTH, VOUCHER_ADDRESS_LENGTH, VOUCHER_HEADER_LENGTH, VOUCHER_OFFSET_LENGTH,
};
use rollup_core::{KECCAK_SIZE, LOG2_KECCAK_SIZE};
use tonic::Status;

use crate::checkin::CheckInSlots;
use crate::config::{CyclesConfig, DeadlineConfig};
use crate::session::{
    Input, InputProcessing, InputResult, InputSkipReason, MemoryRangeDescription, MemoryRanges,
    Notice, OutputHash, ProcessedInput, Report, Session, SessionEntry, Voucher,
};
use crate::worker::WorkerClient;

/// Everything one input needs, copied out of the session so no lock is held
/// across worker calls.
struct InputJob {
    session_id: String,
    input: Input,
    input_index: u64,
    worker: WorkerClient,
    deadlines: DeadlineConfig,
    cycles: CyclesConfig,
    ranges: MemoryRanges,
    current_mcycle: u64,
}

enum RunVerdict {
    Accepted { final_mcycle: u64 },
    Skipped(InputSkipReason),
}

struct RunOutput {
    verdict: RunVerdict,
    vouchers: Vec<Voucher>,
    notices: Vec<Notice>,
    reports: Vec<Report>,
}

/// Worker-side results of one input, ready to be committed to the epoch.
enum Harvest {
    Accepted {
        final_mcycle: u64,
        voucher_hashes_in_machine: Proof,
        vouchers: Vec<Voucher>,
        notice_hashes_in_machine: Proof,
        notices: Vec<Notice>,
        reports: Vec<Report>,
        machine_hash: Hash,
    },
    Skipped {
        reason: InputSkipReason,
        reports: Vec<Report>,
        machine_hash: Hash,
    },
}

enum RespawnTrigger {
    Snapshot,
    Rollback,
}

fn merkle_status(error: MerkleError) -> Status {
    Status::internal(format!(
        "unexpected error when updating epoch merkle tree ({error})"
    ))
}

/// Drains the session's pending input queue. Runs as its own task; at most
/// one instance per session is alive at any time.
///
/// Committing an input, removing it from the queue, and deciding whether to
/// continue all happen under one lock acquisition, so an enqueue can never
/// observe an empty queue while this instance is still about to continue.
pub async fn process_pending_inputs(entry: Arc<SessionEntry>, slots: CheckInSlots) {
    let mut job = {
        let mut session = entry.session.lock().await;
        if session.processing_lock {
            session.taint(Status::internal(
                "concurrent input processing detected in session",
            ));
            return;
        }
        session.processing_lock = true;
        match next_job(&mut session) {
            Ok(Some(job)) => job,
            Ok(None) => {
                session.processing_lock = false;
                return;
            }
            Err(status) => {
                session.taint(status);
                session.processing_lock = false;
                return;
            }
        }
    };
    loop {
        tracing::debug!(
            session_id = %job.session_id,
            input_index = job.input_index,
            "processing input"
        );
        let result = process_one_input(&entry, &slots, job).await;
        let mut session = entry.session.lock().await;
        match result {
            Ok((input_index, harvest)) => {
                if let Err(status) = commit_input(&mut session, input_index, harvest) {
                    session.taint(status);
                    session.processing_lock = false;
                    return;
                }
                tracing::debug!(
                    session_id = %session.id,
                    input_index,
                    "done processing input"
                );
                match next_job(&mut session) {
                    Ok(Some(next)) => job = next,
                    Ok(None) => {
                        session.processing_lock = false;
                        return;
                    }
                    Err(status) => {
                        session.taint(status);
                        session.processing_lock = false;
                        return;
                    }
                }
            }
            Err(status) => {
                session.taint(status);
                session.processing_lock = false;
                return;
            }
        }
    }
}

fn next_job(session: &mut Session) -> Result<Option<InputJob>, Status> {
    if session.is_tainted() {
        return Ok(None);
    }
    let worker = session.worker()?;
    let session_id = session.id.clone();
    let deadlines = session.deadlines;
    let cycles = session.cycles;
    let ranges = session.memory_ranges.clone();
    let current_mcycle = session.current_mcycle;
    let epoch = session.active_epoch_mut()?;
    let Some(input) = epoch.pending_inputs.front() else {
        return Ok(None);
    };
    Ok(Some(InputJob {
        session_id,
        input: input.clone(),
        input_index: epoch.processed_inputs.len() as u64,
        worker,
        deadlines,
        cycles,
        ranges,
        current_mcycle,
    }))
}

/// Runs one input against the worker. Every error is a taint; skip verdicts
/// are not errors.
async fn process_one_input(
    entry: &Arc<SessionEntry>,
    slots: &CheckInSlots,
    job: InputJob,
) -> Result<(u64, Harvest), Status> {
    // Snapshot forks the worker; the child checks in with a fresh address.
    let worker = respawn_and_reconnect(entry, slots, &job, &job.worker, RespawnTrigger::Snapshot)
        .await?;
    clear_buffers(&worker, &job.ranges).await?;
    worker
        .write_memory(job.ranges.rx_buffer.start, job.input.payload.clone())
        .await?;
    worker
        .write_memory(job.ranges.input_metadata.start, job.input.metadata.to_vec())
        .await?;
    worker.reset_iflags_y().await?;

    let RunOutput {
        verdict,
        vouchers,
        notices,
        reports,
    } = run_input(&worker, &job).await?;

    match verdict {
        RunVerdict::Accepted { final_mcycle } => {
            worker.update_merkle_tree().await?;
            let (voucher_hashes_in_machine, voucher_hashes) = harvest_hashes(
                &worker,
                &job.ranges.voucher_hashes,
                vouchers.len(),
                "voucher",
            )
            .await?;
            let vouchers = vouchers
                .into_iter()
                .zip(voucher_hashes)
                .map(|(mut voucher, hash)| {
                    voucher.hash = Some(hash);
                    voucher
                })
                .collect();
            let (notice_hashes_in_machine, notice_hashes) =
                harvest_hashes(&worker, &job.ranges.notice_hashes, notices.len(), "notice")
                    .await?;
            let notices = notices
                .into_iter()
                .zip(notice_hashes)
                .map(|(mut notice, hash)| {
                    notice.hash = Some(hash);
                    notice
                })
                .collect();
            let machine_hash = worker.get_root_hash().await?;
            Ok((
                job.input_index,
                Harvest::Accepted {
                    final_mcycle,
                    voucher_hashes_in_machine,
                    vouchers,
                    notice_hashes_in_machine,
                    notices,
                    reports,
                    machine_hash,
                },
            ))
        }
        RunVerdict::Skipped(reason) => {
            tracing::debug!(session_id = %job.session_id, ?reason, "input skipped");
            // Rollback also forks the worker back to the snapshot.
            let worker =
                respawn_and_reconnect(entry, slots, &job, &worker, RespawnTrigger::Rollback)
                    .await?;
            worker.update_merkle_tree().await?;
            let machine_hash = worker.get_root_hash().await?;
            Ok((
                job.input_index,
                Harvest::Skipped {
                    reason,
                    reports,
                    machine_hash,
                },
            ))
        }
    }
}

/// Registers a check-in slot, triggers the operation that makes the worker
/// fork, waits for the replacement to check in, and reconnects.
async fn respawn_and_reconnect(
    entry: &Arc<SessionEntry>,
    slots: &CheckInSlots,
    job: &InputJob,
    worker: &WorkerClient,
    trigger: RespawnTrigger,
) -> Result<WorkerClient, Status> {
    let receiver = slots.register(&job.session_id);
    let triggered = match trigger {
        RespawnTrigger::Snapshot => worker.snapshot().await,
        RespawnTrigger::Rollback => worker.rollback().await,
    };
    if let Err(status) = triggered {
        slots.cancel(&job.session_id);
        return Err(status);
    }
    let address = match tokio::time::timeout(job.deadlines.checkin, receiver).await {
        Ok(Ok(address)) => address,
        Ok(Err(_)) => return Err(Status::internal("check-in slot dropped")),
        Err(_) => {
            slots.cancel(&job.session_id);
            return Err(Status::deadline_exceeded(
                "worker did not check in after respawn",
            ));
        }
    };
    let client = WorkerClient::connect(&address, job.deadlines).await?;
    let mut session = entry.session.lock().await;
    session.server_address = address;
    session.worker = Some(client.clone());
    Ok(client)
}

/// Zeroes the rx buffer, input metadata, and both hashes ranges. The tx
/// buffer is left alone; the machine overwrites it before every yield.
async fn clear_buffers(worker: &WorkerClient, ranges: &MemoryRanges) -> Result<(), Status> {
    for range in [
        &ranges.rx_buffer,
        &ranges.input_metadata,
        &ranges.voucher_hashes,
        &ranges.notice_hashes,
    ] {
        worker.replace_memory_range(range.config.clone()).await?;
    }
    Ok(())
}

/// The run loop: advance the machine in cycle increments until it yields a
/// verdict, halts, exhausts its cycle budget, or runs out of wall clock.
async fn run_input(worker: &WorkerClient, job: &InputJob) -> Result<RunOutput, Status> {
    let start = Instant::now();
    let max_mcycle = job
        .current_mcycle
        .saturating_add(job.cycles.max_advance_state);
    let mut current_mcycle = job.current_mcycle;
    let mut vouchers = Vec::new();
    let mut notices = Vec::new();
    let mut reports = Vec::new();
    loop {
        let mut limit = current_mcycle
            .saturating_add(job.cycles.advance_state_increment)
            .min(max_mcycle);
        // Increments within the overall advance budget. A worker that fails
        // to answer one increment within its own deadline is unresponsive
        // and the error taints; the overall budget expiring is only a skip.
        let response = loop {
            tracing::debug!(limit, "running advance state increment");
            let response = worker.run(limit).await?;
            current_mcycle = response.mcycle;
            if response.iflags_y
                || response.iflags_x
                || response.iflags_h
                || response.mcycle >= max_mcycle
            {
                break response;
            }
            if start.elapsed() > job.deadlines.advance_state {
                return Ok(RunOutput {
                    verdict: RunVerdict::Skipped(InputSkipReason::TimeLimitExceeded),
                    vouchers,
                    notices,
                    reports,
                });
            }
            limit = limit
                .saturating_add(job.cycles.advance_state_increment)
                .min(max_mcycle);
        };
        if response.mcycle >= max_mcycle {
            return Ok(RunOutput {
                verdict: RunVerdict::Skipped(InputSkipReason::CycleLimitExceeded),
                vouchers,
                notices,
                reports,
            });
        }
        if response.iflags_h {
            return Ok(RunOutput {
                verdict: RunVerdict::Skipped(InputSkipReason::MachineHalted),
                vouchers,
                notices,
                reports,
            });
        }
        let reason = htif::yield_reason(response.tohost);
        if response.iflags_y {
            if reason == htif::YIELD_REASON_RX_REJECTED {
                return Ok(RunOutput {
                    verdict: RunVerdict::Skipped(InputSkipReason::RequestedByMachine),
                    vouchers,
                    notices,
                    reports,
                });
            }
            if reason == htif::YIELD_REASON_RX_ACCEPTED {
                return Ok(RunOutput {
                    verdict: RunVerdict::Accepted {
                        final_mcycle: current_mcycle,
                    },
                    vouchers,
                    notices,
                    reports,
                });
            }
            return Err(Status::out_of_range("unknown machine yield reason"));
        }
        if !response.iflags_x {
            return Err(Status::internal(
                "machine returned without hitting mcycle limit or yielding",
            ));
        }
        if reason == htif::YIELD_REASON_TX_VOUCHER {
            tracing::debug!(count = vouchers.len(), "reading voucher");
            vouchers.push(read_voucher(worker, &job.ranges.tx_buffer).await?);
        } else if reason == htif::YIELD_REASON_TX_NOTICE {
            tracing::debug!(count = notices.len(), "reading notice");
            notices.push(Notice {
                payload: read_tx_payload(worker, &job.ranges.tx_buffer, "notice").await?,
                hash: None,
            });
        } else if reason == htif::YIELD_REASON_TX_REPORT {
            tracing::debug!(count = reports.len(), "reading report");
            reports.push(Report {
                payload: read_tx_payload(worker, &job.ranges.tx_buffer, "report").await?,
            });
        }
        // Other automatic yield reasons are ignored and the machine resumes.
    }
}

async fn read_voucher(
    worker: &WorkerClient,
    tx_buffer: &MemoryRangeDescription,
) -> Result<Voucher, Status> {
    let header = worker
        .read_memory(tx_buffer.start, VOUCHER_HEADER_LENGTH as u64)
        .await?;
    let address = hash_from_slice(&header[..VOUCHER_ADDRESS_LENGTH])
        .map_err(|_| Status::out_of_range("invalid hash length"))?;
    let length_word = &header[VOUCHER_ADDRESS_LENGTH + VOUCHER_OFFSET_LENGTH..];
    let length =
        decode_payload_length(length_word).map_err(|e| Status::out_of_range(e.to_string()))?;
    if length > tx_buffer.length.saturating_sub(VOUCHER_HEADER_LENGTH as u64) {
        return Err(Status::out_of_range(
            "voucher payload length is out of bounds",
        ));
    }
    let payload = worker
        .read_memory(tx_buffer.start + VOUCHER_HEADER_LENGTH as u64, length)
        .await?;
    Ok(Voucher {
        address,
        payload,
        hash: None,
    })
}

async fn read_tx_payload(
    worker: &WorkerClient,
    tx_buffer: &MemoryRangeDescription,
    what: &str,
) -> Result<Vec<u8>, Status> {
    let header = worker
        .read_memory(tx_buffer.start, NOTICE_HEADER_LENGTH as u64)
        .await?;
    let length = decode_payload_length(&header[NOTICE_OFFSET_LENGTH..])
        .map_err(|e| Status::out_of_range(e.to_string()))?;
    if length > tx_buffer.length.saturating_sub(NOTICE_HEADER_LENGTH as u64) {
        return Err(Status::out_of_range(format!(
            "{what} payload length is out of bounds"
        )));
    }
    worker
        .read_memory(tx_buffer.start + NOTICE_HEADER_LENGTH as u64, length)
        .await
}

/// Reads one hashes memory range: its inclusion proof in the machine, the
/// null-terminated entry count (which must match the yields), and a sliced
/// proof for each 32-byte entry inside the range.
async fn harvest_hashes(
    worker: &WorkerClient,
    range: &MemoryRangeDescription,
    expected: usize,
    what: &str,
) -> Result<(Proof, Vec<OutputHash>), Status> {
    let range_proof = worker
        .get_proof(range.start, u64::from(range.log2_size))
        .await?;
    let data = worker.read_memory(range.start, range.length).await?;
    let count = count_null_terminated_entries(&data, KECCAK_SIZE);
    tracing::debug!(what, count, "counted hash entries");
    if count != expected as u64 {
        return Err(Status::invalid_argument(format!(
            "number of {what}s yielded and non-zero {what} hashes disagree"
        )));
    }
    let mut hashes = Vec::with_capacity(count as usize);
    for entry_index in 0..count {
        let offset = (entry_index as usize) * KECCAK_SIZE;
        let keccak = hash_from_slice(&data[offset..offset + KECCAK_SIZE])
            .map_err(|_| Status::out_of_range("invalid hash length"))?;
        let keccak_in_hashes = worker
            .get_proof(
                range.start + offset as u64,
                u64::from(LOG2_KECCAK_SIZE),
            )
            .await?
            .slice(range.log2_size, LOG2_KECCAK_SIZE)
            .map_err(merkle_status)?;
        hashes.push(OutputHash {
            keccak,
            keccak_in_hashes,
        });
    }
    Ok((range_proof, hashes))
}

/// Appends the input's commitments to the epoch trees and records the
/// processed input. Runs under the session lock.
fn commit_input(session: &mut Session, input_index: u64, harvest: Harvest) -> Result<(), Status> {
    let epoch = session.active_epoch_mut()?;
    if epoch.vouchers_tree.len() as u64 != input_index {
        return Err(Status::internal(
            "inconsistent number of entries in epoch's vouchers Merkle tree",
        ));
    }
    if epoch.notices_tree.len() as u64 != input_index {
        return Err(Status::internal(
            "inconsistent number of entries in epoch's notices Merkle tree",
        ));
    }
    let address = input_index << LOG2_KECCAK_SIZE;
    let mut advance_mcycle = None;
    let processed = match harvest {
        Harvest::Accepted {
            final_mcycle,
            voucher_hashes_in_machine,
            vouchers,
            notice_hashes_in_machine,
            notices,
            reports,
            machine_hash,
        } => {
            epoch
                .vouchers_tree
                .push(voucher_hashes_in_machine.target_hash)
                .map_err(merkle_status)?;
            let voucher_hashes_in_epoch = epoch
                .vouchers_tree
                .proof(address, LOG2_KECCAK_SIZE)
                .map_err(merkle_status)?;
            epoch
                .notices_tree
                .push(notice_hashes_in_machine.target_hash)
                .map_err(merkle_status)?;
            let notice_hashes_in_epoch = epoch
                .notices_tree
                .proof(address, LOG2_KECCAK_SIZE)
                .map_err(merkle_status)?;
            advance_mcycle = Some(final_mcycle);
            ProcessedInput {
                input_index,
                most_recent_machine_hash: machine_hash,
                voucher_hashes_in_epoch,
                notice_hashes_in_epoch,
                processed: InputProcessing::Result(InputResult {
                    voucher_hashes_in_machine,
                    vouchers,
                    notice_hashes_in_machine,
                    notices,
                }),
                reports,
            }
        }
        Harvest::Skipped {
            reason,
            reports,
            machine_hash,
        } => {
            epoch.vouchers_tree.push(ZERO_HASH).map_err(merkle_status)?;
            let voucher_hashes_in_epoch = epoch
                .vouchers_tree
                .proof(address, LOG2_KECCAK_SIZE)
                .map_err(merkle_status)?;
            epoch.notices_tree.push(ZERO_HASH).map_err(merkle_status)?;
            let notice_hashes_in_epoch = epoch
                .notices_tree
                .proof(address, LOG2_KECCAK_SIZE)
                .map_err(merkle_status)?;
            // current_mcycle is left alone; the worker rolled back.
            ProcessedInput {
                input_index,
                most_recent_machine_hash: machine_hash,
                voucher_hashes_in_epoch,
                notice_hashes_in_epoch,
                processed: InputProcessing::Skipped(reason),
                reports,
            }
        }
    };
    epoch.processed_inputs.push(processed);
    epoch.pending_inputs.pop_front();
    if let Some(mcycle) = advance_mcycle {
        session.current_mcycle = mcycle;
    }
    Ok(())
}
