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

//! Worker check-in rendezvous.
//!
//! Whenever the manager triggers a worker (re)spawn it registers a one-shot
//! slot keyed by session id and suspends on the receiving end. The always-on
//! `MachineCheckIn` service resolves the slot with the worker's listening
//! address. The session lock guarantees at most one outstanding slot per id.

use std::collections::HashMap;
use std::sync::Arc;

use rollup_protocol::pb;
use rollup_protocol::pb::machine_check_in_server::MachineCheckIn;
use tokio::sync::oneshot;
use tonic::{Request, Response, Status};

use crate::session::SessionStore;

#[derive(Debug, Clone, Default)]
pub struct CheckInSlots {
    inner: Arc<parking_lot::Mutex<HashMap<String, oneshot::Sender<String>>>>,
}

impl CheckInSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `session_id` and returns the receiving end.
    pub fn register(&self, session_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .lock()
            .insert(session_id.to_string(), tx)
            .is_some()
        {
            tracing::warn!(session_id, "replaced dangling check-in slot");
        }
        rx
    }

    /// Drops the slot after a failed trigger so a stray check-in is rejected.
    pub fn cancel(&self, session_id: &str) {
        self.inner.lock().remove(session_id);
    }

    pub fn resolve(&self, session_id: &str, address: String) -> Result<(), Status> {
        let sender = self.inner.lock().remove(session_id).ok_or_else(|| {
            Status::invalid_argument(format!("check-in with wrong session id {session_id}"))
        })?;
        sender
            .send(address)
            .map_err(|_| Status::internal("check-in consumer is gone"))
    }
}

/// The always-listening endpoint spawned workers report to.
#[derive(Debug, Clone)]
pub struct CheckInService {
    slots: CheckInSlots,
    sessions: SessionStore,
}

impl CheckInService {
    pub fn new(slots: CheckInSlots, sessions: SessionStore) -> Self {
        Self { slots, sessions }
    }
}

#[tonic::async_trait]
impl MachineCheckIn for CheckInService {
    async fn check_in(
        &self,
        request: Request<pb::CheckInRequest>,
    ) -> Result<Response<pb::Void>, Status> {
        let request = request.into_inner();
        tracing::info!(
            session_id = %request.session_id,
            address = %request.address,
            "received check_in"
        );
        if !self.sessions.contains(&request.session_id) {
            return Err(Status::invalid_argument(format!(
                "could not find an actual session with id {}",
                request.session_id
            )));
        }
        self.slots.resolve(&request.session_id, request.address)?;
        Ok(Response::new(pb::Void {}))
    }
}
