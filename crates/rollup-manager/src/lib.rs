#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod checkin;
pub mod config;
pub mod engine;
pub mod server;
pub mod session;
pub mod worker;

use std::sync::Arc;

use checkin::{CheckInService, CheckInSlots};
use server::ManagerService;
use session::SessionStore;
use worker::WorkerLauncher;

/// Wires the manager and check-in services around a shared session store
/// and rendezvous slot map.
pub fn build_services(
    launcher: Arc<dyn WorkerLauncher>,
    manager_address: String,
    worker_address: String,
) -> (ManagerService, CheckInService) {
    let sessions = SessionStore::new();
    let slots = CheckInSlots::new();
    let manager = ManagerService::new(
        sessions.clone(),
        slots.clone(),
        launcher,
        manager_address,
        worker_address,
    );
    let checkin = CheckInService::new(slots, sessions);
    (manager, checkin)
}
