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

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rollup_protocol::pb::machine_check_in_server::MachineCheckInServer;
use rollup_protocol::pb::rollup_machine_manager_server::RollupMachineManagerServer;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tracing_subscriber::EnvFilter;

use rollup_manager::build_services;
use rollup_manager::worker::{reap_children, SpawnedWorkerLauncher};

#[derive(Debug, Parser)]
#[command(name = "rollup-machine-manager")]
#[command(about = "Rollup machine manager daemon")]
struct Args {
    /// Address the manager binds to: host:port or unix:<path>.
    #[arg(long)]
    manager_address: Option<String>,

    /// Bind address passed to every spawned worker.
    #[arg(long)]
    server_address: Option<String>,

    /// An unknown positional is treated as --server-address.
    #[arg(value_name = "SERVER_ADDRESS")]
    server_address_positional: Option<String>,

    /// Worker binary spawned for each session.
    #[arg(long, default_value = "./machine-server")]
    worker_command: PathBuf,

    #[arg(long, default_value = "info")]
    log: String,
}

/// Replaces the port specification in an address with the port actually
/// bound. Unix addresses pass through unchanged.
fn replace_port(address: &str, port: u16) -> String {
    if address.starts_with("unix:") {
        return address.to_string();
    }
    match address.rfind(':') {
        Some(pos) => format!("{}:{port}", &address[..pos]),
        None => format!("{address}:{port}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log))
        .init();

    let Some(manager_address) = args.manager_address else {
        eprintln!("missing manager-address");
        std::process::exit(1);
    };
    let server_address = args
        .server_address
        .or(args.server_address_positional)
        .unwrap_or_else(|| "localhost:0".to_string());

    tracing::info!(
        manager_version = %format!(
            "{}.{}.{}",
            rollup_protocol::MANAGER_VERSION_MAJOR,
            rollup_protocol::MANAGER_VERSION_MINOR,
            rollup_protocol::MANAGER_VERSION_PATCH
        ),
        %manager_address,
        %server_address,
        "starting rollup machine manager"
    );

    // Reap exited workers so none linger as zombies.
    tokio::spawn(async {
        let mut child =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install SIGCHLD handler");
                    return;
                }
            };
        while child.recv().await.is_some() {
            reap_children();
        }
    });

    let launcher = Arc::new(SpawnedWorkerLauncher::new(args.worker_command));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    };

    let sessions;
    if let Some(path) = manager_address.strip_prefix("unix:") {
        let listener = tokio::net::UnixListener::bind(path)?;
        let (manager, checkin) =
            build_services(launcher, manager_address.clone(), server_address);
        sessions = manager.sessions().clone();
        tracing::info!(%manager_address, "manager listening");
        tonic::transport::Server::builder()
            .add_service(RollupMachineManagerServer::new(manager))
            .add_service(MachineCheckInServer::new(checkin))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&manager_address).await?;
        let bound_address = replace_port(&manager_address, listener.local_addr()?.port());
        let (manager, checkin) = build_services(launcher, bound_address.clone(), server_address);
        sessions = manager.sessions().clone();
        tracing::info!(manager_address = %bound_address, "manager listening");
        tonic::transport::Server::builder()
            .add_service(RollupMachineManagerServer::new(manager))
            .add_service(MachineCheckInServer::new(checkin))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;
    }

    // Workers are owned by their sessions; none survive the manager.
    for entry in sessions.entries() {
        if let Ok(session) = entry.session.try_lock() {
            session.terminate_worker_process();
        }
    }

    Ok(())
}
