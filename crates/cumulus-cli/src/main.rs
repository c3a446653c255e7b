// Copyright (c) 2025-2026 Cumulus Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cumulus_core::{LocalService, NodeId, ServiceConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cumulus")]
#[command(about = "Cumulus personal cloud CLI")]
struct Cli {
    /// Display name this node announces to peers.
    #[arg(long, default_value = "cumulus-node")]
    name: String,

    /// UDP port used for discovery.
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a cloud around a local folder, share it, and print the
    /// invitation token. Runs until interrupted.
    Share {
        /// Human-readable cloud name.
        cloud_name: String,
        /// Folder contributed to the federated view.
        folder: PathBuf,
    },
    /// Join a cloud using a token printed by `share` on another node.
    /// Runs until interrupted.
    Join {
        /// Base-10 invitation token.
        token: String,
        /// How long to wait for the sharer's announcement, in seconds.
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },
    /// Generate and print a fresh node id.
    GenId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = ServiceConfig {
        display_name: cli.name.clone(),
        ..ServiceConfig::default()
    };
    if let Some(port) = cli.port {
        config.multicast_port = port;
    }

    match cli.command {
        Command::Share { cloud_name, folder } => {
            let service = LocalService::new(config);
            service.start_service().await?;
            let cloud = service.create_personal_cloud(cloud_name, folder).await;
            let token = service.share_personal_cloud(&cloud).await;
            println!("cloud: {}", cloud.name());
            println!("token: {token}");
            println!("waiting for peers; press ctrl-c to stop sharing");

            tokio::signal::ctrl_c().await?;
            service.stop_share_personal_cloud(&cloud).await;
            service.shutdown().await;
        }
        Command::Join { token, timeout } => {
            config.join_timeout = Duration::from_secs(timeout);
            let service = LocalService::new(config);
            service.start_service().await?;
            let cloud = service.join_personal_cloud(&token, cli.name).await?;
            println!("joined cloud: {}", cloud.name());
            for peer in cloud.peers() {
                println!("peer: {} at {}", peer.display_name, peer.endpoint);
            }
            println!("press ctrl-c to leave");

            tokio::signal::ctrl_c().await?;
            service.shutdown().await;
        }
        Command::GenId => {
            let id = NodeId::generate();
            println!("node_id: {}", id.to_hex());
        }
    }

    Ok(())
}
