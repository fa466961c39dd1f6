// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Genesis Mesh node daemon: load the constitution and identity, join
//! the mesh, run until interrupted or shut down via the control plane.

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use gm_comms::TcpAcceptor;
use gm_interface::trust::{GenesisBlock, JoinCertificate};
use gm_interface::types::keys;
use gm_node::{MeshNode, NodeContext, NodeConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "gm-node", version)]
struct Args {
    /// Path to the signed genesis block JSON.
    #[clap(long)]
    genesis: PathBuf,

    /// Path to the node's private key file (generated if absent).
    #[clap(long)]
    node_key: Option<PathBuf>,

    /// Path to an NA-issued join certificate JSON.
    #[clap(long)]
    certificate: Option<PathBuf>,

    /// Address to listen on for mesh transports.
    #[clap(long, default_value = "0.0.0.0:8420")]
    listen: String,

    /// Endpoint other nodes should dial, when it differs from `--listen`.
    #[clap(long)]
    public_endpoint: Option<String>,

    /// Node roles (repeatable).
    #[clap(long = "role")]
    roles: Vec<String>,

    /// Audit log file.
    #[clap(long)]
    audit_log: Option<PathBuf>,

    /// Replay-cache snapshot file.
    #[clap(long)]
    replay_cache: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let genesis = GenesisBlock::from_file(&args.genesis)?;
    let keypair = match &args.node_key {
        Some(path) => keys::load_keypair(path)?,
        None => {
            tracing::info!("Generating a fresh node keypair");
            keys::gen_keypair()
        }
    };

    let roles = if args.roles.is_empty() {
        vec!["role:client".to_string()]
    } else {
        args.roles.clone()
    };

    let mut ctx = NodeContext::new(genesis, keypair, roles);
    ctx.config = NodeConfig::default();
    ctx.listen_endpoint = Some(
        args.public_endpoint
            .clone()
            .unwrap_or_else(|| args.listen.clone()),
    );
    ctx.audit_path = args.audit_log.clone();
    ctx.replay_cache_path = args.replay_cache.clone();

    let node = MeshNode::new(ctx)?;

    if let Some(path) = &args.certificate {
        let text = std::fs::read_to_string(path)?;
        let cert: JoinCertificate = serde_json::from_str(&text)?;
        node.install_certificate(cert).await?;
    } else {
        return Err(eyre!(
            "no join certificate; obtain one from the Network Authority first"
        ));
    }

    let acceptor = TcpAcceptor::bind(&args.listen).await?;
    tracing::info!("Listening on {}", acceptor.local_addr()?);

    node.start().await;
    node.start_listener(acceptor).await;
    node.bootstrap().await;

    let mut shutdown = node.shutdown_requests();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
        changed = shutdown.changed() => {
            if changed.is_ok() {
                let reason = shutdown.borrow().clone().unwrap_or_default();
                tracing::warn!("Shutdown requested via control plane: {reason}");
            }
        }
    }

    node.stop().await;
    Ok(())
}
