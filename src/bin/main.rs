// Lumen node entry point: loads layered configuration, wires the
// membership keeper, the pulse conveyor and the light-material artifact
// handler, and runs until interrupted.
//
// Network transports (pulsar feed, consensus exchange, peer bus) plug
// in at the seams; this binary wires a loopback bus so a single node is
// fully operational for local work.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use log::{info, warn};
use parking_lot::RwLock;
use serde::Deserialize;

use lumen_consensus::claims::ClaimHandler;
use lumen_consensus::node_keeper::NodeKeeper;
use lumen_conveyor::{MachineRegistry, PulseConveyor};
use lumen_core::bus::{ExecutionContext, MessageBus};
use lumen_core::config::Settings;
use lumen_core::crypto::KeyPair;
use lumen_core::error::CoreError;
use lumen_core::message::{Message, Reply};
use lumen_core::node::{Node, NodeRole};
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::{NodeRef, ShortNodeId};
use lumen_ledger::{ArtifactHandler, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "lumen", about = "Pulse-driven distributed ledger node")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "lumen.toml")]
    config: String,

    /// Log filter, overriding RUST_LOG.
    #[arg(long, default_value = "info")]
    log: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NodeConfig {
    /// Advertised address of this node.
    address: String,
    /// Hex-encoded 32-byte signing seed; generated when absent.
    key_seed: Option<String>,
    /// Pulse the node considers present at startup.
    start_pulse: u32,
    consensus: lumen_core::config::ConsensusSettings,
    conveyor: lumen_core::config::ConveyorSettings,
    ledger: lumen_core::config::LedgerSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let settings = Settings::default();
        NodeConfig {
            address: "127.0.0.1:7000".into(),
            key_seed: None,
            start_pulse: 100,
            consensus: settings.consensus,
            conveyor: settings.conveyor,
            ledger: settings.ledger,
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<NodeConfig> {
    let loaded = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("LUMEN").separator("__"))
        .build()
        .context("building configuration")?;
    loaded
        .try_deserialize::<NodeConfig>()
        .context("deserializing configuration")
}

fn load_keypair(seed_hex: Option<&str>) -> anyhow::Result<KeyPair> {
    match seed_hex {
        Some(encoded) => {
            let bytes = hex::decode(encoded).context("decoding key seed")?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("key seed must be 32 bytes"))?;
            Ok(KeyPair::from_seed(seed))
        }
        None => {
            warn!("[Node] no key seed configured, generating an ephemeral identity");
            Ok(KeyPair::generate())
        }
    }
}

/// Delivers bus messages back to the local artifact handler. Remote
/// transports replace this seam.
struct LoopbackBus {
    handler: RwLock<Option<Arc<ArtifactHandler>>>,
    origin: NodeRef,
}

#[async_trait]
impl MessageBus for LoopbackBus {
    async fn send(&self, target: NodeRef, message: Message) -> Result<Reply, CoreError> {
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            return Err(CoreError::Bus("bus not wired yet".into()));
        };
        if target != self.origin {
            return Err(CoreError::Bus(format!(
                "no transport to {target}: single-node loopback"
            )));
        }
        let ctx = ExecutionContext::new(self.origin, PulseNumber::GENESIS);
        Ok(handler.handle(&ctx, message).await)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log)).init();

    let cfg = load_config(&cli.config)?;
    let keypair = Arc::new(load_keypair(cfg.key_seed.as_deref())?);
    let public_key = keypair.public_key();
    let reference = NodeRef(public_key.0);
    let origin = Node::new(
        reference,
        NodeRole::LightMaterial,
        public_key,
        cfg.address.clone(),
        ShortNodeId(0),
    );
    info!("[Node] starting as {} at {}", reference, cfg.address);

    let start_pulse = PulseNumber(cfg.start_pulse);
    let keeper = Arc::new(NodeKeeper::new(origin.clone()));
    keeper.set_unsync_list(vec![origin]);
    let claims = Arc::new(ClaimHandler::new(start_pulse));
    // Announce ourselves for the first round once an exchange is wired.
    claims.add_pending_claim(
        start_pulse.next(cfg.conveyor.pulse_delta),
        ShortNodeId(0),
        keeper.origin_join_claim(),
    );
    info!(
        "[Node] membership: {} unsync candidate(s), quorum {}",
        keeper.unsync_list().len(),
        cfg.consensus.quorum(keeper.unsync_list().len())
    );

    let registry = Arc::new(MachineRegistry::new());
    let conveyor = Arc::new(PulseConveyor::new(
        reference,
        registry,
        cfg.conveyor.clone(),
        start_pulse,
    ));

    let bus = Arc::new(LoopbackBus {
        handler: RwLock::new(None),
        origin: reference,
    });
    let handler = Arc::new(ArtifactHandler::new(
        reference,
        keypair,
        cfg.ledger.clone(),
        MemoryStore::new(),
        bus.clone(),
        reference,
    ));
    *bus.handler.write() = Some(handler.clone());
    handler
        .tree()
        .update(lumen_core::reference::JetId::ROOT, Some(reference), start_pulse);

    info!(
        "[Node] ready: present pulse {} (delta {}), conveyor {}",
        conveyor.present_pulse(),
        cfg.conveyor.pulse_delta,
        conveyor.state().as_str()
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("[Node] interrupt received, shutting down");
    conveyor.initiate_shutdown(true);
    handler.shutdown();
    Ok(())
}
