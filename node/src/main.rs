use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use guardian_vaa::{Chain, MessageId, Vaa};
use guardiand::{
    config::{NodeConfig, SinkConfig},
    governance::GovernanceInjector,
    guardian_set::GuardianSetState,
    processor::{Inputs, Processor},
    reporter::{run_sink, AttestationEventReporter, JsonFileSink, LogSink},
    stats::NetworkStats,
    store::{Lookup, VaaStore},
    watcher::{near::NearSource, supervise, RequestRouter, Watcher},
};
use log::*;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

const CHANNEL_CAPACITY: usize = 1024;
const RESTART_DELAY: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(about = "Guardian node", author = "Guardian Contributors", version)]
struct Cli {
    /// Path to the YAML node configuration
    #[arg(short, long, default_value = "guardiand.yaml")]
    config: PathBuf,

    /// Logging level, repeat for more. Up to one -v logs errors only, five or more traces.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Run the node. This is the default.
    Run,

    /// Look up a signed VAA in the configured VAA directory
    Lookup {
        /// <chain>/<emitter hex>/<sequence>
        message_id: MessageId,
    },
}

fn init_logging(verbosity: u8) {
    use LevelFilter::*;
    let filter = match verbosity {
        0..=1 => Error,
        2 => Warn,
        3 => Info,
        4 => Debug,
        _other => Trace,
    };

    env_logger::builder()
        .filter_level(filter)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = NodeConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.action.unwrap_or(Action::Run) {
        Action::Run => run(cfg).await,
        Action::Lookup { message_id } => lookup(&cfg, &message_id),
    }
}

fn open_store(cfg: &NodeConfig) -> anyhow::Result<VaaStore> {
    match &cfg.vaa_dir {
        Some(dir) => VaaStore::with_dir(dir)
            .with_context(|| format!("failed to open VAA directory {}", dir.display())),
        None => Ok(VaaStore::in_memory()),
    }
}

fn lookup(cfg: &NodeConfig, id: &MessageId) -> anyhow::Result<()> {
    if cfg.vaa_dir.is_none() {
        bail!("lookup needs vaa_dir to be configured");
    }

    match open_store(cfg)?.lookup(id)? {
        Lookup::Found(signed) => {
            let vaa = Vaa::deserialize(&signed).context("stored VAA is malformed")?;
            println!("message:      {}", vaa.message_id());
            println!("digest:       {}", vaa.body.hex_digest());
            println!("guardian set: {}", vaa.header.guardian_set_index);
            println!("signatures:   {}", vaa.header.signatures.len());
            println!("vaa:          {}", hex::encode(&signed));
        }
        Lookup::Pending => println!("{id}: not yet quorate"),
        Lookup::NotFound => println!("{id}: not found"),
    }
    Ok(())
}

async fn run(cfg: NodeConfig) -> anyhow::Result<()> {
    let key = cfg.signing_key()?;
    let sets = GuardianSetState::new(cfg.guardian_set(), cfg.expiry_grace_secs);
    let store = open_store(&cfg)?;
    let stats = Arc::new(NetworkStats::new());
    let reporter = Arc::new(AttestationEventReporter::new());

    let (shutdown_tx, shutdown) = watch::channel(false);
    let (observations_tx, observations) = mpsc::channel(CHANNEL_CAPACITY);
    // Inbound signatures and set updates are fed by the gossip transport.
    let (_signatures_tx, signatures) = mpsc::channel(CHANNEL_CAPACITY);
    let (_set_updates_tx, set_updates) = mpsc::channel(16);

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut router = RequestRouter::new();

    if let Some(near) = &cfg.near {
        let (requests_tx, requests) = mpsc::channel(16);
        router.register(Chain::Near, requests_tx);

        let source = NearSource::new(near.rpc.clone(), near.contract.clone());
        let watcher = Watcher::new(source, observations_tx.clone(), requests, stats.clone())
            .with_interval(Duration::from_millis(near.poll_interval_ms));
        tasks.push(tokio::spawn(supervise(
            watcher,
            shutdown.clone(),
            RESTART_DELAY,
        )));
    }

    let sub = reporter.subscribe(cfg.reporter_capacity);
    tasks.push(match &cfg.sink {
        SinkConfig::Log => tokio::spawn(run_sink(sub, LogSink, shutdown.clone())),
        SinkConfig::JsonFile { path } => {
            let sink = JsonFileSink::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            tokio::spawn(run_sink(sub, sink, shutdown.clone()))
        }
    });

    let processor = Processor::new(
        key,
        sets,
        cfg.processor_settings(),
        store,
        reporter.clone(),
        stats.clone(),
    )
    .with_router(router);
    info!("guardian address {}", processor.address());

    let inputs = Inputs {
        observations,
        signatures,
        set_updates,
    };
    tasks.push(tokio::spawn(processor.run(inputs, shutdown.clone())));

    let injector = GovernanceInjector::new(observations_tx);
    for msg in &cfg.governance {
        let _ = injector
            .inject(msg.payload.clone(), msg.sequence, msg.nonce, msg.timestamp)
            .await
            .with_context(|| format!("failed to inject governance sequence {}", msg.sequence))?;
    }

    tasks.push(tokio::spawn(log_stats(stats, shutdown)));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            error!("task failed: {}", e);
        }
    }
    Ok(())
}

async fn log_stats(stats: Arc<NetworkStats>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                for (chain, s) in stats.snapshot() {
                    debug!(
                        "{}: height {} confirmed {} errors {} ready {}",
                        chain, s.height, s.messages_confirmed, s.error_count, s.ready
                    );
                }
            }
        }
    }
}
