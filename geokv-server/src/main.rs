mod journal;
mod net;
mod trace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::net::TcpListener;

use geokv::config::{Configuration, DataCenter, KvsState, PaxosGroup, TxmanState};
use geokv::ids::{ClusterId, CommId, DataCenterId, KvsId, PaxosGroupId, TxmanId, VersionId};
use geokv::kvs::daemon::KvsDaemon;
use geokv::storage::cask::Cask;
use geokv::txman::daemon::{Journal, TxmanDaemon};
use geokv::wire::Outbox;

use crate::journal::FileJournal;
use crate::net::{Daemon, Transport};

/// How much garbage the cask tolerates before compacting on open.
const GARBAGE_RATIO: f64 = 0.25;

#[derive(Debug, Parser)]
#[command(version, about = "geokv transaction-manager and key-value daemons")]
struct Args {
    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Run a transaction-manager daemon.
    Txman(DaemonArgs),
    /// Run a key-value daemon.
    Kvs(DaemonArgs),
}

#[derive(Debug, clap::Args)]
struct DaemonArgs {
    /// Run without a controlling terminal; logs go only under --log.
    #[arg(long)]
    daemonize: bool,

    /// Directory for durable state.
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Directory for log files.
    #[arg(long, default_value = "./log")]
    log: PathBuf,

    /// Write the daemon's pid to this file.
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Address to listen on; must match this daemon's configuration entry.
    #[arg(long, default_value = "127.0.0.1:22751")]
    listen: String,

    /// Address of the cluster coordinator to fetch configuration from.
    #[arg(long)]
    coordinator: Option<String>,

    /// The data center this daemon serves.
    #[arg(long = "data-center", default_value = "default")]
    data_center: String,

    /// Worker threads for the runtime.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (is_txman, daemon_args) = match &args.role {
        Role::Txman(d) => (true, d),
        Role::Kvs(d) => (false, d),
    };

    std::fs::create_dir_all(&daemon_args.data)
        .with_context(|| format!("create data directory {:?}", daemon_args.data))?;
    std::fs::create_dir_all(&daemon_args.log)
        .with_context(|| format!("create log directory {:?}", daemon_args.log))?;

    let log_dir = daemon_args
        .log
        .to_str()
        .ok_or_else(|| anyhow!("log directory {:?} is not valid utf-8", daemon_args.log))?;
    let _guards = trace::init_logging(log_dir, "info", daemon_args.daemonize)?;
    info!(
        "geokv-server {} starting as {} on {}",
        env!("CARGO_PKG_VERSION"),
        if is_txman { "txman" } else { "kvs" },
        daemon_args.listen
    );
    if daemon_args.daemonize {
        info!("running detached from the terminal; logs only under {:?}", daemon_args.log);
    }

    if let Some(pidfile) = &daemon_args.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("write pidfile {:?}", pidfile))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(daemon_args.threads.max(1))
        .enable_all()
        .build()
        .context("build runtime")?;
    let result = runtime.block_on(run(is_txman, daemon_args));

    if let Some(pidfile) = &daemon_args.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    result
}

async fn run(is_txman: bool, args: &DaemonArgs) -> Result<()> {
    let config = Arc::new(load_configuration(is_txman, args).await?);
    config.validate().map_err(|err| anyhow!("invalid configuration: {}", err))?;
    info!("configuration:\n{}", config);

    let (us, dc) = resolve_us(is_txman, args, &config)?;

    let daemon = if is_txman {
        let journal = Arc::new(
            FileJournal::open(args.data.join("group.log"))
                .map_err(|err| anyhow!("open group log: {}", err))?,
        );
        let daemon = Arc::new(TxmanDaemon::with_journal(
            TxmanId(us.0),
            dc,
            config.clone(),
            Box::new(SharedJournal(journal.clone())),
        ));
        let restored = journal
            .replay(&daemon, Instant::now())
            .map_err(|err| anyhow!("replay group log: {}", err))?;
        if restored > 0 {
            info!("replayed {} group-log slots", restored);
        }
        Arc::new(Daemon::Txman(daemon))
    } else {
        let engine = Cask::new_compact(args.data.join("data.cask"), GARBAGE_RATIO)
            .map_err(|err| anyhow!("open cask: {}", err))?;
        let daemon = KvsDaemon::new(KvsId(us.0), dc, config.clone(), engine)
            .map_err(|err| anyhow!("start kvs daemon: {}", err))?;
        Arc::new(Daemon::Kvs(Arc::new(daemon)))
    };

    let transport = Transport::new(us, config.clone());
    // A restarted transaction manager re-drives what the journal restored.
    if let Daemon::Txman(txman) = daemon.as_ref() {
        let mut out = Outbox::new();
        txman
            .resume_all(Instant::now(), &mut out)
            .map_err(|err| anyhow!("resume restored transactions: {}", err))?;
        transport.deliver_all(out).await;
    }

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!("listening on {}", args.listen);

    tokio::spawn(net::pump_loop(daemon.clone(), transport.clone()));

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("install signal handler")?;

    tokio::select! {
        result = net::serve(listener, daemon, transport) => result,
        _ = shutdown_rx.recv() => {
            info!("shutting down");
            Ok(())
        }
    }
}

/// The coordinator publishes the configuration; a cached copy under the
/// data directory covers coordinator outages, and a single-node
/// configuration lets a daemon run standalone for kicking the tires.
async fn load_configuration(is_txman: bool, args: &DaemonArgs) -> Result<Configuration> {
    let cache = args.data.join("cluster.conf");
    if let Some(coordinator) = &args.coordinator {
        match net::fetch_configuration(coordinator).await {
            Ok(config) => {
                std::fs::write(&cache, config.encode())
                    .with_context(|| format!("cache configuration at {:?}", cache))?;
                return Ok(config);
            }
            Err(err) => {
                warn!("coordinator unavailable ({}); trying the cached configuration", err)
            }
        }
    }
    if cache.exists() {
        let bytes = std::fs::read(&cache).with_context(|| format!("read {:?}", cache))?;
        return Configuration::decode(&bytes)
            .map_err(|err| anyhow!("decode cached configuration: {}", err));
    }
    warn!("no coordinator and no cached configuration; running single-node");
    Ok(single_node_configuration(is_txman, args))
}

fn single_node_configuration(is_txman: bool, args: &DaemonArgs) -> Configuration {
    let dc = DataCenterId(1);
    let mut config = Configuration {
        cluster: ClusterId(1),
        version: VersionId(1),
        flags: 0,
        data_centers: vec![DataCenter { id: dc, name: args.data_center.clone() }],
        txmans: Vec::new(),
        paxos_groups: Vec::new(),
        kvss: Vec::new(),
    };
    if is_txman {
        config.txmans.push(TxmanState { id: TxmanId(1), dc, bind_to: args.listen.clone() });
        config.paxos_groups.push(PaxosGroup {
            id: PaxosGroupId(1),
            dc,
            members: vec![TxmanId(1)],
        });
    } else {
        config.kvss.push(KvsState { id: KvsId(1), dc, bind_to: args.listen.clone() });
    }
    config
}

/// A daemon is whichever configuration entry matches its listen address;
/// the entry also settles which data center it serves.
fn resolve_us(
    is_txman: bool,
    args: &DaemonArgs,
    config: &Configuration,
) -> Result<(CommId, DataCenterId)> {
    if is_txman {
        config
            .txmans
            .iter()
            .find(|t| t.bind_to == args.listen)
            .map(|t| (CommId(t.id.0), t.dc))
            .ok_or_else(|| {
                anyhow!("no transaction manager is configured to listen on {}", args.listen)
            })
    } else {
        config
            .kvss
            .iter()
            .find(|k| k.bind_to == args.listen)
            .map(|k| (CommId(k.id.0), k.dc))
            .ok_or_else(|| anyhow!("no key-value store is configured to listen on {}", args.listen))
    }
}

/// Lets the daemon and the replay path share one journal.
struct SharedJournal(Arc<FileJournal>);

impl Journal for SharedJournal {
    fn record(
        &self,
        tg: geokv::ids::TransactionGroup,
        slot: u64,
        entry: &[u8],
    ) -> geokv::error::CResult<()> {
        self.0.record(tg, slot, entry)
    }
}
