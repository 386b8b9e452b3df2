use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pops_api::{Engine, GroupId, InProcApi, PlayerId, PopApi, PopRequest, PopsConfig};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

mod render;

use render::Output;

#[derive(Parser, Debug)]
#[command(name = "popsctl", version, about = "Pops engine CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = OutputArg::Human)]
    output: OutputArg,

    /// SQLite database file (overrides POPS_DB_PATH)
    #[arg(long = "db", global = true, env = "POPS_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputArg { Human, Json }

impl From<OutputArg> for Output {
    fn from(o: OutputArg) -> Self {
        match o {
            OutputArg::Human => Output::Human,
            OutputArg::Json => Output::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the engine and scheduler; read JSON pops from stdin, one per line
    Run,
    /// Submit one pop and wait until it is applied
    Pop {
        player: String,
        amount: String,
        group: String,
    },
    /// Ten highest scores of a group
    Top { group: GroupId },
    /// Score of one player in one group
    Player { group: GroupId, player: PlayerId },
    /// Live totals of every group
    Groups,
    /// Player total across groups from the reconciled snapshot
    Global { player: PlayerId },
    /// Per-group totals from the reconciled snapshot
    SnapshotGroups,
    /// Run one reconciliation pass
    Reconcile,
    /// Persist a checkpoint of every shard
    Checkpoint,
    /// Print the effective configuration
    Config,
}

fn init_tracing() {
    let env = std::env::var("POPS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("POPS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid POPS_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let out: Output = cli.output.into();

    let mut cfg = PopsConfig::from_env();
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }
    if let Commands::Config = cli.command {
        println!("{}", render::config(out, &cfg)?);
        return Ok(());
    }

    let with_scheduler = matches!(cli.command, Commands::Run);
    let engine = Engine::open_sqlite(cfg, with_scheduler).await.context("starting engine")?;
    let api = InProcApi::new(engine.clone());
    let res = dispatch(&api, &engine, cli.command, out).await;
    engine.shutdown().await;
    res
}

async fn dispatch(api: &InProcApi, engine: &Engine, command: Commands, out: Output) -> Result<()> {
    match command {
        Commands::Run => run(api, engine, out).await?,
        Commands::Pop { player, amount, group } => {
            let req = PopRequest::parse(&player, &amount, &group)?;
            let t0 = Instant::now();
            let ticket = api.submit_pop(req).await?;
            let id = ticket.id();
            ticket.wait().await.with_context(|| format!("pop {}", id))?;
            info!(id = %id, took_ms = %t0.elapsed().as_millis(), "pop applied");
            println!("{}", render::applied(out, &id.to_string())?);
        }
        Commands::Top { group } => println!("{}", render::top(out, api, group).await?),
        Commands::Player { group, player } => println!("{}", render::player(out, api, group, player).await?),
        Commands::Groups => println!("{}", render::groups(out, api).await?),
        Commands::Global { player } => println!("{}", render::global(out, api, player).await?),
        Commands::SnapshotGroups => println!("{}", render::snapshot_groups(out, api).await?),
        Commands::Reconcile => {
            let outcome = engine.reconcile_now().await?;
            println!("{}", render::outcome(out, &outcome)?);
        }
        Commands::Checkpoint => {
            let mut failed = 0usize;
            for (g, res) in engine.checkpoint().await {
                match res {
                    Ok(()) => println!("{}", render::line(out, &CheckpointLine { group: g, ok: true, error: None })?),
                    Err(e) => {
                        failed += 1;
                        println!("{}", render::line(out, &CheckpointLine { group: g, ok: false, error: Some(e.to_string()) })?);
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{} shard checkpoint(s) failed", failed));
            }
        }
        Commands::Config => {}
    }
    Ok(())
}

#[derive(Serialize)]
struct CheckpointLine {
    group: GroupId,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl std::fmt::Display for CheckpointLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            None => write!(f, "group {} • checkpoint saved", self.group),
            Some(e) => write!(f, "group {} • checkpoint failed: {}", self.group, e),
        }
    }
}

/// Feed stdin into the queue until EOF or Ctrl-C, then drain and reconcile.
async fn run(api: &InProcApi, engine: &Engine, out: Output) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (mut submitted, mut rejected) = (0u64, 0u64);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    info!("stdin closed");
                    break;
                };
                let line = line.trim();
                if line.is_empty() { continue; }
                let req: PopRequest = match serde_json::from_str(line) {
                    Ok(r) => r,
                    Err(e) => {
                        rejected += 1;
                        warn!(error = %e, "skipping malformed line");
                        continue;
                    }
                };
                // Tickets are not awaited here; acknowledgements show up in the stats.
                match api.submit_pop(req).await {
                    Ok(_) => submitted += 1,
                    Err(e) => {
                        rejected += 1;
                        warn!(error = %e, "pop rejected");
                    }
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }
    info!(submitted, rejected, "draining");
    engine.shutdown().await;
    match engine.reconcile_drained().await {
        Ok(outcome) => println!("{}", render::outcome(out, &outcome)?),
        Err(e) => error!(error = %e, "final reconciliation failed"),
    }
    let stats = api.stats().await?;
    println!("{}", render::stats(out, &stats)?);
    Ok(())
}
