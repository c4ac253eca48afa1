//! iofwd session launcher
//!
//! Runs a whole session in one process: one thread per rank, talking over an
//! in-process group and fabric. Clients run a synthetic SPMD workload that
//! writes a tiled 2-D field for a number of steps.
//!
//! Usage:
//!   iofwd_run --client-x 4 --client-y 4 --ratio 8 --steps 10
//!   iofwd_run --config iofwd.toml --backend directory --output-dir /tmp/out
//!   iofwd_run --client-x 8 --save-config session.toml

use iofwd::config::{BackendKind, IofwdConfig};
use iofwd::constants::{
    rank_thread_name, DEFAULT_CREATE_MODE, DEFAULT_DATASET_PATH, WORKLOAD_TILE_X, WORKLOAD_TILE_Y,
};
use iofwd::error::IofwdResult;
use iofwd::group::{LocalGroup, ProcessGroup};
use iofwd::placement::Placement;
use iofwd::protocol::{DataType, GLOBAL_VAR_ID};
use iofwd::runtime::{init, ClientReport, ClientRuntime, Role, ServerReport};
use iofwd::storage::StorageTarget;
use iofwd::transport::Fabric;

use clap::{Parser, ValueEnum};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// iofwd session launcher
#[derive(Parser)]
#[command(name = "iofwd_run")]
#[command(about = "Run an I/O forwarding session with a synthetic workload")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client grid columns
    #[arg(long)]
    client_x: Option<usize>,

    /// Client grid rows
    #[arg(long)]
    client_y: Option<usize>,

    /// Desired clients per server
    #[arg(long)]
    ratio: Option<usize>,

    /// Server processes to launch (default: size of the chosen server grid)
    #[arg(long)]
    servers: Option<usize>,

    /// Phases written by each client
    #[arg(long, default_value = "4")]
    steps: usize,

    /// Root directory for the directory backend
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Write the effective configuration to this file before starting
    #[arg(long)]
    save_config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    Directory,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Memory => BackendKind::Memory,
            Backend::Directory => BackendKind::Directory,
        }
    }
}

enum RankOutcome {
    Client(ClientReport),
    Server(ServerReport),
    Idle,
}

fn load_config(args: &Args) -> IofwdResult<IofwdConfig> {
    let mut config = match &args.config {
        Some(path) => IofwdConfig::load(path)?,
        None => IofwdConfig::default(),
    };

    if let Some(x) = args.client_x {
        config.placement.client_x = x;
    }
    if let Some(y) = args.client_y {
        config.placement.client_y = y;
    }
    if let Some(ratio) = args.ratio {
        config.placement.ratio = ratio;
    }
    if let Some(dir) = &args.output_dir {
        config.storage.output_dir = dir.clone();
    }
    if let Some(backend) = args.backend {
        config.storage.backend = backend.into();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
    }
    Ok(config)
}

/// Each client writes a `WORKLOAD_TILE_Y x WORKLOAD_TILE_X` tile of a field
/// laid out like the client grid.
fn run_workload(client: &mut ClientRuntime, config: &IofwdConfig, steps: usize) -> IofwdResult<()> {
    let cx = config.placement.client_x;
    let cy = config.placement.client_y;
    let rank = client.rank();
    let (gx, gy) = (rank % cx, rank / cx);
    let start = [gy * WORKLOAD_TILE_Y, gx * WORKLOAD_TILE_X];
    let count = [WORKLOAD_TILE_Y, WORKLOAD_TILE_X];

    let file = client.create(DEFAULT_DATASET_PATH, DEFAULT_CREATE_MODE)?;
    let y = client.def_dim(file, "y", cy * WORKLOAD_TILE_Y)?;
    let x = client.def_dim(file, "x", cx * WORKLOAD_TILE_X)?;
    let field = client.def_var(file, "field", DataType::Double, &[y, x], &start, &count)?;
    client.put_att_text(file, GLOBAL_VAR_ID, "title", "iofwd synthetic field")?;
    client.put_att_text(file, field, "units", "K")?;
    client.put_att(file, field, "steps", &[steps as i32])?;
    client.enddef(file)?;

    let width = cx * WORKLOAD_TILE_X;
    let mut tile = vec![0f64; WORKLOAD_TILE_Y * WORKLOAD_TILE_X];
    for step in 0..steps {
        for (i, value) in tile.iter_mut().enumerate() {
            let (row, col) = (start[0] + i / WORKLOAD_TILE_X, start[1] + i % WORKLOAD_TILE_X);
            *value = (step * 1_000_000 + row * width + col) as f64;
        }
        client.put_vara(file, field, &start, &count, &tile)?;
        client.io_end()?;
        tracing::debug!(rank, step, "step written");
    }

    client.close(file)?;
    Ok(())
}

fn run_rank(
    group: LocalGroup,
    fabric: Fabric,
    config: IofwdConfig,
    target: StorageTarget,
    running: Arc<AtomicBool>,
    steps: usize,
) -> IofwdResult<RankOutcome> {
    let outcome = match init(&group, &fabric, &config, &target)? {
        Role::Client(mut client) => {
            run_workload(&mut client, &config, steps)?;
            RankOutcome::Client(client.finalize()?)
        }
        Role::Server(server) => RankOutcome::Server(server.with_stop_flag(running).run()?),
        Role::Idle => RankOutcome::Idle,
    };
    group.barrier()?;
    Ok(outcome)
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    iofwd::logging::init_with_hostname(&config.logging.level);

    let clients = config.placement.client_x * config.placement.client_y;
    // A server grid never has more cells than the client grid.
    let servers = match args.servers {
        Some(servers) => servers,
        None => match Placement::new(
            config.placement.client_x,
            config.placement.client_y,
            config.placement.ratio,
            2 * clients,
        ) {
            Ok(placement) => placement.server_amount(),
            Err(e) => {
                tracing::error!("{}", e);
                std::process::exit(2);
            }
        },
    };
    let world = clients + servers;
    tracing::info!(
        "Starting session: {}x{} clients, ratio {}, {} server processes, {} steps",
        config.placement.client_x,
        config.placement.client_y,
        config.placement.ratio,
        servers,
        args.steps
    );

    let running = Arc::new(AtomicBool::new(true));
    iofwd::signals::setup_signal_handlers(running.clone());

    let fabric = Fabric::new();
    let target = StorageTarget::from_config(&config.storage);
    let started = Instant::now();

    let mut threads = Vec::with_capacity(world);
    for group in LocalGroup::spawn_world(world) {
        let rank = group.rank();
        let (fabric, config, target, running) =
            (fabric.clone(), config.clone(), target.clone(), running.clone());
        let steps = args.steps;
        let spawned = std::thread::Builder::new()
            .name(rank_thread_name(rank))
            .spawn(move || run_rank(group, fabric, config, target, running, steps));
        match spawned {
            Ok(handle) => threads.push((rank, handle)),
            Err(e) => {
                tracing::error!("Failed to spawn rank {}: {}", rank, e);
                std::process::exit(1);
            }
        }
    }

    let mut failed = false;
    let mut client_reports = Vec::new();
    let mut server_reports = Vec::new();
    for (rank, handle) in threads {
        match handle.join() {
            Ok(Ok(RankOutcome::Client(report))) => client_reports.push(report),
            Ok(Ok(RankOutcome::Server(report))) => server_reports.push(report),
            Ok(Ok(RankOutcome::Idle)) => {}
            Ok(Err(e)) => {
                tracing::error!("Rank {} failed: {}", rank, e);
                failed = true;
            }
            Err(_) => {
                tracing::error!("Rank {} panicked", rank);
                failed = true;
            }
        }
    }

    let elapsed = started.elapsed();
    let bytes: u64 = server_reports.iter().map(|r| r.bytes_received).sum();
    let writes: u64 = server_reports
        .iter()
        .map(|r| r.aggregator.collective_writes)
        .sum();
    let spans: u64 = client_reports.iter().map(|r| r.spans).sum();
    let messages: u64 = client_reports.iter().map(|r| r.messages).sum();
    tracing::info!(
        "Session finished in {:.3}s: {} messages in {} transfers, {} bytes forwarded, {} collective writes",
        elapsed.as_secs_f64(),
        messages,
        spans,
        bytes,
        writes
    );
    if server_reports.iter().any(|r| r.interrupted) {
        tracing::warn!("Session interrupted before every client finished");
        failed = true;
    }

    if let StorageTarget::Memory(store) = &target {
        if let Some(snapshot) = store.snapshot(DEFAULT_DATASET_PATH) {
            let values = snapshot.values::<f64>("field").unwrap_or_default();
            tracing::info!(
                "Dataset {}: {} values of field, last = {:?}",
                DEFAULT_DATASET_PATH,
                values.len(),
                values.last()
            );
        }
    }

    if running.load(Ordering::Relaxed) && !failed {
        tracing::info!("iofwd_run completed successfully");
    } else {
        std::process::exit(1);
    }
}
