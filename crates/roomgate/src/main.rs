//! The `roomgate` binary.
//!
//! ```text
//! roomgate dispatcher --bind 0.0.0.0:7000 [--in-process] [--grace-ms 5000]
//! roomgate room --room-id arena1 [--bind 127.0.0.1:0] [--grace-ms 5000]
//! ```
//!
//! `room` prints `READY <addr>` on stdout once it is listening; that line
//! is how the dispatcher's process launcher learns the room's address.
//! Logs go to stderr.

use std::io::Write;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use roomgate::{DispatcherBuilder, DispatcherConfig, ProcessLauncher, READY_PREFIX, RoomgateError, TaskLauncher};
use roomgate_protocol::RoomId;
use roomgate_room::{RoomServer, RoomServerConfig};
use roomgate_session::SessionConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Routes clients to per-room servers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central dispatcher.
    Dispatcher(DispatcherArgs),
    /// Run a single room server.
    Room(RoomArgs),
}

#[derive(Args, Debug)]
struct DispatcherArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7000")]
    bind: String,
    /// Host handed to clients in ROOM_ASSIGNED (defaults to the room's IP)
    #[arg(long)]
    advertise_host: Option<String>,
    /// Host room servers bind to
    #[arg(long, default_value = "127.0.0.1")]
    room_host: String,
    /// Run room servers as tasks in this process instead of child processes
    #[arg(long)]
    in_process: bool,
    /// How long an empty room lives before it is reclaimed
    #[arg(long, default_value_t = 5_000)]
    grace_ms: u64,
    /// Bound on one room launch attempt
    #[arg(long, default_value_t = 5_000)]
    startup_timeout_ms: u64,
    /// Launch attempts before a room is declared unavailable
    #[arg(long, default_value_t = 3)]
    max_spawn_attempts: u32,
    /// Close client connections silent for this long
    #[arg(long, default_value_t = 60)]
    idle_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct RoomArgs {
    /// The room this server hosts
    #[arg(long)]
    room_id: String,
    /// Address to listen on (port 0 picks a free port)
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: String,
    /// How long the room may stay empty before it reports itself idle
    #[arg(long, default_value_t = 5_000)]
    grace_ms: u64,
    /// Grid size
    #[arg(long, default_value_t = 8)]
    dimension: i32,
    /// Seed for item placement
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), RoomgateError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Dispatcher(args) => run_dispatcher(args).await,
        Command::Room(args) => run_room(args).await,
    }
}

async fn run_dispatcher(args: DispatcherArgs) -> Result<(), RoomgateError> {
    let grace = Duration::from_millis(args.grace_ms);
    let config = DispatcherConfig {
        bind: args.bind,
        advertise_host: args.advertise_host,
        grace,
        startup_timeout: Duration::from_millis(args.startup_timeout_ms),
        max_spawn_attempts: args.max_spawn_attempts,
        session: SessionConfig {
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        },
        ..Default::default()
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    if args.in_process {
        let launcher = TaskLauncher::new(RoomServerConfig {
            bind: format!("{}:0", args.room_host),
            grace,
            ..Default::default()
        });
        let dispatcher = DispatcherBuilder::new().config(config).build(launcher).await?;
        dispatcher.run_until(shutdown).await
    } else {
        let launcher = ProcessLauncher::current_exe(args.room_host, grace)?;
        let dispatcher = DispatcherBuilder::new().config(config).build(launcher).await?;
        dispatcher.run_until(shutdown).await
    }
}

async fn run_room(args: RoomArgs) -> Result<(), RoomgateError> {
    let room_id = RoomId::new(args.room_id)?;
    let config = RoomServerConfig {
        bind: args.bind,
        grace: Duration::from_millis(args.grace_ms),
        dimension: args.dimension,
        item_seed: args.seed,
        ..Default::default()
    };
    let server = RoomServer::bind(room_id, config).await?;

    let addr = server.local_addr()?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{READY_PREFIX}{addr}")?;
    stdout.flush()?;

    server.run().await?;
    Ok(())
}
