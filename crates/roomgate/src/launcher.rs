//! Starting room servers.
//!
//! The dispatcher does not care *how* a room server comes to exist, only
//! that it ends up listening somewhere. [`RoomLauncher`] is that seam:
//!
//! - [`ProcessLauncher`] starts the current executable with the `room`
//!   subcommand, one OS process per room.
//! - [`TaskLauncher`] runs the [`RoomServer`] as a Tokio task inside the
//!   dispatcher's process. Handy for tests and single-binary deployments.
//!
//! Once a launcher returns, [`handshake`] opens the control link:
//!
//! ```text
//! dispatcher                     room server
//!     │── ROOM_HANDSHAKE{room_id} ──▶│
//!     │◀── ROOM_READY{clients} ──────│
//!     │◀── ROOM_STATUS ... ──────────│   (for the rest of the room's life)
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use roomgate_protocol::{
    Frame, FrameDecoder, Message, RequestId, RoomHandshake, RoomId, RoomReady, encode_frame,
};
use roomgate_room::{RoomError, RoomServer, RoomServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::LaunchError;

/// The line a room process prints on stdout once it is listening.
pub const READY_PREFIX: &str = "READY ";

/// Starts room servers.
///
/// Implementations are shared between launch tasks, so they must be
/// cheap to share and `'static`.
pub trait RoomLauncher: Send + Sync + 'static {
    /// Starts a room server for `room_id` and returns where it listens.
    ///
    /// The returned future is raced against the startup timeout; if it is
    /// dropped half-way, whatever it started must go away with it.
    fn launch(
        &self,
        room_id: &RoomId,
    ) -> impl Future<Output = Result<LaunchedRoom, LaunchError>> + Send;
}

// ---------------------------------------------------------------------------
// LaunchedRoom
// ---------------------------------------------------------------------------

/// A room server that has started listening.
#[derive(Debug)]
pub struct LaunchedRoom {
    pub endpoint: SocketAddr,
    pub process: RoomProcess,
}

/// Whatever backs a room server. Dropping it terminates the server.
#[derive(Debug)]
pub enum RoomProcess {
    Child(Child),
    Task(JoinHandle<Result<(), RoomError>>),
}

impl RoomProcess {
    /// Stops the room server without waiting for it to exit.
    pub fn terminate(&mut self) {
        match self {
            Self::Child(child) => {
                // Fails only if the child already exited.
                let _ = child.start_kill();
            }
            Self::Task(handle) => handle.abort(),
        }
    }

    /// OS process id, if the room runs in its own process.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Child(child) => child.id(),
            Self::Task(_) => None,
        }
    }
}

impl Drop for RoomProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

// ---------------------------------------------------------------------------
// ProcessLauncher
// ---------------------------------------------------------------------------

/// Launches each room as a child process running `<program> room ...`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    bind_host: String,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, bind_host: impl Into<String>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            bind_host: bind_host.into(),
            grace,
        }
    }

    /// Re-runs the executable of the current process.
    pub fn current_exe(bind_host: impl Into<String>, grace: Duration) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, bind_host, grace))
    }

    fn command(&self, room_id: &RoomId) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("room")
            .arg("--room-id")
            .arg(room_id.as_str())
            .arg("--bind")
            .arg(format!("{}:0", self.bind_host))
            .arg("--grace-ms")
            .arg(self.grace.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

impl RoomLauncher for ProcessLauncher {
    async fn launch(&self, room_id: &RoomId) -> Result<LaunchedRoom, LaunchError> {
        let mut child = self.command(room_id).spawn().map_err(LaunchError::Spawn)?;
        let stdout = child.stdout.take().ok_or(LaunchError::NoReadyLine)?;
        let process = RoomProcess::Child(child);

        let mut lines = BufReader::new(stdout).lines();
        let line = lines.next_line().await?.ok_or(LaunchError::NoReadyLine)?;
        let endpoint = parse_ready_line(&line)?;

        tracing::debug!(%room_id, %endpoint, pid = ?process.pid(), "room process listening");
        Ok(LaunchedRoom { endpoint, process })
    }
}

/// Parses `READY 127.0.0.1:40123`.
pub fn parse_ready_line(line: &str) -> Result<SocketAddr, LaunchError> {
    line.trim()
        .strip_prefix(READY_PREFIX)
        .and_then(|addr| addr.trim().parse().ok())
        .ok_or_else(|| LaunchError::BadReadyLine(line.to_string()))
}

// ---------------------------------------------------------------------------
// TaskLauncher
// ---------------------------------------------------------------------------

/// Runs each room server as a Tokio task in the current process.
#[derive(Debug, Clone, Default)]
pub struct TaskLauncher {
    config: RoomServerConfig,
}

impl TaskLauncher {
    pub fn new(config: RoomServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoomServerConfig {
        &self.config
    }
}

impl RoomLauncher for TaskLauncher {
    async fn launch(&self, room_id: &RoomId) -> Result<LaunchedRoom, LaunchError> {
        let server = RoomServer::bind(room_id.clone(), self.config.clone()).await?;
        let endpoint = server.local_addr()?;
        let handle = tokio::spawn(server.run());
        Ok(LaunchedRoom {
            endpoint,
            process: RoomProcess::Task(handle),
        })
    }
}

// ---------------------------------------------------------------------------
// Readiness handshake
// ---------------------------------------------------------------------------

/// Opens the control link to a freshly launched room server.
///
/// Returns the stream together with its decoder, which may already hold
/// bytes that arrived after `ROOM_READY`.
pub async fn handshake(
    endpoint: SocketAddr,
    room_id: &RoomId,
    max_frame_len: usize,
) -> Result<(TcpStream, FrameDecoder, RoomReady), LaunchError> {
    let mut stream = TcpStream::connect(endpoint).await?;
    let request_id = RequestId(1);
    let hello = Frame::new(
        request_id,
        Message::RoomHandshake(RoomHandshake {
            room_id: room_id.clone(),
        }),
    );
    stream.write_all(&encode_frame(&hello, max_frame_len)?).await?;

    let mut decoder = FrameDecoder::new(max_frame_len);
    loop {
        while let Some(frame) = decoder.next_frame()? {
            if frame.request_id != request_id {
                continue;
            }
            return match frame.message {
                Message::RoomReady(ready) => Ok((stream, decoder, ready)),
                Message::Error(body) => Err(LaunchError::Rejected(body.message)),
                other => Err(LaunchError::Rejected(format!(
                    "expected ROOM_READY, got {}",
                    other.message_type()
                ))),
            };
        }
        if stream.read_buf(decoder.buffer_mut()).await? == 0 {
            return Err(LaunchError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}
