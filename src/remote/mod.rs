//! Remote execution bridge.
//!
//! [`RemoteBridge::run`] opens a session to an instance, uploads the payload
//! when it names a local script, executes it, forwards output to an
//! [`OutputSink`], and closes the connection once the remote process exits.
//! Transports are pluggable through [`RemoteTransport`]; the production
//! implementation drives the system OpenSSH client ([`SshTransport`]).

mod session;
mod ssh;

use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use session::{SessionEvent, SessionMachine, SessionState, next_state};
pub use ssh::{SshSettings, SshTransport};

/// Remote path receiving uploaded scripts.
pub const REMOTE_SCRIPT_PATH: &str = "/tmp/nimus.script";

/// Default login user on provisioned instances.
pub const DEFAULT_REMOTE_USER: &str = "nimus";

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Errors raised while running a payload remotely.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when the transport cannot connect or authenticate.
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Host that was contacted.
        host: String,
        /// Transport supplied reason.
        message: String,
    },
    /// Raised when the script upload fails.
    #[error("failed to upload {path}: {message}")]
    Upload {
        /// Local script path.
        path: Utf8PathBuf,
        /// Transport supplied reason.
        message: String,
    },
    /// Raised when the remote command cannot be started.
    #[error("failed to start remote command: {message}")]
    Exec {
        /// Transport supplied reason.
        message: String,
    },
    /// Raised when the output stream breaks before the exit event.
    #[error("remote output stream failed: {message}")]
    Stream {
        /// Transport supplied reason.
        message: String,
    },
    /// Raised when an event arrives in a state that does not accept it.
    #[error("invalid session transition from {from:?} on {event:?}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// Event that was rejected.
        event: SessionEvent,
    },
}

/// Connection details for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Hostname or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key used for authentication.
    pub identity_file: Utf8PathBuf,
}

impl RemoteTarget {
    /// Builds a target using the default user and port.
    #[must_use]
    pub fn new(host: impl Into<String>, identity_file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: DEFAULT_REMOTE_USER.to_owned(),
            identity_file: identity_file.into(),
        }
    }

    /// Overrides the login user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Overrides the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Per-run behaviour switches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunOptions {
    /// Suppresses the user-facing progress lines.
    pub quiet: bool,
}

impl RunOptions {
    /// Options with progress lines suppressed.
    #[must_use]
    pub const fn quiet() -> Self {
        Self { quiet: true }
    }
}

/// How a payload string is delivered to the instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// Existing local file, uploaded and run with `bash`.
    ScriptFile(Utf8PathBuf),
    /// Inline command executed verbatim.
    Command(String),
}

impl Payload {
    /// Classifies `raw`: a path (absolute or relative to `cwd`) naming an
    /// existing file becomes [`Payload::ScriptFile`], anything else a
    /// [`Payload::Command`].
    #[must_use]
    pub fn classify(raw: &str, cwd: &Utf8Path) -> Self {
        let candidate = Utf8Path::new(raw);
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            cwd.join(candidate)
        };
        if !raw.trim().is_empty() && resolved.is_file() {
            Self::ScriptFile(resolved)
        } else {
            Self::Command(raw.to_owned())
        }
    }

    /// Command executed remotely for this payload.
    #[must_use]
    pub fn remote_command(&self) -> String {
        match self {
            Self::ScriptFile(_) => format!("bash {REMOTE_SCRIPT_PATH}"),
            Self::Command(command) => command.clone(),
        }
    }
}

/// Which remote stream produced a chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Exit information reported when the remote process finishes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExitReport {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
}

/// Event produced by an execution channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    /// Output chunk.
    Output {
        /// Source stream.
        stream: OutputStream,
        /// Raw bytes.
        bytes: Vec<u8>,
    },
    /// Remote process exited; no further events follow.
    Closed(ExitReport),
}

/// Receives remote output as it arrives.
pub trait OutputSink: Send + Sync {
    /// Handles one chunk.
    fn write(&self, stream: OutputStream, chunk: &[u8]);
}

/// Forwards both remote streams to local standard output.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, _stream: OutputStream, chunk: &[u8]) {
        let mut stdout = io::stdout().lock();
        stdout.write_all(chunk).ok();
        stdout.flush().ok();
    }
}

/// Future returned by transport operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Opens sessions to remote hosts.
pub trait RemoteTransport: Send + Sync {
    /// Session type produced by this transport.
    type Session: RemoteSession;

    /// Connects and authenticates.
    fn connect<'a>(&'a self, target: &'a RemoteTarget) -> RemoteFuture<'a, Self::Session>;
}

/// An authenticated connection.
pub trait RemoteSession: Send + 'static {
    /// Channel type produced by [`RemoteSession::exec`].
    type Channel: ExecChannel;

    /// Copies `local` to `remote` over the session.
    fn upload<'a>(&'a mut self, local: &'a Utf8Path, remote: &'a str) -> RemoteFuture<'a, ()>;

    /// Starts `command` and returns its output channel.
    fn exec<'a>(&'a mut self, command: &'a str) -> RemoteFuture<'a, Self::Channel>;

    /// Terminates the connection.
    fn close(self) -> RemoteFuture<'static, ()>;
}

/// Output of one running remote command.
pub trait ExecChannel: Send {
    /// Waits for the next output chunk or the exit event.
    fn next_event(&mut self) -> RemoteFuture<'_, ChannelEvent>;
}

/// Result of a completed run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionOutcome {
    /// Exit information from the remote process. Informational only.
    pub exit: ExitReport,
    /// States visited by the session.
    pub trace: Vec<SessionState>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Runs payloads on instances through a [`RemoteTransport`].
#[derive(Clone, Debug)]
pub struct RemoteBridge<T> {
    transport: T,
    working_dir: Utf8PathBuf,
}

impl<T: RemoteTransport> RemoteBridge<T> {
    /// Creates a bridge resolving relative script paths against
    /// `working_dir`.
    pub fn new(transport: T, working_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            transport,
            working_dir: working_dir.into(),
        }
    }

    /// Runs `payload` on `target`, streaming output into `sink`.
    ///
    /// The remote exit code is reported in the outcome but does not make the
    /// run fail. The connection is closed whether or not the run succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Connect`] when the session cannot be opened,
    /// [`RemoteError::Upload`] when the script transfer fails, and
    /// [`RemoteError::Exec`] or [`RemoteError::Stream`] when the command
    /// cannot be run to completion.
    pub async fn run(
        &self,
        target: &RemoteTarget,
        payload: &str,
        options: RunOptions,
        sink: &dyn OutputSink,
    ) -> Result<SessionOutcome, RemoteError> {
        let started = Instant::now();
        let mut machine = SessionMachine::new();
        if !options.quiet {
            info!(host = %target.host, "connecting to instance");
        }

        let mut session = self.transport.connect(target).await?;
        let result = self
            .drive(&mut session, &mut machine, payload, options, sink)
            .await;

        if let Err(err) = session.close().await {
            warn!(host = %target.host, error = %err, "failed to close remote session cleanly");
        }
        if !options.quiet {
            info!(host = %target.host, "disconnected");
        }

        let exit = result?;
        debug!(host = %target.host, exit_code = ?exit.code, "remote run finished");
        Ok(SessionOutcome {
            exit,
            trace: machine.trace().to_vec(),
            elapsed: started.elapsed(),
        })
    }

    async fn drive(
        &self,
        session: &mut T::Session,
        machine: &mut SessionMachine,
        payload: &str,
        options: RunOptions,
        sink: &dyn OutputSink,
    ) -> Result<ExitReport, RemoteError> {
        machine.apply(SessionEvent::Connected)?;

        let delivery = Payload::classify(payload, &self.working_dir);
        if let Payload::ScriptFile(path) = &delivery {
            machine.apply(SessionEvent::UploadStarted)?;
            session.upload(path, REMOTE_SCRIPT_PATH).await?;
            debug!(script = %path, remote = REMOTE_SCRIPT_PATH, "script uploaded");
        }

        let command = delivery.remote_command();
        if !options.quiet {
            info!(command = %command, "running remote command");
        }
        let mut channel = session.exec(&command).await?;
        machine.apply(SessionEvent::ExecDispatched)?;

        loop {
            match channel.next_event().await? {
                ChannelEvent::Output { stream, bytes } => {
                    machine.apply(SessionEvent::OutputReceived)?;
                    sink.write(stream, &bytes);
                }
                ChannelEvent::Closed(exit) => {
                    machine.apply(SessionEvent::StreamClosed)?;
                    return Ok(exit);
                }
            }
        }
    }
}
