//! OpenSSH-backed transport.
//!
//! Each session runs an `ssh -M` control master; uploads (`scp`) and command
//! execution (`ssh`) are multiplexed over it through a private control
//! socket, and `ssh -O exit` tears it down.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::debug;
use uuid::Uuid;

use super::{
    ChannelEvent, ExecChannel, ExitReport, OutputStream, RemoteError, RemoteFuture, RemoteSession,
    RemoteTarget, RemoteTransport,
};

const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MASTER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUFFER: usize = 8 * 1024;
const CHANNEL_DEPTH: usize = 64;

/// Paths and timing used by [`SshTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// How long to wait for a fresh instance to accept connections.
    pub connect_timeout: Duration,
    /// Delay between readiness probes.
    pub probe_interval: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: "ssh".to_owned(),
            scp_bin: "scp".to_owned(),
            connect_timeout: Duration::from_secs(100),
            probe_interval: Duration::from_secs(2),
        }
    }
}

/// Transport that shells out to the system OpenSSH client.
#[derive(Clone, Debug, Default)]
pub struct SshTransport {
    settings: SshSettings,
}

impl SshTransport {
    /// Creates a transport with the given settings.
    #[must_use]
    pub const fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    async fn wait_until_reachable(
        &self,
        target: &RemoteTarget,
        deadline: Instant,
    ) -> Result<(), RemoteError> {
        let addr = format!("{}:{}", target.host, target.port);
        while Instant::now() <= deadline {
            let probe = timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(addr.as_str())).await;
            if matches!(probe, Ok(Ok(_))) {
                return Ok(());
            }
            sleep(self.settings.probe_interval).await;
        }
        Err(RemoteError::Connect {
            host: target.host.clone(),
            message: format!(
                "port {} not reachable within {}s",
                target.port,
                self.settings.connect_timeout.as_secs()
            ),
        })
    }

    async fn open(&self, target: &RemoteTarget) -> Result<SshSession, RemoteError> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        self.wait_until_reachable(target, deadline).await?;

        let control_path = control_socket_path();
        let mut master = Command::new(&self.settings.ssh_bin)
            .args(master_args(target, &control_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| connect_error(target, format!("failed to spawn ssh: {err}")))?;

        let check = control_args(target, &control_path, "check");
        while Instant::now() <= deadline {
            if let Some(status) = master
                .try_wait()
                .map_err(|err| connect_error(target, err.to_string()))?
            {
                let stderr = drain_stderr(&mut master).await;
                return Err(connect_error(
                    target,
                    format!("ssh exited with {status}: {}", stderr.trim()),
                ));
            }
            let ready = Command::new(&self.settings.ssh_bin)
                .args(&check)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .is_ok_and(|status| status.success());
            if ready {
                debug!(host = %target.host, control = %control_path, "ssh control master ready");
                return Ok(SshSession {
                    settings: self.settings.clone(),
                    target: target.clone(),
                    control_path,
                    master,
                });
            }
            sleep(Duration::from_millis(250)).await;
        }

        master.kill().await.ok();
        Err(connect_error(
            target,
            "timed out waiting for the ssh control master".to_owned(),
        ))
    }
}

impl RemoteTransport for SshTransport {
    type Session = SshSession;

    fn connect<'a>(&'a self, target: &'a RemoteTarget) -> RemoteFuture<'a, SshSession> {
        Box::pin(async move { self.open(target).await })
    }
}

/// Session multiplexed over one OpenSSH control master.
#[derive(Debug)]
pub struct SshSession {
    settings: SshSettings,
    target: RemoteTarget,
    control_path: Utf8PathBuf,
    master: Child,
}

impl SshSession {
    async fn copy(&self, local: &Utf8Path, remote: &str) -> Result<(), RemoteError> {
        let args = scp_args(&self.target, &self.control_path, local, remote);
        let output = Command::new(&self.settings.scp_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| RemoteError::Upload {
                path: local.to_path_buf(),
                message: format!("failed to spawn scp: {err}"),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Upload {
                path: local.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }

    fn spawn(&self, command: &str) -> Result<SshChannel, RemoteError> {
        let mut child = Command::new(&self.settings.ssh_bin)
            .args(exec_args(&self.target, &self.control_path, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RemoteError::Exec {
                message: format!("failed to spawn ssh: {err}"),
            })?;

        let (sender, receiver) = mpsc::channel(CHANNEL_DEPTH);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(async move {
            let out_task = stdout.map(|pipe| tokio::spawn(pump(pipe, OutputStream::Stdout, sender.clone())));
            let err_task = stderr.map(|pipe| tokio::spawn(pump(pipe, OutputStream::Stderr, sender.clone())));
            for task in [out_task, err_task].into_iter().flatten() {
                task.await.ok();
            }
            let exit = child
                .wait()
                .await
                .map(|status| ExitReport {
                    code: status.code(),
                })
                .unwrap_or_default();
            sender.send(ChannelEvent::Closed(exit)).await.ok();
        });

        Ok(SshChannel { receiver })
    }

    async fn shutdown(mut self) -> Result<(), RemoteError> {
        let args = control_args(&self.target, &self.control_path, "exit");
        let requested = Command::new(&self.settings.ssh_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success());
        if !requested {
            debug!(host = %self.target.host, "control master did not accept exit request");
        }
        if timeout(MASTER_EXIT_TIMEOUT, self.master.wait()).await.is_err() {
            self.master.kill().await.map_err(|err| RemoteError::Stream {
                message: format!("failed to stop ssh control master: {err}"),
            })?;
        }
        debug!(host = %self.target.host, "ssh session closed");
        Ok(())
    }
}

impl RemoteSession for SshSession {
    type Channel = SshChannel;

    fn upload<'a>(&'a mut self, local: &'a Utf8Path, remote: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move { self.copy(local, remote).await })
    }

    fn exec<'a>(&'a mut self, command: &'a str) -> RemoteFuture<'a, SshChannel> {
        Box::pin(async move { self.spawn(command) })
    }

    fn close(self) -> RemoteFuture<'static, ()> {
        Box::pin(self.shutdown())
    }
}

/// Output of one `ssh` command process.
#[derive(Debug)]
pub struct SshChannel {
    receiver: mpsc::Receiver<ChannelEvent>,
}

impl ExecChannel for SshChannel {
    fn next_event(&mut self) -> RemoteFuture<'_, ChannelEvent> {
        Box::pin(async move {
            self.receiver.recv().await.ok_or_else(|| RemoteError::Stream {
                message: "output channel closed before the exit event".to_owned(),
            })
        })
    }
}

async fn pump<R>(mut pipe: R, stream: OutputStream, sender: mpsc::Sender<ChannelEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0_u8; READ_BUFFER];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let bytes = buffer.get(..read).map(<[u8]>::to_vec).unwrap_or_default();
                if sender
                    .send(ChannelEvent::Output { stream, bytes })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn drain_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_string(&mut text).await.ok();
    }
    text
}

fn connect_error(target: &RemoteTarget, message: String) -> RemoteError {
    RemoteError::Connect {
        host: target.host.clone(),
        message,
    }
}

fn control_socket_path() -> Utf8PathBuf {
    let name = format!("nimus-{}.sock", Uuid::new_v4().simple());
    let base = std::env::temp_dir();
    Utf8PathBuf::from_path_buf(base.join(&name)).unwrap_or_else(|_| Utf8PathBuf::from("/tmp").join(name))
}

fn destination(target: &RemoteTarget) -> OsString {
    OsString::from(format!("{}@{}", target.user, target.host))
}

/// Options shared by every `ssh`/`scp` invocation.
fn common_options(target: &RemoteTarget, control_path: &Utf8Path) -> Vec<OsString> {
    [
        "-i",
        target.identity_file.as_str(),
        "-o",
        "BatchMode=yes",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
    ]
    .into_iter()
    .map(OsString::from)
    .chain([
        OsString::from("-o"),
        OsString::from(format!("ControlPath={control_path}")),
    ])
    .collect()
}

pub(super) fn master_args(target: &RemoteTarget, control_path: &Utf8Path) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("-M"),
        OsString::from("-N"),
        OsString::from("-p"),
        OsString::from(target.port.to_string()),
        OsString::from("-o"),
        OsString::from("ConnectTimeout=30"),
        OsString::from("-o"),
        OsString::from("ServerAliveInterval=15"),
    ];
    args.extend(common_options(target, control_path));
    args.push(destination(target));
    args
}

pub(super) fn control_args(
    target: &RemoteTarget,
    control_path: &Utf8Path,
    command: &str,
) -> Vec<OsString> {
    let mut args = vec![OsString::from("-O"), OsString::from(command)];
    args.extend(common_options(target, control_path));
    args.push(destination(target));
    args
}

pub(super) fn exec_args(
    target: &RemoteTarget,
    control_path: &Utf8Path,
    command: &str,
) -> Vec<OsString> {
    let mut args = vec![OsString::from("-p"), OsString::from(target.port.to_string())];
    args.extend(common_options(target, control_path));
    args.push(destination(target));
    args.push(OsString::from(command));
    args
}

pub(super) fn scp_args(
    target: &RemoteTarget,
    control_path: &Utf8Path,
    local: &Utf8Path,
    remote: &str,
) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("-q"),
        OsString::from("-P"),
        OsString::from(target.port.to_string()),
    ];
    args.extend(common_options(target, control_path));
    args.push(OsString::from(local.as_str()));
    args.push(OsString::from(format!(
        "{}@{}:{remote}",
        target.user, target.host
    )));
    args
}
