//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::lifecycle::{Confirm, LifecycleError};
use crate::model::{Instance, Network};
use crate::process::{CommandError, CommandOutput, CommandRunner};
use crate::provider::{
    InstanceRef, InstanceSpec, MetadataItem, ProviderClient, ProviderError, ProviderFuture,
};
use crate::remote::{
    ChannelEvent, ExecChannel, ExitReport, OutputSink, OutputStream, RemoteError, RemoteFuture,
    RemoteSession, RemoteTarget, RemoteTransport,
};

type Shared<T> = Arc<std::sync::Mutex<T>>;

fn locked<T, R>(shared: &Shared<T>, f: impl FnOnce(&mut T) -> R) -> R {
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: std::rc::Rc<std::cell::RefCell<VecDeque<CommandOutput>>>,
    invocations: std::rc::Rc<std::cell::RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Provider call recorded by [`ScriptedProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderCall {
    /// `create` with the requested name and metadata.
    Create {
        /// Requested instance name.
        name: String,
        /// Metadata attached to the request.
        metadata: Vec<MetadataItem>,
    },
    /// `get` for an instance.
    Get {
        /// Instance name.
        name: String,
    },
    /// `remove` for an instance.
    Remove {
        /// Instance name.
        name: String,
    },
    /// `set_metadata` for an instance.
    SetMetadata {
        /// Instance name.
        name: String,
        /// Metadata applied.
        items: Vec<MetadataItem>,
    },
}

#[derive(Debug, Default)]
struct ProviderState {
    instances: BTreeMap<String, Instance>,
    create_failures: BTreeMap<String, ProviderError>,
    get_failures: BTreeMap<String, ProviderError>,
    remove_failures: BTreeMap<String, ProviderError>,
    calls: Vec<ProviderCall>,
    created: u8,
}

/// In-memory provider with per-instance failure injection.
///
/// Created instances run Debian, sit in `us-central1-a` unless a zone is
/// requested, and receive addresses `10.0.0.N` / `203.0.113.N`.
#[derive(Clone, Debug)]
pub struct ScriptedProvider {
    driver: String,
    state: Shared<ProviderState>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// Provider reporting instances as belonging to driver `main`.
    #[must_use]
    pub fn new() -> Self {
        Self::for_driver("main")
    }

    /// Provider reporting instances as belonging to `driver`.
    #[must_use]
    pub fn for_driver(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            state: Arc::default(),
        }
    }

    /// Seeds an instance the provider already knows about.
    pub fn insert(&self, instance: Instance) {
        locked(&self.state, |state| {
            state.instances.insert(instance.name.clone(), instance);
        });
    }

    /// Makes `create` fail for `name`.
    pub fn fail_create(&self, name: &str, error: ProviderError) {
        locked(&self.state, |state| {
            state.create_failures.insert(name.to_owned(), error);
        });
    }

    /// Makes `get` fail for `name`.
    pub fn fail_get(&self, name: &str, error: ProviderError) {
        locked(&self.state, |state| {
            state.get_failures.insert(name.to_owned(), error);
        });
    }

    /// Makes `remove` fail for `name`.
    pub fn fail_remove(&self, name: &str, error: ProviderError) {
        locked(&self.state, |state| {
            state.remove_failures.insert(name.to_owned(), error);
        });
    }

    /// Forgets `name` as though it were deleted out of band.
    pub fn forget(&self, name: &str) {
        locked(&self.state, |state| {
            state.instances.remove(name);
        });
    }

    /// Returns every recorded call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        locked(&self.state, |state| state.calls.clone())
    }

    /// Names of instances the provider currently knows.
    #[must_use]
    pub fn known(&self) -> Vec<String> {
        locked(&self.state, |state| state.instances.keys().cloned().collect())
    }

    fn instance_for(&self, spec: &InstanceSpec, ordinal: u8) -> Instance {
        Instance {
            name: spec.name.clone(),
            machine_type: spec
                .machine_type
                .clone()
                .unwrap_or_else(|| "n1-standard-1".to_owned()),
            zone: spec
                .zone
                .clone()
                .unwrap_or_else(|| "us-central1-a".to_owned()),
            driver: self.driver.clone(),
            status: "RUNNING".to_owned(),
            os: "debian-12".to_owned(),
            network: Network {
                internal_ip: Some(format!("10.0.0.{ordinal}")),
                external_ip: Some(format!("203.0.113.{ordinal}")),
            },
        }
    }
}

impl ProviderClient for ScriptedProvider {
    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            let outcome = locked(&self.state, |state| {
                state.calls.push(ProviderCall::Create {
                    name: spec.name.clone(),
                    metadata: spec.metadata.clone(),
                });
                if let Some(err) = state.create_failures.get(&spec.name) {
                    return Err(err.clone());
                }
                state.created = state.created.saturating_add(1);
                Ok(state.created)
            });
            let instance = self.instance_for(spec, outcome?);
            self.insert(instance.clone());
            Ok(instance)
        })
    }

    fn get<'a>(&'a self, target: &'a InstanceRef) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            locked(&self.state, |state| {
                state.calls.push(ProviderCall::Get {
                    name: target.name.clone(),
                });
                if let Some(err) = state.get_failures.get(&target.name) {
                    return Err(err.clone());
                }
                state
                    .instances
                    .get(&target.name)
                    .cloned()
                    .ok_or_else(|| ProviderError::NotFound {
                        resource: format!("instance {}", target.name),
                    })
            })
        })
    }

    fn remove<'a>(&'a self, target: &'a InstanceRef) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            locked(&self.state, |state| {
                state.calls.push(ProviderCall::Remove {
                    name: target.name.clone(),
                });
                if let Some(err) = state.remove_failures.get(&target.name) {
                    return Err(err.clone());
                }
                state
                    .instances
                    .remove(&target.name)
                    .map(|_| ())
                    .ok_or_else(|| ProviderError::NotFound {
                        resource: format!("instance {}", target.name),
                    })
            })
        })
    }

    fn set_metadata<'a>(
        &'a self,
        target: &'a InstanceRef,
        items: &'a [MetadataItem],
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            locked(&self.state, |state| {
                state.calls.push(ProviderCall::SetMetadata {
                    name: target.name.clone(),
                    items: items.to_vec(),
                });
                if state.instances.contains_key(&target.name) {
                    Ok(())
                } else {
                    Err(ProviderError::NotFound {
                        resource: format!("instance {}", target.name),
                    })
                }
            })
        })
    }
}

/// Transport call recorded by [`RecordingTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    /// Session opened.
    Connect {
        /// Target host.
        host: String,
    },
    /// File uploaded.
    Upload {
        /// Target host.
        host: String,
        /// Local file.
        local: Utf8PathBuf,
        /// Remote destination.
        remote: String,
    },
    /// Command started.
    Exec {
        /// Target host.
        host: String,
        /// Remote command line.
        command: String,
    },
    /// Session closed.
    Close {
        /// Target host.
        host: String,
    },
}

#[derive(Debug)]
struct TransportState {
    events: Vec<TransportEvent>,
    output: Vec<(OutputStream, Vec<u8>)>,
    exit: ExitReport,
    unreachable: BTreeSet<String>,
    fail_upload: bool,
    fail_exec: bool,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            output: Vec::new(),
            exit: ExitReport { code: Some(0) },
            unreachable: BTreeSet::new(),
            fail_upload: false,
            fail_exec: false,
        }
    }
}

/// Transport double that records calls and replays scripted output.
///
/// Every executed command emits the queued output chunks followed by the
/// configured exit report (`0` unless changed).
#[derive(Clone, Debug, Default)]
pub struct RecordingTransport {
    state: Shared<TransportState>,
}

impl RecordingTransport {
    /// Creates a transport that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an output chunk emitted by every command.
    pub fn emit(&self, stream: OutputStream, text: &str) {
        locked(&self.state, |state| {
            state.output.push((stream, text.as_bytes().to_vec()));
        });
    }

    /// Sets the exit code reported by every command.
    pub fn exit_with(&self, code: Option<i32>) {
        locked(&self.state, |state| state.exit = ExitReport { code });
    }

    /// Makes connections to `host` fail.
    pub fn fail_connect_to(&self, host: &str) {
        locked(&self.state, |state| {
            state.unreachable.insert(host.to_owned());
        });
    }

    /// Makes every upload fail.
    pub fn fail_upload(&self) {
        locked(&self.state, |state| state.fail_upload = true);
    }

    /// Makes every command start fail.
    pub fn fail_exec(&self) {
        locked(&self.state, |state| state.fail_exec = true);
    }

    /// Returns every recorded event in order.
    #[must_use]
    pub fn events(&self) -> Vec<TransportEvent> {
        locked(&self.state, |state| state.events.clone())
    }

    /// Number of uploads performed.
    #[must_use]
    pub fn uploads(&self) -> usize {
        locked(&self.state, |state| {
            state
                .events
                .iter()
                .filter(|event| matches!(event, TransportEvent::Upload { .. }))
                .count()
        })
    }

    /// Commands executed, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        locked(&self.state, |state| {
            state
                .events
                .iter()
                .filter_map(|event| match event {
                    TransportEvent::Exec { command, .. } => Some(command.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    /// Hosts that received an upload, in order.
    #[must_use]
    pub fn uploaded_hosts(&self) -> Vec<String> {
        locked(&self.state, |state| {
            state
                .events
                .iter()
                .filter_map(|event| match event {
                    TransportEvent::Upload { host, .. } => Some(host.clone()),
                    _ => None,
                })
                .collect()
        })
    }
}

impl RemoteTransport for RecordingTransport {
    type Session = RecordingSession;

    fn connect<'a>(&'a self, target: &'a RemoteTarget) -> RemoteFuture<'a, RecordingSession> {
        Box::pin(async move {
            locked(&self.state, |state| {
                if state.unreachable.contains(&target.host) {
                    return Err(RemoteError::Connect {
                        host: target.host.clone(),
                        message: "connection refused".to_owned(),
                    });
                }
                state.events.push(TransportEvent::Connect {
                    host: target.host.clone(),
                });
                Ok(())
            })?;
            Ok(RecordingSession {
                host: target.host.clone(),
                state: Arc::clone(&self.state),
            })
        })
    }
}

/// Session opened by [`RecordingTransport`].
#[derive(Debug)]
pub struct RecordingSession {
    host: String,
    state: Shared<TransportState>,
}

impl RemoteSession for RecordingSession {
    type Channel = RecordingChannel;

    fn upload<'a>(&'a mut self, local: &'a Utf8Path, remote: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            locked(&self.state, |state| {
                if state.fail_upload {
                    return Err(RemoteError::Upload {
                        path: local.to_path_buf(),
                        message: "permission denied".to_owned(),
                    });
                }
                state.events.push(TransportEvent::Upload {
                    host: self.host.clone(),
                    local: local.to_path_buf(),
                    remote: remote.to_owned(),
                });
                Ok(())
            })
        })
    }

    fn exec<'a>(&'a mut self, command: &'a str) -> RemoteFuture<'a, RecordingChannel> {
        Box::pin(async move {
            locked(&self.state, |state| {
                if state.fail_exec {
                    return Err(RemoteError::Exec {
                        message: "channel open failed".to_owned(),
                    });
                }
                state.events.push(TransportEvent::Exec {
                    host: self.host.clone(),
                    command: command.to_owned(),
                });
                let mut pending: VecDeque<ChannelEvent> = state
                    .output
                    .iter()
                    .map(|(stream, bytes)| ChannelEvent::Output {
                        stream: *stream,
                        bytes: bytes.clone(),
                    })
                    .collect();
                pending.push_back(ChannelEvent::Closed(state.exit));
                Ok(RecordingChannel { pending })
            })
        })
    }

    fn close(self) -> RemoteFuture<'static, ()> {
        let Self { host, state } = self;
        Box::pin(async move {
            locked(&state, |recorded| {
                recorded.events.push(TransportEvent::Close { host });
            });
            Ok(())
        })
    }
}

/// Channel replaying scripted events.
#[derive(Debug)]
pub struct RecordingChannel {
    pending: VecDeque<ChannelEvent>,
}

impl ExecChannel for RecordingChannel {
    fn next_event(&mut self) -> RemoteFuture<'_, ChannelEvent> {
        let next = self.pending.pop_front().ok_or_else(|| RemoteError::Stream {
            message: "channel already closed".to_owned(),
        });
        Box::pin(async move { next })
    }
}

/// Sink collecting output in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    buffer: Shared<Vec<u8>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected output decoded as UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        locked(&self.buffer, |buffer| String::from_utf8_lossy(buffer).into_owned())
    }
}

impl OutputSink for MemorySink {
    fn write(&self, _stream: OutputStream, chunk: &[u8]) {
        locked(&self.buffer, |buffer| buffer.extend_from_slice(chunk));
    }
}

/// Confirmation double returning a fixed answer and recording prompts.
#[derive(Clone, Debug)]
pub struct FixedConfirm {
    answer: bool,
    prompts: Shared<Vec<String>>,
}

impl FixedConfirm {
    /// Approves every prompt.
    #[must_use]
    pub fn accept() -> Self {
        Self {
            answer: true,
            prompts: Arc::default(),
        }
    }

    /// Declines every prompt.
    #[must_use]
    pub fn decline() -> Self {
        Self {
            answer: false,
            prompts: Arc::default(),
        }
    }

    /// Prompts shown so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        locked(&self.prompts, |prompts| prompts.clone())
    }
}

impl Confirm for FixedConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool, LifecycleError> {
        locked(&self.prompts, |prompts| prompts.push(prompt.to_owned()));
        Ok(self.answer)
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
