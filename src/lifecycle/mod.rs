//! Instance lifecycle orchestration.
//!
//! [`LifecycleOrchestrator`] ties providers, the project and driver stores,
//! and the remote execution bridge together:
//!
//! - `create` provisions one instance or a numbered batch, records each
//!   instance as soon as the provider reports it, then bootstraps it;
//! - `remove` resolves an instance or batch, confirms, and deletes it,
//!   treating instances the provider no longer knows about as removed;
//! - `list` refreshes the status of every tracked instance and runs the
//!   removal flow for instances that have disappeared;
//! - `setup` and `run` operate on a single existing instance.
//!
//! The project store sits behind an async mutex so each insert or removal
//! and the write that follows happen as one step, even when batch tasks
//! complete together.

mod bootstrap;
mod error;
mod naming;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bulk::{BatchReport, fan_out};
use crate::model::{Instance, STATUS_DELETED, STATUS_FAILED};
use crate::provider::{InstanceRef, InstanceSpec, MetadataItem, ProviderClient, ProviderRegistry};
use crate::remote::{
    DEFAULT_REMOTE_USER, DEFAULT_SSH_PORT, OutputSink, RemoteBridge, RemoteTarget,
    RemoteTransport, RunOptions, SessionOutcome, StdoutSink,
};
use crate::store::{DriverStore, ProjectStore};

pub use bootstrap::{BootstrapScripts, DEFAULT_SERVICE};
pub use error::LifecycleError;
pub use naming::{instance_names, removal_candidates};

use bootstrap::LogSink;

/// Asks the operator to approve a destructive action.
pub trait Confirm: Sync {
    /// Shows `prompt` and returns the answer.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Confirmation`] when no answer can be read.
    fn confirm(&self, prompt: &str) -> Result<bool, LifecycleError>;
}

/// Tunables for the orchestrator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleSettings {
    /// Maximum in-flight batch tasks; `0` runs every task at once.
    pub max_concurrency: usize,
    /// Login user written into instance metadata and used for SSH.
    pub ssh_user: String,
    /// SSH port on instances.
    pub ssh_port: u16,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            ssh_user: DEFAULT_REMOTE_USER.to_owned(),
            ssh_port: DEFAULT_SSH_PORT,
        }
    }
}

/// Parameters for [`LifecycleOrchestrator::create`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateRequest {
    /// Project receiving the instances.
    pub project: String,
    /// Driver used to reach the provider.
    pub driver: String,
    /// Instance name, or batch base name when `count > 1`.
    pub name: String,
    /// Machine type override.
    pub machine_type: Option<String>,
    /// Zone override.
    pub zone: Option<String>,
    /// Number of instances.
    pub count: usize,
}

impl CreateRequest {
    /// Request for a single instance with provider defaults.
    pub fn new(
        project: impl Into<String>,
        driver: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            driver: driver.into(),
            name: name.into(),
            machine_type: None,
            zone: None,
            count: 1,
        }
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Sets the machine type override.
    #[must_use]
    pub fn with_machine_type(mut self, machine_type: Option<String>) -> Self {
        self.machine_type = machine_type;
        self
    }

    /// Sets the zone override.
    #[must_use]
    pub fn with_zone(mut self, zone: Option<String>) -> Self {
        self.zone = zone;
        self
    }
}

/// One row of `instance list` output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus {
    /// Owning project.
    pub project: String,
    /// Instance name.
    pub instance: String,
    /// Operating system label.
    pub os: String,
    /// Internal address.
    pub internal_ip: Option<String>,
    /// External address.
    pub external_ip: Option<String>,
    /// Provider status, [`STATUS_DELETED`] or [`STATUS_FAILED`].
    pub status: String,
}

impl InstanceStatus {
    fn from_instance(project: &str, instance: &Instance, status: &str) -> Self {
        Self {
            project: project.to_owned(),
            instance: instance.name.clone(),
            os: instance.os.clone(),
            internal_ip: instance.network.internal_ip.clone(),
            external_ip: instance.network.external_ip.clone(),
            status: status.to_owned(),
        }
    }
}

struct CreateTask {
    spec: InstanceSpec,
}

struct RemovalTask {
    instance: Instance,
    client: Result<Arc<dyn ProviderClient>, LifecycleError>,
}

struct RefreshTask {
    project: String,
    instance: Instance,
    client: Option<Arc<dyn ProviderClient>>,
}

struct InstanceContext {
    instance: Instance,
    public_key: String,
    identity: Utf8PathBuf,
}

/// Coordinates providers, stores, and remote execution.
pub struct LifecycleOrchestrator<T> {
    registry: ProviderRegistry,
    projects: Mutex<ProjectStore>,
    drivers: DriverStore,
    bridge: RemoteBridge<T>,
    scripts: BootstrapScripts,
    settings: LifecycleSettings,
    sink: Arc<dyn OutputSink>,
}

impl<T: RemoteTransport> LifecycleOrchestrator<T> {
    /// Assembles an orchestrator with default settings. Output of `run` goes
    /// to standard output.
    pub fn new(
        registry: ProviderRegistry,
        projects: ProjectStore,
        drivers: DriverStore,
        bridge: RemoteBridge<T>,
        scripts: BootstrapScripts,
    ) -> Self {
        Self {
            registry,
            projects: Mutex::new(projects),
            drivers,
            bridge,
            scripts,
            settings: LifecycleSettings::default(),
            sink: Arc::new(StdoutSink),
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: LifecycleSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the sink receiving `run` output.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Locks and returns the project store.
    pub async fn projects(&self) -> tokio::sync::MutexGuard<'_, ProjectStore> {
        self.projects.lock().await
    }

    /// Creates and bootstraps the requested instances.
    ///
    /// Each instance is recorded in the project as soon as the provider
    /// reports it. A failed write is reported for that instance and the
    /// provider-side instance is kept. Bootstrap failures are logged only.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for an unknown project or driver,
    /// [`LifecycleError::InvalidRequest`] for an empty name or a zero count,
    /// and [`LifecycleError::AlreadyExists`] when a name is taken. A single
    /// instance request also returns its own failure; batch failures are
    /// recorded in the report.
    pub async fn create(
        &self,
        request: &CreateRequest,
    ) -> Result<BatchReport<Instance>, LifecycleError> {
        let driver = self
            .drivers
            .get(&request.driver)
            .ok_or_else(|| not_found("driver", &request.driver))?;
        let public_key = {
            let store = self.projects.lock().await;
            let project = store
                .get(&request.project)
                .ok_or_else(|| not_found("project", &request.project))?;
            if request.name.trim().is_empty() {
                return Err(LifecycleError::InvalidRequest(
                    "instance name is required".to_owned(),
                ));
            }
            if request.count == 0 {
                return Err(LifecycleError::InvalidRequest(
                    "count must be at least 1".to_owned(),
                ));
            }
            if let Some(taken) = instance_names(&request.name, request.count)
                .into_iter()
                .find(|name| project.instances.contains_key(name))
            {
                return Err(LifecycleError::AlreadyExists {
                    kind: "instance",
                    name: taken,
                });
            }
            project.public_key.clone()
        };

        let client = self
            .registry
            .client_for(driver)
            .map_err(|source| LifecycleError::Provider {
                instance: request.name.clone(),
                source,
            })?;
        let ssh_keys = MetadataItem::ssh_keys(&self.settings.ssh_user, &public_key);
        let mut tasks = Vec::with_capacity(request.count);
        for name in instance_names(&request.name, request.count) {
            let spec = InstanceSpec::builder()
                .name(name.clone())
                .machine_type(request.machine_type.clone())
                .zone(request.zone.clone())
                .metadata(ssh_keys.clone())
                .build()
                .map_err(|source| LifecycleError::Provider {
                    instance: name,
                    source,
                })?;
            tasks.push(CreateTask { spec });
        }

        info!(
            project = %request.project,
            driver = %request.driver,
            count = tasks.len(),
            "creating instances"
        );
        let project = request.project.as_str();
        let provider: &dyn ProviderClient = client.as_ref();
        let results = fan_out(tasks, self.settings.max_concurrency, move |task| {
            self.create_one(project, provider, task)
        })
        .await?;
        Ok(BatchReport::new(results))
    }

    async fn create_one(
        &self,
        project: &str,
        client: &dyn ProviderClient,
        task: CreateTask,
    ) -> Result<Instance, LifecycleError> {
        let started = Instant::now();
        let name = task.spec.name.clone();
        let instance = client
            .create(&task.spec)
            .await
            .map_err(|source| LifecycleError::Provider {
                instance: name.clone(),
                source,
            })?;
        info!(
            project,
            instance = %name,
            elapsed_ms = started.elapsed().as_millis(),
            "instance created"
        );

        let identity = {
            let mut store = self.projects.lock().await;
            if let Err(source) = store.insert_instance(project, instance.clone()) {
                error!(project, instance = %name, error = %source, "instance created but not recorded");
                return Err(LifecycleError::Persist {
                    project: project.to_owned(),
                    source,
                });
            }
            store.key_path(project)
        };

        if let Err(err) = self.bootstrap(&instance, &identity).await {
            warn!(project, instance = %name, error = %err, "bootstrap failed; instance kept");
        }
        Ok(instance)
    }

    /// Removes an instance, or every member of the numbered batch `name`.
    ///
    /// Instances the provider reports as missing are treated as removed.
    /// Returns an empty report when the operator declines.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when the project or instance is
    /// unknown, [`LifecycleError::Confirmation`] when the prompt fails, and
    /// the single instance's own failure for one-item removals.
    pub async fn remove(
        &self,
        project: &str,
        name: &str,
        confirm: &dyn Confirm,
        skip_confirmation: bool,
    ) -> Result<BatchReport<String>, LifecycleError> {
        let candidates: Vec<Instance> = {
            let store = self.projects.lock().await;
            let tracked = store.get(project).ok_or_else(|| not_found("project", project))?;
            removal_candidates(&tracked.instances, name)
                .into_iter()
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return Err(not_found("instance", name));
        }

        if !skip_confirmation {
            let listed = candidates
                .iter()
                .map(|instance| instance.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let prompt = format!("Remove {listed} from project '{project}'?");
            if !confirm.confirm(&prompt)? {
                info!(project, instance = name, "removal cancelled");
                return Ok(BatchReport::default());
            }
        }

        let clients = self.clients_by_driver(&candidates);
        let tasks: Vec<RemovalTask> = candidates
            .into_iter()
            .map(|instance| {
                let client = match clients.get(&instance.driver).cloned().flatten() {
                    Some(shared) => Ok(shared),
                    None => self.client_for(&instance),
                };
                RemovalTask { instance, client }
            })
            .collect();
        let results = fan_out(tasks, self.settings.max_concurrency, move |task| {
            self.remove_one(project, task)
        })
        .await?;
        Ok(BatchReport::new(results))
    }

    async fn remove_one(&self, project: &str, task: RemovalTask) -> Result<String, LifecycleError> {
        let RemovalTask { instance, client } = task;
        let provider = client?;
        let started = Instant::now();
        match provider.remove(&InstanceRef::from_instance(&instance)).await {
            Ok(()) => info!(
                project,
                instance = %instance.name,
                elapsed_ms = started.elapsed().as_millis(),
                "instance removed"
            ),
            Err(err) if err.is_not_found() => warn!(
                project,
                instance = %instance.name,
                "instance already gone at the provider; forgetting it"
            ),
            Err(source) => {
                return Err(LifecycleError::Provider {
                    instance: instance.name,
                    source,
                });
            }
        }

        let mut store = self.projects.lock().await;
        store
            .remove_instance(project, &instance.name)
            .map_err(|source| LifecycleError::Persist {
                project: project.to_owned(),
                source,
            })?;
        Ok(instance.name)
    }

    /// Refreshes the status of every tracked instance.
    ///
    /// Instances the provider no longer knows are shown as
    /// [`STATUS_DELETED`] and go through the removal flow without
    /// confirmation. Other provider errors show [`STATUS_FAILED`]. Instances
    /// whose driver is unavailable keep their recorded status.
    pub async fn list(&self) -> Vec<InstanceStatus> {
        let tasks: Vec<RefreshTask> = {
            let store = self.projects.lock().await;
            let by_driver = self.clients_by_driver(
                store.iter().flat_map(|project| project.instances.values()),
            );
            let clients = &by_driver;
            store
                .iter()
                .flat_map(|project| {
                    project.instances.values().map(move |instance| RefreshTask {
                        project: project.name.clone(),
                        instance: instance.clone(),
                        client: clients.get(&instance.driver).cloned().flatten(),
                    })
                })
                .collect()
        };
        debug!(instances = tasks.len(), "refreshing instance status");

        let outcome = fan_out(tasks, self.settings.max_concurrency, move |task| {
            self.refresh_one(task)
        })
        .await;
        match outcome {
            Ok(results) => results.into_iter().filter_map(|result| result.item).collect(),
            Err(never) => match never {},
        }
    }

    async fn refresh_one(&self, task: RefreshTask) -> Result<InstanceStatus, Infallible> {
        let RefreshTask {
            project,
            instance,
            client,
        } = task;
        let Some(provider) = client else {
            warn!(project = %project, instance = %instance.name, driver = %instance.driver, "driver unavailable; showing recorded status");
            return Ok(InstanceStatus::from_instance(&project, &instance, &instance.status));
        };

        let fetched = provider.get(&InstanceRef::from_instance(&instance)).await;
        match fetched {
            Ok(fresh) => Ok(InstanceStatus::from_instance(&project, &fresh, &fresh.status)),
            Err(err) if err.is_not_found() => {
                info!(project = %project, instance = %instance.name, "instance deleted at the provider; removing it");
                let task = RemovalTask {
                    instance: instance.clone(),
                    client: Ok(provider),
                };
                if let Err(removal) = self.remove_one(&project, task).await {
                    error!(project = %project, instance = %instance.name, error = %removal, "failed to remove deleted instance");
                }
                Ok(InstanceStatus::from_instance(&project, &instance, STATUS_DELETED))
            }
            Err(err) => {
                warn!(project = %project, instance = %instance.name, error = %err, "status refresh failed");
                Ok(InstanceStatus::from_instance(&project, &instance, STATUS_FAILED))
            }
        }
    }

    /// Re-applies the project key to an instance and bootstraps it again.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for unknown projects, instances,
    /// or drivers, [`LifecycleError::Provider`] when the metadata update
    /// fails, and any bootstrap failure.
    pub async fn setup(&self, project: &str, name: &str) -> Result<SessionOutcome, LifecycleError> {
        let context = self.context(project, name).await?;
        let client = self.client_for(&context.instance)?;
        let items = [MetadataItem::ssh_keys(
            &self.settings.ssh_user,
            &context.public_key,
        )];
        client
            .set_metadata(&InstanceRef::from_instance(&context.instance), &items)
            .await
            .map_err(|source| LifecycleError::Provider {
                instance: name.to_owned(),
                source,
            })?;
        info!(project, instance = name, "project key applied");
        self.bootstrap(&context.instance, &context.identity).await
    }

    /// Runs a command, or uploads and runs a local script, on an instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for unknown projects or
    /// instances, [`LifecycleError::MissingAddress`] when the instance has
    /// no external IP, and [`LifecycleError::Remote`] when the run fails.
    pub async fn run(
        &self,
        project: &str,
        name: &str,
        payload: &str,
    ) -> Result<SessionOutcome, LifecycleError> {
        let context = self.context(project, name).await?;
        let target = self.target(&context.instance, &context.identity)?;
        self.bridge
            .run(&target, payload, RunOptions::default(), self.sink.as_ref())
            .await
            .map_err(|source| LifecycleError::Remote {
                instance: name.to_owned(),
                source,
            })
    }

    async fn bootstrap(
        &self,
        instance: &Instance,
        identity: &Utf8Path,
    ) -> Result<SessionOutcome, LifecycleError> {
        let script = self.scripts.resolve(&instance.os)?;
        let target = self.target(instance, identity)?;
        debug!(instance = %instance.name, script = %script, "bootstrapping instance");
        let sink = LogSink::new(instance.name.clone());
        let outcome = self
            .bridge
            .run(&target, script.as_str(), RunOptions::quiet(), &sink)
            .await
            .map_err(|source| LifecycleError::Remote {
                instance: instance.name.clone(),
                source,
            })?;
        info!(
            instance = %instance.name,
            exit_code = ?outcome.exit.code,
            elapsed_ms = outcome.elapsed.as_millis(),
            "bootstrap finished"
        );
        Ok(outcome)
    }

    async fn context(&self, project: &str, name: &str) -> Result<InstanceContext, LifecycleError> {
        let store = self.projects.lock().await;
        let tracked = store.get(project).ok_or_else(|| not_found("project", project))?;
        let instance = tracked
            .instances
            .get(name)
            .ok_or_else(|| not_found("instance", name))?;
        Ok(InstanceContext {
            instance: instance.clone(),
            public_key: tracked.public_key.clone(),
            identity: tracked.private_key.clone(),
        })
    }

    fn target(
        &self,
        instance: &Instance,
        identity: &Utf8Path,
    ) -> Result<RemoteTarget, LifecycleError> {
        let host = instance
            .external_ip()
            .ok_or_else(|| LifecycleError::MissingAddress {
                instance: instance.name.clone(),
            })?;
        Ok(RemoteTarget::new(host, identity.to_path_buf())
            .with_user(self.settings.ssh_user.clone())
            .with_port(self.settings.ssh_port))
    }

    /// Builds one client per distinct driver; unavailable drivers map to `None`.
    fn clients_by_driver<'a>(
        &self,
        instances: impl IntoIterator<Item = &'a Instance>,
    ) -> BTreeMap<String, Option<Arc<dyn ProviderClient>>> {
        let mut clients = BTreeMap::new();
        for instance in instances {
            clients
                .entry(instance.driver.clone())
                .or_insert_with(|| self.client_for(instance).ok());
        }
        clients
    }

    fn client_for(&self, instance: &Instance) -> Result<Arc<dyn ProviderClient>, LifecycleError> {
        let driver = self
            .drivers
            .get(&instance.driver)
            .ok_or_else(|| not_found("driver", &instance.driver))?;
        self.registry
            .client_for(driver)
            .map_err(|source| LifecycleError::Provider {
                instance: instance.name.clone(),
                source,
            })
    }
}

fn not_found(kind: &'static str, name: &str) -> LifecycleError {
    LifecycleError::NotFound {
        kind,
        name: name.to_owned(),
    }
}
