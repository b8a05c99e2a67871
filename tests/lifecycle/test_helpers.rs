//! Shared fixtures for lifecycle BDD scenarios.

use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use nimus::test_support::{RecordingTransport, ScriptedProvider};
use nimus::{
    BootstrapScripts, Driver, DriverStore, Instance, InstanceStatus, LifecycleOrchestrator,
    Network, Project, ProjectStore, ProviderClient, ProviderRegistry, RemoteBridge, StoreError,
};
use rstest::fixture;
use serde_json::json;
use tempfile::TempDir;
use thiserror::Error;

pub const PROJECT: &str = "demo";
pub const DRIVER: &str = "main";
const PUBLIC_KEY: &str = "ssh-rsa AAAA nimus";

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub home_dir: Arc<TempDir>,
    pub provider: ScriptedProvider,
    pub transport: RecordingTransport,
    pub outcome: Option<LifecycleOutcome>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LifecycleOutcome {
    Batch { failed: usize, total: usize },
    Listed(Vec<InstanceStatus>),
    Failed(String),
}

#[derive(Debug, Error)]
pub enum LifecycleTestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid lifecycle fixture: {0}")]
    Fixture(String),
}

impl LifecycleContext {
    pub fn home(&self) -> Result<Utf8PathBuf, LifecycleTestError> {
        let root = Utf8Path::from_path(self.home_dir.path()).ok_or_else(|| {
            LifecycleTestError::Fixture(String::from("temporary directory is not UTF-8"))
        })?;
        Ok(root.join("home"))
    }

    /// Builds an orchestrator over the on-disk stores and shared doubles.
    pub fn orchestrator(
        &self,
    ) -> Result<LifecycleOrchestrator<RecordingTransport>, LifecycleTestError> {
        let home = self.home()?;
        let provider = self.provider.clone();
        let mut registry = ProviderRegistry::new();
        registry.register("fake", move |_driver: &Driver| {
            Ok(Arc::new(provider.clone()) as Arc<dyn ProviderClient>)
        });

        Ok(LifecycleOrchestrator::new(
            registry,
            ProjectStore::load(&home)?,
            DriverStore::load(&home)?,
            RemoteBridge::new(self.transport.clone(), home.clone()),
            BootstrapScripts::new(home.join("scripts")),
        ))
    }

    /// Records instances in the project and teaches the provider about them.
    pub fn track(&self, names: &[String]) -> Result<(), LifecycleTestError> {
        let mut store = ProjectStore::load(&self.home()?)?;
        for (offset, name) in names.iter().enumerate() {
            let instance = tracked(name, offset + 1);
            self.provider.insert(instance.clone());
            store.insert_instance(PROJECT, instance)?;
        }
        Ok(())
    }

    /// Instance names currently persisted for the project.
    pub fn persisted_names(&self) -> Result<Vec<String>, LifecycleTestError> {
        let store = ProjectStore::load(&self.home()?)?;
        Ok(store
            .get(PROJECT)
            .map(|project| project.instances.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Splits a comma separated list of names.
pub fn parse_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

fn tracked(name: &str, ordinal: usize) -> Instance {
    Instance {
        name: name.to_owned(),
        machine_type: "n1-standard-1".to_owned(),
        zone: "us-central1-a".to_owned(),
        driver: DRIVER.to_owned(),
        status: "RUNNING".to_owned(),
        os: "debian-12".to_owned(),
        network: Network {
            internal_ip: Some(format!("10.0.1.{ordinal}")),
            external_ip: Some(format!("198.51.100.{ordinal}")),
        },
    }
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    build_lifecycle_context()
        .unwrap_or_else(|err| panic!("lifecycle context fixture should initialise: {err}"))
}

fn build_lifecycle_context() -> Result<LifecycleContext, LifecycleTestError> {
    let tmp = TempDir::new()
        .map_err(|err| LifecycleTestError::Fixture(format!("tempdir: {err}")))?;
    let context = LifecycleContext {
        home_dir: Arc::new(tmp),
        provider: ScriptedProvider::new(),
        transport: RecordingTransport::new(),
        outcome: None,
    };
    let home = context.home()?;

    let ssh = home.join("ssh");
    let scripts = home.join("scripts/docker");
    for dir in [&ssh, &scripts] {
        fs::create_dir_all(dir)
            .map_err(|err| LifecycleTestError::Fixture(format!("create {dir}: {err}")))?;
    }
    let files = [
        (ssh.join(PROJECT), String::from("PRIVATE")),
        (ssh.join("demo.pub"), format!("{PUBLIC_KEY}\n")),
        (scripts.join("debian.sh"), String::from("apt-get install -y docker.io\n")),
    ];
    for (path, contents) in files {
        fs::write(&path, contents)
            .map_err(|err| LifecycleTestError::Fixture(format!("write {path}: {err}")))?;
    }

    let mut projects = ProjectStore::load(&home)?;
    projects.add(Project::new(PROJECT, PUBLIC_KEY, ssh.join(PROJECT)))?;
    let mut drivers = DriverStore::load(&home)?;
    drivers.add(Driver {
        provider: "fake".to_owned(),
        name: DRIVER.to_owned(),
        credentials: json!({}),
    })?;

    Ok(context)
}
