//! Core library for the Nimus instance lifecycle tool.
//!
//! Nimus provisions cloud instances through pluggable providers, records them
//! in per-project JSON stores, bootstraps each new machine over SSH, and runs
//! ad-hoc commands or scripts on them. Bulk operations fan out across many
//! instances and report each outcome separately.

pub mod bulk;
pub mod catalog;
pub mod config;
pub mod lifecycle;
pub mod model;
pub mod process;
pub mod provider;
pub mod remote;
pub mod store;
pub mod test_support;

pub use bulk::{BatchReport, BulkResult, TaskMetrics, fan_out};
pub use catalog::{Catalog, CatalogError, DriverSummary, KeyGenError, KeyGenerator, ProjectSummary};
pub use config::{ConfigError, NimusConfig};
pub use lifecycle::{
    BootstrapScripts, Confirm, CreateRequest, InstanceStatus, LifecycleError,
    LifecycleOrchestrator, LifecycleSettings,
};
pub use model::{Driver, Instance, Network, Project};
pub use process::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use provider::{
    InstanceRef, InstanceSpec, MetadataItem, OperationPoller, ProviderClient, ProviderError,
    ProviderRegistry,
};
pub use remote::{
    OutputSink, Payload, RemoteBridge, RemoteError, RemoteTarget, RemoteTransport, RunOptions,
    SessionOutcome, SessionState, SshSettings, SshTransport, StdoutSink,
};
pub use store::{DriverStore, ProjectStore, StoreError};
