//! Configuration loading via `ortho-config`.
//!
//! [`NimusConfig`] merges defaults, `nimus.toml` / `.nimus.toml` (or the file
//! named by `NIMUS_CONFIG_PATH`), and `NIMUS_*` environment variables, then
//! hands each subsystem its own settings struct.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::lifecycle::LifecycleSettings;
use crate::provider::google::{
    DEFAULT_IMAGE, DEFAULT_MACHINE_TYPE, DEFAULT_ZONE, GoogleSettings,
};
use crate::remote::{DEFAULT_REMOTE_USER, DEFAULT_SSH_PORT, SshSettings};

/// Home directory name created below the user's home when none is configured.
pub const DEFAULT_HOME_DIR: &str = ".nimus";

/// Bootstrap scripts shipped with the crate.
pub const DEFAULT_SCRIPTS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/scripts");

const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Tool-wide settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NIMUS",
    discovery(
        app_name = "nimus",
        env_var = "NIMUS_CONFIG_PATH",
        config_file_name = "nimus.toml",
        dotfile_name = ".nimus.toml",
        project_file_name = "nimus.toml"
    )
)]
pub struct NimusConfig {
    /// Directory holding projects, drivers, and keys. Defaults to
    /// `~/.nimus`.
    pub home: Option<String>,
    /// Zone used when `instance create` does not name one.
    #[ortho_config(default = DEFAULT_ZONE.to_owned())]
    pub default_zone: String,
    /// Machine type used when `instance create` does not name one.
    #[ortho_config(default = DEFAULT_MACHINE_TYPE.to_owned())]
    pub default_machine_type: String,
    /// Boot image for new instances.
    #[ortho_config(default = DEFAULT_IMAGE.to_owned())]
    pub default_image: String,
    /// Delay between provider operation checks, in milliseconds.
    #[ortho_config(default = 1000)]
    pub poll_interval_ms: u64,
    /// Operation checks before a provider call times out.
    #[ortho_config(default = 60)]
    pub max_poll_checks: u32,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// Login user provisioned on instances.
    #[ortho_config(default = DEFAULT_REMOTE_USER.to_owned())]
    pub ssh_user: String,
    /// SSH port on instances.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,
    /// Seconds to wait for a new instance to accept SSH connections.
    #[ortho_config(default = 100)]
    pub connect_timeout_secs: u64,
    /// Maximum concurrent tasks in bulk operations; `0` means unbounded.
    #[ortho_config(default = 0)]
    pub max_concurrency: usize,
    /// Directory containing `<service>/<os>.sh` bootstrap scripts.
    pub scripts_dir: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to nimus.toml",
            self.env_var, self.toml_key
        )
    }
}

impl NimusConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Loads configuration without parsing CLI arguments. Values merge
    /// defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("nimus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is empty
    /// and [`ConfigError::Invalid`] when a numeric value is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in [
            (
                &self.default_zone,
                FieldMetadata::new("default zone", "NIMUS_DEFAULT_ZONE", "default_zone"),
            ),
            (
                &self.default_machine_type,
                FieldMetadata::new(
                    "default machine type",
                    "NIMUS_DEFAULT_MACHINE_TYPE",
                    "default_machine_type",
                ),
            ),
            (
                &self.default_image,
                FieldMetadata::new("boot image", "NIMUS_DEFAULT_IMAGE", "default_image"),
            ),
            (
                &self.ssh_bin,
                FieldMetadata::new("ssh executable", "NIMUS_SSH_BIN", "ssh_bin"),
            ),
            (
                &self.scp_bin,
                FieldMetadata::new("scp executable", "NIMUS_SCP_BIN", "scp_bin"),
            ),
            (
                &self.ssh_keygen_bin,
                FieldMetadata::new(
                    "ssh-keygen executable",
                    "NIMUS_SSH_KEYGEN_BIN",
                    "ssh_keygen_bin",
                ),
            ),
            (
                &self.ssh_user,
                FieldMetadata::new("SSH user", "NIMUS_SSH_USER", "ssh_user"),
            ),
        ] {
            Self::require_field(value, &metadata)?;
        }

        Self::require_positive(
            self.poll_interval_ms,
            &FieldMetadata::new("poll interval", "NIMUS_POLL_INTERVAL_MS", "poll_interval_ms"),
        )?;
        Self::require_positive(
            u64::from(self.max_poll_checks),
            &FieldMetadata::new("poll check limit", "NIMUS_MAX_POLL_CHECKS", "max_poll_checks"),
        )?;
        Self::require_positive(
            u64::from(self.ssh_port),
            &FieldMetadata::new("SSH port", "NIMUS_SSH_PORT", "ssh_port"),
        )?;
        Self::require_positive(
            self.connect_timeout_secs,
            &FieldMetadata::new(
                "connect timeout",
                "NIMUS_CONNECT_TIMEOUT_SECS",
                "connect_timeout_secs",
            ),
        )?;
        Ok(())
    }

    /// Resolves the home directory: the configured value, or `~/.nimus`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no user home directory can be
    /// determined or it is not valid UTF-8.
    pub fn home_dir(&self) -> Result<Utf8PathBuf, ConfigError> {
        if let Some(home) = self.home.as_deref().filter(|value| !value.trim().is_empty()) {
            return Ok(Utf8PathBuf::from(home));
        }
        let user_home = dirs::home_dir().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "cannot determine the user home directory: {}",
                FieldMetadata::new("home", "NIMUS_HOME", "home").hint()
            ))
        })?;
        let utf8_home = Utf8PathBuf::from_path_buf(user_home).map_err(|path| {
            ConfigError::Invalid(format!("home directory is not UTF-8: {}", path.display()))
        })?;
        Ok(utf8_home.join(DEFAULT_HOME_DIR))
    }

    /// Directory searched for bootstrap scripts.
    #[must_use]
    pub fn scripts_root(&self) -> Utf8PathBuf {
        self.scripts_dir
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map_or_else(|| Utf8PathBuf::from(DEFAULT_SCRIPTS_DIR), Utf8PathBuf::from)
    }

    /// Settings for Compute Engine clients.
    #[must_use]
    pub fn google_settings(&self) -> GoogleSettings {
        GoogleSettings {
            zone: self.default_zone.clone(),
            machine_type: self.default_machine_type.clone(),
            image: self.default_image.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_checks: self.max_poll_checks,
        }
    }

    /// Settings for the OpenSSH transport.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            probe_interval: PROBE_INTERVAL,
        }
    }

    /// Settings for the lifecycle orchestrator.
    #[must_use]
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            max_concurrency: self.max_concurrency,
            ssh_user: self.ssh_user.clone(),
            ssh_port: self.ssh_port,
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::test_support::EnvGuard;

    #[fixture]
    fn config() -> NimusConfig {
        NimusConfig {
            home: Some("/srv/nimus".to_owned()),
            default_zone: DEFAULT_ZONE.to_owned(),
            default_machine_type: DEFAULT_MACHINE_TYPE.to_owned(),
            default_image: DEFAULT_IMAGE.to_owned(),
            poll_interval_ms: 1000,
            max_poll_checks: 60,
            ssh_bin: "ssh".to_owned(),
            scp_bin: "scp".to_owned(),
            ssh_keygen_bin: "ssh-keygen".to_owned(),
            ssh_user: "nimus".to_owned(),
            ssh_port: 22,
            connect_timeout_secs: 100,
            max_concurrency: 0,
            scripts_dir: None,
        }
    }

    #[rstest]
    fn defaults_validate(config: NimusConfig) {
        assert_eq!(config.validate(), Ok(()));
    }

    #[rstest]
    #[case::zone(|cfg: &mut NimusConfig| cfg.default_zone.clear(), "NIMUS_DEFAULT_ZONE", "default_zone")]
    #[case::ssh(|cfg: &mut NimusConfig| cfg.ssh_bin = " ".to_owned(), "NIMUS_SSH_BIN", "ssh_bin")]
    #[case::user(|cfg: &mut NimusConfig| cfg.ssh_user.clear(), "NIMUS_SSH_USER", "ssh_user")]
    #[case::poll(|cfg: &mut NimusConfig| cfg.poll_interval_ms = 0, "NIMUS_POLL_INTERVAL_MS", "poll_interval_ms")]
    #[case::checks(|cfg: &mut NimusConfig| cfg.max_poll_checks = 0, "NIMUS_MAX_POLL_CHECKS", "max_poll_checks")]
    #[case::port(|cfg: &mut NimusConfig| cfg.ssh_port = 0, "NIMUS_SSH_PORT", "ssh_port")]
    fn validation_errors_are_actionable(
        mut config: NimusConfig,
        #[case] mutate: fn(&mut NimusConfig),
        #[case] env_var: &str,
        #[case] toml_key: &str,
    ) {
        mutate(&mut config);

        let message = config
            .validate()
            .expect_err("validation should fail")
            .to_string();
        assert!(message.contains(env_var), "should mention {env_var}: {message}");
        assert!(message.contains(toml_key), "should mention {toml_key}: {message}");
        assert!(message.contains("nimus.toml"), "should mention the file: {message}");
    }

    #[rstest]
    fn configured_home_wins(config: NimusConfig) {
        assert_eq!(config.home_dir(), Ok(Utf8PathBuf::from("/srv/nimus")));
    }

    #[rstest]
    fn missing_home_falls_back_to_user_directory(mut config: NimusConfig) {
        config.home = None;
        let home = config
            .home_dir()
            .unwrap_or_else(|err| panic!("home should resolve: {err}"));
        assert!(home.ends_with(DEFAULT_HOME_DIR), "unexpected home: {home}");
    }

    #[rstest]
    fn scripts_default_to_the_shipped_directory(mut config: NimusConfig) {
        assert!(config.scripts_root().join("docker/debian.sh").is_file());
        config.scripts_dir = Some("/opt/scripts".to_owned());
        assert_eq!(config.scripts_root(), Utf8PathBuf::from("/opt/scripts"));
    }

    #[rstest]
    fn subsystem_settings_follow_config(mut config: NimusConfig) {
        config.poll_interval_ms = 250;
        config.connect_timeout_secs = 30;
        config.max_concurrency = 4;

        assert_eq!(config.google_settings().poll_interval, Duration::from_millis(250));
        assert_eq!(config.ssh_settings().connect_timeout, Duration::from_secs(30));
        assert_eq!(config.lifecycle_settings().max_concurrency, 4);
    }

    #[tokio::test]
    async fn environment_overrides_defaults() {
        let _guard = EnvGuard::set_vars(&[
            ("NIMUS_DEFAULT_ZONE", "europe-west1-b"),
            ("NIMUS_SSH_USER", "ops"),
        ])
        .await;

        let loaded = NimusConfig::load_without_cli_args()
            .unwrap_or_else(|err| panic!("config should load: {err}"));

        assert_eq!(loaded.default_zone, "europe-west1-b");
        assert_eq!(loaded.ssh_user, "ops");
        assert_eq!(loaded.default_machine_type, DEFAULT_MACHINE_TYPE);
    }
}
